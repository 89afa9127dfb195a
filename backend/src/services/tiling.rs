//! Skymap tile decomposition.
//!
//! Every NUNIQ pixel of a localization becomes one range tile at depth 29.
//! Tiles are ranked by the probability they hold, most probable first, and
//! each carries the cumulative probability of itself and every tile ranked
//! above it. A point lies in the `p` credible region iff its tile's
//! `cumprob <= p`.

use std::sync::Arc;

use anyhow::Context;

use crate::api::{LocalizationId, LocalizationTile, Skymap};
use crate::db::{FullRepository, LocalizationRepository};
use crate::models::healpix;
use crate::models::skymap::SkymapResult;
use crate::services::job_tracker::JobContext;

/// Turn a skymap into range tiles with cumulative probabilities.
///
/// Tiles come back in decreasing probability order; ties keep the input
/// order. Fails on invalid NUNIQ values, negative or non-finite densities,
/// and overlapping pixels.
pub fn decompose(localization_id: LocalizationId, skymap: &Skymap) -> SkymapResult<Vec<LocalizationTile>> {
    let ranges = skymap.validate()?;

    let mut ranked: Vec<(LocalizationTile, f64)> = ranges
        .into_iter()
        .zip(&skymap.probdensity)
        .map(|((lo, hi), &probdensity)| {
            let tile = LocalizationTile {
                localization_id,
                nested_lo: lo,
                nested_hi: hi,
                probdensity,
                cumprob: 0.0,
            };
            (tile, probdensity * healpix::range_area(lo, hi))
        })
        .collect();

    // `sort_by` is stable.
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut cumprob = 0.0;
    Ok(ranked
        .into_iter()
        .map(|(mut tile, prob)| {
            cumprob += prob;
            tile.cumprob = cumprob;
            tile
        })
        .collect())
}

/// Background job: load a localization, decompose it and store its tiles.
pub async fn run_tiling_job(
    repo: Arc<dyn FullRepository>,
    ctx: JobContext,
    localization_id: LocalizationId,
) -> anyhow::Result<Option<serde_json::Value>> {
    ctx.info(format!("Loading localization {localization_id}"));
    let localization = repo
        .get_localization(localization_id)
        .await?
        .with_context(|| format!("localization {localization_id} not found"))?;

    let skymap = Skymap::new(
        localization.localization_name.clone(),
        localization.uniq,
        localization.probdensity,
    )?;
    ctx.info(format!("Decomposing {} pixels", skymap.len()));

    let tiles = tokio::task::spawn_blocking(move || decompose(localization_id, &skymap))
        .await
        .context("tiling task panicked")??;
    let total = tiles.last().map(|t| t.cumprob).unwrap_or(0.0);
    if (total - 1.0).abs() > 1e-6 {
        ctx.warn(format!("Total probability is {total:.6}, not 1"));
    }

    let stored = repo.replace_tiles(localization_id, tiles).await?;
    ctx.success(format!("Stored {stored} tiles"));
    log::info!(
        "Stored {} tiles for localization {} ({})",
        stored,
        localization_id,
        localization.localization_name
    );

    Ok(Some(serde_json::json!({
        "localization_id": localization_id,
        "tiles": stored,
        "total_probability": total,
    })))
}
