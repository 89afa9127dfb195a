//! Derived products of a localization: a flat raster and credible contours.
//!
//! Both are computed once per localization by a background job and cached
//! on the localization row.

use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value};

use crate::api::{LocalizationId, Skymap};
use crate::db::{FullRepository, LocalizationRepository};
use crate::models::healpix::{self, SR_TO_DEG2};
use crate::models::skymap::SkymapResult;
use crate::services::job_tracker::JobContext;

/// Finest order of the cached `flat_2d` raster.
pub const FLAT_2D_MAX_ORDER: u8 = 6;

/// Order of the pixels outlining the credible regions.
pub const CONTOUR_ORDER: u8 = 5;

/// Credible levels, in percent, for which contours are drawn.
pub const CONTOUR_LEVELS: [u32; 2] = [50, 90];

/// Order at which a map is rasterized: its own finest order, capped.
pub fn flat_order(skymap: &Skymap) -> SkymapResult<u8> {
    let mut finest = 0;
    for &uniq in &skymap.uniq {
        finest = finest.max(healpix::uniq_to_pixel(uniq)?.0);
    }
    Ok(finest.min(FLAT_2D_MAX_ORDER))
}

/// Rasterize a map to probability per pixel at [`flat_order`].
pub fn flat_2d(skymap: &Skymap) -> SkymapResult<Vec<f64>> {
    skymap.flatten(flat_order(skymap)?)
}

/// GeoJSON feature collection with the most probable position and one
/// multi-polygon per credible level.
///
/// The region for level `p` is the smallest set of [`CONTOUR_ORDER`] pixels,
/// taken in decreasing probability, whose summed probability reaches `p`.
pub fn contour(skymap: &Skymap) -> SkymapResult<Value> {
    let prob = skymap.flatten(CONTOUR_ORDER)?;

    let mut ranked: Vec<usize> = (0..prob.len()).collect();
    ranked.sort_by(|&a, &b| prob[b].total_cmp(&prob[a]));

    let (center_ra, center_dec) = healpix::pixel_center(CONTOUR_ORDER, ranked[0] as u64)?;
    let mut features = vec![json!({
        "type": "Feature",
        "geometry": { "type": "Point", "coordinates": [center_ra, center_dec] },
        "properties": { "credible_level": 0 },
    })];

    let pixel_area_deg2 = healpix::pixel_area(CONTOUR_ORDER) * SR_TO_DEG2;
    for level in CONTOUR_LEVELS {
        let target = level as f64 / 100.0;
        let mut covered = 0.0;
        let mut polygons = Vec::new();
        for &ipix in &ranked {
            if covered >= target {
                break;
            }
            covered += prob[ipix];
            let corners = healpix::pixel_corners(CONTOUR_ORDER, ipix as u64)?;
            let mut ring: Vec<[f64; 2]> = corners.iter().map(|&(ra, dec)| [ra, dec]).collect();
            ring.push(ring[0]);
            polygons.push(vec![ring]);
        }
        features.push(json!({
            "type": "Feature",
            "geometry": { "type": "MultiPolygon", "coordinates": polygons },
            "properties": {
                "credible_level": level,
                "area": polygons.len() as f64 * pixel_area_deg2,
            },
        }));
    }

    Ok(json!({ "type": "FeatureCollection", "features": features }))
}

/// Background job: compute and cache `flat_2d` and `contour`.
pub async fn run_contour_job(
    repo: Arc<dyn FullRepository>,
    ctx: JobContext,
    localization_id: LocalizationId,
) -> anyhow::Result<Option<Value>> {
    let localization = repo
        .get_localization(localization_id)
        .await?
        .with_context(|| format!("localization {localization_id} not found"))?;
    let skymap = Skymap::new(
        localization.localization_name,
        localization.uniq,
        localization.probdensity,
    )?;

    ctx.info("Rasterizing localization");
    let (flat, contour) = tokio::task::spawn_blocking(move || -> SkymapResult<(Vec<f64>, Value)> {
        Ok((flat_2d(&skymap)?, contour(&skymap)?))
    })
    .await
    .context("contour task panicked")??;

    let pixels = flat.len();
    repo.set_localization_derived(localization_id, flat, contour).await?;
    ctx.success(format!("Cached {pixels}-pixel raster and contours"));

    Ok(Some(json!({ "localization_id": localization_id, "flat_2d_pixels": pixels })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_2d_sums_to_one() {
        let skymap = Skymap::from_cone(120.0, -30.0, 3.0).unwrap();
        let flat = flat_2d(&skymap).unwrap();
        assert_eq!(flat.len() as u64, healpix::npix(FLAT_2D_MAX_ORDER));
        let total: f64 = flat.iter().sum();
        assert!((total - 1.0).abs() < 1e-6, "total = {total}");
    }

    #[test]
    fn test_flat_order_follows_coarse_maps() {
        let uniq: Vec<i64> = (0..12).map(|p| healpix::pixel_to_uniq(0, p).unwrap()).collect();
        let skymap = Skymap::new("coarse", uniq, vec![1.0; 12]).unwrap();
        assert_eq!(flat_order(&skymap).unwrap(), 0);
        assert_eq!(flat_2d(&skymap).unwrap().len(), 12);
    }

    #[test]
    fn test_contour_levels_nest() {
        let skymap = Skymap::from_cone(200.0, 45.0, 5.0).unwrap();
        let value = contour(&skymap).unwrap();
        let features = value["features"].as_array().unwrap();
        assert_eq!(features.len(), 3);

        let center = &features[0]["geometry"]["coordinates"];
        let (ra, dec) = (center[0].as_f64().unwrap(), center[1].as_f64().unwrap());
        assert!(healpix::angular_distance(ra, dec, 200.0, 45.0) < 3.0);

        let area50 = features[1]["properties"]["area"].as_f64().unwrap();
        let area90 = features[2]["properties"]["area"].as_f64().unwrap();
        assert!(area50 > 0.0);
        assert!(area90 > area50);

        let ring = &features[1]["geometry"]["coordinates"][0][0];
        assert_eq!(ring.as_array().unwrap().len(), 5);
        assert_eq!(ring[0], ring[4]);
    }
}
