//! Cross-match queries against stored localization tiles.
//!
//! Every query is reduced to inclusive depth-29 ranges and matched against
//! the tile table with overlap semantics, so query pixels and tiles may sit
//! at different orders.

use serde::{Deserialize, Serialize};

use crate::api::{LocalizationId, LocalizationTile};
use crate::db::{LocalizationRepository, RepositoryError};
use crate::models::healpix::{self, HealpixError, SphericalPolygon, SR_TO_DEG2};

/// Order at which field footprints are pixelized unless asked otherwise.
pub const DEFAULT_FIELD_ORDER: u8 = 10;
/// Finest order a field footprint may be pixelized at. Pixel counts grow
/// fourfold per order.
pub const MAX_FIELD_ORDER: u8 = 12;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Healpix(#[from] HealpixError),
    #[error("invalid query: {0}")]
    InvalidInput(String),
    #[error("tiles of localization {0} have not been computed yet")]
    TilesPending(LocalizationId),
}

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointMatch {
    pub ra: f64,
    pub dec: f64,
    pub probdensity: f64,
    pub cumprob: f64,
    /// Whether the point lies inside the requested credible region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_credible_region: Option<bool>,
}

/// Convex footprint of one instrument field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<i64>,
    /// `[ra, dec]` vertices in degrees.
    pub polygon: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldsMatch {
    /// Localization probability covered by the union of the fields.
    pub probability: f64,
    /// Area of the union of the fields, in square degrees.
    pub area: f64,
    pub order: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredibleRegion {
    pub level: f64,
    /// Area in square degrees.
    pub area: f64,
    pub tiles: usize,
}

fn check_level(level: f64) -> QueryResult<()> {
    if !(0.0..=1.0).contains(&level) {
        return Err(QueryError::InvalidInput(format!(
            "credible level {level} is not within [0, 1]"
        )));
    }
    Ok(())
}

async fn require_tiles<R>(repo: &R, id: LocalizationId) -> QueryResult<()>
where
    R: LocalizationRepository + ?Sized,
{
    if repo.count_tiles(id).await? == 0 {
        return Err(QueryError::TilesPending(id));
    }
    Ok(())
}

/// Probability of the portion of `tiles` inside `ranges`.
///
/// `ranges` must be disjoint; merge them first with
/// [`healpix::merge_ranges`].
pub fn overlap_probability(tiles: &[LocalizationTile], ranges: &[(i64, i64)]) -> f64 {
    tiles
        .iter()
        .map(|tile| {
            ranges
                .iter()
                .filter_map(|&(lo, hi)| tile.overlap(lo, hi))
                .map(|(lo, hi)| tile.probdensity * healpix::range_area(lo, hi))
                .sum::<f64>()
        })
        .sum()
}

/// Tile under a sky position.
///
/// Returns `None` when the localization does not cover the position.
pub async fn point_query<R>(
    repo: &R,
    id: LocalizationId,
    ra: f64,
    dec: f64,
    credible_level: Option<f64>,
) -> QueryResult<Option<PointMatch>>
where
    R: LocalizationRepository + ?Sized,
{
    if let Some(level) = credible_level {
        check_level(level)?;
    }
    let index = healpix::ang_to_pixel(healpix::MAX_ORDER, ra, dec)? as i64;
    require_tiles(repo, id).await?;

    Ok(repo.tile_containing(id, index).await?.map(|tile| PointMatch {
        ra,
        dec,
        probdensity: tile.probdensity,
        cumprob: tile.cumprob,
        in_credible_region: credible_level.map(|level| tile.cumprob <= level),
    }))
}

/// Probability and area covered by a set of fields.
///
/// Overlapping fields are counted once.
pub async fn fields_query<R>(
    repo: &R,
    id: LocalizationId,
    fields: &[Field],
    order: Option<u8>,
) -> QueryResult<FieldsMatch>
where
    R: LocalizationRepository + ?Sized,
{
    let order = order.unwrap_or(DEFAULT_FIELD_ORDER);
    if order > MAX_FIELD_ORDER {
        return Err(QueryError::InvalidInput(format!(
            "field order {order} is above the maximum of {MAX_FIELD_ORDER}"
        )));
    }
    if fields.is_empty() {
        return Err(QueryError::InvalidInput("no fields given".into()));
    }

    let mut ranges = Vec::new();
    for field in fields {
        let polygon = SphericalPolygon::new(&field.polygon)?;
        let pixels = healpix::polygon_pixels(&polygon, order)?;
        ranges.extend(healpix::pixels_to_ranges(order, &pixels)?);
    }
    let ranges = healpix::merge_ranges(&mut ranges);

    require_tiles(repo, id).await?;
    let tiles = repo.tiles_overlapping(id, &ranges).await?;
    let area: f64 = ranges.iter().map(|&(lo, hi)| healpix::range_area(lo, hi)).sum();

    Ok(FieldsMatch {
        probability: overlap_probability(&tiles, &ranges),
        area: area * SR_TO_DEG2,
        order,
    })
}

/// Area of the `level` credible region.
pub async fn credible_region<R>(repo: &R, id: LocalizationId, level: f64) -> QueryResult<CredibleRegion>
where
    R: LocalizationRepository + ?Sized,
{
    check_level(level)?;
    require_tiles(repo, id).await?;
    let tiles = repo.tiles_within_level(id, level).await?;
    let area: f64 = tiles.iter().map(LocalizationTile::area).sum();
    Ok(CredibleRegion {
        level,
        area: area * SR_TO_DEG2,
        tiles: tiles.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(lo: i64, hi: i64, probdensity: f64) -> LocalizationTile {
        LocalizationTile {
            localization_id: LocalizationId(1),
            nested_lo: lo,
            nested_hi: hi,
            probdensity,
            cumprob: 0.0,
        }
    }

    #[test]
    fn test_overlap_counts_partial_tiles() {
        let tiles = [tile(0, 99, 2.0), tile(100, 199, 1.0)];
        let full = overlap_probability(&tiles, &[(0, 199)]);
        let expected = (2.0 * 100.0 + 100.0) * healpix::PIXEL_AREA;
        assert!((full - expected).abs() < 1e-30);

        let partial = overlap_probability(&tiles, &[(50, 149)]);
        let expected = (2.0 * 50.0 + 50.0) * healpix::PIXEL_AREA;
        assert!((partial - expected).abs() < 1e-30);

        assert_eq!(overlap_probability(&tiles, &[(200, 300)]), 0.0);
    }

    #[test]
    fn test_overlap_sums_disjoint_ranges_within_one_tile() {
        let tiles = [tile(0, 999, 1.0)];
        let p = overlap_probability(&tiles, &[(0, 9), (100, 109)]);
        assert!((p - 20.0 * healpix::PIXEL_AREA).abs() < 1e-30);
    }

    #[test]
    fn test_level_bounds() {
        assert!(check_level(0.0).is_ok());
        assert!(check_level(1.0).is_ok());
        assert!(check_level(1.5).is_err());
        assert!(check_level(f64::NAN).is_err());
    }
}
