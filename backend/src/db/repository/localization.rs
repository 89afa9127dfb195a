//! Repository trait for localizations and their tiles.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::{ErrorContext, RepositoryError, RepositoryResult};
use crate::api::{Localization, LocalizationId, LocalizationTile, NewLocalization};

/// Sort tiles by `nested_lo` and reject any pair of overlapping ranges.
pub fn sort_disjoint_tiles(id: LocalizationId, tiles: &mut [LocalizationTile]) -> RepositoryResult<()> {
    tiles.sort_by_key(|t| t.nested_lo);
    for pair in tiles.windows(2) {
        if pair[1].nested_lo <= pair[0].nested_hi {
            return Err(RepositoryError::validation_with_context(
                format!(
                    "tiles [{}, {}] and [{}, {}] overlap",
                    pair[0].nested_lo, pair[0].nested_hi, pair[1].nested_lo, pair[1].nested_hi
                ),
                ErrorContext::new("replace_tiles")
                    .with_entity("localization")
                    .with_entity_id(id),
            ));
        }
    }
    Ok(())
}

/// Storage for localizations and the range-indexed tile table.
///
/// Tile ranges are inclusive depth-29 nested index ranges. All range queries
/// use overlap semantics (`tile.lo <= hi && lo <= tile.hi`), so query ranges
/// at any order match tiles at any other order.
#[async_trait]
pub trait LocalizationRepository: Send + Sync {
    /// Fetch the localization with this `(dateobs, localization_name)`,
    /// creating it from `new` if absent. The event must exist.
    ///
    /// Returns the localization and whether this call created it.
    async fn get_or_create_localization(
        &self,
        new: NewLocalization,
    ) -> RepositoryResult<(Localization, bool)>;

    async fn get_localization(&self, id: LocalizationId) -> RepositoryResult<Option<Localization>>;

    async fn find_localization(
        &self,
        dateobs: DateTime<Utc>,
        localization_name: &str,
    ) -> RepositoryResult<Option<Localization>>;

    /// Delete a localization and its tiles.
    async fn delete_localization(&self, id: LocalizationId) -> RepositoryResult<bool>;

    /// Cache the derived raster and contour on the localization row.
    async fn set_localization_derived(
        &self,
        id: LocalizationId,
        flat_2d: Vec<f64>,
        contour: serde_json::Value,
    ) -> RepositoryResult<()>;

    /// Replace all tiles of a localization in one write.
    ///
    /// Returns the number of tiles stored.
    async fn replace_tiles(
        &self,
        id: LocalizationId,
        tiles: Vec<LocalizationTile>,
    ) -> RepositoryResult<usize>;

    async fn count_tiles(&self, id: LocalizationId) -> RepositoryResult<usize>;

    /// The tile containing a depth-29 nested index.
    async fn tile_containing(
        &self,
        id: LocalizationId,
        index: i64,
    ) -> RepositoryResult<Option<LocalizationTile>>;

    /// Tiles overlapping any of the given inclusive ranges.
    async fn tiles_overlapping(
        &self,
        id: LocalizationId,
        ranges: &[(i64, i64)],
    ) -> RepositoryResult<Vec<LocalizationTile>>;

    /// Tiles with `cumprob <= level`.
    async fn tiles_within_level(
        &self,
        id: LocalizationId,
        level: f64,
    ) -> RepositoryResult<Vec<LocalizationTile>>;
}
