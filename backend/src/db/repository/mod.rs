//! Repository trait definitions for database operations.
//!
//! Storage is split across focused traits:
//!
//! - [`event`]: GCN events, notices, tags and properties
//! - [`localization`]: localizations and their sky tiles
//! - [`followup`]: follow-up requests and facility transactions
//!
//! # Convenience Trait Bound
//!
//! Functions needing every capability take a [`FullRepository`]:
//!
//! ```ignore
//! async fn ingest<R: FullRepository + ?Sized>(repo: &R) -> RepositoryResult<()> {
//!     let (event, created) = repo.get_or_create_event(dateobs, user).await?;
//!     repo.get_or_create_localization(new_localization).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod event;
pub mod followup;
pub mod localization;

pub use error::{ErrorContext, RepositoryError, RepositoryResult};

pub use event::EventRepository;
pub use followup::FollowupRepository;
pub use localization::{sort_disjoint_tiles, LocalizationRepository};

/// Composite trait bound for a complete repository implementation.
pub trait FullRepository: EventRepository + LocalizationRepository + FollowupRepository {}

impl<T> FullRepository for T where T: EventRepository + LocalizationRepository + FollowupRepository {}
