//! Service layer for business logic and orchestration.
//!
//! Services sit between the HTTP handlers and the repository: ingest of
//! GCN notices, background tiling and contour jobs, cross-match queries and
//! the follow-up request lifecycle.

pub mod contour;
pub mod crossmatch;
pub mod followup;
pub mod gcn_ingest;
pub mod job_tracker;
pub mod skymap_fetch;
pub mod tiling;

pub use crossmatch::{QueryError, QueryResult};
pub use followup::{DeleteOutcome, FollowupError, FollowupService, FollowupSubmission};
pub use gcn_ingest::{EventSubmission, GcnIngestor, IngestError, IngestOutcome};
pub use job_tracker::{
    Job, JobContext, JobKind, JobQueue, JobStatus, JobTracker, LogEntry, LogLevel, LogProgress,
};
pub use skymap_fetch::SkymapLoader;
pub use tiling::decompose;
