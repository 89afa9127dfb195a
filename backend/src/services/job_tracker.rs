//! Background jobs for tiling and contour computation.
//!
//! Ingest returns as soon as a localization is stored; its tiles and
//! contours are computed by jobs spawned on [`JobQueue`]. Each job keeps a
//! progress log in the [`JobTracker`] that clients poll through
//! `/api/jobs/{id}` or follow over SSE.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Finished jobs kept for polling; the oldest are dropped beyond this.
const MAX_FINISHED_JOBS: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    fn now(level: LogLevel, message: String) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        self != JobStatus::Running
    }
}

/// What a job computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Decompose a localization into range tiles.
    Tiling,
    /// Rasterize a localization and compute its credible contours.
    Contour,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub logs: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// e.g. `{"tiles": 1234}` for a tiling job
    pub result: Option<serde_json::Value>,
}

impl Job {
    fn new(kind: JobKind) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            kind,
            status: JobStatus::Running,
            logs: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            result: None,
        }
    }

    /// The first outcome wins; returns false when the job had already ended.
    fn finish(&mut self, status: JobStatus, result: Option<serde_json::Value>) -> bool {
        if self.status.is_finished() {
            return false;
        }
        self.status = status;
        self.result = result;
        self.completed_at = Some(Utc::now());
        true
    }
}

/// Log entries appended after a given offset, with the job state at the
/// time they were read.
#[derive(Debug, Clone)]
pub struct LogProgress {
    pub entries: Vec<LogEntry>,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
}

/// In-memory job registry shared by the queue and the HTTP layer.
#[derive(Clone, Default)]
pub struct JobTracker {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
    /// Finished job ids, oldest first.
    finished: Arc<Mutex<VecDeque<String>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_job(&self, kind: JobKind) -> String {
        let job = Job::new(kind);
        let job_id = job.job_id.clone();
        self.jobs.write().insert(job_id.clone(), job);
        job_id
    }

    fn update<T>(&self, job_id: &str, f: impl FnOnce(&mut Job) -> T) -> Option<T> {
        self.jobs.write().get_mut(job_id).map(f)
    }

    pub fn log(&self, job_id: &str, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::now(level, message.into());
        self.update(job_id, |job| job.logs.push(entry));
    }

    pub fn complete_job(&self, job_id: &str, result: Option<serde_json::Value>) {
        let finished = self.update(job_id, |job| job.finish(JobStatus::Completed, result));
        if finished == Some(true) {
            self.retire(job_id);
        }
    }

    /// Marks the job failed and logs `error_message` as its last entry.
    pub fn fail_job(&self, job_id: &str, error_message: impl Into<String>) {
        let entry = LogEntry::now(LogLevel::Error, error_message.into());
        let finished = self.update(job_id, |job| {
            job.logs.push(entry);
            job.finish(JobStatus::Failed, None)
        });
        if finished == Some(true) {
            self.retire(job_id);
        }
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().get(job_id).cloned()
    }

    /// Entries from index `offset` on; `None` for an unknown job.
    pub fn logs_since(&self, job_id: &str, offset: usize) -> Option<LogProgress> {
        let jobs = self.jobs.read();
        let job = jobs.get(job_id)?;
        Some(LogProgress {
            entries: job.logs.iter().skip(offset).cloned().collect(),
            status: job.status,
            result: job.result.clone(),
        })
    }

    fn retire(&self, job_id: &str) {
        let mut finished = self.finished.lock();
        finished.push_back(job_id.to_string());
        while finished.len() > MAX_FINISHED_JOBS {
            if let Some(oldest) = finished.pop_front() {
                self.jobs.write().remove(&oldest);
            }
        }
    }
}

/// Handle passed to a running job for progress logging.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    tracker: JobTracker,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn info(&self, message: impl Into<String>) {
        self.tracker.log(&self.job_id, LogLevel::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.tracker.log(&self.job_id, LogLevel::Success, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.tracker.log(&self.job_id, LogLevel::Warning, message);
    }
}

/// Spawns jobs on the tokio runtime and records how they end.
///
/// Jobs cannot be cancelled. `Err` marks the job failed with the error
/// chain as its last log line; `Ok(result)` completes it with `result`.
#[derive(Clone, Default)]
pub struct JobQueue {
    tracker: JobTracker,
    handles: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Spawns `task` and returns its job id at once. Needs a tokio runtime.
    pub fn enqueue<F, Fut>(&self, kind: JobKind, task: F) -> String
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<serde_json::Value>>> + Send + 'static,
    {
        let job_id = self.tracker.create_job(kind);
        let ctx = JobContext {
            job_id: job_id.clone(),
            tracker: self.tracker.clone(),
        };

        let handle = tokio::spawn(async move {
            let tracker = ctx.tracker.clone();
            let id = ctx.job_id.clone();
            match task(ctx).await {
                Ok(result) => {
                    log::debug!("{kind:?} job {id} completed");
                    tracker.complete_job(&id, result);
                }
                Err(e) => {
                    log::error!("{kind:?} job {id} failed: {e:#}");
                    tracker.fail_job(&id, format!("{e:#}"));
                }
            }
        });

        let mut handles = self.handles.lock();
        handles.retain(|_, h| !h.is_finished());
        handles.insert(job_id.clone(), handle);
        job_id
    }

    /// Waits for a job to end and returns its final record.
    ///
    /// Returns at once for jobs that already ended or are unknown. A job
    /// that panicked is recorded as failed.
    pub async fn wait_for(&self, job_id: &str) -> Option<Job> {
        let handle = self.handles.lock().remove(job_id);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("job {job_id} panicked: {e}");
                self.tracker.fail_job(job_id, format!("job panicked: {e}"));
            }
        }
        self.tracker.get_job(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_outcome_wins() {
        let tracker = JobTracker::new();
        let id = tracker.create_job(JobKind::Tiling);
        tracker.log(&id, LogLevel::Info, "working");
        tracker.complete_job(&id, Some(serde_json::json!({"tiles": 3})));
        tracker.fail_job(&id, "late failure");

        let job = tracker.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(job.result, Some(serde_json::json!({"tiles": 3})));
        assert_eq!(job.logs.len(), 2);
    }

    #[test]
    fn test_logs_since_offset() {
        let tracker = JobTracker::new();
        let id = tracker.create_job(JobKind::Contour);
        tracker.log(&id, LogLevel::Info, "one");
        tracker.log(&id, LogLevel::Warning, "two");

        let progress = tracker.logs_since(&id, 1).unwrap();
        assert_eq!(progress.entries.len(), 1);
        assert_eq!(progress.entries[0].message, "two");
        assert_eq!(progress.status, JobStatus::Running);
        assert!(tracker.logs_since(&id, 5).unwrap().entries.is_empty());
        assert!(tracker.logs_since("missing", 0).is_none());
    }

    #[test]
    fn test_finished_jobs_are_evicted_oldest_first() {
        let tracker = JobTracker::new();
        let ids: Vec<String> = (0..MAX_FINISHED_JOBS + 3)
            .map(|_| {
                let id = tracker.create_job(JobKind::Tiling);
                tracker.complete_job(&id, None);
                id
            })
            .collect();
        let running = tracker.create_job(JobKind::Tiling);

        assert!(tracker.get_job(&ids[0]).is_none());
        assert!(tracker.get_job(ids.last().unwrap()).is_some());
        assert!(tracker.get_job(&running).is_some());
    }

    #[tokio::test]
    async fn test_queue_records_success_and_failure() {
        let queue = JobQueue::new();

        let ok = queue.enqueue(JobKind::Contour, |ctx| async move {
            ctx.info("step");
            Ok(Some(serde_json::json!(1)))
        });
        let failed = queue.enqueue(JobKind::Tiling, |_ctx| async move {
            Err(anyhow::anyhow!("boom"))
        });

        let ok = queue.wait_for(&ok).await.unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        assert_eq!(ok.logs[0].message, "step");

        let failed = queue.wait_for(&failed).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        let last = failed.logs.last().unwrap();
        assert_eq!(last.level, LogLevel::Error);
        assert_eq!(last.message, "boom");

        assert!(queue.wait_for("missing").await.is_none());
    }
}
