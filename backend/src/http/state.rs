//! Application state for the HTTP server.

use std::collections::HashMap;
use std::sync::Arc;

use crate::api::Principal;
use crate::config::AppConfig;
use crate::db::FullRepository;
use crate::facility::FacilityRegistry;
use crate::services::{FollowupService, GcnIngestor, JobQueue, SkymapLoader};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Repository instance for database operations
    pub repository: Arc<dyn FullRepository>,
    /// Background tiling and contour jobs
    pub jobs: JobQueue,
    pub ingestor: GcnIngestor,
    pub followups: FollowupService,
    /// API token -> caller
    pub tokens: Arc<HashMap<String, Principal>>,
    pub body_limit_bytes: usize,
}

impl AppState {
    /// Wire services to the repository according to `config`.
    pub fn new(repository: Arc<dyn FullRepository>, config: &AppConfig) -> anyhow::Result<Self> {
        let jobs = JobQueue::new();
        let loader = SkymapLoader::new(&config.skymaps)?;
        let facilities = Arc::new(FacilityRegistry::from_config(&config.facilities)?);
        let tokens = config
            .tokens
            .iter()
            .map(|t| (t.token.clone(), t.principal()))
            .collect();

        Ok(Self {
            ingestor: GcnIngestor::new(repository.clone(), jobs.clone(), loader),
            followups: FollowupService::new(repository.clone(), facilities),
            repository,
            jobs,
            tokens: Arc::new(tokens),
            body_limit_bytes: config.server.body_limit_mb * 1024 * 1024,
        })
    }

    pub fn principal_for(&self, token: &str) -> Option<&Principal> {
        self.tokens.get(token)
    }
}
