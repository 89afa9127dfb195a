//! GCN event ingest.
//!
//! A notice is validated and parsed before anything is written. The
//! skymap, if the notice points at one, is loaded before the first write as
//! well, so a failed download leaves no partial event behind. A new
//! localization gets a tiling job and a contour job; a localization that
//! already exists is left alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{
    GcnEvent, LocalizationId, LocalizationSummary, NewGcnNotice, NewLocalization, Principal,
    SkymapSource,
};
use crate::db::{notice_checksum, EventRepository, FullRepository, LocalizationRepository, RepositoryError};
use crate::models::gcn::parse_dateobs;
use crate::models::skymap::SkymapError;
use crate::models::voevent::{VoEvent, VoEventError};
use crate::services::contour::run_contour_job;
use crate::services::job_tracker::{JobKind, JobQueue};
use crate::services::skymap_fetch::SkymapLoader;
use crate::services::tiling::run_tiling_job;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    VoEvent(#[from] VoEventError),
    #[error(transparent)]
    Skymap(#[from] SkymapError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("invalid event: {0}")]
    InvalidInput(String),
    #[error("Insufficient permissions: {0}")]
    Forbidden(String),
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Event submitted as JSON instead of a VOEvent notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubmission {
    pub dateobs: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, f64>,
    #[serde(default)]
    pub skymap: Option<SkymapSource>,
}

/// What an ingest call did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    #[serde(with = "crate::models::gcn::dateobs_format")]
    pub dateobs: DateTime<Utc>,
    pub event_created: bool,
    /// `false` when an identical notice was already stored.
    pub notice_stored: bool,
    pub localization: Option<LocalizationSummary>,
    pub localization_created: bool,
    /// Tiling and contour job ids for a new localization.
    pub job_ids: Vec<String>,
}

impl IngestOutcome {
    pub fn message(&self) -> &'static str {
        match (&self.localization, self.localization_created) {
            (Some(_), false) => "Localization already exists",
            (Some(_), true) => "Localization queued for tiling",
            (None, _) => "Event stored without localization",
        }
    }
}

/// Everything parsed out of a submission, ready to be written.
struct Prepared {
    dateobs: DateTime<Utc>,
    tags: Vec<String>,
    properties: BTreeMap<String, f64>,
    notice: Option<NewGcnNotice>,
    skymap: Option<SkymapSource>,
}

#[derive(Clone)]
pub struct GcnIngestor {
    repo: Arc<dyn FullRepository>,
    jobs: JobQueue,
    loader: SkymapLoader,
}

impl GcnIngestor {
    pub fn new(repo: Arc<dyn FullRepository>, jobs: JobQueue, loader: SkymapLoader) -> Self {
        Self { repo, jobs, loader }
    }

    /// Ingest a VOEvent XML notice.
    pub async fn ingest_voevent(&self, xml: &str, principal: &Principal) -> IngestResult<IngestOutcome> {
        let voevent = VoEvent::parse(xml)?;
        let dateobs = voevent.dateobs()?;
        log::info!("Ingesting {} (dateobs {})", voevent.ivorn, dateobs);

        let notice = NewGcnNotice {
            dateobs,
            ivorn: voevent.ivorn.clone(),
            notice_type: voevent.notice_type(),
            stream: voevent.stream(),
            date: voevent.notice_date(),
            content: xml.to_string(),
            checksum: notice_checksum(xml),
            sent_by_id: principal.id,
        };

        self.store(
            Prepared {
                dateobs,
                tags: voevent.tags(),
                properties: voevent.properties(),
                notice: Some(notice),
                skymap: voevent.skymap_source(),
            },
            principal,
        )
        .await
    }

    /// Ingest an event described directly in JSON.
    pub async fn ingest_submission(
        &self,
        submission: EventSubmission,
        principal: &Principal,
    ) -> IngestResult<IngestOutcome> {
        let dateobs = parse_dateobs(&submission.dateobs)
            .ok_or_else(|| IngestError::InvalidInput(format!("invalid dateobs {:?}", submission.dateobs)))?;
        if let Some((name, value)) = submission.properties.iter().find(|(_, v)| !v.is_finite()) {
            return Err(IngestError::InvalidInput(format!("property {name} is {value}")));
        }

        self.store(
            Prepared {
                dateobs,
                tags: submission.tags,
                properties: submission.properties,
                notice: None,
                skymap: submission.skymap,
            },
            principal,
        )
        .await
    }

    async fn store(&self, prepared: Prepared, principal: &Principal) -> IngestResult<IngestOutcome> {
        let Prepared {
            dateobs,
            tags,
            properties,
            notice,
            skymap,
        } = prepared;

        if let Some(event) = self.repo.get_event(dateobs).await? {
            check_can_modify(&event, principal)?;
        }

        // Load the skymap up front unless this localization is already stored.
        let mut existing = None;
        let mut loaded = None;
        if let Some(source) = &skymap {
            let name = source.localization_name();
            existing = self.repo.find_localization(dateobs, &name).await?;
            if existing.is_none() {
                loaded = Some(self.loader.load(source).await?);
            }
        }

        let (event, event_created) = self.repo.get_or_create_event(dateobs, principal.id).await?;
        if !event_created {
            check_can_modify(&event, principal)?;
        }

        if !tags.is_empty() {
            self.repo.add_tags(dateobs, &tags, principal.id).await?;
        }
        let notice_stored = match notice {
            Some(notice) => self.repo.add_notice(notice).await?.1,
            None => false,
        };
        if !properties.is_empty() {
            self.repo.add_properties(dateobs, properties, principal.id).await?;
        }

        let mut outcome = IngestOutcome {
            dateobs,
            event_created,
            notice_stored,
            localization: existing.as_ref().map(LocalizationSummary::from),
            localization_created: false,
            job_ids: Vec::new(),
        };

        if let Some(map) = loaded {
            let (localization, created) = self
                .repo
                .get_or_create_localization(NewLocalization {
                    dateobs,
                    localization_name: map.localization_name,
                    uniq: map.uniq,
                    probdensity: map.probdensity,
                    sent_by_id: principal.id,
                })
                .await?;
            outcome.localization = Some(LocalizationSummary::from(&localization));
            outcome.localization_created = created;
            if created {
                outcome.job_ids = self.enqueue_derivations(localization.id);
            } else {
                log::info!(
                    "Localization {} of {} already exists",
                    localization.localization_name,
                    dateobs
                );
            }
        }

        Ok(outcome)
    }

    /// Queue the tiling and contour jobs of a localization.
    pub fn enqueue_derivations(&self, id: LocalizationId) -> Vec<String> {
        let contour_repo = self.repo.clone();
        vec![
            self.enqueue_tiling(id),
            self.jobs.enqueue(JobKind::Contour, move |ctx| run_contour_job(contour_repo, ctx, id)),
        ]
    }

    /// Queue a (re)tiling of a localization.
    pub fn enqueue_tiling(&self, id: LocalizationId) -> String {
        let repo = self.repo.clone();
        self.jobs.enqueue(JobKind::Tiling, move |ctx| run_tiling_job(repo, ctx, id))
    }
}

fn check_can_modify(event: &GcnEvent, principal: &Principal) -> IngestResult<()> {
    if principal.can_modify(event.sent_by_id) {
        Ok(())
    } else {
        Err(IngestError::Forbidden(
            "GCN event can only be updated by original poster".into(),
        ))
    }
}
