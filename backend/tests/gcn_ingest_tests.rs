//! End-to-end ingest against the in-memory repository: notice parsing,
//! skymap loading, background tiling and cascade deletes.

use std::collections::BTreeMap;
use std::sync::Arc;

use skyportal_rust::api::{EventFilter, LocalizationId, Principal, PropertyFilter, SkymapSource, UserId};
use skyportal_rust::config::SkymapSettings;
use skyportal_rust::db::{EventRepository, FullRepository, LocalRepository, LocalizationRepository};
use skyportal_rust::models::healpix;
use skyportal_rust::services::{
    EventSubmission, GcnIngestor, IngestError, JobQueue, JobStatus, SkymapLoader,
};

const FERMI_GND_POS: &str = include_str!("data/GRB180116_Fermi_GBM_Gnd_Pos.xml");

fn principal(id: i64, is_admin: bool) -> Principal {
    Principal {
        id: UserId(id),
        username: format!("user{id}"),
        is_admin,
    }
}

fn setup() -> (Arc<LocalRepository>, JobQueue, GcnIngestor) {
    let repo = Arc::new(LocalRepository::new());
    let jobs = JobQueue::new();
    let loader = SkymapLoader::new(&SkymapSettings::default()).unwrap();
    let ingestor = GcnIngestor::new(repo.clone() as Arc<dyn FullRepository>, jobs.clone(), loader);
    (repo, jobs, ingestor)
}

async fn wait_all(jobs: &JobQueue, ids: &[String]) {
    for id in ids {
        let job = jobs.wait_for(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed, "job {id} logs: {:?}", job.logs);
    }
}

fn full_sky() -> (i64, i64) {
    (0, (healpix::npix(healpix::MAX_ORDER) - 1) as i64)
}

#[tokio::test]
async fn test_voevent_ingest_tiles_localization() {
    let (repo, jobs, ingestor) = setup();
    let user = principal(1, false);

    let outcome = ingestor.ingest_voevent(FERMI_GND_POS, &user).await.unwrap();
    assert!(outcome.event_created);
    assert!(outcome.notice_stored);
    assert!(outcome.localization_created);
    assert_eq!(outcome.job_ids.len(), 2);
    assert_eq!(outcome.message(), "Localization queued for tiling");
    wait_all(&jobs, &outcome.job_ids).await;

    let detail = repo.get_event_detail(outcome.dateobs).await.unwrap().unwrap();
    assert_eq!(detail.tags, vec!["Fermi", "GRB"]);
    assert_eq!(detail.notices.len(), 1);
    assert_eq!(detail.localizations.len(), 1);

    let localization = outcome.localization.unwrap();
    assert_eq!(localization.localization_name, "214.74000_28.14000_11.19000");

    let stored = repo.get_localization(localization.id).await.unwrap().unwrap();
    assert!(stored.flat_2d.is_some());
    assert!(stored.contour.is_some());

    let mut tiles = repo.tiles_overlapping(localization.id, &[full_sky()]).await.unwrap();
    assert_eq!(tiles.len(), repo.count_tiles(localization.id).await.unwrap());
    tiles.sort_by(|a, b| a.cumprob.total_cmp(&b.cumprob));
    assert!((tiles.last().unwrap().cumprob - 1.0).abs() < 1e-6);

    // The tiles partition the sphere.
    tiles.sort_by_key(|t| t.nested_lo);
    assert_eq!(tiles[0].nested_lo, 0);
    for pair in tiles.windows(2) {
        assert_eq!(pair[0].nested_hi + 1, pair[1].nested_lo);
    }
    assert_eq!(tiles.last().unwrap().nested_hi, full_sky().1);
}

#[tokio::test]
async fn test_reingest_does_not_duplicate_localization() {
    let (repo, jobs, ingestor) = setup();
    let user = principal(1, false);

    let first = ingestor.ingest_voevent(FERMI_GND_POS, &user).await.unwrap();
    wait_all(&jobs, &first.job_ids).await;
    let tiles = repo.total_tiles();

    let second = ingestor.ingest_voevent(FERMI_GND_POS, &user).await.unwrap();
    assert!(!second.event_created);
    assert!(!second.notice_stored);
    assert!(!second.localization_created);
    assert!(second.job_ids.is_empty());
    assert_eq!(second.message(), "Localization already exists");
    assert_eq!(second.localization.unwrap().id, first.localization.unwrap().id);

    let detail = repo.get_event_detail(first.dateobs).await.unwrap().unwrap();
    assert_eq!(detail.notices.len(), 1);
    assert_eq!(detail.localizations.len(), 1);
    assert_eq!(repo.total_tiles(), tiles);
}

#[tokio::test]
async fn test_only_owner_or_admin_may_update_event() {
    let (_repo, jobs, ingestor) = setup();
    let outcome = ingestor.ingest_voevent(FERMI_GND_POS, &principal(1, false)).await.unwrap();
    wait_all(&jobs, &outcome.job_ids).await;

    let err = ingestor
        .ingest_voevent(FERMI_GND_POS, &principal(2, false))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Forbidden(_)));

    let admin = ingestor.ingest_voevent(FERMI_GND_POS, &principal(3, true)).await.unwrap();
    assert!(!admin.event_created);
}

#[tokio::test]
async fn test_delete_event_cascades_to_tiles() {
    let (repo, jobs, ingestor) = setup();
    let outcome = ingestor.ingest_voevent(FERMI_GND_POS, &principal(1, false)).await.unwrap();
    wait_all(&jobs, &outcome.job_ids).await;
    assert!(repo.total_tiles() > 0);

    assert!(repo.delete_event(outcome.dateobs).await.unwrap());
    assert!(repo.get_event(outcome.dateobs).await.unwrap().is_none());
    let id = outcome.localization.unwrap().id;
    assert!(repo.get_localization(id).await.unwrap().is_none());
    assert_eq!(repo.total_tiles(), 0);
    assert!(!repo.delete_event(outcome.dateobs).await.unwrap());
}

#[tokio::test]
async fn test_json_submission_with_properties() {
    let (repo, jobs, ingestor) = setup();
    let user = principal(1, false);

    let submission = EventSubmission {
        dateobs: "2019-04-25T08:18:05.017553".into(),
        tags: vec!["GW".into(), "BNS".into()],
        properties: BTreeMap::from([("BNS".to_string(), 0.9), ("FAR".to_string(), 1e-8)]),
        skymap: Some(SkymapSource::Cone {
            ra: 10.0,
            dec: -20.0,
            error: 5.0,
        }),
    };
    let outcome = ingestor.ingest_submission(submission, &user).await.unwrap();
    assert!(outcome.event_created);
    assert!(!outcome.notice_stored);
    wait_all(&jobs, &outcome.job_ids).await;

    let keep = EventFilter {
        tag_keep: vec!["BNS".into()],
        properties: PropertyFilter::parse_list("BNS: 0.5: gt").unwrap(),
        ..Default::default()
    };
    assert_eq!(repo.list_events(&keep).await.unwrap().len(), 1);

    let drop = EventFilter {
        properties: PropertyFilter::parse_list("BNS: 0.5: lt").unwrap(),
        ..Default::default()
    };
    assert!(repo.list_events(&drop).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_event_without_skymap() {
    let (repo, _jobs, ingestor) = setup();
    let submission = EventSubmission {
        dateobs: "2020-01-01T00:00:00".into(),
        tags: vec!["Test".into()],
        properties: BTreeMap::new(),
        skymap: None,
    };
    let outcome = ingestor.ingest_submission(submission, &principal(1, false)).await.unwrap();
    assert!(outcome.localization.is_none());
    assert_eq!(outcome.message(), "Event stored without localization");
    assert_eq!(repo.total_tiles(), 0);
}

#[tokio::test]
async fn test_failed_skymap_download_writes_nothing() {
    let (repo, _jobs, ingestor) = setup();
    let submission = EventSubmission {
        dateobs: "2021-05-05T05:05:05".into(),
        tags: vec!["GW".into()],
        properties: BTreeMap::new(),
        skymap: Some(SkymapSource::Url {
            url: "http://127.0.0.1:9/bayestar.fits.gz".into(),
            localization_name: None,
        }),
    };
    let err = ingestor
        .ingest_submission(submission, &principal(1, false))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Skymap(_)));

    let dateobs = skyportal_rust::models::gcn::parse_dateobs("2021-05-05T05:05:05").unwrap();
    assert!(repo.get_event(dateobs).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_input_is_rejected() {
    let (_repo, _jobs, ingestor) = setup();
    let user = principal(1, false);

    assert!(matches!(
        ingestor.ingest_voevent("<VOEvent", &user).await,
        Err(IngestError::VoEvent(_))
    ));

    let submission = EventSubmission {
        dateobs: "yesterday".into(),
        tags: vec![],
        properties: BTreeMap::new(),
        skymap: None,
    };
    assert!(matches!(
        ingestor.ingest_submission(submission, &user).await,
        Err(IngestError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_retile_replaces_tiles() {
    let (repo, jobs, ingestor) = setup();
    let outcome = ingestor.ingest_voevent(FERMI_GND_POS, &principal(1, false)).await.unwrap();
    wait_all(&jobs, &outcome.job_ids).await;
    let id: LocalizationId = outcome.localization.unwrap().id;
    let before = repo.count_tiles(id).await.unwrap();

    let job_id = ingestor.enqueue_tiling(id);
    wait_all(&jobs, &[job_id.clone()]).await;
    assert_eq!(repo.count_tiles(id).await.unwrap(), before);

    let job = jobs.tracker().get_job(&job_id).unwrap();
    assert_eq!(job.result.unwrap()["tiles"], before);
}

fn moc_submission(dateobs: &str, uniq: Vec<i64>, probdensity: Vec<f64>) -> EventSubmission {
    EventSubmission {
        dateobs: dateobs.into(),
        tags: vec!["GW".into()],
        properties: BTreeMap::new(),
        skymap: Some(SkymapSource::Moc {
            localization_name: "submitted.multiorder.fits".into(),
            uniq,
            probdensity,
        }),
    }
}

#[tokio::test]
async fn test_submitted_moc_is_normalized_before_tiling() {
    let (repo, jobs, ingestor) = setup();
    let uniq: Vec<i64> = (4..16).collect();
    let submission = moc_submission("2022-02-02T02:02:02", uniq, vec![0.1; 12]);

    let outcome = ingestor.ingest_submission(submission, &principal(1, false)).await.unwrap();
    wait_all(&jobs, &outcome.job_ids).await;
    let id = outcome.localization.unwrap().id;

    let stored = repo.get_localization(id).await.unwrap().unwrap();
    let total: f64 = stored
        .uniq
        .iter()
        .zip(&stored.probdensity)
        .map(|(&u, &p)| {
            let (lo, hi) = healpix::uniq_to_range(u).unwrap();
            p * healpix::range_area(lo, hi)
        })
        .sum();
    assert!((total - 1.0).abs() < 1e-9);

    let tiles = repo.tiles_overlapping(id, &[full_sky()]).await.unwrap();
    let last = tiles.iter().map(|t| t.cumprob).fold(0.0, f64::max);
    assert!((last - 1.0).abs() < 1e-6, "final cumprob {last}");
}

#[tokio::test]
async fn test_invalid_moc_writes_nothing() {
    let (repo, _jobs, ingestor) = setup();
    let user = principal(1, false);

    // uniq 4 is base pixel 0; uniq 16 is its first child.
    let overlapping = moc_submission("2022-03-03T03:03:03", vec![4, 16], vec![0.1, 0.1]);
    let err = ingestor.ingest_submission(overlapping, &user).await.unwrap_err();
    assert!(matches!(err, IngestError::Skymap(_)));

    let negative = moc_submission("2022-03-03T03:03:03", vec![4, 5], vec![0.1, -1.0]);
    let err = ingestor.ingest_submission(negative, &user).await.unwrap_err();
    assert!(matches!(err, IngestError::Skymap(_)));

    let dateobs = skyportal_rust::models::gcn::parse_dateobs("2022-03-03T03:03:03").unwrap();
    assert!(repo.get_event(dateobs).await.unwrap().is_none());
    assert_eq!(repo.total_tiles(), 0);
}
