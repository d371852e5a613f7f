//! End-to-end tests driving the engine against a temporary SQLite index:
//! association, merge, split, trump weights, deletion, and archiving.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

use quakedex::archive::{ArchivePolicy, ProductArchivePolicy};
use quakedex::config::{Config, DbConfig, StorageConfig};
use quakedex::db;
use quakedex::dispatch::{ChangeKind, IndexerEvent, IndexerListener};
use quakedex::index::ProductIndex;
use quakedex::indexer::Indexer;
use quakedex::migrate;
use quakedex::models::{EventSummary, Product, ProductId, ProductStatus};
use quakedex::query::{ProductIndexQuery, ResultType, SearchQuery, SearchRequest, SearchResult};
use quakedex::storage::FileProductStorage;

const T0: i64 = 1_700_000_000_000;

fn test_config(dir: &TempDir) -> Config {
    Config {
        db: DbConfig {
            path: dir.path().join("index.db"),
        },
        association: Default::default(),
        archive: Default::default(),
        dispatch: Default::default(),
        storage: StorageConfig {
            directory: dir.path().join("payloads"),
        },
    }
}

async fn build_indexer(cfg: &Config) -> Result<Indexer> {
    let pool = db::connect(cfg).await?;
    migrate::run_migrations(&pool).await?;
    let index = ProductIndex::new(pool);
    let storage = Arc::new(FileProductStorage::new(&cfg.storage.directory));
    Ok(Indexer::new(index, storage, cfg, Vec::new()))
}

async fn setup() -> (TempDir, Indexer) {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let indexer = build_indexer(&cfg).await.unwrap();
    (dir, indexer)
}

/// An origin product reporting (source, code) at the given location,
/// versioned by `update_millis`, with origin time `event_millis`.
fn origin(
    source: &str,
    code: &str,
    update_millis: i64,
    event_millis: i64,
    lat: f64,
    lon: f64,
) -> Product {
    let mut properties = BTreeMap::new();
    properties.insert("eventsource".to_string(), source.to_string());
    properties.insert("eventsourcecode".to_string(), code.to_string());
    properties.insert("eventtime".to_string(), event_millis.to_string());
    properties.insert("latitude".to_string(), lat.to_string());
    properties.insert("longitude".to_string(), lon.to_string());
    properties.insert("magnitude".to_string(), "4.0".to_string());
    Product {
        id: ProductId::new(
            source,
            "origin",
            code,
            Utc.timestamp_millis_opt(update_millis).unwrap(),
        ),
        status: ProductStatus::Update,
        tracker_url: None,
        version: None,
        properties,
        links: BTreeMap::new(),
        payload: Some(format!("origin {}{}", source, code).into_bytes()),
    }
}

async fn event_summaries(indexer: &Indexer) -> Vec<EventSummary> {
    let response = indexer
        .search(&SearchRequest {
            queries: vec![SearchQuery::EventsSummary(ProductIndexQuery::new())],
        })
        .await
        .unwrap();
    match response.results.into_iter().next().unwrap() {
        SearchResult::EventsSummary(summaries) => summaries,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn first_origin_creates_event() {
    let (_dir, indexer) = setup().await;
    let result = indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await
        .unwrap();
    assert_eq!(result.kinds(), vec![ChangeKind::EventAdded]);

    let events = event_summaries(&indexer).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_id().as_deref(), Some("usaaa1"));
    assert_eq!(events[0].latitude, Some(35.0));
}

#[tokio::test]
async fn newer_version_supersedes_older() {
    let (_dir, indexer) = setup().await;
    indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await
        .unwrap();

    let mut v2 = origin("us", "aaa1", T0 + 60_000, T0, 35.1, -118.1);
    v2.properties
        .insert("magnitude".to_string(), "4.5".to_string());
    let result = indexer.on_product(&v2).await.unwrap();
    assert_eq!(result.kinds(), vec![ChangeKind::EventUpdated]);

    let events = event_summaries(&indexer).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].magnitude, Some(4.5));
    assert_eq!(events[0].latitude, Some(35.1));
}

#[tokio::test]
async fn nearby_origin_joins_existing_event() {
    let (_dir, indexer) = setup().await;
    indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await
        .unwrap();
    let result = indexer
        .on_product(&origin("ak", "bbb2", T0 + 1_000, T0 + 5_000, 35.05, -118.05))
        .await
        .unwrap();
    assert_eq!(result.kinds(), vec![ChangeKind::EventUpdated]);

    let events = event_summaries(&indexer).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_codes.len(), 2);
}

#[tokio::test]
async fn distant_origin_creates_second_event() {
    let (_dir, indexer) = setup().await;
    indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await
        .unwrap();
    // ~480 km away, outside the 100 km window
    let result = indexer
        .on_product(&origin("ak", "bbb2", T0 + 1_000, T0, 37.0, -122.0))
        .await
        .unwrap();
    assert_eq!(result.kinds(), vec![ChangeKind::EventAdded]);
    assert_eq!(event_summaries(&indexer).await.len(), 2);
}

#[tokio::test]
async fn origin_outside_time_window_creates_second_event() {
    let (_dir, indexer) = setup().await;
    indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await
        .unwrap();
    // same place, 100 s later
    let result = indexer
        .on_product(&origin("ak", "bbb2", T0 + 1_000, T0 + 100_000, 35.0, -118.0))
        .await
        .unwrap();
    assert_eq!(result.kinds(), vec![ChangeKind::EventAdded]);
    assert_eq!(event_summaries(&indexer).await.len(), 2);
}

#[tokio::test]
async fn redundant_resubmission_only_updates() {
    let (_dir, indexer) = setup().await;
    indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await
        .unwrap();
    let result = indexer
        .on_product(&origin("us", "aaa1", T0 + 60_000, T0, 35.0, -118.0))
        .await
        .unwrap();
    assert_eq!(result.kinds(), vec![ChangeKind::EventUpdated]);
    assert_eq!(event_summaries(&indexer).await.len(), 1);
}

#[tokio::test]
async fn duplicate_version_is_rejected() {
    let (_dir, indexer) = setup().await;
    let product = origin("us", "aaa1", T0, T0, 35.0, -118.0);
    indexer.on_product(&product).await.unwrap();
    let err = indexer.on_product(&product).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<quakedex::error::IndexerError>(),
        Some(quakedex::error::IndexerError::AlreadyInStorage(_))
    ));
}

#[tokio::test]
async fn associate_product_forces_merge() {
    let (_dir, indexer) = setup().await;
    indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await
        .unwrap();
    indexer
        .on_product(&origin("ak", "bbb2", T0 + 1_000, T0, 50.0, 10.0))
        .await
        .unwrap();
    assert_eq!(event_summaries(&indexer).await.len(), 2);

    let mut properties = BTreeMap::new();
    properties.insert("eventsource".to_string(), "us".to_string());
    properties.insert("eventsourcecode".to_string(), "aaa1".to_string());
    properties.insert("othereventsource".to_string(), "ak".to_string());
    properties.insert("othereventsourcecode".to_string(), "bbb2".to_string());
    let associate = Product {
        id: ProductId::new(
            "admin",
            "associate",
            "assoc1",
            Utc.timestamp_millis_opt(T0 + 2_000).unwrap(),
        ),
        status: ProductStatus::Update,
        tracker_url: None,
        version: None,
        properties,
        links: BTreeMap::new(),
        payload: None,
    };

    let result = indexer.on_product(&associate).await.unwrap();
    assert_eq!(
        result.kinds(),
        vec![ChangeKind::EventMerged, ChangeKind::EventUpdated]
    );

    let events = event_summaries(&indexer).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_codes.len(), 2);
}

#[tokio::test]
async fn associate_naming_unknown_event_still_indexes() {
    let (_dir, indexer) = setup().await;
    indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await
        .unwrap();

    let mut properties = BTreeMap::new();
    properties.insert("eventsource".to_string(), "us".to_string());
    properties.insert("eventsourcecode".to_string(), "aaa1".to_string());
    properties.insert("othereventsource".to_string(), "zz".to_string());
    properties.insert("othereventsourcecode".to_string(), "nothere".to_string());
    let associate = Product {
        id: ProductId::new(
            "admin",
            "associate",
            "assoc1",
            Utc.timestamp_millis_opt(T0 + 2_000).unwrap(),
        ),
        status: ProductStatus::Update,
        tracker_url: None,
        version: None,
        properties,
        links: BTreeMap::new(),
        payload: None,
    };

    // the conflict is logged; the product still lands in its event
    let result = indexer.on_product(&associate).await.unwrap();
    assert_eq!(result.kinds(), vec![ChangeKind::EventUpdated]);
}

#[tokio::test]
async fn moved_origin_splits_event_into_components() {
    let (_dir, indexer) = setup().await;
    // a chain: A near B, B near C, A far from C — one event transitively
    indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await
        .unwrap();
    indexer
        .on_product(&origin("ak", "bbb2", T0 + 1_000, T0, 35.7, -118.0))
        .await
        .unwrap();
    indexer
        .on_product(&origin("nc", "ccc3", T0 + 2_000, T0, 36.4, -118.0))
        .await
        .unwrap();
    assert_eq!(event_summaries(&indexer).await.len(), 1);

    // the linking origin moves away: three mutually distant sub-events
    let result = indexer
        .on_product(&origin("ak", "bbb2", T0 + 60_000, T0, 0.0, -118.0))
        .await
        .unwrap();
    assert_eq!(
        result.kinds(),
        vec![
            ChangeKind::EventUpdated,
            ChangeKind::EventSplit,
            ChangeKind::EventSplit,
        ]
    );

    let events = event_summaries(&indexer).await;
    assert_eq!(events.len(), 3);
    // each component carries exactly its own code
    for event in &events {
        assert_eq!(event.event_codes.len(), 1);
    }
}

#[tokio::test]
async fn persistent_trump_grants_and_delete_restores_weight() {
    let (_dir, indexer) = setup().await;
    indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await
        .unwrap();
    indexer
        .on_product(&origin("ak", "bbb2", T0 + 1_000, T0, 35.02, -118.02))
        .await
        .unwrap();
    // newest origin wins the tie: the event is known as ak's
    assert_eq!(
        event_summaries(&indexer).await[0].event_id().as_deref(),
        Some("akbbb2")
    );

    let mut properties = BTreeMap::new();
    properties.insert("eventsource".to_string(), "us".to_string());
    properties.insert("eventsourcecode".to_string(), "aaa1".to_string());
    properties.insert("trump-source".to_string(), "us".to_string());
    properties.insert("trump-code".to_string(), "aaa1".to_string());
    let trump = Product {
        id: ProductId::new(
            "admin",
            "trump-origin",
            "t1",
            Utc.timestamp_millis_opt(T0 + 2_000).unwrap(),
        ),
        status: ProductStatus::Update,
        tracker_url: None,
        version: None,
        properties: properties.clone(),
        links: BTreeMap::new(),
        payload: None,
    };
    indexer.on_product(&trump).await.unwrap();
    // the trumped origin is now preferred despite being older
    assert_eq!(
        event_summaries(&indexer).await[0].event_id().as_deref(),
        Some("usaaa1")
    );

    // an unrelated update must not disturb the trump
    indexer
        .on_product(&origin("ak", "bbb2", T0 + 3_000, T0, 35.02, -118.02))
        .await
        .unwrap();
    assert_eq!(
        event_summaries(&indexer).await[0].event_id().as_deref(),
        Some("usaaa1")
    );

    // deleting the trump restores the derived preference exactly
    let deleted = Product {
        id: ProductId::new(
            "admin",
            "trump-origin",
            "t1",
            Utc.timestamp_millis_opt(T0 + 4_000).unwrap(),
        ),
        status: ProductStatus::Delete,
        tracker_url: None,
        version: None,
        properties,
        links: BTreeMap::new(),
        payload: None,
    };
    indexer.on_product(&deleted).await.unwrap();
    assert_eq!(
        event_summaries(&indexer).await[0].event_id().as_deref(),
        Some("akbbb2")
    );
}

#[tokio::test]
async fn deleting_last_origin_deletes_and_update_revives() {
    let (_dir, indexer) = setup().await;
    indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await
        .unwrap();

    let mut delete = origin("us", "aaa1", T0 + 60_000, T0, 35.0, -118.0);
    delete.status = ProductStatus::Delete;
    let result = indexer.on_product(&delete).await.unwrap();
    assert_eq!(result.kinds(), vec![ChangeKind::EventDeleted]);
    assert!(event_summaries(&indexer).await[0].deleted);

    let result = indexer
        .on_product(&origin("us", "aaa1", T0 + 120_000, T0, 35.0, -118.0))
        .await
        .unwrap();
    assert_eq!(result.kinds(), vec![ChangeKind::EventUpdated]);
    assert!(!event_summaries(&indexer).await[0].deleted);
}

#[tokio::test]
async fn product_without_origin_stays_unassociated() {
    let (_dir, indexer) = setup().await;
    let report = Product {
        id: ProductId::new(
            "us",
            "shakemap",
            "xyz9",
            Utc.timestamp_millis_opt(T0).unwrap(),
        ),
        status: ProductStatus::Update,
        tracker_url: None,
        version: None,
        properties: BTreeMap::new(),
        links: BTreeMap::new(),
        payload: None,
    };
    let result = indexer.on_product(&report).await.unwrap();
    assert_eq!(result.kinds(), vec![ChangeKind::ProductAdded]);
    assert!(event_summaries(&indexer).await.is_empty());
}

#[tokio::test]
async fn new_event_adopts_matching_unassociated_product() {
    let (_dir, indexer) = setup().await;
    // a shakemap naming an event code arrives before any origin
    let mut properties = BTreeMap::new();
    properties.insert("eventsource".to_string(), "us".to_string());
    properties.insert("eventsourcecode".to_string(), "aaa1".to_string());
    let report = Product {
        id: ProductId::new(
            "us",
            "shakemap",
            "aaa1",
            Utc.timestamp_millis_opt(T0).unwrap(),
        ),
        status: ProductStatus::Update,
        tracker_url: None,
        version: None,
        properties,
        links: BTreeMap::new(),
        payload: None,
    };
    let result = indexer.on_product(&report).await.unwrap();
    assert_eq!(result.kinds(), vec![ChangeKind::ProductAdded]);

    let result = indexer
        .on_product(&origin("us", "aaa1", T0 + 1_000, T0, 35.0, -118.0))
        .await
        .unwrap();
    assert_eq!(result.kinds(), vec![ChangeKind::EventAdded]);
    let current = result.changes[0].current.as_ref().unwrap();
    assert!(current.product_types().contains(&"shakemap".to_string()));
}

#[tokio::test]
async fn result_type_separates_current_and_superseded_versions() {
    let (_dir, indexer) = setup().await;
    for millis in [T0, T0 + 60_000, T0 + 120_000] {
        indexer
            .on_product(&origin("us", "aaa1", millis, T0, 35.0, -118.0))
            .await
            .unwrap();
    }

    let index = indexer.index();
    let mut conn = index.pool().acquire().await.unwrap();
    let mut query = ProductIndexQuery::new();
    query.product_type = Some("origin".to_string());

    // default: only the greatest update time is current
    let current = index.get_products(&mut conn, &query).await.unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(
        current[0].id.update_time.timestamp_millis(),
        T0 + 120_000
    );

    query.result_type = ResultType::Superseded;
    let superseded = index.get_products(&mut conn, &query).await.unwrap();
    assert_eq!(superseded.len(), 2);
    assert!(superseded
        .iter()
        .all(|s| s.id.update_time.timestamp_millis() < T0 + 120_000));

    // the union of both sets, without duplicates
    query.result_type = ResultType::All;
    let all = index.get_products(&mut conn, &query).await.unwrap();
    assert_eq!(all.len(), 3);
    let distinct: std::collections::BTreeSet<_> = all.iter().map(|s| s.id.clone()).collect();
    assert_eq!(distinct.len(), 3);
}

#[tokio::test]
async fn wrapped_longitude_query_matches_across_antimeridian() {
    let (_dir, indexer) = setup().await;
    indexer
        .on_product(&origin("us", "aaa1", T0, T0, 10.0, -179.8))
        .await
        .unwrap();
    indexer
        .on_product(&origin("ak", "bbb2", T0 + 1_000, T0, 10.0, 0.0))
        .await
        .unwrap();
    assert_eq!(event_summaries(&indexer).await.len(), 2);

    let index = indexer.index();
    let mut conn = index.pool().acquire().await.unwrap();
    let mut query = ProductIndexQuery::new();
    query.set_longitude_range(179.0, -179.0);
    assert!(query.longitude_range_wraps());
    let matches = index.get_products(&mut conn, &query).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].id.source, "us");
}

#[tokio::test]
async fn remove_association_affects_one_version_only() {
    let (_dir, indexer) = setup().await;
    indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await
        .unwrap();
    indexer
        .on_product(&origin("us", "aaa1", T0 + 60_000, T0, 35.0, -118.0))
        .await
        .unwrap();

    let v1 = ProductId::new("us", "origin", "aaa1", Utc.timestamp_millis_opt(T0).unwrap());
    let v2 = ProductId::new(
        "us",
        "origin",
        "aaa1",
        Utc.timestamp_millis_opt(T0 + 60_000).unwrap(),
    );

    let index = indexer.index();
    let mut conn = index.pool().acquire().await.unwrap();
    index.remove_association(&mut conn, &v1).await.unwrap();

    let mut query = ProductIndexQuery::new();
    query.product_ids = vec![v1];
    query.result_type = ResultType::All;
    assert_eq!(
        index
            .get_unassociated_products(&mut conn, &query)
            .await
            .unwrap()
            .len(),
        1
    );

    let mut query = ProductIndexQuery::new();
    query.product_ids = vec![v2];
    query.result_type = ResultType::All;
    assert!(index
        .get_unassociated_products(&mut conn, &query)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn product_archive_policy_sweeps_superseded_versions() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.archive.product_policies.push(ProductArchivePolicy {
        name: "stale-versions".to_string(),
        min_product_age_secs: Some(600),
        max_product_age_secs: None,
        min_product_time: None,
        max_product_time: None,
        product_source: None,
        product_type: None,
        product_status: None,
        only_superseded: true,
        only_unassociated: false,
    });
    let indexer = build_indexer(&cfg).await.unwrap();

    let now = Utc::now();
    let old = (now - Duration::seconds(3600)).timestamp_millis();
    let recent = (now - Duration::seconds(10)).timestamp_millis();
    let event_time = now.timestamp_millis();
    indexer
        .on_product(&origin("us", "aaa1", old, event_time, 35.0, -118.0))
        .await
        .unwrap();
    indexer
        .on_product(&origin("us", "aaa1", recent, event_time, 35.0, -118.0))
        .await
        .unwrap();

    let removed = indexer.sweep_archives().await.unwrap();
    assert_eq!(removed, 1);

    // the superseded payload is gone; the current one stays
    let storage = indexer.storage();
    let old_id = ProductId::new("us", "origin", "aaa1", Utc.timestamp_millis_opt(old).unwrap());
    let recent_id =
        ProductId::new("us", "origin", "aaa1", Utc.timestamp_millis_opt(recent).unwrap());
    assert!(!storage.has(&old_id).await.unwrap());
    assert!(storage.has(&recent_id).await.unwrap());

    // the current version and its event survive
    let events = event_summaries(&indexer).await;
    assert_eq!(events.len(), 1);
    let index = indexer.index();
    let mut conn = index.pool().acquire().await.unwrap();
    let versions = index
        .get_product_versions(
            &mut conn,
            &ProductId::new("us", "origin", "aaa1", now),
        )
        .await
        .unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(
        versions[0].id.update_time.timestamp_millis(),
        recent
    );
}

#[tokio::test]
async fn event_archive_policy_removes_whole_event() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config(&dir);
    cfg.archive.event_policies.push(ArchivePolicy {
        name: "old-events".to_string(),
        min_event_age_secs: Some(3600),
        max_event_age_secs: None,
        min_event_time: None,
        max_event_time: None,
        min_latitude: None,
        max_latitude: None,
        min_longitude: None,
        max_longitude: None,
        min_depth: None,
        max_depth: None,
        min_magnitude: None,
        max_magnitude: None,
        event_source: None,
    });
    let indexer = build_indexer(&cfg).await.unwrap();

    let now = Utc::now();
    let old_event = (now - Duration::seconds(7200)).timestamp_millis();
    let update = (now - Duration::seconds(7000)).timestamp_millis();
    indexer
        .on_product(&origin("us", "aaa1", update, old_event, 35.0, -118.0))
        .await
        .unwrap();
    // a recent event the policy must not touch
    indexer
        .on_product(&origin(
            "ak",
            "bbb2",
            now.timestamp_millis(),
            now.timestamp_millis(),
            50.0,
            10.0,
        ))
        .await
        .unwrap();

    let removed = indexer.sweep_archives().await.unwrap();
    // one product row plus its event row
    assert_eq!(removed, 2);
    let events = event_summaries(&indexer).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_id().as_deref(), Some("akbbb2"));

    // the archived event's payload is removed with its rows
    let archived_id =
        ProductId::new("us", "origin", "aaa1", Utc.timestamp_millis_opt(update).unwrap());
    assert!(!indexer.storage().has(&archived_id).await.unwrap());
}

#[tokio::test]
async fn listener_failure_never_reaches_callers() {
    struct Failing;
    #[async_trait]
    impl IndexerListener for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn on_indexer_event(&self, _event: &IndexerEvent) -> Result<()> {
            anyhow::bail!("listener is broken")
        }
    }

    struct Recording {
        kinds: Arc<std::sync::Mutex<Vec<Vec<ChangeKind>>>>,
    }
    #[async_trait]
    impl IndexerListener for Recording {
        fn name(&self) -> &str {
            "recording"
        }
        async fn on_indexer_event(&self, event: &IndexerEvent) -> Result<()> {
            self.kinds.lock().unwrap().push(event.kinds());
            Ok(())
        }
    }

    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let pool = db::connect(&cfg).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let kinds = Arc::new(std::sync::Mutex::new(Vec::new()));
    let indexer = Indexer::new(
        ProductIndex::new(pool),
        Arc::new(FileProductStorage::new(&cfg.storage.directory)),
        &cfg,
        vec![
            Arc::new(Failing),
            Arc::new(Recording {
                kinds: kinds.clone(),
            }),
        ],
    );

    let result = indexer
        .on_product(&origin("us", "aaa1", T0, T0, 35.0, -118.0))
        .await;
    assert!(result.is_ok());

    indexer.shutdown().await;
    assert_eq!(*kinds.lock().unwrap(), vec![vec![ChangeKind::EventAdded]]);
}

#[tokio::test]
async fn concurrent_ingestions_notify_in_commit_order() {
    struct Recording {
        kinds: Arc<std::sync::Mutex<Vec<Vec<ChangeKind>>>>,
    }
    #[async_trait]
    impl IndexerListener for Recording {
        fn name(&self) -> &str {
            "recording"
        }
        async fn on_indexer_event(&self, event: &IndexerEvent) -> Result<()> {
            self.kinds.lock().unwrap().push(event.kinds());
            Ok(())
        }
    }

    let dir = TempDir::new().unwrap();
    let cfg = test_config(&dir);
    let pool = db::connect(&cfg).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let kinds = Arc::new(std::sync::Mutex::new(Vec::new()));
    let indexer = Arc::new(Indexer::new(
        ProductIndex::new(pool),
        Arc::new(FileProductStorage::new(&cfg.storage.directory)),
        &cfg,
        vec![Arc::new(Recording {
            kinds: kinds.clone(),
        })],
    ));

    // nearby origins from distinct networks racing into one event;
    // whichever commits first creates it, the rest must be seen as updates
    let mut handles = Vec::new();
    for i in 0..5i64 {
        let indexer = Arc::clone(&indexer);
        handles.push(tokio::spawn(async move {
            let source = format!("s{}", i);
            let code = format!("c{}", i);
            indexer
                .on_product(&origin(&source, &code, T0 + i * 1_000, T0, 35.0, -118.0))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    indexer.shutdown().await;

    let seen = kinds.lock().unwrap();
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[0], vec![ChangeKind::EventAdded]);
    for later in &seen[1..] {
        assert_eq!(*later, vec![ChangeKind::EventUpdated]);
    }
}
