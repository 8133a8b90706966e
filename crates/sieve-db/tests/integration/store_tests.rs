use serde_json::json;
use sieve_core::error::AppError;
use sieve_core::job::{Job, JobStatus, LogEntry, LogLevel};
use sieve_core::models::ExtractedItem;
use sieve_core::schema::{Field, Schema};
use sieve_core::selector::Selector;
use sieve_core::traits::{DocumentStore, FetchRequest, Fetcher, Storage};
use sieve_core::{EngineConfig, Orchestrator};
use sieve_db::{Database, DatabaseConfig};

use crate::integration::common::{setup_store, setup_test_db};

fn schema(name: &str, url: &str) -> Schema {
    let mut schema = Schema::new(
        name,
        vec![url.into()],
        vec![Field::new("title", Selector::css(".title").multiple())],
    );
    schema.anti_detection.delay.min = 0;
    schema.anti_detection.delay.max = 0;
    schema
}

#[tokio::test]
async fn put_replaces_and_delete_removes() {
    let store = setup_store().await;

    store.put("things", "a", &json!({"v": 1})).await.unwrap();
    store.put("things", "a", &json!({"v": 2})).await.unwrap();
    store.put("things", "b", &json!({"v": 3})).await.unwrap();
    store.put("others", "a", &json!({"v": 4})).await.unwrap();

    assert_eq!(store.count("things").await.unwrap(), 2);
    assert_eq!(
        store.get("things", "a").await.unwrap(),
        Some(json!({"v": 2}))
    );
    assert_eq!(
        store.list("things").await.unwrap(),
        vec![json!({"v": 2}), json!({"v": 3})]
    );
    assert!(store.updated_at("things", "a").await.unwrap().is_some());

    assert!(store.delete("things", "a").await.unwrap());
    assert!(!store.delete("things", "a").await.unwrap());
    assert_eq!(store.get("things", "a").await.unwrap(), None);
    assert_eq!(store.count("others").await.unwrap(), 1);
}

#[tokio::test]
async fn schemas_round_trip() {
    let store = setup_store().await;
    let mut s = schema("products", "https://ex.com/p");
    s.key_field = Some("title".into());
    store.save_schema(&s).await.unwrap();

    s.revise();
    store.save_schema(&s).await.unwrap();

    let loaded = store.get_schema(&s.id).await.unwrap().unwrap();
    assert_eq!(loaded, s);
    assert_eq!(loaded.version, 2);
    assert_eq!(store.get_all_schemas().await.unwrap().len(), 1);

    assert!(store.delete_schema(&s.id).await.unwrap());
    assert!(store.get_schema(&s.id).await.unwrap().is_none());
}

#[tokio::test]
async fn jobs_round_trip_with_results_and_logs() {
    let store = setup_store().await;
    let s = schema("products", "https://ex.com/p");

    let mut job = Job::new(&s);
    job.transition(JobStatus::Running).unwrap();
    job.push_result(ExtractedItem::new(
        "https://ex.com/p",
        json!({"title": "Dune", "price": 9.5})
            .as_object()
            .unwrap()
            .clone(),
    ))
    .unwrap();
    job.log(LogEntry::new(LogLevel::Warn, "degraded").with_field("price"))
        .unwrap();
    job.record_page().unwrap();
    job.transition(JobStatus::Completed).unwrap();
    store.save_job(&job).await.unwrap();

    let other = Job::new(&schema("other", "https://ex.com/o"));
    store.save_job(&other).await.unwrap();

    let loaded = store.get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(loaded, job);
    assert_eq!(loaded.results()[0].hash, job.results()[0].hash);

    assert_eq!(store.get_jobs(None).await.unwrap().len(), 2);
    let filtered = store.get_jobs(Some(&s.id)).await.unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].status(), JobStatus::Completed);
}

#[tokio::test]
async fn file_database_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("sieve.db").display());
    let s = schema("persisted", "https://ex.com/p");

    {
        let db = Database::connect(&DatabaseConfig::with_url(&url))
            .await
            .unwrap();
        db.migrate().await.unwrap();
        db.store().save_schema(&s).await.unwrap();
        db.pool().close().await;
    }

    let db = Database::connect(&DatabaseConfig::with_url(&url))
        .await
        .unwrap();
    db.migrate().await.unwrap();
    let loaded = db.store().get_schema(&s.id).await.unwrap();
    assert_eq!(loaded.map(|l| l.name), Some("persisted".to_string()));
}

/// Serves one fixed page for every request.
#[derive(Clone)]
struct StaticFetcher(&'static str);

impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, AppError> {
        if request.url.starts_with("https://ex.com/") {
            Ok(self.0.to_string())
        } else {
            Err(AppError::HttpError(format!("HTTP 404 for {}", request.url)))
        }
    }
}

#[tokio::test]
async fn orchestrator_checkpoints_into_sqlite() {
    let db = setup_test_db().await;
    let fetcher = StaticFetcher(
        r#"<html><body><p class="title">A</p><p class="title">B</p></body></html>"#,
    );
    let orch = Orchestrator::new(fetcher, db.store(), EngineConfig::default());
    let s = schema("titles", "https://ex.com/list");

    let job = orch.run(&s).await.unwrap();
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.results().len(), 2);

    let stored = db.store().get_job(job.id()).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Completed);
    assert_eq!(stored.results().len(), 2);
    assert_eq!(stored.progress().pages_processed(), 1);
}
