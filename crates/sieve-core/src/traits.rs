use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::Job;
use crate::schema::{Field, FieldType, Schema};
use crate::selector::Selector;

/// One outbound page request, with the anti-detection plan already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub user_agent: String,
    pub proxy: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            user_agent: crate::anti_detection::DEFAULT_USER_AGENT.to_string(),
            proxy: None,
        }
    }
}

/// Fetches the raw body of a page.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Minimal document store: JSON documents keyed by collection and id.
pub trait DocumentStore: Send + Sync + Clone {
    /// Insert or replace a document.
    fn put(
        &self,
        collection: &str,
        id: &str,
        document: &Value,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<Value>, AppError>> + Send;

    /// Returns false when nothing was stored under `id`.
    fn delete(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn list(&self, collection: &str) -> impl Future<Output = Result<Vec<Value>, AppError>> + Send;
}

pub const SCHEMAS: &str = "schemas";
pub const JOBS: &str = "jobs";

/// Schema and job persistence.
pub trait Storage: Send + Sync + Clone {
    fn save_schema(&self, schema: &Schema) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_schema(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<Schema>, AppError>> + Send;

    /// All schemas, ordered by name.
    fn get_all_schemas(&self) -> impl Future<Output = Result<Vec<Schema>, AppError>> + Send;

    fn delete_schema(&self, id: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Insert or replace a job (used for checkpoints).
    fn save_job(&self, job: &Job) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_job(&self, id: Uuid) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Jobs, newest first, optionally restricted to one schema.
    fn get_jobs(
        &self,
        schema_id: Option<&str>,
    ) -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;
}

impl<D: DocumentStore> Storage for D {
    async fn save_schema(&self, schema: &Schema) -> Result<(), AppError> {
        let doc = serde_json::to_value(schema)?;
        self.put(SCHEMAS, &schema.id, &doc).await
    }

    async fn get_schema(&self, id: &str) -> Result<Option<Schema>, AppError> {
        match self.get(SCHEMAS, id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    async fn get_all_schemas(&self) -> Result<Vec<Schema>, AppError> {
        let mut schemas = self
            .list(SCHEMAS)
            .await?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Schema>, _>>()?;
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schemas)
    }

    async fn delete_schema(&self, id: &str) -> Result<bool, AppError> {
        self.delete(SCHEMAS, id).await
    }

    async fn save_job(&self, job: &Job) -> Result<(), AppError> {
        let doc = serde_json::to_value(job)?;
        self.put(JOBS, &job.id().to_string(), &doc).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, AppError> {
        match self.get(JOBS, &id.to_string()).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    async fn get_jobs(&self, schema_id: Option<&str>) -> Result<Vec<Job>, AppError> {
        let mut jobs = self
            .list(JOBS)
            .await?
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Job>, _>>()?;
        if let Some(schema_id) = schema_id {
            jobs.retain(|j| j.schema_id() == schema_id);
        }
        jobs.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(jobs)
    }
}

/// A no-op store for runs that should not be persisted.
#[derive(Debug, Clone)]
pub struct NullStore;

impl DocumentStore for NullStore {
    async fn put(&self, _collection: &str, _id: &str, _document: &Value) -> Result<(), AppError> {
        Ok(())
    }

    async fn get(&self, _collection: &str, _id: &str) -> Result<Option<Value>, AppError> {
        Ok(None)
    }

    async fn delete(&self, _collection: &str, _id: &str) -> Result<bool, AppError> {
        Ok(false)
    }

    async fn list(&self, _collection: &str) -> Result<Vec<Value>, AppError> {
        Ok(vec![])
    }
}

/// A field proposal returned by a [`SelectorSuggester`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSelector {
    pub field_name: String,
    pub selector: Selector,
    #[serde(default)]
    pub field_type: FieldType,
    /// 0.0 ..= 1.0
    pub confidence: f32,
    #[serde(default)]
    pub sample_value: Option<String>,
}

impl CandidateSelector {
    pub fn into_field(self) -> Field {
        Field::new(self.field_name, self.selector).with_type(self.field_type)
    }
}

/// Proposes selectors for a page (typically AI-backed).
///
/// Best-effort: extraction never depends on it.
pub trait SelectorSuggester: Send + Sync + Clone {
    fn analyze_page(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Vec<CandidateSelector>, AppError>> + Send;
}

/// Turn suggestions into fields, keeping the most confident candidate per
/// name and dropping those below `min_confidence`.
pub fn fields_from_candidates(
    mut candidates: Vec<CandidateSelector>,
    min_confidence: f32,
) -> Vec<Field> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut fields: Vec<Field> = Vec::new();
    for candidate in candidates {
        if candidate.confidence < min_confidence
            || fields.iter().any(|f| f.name == candidate.field_name)
        {
            continue;
        }
        fields.push(candidate.into_field());
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::store::MemoryStore;
    use crate::testutil::MockSuggester;

    fn schema(name: &str) -> Schema {
        Schema::new(
            name,
            vec!["https://ex.com".into()],
            vec![Field::new("t", Selector::css("h1"))],
        )
    }

    #[tokio::test]
    async fn test_schema_crud() {
        let store = MemoryStore::new();
        let b = schema("beta");
        let a = schema("alpha");
        store.save_schema(&b).await.unwrap();
        store.save_schema(&a).await.unwrap();

        let all = store.get_all_schemas().await.unwrap();
        let names: Vec<&str> = all.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        assert_eq!(store.get_schema(&a.id).await.unwrap().unwrap().name, "alpha");
        assert!(store.delete_schema(&a.id).await.unwrap());
        assert!(!store.delete_schema(&a.id).await.unwrap());
        assert!(store.get_schema(&a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_job_replaces_checkpoint() {
        let store = MemoryStore::new();
        let s1 = schema("one");
        let s2 = schema("two");

        let mut job = Job::new(&s1);
        store.save_job(&job).await.unwrap();
        job.transition(JobStatus::Running).unwrap();
        store.save_job(&job).await.unwrap();
        store.save_job(&Job::new(&s2)).await.unwrap();

        assert_eq!(store.get_jobs(None).await.unwrap().len(), 2);
        let mine = store.get_jobs(Some(&s1.id)).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].status(), JobStatus::Running);
        assert_eq!(store.get_job(job.id()).await.unwrap().unwrap(), job);
    }

    #[tokio::test]
    async fn test_null_store_persists_nothing() {
        let store = NullStore;
        store.save_schema(&schema("x")).await.unwrap();
        assert!(store.get_all_schemas().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fields_from_suggestions() {
        let suggester = MockSuggester::new(vec![
            CandidateSelector {
                field_name: "title".into(),
                selector: Selector::css("h2"),
                field_type: FieldType::Text,
                confidence: 0.6,
                sample_value: None,
            },
            CandidateSelector {
                field_name: "title".into(),
                selector: Selector::css(".title"),
                field_type: FieldType::Text,
                confidence: 0.9,
                sample_value: Some("Dune".into()),
            },
            CandidateSelector {
                field_name: "noise".into(),
                selector: Selector::css("span"),
                field_type: FieldType::Text,
                confidence: 0.1,
                sample_value: None,
            },
        ]);
        let candidates = suggester.analyze_page("https://ex.com").await.unwrap();
        assert_eq!(suggester.analyzed_pages(), vec!["https://ex.com"]);
        let fields = fields_from_candidates(candidates, 0.5);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].selector.value, ".title");
    }
}
