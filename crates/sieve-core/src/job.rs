use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::ExtractedItem;
use crate::schema::Schema;

/// Status of an extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Forward-only state machine; terminal states accept nothing.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Cancelled)
                | (Running, Completed | Failed | Cancelled | Paused)
                | (Paused, Running | Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Job counters. They only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pages_processed: u64,
    /// Estimate (sources x page ceiling); raised, never lowered.
    total_pages: u64,
    items_extracted: u64,
    errors: u64,
}

impl Progress {
    pub fn pages_processed(&self) -> u64 {
        self.pages_processed
    }

    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    pub fn items_extracted(&self) -> u64 {
        self.items_extracted
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    fn raise_total_pages(&mut self, estimate: u64) {
        self.total_pages = self.total_pages.max(estimate).max(self.pages_processed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A job-scoped log line, persisted with the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            url: None,
            field: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Run summary derived from a job and the schema it ran.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionStats {
    pub total_records: usize,
    /// Fields of an assembled item.
    pub total_fields: usize,
    pub pages_processed: u64,
    /// Wall-clock milliseconds.
    pub duration: u64,
    /// Percentage of item fields that never failed.
    pub success_rate: f32,
    /// Every field with at least one failure, sorted.
    pub failed_fields: Vec<String>,
}

/// One execution of a schema.
///
/// Every field is private and only changed through methods, so the state
/// machine and monotonic counters cannot be bypassed. Once the job is
/// terminal every mutator returns [`AppError::InvalidTransition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    id: Uuid,
    schema_id: String,
    schema_version: u32,
    status: JobStatus,
    progress: Progress,
    results: Vec<ExtractedItem>,
    logs: Vec<LogEntry>,
    /// Aborted items and degraded transforms, per field.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    field_failures: BTreeMap<String, u64>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl Job {
    pub fn new(schema: &Schema) -> Self {
        Self {
            id: Uuid::new_v4(),
            schema_id: schema.id.clone(),
            schema_version: schema.version,
            status: JobStatus::Pending,
            progress: Progress::default(),
            results: Vec::new(),
            logs: Vec::new(),
            field_failures: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn results(&self) -> &[ExtractedItem] {
        &self.results
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn field_failures(&self) -> &BTreeMap<String, u64> {
        &self.field_failures
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Move to `next`, stamping `startedAt`/`completedAt` as needed.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), AppError> {
        if next == JobStatus::Failed {
            return self.fail("job failed");
        }
        self.apply_transition(next)
    }

    /// Transition to `failed` with `message` as the job error.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), AppError> {
        self.apply_transition(JobStatus::Failed)?;
        self.error = Some(message.into());
        Ok(())
    }

    fn apply_transition(&mut self, next: JobStatus) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        tracing::debug!(job_id = %self.id, from = %self.status, to = %next, "Job transition");
        self.status = next;
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), AppError> {
        if self.status.is_terminal() {
            return Err(AppError::InvalidTransition {
                from: self.status.to_string(),
                to: "modified".into(),
            });
        }
        Ok(())
    }

    pub fn push_result(&mut self, item: ExtractedItem) -> Result<(), AppError> {
        self.ensure_mutable()?;
        self.results.push(item);
        self.progress.items_extracted += 1;
        Ok(())
    }

    pub fn record_page(&mut self) -> Result<(), AppError> {
        self.ensure_mutable()?;
        self.progress.pages_processed += 1;
        self.progress.raise_total_pages(0);
        Ok(())
    }

    pub fn record_error(&mut self) -> Result<(), AppError> {
        self.ensure_mutable()?;
        self.progress.errors += 1;
        Ok(())
    }

    pub fn raise_total_pages(&mut self, estimate: u64) -> Result<(), AppError> {
        self.ensure_mutable()?;
        self.progress.raise_total_pages(estimate);
        Ok(())
    }

    pub fn log(&mut self, entry: LogEntry) -> Result<(), AppError> {
        self.ensure_mutable()?;
        self.logs.push(entry);
        Ok(())
    }

    pub fn record_field_failure(&mut self, field: &str) -> Result<(), AppError> {
        self.ensure_mutable()?;
        *self.field_failures.entry(field.to_string()).or_default() += 1;
        Ok(())
    }

    /// Summarize the run. Duration runs to now while the job is live.
    pub fn stats(&self, schema: &Schema) -> ExtractionStats {
        let fields = schema.item_field_names();
        let failing = fields
            .iter()
            .filter(|f| self.field_failures.contains_key(**f))
            .count();
        let success_rate = if fields.is_empty() {
            0.0
        } else {
            (fields.len() - failing) as f32 / fields.len() as f32 * 100.0
        };
        let duration = self.started_at.map_or(0, |start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            (end - start).num_milliseconds().max(0) as u64
        });

        ExtractionStats {
            total_records: self.results.len(),
            total_fields: fields.len(),
            pages_processed: self.progress.pages_processed,
            duration,
            success_rate,
            failed_fields: self.field_failures.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use crate::selector::Selector;
    use serde_json::{Map, json};

    fn job() -> Job {
        let schema = Schema::new(
            "s",
            vec!["https://ex.com".into()],
            vec![Field::new("t", Selector::css("h1"))],
        );
        Job::new(&schema)
    }

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let s = status.as_str();
            let parsed: JobStatus = s.parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("exploded".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_allowed_transitions() {
        let mut job = job();
        job.transition(JobStatus::Running).unwrap();
        let started = job.started_at().unwrap();
        job.transition(JobStatus::Paused).unwrap();
        job.transition(JobStatus::Running).unwrap();
        assert_eq!(job.started_at(), Some(started));
        job.transition(JobStatus::Completed).unwrap();
        assert!(job.completed_at().is_some());
        assert!(job.error().is_none());
    }

    #[test]
    fn test_no_resurrection_from_terminal_states() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Paused,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Paused.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_terminal_job_is_immutable() {
        let mut job = job();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Cancelled).unwrap();
        assert!(job.error().is_none());

        let err = job.transition(JobStatus::Running).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert!(job.push_result(ExtractedItem::new("u", Map::new())).is_err());
        assert!(job.record_page().is_err());
        assert!(job.log(LogEntry::new(LogLevel::Info, "late")).is_err());
        assert!(job.record_field_failure("t").is_err());
        assert_eq!(job.progress(), Progress::default());
    }

    #[test]
    fn test_fail_records_error() {
        let mut job = job();
        job.transition(JobStatus::Running).unwrap();
        job.fail("3 consecutive fetch errors").unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error(), Some("3 consecutive fetch errors"));
        assert!(job.completed_at().is_some());
    }

    #[test]
    fn test_progress_counters_only_grow() {
        let mut job = job();
        job.transition(JobStatus::Running).unwrap();
        job.raise_total_pages(10).unwrap();
        job.raise_total_pages(4).unwrap();
        assert_eq!(job.progress().total_pages(), 10);

        let mut data = Map::new();
        data.insert("t".into(), json!("x"));
        job.push_result(ExtractedItem::new("u", data)).unwrap();
        job.record_page().unwrap();
        job.record_error().unwrap();
        let p = job.progress();
        assert_eq!(
            (p.items_extracted(), p.pages_processed(), p.errors()),
            (1, 1, 1)
        );
    }

    #[test]
    fn test_identity_is_read_only() {
        let schema = Schema::new(
            "s",
            vec!["https://ex.com".into()],
            vec![Field::new("t", Selector::css("h1"))],
        );
        let job = Job::new(&schema);
        assert_eq!(job.schema_id(), schema.id);
        assert_eq!(job.schema_version(), 1);
        assert!(job.created_at() <= Utc::now());
        assert_ne!(job.id(), Job::new(&schema).id());
    }

    #[test]
    fn test_stats_from_progress_and_field_failures() {
        let schema = Schema::new(
            "s",
            vec!["https://ex.com".into()],
            vec![
                Field::new("shop", Selector::css("h1")),
                Field::new("rows", Selector::css("li").multiple()).with_children(vec![
                    Field::new("title", Selector::css(".t")),
                    Field::new("price", Selector::css(".p")),
                    Field::new("sku", Selector::css(".s")),
                ]),
            ],
        );
        let mut job = Job::new(&schema);
        assert_eq!(job.stats(&schema).duration, 0);

        job.transition(JobStatus::Running).unwrap();
        let mut data = Map::new();
        data.insert("title".into(), json!("Dune"));
        job.push_result(ExtractedItem::new("u", data)).unwrap();
        job.record_page().unwrap();
        job.record_page().unwrap();
        job.record_field_failure("price").unwrap();
        job.record_field_failure("price").unwrap();
        job.transition(JobStatus::Completed).unwrap();

        let stats = job.stats(&schema);
        assert_eq!(stats.total_records, 1);
        assert_eq!(stats.total_fields, 4);
        assert_eq!(stats.pages_processed, 2);
        assert_eq!(stats.success_rate, 75.0);
        assert_eq!(stats.failed_fields, vec!["price".to_string()]);
        assert_eq!(job.field_failures()["price"], 2);

        let v = serde_json::to_value(&stats).unwrap();
        assert_eq!(v["successRate"], 75.0);
        assert_eq!(v["failedFields"][0], "price");
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let mut job = job();
        job.transition(JobStatus::Running).unwrap();
        job.log(LogEntry::new(LogLevel::Warn, "w").with_field("price"))
            .unwrap();
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["status"], "running");
        assert_eq!(v["progress"]["pagesProcessed"], 0);
        assert_eq!(v["logs"][0]["level"], "warn");
        assert_eq!(v["logs"][0]["field"], "price");

        let back: Job = serde_json::from_value(v).unwrap();
        assert_eq!(back, job);
    }
}
