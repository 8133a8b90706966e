pub mod anti_detection;
pub mod change;
pub mod config;
pub mod error;
pub mod export;
pub mod extract;
pub mod job;
pub mod jsonpath;
pub mod models;
pub mod orchestrator;
pub mod pagination;
pub mod proxy_pool;
pub mod schema;
pub mod selector;
pub mod store;
pub mod traits;
pub mod transform;
pub mod validation;
pub mod xpath;

#[cfg(test)]
pub(crate) mod testutil;

pub use change::{ChangeSet, diff};
pub use config::EngineConfig;
pub use error::AppError;
pub use export::{ExportFormat, ExportOptions, export};
pub use job::{ExtractionStats, Job, JobStatus, LogEntry, LogLevel, Progress};
pub use models::{ExtractedItem, compute_hash};
pub use orchestrator::{JobHandle, JobUpdate, Orchestrator};
pub use proxy_pool::ProxyPool;
pub use schema::Schema;
pub use store::MemoryStore;
pub use traits::{DocumentStore, FetchRequest, Fetcher, NullStore, SelectorSuggester, Storage};
pub use transform::TransformRegistry;
