pub mod config;
pub mod database;
pub mod store;

pub use config::DatabaseConfig;
pub use database::Database;
pub use store::SqliteStore;
