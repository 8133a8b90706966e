use sieve_db::{Database, DatabaseConfig, SqliteStore};

/// Fresh in-memory database with migrations applied.
pub async fn setup_test_db() -> Database {
    let db = Database::connect(&DatabaseConfig::with_url("sqlite::memory:"))
        .await
        .expect("Failed to open in-memory SQLite");
    db.migrate().await.expect("Failed to run migrations");
    db
}

pub async fn setup_store() -> SqliteStore {
    setup_test_db().await.store()
}
