use sieve_core::AppError;

const DEFAULT_DATABASE_URL: &str = "sqlite://sieve.db?mode=rwc";

/// Configuration for the SQLite connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.into(),
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (optional, defaults to `sqlite://sieve.db?mode=rwc`)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.url = url;
        }
        if let Ok(raw) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = parse_max_connections(&raw)?;
        }
        Ok(config)
    }

    /// Configuration for a given URL with default pool size.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// In-memory databases are per connection, so they get a single one.
    pub(crate) fn effective_max_connections(&self) -> u32 {
        if self.url.contains(":memory:") || self.url.contains("mode=memory") {
            1
        } else {
            self.max_connections
        }
    }
}

fn parse_max_connections(raw: &str) -> Result<u32, AppError> {
    let parsed: u32 = raw.parse().map_err(|_| {
        AppError::ConfigError(format!(
            "Invalid DATABASE_MAX_CONNECTIONS '{raw}': must be a positive integer"
        ))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(
            "DATABASE_MAX_CONNECTIONS must be at least 1".into(),
        ));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_connections_parsing() {
        assert_eq!(parse_max_connections("12").unwrap(), 12);
        assert!(matches!(
            parse_max_connections("0"),
            Err(AppError::ConfigError(_))
        ));
        assert!(parse_max_connections("lots").is_err());
    }

    #[test]
    fn test_memory_databases_use_one_connection() {
        assert_eq!(
            DatabaseConfig::with_url("sqlite::memory:").effective_max_connections(),
            1
        );
        assert_eq!(DatabaseConfig::default().effective_max_connections(), 5);
    }
}
