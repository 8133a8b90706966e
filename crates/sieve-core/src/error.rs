use thiserror::Error;

/// Application-wide error types for Sieve.
#[derive(Error, Debug)]
pub enum AppError {
    /// A required field resolved to zero nodes after the whole fallback chain.
    #[error("Required field '{field}' matched nothing (selector and all fallbacks exhausted)")]
    SelectorResolution { field: String },

    /// An extracted value or its selector matches broke a validation rule.
    #[error("Field '{field}' failed validation: {message}")]
    Validation { field: String, message: String },

    /// A transform could not be applied to its input.
    #[error("Transform '{transform}' failed: {message}")]
    Transform { transform: String, message: String },

    /// HTTP request failed (non-success status, bad body, ...).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Proxy rotation is on but no proxy may be used right now.
    #[error("No usable proxy for {0}")]
    ProxyUnavailable(String),

    /// The next page target could not be computed.
    #[error("Pagination error: {0}")]
    Pagination(String),

    /// Export failed (unsupported format, malformed data).
    #[error("Export error: {0}")]
    Export(String),

    /// Schema failed load-time validation.
    #[error("Schema validation error: {0}")]
    SchemaValidation(String),

    /// A job status transition that the state machine forbids.
    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Storage operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout")
                    || msg.contains("connect")
                    || msg.contains("reset")
                    || msg.contains("HTTP 429")
                    || msg.contains("HTTP 5")
            }
            _ => false,
        }
    }

    /// Returns true if this error came from the fetch boundary and counts
    /// toward a job's consecutive fetch failure streak.
    pub fn is_fetch_error(&self) -> bool {
        matches!(
            self,
            AppError::HttpError(_)
                | AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::ProxyUnavailable(_)
        )
    }

    /// The item field an item-level error is about, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            AppError::SelectorResolution { field } | AppError::Validation { field, .. } => {
                Some(field)
            }
            _ => None,
        }
    }
}
