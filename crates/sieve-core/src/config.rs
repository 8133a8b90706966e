use crate::error::AppError;

const DEFAULT_ROW_CONCURRENCY: usize = 4;
const DEFAULT_MAX_PAGES: u32 = 50;

/// Engine-wide tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Worker threads used to extract the rows of one page.
    pub row_concurrency: usize,
    /// Page ceiling for paginated schemas without `maxPages`.
    pub default_max_pages: u32,
    /// Persist the job after every page (otherwise only at the end).
    pub checkpoint_every_page: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            row_concurrency: DEFAULT_ROW_CONCURRENCY,
            default_max_pages: DEFAULT_MAX_PAGES,
            checkpoint_every_page: true,
        }
    }
}

impl EngineConfig {
    /// Read configuration from environment variables.
    ///
    /// - `SIEVE_ROW_CONCURRENCY` (optional, defaults to 4)
    /// - `SIEVE_DEFAULT_MAX_PAGES` (optional, defaults to 50)
    /// - `SIEVE_CHECKPOINT_EVERY_PAGE` (optional, defaults to true)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            row_concurrency: positive(&lookup, "SIEVE_ROW_CONCURRENCY")?
                .unwrap_or(defaults.row_concurrency),
            default_max_pages: positive(&lookup, "SIEVE_DEFAULT_MAX_PAGES")?
                .unwrap_or(defaults.default_max_pages),
            checkpoint_every_page: match lookup("SIEVE_CHECKPOINT_EVERY_PAGE") {
                None => defaults.checkpoint_every_page,
                Some(raw) => raw.parse().map_err(|_| {
                    AppError::ConfigError(format!(
                        "Invalid SIEVE_CHECKPOINT_EVERY_PAGE '{raw}': must be true or false"
                    ))
                })?,
            },
        })
    }

    pub fn with_row_concurrency(mut self, row_concurrency: usize) -> Self {
        self.row_concurrency = row_concurrency.max(1);
        self
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.parse::<T>() {
        Ok(v) if v != T::default() => Ok(Some(v)),
        _ => Err(AppError::ConfigError(format!(
            "Invalid {key} '{raw}': must be a positive integer"
        ))),
    }
}
