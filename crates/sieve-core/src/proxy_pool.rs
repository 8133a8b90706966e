//! Shared proxy health pool.
//!
//! The pool is the one piece of mutable state several jobs touch at once, so
//! every read and update goes through a single mutex. Cloning a pool shares it.
//!
//! A proxy whose failure rate crosses the threshold is benched. Once it has
//! been idle for the pool's cool-down it becomes eligible for one trial
//! request; a success clears its record, a failure benches it again.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use serde::Serialize;

/// Failure rate above which a proxy is considered unhealthy.
const UNHEALTHY_FAILURE_RATE: f64 = 0.5;
/// Requests needed before the failure rate is trusted.
const MIN_REQUESTS_FOR_HEALTH: u64 = 5;
/// Idle time after which an unhealthy proxy gets a trial request.
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(60);

/// Usage statistics of a single proxy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStats {
    pub url: String,
    pub enabled: bool,
    pub successes: u64,
    pub failures: u64,
    pub avg_response_ms: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl ProxyStats {
    fn new(url: String) -> Self {
        Self {
            url,
            enabled: true,
            successes: 0,
            failures: 0,
            avg_response_ms: 0,
            last_used: None,
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.successes + self.failures
    }

    /// Laplace-smoothed success rate: `(s + 1) / (s + f + 2)`.
    ///
    /// An unused proxy weighs 0.5, so new proxies still get picked.
    pub fn weight(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.total_requests() as f64 + 2.0)
    }

    pub fn is_healthy(&self) -> bool {
        let total = self.total_requests();
        total <= MIN_REQUESTS_FOR_HEALTH
            || (self.failures as f64 / total as f64) <= UNHEALTHY_FAILURE_RATE
    }

    /// Enabled, and either healthy or idle for at least `cool_down`.
    fn is_available(&self, now: DateTime<Utc>, cool_down: Duration) -> bool {
        if !self.enabled {
            return false;
        }
        if self.is_healthy() {
            return true;
        }
        self.last_used.is_none_or(|last| {
            (now - last)
                .to_std()
                .is_ok_and(|idle| idle >= cool_down)
        })
    }
}

/// Thread-safe pool of proxies with success-weighted selection.
#[derive(Debug, Clone)]
pub struct ProxyPool {
    inner: Arc<Mutex<Vec<ProxyStats>>>,
    cool_down: Duration,
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            cool_down: DEFAULT_COOL_DOWN,
        }
    }
}

impl ProxyPool {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = Self::default();
        for url in urls {
            pool.add(url);
        }
        pool
    }

    /// How long an unhealthy proxy sits out before its trial request.
    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    fn lock_inner(&self) -> MutexGuard<'_, Vec<ProxyStats>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy pool mutex");
            poisoned.into_inner()
        })
    }

    /// Add a proxy. Returns false if it was already present.
    pub fn add(&self, url: impl Into<String>) -> bool {
        let url = url.into();
        let mut proxies = self.lock_inner();
        if proxies.iter().any(|p| p.url == url) {
            return false;
        }
        proxies.push(ProxyStats::new(url));
        true
    }

    /// Enable or disable a proxy. Returns false for unknown proxies.
    pub fn set_enabled(&self, url: &str, enabled: bool) -> bool {
        match self.lock_inner().iter_mut().find(|p| p.url == url) {
            Some(p) => {
                p.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock_inner().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick an available proxy, weighted toward higher success rates.
    ///
    /// Returns `None` when every proxy is disabled or benched.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<String> {
        let now = Utc::now();
        let mut proxies = self.lock_inner();
        let candidates: Vec<usize> = proxies
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_available(now, self.cool_down))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let weights = candidates.iter().map(|&i| proxies[i].weight());
        let dist = WeightedIndex::new(weights).ok()?;
        let chosen = &mut proxies[candidates[dist.sample(rng)]];
        chosen.last_used = Some(now);
        Some(chosen.url.clone())
    }

    /// Record the outcome of a request routed through `url`.
    pub fn record_outcome(&self, url: &str, success: bool, elapsed: Duration) {
        let mut proxies = self.lock_inner();
        let Some(p) = proxies.iter_mut().find(|p| p.url == url) else {
            tracing::debug!(proxy = %url, "Outcome for unknown proxy ignored");
            return;
        };

        let was_healthy = p.is_healthy();
        if success && !was_healthy {
            // Trial request after the cool-down went through.
            tracing::info!(proxy = %url, failures = p.failures, "Proxy recovered");
            p.successes = 0;
            p.failures = 0;
        }
        if success {
            p.successes += 1;
        } else {
            p.failures += 1;
        }
        p.last_used = Some(Utc::now());
        let total = p.total_requests();
        let elapsed_ms = elapsed.as_millis() as u64;
        p.avg_response_ms = (p.avg_response_ms * (total - 1) + elapsed_ms) / total;

        if was_healthy && !p.is_healthy() {
            tracing::warn!(
                proxy = %url,
                failures = p.failures,
                total,
                "Proxy marked unhealthy"
            );
        }
    }

    /// Snapshot of every proxy's statistics.
    pub fn stats(&self) -> Vec<ProxyStats> {
        self.lock_inner().clone()
    }
}
