//! Per-request anti-detection policy.
//!
//! [`plan`] only computes values (user agent, proxy, delay, extra headers);
//! the fetch executor applies them. Apart from the random draws and the
//! proxy pool's `last_used` bookkeeping it has no side effects.
//!
//! With proxy rotation on, a request is never planned without a proxy: an
//! empty or fully benched pool is an error, not a direct connection.

use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::error::AppError;
use crate::proxy_pool::ProxyPool;
use crate::schema::{AntiDetectionConfig, DetectionLevel};

/// User agent sent when rotation is off and no pool is configured.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Rotation pool used when a schema enables rotation without listing agents.
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    DEFAULT_USER_AGENT,
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edge/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// What is known about the request being planned.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub url: &'a str,
    pub page: u32,
}

/// Policy values for one outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPlan {
    pub user_agent: String,
    pub proxy: Option<String>,
    pub delay: Duration,
    /// Browser-like headers added at `medium` and `high` levels.
    pub headers: Vec<(String, String)>,
}

impl RequestPlan {
    pub fn delay_ms(&self) -> u64 {
        self.delay.as_millis() as u64
    }
}

/// Plan a request using the thread-local RNG.
pub fn plan(
    ctx: RequestContext<'_>,
    config: &AntiDetectionConfig,
    proxies: Option<&ProxyPool>,
) -> Result<RequestPlan, AppError> {
    plan_with_rng(&mut rand::thread_rng(), ctx, config, proxies)
}

pub fn plan_with_rng<R: Rng + ?Sized>(
    rng: &mut R,
    ctx: RequestContext<'_>,
    config: &AntiDetectionConfig,
    proxies: Option<&ProxyPool>,
) -> Result<RequestPlan, AppError> {
    let user_agent = if config.user_agent_rotation {
        if config.user_agents.is_empty() {
            DEFAULT_USER_AGENTS
                .choose(rng)
                .copied()
                .unwrap_or(DEFAULT_USER_AGENT)
                .to_string()
        } else {
            config
                .user_agents
                .choose(rng)
                .cloned()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
        }
    } else {
        config
            .user_agents
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    };

    let proxy = if config.proxy_rotation {
        let picked = proxies.and_then(|pool| pool.pick(rng));
        if picked.is_none() {
            tracing::warn!(url = %ctx.url, "Proxy rotation enabled but no usable proxy");
            return Err(AppError::ProxyUnavailable(ctx.url.to_string()));
        }
        picked
    } else {
        None
    };

    let (min, max) = (config.delay.min, config.delay.max);
    let delay_ms = if min >= max {
        min
    } else {
        rng.gen_range(min..=max)
    };

    let plan = RequestPlan {
        user_agent,
        proxy,
        delay: Duration::from_millis(delay_ms),
        headers: level_headers(config.level),
    };
    tracing::debug!(
        url = %ctx.url,
        page = ctx.page,
        delay_ms,
        proxy = ?plan.proxy,
        "Planned request"
    );
    Ok(plan)
}

fn level_headers(level: DetectionLevel) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    if matches!(level, DetectionLevel::Medium | DetectionLevel::High) {
        headers.push((
            "Accept".into(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into(),
        ));
        headers.push(("Accept-Language".into(), "en-US,en;q=0.9".into()));
    }
    if level == DetectionLevel::High {
        headers.push(("DNT".into(), "1".into()));
        headers.push(("Upgrade-Insecure-Requests".into(), "1".into()));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DelayRange;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    fn ctx() -> RequestContext<'static> {
        RequestContext {
            url: "https://ex.com/",
            page: 1,
        }
    }

    fn config(rotation: bool, min: u64, max: u64) -> AntiDetectionConfig {
        AntiDetectionConfig {
            user_agent_rotation: rotation,
            delay: DelayRange { min, max },
            ..AntiDetectionConfig::default()
        }
    }

    #[test]
    fn test_fixed_user_agent_without_rotation() {
        let plan = plan(ctx(), &config(false, 0, 0), None).unwrap();
        assert_eq!(plan.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(plan.delay, Duration::ZERO);
        assert!(plan.headers.is_empty());

        let mut cfg = config(false, 0, 0);
        cfg.user_agents = vec!["custom/1.0".into(), "custom/2.0".into()];
        assert_eq!(super::plan(ctx(), &cfg, None).unwrap().user_agent, "custom/1.0");
    }

    #[test]
    fn test_rotation_draws_from_configured_pool() {
        let mut cfg = config(true, 0, 0);
        cfg.user_agents = vec!["a".into(), "b".into(), "c".into()];
        let mut rng = StdRng::seed_from_u64(42);
        let seen: HashSet<String> = (0..200)
            .map(|_| plan_with_rng(&mut rng, ctx(), &cfg, None).unwrap().user_agent)
            .collect();
        assert_eq!(seen, HashSet::from(["a".into(), "b".into(), "c".into()]));
    }

    #[test]
    fn test_rotation_falls_back_to_builtin_pool() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let ua = plan_with_rng(&mut rng, ctx(), &config(true, 0, 0), None).unwrap().user_agent;
            assert!(DEFAULT_USER_AGENTS.contains(&ua.as_str()));
        }
    }

    #[test]
    fn test_delay_stays_within_range() {
        let cfg = config(false, 200, 800);
        let mut rng = StdRng::seed_from_u64(9);
        let delays: Vec<u64> = (0..500)
            .map(|_| plan_with_rng(&mut rng, ctx(), &cfg, None).unwrap().delay_ms())
            .collect();
        assert!(delays.iter().all(|d| (200..=800).contains(d)));
        assert!(delays.iter().any(|&d| d < 400));
        assert!(delays.iter().any(|&d| d > 600));
    }

    #[test]
    fn test_proxy_only_when_rotation_enabled() {
        let pool = ProxyPool::new(["http://proxy:8080"]);
        let mut cfg = config(false, 0, 0);
        assert_eq!(plan(ctx(), &cfg, Some(&pool)).unwrap().proxy, None);

        cfg.proxy_rotation = true;
        assert_eq!(
            plan(ctx(), &cfg, Some(&pool)).unwrap().proxy.as_deref(),
            Some("http://proxy:8080")
        );
    }

    #[test]
    fn test_rotation_never_falls_back_to_direct() {
        let mut cfg = config(false, 0, 0);
        cfg.proxy_rotation = true;
        let err = plan(ctx(), &cfg, None).unwrap_err();
        assert!(matches!(err, AppError::ProxyUnavailable(_)));

        let pool = ProxyPool::new(["http://p:1"]).with_cool_down(Duration::from_secs(3600));
        for _ in 0..6 {
            pool.record_outcome("http://p:1", false, Duration::ZERO);
        }
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..100 {
            let planned = plan_with_rng(&mut rng, ctx(), &cfg, Some(&pool));
            assert!(matches!(planned, Err(AppError::ProxyUnavailable(_))));
        }
    }

    #[test]
    fn test_level_headers() {
        let mut cfg = config(false, 0, 0);
        cfg.level = DetectionLevel::None;
        assert!(plan(ctx(), &cfg, None).unwrap().headers.is_empty());

        cfg.level = DetectionLevel::Medium;
        let names: Vec<String> = plan(ctx(), &cfg, None)
            .unwrap()
            .headers
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(names, vec!["Accept", "Accept-Language"]);

        cfg.level = DetectionLevel::High;
        assert_eq!(plan(ctx(), &cfg, None).unwrap().headers.len(), 4);
    }
}
