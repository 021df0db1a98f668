use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Requests allowed per fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    pub limit: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

impl LimitRule {
    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window_secs: 60,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for LimitRule {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

/// Default limit plus per operation-kind overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub default: LimitRule,
    #[serde(default)]
    pub per_kind: HashMap<String, LimitRule>,
}

impl RateLimitConfig {
    pub fn rule_for(&self, kind: &str) -> LimitRule {
        self.per_kind.get(kind).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    window_start: Instant,
    window: Duration,
}

/// Fixed-window counters keyed by `actor:kind`.
///
/// Each key is updated under its map-entry lock, so concurrent callers on the
/// same key never push the count past `limit`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Arc<DashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(DashMap::new()),
        }
    }

    pub fn new_per_minute(limit: u32) -> Self {
        Self::new(RateLimitConfig {
            default: LimitRule::per_minute(limit),
            per_kind: HashMap::new(),
        })
    }

    pub fn bucket_key(actor_id: &str, kind: &str) -> String {
        format!("{actor_id}:{kind}")
    }

    /// Check the configured rule for `kind` and count the request.
    pub fn check_operation(&self, actor_id: &str, kind: &str) -> RateDecision {
        let rule = self.config.rule_for(kind);
        self.check_and_increment(&Self::bucket_key(actor_id, kind), rule.limit, rule.window())
    }

    pub fn check_and_increment(&self, key: &str, limit: u32, window: Duration) -> RateDecision {
        self.check_at(key, limit, window, Instant::now())
    }

    /// Same as [`check_and_increment`](Self::check_and_increment) against an explicit clock.
    pub fn check_at(&self, key: &str, limit: u32, window: Duration, now: Instant) -> RateDecision {
        if limit == 0 {
            return RateDecision::Denied {
                retry_after: window,
            };
        }

        let mut entry = self.buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            window_start: now,
            window,
        });
        let bucket = entry.value_mut();

        if bucket.count == 0 || now.saturating_duration_since(bucket.window_start) >= window {
            bucket.count = 1;
            bucket.window_start = now;
            bucket.window = window;
            return RateDecision::Allowed {
                remaining: limit - 1,
            };
        }

        if bucket.count < limit {
            bucket.count += 1;
            return RateDecision::Allowed {
                remaining: limit - bucket.count,
            };
        }

        let retry_after = (bucket.window_start + window).saturating_duration_since(now);
        debug!(key, count = bucket.count, limit, "rate limit window exhausted");
        RateDecision::Denied { retry_after }
    }

    /// Requests counted in the current window for `key`.
    pub fn count(&self, key: &str) -> Option<u32> {
        self.buckets.get(key).map(|b| b.count)
    }

    /// Drop buckets whose window has elapsed; they would be reset on next use anyway.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.window_start) < b.window);
        before.saturating_sub(self.buckets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_after_limit_with_positive_retry_after() {
        let limiter = RateLimiter::new_per_minute(3);
        let window = Duration::from_secs(60);
        let start = Instant::now();

        for i in 0..3 {
            let decision = limiter.check_at("u1:content.create", 3, window, start + Duration::from_secs(i));
            assert!(decision.is_allowed());
        }
        match limiter.check_at("u1:content.create", 3, window, start + Duration::from_secs(10)) {
            RateDecision::Denied { retry_after } => assert_eq!(retry_after, Duration::from_secs(50)),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn window_elapse_resets_counter_to_one() {
        let limiter = RateLimiter::new_per_minute(2);
        let window = Duration::from_secs(60);
        let start = Instant::now();

        assert!(limiter.check_at("k", 2, window, start).is_allowed());
        assert!(limiter.check_at("k", 2, window, start).is_allowed());
        assert!(!limiter.check_at("k", 2, window, start + Duration::from_secs(59)).is_allowed());

        let later = start + window;
        assert_eq!(
            limiter.check_at("k", 2, window, later),
            RateDecision::Allowed { remaining: 1 }
        );
        assert_eq!(limiter.count("k"), Some(1));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new_per_minute(1);
        assert!(limiter.check_operation("alice", "content.create").is_allowed());
        assert!(!limiter.check_operation("alice", "content.create").is_allowed());
        assert!(limiter.check_operation("bob", "content.create").is_allowed());
        assert!(limiter.check_operation("alice", "content.delete").is_allowed());
    }

    #[test]
    fn zero_limit_always_denies() {
        let limiter = RateLimiter::new_per_minute(0);
        assert!(!limiter.check_operation("alice", "keys.rotate").is_allowed());
    }

    #[test]
    fn per_kind_rule_overrides_default() {
        let mut config = RateLimitConfig::default();
        config.per_kind.insert("media.upload".into(), LimitRule::per_minute(1));
        let limiter = RateLimiter::new(config);

        assert!(limiter.check_operation("alice", "media.upload").is_allowed());
        assert!(!limiter.check_operation("alice", "media.upload").is_allowed());
        assert!(limiter.check_operation("alice", "content.create").is_allowed());
    }

    #[test]
    fn purge_drops_elapsed_buckets() {
        let limiter = RateLimiter::new_per_minute(5);
        limiter.check_and_increment("short", 5, Duration::from_millis(1));
        limiter.check_and_increment("long", 5, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(limiter.purge_expired(), 1);
        assert!(limiter.count("short").is_none());
        assert_eq!(limiter.count("long"), Some(1));
    }

    #[tokio::test]
    async fn concurrent_callers_never_exceed_limit() {
        let limiter = RateLimiter::new_per_minute(25);
        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check_operation("alice", "widget.update").is_allowed()
            }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 25);
    }
}
