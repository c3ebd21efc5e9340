//! Shared usage quotas and admission control.
//!
//! Counters live in concurrency-safe maps injected into the router and
//! workers (never module-level globals), so the tracker is independently
//! testable and swappable for a persistent backend.

pub mod pricing;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;

/// Days of daily usage buckets kept before opportunistic pruning.
const BUCKET_RETENTION_DAYS: i64 = 7;

/// Quota limits evaluated at admission time.
#[derive(Debug, Clone)]
pub struct QuotaLimits {
    pub max_daily_tokens: i64,
    pub max_daily_cost_usd: f64,
    pub max_concurrent_sessions: usize,
    /// Active-session entries older than this are considered leaked
    /// (worker crashed without an end) and reaped.
    pub active_session_ttl_minutes: i64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_daily_tokens: 1_000_000,
            max_daily_cost_usd: 50.0,
            max_concurrent_sessions: 10,
            active_session_ttl_minutes: 60,
        }
    }
}

/// Aggregate usage for one UTC day.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DayUsage {
    pub total_tokens: i64,
    pub total_cost: f64,
    pub api_calls: i64,
    pub session_count: i64,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub remaining_tokens: i64,
    pub remaining_cost: f64,
    pub active_sessions: usize,
}

/// Concurrency-safe token/cost/session counters with an admission gate.
pub struct QuotaTracker {
    limits: QuotaLimits,
    /// UTC day key ("YYYY-MM-DD") -> usage. Rollover simply starts a
    /// fresh bucket; old buckets are pruned opportunistically.
    buckets: DashMap<String, DayUsage>,
    /// Active session id -> start time (the timestamp enables TTL
    /// reconciliation of slots leaked by crashed workers).
    active: DashMap<String, DateTime<Utc>>,
}

impl QuotaTracker {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            buckets: DashMap::new(),
            active: DashMap::new(),
        }
    }

    fn day_key(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%d").to_string()
    }

    fn today_usage(&self) -> DayUsage {
        self.buckets
            .get(&Self::day_key(Utc::now()))
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    /// Admission check. Evaluation order: token limit, then cost limit,
    /// then concurrency; the first violated limit becomes the reason.
    /// Never mutates any counter.
    pub fn check(&self) -> AdmissionDecision {
        let usage = self.today_usage();
        let active = self.active.len();
        let remaining_tokens = (self.limits.max_daily_tokens - usage.total_tokens).max(0);
        let remaining_cost = (self.limits.max_daily_cost_usd - usage.total_cost).max(0.0);

        let reason = if usage.total_tokens >= self.limits.max_daily_tokens {
            Some("Daily token limit exceeded".to_string())
        } else if usage.total_cost >= self.limits.max_daily_cost_usd {
            Some("Daily cost limit exceeded".to_string())
        } else if active >= self.limits.max_concurrent_sessions {
            Some("Concurrent session limit reached".to_string())
        } else {
            None
        };

        AdmissionDecision {
            allowed: reason.is_none(),
            reason,
            remaining_tokens,
            remaining_cost,
            active_sessions: active,
        }
    }

    /// Atomically accumulate a completed turn's usage into today's
    /// bucket. Safe under concurrent completions from different sessions.
    pub fn record_usage(&self, session_id: &str, tokens: i64, cost: f64, api_calls: i64) {
        let key = Self::day_key(Utc::now());
        let mut entry = self.buckets.entry(key).or_default();
        entry.total_tokens += tokens.max(0);
        entry.total_cost += cost.max(0.0);
        entry.api_calls += api_calls.max(0);
        debug!(
            "session {}: recorded usage tokens={} cost=${:.4} calls={}",
            session_id, tokens, cost, api_calls
        );
    }

    /// Claim a concurrency slot for a session.
    pub fn start_session(&self, session_id: &str) {
        self.active.insert(session_id.to_string(), Utc::now());
        let key = Self::day_key(Utc::now());
        self.buckets.entry(key).or_default().session_count += 1;
    }

    /// Release a session's concurrency slot. Safe to call repeatedly.
    pub fn end_session(&self, session_id: &str) {
        self.active.remove(session_id);
    }

    pub fn active_sessions(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.contains_key(session_id)
    }

    /// Drop day buckets past the retention window.
    pub fn prune_old_buckets(&self) {
        let cutoff = (Utc::now() - Duration::days(BUCKET_RETENTION_DAYS)).date_naive();
        self.buckets.retain(|key, _| {
            key.parse::<NaiveDate>()
                .map(|day| day >= cutoff)
                .unwrap_or(false)
        });
    }

    /// Reap active-session entries older than the TTL: a worker that
    /// crashed without a matching end would otherwise hold its
    /// concurrency slot forever. Returns the reaped ids.
    pub fn reap_stale(&self) -> Vec<String> {
        let cutoff = Utc::now() - Duration::minutes(self.limits.active_session_ttl_minutes);
        let stale: Vec<String> = self
            .active
            .iter()
            .filter(|entry| *entry.value() < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &stale {
            warn!("session {}: reclaiming leaked concurrency slot", id);
            self.active.remove(id);
        }
        if !stale.is_empty() {
            info!("reclaimed {} leaked session slot(s)", stale.len());
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_check_allows_under_limits() {
        let tracker = QuotaTracker::new(QuotaLimits::default());
        let decision = tracker.check();
        assert!(decision.allowed);
        assert!(decision.reason.is_none());
        assert_eq!(decision.active_sessions, 0);
    }

    #[test]
    fn test_token_limit_reported_before_cost() {
        let tracker = QuotaTracker::new(QuotaLimits {
            max_daily_tokens: 100,
            max_daily_cost_usd: 1.0,
            ..Default::default()
        });
        // Violate both limits; token must win the evaluation order.
        tracker.record_usage("s", 500, 5.0, 1);

        let decision = tracker.check();
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("Daily token limit exceeded"));
        assert_eq!(decision.remaining_tokens, 0);
    }

    #[test]
    fn test_cost_limit_reported_before_concurrency() {
        let tracker = QuotaTracker::new(QuotaLimits {
            max_daily_cost_usd: 1.0,
            max_concurrent_sessions: 0,
            ..Default::default()
        });
        tracker.record_usage("s", 10, 2.0, 1);

        let decision = tracker.check();
        assert_eq!(decision.reason.as_deref(), Some("Daily cost limit exceeded"));
    }

    #[test]
    fn test_concurrency_limit() {
        let tracker = QuotaTracker::new(QuotaLimits {
            max_concurrent_sessions: 1,
            ..Default::default()
        });
        tracker.start_session("a");

        let decision = tracker.check();
        assert!(!decision.allowed);
        assert_eq!(
            decision.reason.as_deref(),
            Some("Concurrent session limit reached")
        );

        tracker.end_session("a");
        assert!(tracker.check().allowed);
    }

    #[test]
    fn test_check_does_not_mutate() {
        let tracker = QuotaTracker::new(QuotaLimits::default());
        for _ in 0..5 {
            tracker.check();
        }
        assert_eq!(tracker.today_usage().total_tokens, 0);
        assert_eq!(tracker.active_sessions(), 0);
    }

    #[test]
    fn test_end_session_is_idempotent() {
        let tracker = QuotaTracker::new(QuotaLimits::default());
        tracker.start_session("a");
        tracker.end_session("a");
        tracker.end_session("a");
        assert_eq!(tracker.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_usage_recording_loses_no_updates() {
        let tracker = Arc::new(QuotaTracker::new(QuotaLimits::default()));
        let mut handles = Vec::new();
        for i in 0..50 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.record_usage(&format!("s{}", i), 10, 0.01, 1);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let usage = tracker.today_usage();
        assert_eq!(usage.total_tokens, 500);
        assert_eq!(usage.api_calls, 50);
        assert!((usage.total_cost - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_prune_drops_old_buckets() {
        let tracker = QuotaTracker::new(QuotaLimits::default());
        tracker
            .buckets
            .insert("2020-01-01".to_string(), DayUsage::default());
        tracker.record_usage("s", 1, 0.0, 1);

        tracker.prune_old_buckets();
        assert!(!tracker.buckets.contains_key("2020-01-01"));
        assert_eq!(tracker.today_usage().total_tokens, 1);
    }

    #[test]
    fn test_reap_stale_releases_leaked_slots() {
        let tracker = QuotaTracker::new(QuotaLimits {
            active_session_ttl_minutes: 60,
            ..Default::default()
        });
        tracker.start_session("fresh");
        tracker
            .active
            .insert("leaked".to_string(), Utc::now() - Duration::hours(2));

        let reaped = tracker.reap_stale();
        assert_eq!(reaped, vec!["leaked".to_string()]);
        assert!(tracker.is_active("fresh"));
        assert_eq!(tracker.active_sessions(), 1);
    }
}
