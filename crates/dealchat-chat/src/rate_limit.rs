//! Fixed-window rate limiting keyed by caller.
//!
//! Each key gets an atomic counter per window. A check increments the
//! counter and compares the new value against the limit in one step, so
//! concurrent checks on the same key can never both see the last slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use dealchat_core::clock::Clock;
use dealchat_core::types::{Identity, RateDecision, RateWindow};

/// Counter windows are pruned once this many keys are tracked.
const PRUNE_THRESHOLD: usize = 1024;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request against `window` and report whether it is allowed.
    async fn check(&self, window: &RateWindow) -> RateDecision;
}

/// The subject a rate-limit key is built from: the caller's identity when
/// known, otherwise their network origin.
pub fn rate_subject(identity: Option<&Identity>, origin: &str) -> String {
    match identity {
        Some(id) => format!("user:{}", id),
        None => format!("ip:{}", origin),
    }
}

struct WindowCounter {
    index: u64,
    window_ms: u64,
    count: Arc<AtomicU64>,
}

/// In-process fixed-window limiter.
pub struct FixedWindowLimiter {
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<String, WindowCounter>>,
}

impl FixedWindowLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the counter for the key's current window, starting a fresh one
    /// when the window has rolled over.
    fn counter_for(&self, key: &str, index: u64, window_ms: u64) -> Arc<AtomicU64> {
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if counters.len() >= PRUNE_THRESHOLD {
            let now_ms = self.clock.now().timestamp_millis().max(0) as u64;
            counters.retain(|_, c| c.index == now_ms / c.window_ms);
        }

        let entry = counters
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter {
                index,
                window_ms,
                count: Arc::new(AtomicU64::new(0)),
            });
        if entry.index != index || entry.window_ms != window_ms {
            *entry = WindowCounter {
                index,
                window_ms,
                count: Arc::new(AtomicU64::new(0)),
            };
        }
        Arc::clone(&entry.count)
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn check(&self, window: &RateWindow) -> RateDecision {
        let window_ms = window.window_ms.max(1);
        let now_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let index = now_ms / window_ms;

        let counter = self.counter_for(&window.key, index, window_ms);
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;

        let reset_ms = (index + 1) * window_ms;
        RateDecision {
            allowed: count <= window.limit,
            limit: window.limit,
            remaining: window.limit.saturating_sub(count),
            reset_at: Utc
                .timestamp_millis_opt(reset_ms as i64)
                .single()
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealchat_core::clock::ManualClock;

    fn limiter_at(ms: i64) -> (Arc<ManualClock>, FixedWindowLimiter) {
        let clock = Arc::new(ManualClock::new(ms));
        let limiter = FixedWindowLimiter::new(clock.clone());
        (clock, limiter)
    }

    #[tokio::test]
    async fn test_eleventh_call_is_denied_then_window_resets() {
        let (clock, limiter) = limiter_at(1_000);
        let window = RateWindow::new("user:alice", 10, 60_000);

        for i in 0..10 {
            let decision = limiter.check(&window).await;
            assert!(decision.allowed, "call {} should pass", i + 1);
            assert_eq!(decision.remaining, 9 - i);
        }

        let denied = limiter.check(&window).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.limit, 10);
        assert_eq!(denied.reset_at.timestamp_millis(), 60_000);

        clock.advance_ms(60_000);
        let after = limiter.check(&window).await;
        assert!(after.allowed);
        assert_eq!(after.remaining, 9);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (_clock, limiter) = limiter_at(0);
        let a = RateWindow::new("user:a", 1, 1_000);
        let b = RateWindow::new("user:b", 1, 1_000);

        assert!(limiter.check(&a).await.allowed);
        assert!(!limiter.check(&a).await.allowed);
        assert!(limiter.check(&b).await.allowed);
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_exceed_limit() {
        let (_clock, limiter) = limiter_at(0);
        let limiter = Arc::new(limiter);
        let window = RateWindow::new("ip:1.2.3.4", 25, 60_000);

        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = Arc::clone(&limiter);
            let window = window.clone();
            handles.push(tokio::spawn(async move { limiter.check(&window).await.allowed }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 25);
    }

    #[tokio::test]
    async fn test_zero_window_is_treated_as_one_ms() {
        let (_clock, limiter) = limiter_at(5);
        let decision = limiter.check(&RateWindow::new("k", 1, 0)).await;
        assert!(decision.allowed);
        assert_eq!(decision.reset_at.timestamp_millis(), 6);
    }

    #[tokio::test]
    async fn test_stale_windows_are_pruned() {
        let (clock, limiter) = limiter_at(0);
        for i in 0..PRUNE_THRESHOLD {
            limiter
                .check(&RateWindow::new(format!("k{}", i), 5, 1_000))
                .await;
        }
        clock.advance_ms(5_000);
        limiter.check(&RateWindow::new("fresh", 5, 1_000)).await;
        assert_eq!(limiter.counters.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rate_subject_prefers_identity() {
        let alice = Identity::new("alice");
        assert_eq!(rate_subject(Some(&alice), "10.0.0.1"), "user:alice");
        assert_eq!(rate_subject(None, "10.0.0.1"), "ip:10.0.0.1");
    }
}
