// Sliding-window admission control for user-initiated actions

//! # Rate Guard
//!
//! The rate guard limits how often an action (keyed by name, for example
//! `"start-execution"`) may be initiated. Each key keeps its own list of
//! admission timestamps; an action is admitted while fewer than `limit` of
//! those timestamps fall inside the trailing window.
//!
//! The guard is consulted before a request is sent. It never looks at
//! inbound events.
//!
//! ## Rust Learning Notes:
//!
//! ### VecDeque for Sliding Windows
//! Timestamps are appended at the back and evicted from the front, so a
//! `VecDeque` gives O(1) at both ends. Because admissions are always
//! appended in time order, the front is always the oldest entry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::clock::{Clock, SystemClock};

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub admitted: bool,

    /// Slots left in the current window after this call
    pub remaining: u32,

    /// Milliseconds until the next slot frees up, when rejected
    pub retry_after_ms: Option<u64>,
}

/// Timestamps of admitted actions for one key
#[derive(Debug, Clone, Default)]
pub struct RateWindow {
    pub action_timestamps: VecDeque<DateTime<Utc>>,
    pub limit: u32,
    pub window_duration_ms: u64,
}

impl RateWindow {
    fn evict(&mut self, now: DateTime<Utc>, window_ms: u64) {
        while let Some(oldest) = self.action_timestamps.front() {
            if elapsed_ms(*oldest, now) >= window_ms {
                self.action_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn evaluate(&self, now: DateTime<Utc>, limit: u32, window_ms: u64) -> Admission {
        let in_window = self.action_timestamps.len();
        if in_window < limit as usize {
            return Admission {
                admitted: true,
                remaining: limit - in_window as u32 - 1,
                retry_after_ms: None,
            };
        }

        // After a lower limit the window may hold more than `limit` entries;
        // a slot opens once all but `limit - 1` of them have expired.
        let blocking = match limit {
            0 => None,
            limit => self.action_timestamps.get(in_window - limit as usize),
        };
        let retry_after_ms = match blocking {
            Some(admitted_at) => window_ms.saturating_sub(elapsed_ms(*admitted_at, now)),
            None => window_ms,
        };

        Admission {
            admitted: false,
            remaining: 0,
            retry_after_ms: Some(retry_after_ms.max(1)),
        }
    }
}

/// Milliseconds from `since` to `now`, zero if the clock went backwards
fn elapsed_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from((now - since).num_milliseconds()).unwrap_or(0)
}

/// Per-key sliding-window counter
pub struct RateGuard {
    windows: HashMap<String, RateWindow>,
    clock: Arc<dyn Clock>,
}

impl RateGuard {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: HashMap::new(),
            clock,
        }
    }

    /// Try to admit one action for `key`
    ///
    /// An admitted call records the current time; a rejected call records
    /// nothing. Timestamps older than the window are evicted either way.
    pub fn try_admit(&mut self, key: &str, limit: u32, window_ms: u64) -> Admission {
        let now = self.clock.now();
        let window = self.windows.entry(key.to_string()).or_default();
        window.limit = limit;
        window.window_duration_ms = window_ms;
        window.evict(now, window_ms);

        let admission = window.evaluate(now, limit, window_ms);
        if admission.admitted {
            window.action_timestamps.push_back(now);
        } else {
            tracing::debug!(
                "Rate guard rejected '{}' ({} per {}ms), retry after {:?}ms",
                key,
                limit,
                window_ms,
                admission.retry_after_ms
            );
        }
        admission
    }

    /// Report what `try_admit` would return without recording anything
    pub fn peek(&self, key: &str, limit: u32, window_ms: u64) -> Admission {
        let now = self.clock.now();
        let mut window = self.windows.get(key).cloned().unwrap_or_default();
        window.evict(now, window_ms);
        window.evaluate(now, limit, window_ms)
    }

    /// Forget every timestamp recorded for `key`
    pub fn reset(&mut self, key: &str) {
        self.windows.remove(key);
    }

    pub fn window(&self, key: &str) -> Option<&RateWindow> {
        self.windows.get(key)
    }
}

impl Default for RateGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::ManualClock;

    fn guard() -> (RateGuard, ManualClock) {
        let clock = ManualClock::default();
        (RateGuard::with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_third_call_in_window_rejected() {
        let (mut guard, clock) = guard();

        let first = guard.try_admit("start", 2, 1000);
        clock.advance_ms(100);
        let second = guard.try_admit("start", 2, 1000);
        clock.advance_ms(100);
        let third = guard.try_admit("start", 2, 1000);

        assert!(first.admitted);
        assert_eq!(first.remaining, 1);
        assert!(second.admitted);
        assert_eq!(second.remaining, 0);
        assert!(!third.admitted);
        assert_eq!(third.retry_after_ms, Some(800));
    }

    #[test]
    fn test_window_readmits_after_elapsed() {
        let (mut guard, clock) = guard();

        assert!(guard.try_admit("start", 1, 1000).admitted);
        clock.advance_ms(999);
        let rejected = guard.try_admit("start", 1, 1000);
        assert!(!rejected.admitted);
        assert_eq!(rejected.retry_after_ms, Some(1));

        clock.advance_ms(1);
        assert!(guard.try_admit("start", 1, 1000).admitted);
    }

    #[test]
    fn test_exactly_limit_admitted() {
        let (mut guard, _clock) = guard();
        let admitted = (0..5)
            .map(|_| guard.try_admit("start", 3, 60_000))
            .filter(|a| a.admitted)
            .count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_keys_are_independent() {
        let (mut guard, _clock) = guard();
        assert!(guard.try_admit("start", 1, 1000).admitted);
        assert!(guard.try_admit("export", 1, 1000).admitted);
        assert!(!guard.try_admit("start", 1, 1000).admitted);
    }

    #[test]
    fn test_rejection_does_not_record() {
        let (mut guard, _clock) = guard();
        guard.try_admit("start", 1, 1000);
        guard.try_admit("start", 1, 1000);
        guard.try_admit("start", 1, 1000);
        assert_eq!(guard.window("start").unwrap().action_timestamps.len(), 1);
    }

    #[test]
    fn test_peek_and_reset() {
        let (mut guard, _clock) = guard();
        assert!(guard.peek("start", 1, 1000).admitted);
        guard.try_admit("start", 1, 1000);

        let peeked = guard.peek("start", 1, 1000);
        assert!(!peeked.admitted);
        assert_eq!(guard.window("start").unwrap().action_timestamps.len(), 1);

        guard.reset("start");
        assert!(guard.try_admit("start", 1, 1000).admitted);
    }

    #[test]
    fn test_zero_limit_always_rejects() {
        let (mut guard, _clock) = guard();
        let admission = guard.try_admit("start", 0, 500);
        assert!(!admission.admitted);
        assert_eq!(admission.retry_after_ms, Some(500));
    }

    #[test]
    fn test_huge_window_still_enforced() {
        let (mut guard, clock) = guard();

        for window_ms in [u64::MAX, 1 << 62] {
            guard.reset("start");
            assert!(guard.try_admit("start", 1, window_ms).admitted);
            clock.advance_ms(60_000);

            let rejected = guard.try_admit("start", 1, window_ms);
            assert!(!rejected.admitted);
            assert_eq!(rejected.retry_after_ms, Some(window_ms - 60_000));
        }
    }

    #[test]
    fn test_retry_hint_after_limit_shrinks() {
        let (mut guard, clock) = guard();
        for _ in 0..5 {
            assert!(guard.try_admit("start", 5, 1000).admitted);
            clock.advance_ms(100);
        }

        // t=500, entries at 0..=400; the one at 300 must expire first
        let rejected = guard.try_admit("start", 2, 1000);
        assert!(!rejected.admitted);
        assert_eq!(rejected.retry_after_ms, Some(800));

        clock.advance_ms(799);
        assert!(!guard.try_admit("start", 2, 1000).admitted);
        clock.advance_ms(1);
        assert!(guard.try_admit("start", 2, 1000).admitted);
    }
}
