//! Per-source exponential backoff for blocked listings.
//!
//! Each consecutive BLOCKED result escalates the source one step. Delays never
//! decrease while escalating and never exceed the ceiling. A single OK result,
//! a manual reset, or `reset_after_secs` without a new block drops the source
//! back to the floor.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use changewatch_shared::{BackoffConfig, MAX_BACKOFF_CEILING_SECS};
use rand::Rng;

#[derive(Debug, Clone, Copy)]
struct Entry {
    step: u32,
    delay: Duration,
    until: Instant,
    last_blocked_at: Instant,
}

/// Thread-safe per-source backoff tracker.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffConfig,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Backoff {
    /// The ceiling is clamped to [`MAX_BACKOFF_CEILING_SECS`].
    pub fn new(mut policy: BackoffConfig) -> Self {
        policy.ceiling_secs = policy.ceiling_secs.min(MAX_BACKOFF_CEILING_SECS);
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Escalate after a BLOCKED result. Returns the delay before the next attempt.
    pub fn record_blocked(&self, source_id: &str, now: Instant) -> Duration {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let previous = entries
            .get(source_id)
            .copied()
            .filter(|e| !self.expired(e, now));
        let step = previous.map_or(0, |e| e.step) + 1;
        let floor_delay = previous.map_or(Duration::ZERO, |e| e.delay);

        let ceiling = self.policy.ceiling_secs as f64;
        let raw = (self.policy.floor_secs as f64
            * self.policy.multiplier.powi(step.saturating_sub(1) as i32))
        .min(ceiling);
        let jitter = if self.policy.jitter_ratio > 0.0 {
            rand::thread_rng().gen_range(0.0..=raw * self.policy.jitter_ratio)
        } else {
            0.0
        };
        let delay = Duration::from_secs_f64((raw + jitter).min(ceiling)).max(floor_delay);

        entries.insert(
            source_id.to_string(),
            Entry {
                step,
                delay,
                until: now + delay,
                last_blocked_at: now,
            },
        );
        delay
    }

    /// An OK result resets the source to the floor.
    pub fn record_ok(&self, source_id: &str) {
        self.reset(source_id);
    }

    /// Manual reset.
    pub fn reset(&self, source_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(source_id);
    }

    /// Time left before the source may be polled again, if backing off.
    pub fn remaining(&self, source_id: &str, now: Instant) -> Option<Duration> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = *entries.get(source_id)?;
        if self.expired(&entry, now) {
            entries.remove(source_id);
            return None;
        }
        entry.until.checked_duration_since(now).filter(|d| !d.is_zero())
    }

    /// Current escalation step (0 when not backing off).
    pub fn step(&self, source_id: &str) -> u32 {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(source_id)
            .map_or(0, |e| e.step)
    }

    fn expired(&self, entry: &Entry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_blocked_at)
            >= Duration::from_secs(self.policy.reset_after_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffConfig {
        BackoffConfig {
            floor_secs: 10,
            ceiling_secs: 100,
            multiplier: 2.0,
            jitter_ratio: 0.5,
            reset_after_secs: 3600,
        }
    }

    #[test]
    fn consecutive_blocks_are_non_decreasing_to_ceiling() {
        let backoff = Backoff::new(policy());
        let now = Instant::now();

        let mut last = Duration::ZERO;
        for i in 1..=12 {
            let d = backoff.record_blocked("demo", now);
            assert!(d >= last, "step {i}: {d:?} < {last:?}");
            assert!(d <= Duration::from_secs(100));
            last = d;
        }
        assert_eq!(last, Duration::from_secs(100));
        assert_eq!(backoff.step("demo"), 12);
    }

    #[test]
    fn unbounded_ceiling_is_clamped() {
        let mut p = policy();
        p.ceiling_secs = u64::MAX;
        p.multiplier = 10.0;
        let backoff = Backoff::new(p);
        let now = Instant::now();

        let mut last = Duration::ZERO;
        for _ in 0..40 {
            last = backoff.record_blocked("demo", now);
        }
        assert_eq!(last, Duration::from_secs(MAX_BACKOFF_CEILING_SECS));
        assert_eq!(backoff.remaining("demo", now), Some(last));
    }

    #[test]
    fn first_block_starts_at_floor() {
        let mut p = policy();
        p.jitter_ratio = 0.0;
        let backoff = Backoff::new(p);
        let d = backoff.record_blocked("demo", Instant::now());
        assert_eq!(d, Duration::from_secs(10));
        let d = backoff.record_blocked("demo", Instant::now());
        assert_eq!(d, Duration::from_secs(20));
    }

    #[test]
    fn ok_resets_to_floor() {
        let mut p = policy();
        p.jitter_ratio = 0.0;
        let backoff = Backoff::new(p);
        let now = Instant::now();
        backoff.record_blocked("demo", now);
        backoff.record_blocked("demo", now);
        backoff.record_blocked("demo", now);
        assert_eq!(backoff.step("demo"), 3);

        backoff.record_ok("demo");
        assert_eq!(backoff.step("demo"), 0);
        assert!(backoff.remaining("demo", now).is_none());
        assert_eq!(backoff.record_blocked("demo", now), Duration::from_secs(10));
    }

    #[test]
    fn remaining_counts_down() {
        let mut p = policy();
        p.jitter_ratio = 0.0;
        let backoff = Backoff::new(p);
        let now = Instant::now();
        backoff.record_blocked("demo", now);

        assert_eq!(backoff.remaining("demo", now), Some(Duration::from_secs(10)));
        assert_eq!(
            backoff.remaining("demo", now + Duration::from_secs(4)),
            Some(Duration::from_secs(6))
        );
        assert!(backoff.remaining("demo", now + Duration::from_secs(10)).is_none());
        // escalation is remembered after the wait elapses
        assert_eq!(backoff.step("demo"), 1);
    }

    #[test]
    fn time_boxed_reset() {
        let mut p = policy();
        p.reset_after_secs = 60;
        let backoff = Backoff::new(p);
        let now = Instant::now();
        backoff.record_blocked("demo", now);
        backoff.record_blocked("demo", now);

        let later = now + Duration::from_secs(61);
        assert!(backoff.remaining("demo", later).is_none());
        assert_eq!(backoff.step("demo"), 0);
    }

    #[test]
    fn sources_are_independent() {
        let backoff = Backoff::new(policy());
        let now = Instant::now();
        backoff.record_blocked("a", now);
        assert_eq!(backoff.step("a"), 1);
        assert_eq!(backoff.step("b"), 0);
        assert!(backoff.remaining("b", now).is_none());
    }
}
