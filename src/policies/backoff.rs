//! # Retry delays.
//!
//! The delay before retry `n` (0-indexed) is `first × factor^n`, clamped to
//! `max`, then jittered. The base is derived from `n` alone, so jitter never
//! compounds across retries.
//!
//! ```rust
//! use std::time::Duration;
//! use ips_runtime::{BackoffPolicy, JitterPolicy};
//!
//! let portal = BackoffPolicy::default();
//! assert_eq!(portal.next(0), Duration::from_millis(400));
//! assert_eq!(portal.next(1), Duration::from_millis(800));
//!
//! let flat = BackoffPolicy { factor: 1.0, jitter: JitterPolicy::None, ..portal };
//! assert_eq!(flat.next(5), Duration::from_millis(400));
//! ```

use std::time::Duration;

use rand::Rng;

/// Randomization applied on top of the base delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterPolicy {
    /// Exact base delay.
    #[default]
    None,
    /// Uniform in `[0, base]`.
    Full,
    /// `base/2` plus uniform in `[0, base/2]`.
    Equal,
}

impl JitterPolicy {
    /// Applies this jitter to `base`.
    pub fn apply(&self, base: Duration) -> Duration {
        let ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        match self {
            JitterPolicy::None => base,
            JitterPolicy::Full => Duration::from_millis(rng.random_range(0..=ms)),
            JitterPolicy::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rng.random_range(0..=half))
            }
        }
    }
}

/// Exponential retry schedule.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Cap on any single delay.
    pub max: Duration,
    /// Growth per retry (`>= 1.0` for a non-shrinking schedule).
    pub factor: f64,
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// The portal schedule: 0.4s, 0.8s, 1.6s, ... capped at 10s, no jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(400),
            max: Duration::from_secs(10),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `retry` (0-indexed).
    pub fn next(&self, retry: u32) -> Duration {
        let exp = retry.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.jitter.apply(base)
    }

    /// Delays for `retries` consecutive retries.
    pub fn schedule(&self, retries: u32) -> impl Iterator<Item = Duration> + '_ {
        (0..retries).map(move |n| self.next(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(first_ms: u64, max_ms: u64, factor: f64, jitter: JitterPolicy) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(first_ms),
            max: Duration::from_millis(max_ms),
            factor,
            jitter,
        }
    }

    #[test]
    fn test_portal_schedule() {
        let delays: Vec<Duration> = BackoffPolicy::default().schedule(2).collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(400), Duration::from_millis(800)]
        );
    }

    #[test]
    fn test_cap_and_overflow() {
        let p = policy(100, 1_000, 2.0, JitterPolicy::None);
        assert_eq!(p.next(10), Duration::from_secs(1));
        assert_eq!(p.next(u32::MAX), Duration::from_secs(1));
        let p = policy(5_000, 1_000, 2.0, JitterPolicy::None);
        assert_eq!(p.next(0), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_bounds() {
        let full = policy(1_000, 30_000, 1.0, JitterPolicy::Full);
        let equal = policy(1_000, 30_000, 1.0, JitterPolicy::Equal);
        for n in 0..50 {
            assert!(full.next(n) <= Duration::from_millis(1_000));
            let d = equal.next(n);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1_000));
        }
    }
}
