//! # Runtime configuration.
//!
//! Provides [`RuntimeConfig`], the knobs of the framework itself (as opposed to
//! the simulation and platform files, which describe the science run and the
//! machine).
//!
//! ## Sentinel values
//! - `grace = 0s` → do not wait for components on shutdown
//! - `max_pending_events = 0` → topics only shrink through consumer progress
//! - `portal_timeout = 0s` → no per-request HTTP timeout

use std::time::Duration;

use crate::policies::{BackoffPolicy, JitterPolicy};

/// Global configuration for the framework runtime.
///
/// ## Field semantics
/// - `grace`: maximum wait for component actors to stop after cancellation
/// - `bus_capacity`: monitor bus ring buffer size (min 1; clamped by Bus)
/// - `max_pending_events`: per-topic bound that forces a prune sweep (`0` = unbounded)
/// - `portal_backoff`: delay schedule between portal POST attempts
/// - `portal_retries`: retries after the first failed POST
/// - `portal_timeout`: per-request HTTP timeout (`0s` = none)
/// - `log_socket`: open the per-simulation UNIX log socket
///
/// ## Notes
/// Prefer the helper accessors over checking sentinels inline.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Maximum time to wait for component actors after cancellation.
    ///
    /// If exceeded, the run ends with `RuntimeError::GraceExceeded`.
    pub grace: Duration,

    /// Capacity of the monitor bus broadcast channel.
    ///
    /// Sinks that lag behind more than `bus_capacity` records skip the oldest ones.
    pub bus_capacity: usize,

    /// Per-topic pending-event bound.
    ///
    /// When a topic holds more events than this, the oldest ones are dropped
    /// and the listeners that had not read them are reported as lagging.
    pub max_pending_events: usize,

    /// Back-off between portal POST attempts.
    pub portal_backoff: BackoffPolicy,

    /// Number of retries after a failed portal POST.
    pub portal_retries: u32,

    /// Timeout for a single portal POST.
    pub portal_timeout: Duration,

    /// Whether each simulation gets a UNIX log socket.
    pub log_socket: bool,
}

impl RuntimeConfig {
    /// Returns the topic bound as an `Option`.
    ///
    /// - `None` → unbounded
    /// - `Some(n)` → prune sweep once a topic holds more than `n` events
    #[inline]
    pub fn pending_event_limit(&self) -> Option<usize> {
        if self.max_pending_events == 0 {
            None
        } else {
            Some(self.max_pending_events)
        }
    }

    /// Returns the portal request timeout as an `Option`.
    #[inline]
    pub fn portal_request_timeout(&self) -> Option<Duration> {
        if self.portal_timeout == Duration::ZERO {
            None
        } else {
            Some(self.portal_timeout)
        }
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for RuntimeConfig {
    /// Default configuration:
    ///
    /// - `grace = 30s`
    /// - `bus_capacity = 1024`
    /// - `max_pending_events = 10_000`
    /// - `portal_backoff`: 0.4s, doubling, capped at 10s, no jitter
    /// - `portal_retries = 2` (attempts at 0s, +0.4s, +0.8s)
    /// - `portal_timeout = 10s`
    /// - `log_socket = true`
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            bus_capacity: 1024,
            max_pending_events: 10_000,
            portal_backoff: BackoffPolicy {
                first: Duration::from_millis(400),
                max: Duration::from_secs(10),
                factor: 2.0,
                jitter: JitterPolicy::None,
            },
            portal_retries: 2,
            portal_timeout: Duration::from_secs(10),
            log_socket: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_portal_schedule() {
        let cfg = RuntimeConfig::default();
        let delays: Vec<Duration> = (0..cfg.portal_retries)
            .map(|n| cfg.portal_backoff.next(n))
            .collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(400), Duration::from_millis(800)]
        );
    }

    #[test]
    fn test_sentinels() {
        let mut cfg = RuntimeConfig::default();
        cfg.max_pending_events = 0;
        cfg.portal_timeout = Duration::ZERO;
        cfg.bus_capacity = 0;
        assert_eq!(cfg.pending_event_limit(), None);
        assert_eq!(cfg.portal_request_timeout(), None);
        assert_eq!(cfg.bus_capacity_clamped(), 1);
    }
}
