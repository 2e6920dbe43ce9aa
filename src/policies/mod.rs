//! Retry policies.
//!
//! Portal records are posted over HTTP; a failed POST is retried on a
//! [`BackoffPolicy`] schedule before the record is written to the local error
//! file.
//!
//! ## Wiring
//! ```text
//! RuntimeConfig { portal_backoff, portal_retries }
//!      └─► portal::PortalSink
//!           attempt 0 ─ fail ─► sleep(backoff.next(0)) ─► attempt 1 ─ fail ─► sleep(backoff.next(1)) ─► ...
//! ```
//!
//! ## Defaults
//! - `BackoffPolicy::default()` → first=400ms, factor=2.0, max=10s, jitter=None.

mod backoff;

pub use backoff::{BackoffPolicy, JitterPolicy};
