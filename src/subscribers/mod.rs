//! # Monitor sinks.
//!
//! ```text
//! router ── publish(MonitorEvent) ──► Bus ──► framework listener ──► SubscriberSet
//!                                                                    ├──► LogWriter
//!                                                                    ├──► PortalSink
//!                                                                    └──► embedder sinks
//! ```
//!
//! Implement [`Subscribe`] to add a sink:
//!
//! ```no_run
//! use async_trait::async_trait;
//! use ips_runtime::events::{MonitorEvent, MonitorKind};
//! use ips_runtime::subscribers::Subscribe;
//!
//! struct TaskCounter;
//!
//! #[async_trait]
//! impl Subscribe for TaskCounter {
//!     async fn on_event(&self, event: &MonitorEvent) {
//!         if event.kind == MonitorKind::TaskEnd {
//!             // count it
//!         }
//!     }
//!     fn name(&self) -> &'static str { "task-counter" }
//! }
//! ```

mod log;
mod set;
mod subscribe;

pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
