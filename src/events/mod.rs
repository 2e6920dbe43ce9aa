//! Framework monitor events: types and broadcast bus.
//!
//! - [`MonitorKind`], [`MonitorEvent`]: what happened, where, with which fields;
//! - [`Bus`]: thin wrapper over `tokio::sync::broadcast`.
//!
//! **Publishers**: the service router (work and lifecycle), the framework
//! (shutdown and grace), the subscriber set (sink overflow and panics).
//! **Consumer**: one listener in the framework that fans out to the
//! [`SubscriberSet`](crate::subscribers::SubscriberSet).

mod bus;
mod event;

pub use bus::Bus;
pub use event::{MonitorEvent, MonitorKind};
