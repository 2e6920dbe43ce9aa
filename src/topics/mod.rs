//! Event/topic service: pull-based pub/sub between components.
//!
//! - [`TopicService`]: topics, cursors and subscriptions, owned by the router;
//! - [`Events`]: the client capability, with one adapter for components
//!   ([`ComponentEvents`]) and one for the framework ([`FrameworkEvents`]).

mod adapters;
mod service;

pub use adapters::{ComponentEvents, Events, FrameworkEvents, ListenerFn, ListenerTable};
pub use service::{Delivery, Drained, Event, MONITOR_TOPIC, SubscriberId, TopicService};
