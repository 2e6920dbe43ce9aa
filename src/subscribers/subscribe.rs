//! # Monitor sink trait
//!
//! `Subscribe` is the extension point for consuming [`MonitorEvent`]s. Each
//! sink is driven by its own worker fed by a bounded queue owned by the
//! [`SubscriberSet`](crate::subscribers::SubscriberSet).
//!
//! ## Contract
//! - Sinks may be slow (HTTP, file I/O, retries); they block neither the
//!   router nor other sinks.
//! - A sink declares its queue capacity via [`Subscribe::queue_capacity`];
//!   on overflow its events are dropped and `IPS_SINK_OVERFLOW` is published.

use async_trait::async_trait;

use crate::events::MonitorEvent;

/// Contract for monitor sinks.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Handles one event.
    async fn on_event(&self, event: &MonitorEvent);

    /// Name used in logs and overflow events.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Preferred capacity of this sink's queue.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
