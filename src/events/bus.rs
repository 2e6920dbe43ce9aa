//! # Monitor bus.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`] that lets the
//! router and the framework publish [`MonitorEvent`]s without blocking.
//!
//! ```text
//! Publishers:                      Consumer (one):
//!   router    ──┐
//!   framework ──┼──► Bus ──► sink listener ──► SubscriberSet ──► LogWriter, PortalSink, ...
//!   sink set  ──┘
//! ```
//!
//! ## Rules
//! - `publish()` never blocks.
//! - A single ring buffer of `capacity` events is shared by all receivers;
//!   a receiver that falls behind gets `RecvError::Lagged(n)` and skips `n`.
//! - Events published with no receiver are lost.

use tokio::sync::broadcast;

use super::event::MonitorEvent;

/// Broadcast channel for monitor events.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl Bus {
    /// Creates a bus. The capacity is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel::<MonitorEvent>(capacity.max(1));
        Self { tx }
    }

    /// Publishes to every current receiver.
    pub fn publish(&self, ev: MonitorEvent) {
        let _ = self.tx.send(ev);
    }

    /// A receiver that observes events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MonitorKind;

    #[tokio::test]
    async fn test_receiver_sees_later_events_only() {
        let bus = Bus::new(4);
        bus.publish(MonitorEvent::now(MonitorKind::IpsStart));
        let mut rx = bus.subscribe();
        bus.publish(MonitorEvent::now(MonitorKind::IpsEnd));
        assert_eq!(rx.recv().await.unwrap().kind, MonitorKind::IpsEnd);
    }
}
