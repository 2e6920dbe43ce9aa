//! # Non-blocking fan-out to monitor sinks.
//!
//! ```text
//! emit(event)
//!     ├──► [queue 1] ──► worker 1 ──► sink1.on_event()
//!     │    (bounded)         └──────► panic → IPS_SINK_PANICKED
//!     └──► [queue N] ──► worker N ──► sinkN.on_event()
//! ```
//!
//! ## Rules
//! - `emit()` returns immediately (`try_send`).
//! - Overflow drops the event for that sink only and publishes `IPS_SINK_OVERFLOW`.
//! - Each sink sees events in emit order; there is no order across sinks.
//! - A panicking sink is reported and keeps receiving events.

use std::sync::Arc;

use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinHandle};

use super::Subscribe;
use crate::events::{Bus, MonitorEvent};

struct SinkChannel {
    name: &'static str,
    sender: mpsc::Sender<Arc<MonitorEvent>>,
}

/// Per-sink queues and workers.
pub struct SubscriberSet {
    channels: Vec<SinkChannel>,
    workers: Vec<JoinHandle<()>>,
    bus: Bus,
}

impl SubscriberSet {
    /// Spawns one worker per sink.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn Subscribe>>, bus: Bus) -> Self {
        let mut channels = Vec::with_capacity(sinks.len());
        let mut workers = Vec::with_capacity(sinks.len());

        for sink in sinks {
            let name = sink.name();
            let (tx, mut rx) = mpsc::channel::<Arc<MonitorEvent>>(sink.queue_capacity().max(1));
            let bus_for_worker = bus.clone();

            let handle = tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    let fut = sink.on_event(ev.as_ref());
                    if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                        let info = if let Some(msg) = panic.downcast_ref::<&'static str>() {
                            (*msg).to_string()
                        } else if let Some(msg) = panic.downcast_ref::<String>() {
                            msg.clone()
                        } else {
                            "unknown panic".to_string()
                        };
                        bus_for_worker.publish(MonitorEvent::sink_panicked(sink.name(), info));
                    }
                }
            });
            channels.push(SinkChannel { name, sender: tx });
            workers.push(handle);
        }
        Self {
            channels,
            workers,
            bus,
        }
    }

    pub fn emit(&self, event: &MonitorEvent) {
        self.emit_arc(Arc::new(event.clone()));
    }

    /// Overflow events are never re-published when they overflow themselves.
    pub fn emit_arc(&self, event: Arc<MonitorEvent>) {
        let is_overflow = event.is_sink_overflow();
        for channel in &self.channels {
            let reason = match channel.sender.try_send(Arc::clone(&event)) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => "full",
                Err(mpsc::error::TrySendError::Closed(_)) => "closed",
            };
            if !is_overflow {
                self.bus
                    .publish(MonitorEvent::sink_overflow(channel.name, reason));
            }
        }
    }

    /// Closes every queue and waits for the workers to drain them.
    pub async fn shutdown(self) {
        drop(self.channels);
        for h in self.workers {
            let _ = h.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MonitorKind;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<MonitorKind>>,
    }

    #[async_trait]
    impl Subscribe for Recorder {
        async fn on_event(&self, event: &MonitorEvent) {
            self.seen.lock().unwrap().push(event.kind);
        }
        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    struct Panicky;

    #[async_trait]
    impl Subscribe for Panicky {
        async fn on_event(&self, _event: &MonitorEvent) {
            panic!("sink blew up");
        }
        fn name(&self) -> &'static str {
            "panicky"
        }
    }

    #[tokio::test]
    async fn test_panicking_sink_is_isolated() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let rec = Arc::new(Recorder::default());
        let set = SubscriberSet::new(vec![rec.clone(), Arc::new(Panicky)], bus);

        set.emit(&MonitorEvent::now(MonitorKind::IpsStart));
        set.emit(&MonitorEvent::now(MonitorKind::IpsEnd));
        set.shutdown().await;

        assert_eq!(
            *rec.seen.lock().unwrap(),
            vec![MonitorKind::IpsStart, MonitorKind::IpsEnd]
        );
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, MonitorKind::SinkPanicked);
        assert_eq!(ev.comment.as_deref(), Some("sink blew up"));
    }
}
