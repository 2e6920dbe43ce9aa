//! # Event service adapters.
//!
//! Components and the framework reach the topic service through the same
//! capability, [`Events`], over different transports:
//!
//! | Adapter | Transport | Used by |
//! |---------|-----------|---------|
//! | [`ComponentEvents`] | the component's services proxy | components |
//! | [`FrameworkEvents`] | framework control channel | framework, embedders, tests |
//!
//! Listener callbacks stay on the caller's side in a [`ListenerTable`]; the
//! router only hands back deliveries.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use super::service::{Drained, Event, SubscriberId};
use crate::error::ServiceError;
use crate::runtime::{FrameworkHandle, Request, Response};
use crate::services::{ServicesProxy, unexpected};

/// Listener callback. An `Err` is logged; delivery to other listeners continues.
pub type ListenerFn = Box<dyn FnMut(&Event) -> Result<(), String> + Send>;

type ListenerKey = (SubscriberId, String, String);

/// Callbacks by `(subscriber, topic, listener)`.
#[derive(Default)]
pub struct ListenerTable {
    inner: Mutex<HashMap<ListenerKey, ListenerFn>>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<ListenerKey, ListenerFn>) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    pub fn insert(&self, sub: SubscriberId, topic: &str, listener: &str, f: ListenerFn) {
        self.with(|m| {
            m.insert((sub, topic.to_string(), listener.to_string()), f);
        });
    }

    pub fn remove(&self, sub: SubscriberId, topic: &str, listener: &str) {
        self.with(|m| {
            m.remove(&(sub, topic.to_string(), listener.to_string()));
        });
    }

    /// Drops every callback of one listener key (a whole subscription).
    pub fn remove_listener(&self, sub: SubscriberId, listener: &str) {
        self.with(|m| m.retain(|(s, _, l), _| !(*s == sub && l == listener)));
    }

    pub fn remove_subscriber(&self, sub: SubscriberId) {
        self.with(|m| m.retain(|(s, _, _), _| *s != sub));
    }

    pub fn len(&self) -> usize {
        self.with(|m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the callbacks for `drained`. Returns how many ran successfully.
    pub fn dispatch(&self, sub: SubscriberId, drained: &Drained) -> usize {
        if drained.lagged > 0 {
            warn!(subscriber = sub, dropped = drained.lagged, "events lost before delivery");
        }
        self.with(|m| {
            let mut ok = 0;
            for d in &drained.deliveries {
                let key = (sub, d.event.topic.clone(), d.listener.clone());
                let Some(f) = m.get_mut(&key) else {
                    continue;
                };
                match std::panic::catch_unwind(AssertUnwindSafe(|| f(&d.event))) {
                    Ok(Ok(())) => ok += 1,
                    Ok(Err(e)) => {
                        warn!(topic = %d.event.topic, listener = %d.listener, error = %e, "listener failed");
                    }
                    Err(_) => {
                        warn!(topic = %d.event.topic, listener = %d.listener, "listener panicked");
                    }
                }
            }
            ok
        })
    }
}

/// Event service capability shared by both adapters.
#[async_trait]
pub trait Events: Send + Sync {
    /// Sends one event-service request.
    async fn request(&self, request: Request) -> Result<Response, ServiceError>;

    /// Local callback table.
    fn listeners(&self) -> &ListenerTable;

    /// Creates the topic if it does not exist.
    async fn get_topic(&self, topic: &str) -> Result<(), ServiceError> {
        self.request(Request::GetTopic {
            topic: topic.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn send_event(
        &self,
        topic: &str,
        header: BTreeMap<String, String>,
        body: Map<String, Value>,
    ) -> Result<(), ServiceError> {
        self.request(Request::SendEvent {
            topic: topic.to_string(),
            header,
            body,
        })
        .await
        .map(|_| ())
    }

    async fn register_subscriber(&self) -> Result<SubscriberId, ServiceError> {
        match self.request(Request::RegisterSubscriber).await? {
            Response::Subscriber(id) => Ok(id),
            other => Err(unexpected("register_subscriber", &other)),
        }
    }

    async fn get_subscription(&self, sub: SubscriberId, name: &str) -> Result<(), ServiceError> {
        self.request(Request::GetSubscription {
            subscriber: sub,
            name: name.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Binds `callback` to `topic` under the subscription's own key.
    async fn register_listener(
        &self,
        sub: SubscriberId,
        subscription: &str,
        topic: &str,
        callback: ListenerFn,
    ) -> Result<(), ServiceError> {
        self.request(Request::RegisterListener {
            subscriber: sub,
            subscription: subscription.to_string(),
            topic: topic.to_string(),
            listener: subscription.to_string(),
        })
        .await?;
        self.listeners().insert(sub, topic, subscription, callback);
        Ok(())
    }

    async fn unregister_listener(
        &self,
        sub: SubscriberId,
        topic: &str,
        listener: &str,
    ) -> Result<(), ServiceError> {
        self.listeners().remove(sub, topic, listener);
        self.request(Request::UnregisterListener {
            subscriber: sub,
            topic: topic.to_string(),
            listener: listener.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn remove_subscription(&self, sub: SubscriberId, name: &str) -> Result<(), ServiceError> {
        self.listeners().remove_listener(sub, name);
        self.request(Request::RemoveSubscription {
            subscriber: sub,
            name: name.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn unregister_subscriber(&self, sub: SubscriberId) -> Result<(), ServiceError> {
        self.listeners().remove_subscriber(sub);
        self.request(Request::UnregisterSubscriber { subscriber: sub })
            .await
            .map(|_| ())
    }

    /// Pulls pending events and runs the matching callbacks. With `block` the
    /// call waits until at least one event is pending (or `timeout` expires).
    async fn process_events(
        &self,
        sub: SubscriberId,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<usize, ServiceError> {
        match self
            .request(Request::ProcessEvents {
                subscriber: sub,
                block,
                timeout,
            })
            .await?
        {
            Response::Drained(d) => Ok(self.listeners().dispatch(sub, &d)),
            other => Err(unexpected("process_events", &other)),
        }
    }
}

/// [`Events`] over a component's services proxy.
pub struct ComponentEvents<'a> {
    proxy: &'a ServicesProxy,
}

impl<'a> ComponentEvents<'a> {
    pub(crate) fn new(proxy: &'a ServicesProxy) -> Self {
        Self { proxy }
    }
}

#[async_trait]
impl Events for ComponentEvents<'_> {
    async fn request(&self, request: Request) -> Result<Response, ServiceError> {
        self.proxy.request(request).await
    }

    fn listeners(&self) -> &ListenerTable {
        self.proxy.listeners()
    }
}

/// [`Events`] over the framework control channel, on behalf of one simulation.
pub struct FrameworkEvents {
    handle: FrameworkHandle,
    sim: String,
    listeners: ListenerTable,
}

impl FrameworkEvents {
    pub fn new(handle: FrameworkHandle, sim: impl Into<String>) -> Self {
        Self {
            handle,
            sim: sim.into(),
            listeners: ListenerTable::new(),
        }
    }
}

#[async_trait]
impl Events for FrameworkEvents {
    async fn request(&self, request: Request) -> Result<Response, ServiceError> {
        self.handle.service(&self.sim, request).await
    }

    fn listeners(&self) -> &ListenerTable {
        &self.listeners
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::service::Delivery;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn drained(topic: &str, listeners: &[&str]) -> Drained {
        Drained {
            deliveries: listeners
                .iter()
                .map(|l| Delivery {
                    listener: l.to_string(),
                    event: Event {
                        topic: topic.into(),
                        seq: 0,
                        header: BTreeMap::new(),
                        body: Map::new(),
                    },
                })
                .collect(),
            lagged: 0,
        }
    }

    #[test]
    fn test_failing_listener_does_not_stop_peers() {
        let table = ListenerTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        table.insert(1, "T", "bad", Box::new(|_| panic!("boom")));
        table.insert(1, "T", "err", Box::new(|_| Err("nope".into())));
        let h = hits.clone();
        table.insert(
            1,
            "T",
            "good",
            Box::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let ok = table.dispatch(1, &drained("T", &["bad", "err", "good"]));
        assert_eq!(ok, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removal_scopes() {
        let table = ListenerTable::new();
        table.insert(1, "A", "s", Box::new(|_| Ok(())));
        table.insert(1, "B", "s", Box::new(|_| Ok(())));
        table.insert(2, "A", "s", Box::new(|_| Ok(())));
        table.remove_listener(1, "s");
        assert_eq!(table.len(), 1);
        table.remove_subscriber(2);
        assert!(table.is_empty());
    }
}
