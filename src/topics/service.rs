//! # Topic service.
//!
//! Pull-based pub/sub owned by the router. Each topic keeps the events not yet
//! read by all of its subscribers plus one read cursor per subscriber.
//!
//! ```text
//! topic "STATE"            pruned = 7
//!   events:  [e7][e8][e9][e10]
//!   cursors:   s1 ─────────^        (2)
//!              s2 ─────────────────^ (4 = tail)
//!
//! process_events(s1) ─► deliveries e9, e10 for every listener of s1 on "STATE"
//!                   ─► cursor(s1) = 4 ─► prune min(cursors) = 4 ─► events: []
//! ```
//!
//! ## Rules
//! - `0 ≤ cursor ≤ len(events)` for every subscriber of a topic.
//! - Pruning removes `min(cursors)` events from the front and subtracts that
//!   from every cursor; the absolute position (`pruned + cursor`) never
//!   decreases.
//! - A subscriber starts at the tail when its first listener on a topic is
//!   registered. Every listener records the absolute tail at registration and
//!   is handed only events at or after it, so a listener added later to a
//!   subscriber that already reads the topic never sees older events.
//! - `send_event` on a topic without listeners drops the event.
//! - When a topic holds more than `max_pending` events the oldest are dropped
//!   and the subscribers that had not read them are reported lagging.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::component::ComponentId;
use crate::error::EventError;

/// Opaque subscriber token.
pub type SubscriberId = u64;

/// Topic the framework mirrors its monitor events on.
pub const MONITOR_TOPIC: &str = "_IPS_MONITOR";

/// One published event. Immutable once sent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    /// Absolute position on the topic.
    pub seq: u64,
    pub header: BTreeMap<String, String>,
    pub body: Map<String, Value>,
}

/// An event routed to one listener.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub listener: String,
    pub event: Event,
}

/// Result of draining one subscriber.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Drained {
    pub deliveries: Vec<Delivery>,
    /// Events dropped by overflow before this subscriber read them.
    pub lagged: u64,
}

struct Topic {
    events: VecDeque<Arc<Event>>,
    /// Events removed from the front so far.
    pruned: u64,
    cursors: HashMap<SubscriberId, usize>,
    /// Listener keys per subscriber, with the absolute position each one
    /// starts reading from.
    listeners: HashMap<SubscriberId, BTreeMap<String, u64>>,
}

impl Topic {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            pruned: 0,
            cursors: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    fn tail(&self) -> u64 {
        self.pruned + self.events.len() as u64
    }

    fn has_listeners(&self) -> bool {
        self.listeners.values().any(|l| !l.is_empty())
    }

    fn prune(&mut self) {
        let min = match self.cursors.values().min() {
            Some(m) => *m,
            None => self.events.len(),
        };
        if min == 0 {
            return;
        }
        self.events.drain(..min);
        self.pruned += min as u64;
        for c in self.cursors.values_mut() {
            *c -= min;
        }
    }

    /// Drops the oldest events down to `limit`. Returns the subscribers whose
    /// unread events were dropped, with the count.
    fn overflow(&mut self, limit: usize) -> Vec<(SubscriberId, u64)> {
        if limit == 0 || self.events.len() <= limit {
            return Vec::new();
        }
        let excess = self.events.len() - limit;
        self.events.drain(..excess);
        self.pruned += excess as u64;
        let mut lagging = Vec::new();
        for (sub, c) in self.cursors.iter_mut() {
            if *c < excess {
                lagging.push((*sub, (excess - *c) as u64));
                *c = 0;
            } else {
                *c -= excess;
            }
        }
        lagging
    }
}

struct Subscriber {
    owner: Option<ComponentId>,
    subscriptions: BTreeSet<String>,
    /// Topics this subscriber listens on, per subscription.
    topics: BTreeMap<String, BTreeSet<String>>,
    lagged: u64,
}

/// Topics, subscribers and their cursors.
pub struct TopicService {
    topics: BTreeMap<String, Topic>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    next_subscriber: SubscriberId,
    max_pending: usize,
}

impl TopicService {
    /// `max_pending = 0` disables the overflow sweep.
    pub fn new(max_pending: usize) -> Self {
        Self {
            topics: BTreeMap::new(),
            subscribers: HashMap::new(),
            next_subscriber: 1,
            max_pending,
        }
    }

    /// Creates the topic on first use.
    pub fn get_topic(&mut self, name: &str) {
        self.topics
            .entry(name.to_string())
            .or_insert_with(Topic::new);
    }

    pub fn has_topic(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    /// Publishes an event. Returns its sequence number, or `None` when the
    /// topic has no listeners and the event was dropped.
    pub fn send_event(
        &mut self,
        topic: &str,
        header: BTreeMap<String, String>,
        body: Map<String, Value>,
    ) -> Result<Option<u64>, EventError> {
        let max_pending = self.max_pending;
        let t = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| EventError::UnknownTopic {
                topic: topic.to_string(),
            })?;
        if !t.has_listeners() {
            return Ok(None);
        }
        let seq = t.tail();
        t.events.push_back(Arc::new(Event {
            topic: topic.to_string(),
            seq,
            header,
            body,
        }));
        let lagging = t.overflow(max_pending);
        for (sub, n) in lagging {
            warn!(topic, subscriber = sub, dropped = n, "subscriber lagging; oldest events dropped");
            if let Some(s) = self.subscribers.get_mut(&sub) {
                s.lagged += n;
            }
        }
        Ok(Some(seq))
    }

    pub fn register_subscriber(&mut self, owner: Option<ComponentId>) -> SubscriberId {
        let id = self.next_subscriber;
        self.next_subscriber += 1;
        self.subscribers.insert(
            id,
            Subscriber {
                owner,
                subscriptions: BTreeSet::new(),
                topics: BTreeMap::new(),
                lagged: 0,
            },
        );
        id
    }

    /// Opens a named subscription for `sub`.
    pub fn get_subscription(&mut self, sub: SubscriberId, name: &str) -> Result<(), EventError> {
        let s = self.subscriber_mut(sub)?;
        if !s.subscriptions.insert(name.to_string()) {
            return Err(EventError::DuplicateSubscription {
                subscriber: sub,
                subscription: name.to_string(),
            });
        }
        Ok(())
    }

    /// Binds `listener` of `subscription` to `topic`. The listener key must
    /// equal the subscription name.
    pub fn register_listener(
        &mut self,
        sub: SubscriberId,
        subscription: &str,
        topic: &str,
        listener: &str,
    ) -> Result<(), EventError> {
        if listener != subscription {
            return Err(EventError::ListenerKeyMismatch {
                subscription: subscription.to_string(),
                listener: listener.to_string(),
            });
        }
        let s = self.subscriber_mut(sub)?;
        if !s.subscriptions.contains(subscription) {
            return Err(EventError::UnknownSubscription {
                subscriber: sub,
                subscription: subscription.to_string(),
            });
        }
        let t = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(Topic::new);
        let start = t.tail();
        let keys = t.listeners.entry(sub).or_default();
        if keys.contains_key(listener) {
            return Err(EventError::DuplicateListener {
                topic: topic.to_string(),
                listener: listener.to_string(),
            });
        }
        keys.insert(listener.to_string(), start);
        let tail = t.events.len();
        t.cursors.entry(sub).or_insert(tail);
        if let Some(s) = self.subscribers.get_mut(&sub) {
            s.topics
                .entry(subscription.to_string())
                .or_default()
                .insert(topic.to_string());
        }
        debug!(subscriber = sub, topic, listener, "listener registered");
        Ok(())
    }

    pub fn unregister_listener(
        &mut self,
        sub: SubscriberId,
        topic: &str,
        listener: &str,
    ) -> Result<(), EventError> {
        self.subscriber_mut(sub)?;
        let t = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| EventError::UnknownTopic {
                topic: topic.to_string(),
            })?;
        let removed = t
            .listeners
            .get_mut(&sub)
            .is_some_and(|keys| keys.remove(listener).is_some());
        if !removed {
            return Err(EventError::UnknownSubscription {
                subscriber: sub,
                subscription: listener.to_string(),
            });
        }
        if t.listeners.get(&sub).is_some_and(BTreeMap::is_empty) {
            t.listeners.remove(&sub);
            t.cursors.remove(&sub);
        }
        t.prune();
        if let Some(topics) = self
            .subscribers
            .get_mut(&sub)
            .and_then(|s| s.topics.get_mut(listener))
        {
            topics.remove(topic);
        }
        Ok(())
    }

    /// Closes a subscription and every listener it owns.
    pub fn remove_subscription(&mut self, sub: SubscriberId, name: &str) -> Result<(), EventError> {
        let s = self.subscriber_mut(sub)?;
        if !s.subscriptions.remove(name) {
            return Err(EventError::UnknownSubscription {
                subscriber: sub,
                subscription: name.to_string(),
            });
        }
        let topics = s.topics.remove(name).unwrap_or_default();
        for topic in topics {
            let _ = self.unregister_listener(sub, &topic, name);
        }
        Ok(())
    }

    pub fn unregister_subscriber(&mut self, sub: SubscriberId) -> Result<(), EventError> {
        let s = self
            .subscribers
            .remove(&sub)
            .ok_or(EventError::UnknownSubscriber { subscriber: sub })?;
        for t in self.topics.values_mut() {
            t.listeners.remove(&sub);
            t.cursors.remove(&sub);
            t.prune();
        }
        debug!(subscriber = sub, subscriptions = s.subscriptions.len(), "subscriber removed");
        Ok(())
    }

    /// Releases every subscriber owned by `owner`.
    pub fn release_owner(&mut self, owner: &ComponentId) -> usize {
        let subs: Vec<SubscriberId> = self
            .subscribers
            .iter()
            .filter(|(_, s)| s.owner.as_ref() == Some(owner))
            .map(|(id, _)| *id)
            .collect();
        for sub in &subs {
            let _ = self.unregister_subscriber(*sub);
        }
        subs.len()
    }

    /// Drains everything `sub` has not read yet, one delivery per matching
    /// listener, topics in name order, events in publish order.
    pub fn process_events(&mut self, sub: SubscriberId) -> Result<Drained, EventError> {
        let lagged = {
            let s = self.subscriber_mut(sub)?;
            std::mem::take(&mut s.lagged)
        };
        let mut deliveries = Vec::new();
        for t in self.topics.values_mut() {
            let Some(cursor) = t.cursors.get(&sub).copied() else {
                continue;
            };
            let keys = t.listeners.get(&sub).cloned().unwrap_or_default();
            for ev in t.events.iter().skip(cursor) {
                for (key, _) in keys.iter().filter(|(_, start)| ev.seq >= **start) {
                    deliveries.push(Delivery {
                        listener: key.clone(),
                        event: Event::clone(ev),
                    });
                }
            }
            let tail = t.events.len();
            t.cursors.insert(sub, tail);
            t.prune();
        }
        Ok(Drained { deliveries, lagged })
    }

    /// Whether `sub` has an unread event that some listener of it would get.
    pub fn has_pending(&self, sub: SubscriberId) -> bool {
        self.topics.values().any(|t| {
            let (Some(cursor), Some(keys)) = (t.cursors.get(&sub), t.listeners.get(&sub)) else {
                return false;
            };
            let Some(first) = keys.values().min() else {
                return false;
            };
            t.events.iter().skip(*cursor).any(|ev| ev.seq >= *first)
        })
    }

    pub fn subscriber_exists(&self, sub: SubscriberId) -> bool {
        self.subscribers.contains_key(&sub)
    }

    /// Absolute read position of `sub` on `topic`.
    pub fn position(&self, topic: &str, sub: SubscriberId) -> Option<u64> {
        let t = self.topics.get(topic)?;
        t.cursors.get(&sub).map(|c| t.pruned + *c as u64)
    }

    #[cfg(test)]
    fn backlog(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |t| t.events.len())
    }

    fn subscriber_mut(&mut self, sub: SubscriberId) -> Result<&mut Subscriber, EventError> {
        self.subscribers
            .get_mut(&sub)
            .ok_or(EventError::UnknownSubscriber { subscriber: sub })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    fn body(n: i64) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("n".into(), json!(n));
        m
    }

    fn listen(svc: &mut TopicService, topic: &str, name: &str) -> SubscriberId {
        let sub = svc.register_subscriber(None);
        svc.get_subscription(sub, name).unwrap();
        svc.register_listener(sub, name, topic, name).unwrap();
        sub
    }

    fn seen(d: &Drained) -> Vec<i64> {
        d.deliveries
            .iter()
            .map(|d| d.event.body["n"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_events_without_listeners_are_dropped() {
        let mut svc = TopicService::new(0);
        svc.get_topic("T");
        assert_eq!(svc.send_event("T", BTreeMap::new(), body(1)).unwrap(), None);
        assert_eq!(svc.backlog("T"), 0);
        assert!(matches!(
            svc.send_event("nope", BTreeMap::new(), body(1)),
            Err(EventError::UnknownTopic { .. })
        ));
    }

    #[test]
    fn test_late_subscriber_sees_only_later_events() {
        let mut svc = TopicService::new(0);
        let early = listen(&mut svc, "T", "early");
        svc.send_event("T", BTreeMap::new(), body(1)).unwrap();
        let late = listen(&mut svc, "T", "late");
        svc.send_event("T", BTreeMap::new(), body(2)).unwrap();

        assert_eq!(seen(&svc.process_events(early).unwrap()), vec![1, 2]);
        assert_eq!(seen(&svc.process_events(late).unwrap()), vec![2]);
        assert_eq!(svc.backlog("T"), 0);
        assert!(svc.process_events(late).unwrap().deliveries.is_empty());
    }

    #[test]
    fn test_prune_keeps_slowest_reader_data() {
        let mut svc = TopicService::new(0);
        let fast = listen(&mut svc, "T", "fast");
        let slow = listen(&mut svc, "T", "slow");
        for n in 0..5 {
            svc.send_event("T", BTreeMap::new(), body(n)).unwrap();
        }
        svc.process_events(fast).unwrap();
        assert_eq!(svc.backlog("T"), 5);
        assert_eq!(seen(&svc.process_events(slow).unwrap()), vec![0, 1, 2, 3, 4]);
        assert_eq!(svc.backlog("T"), 0);
        assert_eq!(svc.position("T", fast), Some(5));
    }

    #[test]
    fn test_second_listener_starts_at_its_registration() {
        let mut svc = TopicService::new(0);
        let sub = svc.register_subscriber(None);
        svc.get_subscription(sub, "a").unwrap();
        svc.register_listener(sub, "a", "T", "a").unwrap();
        svc.send_event("T", BTreeMap::new(), body(1)).unwrap();
        svc.get_subscription(sub, "b").unwrap();
        svc.register_listener(sub, "b", "T", "b").unwrap();
        svc.send_event("T", BTreeMap::new(), body(2)).unwrap();

        let d = svc.process_events(sub).unwrap();
        let by = |key: &str| -> Vec<i64> {
            d.deliveries
                .iter()
                .filter(|d| d.listener == key)
                .map(|d| d.event.body["n"].as_i64().unwrap())
                .collect()
        };
        assert_eq!(by("a"), vec![1, 2]);
        assert_eq!(by("b"), vec![2]);
        assert_eq!(svc.backlog("T"), 0);
    }

    #[test]
    fn test_listener_rules() {
        let mut svc = TopicService::new(0);
        let sub = svc.register_subscriber(None);
        assert!(matches!(
            svc.register_listener(sub, "s", "T", "s"),
            Err(EventError::UnknownSubscription { .. })
        ));
        svc.get_subscription(sub, "s").unwrap();
        assert!(matches!(
            svc.get_subscription(sub, "s"),
            Err(EventError::DuplicateSubscription { .. })
        ));
        assert!(matches!(
            svc.register_listener(sub, "s", "T", "other"),
            Err(EventError::ListenerKeyMismatch { .. })
        ));
        svc.register_listener(sub, "s", "T", "s").unwrap();
        assert!(matches!(
            svc.register_listener(sub, "s", "T", "s"),
            Err(EventError::DuplicateListener { .. })
        ));
        assert!(matches!(
            svc.process_events(99),
            Err(EventError::UnknownSubscriber { subscriber: 99 })
        ));
    }

    #[test]
    fn test_unregister_releases_backlog() {
        let mut svc = TopicService::new(0);
        let a = listen(&mut svc, "T", "a");
        let b = listen(&mut svc, "T", "b");
        svc.send_event("T", BTreeMap::new(), body(1)).unwrap();
        svc.process_events(a).unwrap();
        assert_eq!(svc.backlog("T"), 1);
        svc.remove_subscription(b, "b").unwrap();
        assert_eq!(svc.backlog("T"), 0);
        svc.unregister_subscriber(a).unwrap();
        assert_eq!(svc.send_event("T", BTreeMap::new(), body(2)).unwrap(), None);
    }

    #[test]
    fn test_overflow_reports_lag() {
        let mut svc = TopicService::new(3);
        let sub = listen(&mut svc, "T", "s");
        for n in 0..5 {
            svc.send_event("T", BTreeMap::new(), body(n)).unwrap();
        }
        assert_eq!(svc.backlog("T"), 3);
        let d = svc.process_events(sub).unwrap();
        assert_eq!(d.lagged, 2);
        assert_eq!(seen(&d), vec![2, 3, 4]);
    }

    #[test]
    fn test_release_owner_drops_its_subscribers() {
        let mut svc = TopicService::new(0);
        let owner = ComponentId::new("ev", "W");
        let sub = svc.register_subscriber(Some(owner.clone()));
        svc.get_subscription(sub, "s").unwrap();
        svc.register_listener(sub, "s", "T", "s").unwrap();
        assert_eq!(svc.release_owner(&owner), 1);
        assert!(!svc.subscriber_exists(sub));
    }

    #[test]
    fn test_cursor_monotonic_under_random_traffic() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut svc = TopicService::new(16);
        let subs: Vec<SubscriberId> = (0..3)
            .map(|i| listen(&mut svc, "T", &format!("s{i}")))
            .collect();
        let mut last: HashMap<SubscriberId, u64> = HashMap::new();
        let mut received: HashMap<SubscriberId, Vec<u64>> = HashMap::new();
        for n in 0..500 {
            if rng.random_bool(0.6) {
                svc.send_event("T", BTreeMap::new(), body(n)).unwrap();
            } else {
                let sub = subs[rng.random_range(0..subs.len())];
                let d = svc.process_events(sub).unwrap();
                received
                    .entry(sub)
                    .or_default()
                    .extend(d.deliveries.iter().map(|d| d.event.seq));
            }
            for sub in &subs {
                let pos = svc.position("T", *sub).unwrap();
                let prev = last.insert(*sub, pos).unwrap_or(0);
                assert!(pos >= prev);
                assert!(svc.backlog("T") <= 16);
            }
        }
        for seqs in received.values() {
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
