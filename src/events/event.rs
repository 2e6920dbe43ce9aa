//! # Framework monitor events.
//!
//! [`MonitorKind`] classifies what the framework reports about a run:
//! - **Simulation lifecycle**: start and end of a simulation;
//! - **Work**: allocations, task launches and exits, task pools, calls;
//! - **Portal**: records a component asked to publish;
//! - **Sinks and shutdown**: sink overflow/panic, signal, grace outcome.
//!
//! A [`MonitorEvent`] carries the kind plus the simulation, the publishing
//! component and free-form `fields` that end up as `key=value` pairs in the
//! portal record.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically. Use `seq` to restore the order when sinks see events late.
//!
//! ## Example
//! ```rust
//! use ips_runtime::events::{MonitorEvent, MonitorKind};
//!
//! let ev = MonitorEvent::new(MonitorKind::TaskEnd, "hello")
//!     .with_component("hello@Worker@1")
//!     .with_task(7)
//!     .with_field("exit_code", "0");
//!
//! assert_eq!(ev.kind.as_str(), "IPS_TASK_END");
//! assert_eq!(ev.fields.get("task_id").map(String::as_str), Some("7"));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of monitor events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorKind {
    // === Simulation lifecycle ===
    /// Components of a simulation were instantiated.
    ///
    /// Sets `fields["sim_root"]`.
    IpsStart,
    /// A simulation was torn down.
    IpsEnd,

    // === Work ===
    /// Cores were reserved (`fields`: `task_id`, `cores`, `nodes`).
    ResourceAlloc,
    /// A component called another (`fields`: `call_id`, `target`, `method`).
    CallBegin,
    /// A call finished (`fields`: `call_id`, `method`, `ok`).
    CallEnd,
    /// A child process was started (`fields`: `task_id`, `binary`, `cores`).
    LaunchTask,
    /// A child process exited (`fields`: `task_id`, `exit_code`).
    TaskEnd,
    /// Tasks of a pool were submitted (`fields`: `pool`).
    TaskPoolBegin,
    /// A pool was removed (`fields`: `pool`).
    TaskPoolEnd,

    // === Portal ===
    /// Record requested by a component; `fields["eventtype"]` names its type.
    SendPortalEvent,

    // === Sinks ===
    /// A sink dropped an event (queue full or closed).
    SinkOverflow,
    /// A sink panicked while handling an event.
    SinkPanicked,

    // === Shutdown ===
    /// Termination signal observed.
    ShutdownRequested,
    /// Every component stopped within the grace period.
    AllStoppedWithin,
    /// Grace period exceeded; some components did not stop in time.
    GraceExceeded,
}

impl MonitorKind {
    /// Portal event type.
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorKind::IpsStart => "IPS_START",
            MonitorKind::IpsEnd => "IPS_END",
            MonitorKind::ResourceAlloc => "IPS_RESOURCE_ALLOC",
            MonitorKind::CallBegin => "IPS_CALL_BEGIN",
            MonitorKind::CallEnd => "IPS_CALL_END",
            MonitorKind::LaunchTask => "IPS_LAUNCH_TASK",
            MonitorKind::TaskEnd => "IPS_TASK_END",
            MonitorKind::TaskPoolBegin => "IPS_TASK_POOL_BEGIN",
            MonitorKind::TaskPoolEnd => "IPS_TASK_POOL_END",
            MonitorKind::SendPortalEvent => "IPS_SEND_PORTAL_EVENT",
            MonitorKind::SinkOverflow => "IPS_SINK_OVERFLOW",
            MonitorKind::SinkPanicked => "IPS_SINK_PANICKED",
            MonitorKind::ShutdownRequested => "IPS_SHUTDOWN_REQUESTED",
            MonitorKind::AllStoppedWithin => "IPS_ALL_STOPPED",
            MonitorKind::GraceExceeded => "IPS_GRACE_EXCEEDED",
        }
    }

    /// Events about the framework's own plumbing rather than the simulation.
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            MonitorKind::SinkOverflow
                | MonitorKind::SinkPanicked
                | MonitorKind::ShutdownRequested
                | MonitorKind::AllStoppedWithin
                | MonitorKind::GraceExceeded
        )
    }
}

/// Monitor event with optional metadata.
#[derive(Clone, Debug)]
pub struct MonitorEvent {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    pub kind: MonitorKind,
    /// Simulation name; empty for process-wide events.
    pub sim: Arc<str>,
    /// Publishing component id, if any.
    pub component: Option<Arc<str>>,
    /// Human-readable comment.
    pub comment: Option<Arc<str>>,
    /// Simulated time the event refers to.
    pub phystimestamp: Option<f64>,
    /// Extra `key=value` pairs.
    pub fields: BTreeMap<String, String>,
}

impl MonitorEvent {
    /// Creates an event with the current time and the next sequence number.
    pub fn new(kind: MonitorKind, sim: impl Into<Arc<str>>) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            sim: sim.into(),
            component: None,
            comment: None,
            phystimestamp: None,
            fields: BTreeMap::new(),
        }
    }

    /// Process-wide event (shutdown, sinks).
    pub fn now(kind: MonitorKind) -> Self {
        Self::new(kind, "")
    }

    #[inline]
    pub fn with_component(mut self, component: impl ToString) -> Self {
        self.component = Some(component.to_string().into());
        self
    }

    #[inline]
    pub fn with_comment(mut self, comment: impl Into<Arc<str>>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    #[inline]
    pub fn with_phystimestamp(mut self, t: f64) -> Self {
        self.phystimestamp = Some(t);
        self
    }

    #[inline]
    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    #[inline]
    pub fn with_task(self, task_id: u64) -> Self {
        self.with_field("task_id", task_id)
    }

    /// Sink overflow event.
    #[inline]
    pub fn sink_overflow(sink: &'static str, reason: &'static str) -> Self {
        MonitorEvent::now(MonitorKind::SinkOverflow)
            .with_component(sink)
            .with_comment(format!("sink={sink} reason={reason}"))
    }

    /// Sink panic event.
    #[inline]
    pub fn sink_panicked(sink: &'static str, info: String) -> Self {
        MonitorEvent::now(MonitorKind::SinkPanicked)
            .with_component(sink)
            .with_comment(info)
    }

    #[inline]
    pub fn is_sink_overflow(&self) -> bool {
        matches!(self.kind, MonitorKind::SinkOverflow)
    }

    /// Header of the `_IPS_MONITOR` topic copy.
    pub fn header(&self) -> BTreeMap<String, String> {
        let mut h = BTreeMap::new();
        h.insert("eventtype".to_string(), self.kind.as_str().to_string());
        h.insert("sim_name".to_string(), self.sim.to_string());
        h.insert("seq".to_string(), self.seq.to_string());
        if let Some(c) = &self.component {
            h.insert("component".to_string(), c.to_string());
        }
        h
    }

    /// Body of the `_IPS_MONITOR` topic copy.
    pub fn body(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut body: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(v.clone())))
            .collect();
        if let Some(c) = &self.comment {
            body.insert("comment".into(), c.to_string().into());
        }
        if let Some(t) = self.phystimestamp {
            body.insert("phystimestamp".into(), t.into());
        }
        body
    }
}
