//! Error types used by the IPS runtime, its services and its components.
//!
//! Each subsystem owns one enum; every enum provides `as_label` (stable
//! snake_case label for logs) and `as_message` (human-readable detail).
//!
//! - [`ConfigError`]: configuration files and keys.
//! - [`ResourceError`]: core allocation ([`crate::resources`]).
//! - [`LaunchError`]: spawning and reaping child processes.
//! - [`PoolError`]: task-pool bookkeeping.
//! - [`RegistryError`]: component table lookups.
//! - [`InvocationError`]: calls between components.
//! - [`EventError`]: topics, subscribers and listeners.
//! - [`PhaseError`]: checklist prerequisites and phase failures.
//! - [`ServiceError`]: anything a service request can answer with; crosses the router intact.
//! - [`ComponentError`]: what a component method returns.
//! - [`RuntimeError`]: failures of the framework itself.

use std::time::Duration;

use thiserror::Error;

use crate::component::ComponentId;

/// # Configuration errors.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("cannot access {path}: {reason}")]
    Io { path: String, reason: String },

    /// A line of the file could not be parsed.
    #[error("{path}:{line}: {reason}")]
    Parse {
        path: String,
        line: usize,
        reason: String,
    },

    /// A required key is absent.
    #[error("missing required key {key} in {scope}")]
    MissingKey { key: String, scope: String },

    /// A key holds a value of the wrong shape.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    /// No component implementation is known under that name.
    #[error("no component implementation named {name}")]
    UnknownImplementation { name: String },

    /// Two simulations share a name.
    #[error("simulation {name} is already running")]
    DuplicateSimulation { name: String },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "config_io",
            ConfigError::Parse { .. } => "config_parse",
            ConfigError::MissingKey { .. } => "config_missing_key",
            ConfigError::InvalidValue { .. } => "config_invalid_value",
            ConfigError::UnknownImplementation { .. } => "config_unknown_implementation",
            ConfigError::DuplicateSimulation { .. } => "config_duplicate_simulation",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }

    pub(crate) fn io(path: impl AsRef<std::path::Path>, err: &std::io::Error) -> Self {
        ConfigError::Io {
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        }
    }
}

/// # Resource manager errors.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// The inventory handed to the manager has no nodes.
    #[error("resource inventory is empty")]
    BadInventory,

    /// The request fits the inventory but the cores are currently held.
    #[error(
        "{owner} asked for {requested} cores for task {task_id}: only {available} free of {capacity}"
    )]
    Insufficient {
        owner: String,
        task_id: u64,
        requested: usize,
        available: usize,
        capacity: usize,
    },

    /// The request can never be satisfied by this inventory.
    #[error(
        "{owner} asked for {requested} cores for task {task_id}: inventory capacity is {capacity}"
    )]
    BadRequest {
        owner: String,
        task_id: u64,
        requested: usize,
        capacity: usize,
    },

    /// No allocation is held under that task id.
    #[error("no allocation held for task {task_id}")]
    UnknownTask { task_id: u64 },

    /// An allocation already exists under that task id.
    #[error("task {task_id} already holds an allocation")]
    DuplicateTask { task_id: u64 },

    /// The node backs live allocations and cannot be taken down.
    #[error("node {node} backs allocations of tasks {tasks:?}")]
    AllocatedNodeDown { node: String, tasks: Vec<u64> },

    /// The node is not part of the inventory.
    #[error("node {name} does not exist")]
    NonexistentResource { name: String },
}

impl ResourceError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ResourceError::BadInventory => "resource_bad_inventory",
            ResourceError::Insufficient { .. } => "resource_insufficient",
            ResourceError::BadRequest { .. } => "resource_bad_request",
            ResourceError::UnknownTask { .. } => "resource_unknown_task",
            ResourceError::DuplicateTask { .. } => "resource_duplicate_task",
            ResourceError::AllocatedNodeDown { .. } => "resource_allocated_node_down",
            ResourceError::NonexistentResource { .. } => "resource_nonexistent",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Task launcher errors.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The OS refused to start the process.
    #[error("failed to spawn {binary}: {reason}")]
    Spawn { binary: String, reason: String },

    /// The log sink could not be opened.
    #[error("cannot open log sink {path}: {reason}")]
    LogSink { path: String, reason: String },

    /// The task ran and exited with a non-zero code.
    #[error("task {task_id} exited with code {code}")]
    NonZeroExit { task_id: u64, code: i32 },

    /// The task id is unknown or was already harvested.
    #[error("unknown task {task_id}")]
    UnknownTask { task_id: u64 },

    /// The task belongs to another component.
    #[error("task {task_id} is not owned by {caller}")]
    NotOwner { task_id: u64, caller: String },

    /// The platform names a launcher this runtime does not know.
    #[error("unsupported launcher {name}")]
    UnsupportedLauncher { name: String },
}

impl LaunchError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            LaunchError::Spawn { .. } => "launch_spawn",
            LaunchError::LogSink { .. } => "launch_log_sink",
            LaunchError::NonZeroExit { .. } => "launch_non_zero_exit",
            LaunchError::UnknownTask { .. } => "launch_unknown_task",
            LaunchError::NotOwner { .. } => "launch_not_owner",
            LaunchError::UnsupportedLauncher { .. } => "launch_unsupported_launcher",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Task pool errors.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("task pool {pool} already exists")]
    DuplicatePool { pool: String },

    #[error("unknown task pool {pool}")]
    UnknownPool { pool: String },

    #[error("task {task} already queued in pool {pool}")]
    DuplicateTask { pool: String, task: String },

    /// Nothing queued, active or finished.
    #[error("no more active tasks in pool {pool}")]
    Empty { pool: String },
}

impl PoolError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            PoolError::DuplicatePool { .. } => "pool_duplicate",
            PoolError::UnknownPool { .. } => "pool_unknown",
            PoolError::DuplicateTask { .. } => "pool_duplicate_task",
            PoolError::Empty { .. } => "pool_empty",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Component registry errors.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown component {id}")]
    UnknownComponent { id: String },

    #[error("component {id} is already registered")]
    DuplicateComponent { id: String },

    /// The simulation has no component bound to that port.
    #[error("simulation {sim} has no port {port}")]
    UnknownPort { sim: String, port: String },
}

impl RegistryError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RegistryError::UnknownComponent { .. } => "registry_unknown_component",
            RegistryError::DuplicateComponent { .. } => "registry_duplicate_component",
            RegistryError::UnknownPort { .. } => "registry_unknown_port",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Invocation errors.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// The callee is not a live component.
    #[error("unknown call target {target}")]
    UnknownTarget { target: String },

    /// The call id was never issued, was issued by someone else, or was already harvested.
    #[error("unknown call {call_id}")]
    UnknownCall { call_id: u64 },

    /// The remote method returned an error.
    ///
    /// `origin` is the component where the failure started; it differs from
    /// `target` when the error was propagated through nested calls.
    #[error("{target}.{method} failed (origin {origin}): {message}")]
    RemoteFailure {
        target: String,
        origin: String,
        method: String,
        message: String,
    },

    /// The caller or callee was cancelled.
    #[error("invocation cancelled")]
    Cancelled,

    /// A wait expired; the call is still in flight.
    #[error("wait timed out after {after:?}")]
    Timeout { after: Duration },
}

impl InvocationError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            InvocationError::UnknownTarget { .. } => "invocation_unknown_target",
            InvocationError::UnknownCall { .. } => "invocation_unknown_call",
            InvocationError::RemoteFailure { .. } => "invocation_remote_failure",
            InvocationError::Cancelled => "invocation_cancelled",
            InvocationError::Timeout { .. } => "invocation_timeout",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Event service errors.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("subscriber {subscriber} not recognized")]
    UnknownSubscriber { subscriber: u64 },

    #[error("topic {topic} not recognized")]
    UnknownTopic { topic: String },

    #[error("duplicate event listener {listener} on topic {topic}")]
    DuplicateListener { topic: String, listener: String },

    #[error("subscriber {subscriber} already holds subscription {subscription}")]
    DuplicateSubscription { subscriber: u64, subscription: String },

    #[error("subscriber {subscriber} has no subscription {subscription}")]
    UnknownSubscription { subscriber: u64, subscription: String },

    /// Listener keys name the subscription they belong to.
    #[error("listener key {listener} does not match subscription {subscription}")]
    ListenerKeyMismatch {
        subscription: String,
        listener: String,
    },
}

impl EventError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            EventError::UnknownSubscriber { .. } => "event_unknown_subscriber",
            EventError::UnknownTopic { .. } => "event_unknown_topic",
            EventError::DuplicateListener { .. } => "event_duplicate_listener",
            EventError::DuplicateSubscription { .. } => "event_duplicate_subscription",
            EventError::UnknownSubscription { .. } => "event_unknown_subscription",
            EventError::ListenerKeyMismatch { .. } => "event_listener_key_mismatch",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Phase gate errors.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhaseError {
    /// A requested phase depends on one that is not done.
    #[error("unable to continue to {phase}: {missing} = NOT_DONE")]
    PrerequisiteMissing { phase: String, missing: String },

    /// A phase ran and failed.
    #[error("{phase} failed in {component}: {reason}")]
    Failed {
        phase: String,
        component: String,
        reason: String,
    },
}

impl PhaseError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            PhaseError::PrerequisiteMissing { .. } => "phase_prerequisite_missing",
            PhaseError::Failed { .. } => "phase_failed",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }
}

/// # Errors a service request can answer with.
///
/// Every handler error is wrapped here so it reaches the originating caller
/// unchanged.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error(transparent)]
    Event(#[from] EventError),

    /// A file staging operation failed.
    #[error("staging failed: {reason}")]
    Staging { reason: String },

    /// A suspended request outlived its timeout; it may be reissued.
    #[error("request expired after {after:?}")]
    Expired { after: Duration },

    /// The requester was cancelled while suspended.
    #[error("request cancelled")]
    Cancelled,

    /// The router answered with something the caller did not ask for.
    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    /// The router is gone.
    #[error("service router closed")]
    RouterClosed,
}

impl ServiceError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ServiceError::Config(e) => e.as_label(),
            ServiceError::Resource(e) => e.as_label(),
            ServiceError::Launch(e) => e.as_label(),
            ServiceError::Pool(e) => e.as_label(),
            ServiceError::Registry(e) => e.as_label(),
            ServiceError::Invocation(e) => e.as_label(),
            ServiceError::Event(e) => e.as_label(),
            ServiceError::Staging { .. } => "service_staging",
            ServiceError::Expired { .. } => "service_expired",
            ServiceError::Cancelled => "service_cancelled",
            ServiceError::Protocol { .. } => "service_protocol",
            ServiceError::RouterClosed => "service_router_closed",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }

    /// Component where a remote failure started, if this is one.
    pub fn origin(&self) -> Option<&str> {
        match self {
            ServiceError::Invocation(InvocationError::RemoteFailure { origin, .. }) => {
                Some(origin)
            }
            _ => None,
        }
    }
}

/// # Errors returned by component methods.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    /// The method failed.
    #[error("execution failed: {error}")]
    Fail { error: String },

    /// The method does not exist on this component.
    #[error("unknown method {method}")]
    UnknownMethod { method: String },

    /// A service request made by the method failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The method panicked.
    #[error("panicked: {info}")]
    Panicked { info: String },

    /// The component was cancelled before it could answer.
    #[error("context cancelled")]
    Canceled,
}

impl ComponentError {
    /// Shorthand for [`ComponentError::Fail`].
    pub fn fail(error: impl Into<String>) -> Self {
        ComponentError::Fail {
            error: error.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ComponentError::Fail { .. } => "component_failed",
            ComponentError::UnknownMethod { .. } => "component_unknown_method",
            ComponentError::Service(e) => e.as_label(),
            ComponentError::Panicked { .. } => "component_panicked",
            ComponentError::Canceled => "component_canceled",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }

    /// Component where a propagated remote failure started.
    pub fn origin(&self) -> Option<&str> {
        match self {
            ComponentError::Service(e) => e.origin(),
            _ => None,
        }
    }
}

/// # Errors produced by the framework runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some components remained stuck.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}; forcing termination")]
    GraceExceeded {
        grace: Duration,
        stuck: Vec<ComponentId>,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    /// A termination signal stopped the run.
    #[error("interrupted by signal")]
    Interrupted,

    /// The router stopped on an internal fault.
    #[error("service router failed: {reason}")]
    Router { reason: String },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
            RuntimeError::Config(e) => e.as_label(),
            RuntimeError::Phase(e) => e.as_label(),
            RuntimeError::Service(e) => e.as_label(),
            RuntimeError::Interrupted => "runtime_interrupted",
            RuntimeError::Router { .. } => "runtime_router",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            RuntimeError::GraceExceeded { grace, stuck } => {
                let stuck: Vec<String> = stuck.iter().map(ToString::to_string).collect();
                format!("grace exceeded after {grace:?}; stuck components={stuck:?}")
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_keeps_domain_label() {
        let err: ServiceError = ResourceError::BadRequest {
            owner: "s@W@1".into(),
            task_id: 3,
            requested: 20,
            capacity: 10,
        }
        .into();
        assert_eq!(err.as_label(), "resource_bad_request");
        assert!(err.as_message().contains("20 cores"));
    }

    #[test]
    fn test_origin_survives_nesting() {
        let remote = ServiceError::from(InvocationError::RemoteFailure {
            target: "s@Driver@0".into(),
            origin: "s@Worker@1".into(),
            method: "step".into(),
            message: "boom".into(),
        });
        let err = ComponentError::from(remote);
        assert_eq!(err.origin(), Some("s@Worker@1"));
        assert_eq!(ComponentError::fail("x").origin(), None);
    }

    #[test]
    fn test_prerequisite_message() {
        let err = PhaseError::PrerequisiteMissing {
            phase: "RUN".into(),
            missing: "RUN_SETUP".into(),
        };
        assert_eq!(err.to_string(), "unable to continue to RUN: RUN_SETUP = NOT_DONE");
        assert_eq!(err.as_label(), "phase_prerequisite_missing");
    }
}
