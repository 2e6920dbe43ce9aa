//! Messages exchanged with the service router.
//!
//! Every service a component can ask for is one [`Request`] variant; the router
//! answers with the matching [`Response`] variant or a [`ServiceError`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::component::ComponentId;
use crate::config::SimulationConfig;
use crate::error::{ComponentError, ServiceError};
use crate::invocation::CallId;
use crate::logsock::LogRecord;
use crate::resources::{Allocation, NodeSpec, ResourceSnapshot};
use crate::tasks::{TaskId, TaskRequest};
use crate::topics::{Drained, SubscriberId};

/// A service request.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    // --- config and metadata ---
    GetConfigParam { key: String },
    GetTimeLoop,
    GetWorkingDir,
    GetPort { port: String },
    /// Reads a registry field of any component of the caller's simulation.
    GetComponentField { target: ComponentId, field: String },
    /// Stores a registry field on the caller's own entry.
    SetComponentField { field: String, value: Value },

    // --- state staging ---
    /// `None` means every configured state file.
    StagePlasmaState { files: Option<Vec<String>> },
    UpdatePlasmaState { files: Option<Vec<String>> },
    MergeCurrentPlasmaState {
        partial: PathBuf,
        target: String,
        log_file: Option<PathBuf>,
    },
    StageInputFiles { files: Option<Vec<String>> },
    StageOutputFiles {
        timestamp: f64,
        files: Option<Vec<String>>,
    },

    // --- resources ---
    GetAllocation {
        nproc: usize,
        ppn: Option<usize>,
        block: bool,
        timeout: Option<Duration>,
    },
    ReleaseAllocation { task_id: TaskId },

    // --- tasks ---
    LaunchTask {
        request: TaskRequest,
        /// Launch on an allocation obtained with `GetAllocation`.
        allocation: Option<TaskId>,
    },
    WaitTask {
        task_id: TaskId,
        timeout: Option<Duration>,
    },
    WaitTaskNonblocking { task_id: TaskId },
    WaitTasklist {
        task_ids: Vec<TaskId>,
        timeout: Option<Duration>,
    },
    KillTask { task_id: TaskId },
    KillAllTasks,
    /// Exits since the previous poll; the tasks stay waitable.
    PollTasks,

    // --- task pools ---
    CreateTaskPool { pool: String },
    AddTask {
        pool: String,
        name: String,
        request: TaskRequest,
    },
    SubmitTasks {
        pool: String,
        block: bool,
        timeout: Option<Duration>,
    },
    GetFinishedTasks {
        pool: String,
        block: bool,
        timeout: Option<Duration>,
    },
    RemoveTaskPool { pool: String },

    // --- events ---
    GetTopic { topic: String },
    SendEvent {
        topic: String,
        header: BTreeMap<String, String>,
        body: Map<String, Value>,
    },
    RegisterSubscriber,
    GetSubscription {
        subscriber: SubscriberId,
        name: String,
    },
    RegisterListener {
        subscriber: SubscriberId,
        subscription: String,
        topic: String,
        listener: String,
    },
    UnregisterListener {
        subscriber: SubscriberId,
        topic: String,
        listener: String,
    },
    RemoveSubscription {
        subscriber: SubscriberId,
        name: String,
    },
    UnregisterSubscriber { subscriber: SubscriberId },
    ProcessEvents {
        subscriber: SubscriberId,
        block: bool,
        timeout: Option<Duration>,
    },

    // --- invocation ---
    CallNonblocking {
        target: ComponentId,
        method: String,
        args: Vec<Value>,
    },
    WaitCall {
        call_id: CallId,
        timeout: Option<Duration>,
    },
    WaitCallList {
        call_ids: Vec<CallId>,
        timeout: Option<Duration>,
    },
    WaitAny {
        call_ids: Vec<CallId>,
        timeout: Option<Duration>,
    },

    // --- workflow ---
    CreateSubWorkflow {
        config: PathBuf,
        overrides: BTreeMap<String, String>,
    },
    /// Portal record on behalf of the caller.
    SendPortalEvent {
        event_type: String,
        comment: String,
    },
}

impl Request {
    /// Service method name, as used in logs.
    pub fn method(&self) -> &'static str {
        match self {
            Request::GetConfigParam { .. } => "get_config_param",
            Request::GetTimeLoop => "get_time_loop",
            Request::GetWorkingDir => "get_working_dir",
            Request::GetPort { .. } => "get_port",
            Request::GetComponentField { .. } => "get_component_field",
            Request::SetComponentField { .. } => "set_component_field",
            Request::StagePlasmaState { .. } => "stage_plasma_state",
            Request::UpdatePlasmaState { .. } => "update_plasma_state",
            Request::MergeCurrentPlasmaState { .. } => "merge_current_plasma_state",
            Request::StageInputFiles { .. } => "stage_input_files",
            Request::StageOutputFiles { .. } => "stage_output_files",
            Request::GetAllocation { .. } => "get_allocation",
            Request::ReleaseAllocation { .. } => "release_allocation",
            Request::LaunchTask { .. } => "launch_task",
            Request::WaitTask { .. } => "wait_task",
            Request::WaitTaskNonblocking { .. } => "wait_task_nonblocking",
            Request::WaitTasklist { .. } => "wait_tasklist",
            Request::KillTask { .. } => "kill_task",
            Request::KillAllTasks => "kill_all_tasks",
            Request::PollTasks => "poll_tasks",
            Request::CreateTaskPool { .. } => "create_task_pool",
            Request::AddTask { .. } => "add_task",
            Request::SubmitTasks { .. } => "submit_tasks",
            Request::GetFinishedTasks { .. } => "get_finished_tasks",
            Request::RemoveTaskPool { .. } => "remove_task_pool",
            Request::GetTopic { .. } => "get_topic",
            Request::SendEvent { .. } => "send_event",
            Request::RegisterSubscriber => "register_subscriber",
            Request::GetSubscription { .. } => "get_subscription",
            Request::RegisterListener { .. } => "register_listener",
            Request::UnregisterListener { .. } => "unregister_listener",
            Request::RemoveSubscription { .. } => "remove_subscription",
            Request::UnregisterSubscriber { .. } => "unregister_subscriber",
            Request::ProcessEvents { .. } => "process_events",
            Request::CallNonblocking { .. } => "call_nonblocking",
            Request::WaitCall { .. } => "wait_call",
            Request::WaitCallList { .. } => "wait_call_list",
            Request::WaitAny { .. } => "wait_any",
            Request::CreateSubWorkflow { .. } => "create_sub_workflow",
            Request::SendPortalEvent { .. } => "send_portal_event",
        }
    }
}

/// A successful answer.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Unit,
    Param(Option<String>),
    Field(Option<Value>),
    TimeLoop(Vec<f64>),
    Path(PathBuf),
    Component(ComponentId),
    Allocation(Allocation),
    TaskId(TaskId),
    ExitCode(i32),
    MaybeExit(Option<i32>),
    ExitCodes(BTreeMap<TaskId, i32>),
    Count(usize),
    Subscriber(SubscriberId),
    Drained(Drained),
    CallId(CallId),
    Value(Value),
    Values(Vec<Value>),
    AnyResult { call_id: CallId, value: Value },
    SubWorkflow { sim: String, driver: ComponentId },
    Snapshot(ResourceSnapshot),
    Components(Vec<ComponentId>),
}

pub type ServiceResult = Result<Response, ServiceError>;

/// Requests only the framework may issue.
#[derive(Clone, Debug)]
pub enum Control {
    /// Instantiate every component of a simulation. Component log records
    /// go to `log`; launched tasks find `log_socket` in `IPS_LOG_SOCKET`.
    LoadSimulation {
        config: Box<SimulationConfig>,
        log: Option<mpsc::UnboundedSender<LogRecord>>,
        log_socket: Option<PathBuf>,
    },
    /// A service request on behalf of the framework of `sim`.
    Service { sim: String, request: Request },
    MarkNodeDown { node: String },
    MarkNodeUp { node: String },
    AddNodes { nodes: Vec<NodeSpec> },
    Snapshot,
}

/// Everything the router reads.
pub enum RouterMsg {
    /// From a component's services proxy.
    Request {
        from: ComponentId,
        msg_id: u64,
        request: Request,
    },
    /// A component method finished.
    MethodResult {
        callee: ComponentId,
        call_id: CallId,
        method: String,
        outcome: Result<Value, ComponentError>,
    },
    /// From the framework.
    Control {
        control: Control,
        reply: oneshot::Sender<ServiceResult>,
    },
    /// A parked request's timeout fired.
    Expire { waiter: u64 },
    /// Stop every component of `sim`; the join handles are handed back.
    Teardown {
        sim: String,
        reply: oneshot::Sender<Vec<(ComponentId, JoinHandle<()>)>>,
    },
    /// A component actor stopped.
    Exited(ComponentId),
    /// Cancel everything and stop the loop.
    Shutdown,
}
