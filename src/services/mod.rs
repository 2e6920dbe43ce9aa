//! # Services proxy.
//!
//! The only handle a component has on the framework. Each method turns into a
//! [`Request`] on the router inbox and waits for the response carrying the
//! same message id.
//!
//! ```text
//! component ──► proxy.launch_task(req)
//!                 ├─► RouterMsg::Request { from, msg_id, LaunchTask }
//!                 └─► await (msg_id, result) on the response channel
//!                       (answers for other in-flight ids are stashed)
//! ```
//!
//! ## Rules
//! - Requests from one proxy reach the router in issue order.
//! - A request whose component is cancelled fails with
//!   [`ServiceError::Cancelled`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::component::ComponentId;
use crate::config::ComponentConfig;
use crate::error::ServiceError;
use crate::invocation::CallId;
use crate::logsock::LogRecord;
use crate::resources::Allocation;
use crate::runtime::{Request, Response, RouterMsg, ServiceResult};
use crate::tasks::{TaskId, TaskRequest};
use crate::topics::{ComponentEvents, ListenerTable};

/// Severity of a component log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Answers read on behalf of other in-flight requests.
#[derive(Default)]
struct Stash {
    answers: HashMap<u64, ServiceResult>,
    /// Requests whose caller stopped waiting before the answer came.
    abandoned: HashSet<u64>,
}

/// Abandons its request when dropped unanswered.
struct InFlight<'a> {
    proxy: &'a ServicesProxy,
    msg_id: u64,
    answered: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.answered {
            self.proxy.abandon(self.msg_id);
        }
    }
}

/// Component-side endpoint of the service router.
pub struct ServicesProxy {
    id: ComponentId,
    config: Arc<ComponentConfig>,
    working_dir: PathBuf,
    router: mpsc::UnboundedSender<RouterMsg>,
    responses: Mutex<mpsc::UnboundedReceiver<(u64, ServiceResult)>>,
    stash: StdMutex<Stash>,
    next_msg: AtomicU64,
    cancel: CancellationToken,
    log: Option<mpsc::UnboundedSender<LogRecord>>,
    listeners: ListenerTable,
}

impl ServicesProxy {
    pub(crate) fn new(
        id: ComponentId,
        config: Arc<ComponentConfig>,
        working_dir: PathBuf,
        router: mpsc::UnboundedSender<RouterMsg>,
        responses: mpsc::UnboundedReceiver<(u64, ServiceResult)>,
        cancel: CancellationToken,
        log: Option<mpsc::UnboundedSender<LogRecord>>,
    ) -> Self {
        Self {
            id,
            config,
            working_dir,
            router,
            responses: Mutex::new(responses),
            stash: StdMutex::new(Stash::default()),
            next_msg: AtomicU64::new(1),
            cancel,
            log,
            listeners: ListenerTable::new(),
        }
    }

    pub fn component_id(&self) -> &ComponentId {
        &self.id
    }

    pub fn sim_name(&self) -> &str {
        self.id.sim_name()
    }

    /// This component's configuration section.
    pub fn config(&self) -> &ComponentConfig {
        &self.config
    }

    /// Working directory assigned at creation (see also [`Self::get_working_dir`]).
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Cancelled when the framework stops this component.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn listeners(&self) -> &ListenerTable {
        &self.listeners
    }

    /// Event service for this component.
    pub fn events(&self) -> ComponentEvents<'_> {
        ComponentEvents::new(self)
    }

    /// Sends a raw request and waits for its answer.
    pub async fn request(&self, request: Request) -> ServiceResult {
        let msg_id = self.next_msg.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(component = %self.id, msg_id, method = request.method(), "service request");
        self.router
            .send(RouterMsg::Request {
                from: self.id.clone(),
                msg_id,
                request,
            })
            .map_err(|_| ServiceError::RouterClosed)?;
        let mut in_flight = InFlight {
            proxy: self,
            msg_id,
            answered: false,
        };
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(ServiceError::Cancelled),
            r = self.await_response(msg_id) => {
                in_flight.answered = true;
                r
            }
        };
        drop(in_flight);
        result
    }

    async fn await_response(&self, msg_id: u64) -> ServiceResult {
        loop {
            if let Some(r) = self.take_stashed(msg_id) {
                return r;
            }
            let mut rx = self.responses.lock().await;
            if let Some(r) = self.take_stashed(msg_id) {
                return r;
            }
            match rx.recv().await {
                Some((id, r)) if id == msg_id => return r,
                Some((id, r)) => {
                    let mut stash = self.stash.lock().unwrap_or_else(|p| p.into_inner());
                    if !stash.abandoned.remove(&id) {
                        stash.answers.insert(id, r);
                    }
                }
                None => return Err(ServiceError::RouterClosed),
            }
        }
    }

    fn take_stashed(&self, msg_id: u64) -> Option<ServiceResult> {
        self.stash
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .answers
            .remove(&msg_id)
    }

    /// Drops the answer to `msg_id`, now or whenever it arrives.
    fn abandon(&self, msg_id: u64) {
        let mut stash = self.stash.lock().unwrap_or_else(|p| p.into_inner());
        if stash.answers.remove(&msg_id).is_none() {
            stash.abandoned.insert(msg_id);
        }
    }

    // ---- config and metadata ----

    /// Parameter from this component's section, else the simulation, else the
    /// environment.
    pub async fn get_config_param(&self, key: &str) -> Result<Option<String>, ServiceError> {
        match self
            .request(Request::GetConfigParam {
                key: key.to_string(),
            })
            .await?
        {
            Response::Param(v) => Ok(v),
            other => Err(unexpected("get_config_param", &other)),
        }
    }

    /// Registry field of a component in this simulation. `port`, `class`,
    /// `name`, `sim` and `working_dir` always exist.
    pub async fn get_component_field(
        &self,
        target: &ComponentId,
        field: &str,
    ) -> Result<Option<Value>, ServiceError> {
        match self
            .request(Request::GetComponentField {
                target: target.clone(),
                field: field.to_string(),
            })
            .await?
        {
            Response::Field(v) => Ok(v),
            other => Err(unexpected("get_component_field", &other)),
        }
    }

    /// Publishes a field on this component's registry entry. Setting
    /// `working_dir` moves where later tasks and staging run.
    pub async fn set_component_field(&self, field: &str, value: Value) -> Result<(), ServiceError> {
        self.unit(Request::SetComponentField {
            field: field.to_string(),
            value,
        })
        .await
    }

    pub async fn get_time_loop(&self) -> Result<Vec<f64>, ServiceError> {
        match self.request(Request::GetTimeLoop).await? {
            Response::TimeLoop(v) => Ok(v),
            other => Err(unexpected("get_time_loop", &other)),
        }
    }

    pub async fn get_working_dir(&self) -> Result<PathBuf, ServiceError> {
        match self.request(Request::GetWorkingDir).await? {
            Response::Path(p) => Ok(p),
            other => Err(unexpected("get_working_dir", &other)),
        }
    }

    /// Component bound to `port` in this simulation.
    pub async fn get_port(&self, port: &str) -> Result<ComponentId, ServiceError> {
        match self
            .request(Request::GetPort {
                port: port.to_string(),
            })
            .await?
        {
            Response::Component(id) => Ok(id),
            other => Err(unexpected("get_port", &other)),
        }
    }

    // ---- state staging ----

    /// Copies state files from the shared state directory into the working
    /// directory. `None` stages every configured state file.
    pub async fn stage_plasma_state(&self, files: Option<Vec<String>>) -> Result<(), ServiceError> {
        self.unit(Request::StagePlasmaState { files }).await
    }

    /// Copies state files from the working directory back to the shared state.
    pub async fn update_plasma_state(&self, files: Option<Vec<String>>) -> Result<(), ServiceError> {
        self.unit(Request::UpdatePlasmaState { files }).await
    }

    /// Merges `partial` into the shared state file `target` with the
    /// configured merge tool.
    pub async fn merge_current_plasma_state(
        &self,
        partial: impl Into<PathBuf>,
        target: &str,
        log_file: Option<PathBuf>,
    ) -> Result<(), ServiceError> {
        self.unit(Request::MergeCurrentPlasmaState {
            partial: partial.into(),
            target: target.to_string(),
            log_file,
        })
        .await
    }

    pub async fn stage_input_files(&self, files: Option<Vec<String>>) -> Result<(), ServiceError> {
        self.unit(Request::StageInputFiles { files }).await
    }

    pub async fn stage_output_files(
        &self,
        timestamp: f64,
        files: Option<Vec<String>>,
    ) -> Result<(), ServiceError> {
        self.unit(Request::StageOutputFiles { timestamp, files })
            .await
    }

    // ---- resources ----

    /// Reserves `nproc` cores. With `block` the request waits for capacity
    /// held by others instead of failing with `Insufficient`.
    pub async fn get_allocation(
        &self,
        nproc: usize,
        ppn: Option<usize>,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<Allocation, ServiceError> {
        match self
            .request(Request::GetAllocation {
                nproc,
                ppn,
                block,
                timeout,
            })
            .await?
        {
            Response::Allocation(a) => Ok(a),
            other => Err(unexpected("get_allocation", &other)),
        }
    }

    pub async fn release_allocation(&self, task_id: TaskId) -> Result<(), ServiceError> {
        self.unit(Request::ReleaseAllocation { task_id }).await
    }

    // ---- tasks ----

    /// Allocates cores for `request` and launches it.
    pub async fn launch_task(&self, request: TaskRequest) -> Result<TaskId, ServiceError> {
        self.launch(request, None).await
    }

    /// Launches on an allocation obtained from [`Self::get_allocation`].
    pub async fn launch_task_on(
        &self,
        allocation: &Allocation,
        request: TaskRequest,
    ) -> Result<TaskId, ServiceError> {
        self.launch(request, Some(allocation.task_id)).await
    }

    async fn launch(
        &self,
        request: TaskRequest,
        allocation: Option<TaskId>,
    ) -> Result<TaskId, ServiceError> {
        match self
            .request(Request::LaunchTask {
                request,
                allocation,
            })
            .await?
        {
            Response::TaskId(id) => Ok(id),
            other => Err(unexpected("launch_task", &other)),
        }
    }

    /// Waits for a task and returns its exit code.
    pub async fn wait_task(&self, task_id: TaskId) -> Result<i32, ServiceError> {
        self.wait_task_timeout(task_id, None).await
    }

    pub async fn wait_task_timeout(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> Result<i32, ServiceError> {
        match self.request(Request::WaitTask { task_id, timeout }).await? {
            Response::ExitCode(c) => Ok(c),
            other => Err(unexpected("wait_task", &other)),
        }
    }

    /// Exit code if the task has finished, `None` while it runs.
    pub async fn wait_task_nonblocking(&self, task_id: TaskId) -> Result<Option<i32>, ServiceError> {
        match self.request(Request::WaitTaskNonblocking { task_id }).await? {
            Response::MaybeExit(c) => Ok(c),
            other => Err(unexpected("wait_task_nonblocking", &other)),
        }
    }

    pub async fn wait_tasklist(
        &self,
        task_ids: Vec<TaskId>,
        timeout: Option<Duration>,
    ) -> Result<BTreeMap<TaskId, i32>, ServiceError> {
        match self.request(Request::WaitTasklist { task_ids, timeout }).await? {
            Response::ExitCodes(m) => Ok(m),
            other => Err(unexpected("wait_tasklist", &other)),
        }
    }

    /// Exit codes of this component's tasks that finished since the previous
    /// poll. Polled tasks can still be waited on.
    pub async fn poll_tasks(&self) -> Result<BTreeMap<TaskId, i32>, ServiceError> {
        match self.request(Request::PollTasks).await? {
            Response::ExitCodes(m) => Ok(m),
            other => Err(unexpected("poll_tasks", &other)),
        }
    }

    pub async fn kill_task(&self, task_id: TaskId) -> Result<(), ServiceError> {
        self.unit(Request::KillTask { task_id }).await
    }

    /// Kills every running task of this component.
    pub async fn kill_all_tasks(&self) -> Result<(), ServiceError> {
        self.unit(Request::KillAllTasks).await
    }

    // ---- task pools ----

    pub async fn create_task_pool(&self, pool: &str) -> Result<(), ServiceError> {
        self.unit(Request::CreateTaskPool {
            pool: pool.to_string(),
        })
        .await
    }

    pub async fn add_task(
        &self,
        pool: &str,
        name: &str,
        request: TaskRequest,
    ) -> Result<TaskId, ServiceError> {
        match self
            .request(Request::AddTask {
                pool: pool.to_string(),
                name: name.to_string(),
                request,
            })
            .await?
        {
            Response::TaskId(id) => Ok(id),
            other => Err(unexpected("add_task", &other)),
        }
    }

    /// Runs the pool to completion and returns every exit code.
    pub async fn submit_tasks(&self, pool: &str) -> Result<BTreeMap<TaskId, i32>, ServiceError> {
        match self
            .request(Request::SubmitTasks {
                pool: pool.to_string(),
                block: true,
                timeout: None,
            })
            .await?
        {
            Response::ExitCodes(m) => Ok(m),
            other => Err(unexpected("submit_tasks", &other)),
        }
    }

    /// Starts what fits now and returns how many tasks were launched; the
    /// rest follow as capacity frees up.
    pub async fn submit_tasks_nonblocking(&self, pool: &str) -> Result<usize, ServiceError> {
        match self
            .request(Request::SubmitTasks {
                pool: pool.to_string(),
                block: false,
                timeout: None,
            })
            .await?
        {
            Response::Count(n) => Ok(n),
            other => Err(unexpected("submit_tasks", &other)),
        }
    }

    /// Finished results not collected yet. With `block` waits for at least
    /// one; fails with `PoolError::Empty` once nothing is left.
    pub async fn get_finished_tasks(
        &self,
        pool: &str,
        block: bool,
    ) -> Result<BTreeMap<TaskId, i32>, ServiceError> {
        match self
            .request(Request::GetFinishedTasks {
                pool: pool.to_string(),
                block,
                timeout: None,
            })
            .await?
        {
            Response::ExitCodes(m) => Ok(m),
            other => Err(unexpected("get_finished_tasks", &other)),
        }
    }

    pub async fn remove_task_pool(&self, pool: &str) -> Result<(), ServiceError> {
        self.unit(Request::RemoveTaskPool {
            pool: pool.to_string(),
        })
        .await
    }

    // ---- invocation ----

    /// Calls `method` on `target` and waits for the result.
    pub async fn call(
        &self,
        target: &ComponentId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ServiceError> {
        let call_id = self.call_nonblocking(target, method, args).await?;
        self.wait_call(call_id, None).await
    }

    pub async fn call_nonblocking(
        &self,
        target: &ComponentId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<CallId, ServiceError> {
        match self
            .request(Request::CallNonblocking {
                target: target.clone(),
                method: method.to_string(),
                args,
            })
            .await?
        {
            Response::CallId(id) => Ok(id),
            other => Err(unexpected("call_nonblocking", &other)),
        }
    }

    pub async fn wait_call(
        &self,
        call_id: CallId,
        timeout: Option<Duration>,
    ) -> Result<Value, ServiceError> {
        match self.request(Request::WaitCall { call_id, timeout }).await? {
            Response::Value(v) => Ok(v),
            other => Err(unexpected("wait_call", &other)),
        }
    }

    /// Results of every call, in the order of `call_ids`.
    pub async fn wait_call_list(
        &self,
        call_ids: Vec<CallId>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>, ServiceError> {
        match self.request(Request::WaitCallList { call_ids, timeout }).await? {
            Response::Values(v) => Ok(v),
            other => Err(unexpected("wait_call_list", &other)),
        }
    }

    /// First finished call among `call_ids`.
    pub async fn wait_any(
        &self,
        call_ids: Vec<CallId>,
        timeout: Option<Duration>,
    ) -> Result<(CallId, Value), ServiceError> {
        match self.request(Request::WaitAny { call_ids, timeout }).await? {
            Response::AnyResult { call_id, value } => Ok((call_id, value)),
            other => Err(unexpected("wait_any", &other)),
        }
    }

    // ---- workflow ----

    /// Starts a nested simulation sharing this framework's resources.
    /// Returns its name and driver.
    pub async fn create_sub_workflow(
        &self,
        config: impl Into<PathBuf>,
        overrides: BTreeMap<String, String>,
    ) -> Result<(String, ComponentId), ServiceError> {
        match self
            .request(Request::CreateSubWorkflow {
                config: config.into(),
                overrides,
            })
            .await?
        {
            Response::SubWorkflow { sim, driver } => Ok((sim, driver)),
            other => Err(unexpected("create_sub_workflow", &other)),
        }
    }

    /// Publishes a portal record for this component.
    pub async fn send_portal_event(&self, event_type: &str, comment: &str) -> Result<(), ServiceError> {
        self.unit(Request::SendPortalEvent {
            event_type: event_type.to_string(),
            comment: comment.to_string(),
        })
        .await
    }

    // ---- logging ----

    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        let message = message.as_ref();
        match level {
            LogLevel::Debug => debug!(component = %self.id, "{message}"),
            LogLevel::Info => info!(component = %self.id, "{message}"),
            LogLevel::Warning => warn!(component = %self.id, "{message}"),
            LogLevel::Error => error!(component = %self.id, "{message}"),
        }
        if let Some(tx) = &self.log {
            let _ = tx.send(LogRecord::new(
                self.id.sim_name(),
                self.id.to_string(),
                level.as_str(),
                message,
            ));
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }

    async fn unit(&self, request: Request) -> Result<(), ServiceError> {
        self.request(request).await.map(|_| ())
    }
}

pub(crate) fn unexpected(method: &str, got: &Response) -> ServiceError {
    ServiceError::Protocol {
        reason: format!("{method}: unexpected response {got:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> (
        ServicesProxy,
        mpsc::UnboundedReceiver<RouterMsg>,
        mpsc::UnboundedSender<(u64, ServiceResult)>,
    ) {
        let (router, router_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let proxy = ServicesProxy::new(
            ComponentId::new("svc", "T"),
            Arc::new(ComponentConfig::default()),
            std::env::temp_dir(),
            router,
            resp_rx,
            CancellationToken::new(),
            None,
        );
        (proxy, router_rx, resp_tx)
    }

    fn stashed(p: &ServicesProxy) -> (usize, usize) {
        let s = p.stash.lock().unwrap();
        (s.answers.len(), s.abandoned.len())
    }

    #[tokio::test]
    async fn test_late_answer_of_dropped_request_is_discarded() {
        let (p, _router, resp) = proxy();
        let dropped = tokio::time::timeout(
            Duration::from_millis(20),
            p.request(Request::GetTimeLoop),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(stashed(&p), (0, 1));

        resp.send((1, Ok(Response::TimeLoop(vec![1.0])))).unwrap();
        resp.send((2, Ok(Response::TimeLoop(vec![2.0])))).unwrap();
        assert_eq!(p.get_time_loop().await.unwrap(), vec![2.0]);
        assert_eq!(stashed(&p), (0, 0));
    }

    #[tokio::test]
    async fn test_out_of_order_answers_are_stashed() {
        let (p, _router, resp) = proxy();
        resp.send((2, Ok(Response::Unit))).unwrap();
        resp.send((1, Ok(Response::TimeLoop(vec![0.5])))).unwrap();
        assert_eq!(p.get_time_loop().await.unwrap(), vec![0.5]);
        assert_eq!(stashed(&p), (1, 0));
        assert_eq!(p.request(Request::GetWorkingDir).await.unwrap(), Response::Unit);
        assert_eq!(stashed(&p), (0, 0));
    }
}
