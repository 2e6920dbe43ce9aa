//! # Service router.
//!
//! One tokio task that owns every piece of core state: the component
//! registry, the resource manager, the task launcher and pools, the topic
//! service and the invocation engine. Components and the framework reach it
//! only through [`RouterMsg`]s; nothing else takes a lock on core state.
//!
//! ```text
//!             ┌──────────── select (biased) ─────────────┐
//! root token ─┤ cancelled      ─► stop everything, exit   │
//! exits     ──┤ TaskExit       ─► on_task_exit            │
//! inbox     ──┤ RouterMsg      ─► handle ─► serve ─► Step │
//!             └───────────────────────────────────────────┘
//!
//! Step::Done(result)   reply now
//! Step::Park(wait)     hold the caller until `wait` resolves (or expires)
//! Step::Queue(wait)    hold the caller in the FIFO capacity queue
//! Step::Stage(job)     run the copy/merge off the loop, reply when done
//! ```
//!
//! ## Rules
//! - Requests from one caller are served in arrival order.
//! - The capacity queue is strict FIFO: only its head may take freed cores,
//!   and a head that still does not fit keeps its place.
//! - A parked wait that times out answers `Expired` (`Timeout` for call
//!   waits); the underlying work is untouched and the wait may be reissued.
//! - Stopping a component fails its parked waits with `Cancelled`, kills its
//!   tasks, releases its idle allocations, discards its call results and
//!   drops its subscribers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::message::{Control, Request, Response, RouterMsg, ServiceResult};
use crate::component::{ComponentCatalog, ComponentId, Invocation, run_component};
use crate::config::{ComponentConfig, DRIVER_PORT, SimulationConfig};
use crate::error::{
    ConfigError, EventError, InvocationError, LaunchError, PoolError, RegistryError,
    ResourceError, ServiceError,
};
use crate::events::{Bus, MonitorEvent, MonitorKind};
use crate::invocation::{InvocationEngine, WaitKind, WaitOutcome, remote_failure};
use crate::logsock::LogRecord;
use crate::registry::{Entry, Registry, ResponseTx};
use crate::resources::{Allocation, NodeSpec, ResourceManager};
use crate::services::ServicesProxy;
use crate::staging::{self, StagingJob};
use crate::tasks::{
    CancelReason, PoolTask, SubmitStep, TaskExit, TaskId, TaskLauncher, TaskPool, TaskRequest,
    next_task_id, submit_ready,
};
use crate::topics::{MONITOR_TOPIC, SubscriberId, TopicService};

/// Join handles of stopped component actors.
pub(crate) type Stopped = Vec<(ComponentId, JoinHandle<()>)>;

/// Pools are named per owner.
type PoolKey = (ComponentId, String);

/// Where an answer goes.
enum Responder {
    Component { tx: ResponseTx, msg_id: u64 },
    Control(oneshot::Sender<ServiceResult>),
}

impl Responder {
    fn send(self, result: ServiceResult) {
        match self {
            Responder::Component { tx, msg_id } => {
                let _ = tx.send((msg_id, result));
            }
            Responder::Control(tx) => {
                let _ = tx.send(result);
            }
        }
    }
}

struct Caller {
    id: ComponentId,
    responder: Responder,
}

/// What a parked caller waits for.
enum Wait {
    Allocation {
        nproc: usize,
        ppn: Option<usize>,
        task_id: TaskId,
    },
    Launch {
        request: TaskRequest,
        task_id: TaskId,
    },
    Task(TaskId),
    Tasklist(Vec<TaskId>),
    Call(WaitKind),
    /// Every task of the pool finished.
    PoolDone(PoolKey),
    /// At least one uncollected result.
    PoolFinished(PoolKey),
    Events(SubscriberId),
}

struct Waiter {
    caller: Caller,
    wait: Wait,
    timeout: Option<Duration>,
    timer: Option<JoinHandle<()>>,
}

impl Waiter {
    fn answer(self, result: ServiceResult) {
        if let Some(t) = &self.timer {
            t.abort();
        }
        self.caller.responder.send(result);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Capacity {
    Waiter(u64),
    Pool(PoolKey),
}

enum Step {
    Done(ServiceResult),
    Park(Wait, Option<Duration>),
    Queue(Wait, Option<Duration>),
    Stage(StagingJob),
}

/// Per-simulation state.
struct SimState {
    config: Arc<SimulationConfig>,
    /// Caller id used for requests the framework makes on this simulation.
    framework: ComponentId,
    cancel: CancellationToken,
    log: Option<mpsc::UnboundedSender<LogRecord>>,
    log_socket: Option<PathBuf>,
    /// Simulation that created this one as a sub-workflow.
    parent: Option<String>,
}

/// Everything the router needs at start.
pub(crate) struct RouterParts {
    pub catalog: Arc<ComponentCatalog>,
    pub rm: ResourceManager,
    pub launcher: TaskLauncher,
    pub bus: Bus,
    pub max_pending_events: usize,
    pub tx: mpsc::UnboundedSender<RouterMsg>,
    pub root: CancellationToken,
}

pub(crate) struct Router {
    catalog: Arc<ComponentCatalog>,
    tx: mpsc::UnboundedSender<RouterMsg>,
    registry: Registry,
    rm: ResourceManager,
    launcher: TaskLauncher,
    pools: HashMap<PoolKey, TaskPool>,
    pool_of_task: HashMap<TaskId, PoolKey>,
    topics: TopicService,
    calls: InvocationEngine,
    sims: HashMap<String, SimState>,
    parked: BTreeMap<u64, Waiter>,
    capacity: VecDeque<Capacity>,
    next_waiter: u64,
    /// Set when a topic received events; parked `process_events` are retried.
    topics_dirty: bool,
    bus: Bus,
    root: CancellationToken,
}

impl Router {
    pub(crate) fn new(parts: RouterParts) -> Self {
        Self {
            catalog: parts.catalog,
            tx: parts.tx,
            registry: Registry::new(),
            rm: parts.rm,
            launcher: parts.launcher,
            pools: HashMap::new(),
            pool_of_task: HashMap::new(),
            topics: TopicService::new(parts.max_pending_events),
            calls: InvocationEngine::new(),
            sims: HashMap::new(),
            parked: BTreeMap::new(),
            capacity: VecDeque::new(),
            next_waiter: 1,
            topics_dirty: false,
            bus: parts.bus,
            root: parts.root,
        }
    }

    /// Serves until the root token is cancelled or `Shutdown` arrives.
    /// Returns the actors still running at that point, already cancelled.
    pub(crate) async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<RouterMsg>,
        mut exits: mpsc::UnboundedReceiver<TaskExit>,
    ) -> Stopped {
        debug!("service router started");
        loop {
            tokio::select! {
                biased;
                _ = self.root.cancelled() => break,
                Some(exit) = exits.recv() => self.on_task_exit(exit),
                msg = inbox.recv() => match msg {
                    None | Some(RouterMsg::Shutdown) => break,
                    Some(msg) => self.handle(msg),
                },
            }
            if self.topics_dirty {
                self.topics_dirty = false;
                self.wake(|w| matches!(w.wait, Wait::Events(_)));
            }
        }
        let stopped = self.stop_all();
        debug!(stopped = stopped.len(), "service router stopped");
        stopped
    }

    fn handle(&mut self, msg: RouterMsg) {
        match msg {
            RouterMsg::Request {
                from,
                msg_id,
                request,
            } => {
                let tx = match self.registry.get(&from) {
                    Ok(e) => e.responses.clone(),
                    Err(_) => {
                        debug!(component = %from, method = request.method(), "request from stopped component dropped");
                        return;
                    }
                };
                let caller = Caller {
                    id: from,
                    responder: Responder::Component { tx, msg_id },
                };
                self.dispatch(caller, request);
            }
            RouterMsg::MethodResult {
                callee,
                call_id,
                method,
                outcome,
            } => self.on_method_result(callee, call_id, &method, outcome),
            RouterMsg::Control { control, reply } => self.on_control(control, reply),
            RouterMsg::Expire { waiter } => self.expire(waiter),
            RouterMsg::Teardown { sim, reply } => {
                let stopped = self.teardown_sim(&sim);
                let _ = reply.send(stopped);
            }
            RouterMsg::Exited(id) => self.on_exited(id),
            RouterMsg::Shutdown => {}
        }
    }

    fn dispatch(&mut self, caller: Caller, request: Request) {
        trace!(caller = %caller.id, method = request.method(), "serving");
        let step = match self.serve(&caller.id, request) {
            Ok(step) => step,
            Err(e) => Step::Done(Err(e)),
        };
        match step {
            Step::Done(result) => caller.responder.send(result),
            Step::Park(wait, timeout) => {
                self.park(caller, wait, timeout);
            }
            Step::Queue(wait, timeout) => {
                let k = self.park(caller, wait, timeout);
                self.capacity.push_back(Capacity::Waiter(k));
            }
            Step::Stage(job) => {
                tokio::spawn(async move {
                    let result = job.run().await.map(|_| Response::Unit);
                    caller.responder.send(result);
                });
            }
        }
    }

    fn serve(&mut self, caller: &ComponentId, request: Request) -> Result<Step, ServiceError> {
        let done = |r: Response| Ok(Step::Done(Ok(r)));
        match request {
            // ---- config and metadata ----
            Request::GetConfigParam { key } => {
                let sim = self.sim(caller)?;
                let value = self
                    .registry
                    .get(caller)
                    .ok()
                    .and_then(|e| e.config.param(&key).map(str::to_string))
                    .or_else(|| sim.config.tree.lookup(&key).map(str::to_string))
                    .or_else(|| sim.config.param(&key));
                done(Response::Param(value))
            }
            Request::GetTimeLoop => {
                let sim = self.sim(caller)?;
                let values = sim
                    .config
                    .time_loop
                    .as_ref()
                    .map(|t| t.values())
                    .ok_or_else(|| ConfigError::MissingKey {
                        key: "TIME_LOOP".into(),
                        scope: "simulation file".into(),
                    })?;
                done(Response::TimeLoop(values))
            }
            Request::GetWorkingDir => done(Response::Path(self.working_dir(caller)?)),
            Request::GetPort { port } => {
                let id = self.registry.port(caller.sim_name(), &port)?.clone();
                done(Response::Component(id))
            }

            Request::GetComponentField { target, field } => {
                if target.sim_name() != caller.sim_name() {
                    return Err(RegistryError::UnknownComponent {
                        id: target.to_string(),
                    }
                    .into());
                }
                done(Response::Field(self.registry.get_field(&target, &field)?))
            }
            Request::SetComponentField { field, value } => {
                self.registry.set_field(caller, &field, value)?;
                done(Response::Unit)
            }

            // ---- state staging ----
            Request::StagePlasmaState { files } => {
                let sim = self.sim(caller)?;
                Ok(Step::Stage(StagingJob::Copy {
                    from: sim.config.state_dir.clone(),
                    to: self.working_dir(caller)?,
                    files: files.unwrap_or_else(|| sim.config.state_files.clone()),
                }))
            }
            Request::UpdatePlasmaState { files } => {
                let sim = self.sim(caller)?;
                Ok(Step::Stage(StagingJob::Copy {
                    from: self.working_dir(caller)?,
                    to: sim.config.state_dir.clone(),
                    files: files.unwrap_or_else(|| sim.config.state_files.clone()),
                }))
            }
            Request::MergeCurrentPlasmaState {
                partial,
                target,
                log_file,
            } => {
                let sim = self.sim(caller)?;
                let tool = sim
                    .config
                    .merge_tool
                    .clone()
                    .ok_or_else(|| ConfigError::MissingKey {
                        key: "MERGE_TOOL".into(),
                        scope: "simulation file".into(),
                    })?;
                let cwd = self.working_dir(caller)?;
                Ok(Step::Stage(StagingJob::Merge {
                    tool,
                    target: sim.config.state_dir.join(target),
                    partial: cwd.join(partial),
                    log_file: log_file.map(|p| cwd.join(p)),
                    cwd,
                }))
            }
            Request::StageInputFiles { files } => {
                let entry = self.registry.get(caller)?;
                let from = entry
                    .config
                    .input_dir
                    .clone()
                    .ok_or_else(|| ConfigError::MissingKey {
                        key: "INPUT_DIR".into(),
                        scope: format!("[{}]", entry.config.section),
                    })?;
                Ok(Step::Stage(StagingJob::Copy {
                    from,
                    to: entry.working_dir.clone(),
                    files: files.unwrap_or_else(|| entry.config.input_files.clone()),
                }))
            }
            Request::StageOutputFiles { timestamp, files } => {
                let sim = self.sim(caller)?;
                let entry = self.registry.get(caller)?;
                Ok(Step::Stage(StagingJob::Copy {
                    from: entry.working_dir.clone(),
                    to: staging::results_dir(&sim.config.sim_root, timestamp, &caller.to_string()),
                    files: files.unwrap_or_else(|| entry.config.output_files.clone()),
                }))
            }

            // ---- resources ----
            Request::GetAllocation {
                nproc,
                ppn,
                block,
                timeout,
            } => {
                let task_id = next_task_id();
                let wait = Wait::Allocation {
                    nproc,
                    ppn,
                    task_id,
                };
                if block && !self.capacity.is_empty() {
                    return Ok(Step::Queue(wait, timeout));
                }
                match self.rm.allocate(caller, nproc, task_id, ppn) {
                    Ok(alloc) => {
                        self.emit_alloc(&alloc);
                        done(Response::Allocation(alloc))
                    }
                    Err(ResourceError::Insufficient { .. }) if block => {
                        Ok(Step::Queue(wait, timeout))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Request::ReleaseAllocation { task_id } => {
                self.check_allocation_owner(caller, task_id)?;
                self.rm.release(task_id)?;
                self.wake_capacity();
                done(Response::Unit)
            }

            // ---- tasks ----
            Request::LaunchTask {
                request,
                allocation,
            } => {
                let request = self.prepare_request(caller, request)?;
                match allocation {
                    Some(task_id) => {
                        self.check_allocation_owner(caller, task_id)?;
                        if self.launcher.state(task_id).is_some() {
                            return Err(ResourceError::DuplicateTask { task_id }.into());
                        }
                        let alloc = self
                            .rm
                            .allocation(task_id)
                            .cloned()
                            .ok_or(ResourceError::UnknownTask { task_id })?;
                        done(Response::TaskId(self.start_task(&alloc, &request)?))
                    }
                    None => {
                        let task_id = next_task_id();
                        let block = request.block;
                        if block && !self.capacity.is_empty() {
                            return Ok(Step::Queue(Wait::Launch { request, task_id }, None));
                        }
                        match self.rm.allocate(caller, request.nproc, task_id, request.ppn) {
                            Ok(alloc) => done(Response::TaskId(self.start_task(&alloc, &request)?)),
                            Err(ResourceError::Insufficient { .. }) if block => {
                                Ok(Step::Queue(Wait::Launch { request, task_id }, None))
                            }
                            Err(e) => Err(e.into()),
                        }
                    }
                }
            }
            Request::WaitTask { task_id, timeout } => {
                self.check_task_owner(caller, task_id)?;
                match self.launcher.try_harvest(task_id)? {
                    Some(code) => done(Response::ExitCode(code)),
                    None => Ok(Step::Park(Wait::Task(task_id), timeout)),
                }
            }
            Request::WaitTaskNonblocking { task_id } => {
                self.check_task_owner(caller, task_id)?;
                done(Response::MaybeExit(self.launcher.try_harvest(task_id)?))
            }
            Request::WaitTasklist { task_ids, timeout } => {
                for id in &task_ids {
                    self.check_task_owner(caller, *id)?;
                }
                let wait = Wait::Tasklist(task_ids);
                match self.resolve(caller, &wait) {
                    Some(result) => Ok(Step::Done(result)),
                    None => Ok(Step::Park(wait, timeout)),
                }
            }
            Request::KillTask { task_id } => {
                self.check_task_owner(caller, task_id)?;
                self.launcher.cancel(task_id, CancelReason::Requested)?;
                done(Response::Unit)
            }
            Request::KillAllTasks => {
                for id in self.launcher.running_of(caller) {
                    let _ = self.launcher.cancel(id, CancelReason::Requested);
                }
                done(Response::Unit)
            }

            Request::PollTasks => {
                let exits = self.launcher.poll(caller);
                done(Response::ExitCodes(exits.into_iter().collect()))
            }

            // ---- task pools ----
            Request::CreateTaskPool { pool } => {
                let key = (caller.clone(), pool.clone());
                if self.pools.contains_key(&key) {
                    return Err(PoolError::DuplicatePool { pool }.into());
                }
                self.pools.insert(key, TaskPool::new(pool, caller.clone()));
                done(Response::Unit)
            }
            Request::AddTask {
                pool,
                name,
                request,
            } => {
                let request = self.prepare_request(caller, request)?;
                let p = self.pool_mut(caller, &pool)?;
                let id = p.add(PoolTask {
                    task_id: next_task_id(),
                    name,
                    request,
                })?;
                done(Response::TaskId(id))
            }
            Request::SubmitTasks {
                pool,
                block,
                timeout,
            } => {
                self.pool_mut(caller, &pool)?;
                let key = (caller.clone(), pool);
                self.emit(
                    MonitorEvent::new(MonitorKind::TaskPoolBegin, caller.sim_name())
                        .with_component(caller)
                        .with_field("pool", &key.1),
                );
                let launched = self.submit_or_queue(&key);
                if block {
                    let wait = Wait::PoolDone(key);
                    match self.resolve(caller, &wait) {
                        Some(result) => Ok(Step::Done(result)),
                        None => Ok(Step::Park(wait, timeout)),
                    }
                } else {
                    done(Response::Count(launched))
                }
            }
            Request::GetFinishedTasks {
                pool,
                block,
                timeout,
            } => {
                self.pool_mut(caller, &pool)?;
                let wait = Wait::PoolFinished((caller.clone(), pool));
                match self.resolve(caller, &wait) {
                    Some(result) => Ok(Step::Done(result)),
                    None if block => Ok(Step::Park(wait, timeout)),
                    None => done(Response::ExitCodes(BTreeMap::new())),
                }
            }
            Request::RemoveTaskPool { pool } => {
                let key = (caller.clone(), pool.clone());
                let mut p = self
                    .pools
                    .remove(&key)
                    .ok_or(PoolError::UnknownPool { pool })?;
                let mut cancelled = p.cancel_pending();
                for id in p.cancel_active() {
                    cancelled += 1;
                    if let Err(e) = self.launcher.cancel(id, CancelReason::Requested) {
                        debug!(task_id = id, error = %e, "pool task already gone");
                    }
                }
                self.capacity.retain(|c| c != &Capacity::Pool(key.clone()));
                self.wake_pool(&key);
                let acct = p.accounting();
                info!(
                    pool = %key.1,
                    owner = %caller,
                    cancelled,
                    added = acct.added,
                    balanced = acct.balanced(),
                    "task pool removed"
                );
                self.emit(
                    MonitorEvent::new(MonitorKind::TaskPoolEnd, caller.sim_name())
                        .with_component(caller)
                        .with_field("pool", &key.1)
                        .with_field("tasks", acct.added),
                );
                done(Response::Unit)
            }

            // ---- events ----
            Request::GetTopic { topic } => {
                self.topics.get_topic(&topic);
                done(Response::Unit)
            }
            Request::SendEvent {
                topic,
                header,
                body,
            } => {
                if self.topics.send_event(&topic, header, body)?.is_some() {
                    self.topics_dirty = true;
                }
                done(Response::Unit)
            }
            Request::RegisterSubscriber => {
                done(Response::Subscriber(self.topics.register_subscriber(Some(caller.clone()))))
            }
            Request::GetSubscription { subscriber, name } => {
                self.topics.get_subscription(subscriber, &name)?;
                done(Response::Unit)
            }
            Request::RegisterListener {
                subscriber,
                subscription,
                topic,
                listener,
            } => {
                self.topics
                    .register_listener(subscriber, &subscription, &topic, &listener)?;
                done(Response::Unit)
            }
            Request::UnregisterListener {
                subscriber,
                topic,
                listener,
            } => {
                self.topics.unregister_listener(subscriber, &topic, &listener)?;
                done(Response::Unit)
            }
            Request::RemoveSubscription { subscriber, name } => {
                self.topics.remove_subscription(subscriber, &name)?;
                done(Response::Unit)
            }
            Request::UnregisterSubscriber { subscriber } => {
                self.topics.unregister_subscriber(subscriber)?;
                self.wake(|w| matches!(w.wait, Wait::Events(s) if s == subscriber));
                done(Response::Unit)
            }
            Request::ProcessEvents {
                subscriber,
                block,
                timeout,
            } => {
                if !self.topics.subscriber_exists(subscriber) {
                    return Err(EventError::UnknownSubscriber { subscriber }.into());
                }
                let wait = Wait::Events(subscriber);
                match self.resolve(caller, &wait) {
                    Some(result) => Ok(Step::Done(result)),
                    None if block => Ok(Step::Park(wait, timeout)),
                    None => done(Response::Drained(self.topics.process_events(subscriber)?)),
                }
            }

            // ---- invocation ----
            Request::CallNonblocking {
                target,
                method,
                args,
            } => done(Response::CallId(self.begin_call(caller, &target, method, args)?)),
            Request::WaitCall { call_id, timeout } => {
                self.wait_call(caller, WaitKind::One(call_id), timeout)
            }
            Request::WaitCallList { call_ids, timeout } => {
                self.wait_call(caller, WaitKind::All(call_ids), timeout)
            }
            Request::WaitAny { call_ids, timeout } => {
                self.wait_call(caller, WaitKind::Any(call_ids), timeout)
            }

            // ---- workflow ----
            Request::CreateSubWorkflow { config, overrides } => {
                let path = if config.is_relative() {
                    self.working_dir(caller)?.join(config)
                } else {
                    config
                };
                let sub = SimulationConfig::load_with_overrides(&path, &overrides)?;
                if self.sims.contains_key(&sub.sim_name) {
                    return Err(ConfigError::DuplicateSimulation {
                        name: sub.sim_name,
                    }
                    .into());
                }
                staging::create_runspace(&sub, None)?;
                let parent = self.sim(caller)?;
                let (log, socket) = (parent.log.clone(), parent.log_socket.clone());
                let name = sub.sim_name.clone();
                let driver = self.load_simulation(
                    sub,
                    log,
                    socket,
                    Some(caller.sim_name().to_string()),
                )?;
                info!(parent = caller.sim_name(), sim = %name, driver = %driver, "sub-workflow created");
                done(Response::SubWorkflow { sim: name, driver })
            }
            Request::SendPortalEvent {
                event_type,
                comment,
            } => {
                self.emit(
                    MonitorEvent::new(MonitorKind::SendPortalEvent, caller.sim_name())
                        .with_component(caller)
                        .with_field("eventtype", event_type)
                        .with_comment(comment),
                );
                done(Response::Unit)
            }
        }
    }

    fn on_control(&mut self, control: Control, reply: oneshot::Sender<ServiceResult>) {
        let result = match control {
            Control::LoadSimulation {
                config,
                log,
                log_socket,
            } => self
                .load_simulation(*config, log, log_socket, None)
                .map(Response::Component),
            Control::Service { sim, request } => {
                let Some(state) = self.sims.get(&sim) else {
                    let _ = reply.send(Err(RegistryError::UnknownComponent {
                        id: format!("{sim}@FRAMEWORK"),
                    }
                    .into()));
                    return;
                };
                let caller = Caller {
                    id: state.framework.clone(),
                    responder: Responder::Control(reply),
                };
                self.dispatch(caller, request);
                return;
            }
            Control::MarkNodeDown { node } => self.mark_down(&node).map(|_| Response::Unit),
            Control::MarkNodeUp { node } => match self.rm.mark_up(&node) {
                Ok(()) => {
                    self.wake_capacity();
                    Ok(Response::Unit)
                }
                Err(e) => Err(e.into()),
            },
            Control::AddNodes { nodes } => {
                self.add_nodes(nodes);
                Ok(Response::Unit)
            }
            Control::Snapshot => Ok(Response::Snapshot(self.rm.snapshot())),
        };
        let _ = reply.send(result);
    }

    // ---- simulations and components ----

    fn load_simulation(
        &mut self,
        config: SimulationConfig,
        log: Option<mpsc::UnboundedSender<LogRecord>>,
        log_socket: Option<PathBuf>,
        parent: Option<String>,
    ) -> Result<ComponentId, ServiceError> {
        let name = config.sim_name.clone();
        if self.sims.contains_key(&name) {
            return Err(ConfigError::DuplicateSimulation { name }.into());
        }
        let mut built = Vec::with_capacity(config.components.len());
        for cc in &config.components {
            built.push((cc.clone(), self.catalog.build(cc)?));
        }

        let config = Arc::new(config);
        let cancel = self.root.child_token();
        let work_root = config.work_root();
        self.sims.insert(
            name.clone(),
            SimState {
                config: config.clone(),
                framework: ComponentId::new(name.as_str(), "FRAMEWORK"),
                cancel: cancel.clone(),
                log: log.clone(),
                log_socket,
                parent,
            },
        );

        for (cc, component) in built {
            let id = ComponentId::new(name.as_str(), cc.name.as_str());
            let working_dir = work_root.join(id.to_string());
            if let Err(e) = std::fs::create_dir_all(&working_dir) {
                self.teardown_sim(&name);
                return Err(ServiceError::Staging {
                    reason: format!("cannot create {}: {e}", working_dir.display()),
                });
            }
            self.spawn_component(id, cc, component, working_dir, &cancel, log.clone())?;
        }

        let driver = self.registry.port(&name, DRIVER_PORT)?.clone();
        info!(sim = %name, components = config.components.len(), driver = %driver, "simulation loaded");
        self.emit(
            MonitorEvent::new(MonitorKind::IpsStart, name.as_str())
                .with_field("sim_root", config.sim_root.display())
                .with_comment(format!("Starting IPS simulation {name}")),
        );
        Ok(driver)
    }

    fn spawn_component(
        &mut self,
        id: ComponentId,
        config: ComponentConfig,
        component: Box<dyn crate::component::Component>,
        working_dir: PathBuf,
        sim_cancel: &CancellationToken,
        log: Option<mpsc::UnboundedSender<LogRecord>>,
    ) -> Result<(), ServiceError> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<Invocation>();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let token = sim_cancel.child_token();
        let config = Arc::new(config);
        let services = ServicesProxy::new(
            id.clone(),
            config.clone(),
            working_dir.clone(),
            self.tx.clone(),
            resp_rx,
            token.clone(),
            log,
        );
        let mut entry = Entry::new(
            id.clone(),
            inbox_tx,
            resp_tx,
            token.clone(),
            config,
            working_dir,
        );
        entry.join = Some(tokio::spawn(run_component(
            id.clone(),
            component,
            services,
            inbox_rx,
            self.tx.clone(),
            token,
        )));
        debug!(component = %id, port = entry.port(), "component started");
        if let Err(e) = self.registry.add(entry) {
            warn!(component = %id, error = %e, "component not registered");
            return Err(e.into());
        }
        Ok(())
    }

    /// Stops every component of `sim` and of its sub-workflows.
    fn teardown_sim(&mut self, sim: &str) -> Stopped {
        let mut names = vec![sim.to_string()];
        let mut i = 0;
        while i < names.len() {
            let parent = names[i].clone();
            names.extend(
                self.sims
                    .iter()
                    .filter(|(_, s)| s.parent.as_deref() == Some(parent.as_str()))
                    .map(|(n, _)| n.clone()),
            );
            i += 1;
        }

        let mut stopped = Vec::new();
        for name in names.iter().rev() {
            for id in self.registry.list_for_sim(name) {
                self.cleanup_owner(&id);
                if let Ok(mut entry) = self.registry.remove(&id) {
                    entry.cancel.cancel();
                    if let Some(join) = entry.join.take() {
                        stopped.push((id, join));
                    }
                }
            }
            if let Some(state) = self.sims.remove(name) {
                self.cleanup_owner(&state.framework);
                state.cancel.cancel();
                info!(sim = %name, "simulation stopped");
                self.emit(
                    MonitorEvent::new(MonitorKind::IpsEnd, name.as_str())
                        .with_comment(format!("Simulation {name} ended")),
                );
            }
        }
        stopped
    }

    fn stop_all(&mut self) -> Stopped {
        let roots: Vec<String> = self
            .sims
            .iter()
            .filter(|(_, s)| s.parent.is_none())
            .map(|(n, _)| n.clone())
            .collect();
        let mut stopped = Vec::new();
        for name in roots {
            stopped.extend(self.teardown_sim(&name));
        }
        // Anything left is a sub-workflow whose parent already went away.
        let rest: Vec<String> = self.sims.keys().cloned().collect();
        for name in rest {
            stopped.extend(self.teardown_sim(&name));
        }
        for (_, w) in std::mem::take(&mut self.parked) {
            w.answer(Err(ServiceError::Cancelled));
        }
        self.capacity.clear();
        stopped
    }

    /// Releases everything `owner` holds.
    fn cleanup_owner(&mut self, owner: &ComponentId) {
        let keys: Vec<u64> = self
            .parked
            .iter()
            .filter(|(_, w)| &w.caller.id == owner)
            .map(|(k, _)| *k)
            .collect();
        for k in keys {
            if let Some(w) = self.parked.remove(&k) {
                w.answer(Err(ServiceError::Cancelled));
            }
        }
        let parked = &self.parked;
        self.capacity.retain(|c| match c {
            Capacity::Waiter(k) => parked.contains_key(k),
            Capacity::Pool((o, _)) => o != owner,
        });

        let discarded = self.calls.discard_caller(owner);
        for caller in self.calls.fail_callee(owner) {
            self.wake(|w| w.caller.id == caller && matches!(w.wait, Wait::Call(_)));
        }

        let running = self.launcher.running_of(owner);
        for id in &running {
            let _ = self.launcher.cancel(*id, CancelReason::OwnerCancelled);
        }
        for id in self.rm.allocations_of(owner) {
            if self.launcher.state(id).is_none() {
                let _ = self.rm.release(id);
            }
        }

        let pools: Vec<PoolKey> = self
            .pools
            .keys()
            .filter(|(o, _)| o == owner)
            .cloned()
            .collect();
        for key in pools {
            if let Some(mut p) = self.pools.remove(&key) {
                p.cancel_pending();
            }
        }
        let subscribers = self.topics.release_owner(owner);
        if discarded + running.len() + subscribers > 0 {
            debug!(owner = %owner, calls = discarded, tasks = running.len(), subscribers, "owner released");
        }
        self.wake_capacity();
    }

    fn on_exited(&mut self, id: ComponentId) {
        if !self.registry.contains(&id) {
            return;
        }
        warn!(component = %id, "component actor exited on its own");
        self.cleanup_owner(&id);
        let _ = self.registry.remove(&id);
    }

    // ---- invocation ----

    fn begin_call(
        &mut self,
        caller: &ComponentId,
        target: &ComponentId,
        method: String,
        args: Vec<serde_json::Value>,
    ) -> Result<u64, ServiceError> {
        let inbox = self
            .registry
            .get(target)
            .map_err(|_| InvocationError::UnknownTarget {
                target: target.to_string(),
            })?
            .inbox
            .clone();
        let call_id = self.calls.begin(caller, target, &method);
        self.emit(
            MonitorEvent::new(MonitorKind::CallBegin, caller.sim_name())
                .with_component(caller)
                .with_field("target", target)
                .with_field("method", &method)
                .with_field("call_id", call_id),
        );
        let sent = inbox.send(Invocation {
            call_id,
            method,
            args,
        });
        if sent.is_err() {
            let _ = self.calls.complete(call_id, Err(InvocationError::Cancelled));
        }
        Ok(call_id)
    }

    fn wait_call(
        &mut self,
        caller: &ComponentId,
        kind: WaitKind,
        timeout: Option<Duration>,
    ) -> Result<Step, ServiceError> {
        let wait = Wait::Call(kind);
        match self.resolve(caller, &wait) {
            Some(result) => Ok(Step::Done(result)),
            None => Ok(Step::Park(wait, timeout)),
        }
    }

    fn on_method_result(
        &mut self,
        callee: ComponentId,
        call_id: u64,
        method: &str,
        outcome: Result<serde_json::Value, crate::error::ComponentError>,
    ) {
        let ok = outcome.is_ok();
        let outcome = outcome.map_err(|e| remote_failure(&callee, method, &e));
        self.emit(
            MonitorEvent::new(MonitorKind::CallEnd, callee.sim_name())
                .with_component(&callee)
                .with_field("method", method)
                .with_field("call_id", call_id)
                .with_field("ok", ok),
        );
        if let Some(caller) = self.calls.complete(call_id, outcome) {
            self.wake(|w| w.caller.id == caller && matches!(w.wait, Wait::Call(_)));
        }
    }

    // ---- tasks ----

    /// Fills in the working directory, log file and environment of a request.
    fn prepare_request(
        &self,
        owner: &ComponentId,
        mut request: TaskRequest,
    ) -> Result<TaskRequest, ServiceError> {
        let sim = self.sim(owner)?;
        if request.working_dir.as_os_str().is_empty() {
            request.working_dir = self.working_dir(owner)?;
        }
        if request.log_file.is_none() {
            let base = Path::new(&request.binary)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "task".to_string());
            request.log_file = Some(request.working_dir.join(format!("{base}.log")));
        }
        request
            .env
            .push(("IPS_SIM_NAME".into(), sim.config.sim_name.clone()));
        if let Some(sock) = &sim.log_socket {
            request
                .env
                .push(("IPS_LOG_SOCKET".into(), sock.display().to_string()));
        }
        Ok(request)
    }

    /// Launches on an allocation. A failed launch releases it.
    fn start_task(
        &mut self,
        alloc: &Allocation,
        request: &TaskRequest,
    ) -> Result<TaskId, ServiceError> {
        let parent = self.parent_token(&alloc.owner);
        match self.launcher.launch(alloc, request, &parent) {
            Ok(id) => {
                self.emit_launch(alloc, request);
                Ok(id)
            }
            Err(e) => {
                let _ = self.rm.release(alloc.task_id);
                self.wake_capacity();
                Err(e.into())
            }
        }
    }

    fn on_task_exit(&mut self, exit: TaskExit) {
        let Some(code) = self.launcher.on_exit(exit) else {
            return;
        };
        if let Err(e) = self.rm.release(exit.task_id) {
            debug!(task_id = exit.task_id, error = %e, "exited task held no allocation");
        }
        let owner = self.launcher.owner(exit.task_id).cloned();
        if let Some(owner) = &owner {
            self.emit(
                MonitorEvent::new(MonitorKind::TaskEnd, owner.sim_name())
                    .with_component(owner)
                    .with_task(exit.task_id)
                    .with_field("exit_code", code),
            );
        }
        match self.pool_of_task.remove(&exit.task_id) {
            Some(key) => {
                let _ = self.launcher.try_harvest(exit.task_id);
                if let Some(pool) = self.pools.get_mut(&key) {
                    pool.complete(exit.task_id, code);
                }
                self.wake_capacity();
                self.wake_pool(&key);
            }
            None => {
                if let Some(owner) = owner {
                    if !self.registry.contains(&owner) {
                        let _ = self.launcher.try_harvest(exit.task_id);
                    }
                    self.wake(|w| {
                        w.caller.id == owner && matches!(w.wait, Wait::Task(_) | Wait::Tasklist(_))
                    });
                }
                self.wake_capacity();
            }
        }
    }

    /// Submits now when nobody is queued for capacity, else queues the pool.
    /// Returns how many tasks were launched.
    fn submit_or_queue(&mut self, key: &PoolKey) -> usize {
        let queued = self.capacity.contains(&Capacity::Pool(key.clone()));
        if queued || !self.capacity.is_empty() {
            if !queued {
                self.capacity.push_back(Capacity::Pool(key.clone()));
            }
            return 0;
        }
        let step = self.submit_pool(key).unwrap_or_default();
        if step.blocked {
            self.capacity.push_back(Capacity::Pool(key.clone()));
        }
        step.launched
    }

    fn submit_pool(&mut self, key: &PoolKey) -> Option<SubmitStep> {
        let parent = self.parent_token(&key.0);
        let pool = self.pools.get_mut(key)?;
        let launcher = &mut self.launcher;
        let pool_of_task = &mut self.pool_of_task;
        let mut launched: Vec<(Allocation, TaskRequest)> = Vec::new();
        let step = submit_ready(pool, &mut self.rm, |alloc, req| {
            let id = launcher.launch(alloc, req, &parent)?;
            pool_of_task.insert(id, key.clone());
            launched.push((alloc.clone(), req.clone()));
            Ok::<TaskId, LaunchError>(id)
        });
        for (alloc, req) in &launched {
            self.emit_launch(alloc, req);
        }
        Some(step)
    }

    fn mark_down(&mut self, node: &str) -> Result<(), ServiceError> {
        let holders = match self.rm.mark_down(node) {
            Ok(()) => return Ok(()),
            Err(ResourceError::AllocatedNodeDown { tasks, .. }) => tasks,
            Err(e) => return Err(e.into()),
        };
        self.rm.fence(node)?;
        for task_id in holders {
            // Holders with a live process give their cores back from `on_task_exit`.
            let alive = self.launcher.state(task_id).is_some()
                && self.launcher.exit_code(task_id).is_none();
            if alive && self.launcher.cancel(task_id, CancelReason::NodeFailure).is_ok() {
                warn!(node, task_id, "task on failed node cancelled");
                continue;
            }
            if let Err(e) = self.rm.release(task_id) {
                warn!(node, task_id, error = %e, "release of failed node holder");
            } else {
                warn!(node, task_id, "allocation on failed node released");
            }
        }
        self.wake_capacity();
        Ok(())
    }

    fn add_nodes(&mut self, nodes: Vec<NodeSpec>) {
        self.rm.add_nodes(nodes);
        self.wake_capacity();
    }

    // ---- parking ----

    fn park(&mut self, caller: Caller, wait: Wait, timeout: Option<Duration>) -> u64 {
        let k = self.next_waiter;
        self.next_waiter += 1;
        let timer = timeout.map(|after| {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(RouterMsg::Expire { waiter: k });
            })
        });
        trace!(waiter = k, caller = %caller.id, "parked");
        self.parked.insert(
            k,
            Waiter {
                caller,
                wait,
                timeout,
                timer,
            },
        );
        k
    }

    fn expire(&mut self, k: u64) {
        let Some(w) = self.parked.remove(&k) else {
            return;
        };
        let was_head = self.capacity.front() == Some(&Capacity::Waiter(k));
        self.capacity.retain(|c| c != &Capacity::Waiter(k));
        let after = w.timeout.unwrap_or_default();
        debug!(waiter = k, caller = %w.caller.id, ?after, "wait expired");
        let err: ServiceError = match w.wait {
            Wait::Call(_) => InvocationError::Timeout { after }.into(),
            _ => ServiceError::Expired { after },
        };
        w.answer(Err(err));
        if was_head {
            self.wake_capacity();
        }
    }

    /// Retries every parked waiter matching `pred`.
    fn wake(&mut self, pred: impl Fn(&Waiter) -> bool) {
        let keys: Vec<u64> = self
            .parked
            .iter()
            .filter(|(_, w)| pred(w))
            .map(|(k, _)| *k)
            .collect();
        for k in keys {
            let Some(w) = self.parked.remove(&k) else {
                continue;
            };
            match self.resolve(&w.caller.id, &w.wait) {
                Some(result) => w.answer(result),
                None => {
                    self.parked.insert(k, w);
                }
            }
        }
    }

    fn wake_pool(&mut self, key: &PoolKey) {
        self.wake(|w| match &w.wait {
            Wait::PoolDone(k) | Wait::PoolFinished(k) => k == key,
            _ => false,
        });
    }

    /// Hands freed capacity to the queue, head first.
    fn wake_capacity(&mut self) {
        while let Some(head) = self.capacity.front().cloned() {
            match head {
                Capacity::Waiter(k) => {
                    let Some(w) = self.parked.get(&k) else {
                        self.capacity.pop_front();
                        continue;
                    };
                    let attempt = match &w.wait {
                        Wait::Allocation {
                            nproc,
                            ppn,
                            task_id,
                        } => self.rm.allocate(&w.caller.id, *nproc, *task_id, *ppn),
                        Wait::Launch { request, task_id } => {
                            self.rm
                                .allocate(&w.caller.id, request.nproc, *task_id, request.ppn)
                        }
                        _ => {
                            self.capacity.pop_front();
                            continue;
                        }
                    };
                    if matches!(attempt, Err(ResourceError::Insufficient { .. })) {
                        break;
                    }
                    self.capacity.pop_front();
                    let Some(w) = self.parked.remove(&k) else {
                        continue;
                    };
                    let reply = match attempt {
                        Ok(alloc) => match &w.wait {
                            Wait::Launch { request, .. } => {
                                self.start_task(&alloc, request).map(Response::TaskId)
                            }
                            _ => {
                                self.emit_alloc(&alloc);
                                Ok(Response::Allocation(alloc))
                            }
                        },
                        Err(e) => Err(e.into()),
                    };
                    w.answer(reply);
                }
                Capacity::Pool(key) => match self.submit_pool(&key) {
                    Some(step) if step.blocked => break,
                    _ => {
                        self.capacity.pop_front();
                        self.wake_pool(&key);
                    }
                },
            }
        }
    }

    /// Answer for `wait` if it can be given now.
    fn resolve(&mut self, caller: &ComponentId, wait: &Wait) -> Option<ServiceResult> {
        match wait {
            Wait::Allocation { .. } | Wait::Launch { .. } => None,
            Wait::Task(id) => match self.launcher.try_harvest(*id) {
                Ok(Some(code)) => Some(Ok(Response::ExitCode(code))),
                Ok(None) => None,
                Err(e) => Some(Err(e.into())),
            },
            Wait::Tasklist(ids) => {
                for id in ids {
                    if self.launcher.state(*id).is_none() {
                        return Some(Err(LaunchError::UnknownTask { task_id: *id }.into()));
                    }
                }
                if !ids.iter().all(|id| self.launcher.exit_code(*id).is_some()) {
                    return None;
                }
                let mut codes = BTreeMap::new();
                for id in ids {
                    if let Ok(Some(code)) = self.launcher.try_harvest(*id) {
                        codes.insert(*id, code);
                    }
                }
                Some(Ok(Response::ExitCodes(codes)))
            }
            Wait::Call(kind) => match self.calls.poll_wait(caller, kind) {
                Ok(Some(WaitOutcome::One(v))) => Some(Ok(Response::Value(v))),
                Ok(Some(WaitOutcome::All(vs))) => Some(Ok(Response::Values(vs))),
                Ok(Some(WaitOutcome::Any(call_id, value))) => {
                    Some(Ok(Response::AnyResult { call_id, value }))
                }
                Ok(None) => None,
                Err(e) => Some(Err(e.into())),
            },
            Wait::PoolDone(key) => {
                let Some(pool) = self.pools.get_mut(key) else {
                    return Some(Err(unknown_pool(key)));
                };
                if !pool.is_idle() {
                    return None;
                }
                let codes = pool.drain_finished();
                let acct = pool.accounting();
                self.emit(
                    MonitorEvent::new(MonitorKind::TaskPoolEnd, key.0.sim_name())
                        .with_component(&key.0)
                        .with_field("pool", &key.1)
                        .with_field("tasks", acct.added),
                );
                Some(Ok(Response::ExitCodes(codes)))
            }
            Wait::PoolFinished(key) => {
                let Some(pool) = self.pools.get_mut(key) else {
                    return Some(Err(unknown_pool(key)));
                };
                if pool.has_finished() {
                    Some(Ok(Response::ExitCodes(pool.drain_finished())))
                } else if pool.is_exhausted() {
                    Some(Err(PoolError::Empty {
                        pool: key.1.clone(),
                    }
                    .into()))
                } else {
                    None
                }
            }
            Wait::Events(sub) => {
                if !self.topics.subscriber_exists(*sub) {
                    return Some(Err(EventError::UnknownSubscriber { subscriber: *sub }.into()));
                }
                if !self.topics.has_pending(*sub) {
                    return None;
                }
                Some(
                    self.topics
                        .process_events(*sub)
                        .map(Response::Drained)
                        .map_err(Into::into),
                )
            }
        }
    }

    // ---- lookups ----

    fn sim(&self, id: &ComponentId) -> Result<&SimState, ServiceError> {
        self.sims.get(id.sim_name()).ok_or_else(|| {
            RegistryError::UnknownComponent { id: id.to_string() }.into()
        })
    }

    /// A component's working directory; `SIM_ROOT` for the framework.
    fn working_dir(&self, id: &ComponentId) -> Result<PathBuf, ServiceError> {
        if let Ok(e) = self.registry.get(id) {
            return Ok(e.working_dir.clone());
        }
        let sim = self.sim(id)?;
        if &sim.framework == id {
            Ok(sim.config.sim_root.clone())
        } else {
            Err(RegistryError::UnknownComponent { id: id.to_string() }.into())
        }
    }

    fn parent_token(&self, owner: &ComponentId) -> CancellationToken {
        if let Ok(e) = self.registry.get(owner) {
            return e.cancel.clone();
        }
        match self.sims.get(owner.sim_name()) {
            Some(s) => s.cancel.clone(),
            None => self.root.clone(),
        }
    }

    fn pool_mut(&mut self, owner: &ComponentId, pool: &str) -> Result<&mut TaskPool, ServiceError> {
        self.pools
            .get_mut(&(owner.clone(), pool.to_string()))
            .ok_or_else(|| {
                PoolError::UnknownPool {
                    pool: pool.to_string(),
                }
                .into()
            })
    }

    fn check_task_owner(&self, caller: &ComponentId, task_id: TaskId) -> Result<(), ServiceError> {
        match self.launcher.owner(task_id) {
            None => Err(LaunchError::UnknownTask { task_id }.into()),
            Some(o) if o != caller => Err(LaunchError::NotOwner {
                task_id,
                caller: caller.to_string(),
            }
            .into()),
            Some(_) => Ok(()),
        }
    }

    fn check_allocation_owner(
        &self,
        caller: &ComponentId,
        task_id: TaskId,
    ) -> Result<(), ServiceError> {
        match self.rm.allocation(task_id) {
            Some(a) if &a.owner == caller => Ok(()),
            _ => Err(ResourceError::UnknownTask { task_id }.into()),
        }
    }

    // ---- monitor ----

    /// Publishes on the bus and mirrors onto the monitor topic.
    fn emit(&mut self, ev: MonitorEvent) {
        if self.topics.has_topic(MONITOR_TOPIC) {
            let sent = self
                .topics
                .send_event(MONITOR_TOPIC, ev.header(), ev.body());
            if matches!(sent, Ok(Some(_))) {
                self.topics_dirty = true;
            }
        }
        self.bus.publish(ev);
    }

    fn emit_alloc(&mut self, alloc: &Allocation) {
        self.emit(
            MonitorEvent::new(MonitorKind::ResourceAlloc, alloc.owner.sim_name())
                .with_component(&alloc.owner)
                .with_task(alloc.task_id)
                .with_field("cores", alloc.total_cores)
                .with_field("nodes", alloc.node_names().join(",")),
        );
    }

    fn emit_launch(&mut self, alloc: &Allocation, request: &TaskRequest) {
        self.emit(
            MonitorEvent::new(MonitorKind::LaunchTask, alloc.owner.sim_name())
                .with_component(&alloc.owner)
                .with_task(alloc.task_id)
                .with_field("cores", alloc.total_cores)
                .with_field("binary", &request.binary),
        );
    }
}

fn unknown_pool(key: &PoolKey) -> ServiceError {
    PoolError::UnknownPool {
        pool: key.1.clone(),
    }
    .into()
}
