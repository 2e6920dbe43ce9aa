//! # Framework: phases, simulations and graceful shutdown.
//!
//! The [`Framework`] owns the service router task, the monitor bus and the
//! subscriber set. [`Framework::run`] drives every simulation through the
//! requested phases concurrently and handles OS signals.
//!
//! ```text
//! run()
//!   ├─ listener: Bus.subscribe() ─► SubscriberSet::emit(&MonitorEvent)
//!   ├─ per simulation (join_all):
//!   │     Checklist::load ─► plan(requested)
//!   │     create-runspace ─► create_runspace()
//!   │     run-setup       ─► load components ─► INIT port ─► driver.init(0)
//!   │     run             ─► driver.step(0) ─► driver.finalize(0)
//!   │     teardown ─► join_with_grace ─► debug archive
//!   └─ signal:
//!         Bus.publish(ShutdownRequested)
//!         root.cancel() ─► router stops every actor, kills every task
//!         join_with_grace(cfg.grace)
//!            ├─ all joined ─► AllStoppedWithin
//!            └─ deadline   ─► GraceExceeded (stuck ids)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::{Control, Request, Response, RouterMsg, ServiceResult};
use super::router::Stopped;
use super::shutdown::{join_with_grace, wait_for_shutdown_signal};
use crate::checklist::{Checklist, Phase, Requested};
use crate::component::ComponentId;
use crate::config::{INIT_PORT, PlatformConfig, RuntimeConfig, SimulationConfig};
use crate::error::{ConfigError, PhaseError, RuntimeError, ServiceError};
use crate::events::{Bus, MonitorEvent, MonitorKind};
use crate::invocation::CallId;
use crate::logsock::{LogRecord, LogSink};
use crate::resources::{NodeSpec, ResourceSnapshot};
use crate::services::unexpected;
use crate::staging;
use crate::subscribers::SubscriberSet;
use crate::topics::FrameworkEvents;

/// Cloneable control channel into a running framework.
///
/// Used by the framework itself, by embedders (operator actions such as
/// marking a node down) and by tests.
#[derive(Clone)]
pub struct FrameworkHandle {
    tx: mpsc::UnboundedSender<RouterMsg>,
    root: CancellationToken,
}

impl FrameworkHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RouterMsg>, root: CancellationToken) -> Self {
        Self { tx, root }
    }

    async fn control(&self, control: Control) -> ServiceResult {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterMsg::Control { control, reply })
            .map_err(|_| ServiceError::RouterClosed)?;
        rx.await.map_err(|_| ServiceError::RouterClosed)?
    }

    /// A service request on behalf of the framework of `sim`.
    pub async fn service(&self, sim: &str, request: Request) -> ServiceResult {
        self.control(Control::Service {
            sim: sim.to_string(),
            request,
        })
        .await
    }

    /// Instantiates every component of `config`; returns the driver id.
    pub async fn load_simulation(
        &self,
        config: SimulationConfig,
        log: Option<mpsc::UnboundedSender<LogRecord>>,
        log_socket: Option<PathBuf>,
    ) -> Result<ComponentId, ServiceError> {
        let control = Control::LoadSimulation {
            config: Box::new(config),
            log,
            log_socket,
        };
        match self.control(control).await? {
            Response::Component(id) => Ok(id),
            other => Err(unexpected("load_simulation", &other)),
        }
    }

    /// Blocking method call from the framework of `sim`.
    pub async fn call(
        &self,
        sim: &str,
        target: &ComponentId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ServiceError> {
        let request = Request::CallNonblocking {
            target: target.clone(),
            method: method.to_string(),
            args,
        };
        let call_id: CallId = match self.service(sim, request).await? {
            Response::CallId(id) => id,
            other => return Err(unexpected("call_nonblocking", &other)),
        };
        let wait = Request::WaitCall {
            call_id,
            timeout: None,
        };
        match self.service(sim, wait).await? {
            Response::Value(v) => Ok(v),
            other => Err(unexpected("wait_call", &other)),
        }
    }

    pub async fn get_port(&self, sim: &str, port: &str) -> Result<ComponentId, ServiceError> {
        let request = Request::GetPort {
            port: port.to_string(),
        };
        match self.service(sim, request).await? {
            Response::Component(id) => Ok(id),
            other => Err(unexpected("get_port", &other)),
        }
    }

    /// Stops every component of `sim` (and its sub-workflows) and returns
    /// their actor handles for joining.
    pub async fn teardown(&self, sim: &str) -> Vec<(ComponentId, JoinHandle<()>)> {
        let (reply, rx) = oneshot::channel();
        let msg = RouterMsg::Teardown {
            sim: sim.to_string(),
            reply,
        };
        if self.tx.send(msg).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Marks a node down. Tasks holding cores on it are killed with the
    /// node-failure exit code and their allocations released.
    pub async fn mark_node_down(&self, node: &str) -> Result<(), ServiceError> {
        self.control(Control::MarkNodeDown {
            node: node.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn mark_node_up(&self, node: &str) -> Result<(), ServiceError> {
        self.control(Control::MarkNodeUp {
            node: node.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn add_nodes(&self, nodes: Vec<NodeSpec>) -> Result<(), ServiceError> {
        self.control(Control::AddNodes { nodes }).await.map(|_| ())
    }

    pub async fn snapshot(&self) -> Result<ResourceSnapshot, ServiceError> {
        match self.control(Control::Snapshot).await? {
            Response::Snapshot(s) => Ok(s),
            other => Err(unexpected("snapshot", &other)),
        }
    }

    /// Cancels every actor and stops the router.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    /// Event service client acting for the framework of `sim`.
    pub fn events(&self, sim: impl Into<String>) -> FrameworkEvents {
        FrameworkEvents::new(self.clone(), sim)
    }
}

/// A built framework, ready to run. Create it with
/// [`FrameworkBuilder`](super::FrameworkBuilder).
pub struct Framework {
    pub(super) cfg: RuntimeConfig,
    pub(super) platform: Arc<PlatformConfig>,
    pub(super) sims: Vec<SimulationConfig>,
    pub(super) requested: Requested,
    pub(super) handle: FrameworkHandle,
    pub(super) router: JoinHandle<Stopped>,
    pub(super) bus: Bus,
    pub(super) subs: Arc<SubscriberSet>,
    pub(super) bus_rx: broadcast::Receiver<MonitorEvent>,
}

impl Framework {
    pub fn handle(&self) -> FrameworkHandle {
        self.handle.clone()
    }

    /// Runs every simulation through the requested phases.
    ///
    /// Ends when all simulations finish or a termination signal arrives. The
    /// first failing simulation's error is returned; an interrupted run ends
    /// with [`RuntimeError::Interrupted`] or [`RuntimeError::GraceExceeded`].
    pub async fn run(self) -> Result<(), RuntimeError> {
        let Framework {
            cfg,
            platform,
            sims,
            requested,
            handle,
            router,
            bus,
            subs,
            bus_rx,
        } = self;
        let stop = CancellationToken::new();
        let listener = spawn_listener(bus_rx, Arc::clone(&subs), stop.clone());

        let runner = SimRun {
            handle: handle.clone(),
            platform,
            grace: cfg.grace,
            log_socket: cfg.log_socket,
        };
        let all = join_all(sims.into_iter().map(|s| runner.run(s, requested)));
        let signal = async {
            if let Err(e) = wait_for_shutdown_signal().await {
                warn!(error = %e, "signal handlers unavailable");
                std::future::pending::<()>().await;
            }
        };
        let (outcomes, interrupted) = tokio::select! {
            outcomes = all => (outcomes, false),
            _ = signal => {
                warn!("termination signal received; stopping components");
                bus.publish(MonitorEvent::now(MonitorKind::ShutdownRequested));
                (Vec::new(), true)
            }
        };

        handle.shutdown();
        let (leftover, router_err) = match router.await {
            Ok(h) => (h, None),
            Err(e) => {
                error!(error = %e, "service router failed");
                (
                    Vec::new(),
                    Some(RuntimeError::Router {
                        reason: e.to_string(),
                    }),
                )
            }
        };
        let mut stuck: Vec<ComponentId> = Vec::new();
        let mut first_err = router_err;
        for (result, s) in outcomes {
            stuck.extend(s);
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        stuck.extend(join_with_grace(leftover, cfg.grace).await);

        if interrupted {
            if stuck.is_empty() {
                bus.publish(MonitorEvent::now(MonitorKind::AllStoppedWithin));
            } else {
                let ids: Vec<String> = stuck.iter().map(ToString::to_string).collect();
                bus.publish(
                    MonitorEvent::now(MonitorKind::GraceExceeded)
                        .with_comment(format!("stuck: {}", ids.join(","))),
                );
            }
        }

        stop.cancel();
        let _ = listener.await;
        match Arc::try_unwrap(subs) {
            Ok(set) => set.shutdown().await,
            Err(_) => debug!("subscriber set still shared; not drained"),
        }

        if let Some(e) = first_err {
            return Err(e);
        }
        if !stuck.is_empty() {
            return Err(RuntimeError::GraceExceeded {
                grace: cfg.grace,
                stuck,
            });
        }
        if interrupted {
            return Err(RuntimeError::Interrupted);
        }
        Ok(())
    }
}

/// Forwards bus events to the sinks; drains what is queued once `stop` fires.
fn spawn_listener(
    mut rx: broadcast::Receiver<MonitorEvent>,
    subs: Arc<SubscriberSet>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                r = rx.recv() => match r {
                    Ok(ev) => subs.emit(&ev),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "monitor listener lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = stop.cancelled() => {
                    loop {
                        match rx.try_recv() {
                            Ok(ev) => subs.emit(&ev),
                            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }
    })
}

/// Components of a simulation, once loaded.
struct Live {
    driver: ComponentId,
    sink: LogSink,
}

struct SimRun {
    handle: FrameworkHandle,
    platform: Arc<PlatformConfig>,
    grace: Duration,
    log_socket: bool,
}

impl SimRun {
    /// Runs one simulation. Returns its outcome and the components that had
    /// to be aborted at teardown.
    async fn run(
        &self,
        sim: SimulationConfig,
        requested: Requested,
    ) -> (Result<(), RuntimeError>, Vec<ComponentId>) {
        let name = sim.sim_name.clone();
        let path = sim.checklist_path();
        let mut checklist = match Checklist::load(&path) {
            Ok(c) => c,
            Err(e) => return (Err(e.into()), Vec::new()),
        };
        let phases = checklist.plan(requested);
        if sim.sim_root.is_dir() {
            if let Err(e) = checklist.save(&path) {
                return (Err(e.into()), Vec::new());
            }
        }
        info!(sim = %name, phases = ?phases.iter().map(|p| p.key()).collect::<Vec<_>>(), "simulation starting");

        let mut live: Option<Live> = None;
        let mut result = Ok(());
        for phase in phases {
            if let Err(e) = checklist.require(phase) {
                error!(sim = %name, error = %e, "phase gate");
                result = Err(e.into());
                break;
            }
            checklist.set(phase, false);
            let outcome = self.run_phase(phase, &sim, &mut live).await;
            if outcome.is_ok() {
                checklist.set(phase, true);
            }
            if let Err(e) = checklist.save(&path) {
                if outcome.is_ok() {
                    result = Err(e.into());
                    break;
                }
                debug!(path = %path.display(), error = %e, "checklist not saved");
            }
            match outcome {
                Ok(()) => info!(sim = %name, phase = phase.key(), "phase done"),
                Err(e) => {
                    error!(sim = %name, phase = phase.key(), error = %e, "phase failed");
                    result = Err(e);
                    break;
                }
            }
        }

        let mut stuck = Vec::new();
        if let Some(live) = live {
            let handles = self.handle.teardown(&name).await;
            stuck = join_with_grace(handles, self.grace).await;
            live.sink.shutdown().await;
        }
        if sim.sim_root.is_dir() {
            if let Err(e) = staging::write_debug_archive(&sim, self.platform.source.as_deref()) {
                warn!(sim = %name, error = %e, "debug archive not written");
            }
        }
        (result, stuck)
    }

    async fn run_phase(
        &self,
        phase: Phase,
        sim: &SimulationConfig,
        live: &mut Option<Live>,
    ) -> Result<(), RuntimeError> {
        if phase == Phase::CreateRunspace {
            return staging::create_runspace(sim, self.platform.source.as_deref())
                .map_err(|e| phase_failed(phase, &e, None));
        }
        let driver = self
            .ensure_loaded(sim, live)
            .await
            .map_err(|e| phase_failed(phase, &e, None))?;
        let body = match phase {
            Phase::RunSetup => self.setup(sim, &driver).await,
            _ => self.run_driver(sim, &driver).await,
        };
        body.map_err(|e| phase_failed(phase, &e, Some(&driver)))
    }

    /// Components are loaded once per invocation and reused across phases.
    async fn ensure_loaded(
        &self,
        sim: &SimulationConfig,
        live: &mut Option<Live>,
    ) -> Result<ComponentId, ServiceError> {
        if let Some(l) = live {
            return Ok(l.driver.clone());
        }
        let sink = LogSink::start(&sim.sim_name, &sim.log_file, self.log_socket)
            .await
            .map_err(|e| ServiceError::from(ConfigError::io(&sim.log_file, &e)))?;
        let socket = sink.socket_path().map(Path::to_path_buf);
        let driver = match self
            .handle
            .load_simulation(sim.clone(), Some(sink.sender()), socket)
            .await
        {
            Ok(d) => d,
            Err(e) => {
                sink.shutdown().await;
                return Err(e);
            }
        };
        *live = Some(Live {
            driver: driver.clone(),
            sink,
        });
        Ok(driver)
    }

    async fn setup(&self, sim: &SimulationConfig, driver: &ComponentId) -> Result<(), ServiceError> {
        let name = sim.sim_name.as_str();
        if sim.port(INIT_PORT).is_some() {
            let init = self.handle.get_port(name, INIT_PORT).await?;
            for method in ["init", "step", "finalize"] {
                self.handle
                    .call(name, &init, method, vec![Value::from(0.0)])
                    .await?;
            }
        }
        self.handle
            .call(name, driver, "init", vec![Value::from(0.0)])
            .await?;
        Ok(())
    }

    async fn run_driver(
        &self,
        sim: &SimulationConfig,
        driver: &ComponentId,
    ) -> Result<(), ServiceError> {
        let name = sim.sim_name.as_str();
        self.handle
            .call(name, driver, "step", vec![Value::from(0.0)])
            .await?;
        self.handle
            .call(name, driver, "finalize", vec![Value::from(0.0)])
            .await?;
        Ok(())
    }
}

/// Names the component where the failure started: the origin of a remote
/// failure, else the driver, else the framework.
fn phase_failed(phase: Phase, err: &ServiceError, driver: Option<&ComponentId>) -> RuntimeError {
    let component = err
        .origin()
        .map(str::to_string)
        .or_else(|| driver.map(ToString::to_string))
        .unwrap_or_else(|| "FRAMEWORK".to_string());
    PhaseError::Failed {
        phase: phase.key().to_string(),
        component,
        reason: err.as_message(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvocationError;

    #[test]
    fn test_phase_failure_names_origin() {
        let driver = ComponentId::new("s", "Driver");
        let err: ServiceError = InvocationError::RemoteFailure {
            target: "s@Worker@7".into(),
            origin: "s@Worker@7".into(),
            method: "step".into(),
            message: "boom".into(),
        }
        .into();
        let RuntimeError::Phase(PhaseError::Failed {
            phase, component, ..
        }) = phase_failed(Phase::Run, &err, Some(&driver))
        else {
            panic!("expected a phase failure");
        };
        assert_eq!(phase, "RUN");
        assert_eq!(component, "s@Worker@7");
    }

    #[test]
    fn test_phase_failure_falls_back_to_driver() {
        let driver = ComponentId::new("s", "Driver");
        let err = ServiceError::Cancelled;
        match phase_failed(Phase::RunSetup, &err, Some(&driver)) {
            RuntimeError::Phase(PhaseError::Failed { component, .. }) => {
                assert_eq!(component, driver.to_string());
            }
            other => panic!("unexpected {other:?}"),
        }
        match phase_failed(Phase::RunSetup, &err, None) {
            RuntimeError::Phase(PhaseError::Failed { component, .. }) => {
                assert_eq!(component, "FRAMEWORK");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
