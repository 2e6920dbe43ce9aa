use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::framework::{Framework, FrameworkHandle};
use super::router::{Router, RouterParts};
use crate::checklist::Requested;
use crate::component::ComponentCatalog;
use crate::config::{InventoryOverride, PlatformConfig, RuntimeConfig, SimulationConfig};
use crate::error::{ConfigError, RuntimeError, ServiceError};
use crate::events::Bus;
use crate::portal::PortalSink;
use crate::resources::{ResourceManager, UsageReport};
use crate::subscribers::{LogWriter, Subscribe, SubscriberSet};
use crate::tasks::TaskLauncher;

/// Builder for a [`Framework`].
///
/// ```no_run
/// use ips_runtime::{FrameworkBuilder, RuntimeConfig, SimulationConfig};
///
/// # async fn demo() -> Result<(), ips_runtime::error::RuntimeError> {
/// let sim = SimulationConfig::load("hello.conf")?;
/// let framework = FrameworkBuilder::new(RuntimeConfig::default())
///     .simulation(sim)
///     .build()?;
/// framework.run().await
/// # }
/// ```
pub struct FrameworkBuilder {
    cfg: RuntimeConfig,
    platform: PlatformConfig,
    inventory: InventoryOverride,
    sims: Vec<SimulationConfig>,
    requested: Requested,
    catalog: ComponentCatalog,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl FrameworkBuilder {
    /// Local platform, all three phases, built-in components.
    pub fn new(cfg: RuntimeConfig) -> Self {
        Self {
            cfg,
            platform: PlatformConfig::default(),
            inventory: InventoryOverride::default(),
            sims: Vec::new(),
            requested: Requested::all(),
            catalog: ComponentCatalog::with_builtins(),
            subscribers: Vec::new(),
        }
    }

    pub fn platform(mut self, platform: PlatformConfig) -> Self {
        self.platform = platform;
        self
    }

    /// Forces the node count and cores per node (`--nodes`, `--ppn`).
    pub fn inventory_override(mut self, over: InventoryOverride) -> Self {
        self.inventory = over;
        self
    }

    pub fn simulation(mut self, sim: SimulationConfig) -> Self {
        self.sims.push(sim);
        self
    }

    pub fn simulations(mut self, sims: impl IntoIterator<Item = SimulationConfig>) -> Self {
        self.sims.extend(sims);
        self
    }

    pub fn phases(mut self, requested: Requested) -> Self {
        self.requested = requested;
        self
    }

    /// Replaces the component catalog (start from
    /// [`ComponentCatalog::with_builtins`] to keep the built-ins).
    pub fn catalog(mut self, catalog: ComponentCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Extra monitor sinks, next to the log writer and the portal sink.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Starts the service router. Must be called inside a tokio runtime.
    ///
    /// Fails on duplicate simulation names or an empty inventory.
    pub fn build(self) -> Result<Framework, RuntimeError> {
        let mut names = HashSet::new();
        for sim in &self.sims {
            if !names.insert(sim.sim_name.as_str()) {
                return Err(ConfigError::DuplicateSimulation {
                    name: sim.sim_name.clone(),
                }
                .into());
            }
        }

        let mut rm = ResourceManager::initialize(self.platform.inventory(self.inventory))
            .map_err(ServiceError::from)?;
        if self.platform.resource_report {
            if let Some(sim) = self.sims.first() {
                let path = sim.sim_root.join("resource_usage");
                let opened = std::fs::create_dir_all(&sim.sim_root)
                    .and_then(|_| UsageReport::open(&path));
                match opened {
                    Ok(report) => rm = rm.with_report(report),
                    Err(e) => warn!(path = %path.display(), error = %e, "resource report disabled"),
                }
            }
        }

        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let mut sinks: Vec<Arc<dyn Subscribe>> = vec![
            Arc::new(LogWriter),
            Arc::new(PortalSink::from_config(&self.platform, &self.cfg)),
        ];
        sinks.extend(self.subscribers);
        let subs = Arc::new(SubscriberSet::new(sinks, bus.clone()));
        let bus_rx = bus.subscribe();

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let launcher = TaskLauncher::new(self.platform.launcher, exit_tx);
        let (tx, rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();

        let router = Router::new(RouterParts {
            catalog: Arc::new(self.catalog),
            rm,
            launcher,
            bus: bus.clone(),
            max_pending_events: self.cfg.max_pending_events,
            tx: tx.clone(),
            root: root.clone(),
        });
        let router = tokio::spawn(router.run(rx, exit_rx));
        debug!(simulations = self.sims.len(), launcher = ?self.platform.launcher, "framework built");

        Ok(Framework {
            cfg: self.cfg,
            platform: Arc::new(self.platform),
            sims: self.sims,
            requested: self.requested,
            handle: FrameworkHandle::new(tx, root),
            router,
            bus,
            subs,
            bus_rx,
        })
    }
}
