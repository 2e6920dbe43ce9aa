//! # ips-runtime
//!
//! **ips-runtime** is the runtime core of the Integrated Plasma Simulator: it
//! hosts simulation components as async actors, routes their service
//! requests, partitions a node allocation among the external tasks they
//! launch, and carries pub/sub traffic between them.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │  Component   │   │  Component   │   │  Component   │
//!     │   (DRIVER)   │   │   (WORKER)   │   │   (WORKER)   │
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            │ ServicesProxy    │                  │
//!            ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Service router (single task, owns all core state)                │
//! │  - Registry         (component ids, ports, actor inboxes)         │
//! │  - InvocationEngine (call ids, parked waits)                      │
//! │  - ResourceManager  (nodes, cores, allocations, FIFO queue)       │
//! │  - TaskLauncher     (child processes, exit codes)                 │
//! │  - TaskPools        (bags of tasks scheduled together)            │
//! │  - TopicService     (topics, cursors, listeners)                  │
//! └──────┬───────────────────────────────┬────────────────────────────┘
//!        │ MonitorEvent                  │ task exits
//!        ▼                               ▲
//! ┌──────────────────────────────┐   ┌───┴──────────────────────────┐
//! │ Bus (broadcast channel)      │   │ child processes (mpirun/...) │
//! └──────┬───────────────────────┘   └──────────────────────────────┘
//!        ▼
//!   SubscriberSet ──► LogWriter, PortalSink, embedder sinks
//! ```
//!
//! ### Lifecycle
//! ```text
//! SimulationConfig ──► FrameworkBuilder ──► Framework::run()
//!
//! per simulation:
//!   ├─► read checklist, plan phases (create-runspace, run-setup, run)
//!   ├─► create-runspace: directories, provenance copies
//!   ├─► run-setup: load components, INIT port, driver.init
//!   ├─► run:       driver.step, driver.finalize
//!   ├─► record each phase DONE (or NOT_DONE on failure)
//!   └─► tear down actors, write <SIM_NAME>_debug.zip
//!
//! on SIGINT/SIGTERM/SIGQUIT:
//!   cancel every actor ─► kill child processes ─► wait up to `grace`
//! ```
//!
//! ## Features
//! | Area              | Description                                                 | Key types / traits                          |
//! |-------------------|-------------------------------------------------------------|---------------------------------------------|
//! | **Components**    | Lifecycle methods run as isolated actors.                   | [`Component`], [`ServicesProxy`]            |
//! | **Framework**     | Phases, simulations, signals and grace.                     | [`FrameworkBuilder`], [`Framework`]         |
//! | **Operator API**  | Node failure injection and resource snapshots.              | [`FrameworkHandle`]                         |
//! | **Tasks**         | External processes on allocated cores, task pools.          | [`TaskRequest`], [`TaskId`]                 |
//! | **Events**        | Topic pub/sub between components, monitor sinks.            | [`Events`], [`Subscribe`]                   |
//! | **Errors**        | Typed errors per domain.                                    | [`ComponentError`], [`RuntimeError`]        |
//! | **Configuration** | Runtime knobs, simulation and platform files.               | [`RuntimeConfig`], [`SimulationConfig`]     |
//!
//! ## Example
//! ```no_run
//! use async_trait::async_trait;
//! use ips_runtime::{
//!     Component, ComponentCatalog, ComponentError, FrameworkBuilder, RuntimeConfig,
//!     ServicesProxy, SimulationConfig,
//! };
//! use serde_json::Value;
//!
//! struct Heater;
//!
//! #[async_trait]
//! impl Component for Heater {
//!     async fn step(&mut self, services: &ServicesProxy, t: f64) -> Result<Value, ComponentError> {
//!         services.info(format!("heating at t={t}"));
//!         Ok(Value::Null)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut catalog = ComponentCatalog::with_builtins();
//!     catalog.register("Heater", |_| Box::new(Heater));
//!
//!     let sim = SimulationConfig::load("heating.conf")?;
//!     FrameworkBuilder::new(RuntimeConfig::default())
//!         .catalog(catalog)
//!         .simulation(sim)
//!         .build()?
//!         .run()
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod builtin;
pub mod checklist;
pub mod component;
pub mod config;
pub mod error;
pub mod events;
pub mod invocation;
pub mod logsock;
pub mod policies;
pub mod portal;
pub mod registry;
pub mod resources;
pub mod runtime;
pub mod services;
pub mod staging;
pub mod subscribers;
pub mod tasks;
pub mod topics;

// ---- Public re-exports ----

pub use checklist::{Checklist, Phase, Requested};
pub use component::{Component, ComponentCatalog, ComponentId};
pub use config::{InventoryOverride, PlatformConfig, RuntimeConfig, SimulationConfig};
pub use error::{ComponentError, RuntimeError, ServiceError};
pub use invocation::CallId;
pub use policies::{BackoffPolicy, JitterPolicy};
pub use resources::{NodeSpec, ResourceSnapshot};
pub use runtime::{Framework, FrameworkBuilder, FrameworkHandle};
pub use services::ServicesProxy;
pub use subscribers::{LogWriter, Subscribe};
pub use tasks::{TaskId, TaskRequest};
pub use topics::Events;
