//! `ips`: runs one or more simulations through the requested phases.
//!
//! ```text
//! ips --simulation=hello.conf --platform=workstation.conf --run-setup --run
//! ```
//!
//! Exit status is 0 when every requested phase of every simulation
//! completed, 1 otherwise.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::Context;
use clap::{ArgGroup, Parser};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use ips_runtime::error::PhaseError;
use ips_runtime::{
    FrameworkBuilder, InventoryOverride, PlatformConfig, Requested, RuntimeConfig, RuntimeError,
    SimulationConfig,
};

/// Integrated Plasma Simulator framework.
#[derive(Debug, Parser)]
#[command(name = "ips", version, about)]
#[command(group(
    ArgGroup::new("phases")
        .required(true)
        .multiple(true)
        .args(["create_runspace", "run_setup", "run"])
))]
struct Cli {
    /// Create the simulation directory tree.
    #[arg(long)]
    create_runspace: bool,

    /// Load components and run the INIT port and `driver.init`.
    #[arg(long)]
    run_setup: bool,

    /// Run `driver.step` and `driver.finalize`.
    #[arg(long)]
    run: bool,

    /// Simulation configuration file (repeatable).
    #[arg(long = "simulation", value_name = "PATH", required = true)]
    simulations: Vec<PathBuf>,

    /// Platform configuration file.
    #[arg(long, value_name = "PATH")]
    platform: Option<PathBuf>,

    /// Write the framework log here instead of stderr.
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,

    /// Debug-level framework logging.
    #[arg(long)]
    debug: bool,

    /// Trace-level framework logging.
    #[arg(long)]
    verbose: bool,

    /// Render every monitor event, including per-call records.
    #[arg(long)]
    ftb: bool,

    /// Number of nodes to use, overriding the platform file.
    #[arg(long, value_name = "N")]
    nodes: Option<usize>,

    /// Cores per node, overriding the platform file.
    #[arg(long, value_name = "N")]
    ppn: Option<usize>,
}

impl Cli {
    fn requested(&self) -> Requested {
        Requested {
            create_runspace: self.create_runspace,
            run_setup: self.run_setup,
            run: self.run,
        }
    }

    fn level(&self) -> &'static str {
        if self.verbose {
            "trace"
        } else if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let mut filter =
        EnvFilter::try_from_env("IPS_LOG").unwrap_or_else(|_| EnvFilter::new(cli.level()));
    if cli.ftb {
        filter = filter.add_directive("ips::monitor=debug".parse()?);
    }

    let writer = match &cli.log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(cli.log.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

/// One line naming the failing phase and component.
fn summary(err: &RuntimeError) -> String {
    match err {
        RuntimeError::Phase(PhaseError::Failed {
            phase,
            component,
            reason,
        }) => format!("phase {phase} failed in component {component}: {reason}"),
        RuntimeError::Phase(PhaseError::PrerequisiteMissing { phase, missing }) => {
            format!("phase {phase} not attempted: {missing} is NOT_DONE")
        }
        other => format!("{} ({})", other.as_message(), other.as_label()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli)?;
    debug!(?cli, "arguments");

    let platform = match &cli.platform {
        Some(path) => PlatformConfig::load(path)
            .with_context(|| format!("loading platform file {}", path.display()))?,
        None => PlatformConfig::default(),
    };
    let sims = cli
        .simulations
        .iter()
        .map(|path| {
            SimulationConfig::load(path)
                .with_context(|| format!("loading simulation file {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let framework = FrameworkBuilder::new(RuntimeConfig::default())
        .platform(platform)
        .inventory_override(InventoryOverride {
            nodes: cli.nodes,
            ppn: cli.ppn,
        })
        .phases(cli.requested())
        .simulations(sims)
        .build()
        .context("starting framework")?;

    match framework.run().await {
        Ok(()) => {
            info!("all requested phases completed");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(label = e.as_label(), "{}", e.as_message());
            eprintln!("ips: {}", summary(&e));
            Ok(ExitCode::FAILURE)
        }
    }
}
