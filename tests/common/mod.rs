#![allow(dead_code)]

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ips_runtime::{
    Checklist, ComponentCatalog, FrameworkBuilder, InventoryOverride, Phase, RuntimeConfig,
    SimulationConfig,
};

/// Writes `<dir>/<sim>.conf` binding each `(port, implementation name)`.
///
/// Every port gets its own `<PORT>_IMPL` section; `extra` is appended as-is
/// (a `[TIME_LOOP]` section, for instance).
pub fn write_sim(dir: &Path, sim: &str, ports: &[(&str, &str)], extra: &str) -> PathBuf {
    let root = dir.join(sim);
    let names: Vec<&str> = ports.iter().map(|(p, _)| *p).collect();
    let mut text = format!(
        "SIM_NAME = {sim}\nSIM_ROOT = {}\nLOG_FILE = {sim}.log\n[PORTS]\n    NAMES = {}\n",
        root.display(),
        names.join(" ")
    );
    for (port, _) in ports {
        let _ = writeln!(text, "    [[{port}]]\n        IMPLEMENTATION = {port}_IMPL");
    }
    for (port, name) in ports {
        let _ = writeln!(text, "[{port}_IMPL]\n    NAME = {name}\n    NPROC = 1");
    }
    text.push_str(extra);

    let path = dir.join(format!("{sim}.conf"));
    std::fs::write(&path, text).unwrap();
    path
}

pub fn load(path: &Path) -> SimulationConfig {
    SimulationConfig::load(path).unwrap()
}

/// Short grace, no log socket.
pub fn runtime() -> RuntimeConfig {
    RuntimeConfig {
        grace: Duration::from_secs(5),
        log_socket: false,
        ..RuntimeConfig::default()
    }
}

/// Builder on a synthetic `node0..` inventory.
pub fn builder(catalog: ComponentCatalog, nodes: usize, ppn: usize) -> FrameworkBuilder {
    FrameworkBuilder::new(runtime())
        .catalog(catalog)
        .inventory_override(InventoryOverride {
            nodes: Some(nodes),
            ppn: Some(ppn),
        })
}

/// `[create-runspace, run-setup, run]` as stored on disk.
pub fn checklist(sim: &SimulationConfig) -> [bool; 3] {
    let list = Checklist::load(&sim.checklist_path()).unwrap();
    [
        list.is_done(Phase::CreateRunspace),
        list.is_done(Phase::RunSetup),
        list.is_done(Phase::Run),
    ]
}
