//! # Simulation configuration.
//!
//! Typed view over a simulation file's [`ConfigTree`]: the simulation name and
//! root, the port table, one [`ComponentConfig`] per port and the time loop.
//! The raw tree stays available for `get_config_param`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::tree::ConfigTree;
use crate::error::ConfigError;

/// Port that every simulation must bind.
pub const DRIVER_PORT: &str = "DRIVER";
/// Optional port run before the driver.
pub const INIT_PORT: &str = "INIT";

/// Configuration of one component instance, taken from its section.
#[derive(Clone, Debug, Default)]
pub struct ComponentConfig {
    /// Port this component implements.
    pub port: String,
    /// Name of the section it was read from (the port's `IMPLEMENTATION`).
    pub section: String,
    /// Implementation name used to look the component up in the catalog.
    pub name: String,
    pub class: String,
    pub sub_class: String,
    /// Cores a task launched by this component asks for by default.
    pub nproc: usize,
    pub bin_path: Option<PathBuf>,
    pub input_dir: Option<PathBuf>,
    pub input_files: Vec<String>,
    pub output_files: Vec<String>,
    pub data_files: Vec<String>,
    pub restart_files: Vec<String>,
    /// Full section, for component-specific keys.
    pub tree: ConfigTree,
}

impl ComponentConfig {
    fn from_section(port: &str, section: &str, tree: &ConfigTree) -> Result<Self, ConfigError> {
        let scope = format!("[{section}]");
        let name = tree.require("NAME", &scope)?.to_string();
        let class = tree.get("CLASS").unwrap_or(&name).to_string();
        Ok(Self {
            port: port.to_string(),
            section: section.to_string(),
            class,
            sub_class: tree.get("SUB_CLASS").unwrap_or_default().to_string(),
            nproc: tree.parse::<usize>("NPROC")?.unwrap_or(1).max(1),
            bin_path: tree.get("BIN_PATH").filter(|s| !s.is_empty()).map(PathBuf::from),
            input_dir: tree.get("INPUT_DIR").filter(|s| !s.is_empty()).map(PathBuf::from),
            input_files: tree.list("INPUT_FILES"),
            output_files: tree.list("OUTPUT_FILES"),
            data_files: tree.list("DATA_FILES"),
            restart_files: tree.list("RESTART_FILES"),
            name,
            tree: tree.clone(),
        })
    }

    /// Component-specific key.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.tree.get(key)
    }
}

/// Time values handed to `step`.
#[derive(Clone, Debug, PartialEq)]
pub enum TimeLoop {
    /// `START + i * (FINISH - START) / NSTEP` for `i = 0..=NSTEP`.
    Regular { start: f64, finish: f64, nstep: u32 },
    /// Literal values.
    Explicit(Vec<f64>),
}

impl TimeLoop {
    /// Reads the `[TIME_LOOP]` section.
    pub fn from_section(tree: &ConfigTree) -> Result<Self, ConfigError> {
        let scope = "[TIME_LOOP]";
        let mode = tree.require("MODE", scope)?.trim().to_ascii_uppercase();
        match mode.as_str() {
            "REGULAR" => {
                let num = |key: &str| -> Result<f64, ConfigError> {
                    tree.parse::<f64>(key)?.ok_or_else(|| ConfigError::MissingKey {
                        key: key.to_string(),
                        scope: scope.to_string(),
                    })
                };
                let start = num("START")?;
                let finish = num("FINISH")?;
                let nstep = tree
                    .parse::<u32>("NSTEP")?
                    .ok_or_else(|| ConfigError::MissingKey {
                        key: "NSTEP".into(),
                        scope: scope.into(),
                    })?;
                if nstep == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "NSTEP".into(),
                        value: "0".into(),
                    });
                }
                Ok(TimeLoop::Regular {
                    start,
                    finish,
                    nstep,
                })
            }
            "EXPLICIT" => {
                let raw = tree.require("VALUES", scope)?;
                let values = raw
                    .split_whitespace()
                    .map(|v| {
                        v.parse::<f64>().map_err(|_| ConfigError::InvalidValue {
                            key: "VALUES".into(),
                            value: v.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TimeLoop::Explicit(values))
            }
            _ => Err(ConfigError::InvalidValue {
                key: "MODE".into(),
                value: mode,
            }),
        }
    }

    /// Materialized list of times.
    pub fn values(&self) -> Vec<f64> {
        match self {
            TimeLoop::Regular {
                start,
                finish,
                nstep,
            } => {
                let step = (finish - start) / f64::from(*nstep);
                (0..=*nstep).map(|n| start + step * f64::from(n)).collect()
            }
            TimeLoop::Explicit(v) => v.clone(),
        }
    }
}

/// Typed view of one simulation file.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    /// File this was read from, if any.
    pub source: Option<PathBuf>,
    pub sim_name: String,
    pub sim_root: PathBuf,
    pub log_file: PathBuf,
    /// Components in `PORTS.NAMES` order.
    pub components: Vec<ComponentConfig>,
    /// Files that make up the shared plasma state.
    pub state_files: Vec<String>,
    /// Directory holding the shared state.
    pub state_dir: PathBuf,
    pub time_loop: Option<TimeLoop>,
    /// Tool used by `merge_current_plasma_state`.
    pub merge_tool: Option<String>,
    pub tree: ConfigTree,
}

impl SimulationConfig {
    /// Loads and validates a simulation file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_with_overrides(path, &BTreeMap::new())
    }

    /// Loads a simulation file with top-level keys replaced by `overrides`.
    pub fn load_with_overrides(
        path: impl AsRef<Path>,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let tree = ConfigTree::load_with_overrides(path, overrides)?;
        Self::from_tree(tree, Some(path.to_path_buf()))
    }

    /// Validates an already parsed tree.
    pub fn from_tree(tree: ConfigTree, source: Option<PathBuf>) -> Result<Self, ConfigError> {
        let top = "simulation file";
        let sim_name = tree.require("SIM_NAME", top)?.to_string();
        let sim_root = PathBuf::from(tree.require("SIM_ROOT", top)?);
        let log_file = PathBuf::from(tree.require("LOG_FILE", top)?);
        let log_file = if log_file.is_absolute() {
            log_file
        } else {
            sim_root.join(log_file)
        };

        let ports = tree.section("PORTS").ok_or_else(|| ConfigError::MissingKey {
            key: "PORTS".into(),
            scope: top.into(),
        })?;
        let names = ports.list("NAMES");
        if names.is_empty() {
            return Err(ConfigError::MissingKey {
                key: "PORTS.NAMES".into(),
                scope: top.into(),
            });
        }
        if !names.iter().any(|n| n == DRIVER_PORT) {
            return Err(ConfigError::MissingKey {
                key: format!("PORTS.NAMES[{DRIVER_PORT}]"),
                scope: top.into(),
            });
        }

        let mut components = Vec::with_capacity(names.len());
        for port in &names {
            let port_scope = format!("[PORTS][[{port}]]");
            let implementation = ports
                .section(port)
                .ok_or_else(|| ConfigError::MissingKey {
                    key: port.clone(),
                    scope: "[PORTS]".into(),
                })?
                .require("IMPLEMENTATION", &port_scope)?;
            let section = tree
                .section(implementation)
                .ok_or_else(|| ConfigError::MissingKey {
                    key: format!("[{implementation}]"),
                    scope: top.into(),
                })?;
            components.push(ComponentConfig::from_section(
                port,
                implementation,
                section,
            )?);
        }

        let state_dir = tree
            .get("STATE_WORK_DIR")
            .or_else(|| tree.get("PLASMA_STATE_WORK_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| sim_root.join("state"));
        let mut state_files = tree.list("STATE_FILES");
        if state_files.is_empty() {
            state_files = tree.list("PLASMA_STATE_FILES");
        }
        let time_loop = tree.section("TIME_LOOP").map(TimeLoop::from_section).transpose()?;

        Ok(Self {
            source,
            sim_name,
            sim_root,
            log_file,
            components,
            state_files,
            state_dir,
            time_loop,
            merge_tool: tree.get("MERGE_TOOL").map(str::to_string),
            tree,
        })
    }

    /// Component bound to `port`.
    pub fn port(&self, port: &str) -> Option<&ComponentConfig> {
        self.components.iter().find(|c| c.port == port)
    }

    /// Simulation-level parameter; falls back to the environment.
    pub fn param(&self, key: &str) -> Option<String> {
        self.tree
            .get(key)
            .map(str::to_string)
            .or_else(|| std::env::var(key).ok())
    }

    /// `SIM_ROOT/checklist.conf`.
    pub fn checklist_path(&self) -> PathBuf {
        self.sim_root.join("checklist.conf")
    }

    /// `SIM_ROOT/work`.
    pub fn work_root(&self) -> PathBuf {
        self.sim_root.join("work")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "\
SIM_NAME = hello
SIM_ROOT = /tmp/hello_root
LOG_FILE = ${SIM_NAME}.log
[PORTS]
    NAMES = DRIVER WORKER
    [[DRIVER]]
        IMPLEMENTATION = HELLO_DRIVER
    [[WORKER]]
        IMPLEMENTATION = HELLO_WORKER
[HELLO_DRIVER]
    CLASS = driver
    NAME = HelloDriver
    NPROC = 1
[HELLO_WORKER]
    CLASS = workers
    NAME = HelloWorker
    NPROC = 1
    INPUT_FILES = a.in b.in
[TIME_LOOP]
    MODE = REGULAR
    START = 0
    FINISH = 10
    NSTEP = 5
";

    fn tree(text: &str) -> ConfigTree {
        ConfigTree::parse_str(text, "t", &BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_hello_config() {
        let cfg = SimulationConfig::from_tree(tree(HELLO), None).unwrap();
        assert_eq!(cfg.sim_name, "hello");
        assert_eq!(cfg.log_file, PathBuf::from("/tmp/hello_root/hello.log"));
        assert_eq!(cfg.components.len(), 2);
        let worker = cfg.port("WORKER").unwrap();
        assert_eq!(worker.name, "HelloWorker");
        assert_eq!(worker.input_files, vec!["a.in", "b.in"]);
        assert_eq!(cfg.state_dir, PathBuf::from("/tmp/hello_root/state"));
        assert_eq!(
            cfg.time_loop.unwrap().values(),
            vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]
        );
    }

    #[test]
    fn test_missing_driver_port() {
        let text = HELLO.replace("NAMES = DRIVER WORKER", "NAMES = WORKER");
        let err = SimulationConfig::from_tree(tree(&text), None).unwrap_err();
        assert_eq!(err.as_label(), "config_missing_key");
    }

    #[test]
    fn test_missing_implementation_section() {
        let text = HELLO.replace("[HELLO_WORKER]", "[SOMETHING_ELSE]");
        assert!(SimulationConfig::from_tree(tree(&text), None).is_err());
    }

    #[test]
    fn test_explicit_time_loop() {
        let t = tree("MODE = EXPLICIT\nVALUES = 1 2.5 4\n");
        assert_eq!(
            TimeLoop::from_section(&t).unwrap().values(),
            vec![1.0, 2.5, 4.0]
        );
        let bad = tree("MODE = EXPLICIT\nVALUES = 1 x\n");
        assert!(TimeLoop::from_section(&bad).is_err());
        let zero = tree("MODE = REGULAR\nSTART = 0\nFINISH = 1\nNSTEP = 0\n");
        assert!(TimeLoop::from_section(&zero).is_err());
    }
}
