//! # Platform configuration.
//!
//! Describes the machine: how many nodes and cores the runtime may use, which
//! parallel launcher wraps tasks, and where portal records go.
//!
//! ## Inventory precedence
//! 1. `--nodes` / `--ppn` from the command line (synthetic `node0..nodeN-1`);
//! 2. `NODES` and `CORES_PER_NODE` (alias `PROCS_PER_NODE`) from the file;
//! 3. the local host with the detected CPU count.

use std::path::{Path, PathBuf};

use super::tree::ConfigTree;
use crate::error::ConfigError;
use crate::resources::{Inventory, NodeSpec};
use crate::tasks::LauncherKind;

/// Resource sizes forced from the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InventoryOverride {
    pub nodes: Option<usize>,
    pub ppn: Option<usize>,
}

/// Typed view of a platform file.
#[derive(Clone, Debug)]
pub struct PlatformConfig {
    pub source: Option<PathBuf>,
    pub host: String,
    pub launcher: LauncherKind,
    pub nodes: Option<usize>,
    pub cores_per_node: Option<usize>,
    /// Upper bound on processes per node a task may ask for.
    pub max_ppn: Option<usize>,
    pub portal_url: Option<String>,
    pub use_portal: bool,
    /// Append allocation rows to `SIM_ROOT/resource_usage`.
    pub resource_report: bool,
    pub tree: ConfigTree,
}

impl Default for PlatformConfig {
    /// Local host, direct launches, no portal.
    fn default() -> Self {
        Self {
            source: None,
            host: local_host_name(),
            launcher: LauncherKind::Eval,
            nodes: None,
            cores_per_node: None,
            max_ppn: None,
            portal_url: None,
            use_portal: false,
            resource_report: false,
            tree: ConfigTree::default(),
        }
    }
}

impl PlatformConfig {
    /// Loads a platform file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let tree = ConfigTree::load(path)?;
        let mut cfg = Self::from_tree(tree)?;
        cfg.source = Some(path.to_path_buf());
        Ok(cfg)
    }

    /// Reads the recognised keys out of a parsed tree.
    pub fn from_tree(tree: ConfigTree) -> Result<Self, ConfigError> {
        let launcher = match tree.get("MPIRUN") {
            None => LauncherKind::Eval,
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "MPIRUN".into(),
                value: raw.to_string(),
            })?,
        };
        let cores_per_node = match tree.parse::<usize>("CORES_PER_NODE")? {
            Some(n) => Some(n),
            None => tree.parse::<usize>("PROCS_PER_NODE")?,
        };
        let portal_url = tree
            .get("PORTAL_URL")
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let use_portal = tree.flag("USE_PORTAL")?.unwrap_or(portal_url.is_some());

        Ok(Self {
            source: None,
            host: tree
                .get("HOST")
                .map(str::to_string)
                .unwrap_or_else(local_host_name),
            launcher,
            nodes: tree.parse::<usize>("NODES")?,
            cores_per_node,
            max_ppn: tree.parse::<usize>("MAX_PPN")?,
            portal_url,
            use_portal,
            resource_report: tree.flag("RESOURCE_REPORT")?.unwrap_or(false),
            tree,
        })
    }

    /// Builds the initial resource inventory.
    pub fn inventory(&self, over: InventoryOverride) -> Inventory {
        let detected = num_cpus::get().max(1);
        let (names, cores): (Vec<String>, usize) = match (over.nodes, self.nodes) {
            (Some(n), _) => (
                (0..n).map(|i| format!("node{i}")).collect(),
                over.ppn.or(self.cores_per_node).unwrap_or(detected),
            ),
            (None, Some(n)) => (
                (0..n).map(|i| format!("{}_{i}", self.host)).collect(),
                over.ppn.or(self.cores_per_node).unwrap_or(detected),
            ),
            (None, None) => (
                vec![self.host.clone()],
                over.ppn.or(self.cores_per_node).unwrap_or(detected),
            ),
        };
        let nodes = names
            .into_iter()
            .map(|name| NodeSpec { name, cores })
            .collect();
        Inventory {
            nodes,
            default_ppn: cores,
            max_ppn: self.max_ppn.unwrap_or(cores).max(1),
        }
    }
}

fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn platform(text: &str) -> PlatformConfig {
        let tree = ConfigTree::parse_str(text, "p", &BTreeMap::new()).unwrap();
        PlatformConfig::from_tree(tree).unwrap()
    }

    #[test]
    fn test_file_inventory() {
        let p = platform("HOST = cluster\nMPIRUN = mpiexec\nNODES = 2\nPROCS_PER_NODE = 8\n");
        assert_eq!(p.launcher, LauncherKind::Mpiexec);
        let inv = p.inventory(InventoryOverride::default());
        assert_eq!(inv.nodes.len(), 2);
        assert_eq!(inv.nodes[1].name, "cluster_1");
        assert_eq!(inv.nodes[0].cores, 8);
        assert_eq!(inv.max_ppn, 8);
    }

    #[test]
    fn test_cli_override_wins() {
        let p = platform("NODES = 2\nCORES_PER_NODE = 8\n");
        let inv = p.inventory(InventoryOverride {
            nodes: Some(3),
            ppn: Some(4),
        });
        assert_eq!(inv.nodes.len(), 3);
        assert_eq!(inv.nodes[2].name, "node2");
        assert!(inv.nodes.iter().all(|n| n.cores == 4));
    }

    #[test]
    fn test_portal_switches() {
        assert!(!platform("").use_portal);
        assert!(platform("PORTAL_URL = http://x/y\n").use_portal);
        assert!(!platform("PORTAL_URL = http://x/y\nUSE_PORTAL = False\n").use_portal);
    }

    #[test]
    fn test_unknown_launcher() {
        let tree = ConfigTree::parse_str("MPIRUN = qsub\n", "p", &BTreeMap::new()).unwrap();
        assert!(PlatformConfig::from_tree(tree).is_err());
    }
}
