//! # Resource manager.
//!
//! Owns the node inventory and every live [`Allocation`]. Single-writer: the
//! service router is the only caller, so no operation takes a lock.
//!
//! ## Allocation
//! ```text
//! ppn = requested ppn or default_ppn
//!       ├─ > max_ppn  ─► max_ppn (warn)
//!       └─ > cores    ─► cores
//! walk nodes in inventory order (up nodes only):
//!     take min(free(node), ppn, remaining)
//! remaining == 0             ─► commit, Ok(Allocation)
//! Σ min(total(node), ppn) ≥ cores ─► Insufficient   (wait and retry)
//! otherwise                  ─► BadRequest      (never satisfiable)
//! ```
//!
//! ## Rules
//! - `allocated_cores(n) ≤ total_cores(n)` for every node at every instant.
//! - Σ allocated over nodes equals Σ `total_cores` over live allocations.
//! - Each allocation is released exactly once; a second release is `UnknownTask`.
//! - `mark_down` refuses a node that backs an allocation (`AllocatedNodeDown`).

use std::collections::HashMap;

use tracing::{debug, warn};

use super::node::{Allocation, Inventory, Node, NodeSpec, NodeStatus, ResourceSnapshot};
use super::report::UsageReport;
use crate::component::ComponentId;
use crate::error::ResourceError;
use crate::tasks::TaskId;

/// Partitions the node inventory among concurrently running tasks.
pub struct ResourceManager {
    nodes: Vec<Node>,
    default_ppn: usize,
    max_ppn: usize,
    allocations: HashMap<TaskId, Allocation>,
    report: Option<UsageReport>,
}

impl ResourceManager {
    /// Seeds the manager. An empty inventory is [`ResourceError::BadInventory`].
    pub fn initialize(inventory: Inventory) -> Result<Self, ResourceError> {
        if inventory.nodes.is_empty() || inventory.nodes.iter().all(|n| n.cores == 0) {
            return Err(ResourceError::BadInventory);
        }
        let mut rm = Self {
            nodes: Vec::with_capacity(inventory.nodes.len()),
            default_ppn: inventory.default_ppn.max(1),
            max_ppn: inventory.max_ppn.max(1),
            allocations: HashMap::new(),
            report: None,
        };
        rm.add_nodes(inventory.nodes);
        Ok(rm)
    }

    /// Attaches a usage report that receives one row per change.
    pub fn with_report(mut self, mut report: UsageReport) -> Self {
        let snap = self.snapshot();
        report.row(snap.total_cores, snap.allocated_cores, "initialized");
        self.report = Some(report);
        self
    }

    /// Appends nodes to the inventory. Names already present are skipped.
    pub fn add_nodes(&mut self, nodes: Vec<NodeSpec>) {
        for spec in nodes {
            if self.nodes.iter().any(|n| n.name == spec.name) {
                warn!(node = %spec.name, "node already in inventory; ignored");
                continue;
            }
            debug!(node = %spec.name, cores = spec.cores, "node added");
            self.nodes.push(Node::new(spec));
        }
    }

    /// Reserves `cores` for `task_id`.
    pub fn allocate(
        &mut self,
        owner: &ComponentId,
        cores: usize,
        task_id: TaskId,
        ppn: Option<usize>,
    ) -> Result<Allocation, ResourceError> {
        if self.allocations.contains_key(&task_id) {
            return Err(ResourceError::DuplicateTask { task_id });
        }
        let ppn = self.effective_ppn(cores, ppn);
        let capacity = self.capacity(ppn);
        if cores == 0 {
            return Err(ResourceError::BadRequest {
                owner: owner.to_string(),
                task_id,
                requested: cores,
                capacity,
            });
        }

        let mut plan: Vec<(usize, usize)> = Vec::new();
        let mut remaining = cores;
        for (idx, node) in self.nodes.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let take = node.free_cores().min(ppn).min(remaining);
            if take > 0 {
                plan.push((idx, take));
                remaining -= take;
            }
        }

        if remaining > 0 {
            return Err(if capacity >= cores {
                ResourceError::Insufficient {
                    owner: owner.to_string(),
                    task_id,
                    requested: cores,
                    available: cores - remaining,
                    capacity,
                }
            } else {
                ResourceError::BadRequest {
                    owner: owner.to_string(),
                    task_id,
                    requested: cores,
                    capacity,
                }
            });
        }

        let mut node_assignments = Vec::with_capacity(plan.len());
        for (idx, take) in plan {
            let node = &mut self.nodes[idx];
            node.take(task_id, take);
            node_assignments.push((node.name.clone(), take));
        }
        let alloc = Allocation {
            task_id,
            owner: owner.clone(),
            node_assignments,
            total_cores: cores,
            ppn,
        };
        self.allocations.insert(task_id, alloc.clone());
        debug!(task_id, owner = %owner, cores, nodes = ?alloc.node_names(), "allocated");
        self.record(&format!("allocate task={task_id} owner={owner} cores={cores}"));
        Ok(alloc)
    }

    /// Returns the cores held by `task_id`.
    pub fn release(&mut self, task_id: TaskId) -> Result<Allocation, ResourceError> {
        let alloc = self
            .allocations
            .remove(&task_id)
            .ok_or(ResourceError::UnknownTask { task_id })?;
        for (name, _) in &alloc.node_assignments {
            if let Some(node) = self.nodes.iter_mut().find(|n| &n.name == name) {
                node.give_back(task_id);
            }
        }
        debug!(task_id, cores = alloc.total_cores, "released");
        self.record(&format!(
            "release task={task_id} cores={}",
            alloc.total_cores
        ));
        Ok(alloc)
    }

    /// Brings a node back into service.
    pub fn mark_up(&mut self, name: &str) -> Result<(), ResourceError> {
        let node = self.node_mut(name)?;
        node.status = NodeStatus::Up;
        self.record(&format!("node {name} up"));
        Ok(())
    }

    /// Takes a node out of service.
    ///
    /// Fails with [`ResourceError::AllocatedNodeDown`] naming the holders while
    /// the node backs any allocation; the caller cancels them and retries.
    pub fn mark_down(&mut self, name: &str) -> Result<(), ResourceError> {
        let node = self.node_mut(name)?;
        if !node.holders.is_empty() {
            return Err(ResourceError::AllocatedNodeDown {
                node: name.to_string(),
                tasks: node.holders.keys().copied().collect(),
            });
        }
        node.status = NodeStatus::Down;
        warn!(node = name, "node marked down");
        self.record(&format!("node {name} down"));
        Ok(())
    }

    /// Takes a node out of service without waiting for its holders. Their
    /// cores stay allocated, and unusable, until each one is released.
    pub fn fence(&mut self, name: &str) -> Result<Vec<TaskId>, ResourceError> {
        let node = self.node_mut(name)?;
        node.status = NodeStatus::Down;
        let holders: Vec<TaskId> = node.holders.keys().copied().collect();
        warn!(node = name, holders = holders.len(), "node fenced");
        self.record(&format!("node {name} down"));
        Ok(holders)
    }

    /// Read-only view of the inventory.
    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            nodes: self.nodes.iter().map(Node::view).collect(),
            total_cores: self
                .nodes
                .iter()
                .filter(|n| n.is_up())
                .map(|n| n.total_cores)
                .sum(),
            allocated_cores: self.nodes.iter().map(|n| n.allocated_cores).sum(),
            allocations: self.allocations.len(),
        }
    }

    /// Live allocation held by `task_id`.
    pub fn allocation(&self, task_id: TaskId) -> Option<&Allocation> {
        self.allocations.get(&task_id)
    }

    /// Task ids whose allocation is owned by `owner`.
    pub fn allocations_of(&self, owner: &ComponentId) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .allocations
            .values()
            .filter(|a| &a.owner == owner)
            .map(|a| a.task_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn effective_ppn(&self, cores: usize, requested: Option<usize>) -> usize {
        let mut ppn = requested.unwrap_or(self.default_ppn);
        if ppn > self.max_ppn {
            warn!(
                requested = ppn,
                max_ppn = self.max_ppn,
                "ppn above platform limit; clamped"
            );
            ppn = self.max_ppn;
        }
        if cores > 0 && cores < ppn {
            ppn = cores;
        }
        ppn.max(1)
    }

    /// Cores a request with this `ppn` could ever get.
    fn capacity(&self, ppn: usize) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.is_up())
            .map(|n| n.total_cores.min(ppn))
            .sum()
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut Node, ResourceError> {
        self.nodes
            .iter_mut()
            .find(|n| n.name == name)
            .ok_or_else(|| ResourceError::NonexistentResource {
                name: name.to_string(),
            })
    }

    fn record(&mut self, note: &str) {
        if self.report.is_none() {
            return;
        }
        let snap = self.snapshot();
        if let Some(report) = self.report.as_mut() {
            report.row(snap.total_cores, snap.allocated_cores, note);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn owner() -> ComponentId {
        ComponentId::new("rm", "Tester")
    }

    fn rm(nodes: usize, cores: usize) -> ResourceManager {
        ResourceManager::initialize(Inventory::uniform(nodes, cores)).unwrap()
    }

    #[test]
    fn test_empty_inventory_is_rejected() {
        let inv = Inventory {
            nodes: vec![],
            default_ppn: 4,
            max_ppn: 4,
        };
        assert_eq!(
            ResourceManager::initialize(inv).err(),
            Some(ResourceError::BadInventory)
        );
    }

    #[test]
    fn test_first_fit_in_inventory_order() {
        let mut rm = rm(3, 4);
        let a = rm.allocate(&owner(), 6, 1, None).unwrap();
        assert_eq!(
            a.node_assignments,
            vec![("node0".to_string(), 4), ("node1".to_string(), 2)]
        );
        let b = rm.allocate(&owner(), 3, 2, None).unwrap();
        assert_eq!(
            b.node_assignments,
            vec![("node1".to_string(), 2), ("node2".to_string(), 1)]
        );
    }

    #[test]
    fn test_ppn_spreads_and_clamps() {
        let mut rm = rm(4, 4);
        let a = rm.allocate(&owner(), 4, 1, Some(2)).unwrap();
        assert_eq!(a.node_assignments.len(), 2);
        assert_eq!(a.ppn, 2);
        // Above max_ppn: clamped to 4.
        let b = rm.allocate(&owner(), 4, 2, Some(16)).unwrap();
        assert_eq!(b.ppn, 4);
        // Smaller than ppn: ppn lowered to the request.
        let c = rm.allocate(&owner(), 1, 3, Some(4)).unwrap();
        assert_eq!(c.ppn, 1);
    }

    #[test]
    fn test_insufficient_vs_bad_request() {
        let mut rm = rm(1, 10);
        rm.allocate(&owner(), 8, 1, None).unwrap();
        match rm.allocate(&owner(), 4, 2, None) {
            Err(ResourceError::Insufficient {
                available,
                capacity,
                ..
            }) => {
                assert_eq!(available, 2);
                // ppn is lowered to the 4 requested cores.
                assert_eq!(capacity, 4);
            }
            other => panic!("expected Insufficient, got {other:?}"),
        }
        match rm.allocate(&owner(), 20, 3, None) {
            Err(ResourceError::BadRequest { capacity, .. }) => assert_eq!(capacity, 10),
            other => panic!("expected BadRequest, got {other:?}"),
        }
        // With ppn=1 only one core per node can ever be had.
        assert!(matches!(
            rm.allocate(&owner(), 2, 4, Some(1)),
            Err(ResourceError::BadRequest { .. })
        ));
    }

    #[test]
    fn test_double_release_is_unknown_task() {
        let mut rm = rm(1, 4);
        rm.allocate(&owner(), 2, 7, None).unwrap();
        assert!(rm.release(7).is_ok());
        assert_eq!(
            rm.release(7).err(),
            Some(ResourceError::UnknownTask { task_id: 7 })
        );
    }

    #[test]
    fn test_duplicate_task_id() {
        let mut rm = rm(1, 4);
        rm.allocate(&owner(), 1, 7, None).unwrap();
        assert_eq!(
            rm.allocate(&owner(), 1, 7, None).err(),
            Some(ResourceError::DuplicateTask { task_id: 7 })
        );
    }

    #[test]
    fn test_mark_down_refuses_allocated_node() {
        let mut rm = rm(2, 4);
        rm.allocate(&owner(), 4, 11, None).unwrap();
        assert_eq!(
            rm.mark_down("node0").err(),
            Some(ResourceError::AllocatedNodeDown {
                node: "node0".into(),
                tasks: vec![11]
            })
        );
        rm.release(11).unwrap();
        rm.mark_down("node0").unwrap();
        // Idempotent.
        rm.mark_down("node0").unwrap();
        // Capacity now excludes node0.
        assert!(matches!(
            rm.allocate(&owner(), 8, 12, None),
            Err(ResourceError::BadRequest { capacity: 4, .. })
        ));
        let a = rm.allocate(&owner(), 4, 13, None).unwrap();
        assert_eq!(a.node_names(), vec!["node1"]);
        rm.mark_up("node0").unwrap();
        assert_eq!(rm.snapshot().free_cores(), 4);
        assert!(matches!(
            rm.mark_down("nope"),
            Err(ResourceError::NonexistentResource { .. })
        ));
    }

    #[test]
    fn test_fenced_node_keeps_cores_until_release() {
        let mut rm = rm(2, 4);
        rm.allocate(&owner(), 2, 21, None).unwrap();
        assert_eq!(rm.fence("node0").unwrap(), vec![21]);
        assert_eq!(rm.snapshot().allocated_cores, 2);
        let a = rm.allocate(&owner(), 4, 22, None).unwrap();
        assert_eq!(a.node_names(), vec!["node1"]);
        assert!(matches!(
            rm.allocate(&owner(), 1, 23, None),
            Err(ResourceError::Insufficient { .. })
        ));
        rm.release(21).unwrap();
        assert_eq!(rm.snapshot().allocated_cores, 4);
        rm.mark_down("node0").unwrap();
    }

    #[test]
    fn test_conservation_and_no_overcommit_under_random_interleavings() {
        let mut rng = StdRng::seed_from_u64(0x1b5);
        let mut rm = ResourceManager::initialize(Inventory {
            nodes: vec![
                NodeSpec {
                    name: "a".into(),
                    cores: 4,
                },
                NodeSpec {
                    name: "b".into(),
                    cores: 8,
                },
                NodeSpec {
                    name: "c".into(),
                    cores: 2,
                },
            ],
            default_ppn: 8,
            max_ppn: 8,
        })
        .unwrap();
        let mut live: Vec<TaskId> = Vec::new();
        for task_id in 0..2_000u64 {
            if !live.is_empty() && rng.random_bool(0.45) {
                let idx = rng.random_range(0..live.len());
                rm.release(live.swap_remove(idx)).unwrap();
            } else {
                let cores = rng.random_range(1..=16);
                let ppn = if rng.random_bool(0.3) {
                    Some(rng.random_range(1..=8))
                } else {
                    None
                };
                if rm.allocate(&owner(), cores, task_id, ppn).is_ok() {
                    live.push(task_id);
                }
            }

            let snap = rm.snapshot();
            for n in &snap.nodes {
                assert!(n.allocated_cores <= n.total_cores);
            }
            let held: usize = live
                .iter()
                .map(|t| rm.allocation(*t).unwrap().total_cores)
                .sum();
            assert_eq!(snap.allocated_cores, held);
        }
    }

    #[test]
    fn test_report_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resource_usage");
        let mut rm = rm(1, 4).with_report(UsageReport::open(&path).unwrap());
        rm.allocate(&owner(), 2, 1, None).unwrap();
        rm.release(1).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.lines().next().unwrap().starts_with("# time"));
        assert_eq!(text.lines().count(), 4);
        assert!(text.contains("allocate task=1"));
        assert!(text.contains("50.0"));
    }
}
