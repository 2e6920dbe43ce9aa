//! Nodes, inventories and allocations.

use std::collections::BTreeMap;

use crate::component::ComponentId;
use crate::tasks::TaskId;

/// One node as described by platform discovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub cores: usize,
}

/// Initial resource inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inventory {
    /// Nodes in allocation order.
    pub nodes: Vec<NodeSpec>,
    /// Processes per node used when a request names none.
    pub default_ppn: usize,
    /// Upper bound on processes per node.
    pub max_ppn: usize,
}

impl Inventory {
    /// `count` identical nodes named `node0..`.
    pub fn uniform(count: usize, cores: usize) -> Self {
        Self {
            nodes: (0..count)
                .map(|i| NodeSpec {
                    name: format!("node{i}"),
                    cores,
                })
                .collect(),
            default_ppn: cores,
            max_ppn: cores,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    Up,
    Down,
}

/// Live node state owned by the resource manager.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) total_cores: usize,
    pub(crate) allocated_cores: usize,
    pub(crate) status: NodeStatus,
    /// Cores held per task on this node.
    pub(crate) holders: BTreeMap<TaskId, usize>,
}

impl Node {
    pub(crate) fn new(spec: NodeSpec) -> Self {
        Self {
            name: spec.name,
            total_cores: spec.cores,
            allocated_cores: 0,
            status: NodeStatus::Up,
            holders: BTreeMap::new(),
        }
    }

    #[inline]
    pub(crate) fn is_up(&self) -> bool {
        self.status == NodeStatus::Up
    }

    #[inline]
    pub(crate) fn free_cores(&self) -> usize {
        if self.is_up() {
            self.total_cores - self.allocated_cores
        } else {
            0
        }
    }

    pub(crate) fn take(&mut self, task_id: TaskId, cores: usize) {
        debug_assert!(cores <= self.free_cores());
        self.allocated_cores += cores;
        *self.holders.entry(task_id).or_insert(0) += cores;
    }

    pub(crate) fn give_back(&mut self, task_id: TaskId) -> usize {
        let cores = self.holders.remove(&task_id).unwrap_or(0);
        self.allocated_cores -= cores;
        cores
    }

    pub(crate) fn view(&self) -> NodeView {
        NodeView {
            name: self.name.clone(),
            total_cores: self.total_cores,
            allocated_cores: self.allocated_cores,
            status: self.status,
        }
    }
}

/// Cores reserved for one task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub task_id: TaskId,
    pub owner: ComponentId,
    /// `(node, cores)` in inventory order; cores sum to `total_cores`.
    pub node_assignments: Vec<(String, usize)>,
    pub total_cores: usize,
    /// Processes per node the request was planned with.
    pub ppn: usize,
}

impl Allocation {
    /// Node names, in assignment order.
    pub fn node_names(&self) -> Vec<&str> {
        self.node_assignments
            .iter()
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

/// Read-only copy of one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeView {
    pub name: String,
    pub total_cores: usize,
    pub allocated_cores: usize,
    pub status: NodeStatus,
}

/// Read-only copy of the whole inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub nodes: Vec<NodeView>,
    /// Cores on nodes that are up.
    pub total_cores: usize,
    pub allocated_cores: usize,
    /// Live allocations.
    pub allocations: usize,
}

impl ResourceSnapshot {
    pub fn free_cores(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Up)
            .map(|n| n.total_cores - n.allocated_cores)
            .sum()
    }
}
