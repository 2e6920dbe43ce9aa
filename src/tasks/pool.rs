//! # Task pools.
//!
//! A pool is a named bag of tasks owned by one component. Tasks are admitted in
//! order, fed through the resource manager as capacity allows, and their exit
//! codes collected by the owner either all at once or incrementally.
//!
//! ```text
//! add_task ──► pending ──submit_ready──► active ──TaskExit──► finished ──drain──► caller
//!                 │                                              ▲
//!                 └── BadRequest / spawn failure ────────────────┘ (synthetic code)
//! ```
//!
//! ## Rules
//! - `added == pending + active + finished + collected` at every instant.
//! - `submit_ready` walks pending in insertion order and stops at the first
//!   `Insufficient`; later tasks never overtake it.
//! - Every admitted task reaches `finished` exactly once.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use super::{EXIT_BAD_REQUEST, EXIT_CANCELLED, EXIT_LAUNCH_FAILED, TaskId, TaskRequest};
use crate::component::ComponentId;
use crate::error::{LaunchError, PoolError, ResourceError};
use crate::resources::{Allocation, ResourceManager};

/// A task waiting in a pool.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolTask {
    pub task_id: TaskId,
    pub name: String,
    pub request: TaskRequest,
}

/// Counters behind the pool accounting rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolAccounting {
    pub added: usize,
    pub pending: usize,
    pub active: usize,
    /// Finished, collected or not.
    pub finished: usize,
}

impl PoolAccounting {
    pub fn balanced(&self) -> bool {
        self.added == self.pending + self.active + self.finished
    }
}

/// Outcome of one [`submit_ready`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmitStep {
    /// Tasks that moved to active.
    pub launched: usize,
    /// Pending tasks remain because capacity is held elsewhere.
    pub blocked: bool,
}

pub struct TaskPool {
    name: String,
    owner: ComponentId,
    pending: VecDeque<PoolTask>,
    active: HashMap<TaskId, String>,
    finished: BTreeMap<TaskId, i32>,
    names: HashSet<String>,
    added: usize,
    collected: usize,
}

impl TaskPool {
    pub fn new(name: impl Into<String>, owner: ComponentId) -> Self {
        Self {
            name: name.into(),
            owner,
            pending: VecDeque::new(),
            active: HashMap::new(),
            finished: BTreeMap::new(),
            names: HashSet::new(),
            added: 0,
            collected: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &ComponentId {
        &self.owner
    }

    /// Admits a task. Names are unique within the pool.
    pub fn add(&mut self, task: PoolTask) -> Result<TaskId, PoolError> {
        if !self.names.insert(task.name.clone()) {
            return Err(PoolError::DuplicateTask {
                pool: self.name.clone(),
                task: task.name,
            });
        }
        let id = task.task_id;
        self.added += 1;
        self.pending.push_back(task);
        Ok(id)
    }

    /// Records an exit. Returns `false` for a task that is not active here.
    pub fn complete(&mut self, task_id: TaskId, code: i32) -> bool {
        match self.active.remove(&task_id) {
            Some(name) => {
                debug!(pool = %self.name, task = %name, task_id, code, "pool task finished");
                self.finished.insert(task_id, code);
                true
            }
            None => false,
        }
    }

    /// Hands every finished result to the caller.
    pub fn drain_finished(&mut self) -> BTreeMap<TaskId, i32> {
        let out = std::mem::take(&mut self.finished);
        self.collected += out.len();
        out
    }

    pub fn has_finished(&self) -> bool {
        !self.finished.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Nothing pending or active.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }

    /// Nothing pending, active, or waiting to be collected.
    pub fn is_exhausted(&self) -> bool {
        self.is_idle() && self.finished.is_empty()
    }

    pub fn active_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.active.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.active.contains_key(&task_id)
    }

    /// Finishes every pending task with [`EXIT_CANCELLED`].
    pub fn cancel_pending(&mut self) -> usize {
        let n = self.pending.len();
        for task in self.pending.drain(..) {
            self.finished.insert(task.task_id, EXIT_CANCELLED);
        }
        n
    }

    /// Finishes every active task with [`EXIT_CANCELLED`] and returns their
    /// ids. The caller kills the processes; their later exits are ignored.
    pub fn cancel_active(&mut self) -> Vec<TaskId> {
        let ids = self.active_ids();
        for id in &ids {
            self.active.remove(id);
            self.finished.insert(*id, EXIT_CANCELLED);
        }
        ids
    }

    pub fn accounting(&self) -> PoolAccounting {
        PoolAccounting {
            added: self.added,
            pending: self.pending.len(),
            active: self.active.len(),
            finished: self.finished.len() + self.collected,
        }
    }
}

/// Moves pending tasks to active while the resource manager can place them.
///
/// `launch` starts one task on its allocation. A launch failure releases the
/// allocation and finishes the task with [`EXIT_LAUNCH_FAILED`]; an
/// unsatisfiable request finishes it with [`EXIT_BAD_REQUEST`].
pub fn submit_ready<F>(pool: &mut TaskPool, rm: &mut ResourceManager, mut launch: F) -> SubmitStep
where
    F: FnMut(&Allocation, &TaskRequest) -> Result<TaskId, LaunchError>,
{
    let mut step = SubmitStep::default();
    while let Some(front) = pool.pending.front() {
        let req = &front.request;
        match rm.allocate(&pool.owner, req.nproc, front.task_id, req.ppn) {
            Ok(alloc) => {
                let Some(task) = pool.pending.pop_front() else {
                    break;
                };
                match launch(&alloc, &task.request) {
                    Ok(_) => {
                        pool.active.insert(task.task_id, task.name);
                        step.launched += 1;
                    }
                    Err(e) => {
                        warn!(pool = %pool.name, task = %task.name, error = %e, "pool task failed to launch");
                        let _ = rm.release(task.task_id);
                        pool.finished.insert(task.task_id, EXIT_LAUNCH_FAILED);
                    }
                }
            }
            Err(ResourceError::Insufficient { .. }) => {
                step.blocked = true;
                break;
            }
            Err(e) => {
                let Some(task) = pool.pending.pop_front() else {
                    break;
                };
                warn!(pool = %pool.name, task = %task.name, error = %e, "pool task can never be placed");
                pool.finished.insert(task.task_id, EXIT_BAD_REQUEST);
            }
        }
    }
    step
}
