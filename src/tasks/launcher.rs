//! # Task launcher.
//!
//! Spawns a child process on an allocation and reaps it without blocking the
//! router.
//!
//! ```text
//! launch(alloc, request)
//!   ├─► LaunchCommand::build(kind, alloc, binary, argv, parallel)
//!   ├─► tokio::process::Command::spawn (stdout/stderr → log sink)
//!   └─► reaper task:
//!         select {
//!           child.wait()         ─► code
//!           token.cancelled()    ─► start_kill, wait ─► EXIT_CANCELLED
//!           sleep(timeout)       ─► start_kill, wait ─► EXIT_TIMEOUT
//!         }
//!         exits.send(TaskExit { task_id, code })   (side channel to the router)
//! ```
//!
//! ## Rules
//! - A task is `running` from spawn until the router applies its [`TaskExit`].
//! - `cancel` moves it to `killed` at once; the eventual exit code is replaced
//!   by the code of the cancel reason (node failure, owner cancelled, ...).
//! - Records stay until harvested by `wait`, so a wait after exit still
//!   returns the code. `poll` reports each exit once without harvesting it.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::{LaunchCommand, LauncherKind};
use super::{
    EXIT_CANCELLED, EXIT_NODE_FAILURE, EXIT_SIGNALLED, EXIT_TIMEOUT, TaskId, TaskRequest,
};
use crate::component::ComponentId;
use crate::error::LaunchError;
use crate::resources::Allocation;

/// Task lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Killed,
}

/// Why a task was killed by the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// `kill_task` / `kill_all_tasks` / pool removal.
    Requested,
    /// The node under the task was marked down.
    NodeFailure,
    /// The owning component was cancelled.
    OwnerCancelled,
}

impl CancelReason {
    /// Exit code reported for a task killed for this reason.
    pub fn exit_code(self) -> i32 {
        match self {
            CancelReason::Requested | CancelReason::OwnerCancelled => EXIT_CANCELLED,
            CancelReason::NodeFailure => EXIT_NODE_FAILURE,
        }
    }
}

/// Reaper notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskExit {
    pub task_id: TaskId,
    pub code: i32,
}

struct TaskRecord {
    owner: ComponentId,
    state: TaskState,
    exit_code: Option<i32>,
    /// Exit already returned by `poll`.
    polled: bool,
    cancel: CancellationToken,
    reason: Option<CancelReason>,
    started: Instant,
}

/// Owns every child process started by the runtime.
pub struct TaskLauncher {
    kind: LauncherKind,
    tasks: HashMap<TaskId, TaskRecord>,
    exits: mpsc::UnboundedSender<TaskExit>,
}

impl TaskLauncher {
    /// `exits` receives one [`TaskExit`] per launched task.
    pub fn new(kind: LauncherKind, exits: mpsc::UnboundedSender<TaskExit>) -> Self {
        Self {
            kind,
            tasks: HashMap::new(),
            exits,
        }
    }

    /// Starts `request` on `alloc`. The child is killed when `parent` is cancelled.
    ///
    /// On error nothing is tracked; the caller releases the allocation.
    pub fn launch(
        &mut self,
        alloc: &Allocation,
        request: &TaskRequest,
        parent: &CancellationToken,
    ) -> Result<TaskId, LaunchError> {
        let task_id = alloc.task_id;
        let command = LaunchCommand::build(
            self.kind,
            alloc,
            &request.binary,
            &request.args,
            request.parallel,
        );

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&request.working_dir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("IPS_TASK_ID", task_id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match &request.log_file {
            Some(path) => {
                let sink_err = |e: std::io::Error| LaunchError::LogSink {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                };
                let out = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(sink_err)?;
                let err = out.try_clone().map_err(sink_err)?;
                cmd.stdout(out).stderr(err);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().map_err(|e| LaunchError::Spawn {
            binary: command.program.clone(),
            reason: e.to_string(),
        })?;

        let token = parent.child_token();
        spawn_reaper(
            task_id,
            child,
            token.clone(),
            request.timeout,
            self.exits.clone(),
        );

        info!(
            task_id,
            owner = %alloc.owner,
            cores = alloc.total_cores,
            command = %command.display(),
            "task launched"
        );
        self.tasks.insert(
            task_id,
            TaskRecord {
                owner: alloc.owner.clone(),
                state: TaskState::Running,
                exit_code: None,
                polled: false,
                cancel: token,
                reason: None,
                started: Instant::now(),
            },
        );
        Ok(task_id)
    }

    /// Applies a reaper notification. Returns the final code, or `None` for a
    /// task this launcher never started.
    pub fn on_exit(&mut self, exit: TaskExit) -> Option<i32> {
        let rec = self.tasks.get_mut(&exit.task_id)?;
        let code = match rec.reason {
            Some(reason) => reason.exit_code(),
            None => exit.code,
        };
        rec.state = if rec.reason.is_some() || exit.code == EXIT_TIMEOUT {
            TaskState::Killed
        } else {
            TaskState::Done
        };
        rec.exit_code = Some(code);
        debug!(
            task_id = exit.task_id,
            code,
            elapsed = ?rec.started.elapsed(),
            "task exited"
        );
        Some(code)
    }

    /// Signals a running task. Its state becomes `killed` immediately.
    pub fn cancel(&mut self, task_id: TaskId, reason: CancelReason) -> Result<(), LaunchError> {
        let rec = self
            .tasks
            .get_mut(&task_id)
            .ok_or(LaunchError::UnknownTask { task_id })?;
        if rec.state == TaskState::Running {
            warn!(task_id, ?reason, "killing task");
            rec.reason = Some(reason);
            rec.state = TaskState::Killed;
            rec.cancel.cancel();
        }
        Ok(())
    }

    /// Exits of `owner`'s unharvested tasks since its previous poll, in id
    /// order.
    pub fn poll(&mut self, owner: &ComponentId) -> Vec<(TaskId, i32)> {
        let mut out: Vec<(TaskId, i32)> = self
            .tasks
            .iter_mut()
            .filter(|(_, r)| &r.owner == owner && !r.polled)
            .filter_map(|(id, r)| {
                let code = r.exit_code?;
                r.polled = true;
                Some((*id, code))
            })
            .collect();
        out.sort_unstable();
        out
    }

    /// Exit code if the task has exited (removing its record), `None` if it is
    /// still running.
    pub fn try_harvest(&mut self, task_id: TaskId) -> Result<Option<i32>, LaunchError> {
        let rec = self
            .tasks
            .get(&task_id)
            .ok_or(LaunchError::UnknownTask { task_id })?;
        match rec.exit_code {
            Some(code) => {
                self.tasks.remove(&task_id);
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    /// Exit code without harvesting.
    pub fn exit_code(&self, task_id: TaskId) -> Option<i32> {
        self.tasks.get(&task_id).and_then(|r| r.exit_code)
    }

    pub fn owner(&self, task_id: TaskId) -> Option<&ComponentId> {
        self.tasks.get(&task_id).map(|r| &r.owner)
    }

    pub fn state(&self, task_id: TaskId) -> Option<TaskState> {
        self.tasks.get(&task_id).map(|r| r.state)
    }

    /// Running tasks owned by `owner`, in id order.
    pub fn running_of(&self, owner: &ComponentId) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, r)| &r.owner == owner && r.state == TaskState::Running)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

fn spawn_reaper(
    task_id: TaskId,
    mut child: tokio::process::Child,
    token: CancellationToken,
    timeout: Option<Duration>,
    exits: mpsc::UnboundedSender<TaskExit>,
) {
    tokio::spawn(async move {
        let expire = async move {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        let code = tokio::select! {
            status = child.wait() => match status {
                Ok(s) => s.code().unwrap_or(EXIT_SIGNALLED),
                Err(_) => EXIT_SIGNALLED,
            },
            _ = token.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                EXIT_CANCELLED
            }
            _ = expire => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                EXIT_TIMEOUT
            }
        };
        let _ = exits.send(TaskExit { task_id, code });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(task_id: TaskId) -> Allocation {
        Allocation {
            task_id,
            owner: ComponentId::new("launch", "T"),
            node_assignments: vec![("n0".into(), 1)],
            total_cores: 1,
            ppn: 1,
        }
    }

    fn request(binary: &str, args: &[&str]) -> TaskRequest {
        TaskRequest::new(binary, 1)
            .args(args.iter().map(|s| s.to_string()))
            .working_dir(std::env::temp_dir())
    }

    #[tokio::test]
    async fn test_exit_code_is_reaped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut l = TaskLauncher::new(LauncherKind::Eval, tx);
        let root = CancellationToken::new();
        let a = alloc(9_001);
        l.launch(&a, &request("/bin/sh", &["-c", "exit 3"]), &root)
            .unwrap();
        assert_eq!(l.try_harvest(9_001).unwrap(), None);
        let exit = rx.recv().await.unwrap();
        assert_eq!(l.on_exit(exit), Some(3));
        assert_eq!(l.state(9_001), Some(TaskState::Done));
        assert_eq!(l.poll(&a.owner), vec![(9_001, 3)]);
        assert!(l.poll(&a.owner).is_empty());
        assert_eq!(l.try_harvest(9_001).unwrap(), Some(3));
        assert!(l.try_harvest(9_001).is_err());
    }

    #[tokio::test]
    async fn test_poll_reports_each_exit_once_and_keeps_it_waitable() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut l = TaskLauncher::new(LauncherKind::Eval, tx);
        let root = CancellationToken::new();
        let a = alloc(9_007);
        l.launch(&a, &request("/bin/true", &[]), &root).unwrap();
        assert!(l.poll(&a.owner).is_empty());
        let exit = rx.recv().await.unwrap();
        l.on_exit(exit);
        assert_eq!(l.poll(&a.owner), vec![(9_007, 0)]);
        assert!(l.poll(&a.owner).is_empty());
        assert!(l.poll(&ComponentId::new("launch", "Other")).is_empty());
        assert_eq!(l.try_harvest(9_007).unwrap(), Some(0));
        assert_eq!(l.state(9_007), None);
    }

    #[tokio::test]
    async fn test_cancel_reports_reason_code() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut l = TaskLauncher::new(LauncherKind::Eval, tx);
        let root = CancellationToken::new();
        l.launch(&alloc(9_002), &request("/bin/sleep", &["30"]), &root)
            .unwrap();
        l.cancel(9_002, CancelReason::NodeFailure).unwrap();
        assert_eq!(l.state(9_002), Some(TaskState::Killed));
        let exit = rx.recv().await.unwrap();
        assert_eq!(l.on_exit(exit), Some(EXIT_NODE_FAILURE));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut l = TaskLauncher::new(LauncherKind::Eval, tx);
        let root = CancellationToken::new();
        let req = request("/bin/sleep", &["30"]).timeout(Duration::from_millis(50));
        l.launch(&alloc(9_003), &req, &root).unwrap();
        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.code, EXIT_TIMEOUT);
        l.on_exit(exit);
        assert_eq!(l.state(9_003), Some(TaskState::Killed));
    }

    #[tokio::test]
    async fn test_parent_cancellation_kills_children() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut l = TaskLauncher::new(LauncherKind::Eval, tx);
        let root = CancellationToken::new();
        l.launch(&alloc(9_004), &request("/bin/sleep", &["30"]), &root)
            .unwrap();
        root.cancel();
        assert_eq!(rx.recv().await.unwrap().code, EXIT_CANCELLED);
    }

    #[tokio::test]
    async fn test_spawn_failure_tracks_nothing() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut l = TaskLauncher::new(LauncherKind::Eval, tx);
        let err = l
            .launch(
                &alloc(9_005),
                &request("/definitely/not/here", &[]),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert_eq!(err.as_label(), "launch_spawn");
        assert_eq!(l.state(9_005), None);
    }

    #[tokio::test]
    async fn test_output_goes_to_log_sink() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("task.log");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut l = TaskLauncher::new(LauncherKind::Eval, tx);
        let req = request("/bin/echo", &["hello", "pool"]).log_file(&log);
        l.launch(&alloc(9_006), &req, &CancellationToken::new())
            .unwrap();
        l.on_exit(rx.recv().await.unwrap());
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "hello pool\n");
    }
}
