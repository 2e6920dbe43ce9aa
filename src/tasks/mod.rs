//! Tasks: external child processes launched on behalf of components.
//!
//! - [`TaskRequest`]: what a component asks to run;
//! - [`command`]: launcher-specific argv synthesis;
//! - [`launcher`]: spawning, reaping, cancelling;
//! - [`pool`]: bags of tasks scheduled as a group.
//!
//! ## Synthetic exit codes
//! Tasks that never ran, or were stopped by the runtime, report negative codes:
//!
//! | Code | Meaning |
//! |------|---------|
//! | [`EXIT_CANCELLED`] | killed on request or because its owner was cancelled |
//! | [`EXIT_NODE_FAILURE`] | its node was marked down |
//! | [`EXIT_BAD_REQUEST`] | the allocation could never be satisfied |
//! | [`EXIT_TIMEOUT`] | exceeded its launch timeout |
//! | [`EXIT_LAUNCH_FAILED`] | the process could not be spawned |
//! | [`EXIT_SIGNALLED`] | terminated by a signal the runtime did not send |

mod command;
mod launcher;
mod pool;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use command::{LaunchCommand, LauncherKind};
pub use launcher::{CancelReason, TaskExit, TaskLauncher, TaskState};
pub use pool::{PoolAccounting, PoolTask, SubmitStep, TaskPool, submit_ready};

/// Task identifier, unique within the process.
pub type TaskId = u64;

pub const EXIT_CANCELLED: i32 = -1;
pub const EXIT_NODE_FAILURE: i32 = -2;
pub const EXIT_BAD_REQUEST: i32 = -3;
pub const EXIT_TIMEOUT: i32 = -4;
pub const EXIT_LAUNCH_FAILED: i32 = -5;
pub const EXIT_SIGNALLED: i32 = -6;

/// Global sequence counter for task ids.
static TASK_SEQ: AtomicU64 = AtomicU64::new(1);

/// Draws the next task id.
pub fn next_task_id() -> TaskId {
    TASK_SEQ.fetch_add(1, AtomicOrdering::Relaxed)
}

/// A process a component wants to run.
///
/// ```rust
/// use std::time::Duration;
/// use ips_runtime::TaskRequest;
///
/// let req = TaskRequest::new("/bin/sleep", 1)
///     .arg("1")
///     .working_dir("/tmp")
///     .timeout(Duration::from_secs(5));
/// assert_eq!(req.args, vec!["1".to_string()]);
/// assert!(req.parallel);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub binary: String,
    pub args: Vec<String>,
    /// Cores to allocate.
    pub nproc: usize,
    /// Processes per node; platform default when `None`.
    pub ppn: Option<usize>,
    /// Defaults to the component's working directory.
    pub working_dir: PathBuf,
    /// stdout/stderr destination; a file in the working directory when `None`.
    pub log_file: Option<PathBuf>,
    /// Wrap in the platform's parallel launcher.
    pub parallel: bool,
    /// Kill the process after this long.
    pub timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
    /// Wait for cores instead of failing with `Insufficient`.
    pub block: bool,
}

impl TaskRequest {
    pub fn new(binary: impl Into<String>, nproc: usize) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            nproc,
            ppn: None,
            working_dir: PathBuf::new(),
            log_file: None,
            parallel: true,
            timeout: None,
            env: Vec::new(),
            block: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn ppn(mut self, ppn: usize) -> Self {
        self.ppn = Some(ppn);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Run without the parallel launcher.
    pub fn serial(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Fail with `Insufficient` instead of waiting for cores.
    pub fn nonblocking(mut self) -> Self {
        self.block = false;
        self
    }
}
