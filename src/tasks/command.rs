//! # Launch command synthesis.
//!
//! Turns an allocation plus a binary into the argv that actually gets spawned.
//! Parallel tasks are wrapped in the platform launcher:
//!
//! | Launcher  | Prefix                                         |
//! |-----------|------------------------------------------------|
//! | `eval`    | none, the binary runs directly                 |
//! | `mpirun`  | `mpirun -np N [-npernode P] [-H n1,n2]`        |
//! | `mpiexec` | `mpiexec -n N -npernode P [--host n1,n2]`      |
//! | `aprun`   | `aprun -n N -N P [-L n1,n2]`                   |
//! | `srun`    | `srun -N nodes -n N`                           |
//!
//! Host lists are always passed: several tasks may share one partition.

use std::fmt;
use std::str::FromStr;

use crate::error::LaunchError;
use crate::resources::Allocation;

/// Parallel launcher named by the platform's `MPIRUN` key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LauncherKind {
    /// Run the binary as-is.
    #[default]
    Eval,
    /// OpenMPI `mpirun`.
    Mpirun,
    Mpiexec,
    /// Cray ALPS.
    Aprun,
    /// Slurm.
    Srun,
}

impl FromStr for LauncherKind {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let base = name.rsplit('/').next().unwrap_or(name);
        match base.to_ascii_lowercase().as_str() {
            "eval" | "" => Ok(LauncherKind::Eval),
            "mpirun" => Ok(LauncherKind::Mpirun),
            "mpiexec" => Ok(LauncherKind::Mpiexec),
            "aprun" => Ok(LauncherKind::Aprun),
            "srun" => Ok(LauncherKind::Srun),
            _ => Err(LaunchError::UnsupportedLauncher {
                name: name.to_string(),
            }),
        }
    }
}

impl fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LauncherKind::Eval => "eval",
            LauncherKind::Mpirun => "mpirun",
            LauncherKind::Mpiexec => "mpiexec",
            LauncherKind::Aprun => "aprun",
            LauncherKind::Srun => "srun",
        })
    }
}

/// Program plus arguments, ready for `tokio::process::Command`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    /// Builds the command for `binary argv...` on `alloc`.
    pub fn build(
        kind: LauncherKind,
        alloc: &Allocation,
        binary: &str,
        argv: &[String],
        parallel: bool,
    ) -> Self {
        if !parallel || kind == LauncherKind::Eval {
            return Self {
                program: binary.to_string(),
                args: argv.to_vec(),
            };
        }

        let n = alloc.total_cores.to_string();
        let ppn = alloc.ppn.to_string();
        let hosts = alloc.node_names().join(",");
        let nnodes = alloc.node_assignments.len().max(1).to_string();

        let mut args: Vec<String> = match kind {
            LauncherKind::Mpirun => {
                let mut a = vec!["-np".to_string(), n];
                if alloc.node_assignments.len() > 1 {
                    a.extend(["-npernode".to_string(), ppn]);
                }
                a.extend(["-H".to_string(), hosts]);
                a
            }
            LauncherKind::Mpiexec => vec![
                "-n".into(),
                n,
                "-npernode".into(),
                ppn,
                "--host".into(),
                hosts,
            ],
            LauncherKind::Aprun => {
                vec!["-n".into(), n, "-N".into(), ppn, "-L".into(), hosts]
            }
            LauncherKind::Srun => vec!["-N".into(), nnodes, "-n".into(), n],
            LauncherKind::Eval => Vec::new(),
        };
        args.push(binary.to_string());
        args.extend(argv.iter().cloned());
        Self {
            program: kind.to_string(),
            args,
        }
    }

    /// Single-line rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
