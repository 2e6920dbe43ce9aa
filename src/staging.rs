//! # File staging.
//!
//! Moves the files that make up a simulation's state between the shared
//! state directory, component working directories and the results tree, and
//! lays out the runspace.
//!
//! ```text
//! SIM_ROOT/
//!   checklist.conf
//!   <SIM_NAME>_debug.zip
//!   state/                       stage_plasma_state ─► work/<id>/
//!   work/<component_id>/         update_plasma_state ─► state/
//!   simulation_log/
//!   simulation_results/<t>/<component_id>/   ◄─ stage_output_files
//! ```
//!
//! Copies run on the blocking pool; the router never waits for them.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::config::SimulationConfig;
use crate::error::ServiceError;

/// A staging request resolved to concrete paths.
#[derive(Clone, Debug, PartialEq)]
pub enum StagingJob {
    /// Copy `files` (relative names) from `from` into `to`.
    Copy {
        from: PathBuf,
        to: PathBuf,
        files: Vec<String>,
    },
    /// `<tool> -input <target> -updates <partial>`, run in `cwd`.
    Merge {
        tool: String,
        target: PathBuf,
        partial: PathBuf,
        log_file: Option<PathBuf>,
        cwd: PathBuf,
    },
}

impl StagingJob {
    pub async fn run(self) -> Result<(), ServiceError> {
        match self {
            StagingJob::Copy { from, to, files } => {
                tokio::task::spawn_blocking(move || copy_files(&from, &to, &files))
                    .await
                    .map_err(|e| staging(format!("copy task failed: {e}")))?
            }
            StagingJob::Merge {
                tool,
                target,
                partial,
                log_file,
                cwd,
            } => merge(&tool, &target, &partial, log_file.as_deref(), &cwd).await,
        }
    }
}

fn staging(reason: impl Into<String>) -> ServiceError {
    ServiceError::Staging {
        reason: reason.into(),
    }
}

fn io_err(what: &str, path: &Path, e: std::io::Error) -> ServiceError {
    staging(format!("{what} {}: {e}", path.display()))
}

/// Copies each of `files` from `from` to `to`, creating `to`.
///
/// Names may contain sub-directories; a missing source file is an error.
pub fn copy_files(from: &Path, to: &Path, files: &[String]) -> Result<(), ServiceError> {
    fs::create_dir_all(to).map_err(|e| io_err("cannot create", to, e))?;
    for name in files {
        let src = from.join(name);
        let dst = to.join(name);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("cannot create", parent, e))?;
        }
        fs::copy(&src, &dst).map_err(|e| io_err("cannot copy", &src, e))?;
        debug!(src = %src.display(), dst = %dst.display(), "staged");
    }
    Ok(())
}

async fn merge(
    tool: &str,
    target: &Path,
    partial: &Path,
    log_file: Option<&Path>,
    cwd: &Path,
) -> Result<(), ServiceError> {
    let mut cmd = tokio::process::Command::new(tool);
    cmd.arg("-input")
        .arg(target)
        .arg("-updates")
        .arg(partial)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null());
    if let Some(path) = log_file {
        let out = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| io_err("cannot open", path, e))?;
        let err = out.try_clone().map_err(|e| io_err("cannot open", path, e))?;
        cmd.stdout(out).stderr(err);
    }
    let status = cmd
        .status()
        .await
        .map_err(|e| staging(format!("cannot run merge tool {tool}: {e}")))?;
    if !status.success() {
        return Err(staging(format!(
            "merge of {} into {} failed with {status}",
            partial.display(),
            target.display()
        )));
    }
    Ok(())
}

/// Lays out `SIM_ROOT` and copies the input files for provenance.
pub fn create_runspace(
    sim: &SimulationConfig,
    platform_file: Option<&Path>,
) -> Result<(), ServiceError> {
    for dir in [
        sim.sim_root.clone(),
        sim.work_root(),
        sim.state_dir.clone(),
        sim.sim_root.join("simulation_log"),
        sim.sim_root.join("simulation_results"),
    ] {
        fs::create_dir_all(&dir).map_err(|e| io_err("cannot create", &dir, e))?;
    }
    for src in sim.source.as_deref().into_iter().chain(platform_file) {
        if let Some(name) = src.file_name() {
            let dst = sim.sim_root.join(name);
            if dst != src {
                fs::copy(src, &dst).map_err(|e| io_err("cannot copy", src, e))?;
            }
        }
    }
    info!(sim = %sim.sim_name, root = %sim.sim_root.display(), "runspace created");
    Ok(())
}

/// `SIM_ROOT/simulation_results/<timestamp>/<component>`.
pub fn results_dir(sim_root: &Path, timestamp: f64, component: &str) -> PathBuf {
    sim_root
        .join("simulation_results")
        .join(format!("{timestamp}"))
        .join(component)
}

/// Writes `SIM_ROOT/<SIM_NAME>_debug.zip` with the simulation file, the
/// platform file and the checklist, skipping the ones that do not exist.
pub fn write_debug_archive(
    sim: &SimulationConfig,
    platform_file: Option<&Path>,
) -> Result<PathBuf, ServiceError> {
    let path = sim.sim_root.join(format!("{}_debug.zip", sim.sim_name));
    let file = fs::File::create(&path).map_err(|e| io_err("cannot create", &path, e))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    let checklist = sim.checklist_path();
    let members = sim
        .source
        .as_deref()
        .into_iter()
        .chain(platform_file)
        .chain(std::iter::once(checklist.as_path()));
    for src in members {
        let Ok(bytes) = fs::read(src) else {
            continue;
        };
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        zip.start_file(name, options)
            .map_err(|e| staging(format!("debug archive: {e}")))?;
        zip.write_all(&bytes)
            .map_err(|e| io_err("cannot write", &path, e))?;
    }
    zip.finish()
        .map_err(|e| staging(format!("debug archive: {e}")))?;
    debug!(path = %path.display(), "debug archive written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigTree;
    use std::collections::BTreeMap;

    fn sim(root: &Path) -> SimulationConfig {
        let text = format!(
            "SIM_NAME = st\nSIM_ROOT = {}\nLOG_FILE = st.log\n\
             [PORTS]\n NAMES = DRIVER\n [[DRIVER]]\n  IMPLEMENTATION = D\n\
             [D]\n NAME = HelloDriver\n",
            root.display()
        );
        let tree = ConfigTree::parse_str(&text, "t", &BTreeMap::new()).unwrap();
        SimulationConfig::from_tree(tree, None).unwrap()
    }

    #[test]
    fn test_copy_files_and_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a");
        fs::create_dir_all(from.join("sub")).unwrap();
        fs::write(from.join("x.nc"), b"x").unwrap();
        fs::write(from.join("sub/y.nc"), b"y").unwrap();
        let to = dir.path().join("b");

        copy_files(&from, &to, &["x.nc".into(), "sub/y.nc".into()]).unwrap();
        assert_eq!(fs::read(to.join("sub/y.nc")).unwrap(), b"y");

        let err = copy_files(&from, &to, &["nope".into()]).unwrap_err();
        assert_eq!(err.as_label(), "service_staging");
    }

    #[test]
    fn test_runspace_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let cfg = sim(&root);
        create_runspace(&cfg, None).unwrap();
        assert!(root.join("work").is_dir());
        assert!(root.join("state").is_dir());
        assert!(root.join("simulation_log").is_dir());

        fs::write(cfg.checklist_path(), "CREATE_RUNSPACE = DONE\n").unwrap();
        let zip_path = write_debug_archive(&cfg, None).unwrap();
        let archive = zip::ZipArchive::new(fs::File::open(zip_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_merge_tool() {
        let dir = tempfile::tempdir().unwrap();
        let job = StagingJob::Merge {
            tool: "false".into(),
            target: dir.path().join("state.nc"),
            partial: dir.path().join("partial.nc"),
            log_file: None,
            cwd: dir.path().to_path_buf(),
        };
        assert!(job.run().await.is_err());
    }
}
