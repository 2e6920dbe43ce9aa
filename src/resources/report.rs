//! # Resource usage report.
//!
//! Appends one row per allocation change to `SIM_ROOT/resource_usage`:
//!
//! ```text
//! # time                   available  allocated  %alloc  note
//! 2026-10-19T12:00:01.123       8          4     50.0  allocate task=3 owner=s@W@2
//! ```
//!
//! Write failures are logged and disable the report; they never fail an allocation.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Append-only allocation log.
pub struct UsageReport {
    path: PathBuf,
    file: Option<File>,
}

impl UsageReport {
    /// Opens (or creates) the report file and writes the header.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(
            file,
            "# {:<23}  {:>9}  {:>9}  {:>6}  note",
            "time", "available", "allocated", "%alloc"
        )?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn row(&mut self, available: usize, allocated: usize, note: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let pct = if available == 0 {
            0.0
        } else {
            100.0 * allocated as f64 / available as f64
        };
        let now = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
        if let Err(e) = writeln!(
            file,
            "  {now:<23}  {available:>9}  {allocated:>9}  {pct:>6.1}  {note}"
        ) {
            warn!(path = %self.path.display(), error = %e, "resource usage report disabled");
            self.file = None;
        }
    }
}
