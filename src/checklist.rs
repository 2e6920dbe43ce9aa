//! # Checklist and phase gate.
//!
//! Persists which of the three phases completed, so a later invocation can
//! run only what is left.
//!
//! ```text
//! SIM_ROOT/checklist.conf
//!   CREATE_RUNSPACE = DONE
//!   RUN_SETUP = NOT_DONE
//!   RUN = NOT_DONE
//! ```
//!
//! ## Rules
//! - Requesting a phase invalidates every later phase before anything runs.
//! - A phase starts only when the previous phase is `DONE`; otherwise it fails
//!   with [`PhaseError::PrerequisiteMissing`].
//! - A phase is `NOT_DONE` while it runs and stays so if it fails.
//! - A missing file reads as all `NOT_DONE`.

use std::fmt;
use std::path::Path;

use crate::error::{ConfigError, PhaseError};

/// One of the three phases, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    CreateRunspace,
    RunSetup,
    Run,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::CreateRunspace, Phase::RunSetup, Phase::Run];

    /// Key used in the checklist file.
    pub fn key(self) -> &'static str {
        match self {
            Phase::CreateRunspace => "CREATE_RUNSPACE",
            Phase::RunSetup => "RUN_SETUP",
            Phase::Run => "RUN",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn previous(self) -> Option<Phase> {
        match self {
            Phase::CreateRunspace => None,
            Phase::RunSetup => Some(Phase::CreateRunspace),
            Phase::Run => Some(Phase::RunSetup),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::CreateRunspace => "create-runspace",
            Phase::RunSetup => "run-setup",
            Phase::Run => "run",
        })
    }
}

/// Phases asked for on the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Requested {
    pub create_runspace: bool,
    pub run_setup: bool,
    pub run: bool,
}

impl Requested {
    /// All three phases.
    pub fn all() -> Self {
        Self {
            create_runspace: true,
            run_setup: true,
            run: true,
        }
    }

    pub fn contains(&self, phase: Phase) -> bool {
        match phase {
            Phase::CreateRunspace => self.create_runspace,
            Phase::RunSetup => self.run_setup,
            Phase::Run => self.run,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.create_runspace || self.run_setup || self.run)
    }

    /// Requested phases in execution order.
    pub fn phases(&self) -> Vec<Phase> {
        Phase::ALL
            .into_iter()
            .filter(|p| self.contains(*p))
            .collect()
    }
}

/// On-disk phase state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Checklist {
    done: [bool; 3],
}

impl Checklist {
    pub fn is_done(&self, phase: Phase) -> bool {
        self.done[phase.index()]
    }

    pub fn set(&mut self, phase: Phase, done: bool) {
        self.done[phase.index()] = done;
    }

    /// Reads the file; a missing file is all `NOT_DONE`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::io(path, &e)),
        }
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut list = Self::default();
        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parse_err = |reason: String| ConfigError::Parse {
                path: path.display().to_string(),
                line: n + 1,
                reason,
            };
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| parse_err(format!("expected KEY = VALUE, got {line:?}")))?;
            let phase = Phase::ALL
                .into_iter()
                .find(|p| p.key() == key.trim())
                .ok_or_else(|| parse_err(format!("unknown phase {}", key.trim())))?;
            let done = match value.trim() {
                "DONE" => true,
                "NOT_DONE" => false,
                other => return Err(parse_err(format!("unknown state {other}"))),
            };
            list.set(phase, done);
        }
        Ok(list)
    }

    pub fn render(&self) -> String {
        Phase::ALL
            .into_iter()
            .map(|p| {
                let state = if self.is_done(p) { "DONE" } else { "NOT_DONE" };
                format!("{} = {state}\n", p.key())
            })
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.render()).map_err(|e| ConfigError::io(path, &e))
    }

    /// Applies the invalidation rule for `requested` and returns the phases
    /// to attempt, in order.
    pub fn plan(&mut self, requested: Requested) -> Vec<Phase> {
        let phases = requested.phases();
        if let Some(first) = phases.first() {
            for p in Phase::ALL.into_iter().filter(|p| p > first) {
                self.set(p, false);
            }
        }
        phases
    }

    /// Fails when the phase before `phase` is not `DONE`.
    pub fn require(&self, phase: Phase) -> Result<(), PhaseError> {
        match phase.previous() {
            Some(prev) if !self.is_done(prev) => Err(PhaseError::PrerequisiteMissing {
                phase: phase.key().to_string(),
                missing: prev.key().to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    #[test]
    fn test_round_trip_every_state() {
        let path = Path::new("checklist.conf");
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..32 {
            let mut list = Checklist::default();
            for p in Phase::ALL {
                list.set(p, rng.random_bool(0.5));
            }
            assert_eq!(Checklist::parse(&list.render(), path).unwrap(), list);
        }
    }

    #[test]
    fn test_missing_file_is_not_done() {
        let dir = tempfile::tempdir().unwrap();
        let list = Checklist::load(&dir.path().join("checklist.conf")).unwrap();
        assert!(Phase::ALL.iter().all(|p| !list.is_done(*p)));
    }

    #[test]
    fn test_request_invalidates_downstream() {
        let mut list = Checklist::default();
        for p in Phase::ALL {
            list.set(p, true);
        }
        let plan = list.plan(Requested {
            run_setup: true,
            ..Requested::default()
        });
        assert_eq!(plan, vec![Phase::RunSetup]);
        assert!(list.is_done(Phase::CreateRunspace));
        assert!(list.is_done(Phase::RunSetup));
        assert!(!list.is_done(Phase::Run));
    }

    #[test]
    fn test_prerequisite() {
        let mut list = Checklist::default();
        let err = list.require(Phase::RunSetup).unwrap_err();
        assert_eq!(err.to_string(), "unable to continue to RUN_SETUP: CREATE_RUNSPACE = NOT_DONE");
        list.set(Phase::CreateRunspace, true);
        assert!(list.require(Phase::RunSetup).is_ok());
        assert!(list.require(Phase::CreateRunspace).is_ok());
    }

    #[test]
    fn test_bad_state_rejected() {
        let err = Checklist::parse("RUN = MAYBE\n", Path::new("c")).unwrap_err();
        assert_eq!(err.as_label(), "config_parse");
    }
}
