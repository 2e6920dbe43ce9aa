//! # Component identifiers.
//!
//! A [`ComponentId`] is the triple `(simulation, class, sequence)` rendered as
//! `sim@class@seq`. Sequence numbers come from a process-wide counter, so two
//! ids are equal iff their rendered strings are equal.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::error::RegistryError;

/// Global sequence counter for component ids.
static COMPONENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Immutable, globally unique component identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    sim: Arc<str>,
    class: Arc<str>,
    seq: u64,
}

impl ComponentId {
    /// Creates an id with the next process-wide sequence number.
    pub fn new(sim: impl Into<Arc<str>>, class: impl Into<Arc<str>>) -> Self {
        Self {
            sim: sim.into(),
            class: class.into(),
            seq: COMPONENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
        }
    }

    /// Simulation this component belongs to.
    #[inline]
    pub fn sim_name(&self) -> &str {
        &self.sim
    }

    /// Implementation class name.
    #[inline]
    pub fn class_name(&self) -> &str {
        &self.class
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}@{}", self.sim, self.class, self.seq)
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for ComponentId {
    type Err = RegistryError;

    /// Parses `sim@class@seq`. Does not touch the global counter.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || RegistryError::UnknownComponent { id: s.to_string() };
        let mut parts = s.rsplitn(3, '@');
        let seq = parts
            .next()
            .ok_or_else(bad)?
            .parse::<u64>()
            .map_err(|_| bad())?;
        let class = parts.next().filter(|c| !c.is_empty()).ok_or_else(bad)?;
        let sim = parts.next().filter(|c| !c.is_empty()).ok_or_else(bad)?;
        Ok(Self {
            sim: sim.into(),
            class: class.into(),
            seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_and_parse() {
        let id = ComponentId::new("ITER", "HelloWorker");
        let text = id.to_string();
        assert!(text.starts_with("ITER@HelloWorker@"));
        let back: ComponentId = text.parse().unwrap();
        assert_eq!(back, id);
        assert_eq!(back.sim_name(), "ITER");
    }

    #[test]
    fn test_sequence_is_unique() {
        let a = ComponentId::new("s", "C");
        let b = ComponentId::new("s", "C");
        assert_ne!(a, b);
        assert!(b.seq() > a.seq());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("nope".parse::<ComponentId>().is_err());
        assert!("a@b@x".parse::<ComponentId>().is_err());
        assert!("@b@1".parse::<ComponentId>().is_err());
    }
}
