//! # Component registry.
//!
//! Authoritative table of live components, owned by the router. Entries hold
//! the endpoints the router talks to; components refer to each other only by
//! [`ComponentId`].
//!
//! ```text
//! Registry
//!   entries: id ──► Entry { inbox, responses, join, cancel, config, ... }
//!   ports:   (sim, port) ──► id
//! ```
//!
//! ## Rules
//! - `add` of an id already present is `DuplicateComponent`; nothing changes.
//! - Every lookup of a missing id is `UnknownComponent`.
//! - `remove` hands the entry back so the caller can cancel and join it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::component::{ComponentId, Invocation};
use crate::config::ComponentConfig;
use crate::error::{RegistryError, ServiceError};
use crate::runtime::Response;

/// Reply channel of a component's services proxy.
pub type ResponseTx = mpsc::UnboundedSender<(u64, Result<Response, ServiceError>)>;

/// One live component.
pub struct Entry {
    pub id: ComponentId,
    /// Method invocations, consumed by the component actor.
    pub inbox: mpsc::UnboundedSender<Invocation>,
    /// Service responses, consumed by the services proxy.
    pub responses: ResponseTx,
    pub join: Option<JoinHandle<()>>,
    pub cancel: CancellationToken,
    pub config: Arc<ComponentConfig>,
    pub working_dir: PathBuf,
    fields: BTreeMap<String, Value>,
}

impl Entry {
    pub fn new(
        id: ComponentId,
        inbox: mpsc::UnboundedSender<Invocation>,
        responses: ResponseTx,
        cancel: CancellationToken,
        config: Arc<ComponentConfig>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            id,
            inbox,
            responses,
            join: None,
            cancel,
            config,
            working_dir,
            fields: BTreeMap::new(),
        }
    }

    pub fn port(&self) -> &str {
        &self.config.port
    }
}

/// Live components by id.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<ComponentId, Entry>,
    ports: HashMap<(String, String), ComponentId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: Entry) -> Result<(), RegistryError> {
        if self.entries.contains_key(&entry.id) {
            return Err(RegistryError::DuplicateComponent {
                id: entry.id.to_string(),
            });
        }
        self.ports.insert(
            (entry.id.sim_name().to_string(), entry.port().to_string()),
            entry.id.clone(),
        );
        self.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub fn remove(&mut self, id: &ComponentId) -> Result<Entry, RegistryError> {
        let entry = self.entries.remove(id).ok_or_else(|| unknown(id))?;
        let key = (id.sim_name().to_string(), entry.port().to_string());
        if self.ports.get(&key) == Some(id) {
            self.ports.remove(&key);
        }
        Ok(entry)
    }

    pub fn get(&self, id: &ComponentId) -> Result<&Entry, RegistryError> {
        self.entries.get(id).ok_or_else(|| unknown(id))
    }

    pub fn get_mut(&mut self, id: &ComponentId) -> Result<&mut Entry, RegistryError> {
        self.entries.get_mut(id).ok_or_else(|| unknown(id))
    }

    pub fn contains(&self, id: &ComponentId) -> bool {
        self.entries.contains_key(id)
    }

    /// Components of one simulation, in creation order.
    pub fn list_for_sim(&self, sim: &str) -> Vec<ComponentId> {
        let mut ids: Vec<ComponentId> = self
            .entries
            .keys()
            .filter(|id| id.sim_name() == sim)
            .cloned()
            .collect();
        ids.sort_by_key(ComponentId::seq);
        ids
    }

    /// Component bound to `port` in `sim`.
    pub fn port(&self, sim: &str, port: &str) -> Result<&ComponentId, RegistryError> {
        self.ports
            .get(&(sim.to_string(), port.to_string()))
            .ok_or_else(|| RegistryError::UnknownPort {
                sim: sim.to_string(),
                port: port.to_string(),
            })
    }

    /// Reads a field. `port`, `class`, `name`, `sim` and `working_dir` are
    /// built in; anything else was stored with [`Registry::set_field`].
    pub fn get_field(&self, id: &ComponentId, field: &str) -> Result<Option<Value>, RegistryError> {
        let e = self.get(id)?;
        Ok(match field {
            "port" => Some(Value::from(e.config.port.clone())),
            "class" => Some(Value::from(e.config.class.clone())),
            "name" => Some(Value::from(e.config.name.clone())),
            "sim" => Some(Value::from(id.sim_name())),
            "working_dir" => Some(Value::from(e.working_dir.display().to_string())),
            other => e.fields.get(other).cloned(),
        })
    }

    pub fn set_field(
        &mut self,
        id: &ComponentId,
        field: &str,
        value: Value,
    ) -> Result<(), RegistryError> {
        let e = self.get_mut(id)?;
        match field {
            "working_dir" => {
                if let Some(dir) = value.as_str() {
                    e.working_dir = PathBuf::from(dir);
                }
            }
            _ => {
                e.fields.insert(field.to_string(), value);
            }
        }
        Ok(())
    }

    pub fn ids(&self) -> Vec<ComponentId> {
        let mut ids: Vec<ComponentId> = self.entries.keys().cloned().collect();
        ids.sort_by_key(ComponentId::seq);
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unknown(id: &ComponentId) -> RegistryError {
    RegistryError::UnknownComponent { id: id.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sim: &str, port: &str) -> Entry {
        let (inbox, _) = mpsc::unbounded_channel();
        let (responses, _) = mpsc::unbounded_channel();
        let config = ComponentConfig {
            port: port.into(),
            class: "WORKER".into(),
            name: "HelloWorker".into(),
            ..ComponentConfig::default()
        };
        Entry::new(
            ComponentId::new(sim, "WORKER"),
            inbox,
            responses,
            CancellationToken::new(),
            Arc::new(config),
            PathBuf::from("/tmp/w"),
        )
    }

    #[test]
    fn test_add_get_remove() {
        let mut r = Registry::new();
        let e = entry("reg", "WORKER");
        let id = e.id.clone();
        r.add(e).unwrap();
        assert_eq!(r.port("reg", "WORKER").unwrap(), &id);
        assert_eq!(r.list_for_sim("reg"), vec![id.clone()]);
        assert!(r.list_for_sim("other").is_empty());
        r.remove(&id).unwrap();
        assert!(matches!(
            r.get(&id),
            Err(RegistryError::UnknownComponent { .. })
        ));
        assert!(r.port("reg", "WORKER").is_err());
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let mut r = Registry::new();
        let e = entry("reg", "A");
        let (inbox, _) = mpsc::unbounded_channel();
        let (responses, _) = mpsc::unbounded_channel();
        let dup = Entry::new(
            e.id.clone(),
            inbox,
            responses,
            CancellationToken::new(),
            e.config.clone(),
            PathBuf::new(),
        );
        r.add(e).unwrap();
        assert!(matches!(
            r.add(dup),
            Err(RegistryError::DuplicateComponent { .. })
        ));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn test_fields() {
        let mut r = Registry::new();
        let e = entry("reg", "B");
        let id = e.id.clone();
        r.add(e).unwrap();
        assert_eq!(
            r.get_field(&id, "name").unwrap(),
            Some(Value::from("HelloWorker"))
        );
        assert_eq!(r.get_field(&id, "color").unwrap(), None);
        r.set_field(&id, "color", Value::from("red")).unwrap();
        assert_eq!(r.get_field(&id, "color").unwrap(), Some(Value::from("red")));
        r.set_field(&id, "working_dir", Value::from("/x")).unwrap();
        assert_eq!(r.get(&id).unwrap().working_dir, PathBuf::from("/x"));
    }
}
