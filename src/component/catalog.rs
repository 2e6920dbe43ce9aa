//! Component implementations known to the framework, by name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::Component;
use crate::builtin;
use crate::config::ComponentConfig;
use crate::error::ConfigError;

/// Builds a fresh component from its configuration section.
pub type ComponentFactory = Arc<dyn Fn(&ComponentConfig) -> Box<dyn Component> + Send + Sync>;

/// Name → factory table.
///
/// Lookups use the section's `NAME` first, then its `CLASS`.
#[derive(Clone, Default)]
pub struct ComponentCatalog {
    factories: BTreeMap<String, ComponentFactory>,
}

impl ComponentCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the built-in components.
    pub fn with_builtins() -> Self {
        let mut c = Self::new();
        builtin::register(&mut c);
        c
    }

    /// Adds or replaces an implementation.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ComponentConfig) -> Box<dyn Component> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiates the implementation for `config`.
    pub fn build(&self, config: &ComponentConfig) -> Result<Box<dyn Component>, ConfigError> {
        self.factories
            .get(&config.name)
            .or_else(|| self.factories.get(&config.class))
            .map(|f| f(config))
            .ok_or_else(|| ConfigError::UnknownImplementation {
                name: config.name.clone(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for ComponentCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl Component for Nop {}

    fn cfg(name: &str, class: &str) -> ComponentConfig {
        ComponentConfig {
            name: name.into(),
            class: class.into(),
            ..ComponentConfig::default()
        }
    }

    #[test]
    fn test_lookup_falls_back_to_class() {
        let mut c = ComponentCatalog::new();
        c.register("workers", |_| Box::new(Nop));
        assert!(c.build(&cfg("Mine", "workers")).is_ok());
        assert!(matches!(
            c.build(&cfg("Mine", "drivers")),
            Err(ConfigError::UnknownImplementation { .. })
        ));
    }

    #[test]
    fn test_builtins_present() {
        let c = ComponentCatalog::with_builtins();
        for name in ["HelloDriver", "HelloWorker", "GenericDriver", "ExecWorker"] {
            assert!(c.contains(name), "{name}");
        }
    }
}
