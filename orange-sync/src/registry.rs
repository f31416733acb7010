//! Collaborator contracts.
//!
//! The sync core reads module availability from, and writes the handler
//! field into, a [`ModuleRegistry`] owned by the surrounding bot framework.
//! Cache-invalidation notices received from the mesh are handed to a
//! [`ConfigCacheSink`]. Both are traits so the core can be driven by the
//! real framework or by test doubles.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

use crate::message::{CacheScope, ModuleDescriptor};

/// A module as the local registry sees it. `handling` is the derived
/// predicate `handler == self name`, so only `handler` is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalModule {
    pub name: String,
    /// This instance is capable of running the module.
    pub available: bool,
    /// Instance currently responsible, or none while unassigned.
    pub handler: Option<String>,
}

/// The module registry the core binds to.
///
/// The core is the only writer of `handler`; the framework owns the rest.
pub trait ModuleRegistry: Send + Sync {
    fn modules(&self) -> Vec<LocalModule>;
    fn handler(&self, module: &str) -> Option<String>;
    /// Set or clear the handler field. Unknown modules are ignored; the
    /// caller decides whether that deserves a log line.
    fn set_handler(&self, module: &str, handler: Option<&str>);
    fn contains(&self, module: &str) -> bool;
}

/// Descriptor list for a moduleInfo broadcast, from this node's view.
pub fn advertisement(registry: &dyn ModuleRegistry, self_name: &str) -> Vec<ModuleDescriptor> {
    registry
        .modules()
        .into_iter()
        .map(|m| ModuleDescriptor {
            handling: m.handler.as_deref() == Some(self_name),
            name: m.name,
            available: m.available,
        })
        .collect()
}

/// Plain in-memory registry, used by the binary and in tests.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    modules: Mutex<Vec<LocalModule>>,
}

impl InMemoryRegistry {
    pub fn new(modules: Vec<LocalModule>) -> Self {
        InMemoryRegistry {
            modules: Mutex::new(modules),
        }
    }

    /// Build from `name[:unavailable]` specs (the `--modules` flag).
    pub fn from_specs<I, S>(specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let modules = specs
            .into_iter()
            .filter(|s| !s.as_ref().is_empty())
            .map(|spec| {
                let spec = spec.as_ref();
                let (name, available) = match spec.strip_suffix(":unavailable") {
                    Some(name) => (name, false),
                    None => (spec, true),
                };
                LocalModule {
                    name: name.to_string(),
                    available,
                    handler: None,
                }
            })
            .collect();
        InMemoryRegistry::new(modules)
    }
}

impl ModuleRegistry for InMemoryRegistry {
    fn modules(&self) -> Vec<LocalModule> {
        self.modules.lock().clone()
    }

    fn handler(&self, module: &str) -> Option<String> {
        self.modules
            .lock()
            .iter()
            .find(|m| m.name == module)
            .and_then(|m| m.handler.clone())
    }

    fn set_handler(&self, module: &str, handler: Option<&str>) {
        if let Some(m) = self.modules.lock().iter_mut().find(|m| m.name == module) {
            m.handler = handler.map(str::to_owned);
        }
    }

    fn contains(&self, module: &str) -> bool {
        self.modules.lock().iter().any(|m| m.name == module)
    }
}

/// Where received `expireConfigCache` notices land.
pub trait ConfigCacheSink: Send + Sync {
    fn expire_cache(&self, config_name: &str, scope: CacheScope, id: &str);
}

/// Default sink for a standalone node: log the notice and move on.
#[derive(Debug, Default)]
pub struct LoggingCacheSink;

impl ConfigCacheSink for LoggingCacheSink {
    fn expire_cache(&self, config_name: &str, scope: CacheScope, id: &str) {
        tracing::info!(config = %config_name, %scope, %id, "config cache expired");
    }
}

impl fmt::Display for LocalModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (available={}, handler={})",
            self.name,
            self.available,
            self.handler.as_deref().unwrap_or("-")
        )
    }
}
