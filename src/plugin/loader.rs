//! Module loading strategies.
//!
//! Turns a manifest's entry point into a module handle. How the code is
//! fetched is up to the loader.

use crate::core::{sync, Error, Result};
use crate::manifest::Manifest;
use crate::plugin::interface::PluginModule;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Resolves an entry point to a module.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Load the module a manifest points at.
    async fn load(&self, manifest: &Manifest) -> Result<Arc<dyn PluginModule>>;
}

/// Builds a fresh module instance for a manifest.
pub type ModuleFactory = Arc<dyn Fn(&Manifest) -> Result<Arc<dyn PluginModule>> + Send + Sync>;

/// Loader over modules registered in-process, keyed by entry reference.
#[derive(Default)]
pub struct StaticModuleLoader {
    factories: RwLock<HashMap<String, ModuleFactory>>,
    loads: AtomicU64,
}

impl StaticModuleLoader {
    /// Create an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for an entry reference.
    pub fn register<F>(&self, reference: &str, factory: F)
    where
        F: Fn(&Manifest) -> Result<Arc<dyn PluginModule>> + Send + Sync + 'static,
    {
        sync::write(&self.factories).insert(reference.to_string(), Arc::new(factory));
    }

    /// Register one shared module instance for an entry reference.
    pub fn register_module(&self, reference: &str, module: Arc<dyn PluginModule>) {
        self.register(reference, move |_| Ok(module.clone()));
    }

    /// Remove a registration.
    pub fn unregister(&self, reference: &str) -> bool {
        sync::write(&self.factories).remove(reference).is_some()
    }

    /// Whether a reference is registered.
    pub fn contains(&self, reference: &str) -> bool {
        sync::read(&self.factories).contains_key(reference)
    }

    /// Number of load calls served so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModuleLoader for StaticModuleLoader {
    async fn load(&self, manifest: &Manifest) -> Result<Arc<dyn PluginModule>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        // Fetching is a suspension point; concurrent callers see the load in flight.
        tokio::task::yield_now().await;
        let reference = manifest.entry.reference();
        let factory = sync::read(&self.factories).get(reference).cloned();
        let Some(factory) = factory else {
            return Err(Error::Load {
                plugin_id: manifest.id.clone(),
                message: format!("no module registered for entry '{reference}'"),
            });
        };
        debug!(plugin_id = %manifest.id, entry = reference, "module resolved");
        factory(manifest)
    }
}
