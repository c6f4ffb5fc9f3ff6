//! Plugin Sandbox
//!
//! Builds the restricted environment a plugin runs in:
//! - Fail-closed permission check at creation
//! - Namespaced storage and events
//! - Origin-guarded network access
//! - Wrapped timers
//! - Fault boundary with fallback surface
//!
//! Isolation is cooperative. Plugin code shares the host process.

pub mod api;
pub mod boundary;
pub mod network;
pub mod permissions;
pub mod timers;

pub use api::{PluginApi, SharedStorage};
pub use boundary::{FaultBoundary, FaultKind, FaultReport, FaultReporter, Surface};
pub use network::{NetworkGuard, NetworkRequest, NetworkResponse, NetworkTransport, UnavailableTransport};
pub use permissions::{Permission, PermissionSet, PermissionTier};
pub use timers::TimerHandle;

use crate::core::error::panic_message;
use crate::core::{sync, Error, Result};
use crate::manifest::Manifest;
use crate::messaging::{EventBus, HookRegistry};
use crate::plugin::interface::{HostContext, PluginModule, PluginResult};
use api::ApiServices;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Sandbox configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Storage keys one plugin may hold
    pub max_storage_entries: usize,
    /// Remove a plugin's stored data when its component is removed
    pub clear_storage_on_remove: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_storage_entries: 1_000,
            clear_storage_on_remove: false,
        }
    }
}

/// A plugin wrapped in its sandbox.
pub struct PluginComponent {
    manifest: Manifest,
    module: Arc<dyn PluginModule>,
    api: PluginApi,
    boundary: FaultBoundary,
}

impl PluginComponent {
    /// Plugin id.
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Manifest the component was built from.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The plugin's capability surface.
    pub fn api(&self) -> &PluginApi {
        &self.api
    }

    /// Render through the fault boundary.
    pub fn render(&self, props: &Value) -> Surface {
        self.boundary.render(self.module.as_ref(), props)
    }

    /// Clear a tripped boundary and render again.
    pub fn retry(&self, props: &Value) -> Surface {
        self.boundary.reset();
        self.render(props)
    }

    /// Fault that tripped the boundary, if any.
    pub fn fault(&self) -> Option<String> {
        self.boundary.fault()
    }

    /// Run the load callback. Faults are reported, not returned.
    pub async fn invoke_load(&self) -> bool {
        self.invoke_lifecycle("load", self.module.on_load(&self.api)).await
    }

    /// Run the unload callback. Faults are reported, not returned.
    pub async fn invoke_unload(&self) -> bool {
        self.invoke_lifecycle("unload", self.module.on_unload(&self.api)).await
    }

    async fn invoke_lifecycle(&self, phase: &str, call: BoxFuture<'_, PluginResult<()>>) -> bool {
        let message = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => return true,
            Ok(Err(fault)) => fault.message,
            Err(payload) => panic_message(payload.as_ref()),
        };
        warn!(plugin_id = %self.id(), phase, error = %message, "plugin lifecycle callback failed");
        self.api.report_fault(FaultKind::Lifecycle, &message);
        false
    }
}

/// Creates and tracks sandboxed plugin components.
pub struct PluginSandbox {
    config: SandboxConfig,
    bus: Arc<EventBus>,
    hooks: Arc<HookRegistry>,
    storage: Arc<SharedStorage>,
    components: RwLock<HashMap<String, Arc<PluginComponent>>>,
}

impl PluginSandbox {
    /// Create a sandbox over shared messaging.
    pub fn new(config: SandboxConfig, bus: Arc<EventBus>, hooks: Arc<HookRegistry>) -> Self {
        Self {
            config,
            bus,
            hooks,
            storage: Arc::new(SharedStorage::new()),
            components: RwLock::new(HashMap::new()),
        }
    }

    /// Shared plugin storage.
    pub fn storage(&self) -> &Arc<SharedStorage> {
        &self.storage
    }

    /// Wrap a module in a sandboxed component.
    ///
    /// An unrecognised permission rejects creation before any plugin code
    /// runs. A component with the same id replaces the previous one.
    pub fn create_plugin_component(
        &self,
        manifest: &Manifest,
        module: Arc<dyn PluginModule>,
        context: &HostContext,
    ) -> Result<Arc<PluginComponent>> {
        let permissions = PermissionSet::parse(&manifest.permissions).map_err(|unknown| {
            warn!(plugin_id = %manifest.id, unknown = ?unknown, "rejecting plugin with unknown permissions");
            Error::Permission {
                plugin_id: manifest.id.clone(),
                message: format!("unknown permissions: {}", unknown.join(", ")),
            }
        })?;

        let services = ApiServices {
            bus: self.bus.clone(),
            hooks: self.hooks.clone(),
            storage: self.storage.clone(),
            max_storage_entries: self.config.max_storage_entries,
        };
        let network = NetworkGuard::new(
            &manifest.id,
            context.origin.as_deref(),
            &manifest.network_allowlist,
            context.transport.clone(),
        );
        let api = PluginApi::new(
            &manifest.id,
            permissions,
            manifest.settings.clone(),
            context.values.clone(),
            services,
            network,
        );
        let component = Arc::new(PluginComponent {
            manifest: manifest.clone(),
            module,
            api,
            boundary: FaultBoundary::new(FaultReporter::new(&manifest.id, self.bus.clone())),
        });

        let previous = sync::write(&self.components).insert(manifest.id.clone(), component.clone());
        if let Some(previous) = previous {
            previous.api.release();
        }
        debug!(plugin_id = %manifest.id, permissions = manifest.permissions.len(), "sandbox component created");
        Ok(component)
    }

    /// Component by plugin id.
    pub fn component(&self, plugin_id: &str) -> Option<Arc<PluginComponent>> {
        sync::read(&self.components).get(plugin_id).cloned()
    }

    /// Whether a permission string was granted to a plugin at creation.
    pub fn has_permission(&self, plugin_id: &str, permission: &str) -> bool {
        let Some(permission) = Permission::parse(permission) else {
            return false;
        };
        self.component(plugin_id)
            .is_some_and(|c| c.api.has_permission(permission))
    }

    /// Drop a component and its registrations.
    ///
    /// Work the plugin already started is not interrupted; pending timer
    /// callbacks stop firing.
    pub fn remove_plugin_component(&self, plugin_id: &str) -> bool {
        let Some(component) = sync::write(&self.components).remove(plugin_id) else {
            return false;
        };
        let released = component.api.release();
        if self.config.clear_storage_on_remove {
            self.storage.clear_plugin(plugin_id);
        }
        info!(plugin_id, released, "sandbox component removed");
        true
    }

    /// Ids of live components.
    pub fn component_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = sync::read(&self.components).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Find the plugin a fault description refers to.
    ///
    /// Used only for faults reported without an owner. The longest plugin
    /// id found in the text wins.
    pub fn attribute_fault(&self, description: &str) -> Option<String> {
        sync::read(&self.components)
            .keys()
            .filter(|id| description.contains(id.as_str()))
            .max_by_key(|id| id.len())
            .cloned()
    }

    /// Handle a fault the host caught without knowing its owner.
    ///
    /// Returns the plugin it was attributed to, whose boundary now shows
    /// the fallback surface.
    pub fn report_unhandled(&self, description: &str, kind: FaultKind) -> Option<String> {
        let Some(plugin_id) = self.attribute_fault(description) else {
            debug!(description, "unattributed fault ignored");
            return None;
        };
        if let Some(component) = self.component(&plugin_id) {
            component.boundary.trip(kind, description);
        }
        Some(plugin_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::interface::PluginFault;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counter {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl PluginModule for Counter {
        async fn on_load(&self, api: &PluginApi) -> PluginResult<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            api.storage_set("loaded", json!(true))
                .map_err(|e| PluginFault::runtime(&e.to_string()))
        }

        fn render(&self, _props: &Value) -> PluginResult<Value> {
            Ok(json!("counter"))
        }
    }

    struct BrokenLoad;

    #[async_trait]
    impl PluginModule for BrokenLoad {
        async fn on_load(&self, _api: &PluginApi) -> PluginResult<()> {
            Err(PluginFault::runtime("cannot start"))
        }
    }

    fn sandbox() -> PluginSandbox {
        PluginSandbox::new(
            SandboxConfig::default(),
            Arc::new(EventBus::default()),
            Arc::new(HookRegistry::new()),
        )
    }

    #[test]
    fn test_unknown_permission_fails_closed() {
        let sandbox = sandbox();
        let module = Arc::new(Counter::default());
        let manifest = Manifest::new("counter", "Counter", "1.0.0").with_permission("kernel:root");
        let err = sandbox
            .create_plugin_component(&manifest, module.clone(), &HostContext::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Permission { .. }));
        assert!(sandbox.component("counter").is_none());
        assert_eq!(module.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_create_load_and_permissions() {
        let sandbox = sandbox();
        let module = Arc::new(Counter::default());
        let manifest = Manifest::new("counter", "Counter", "1.0.0")
            .with_permission("storage:read")
            .with_permission("storage:write");
        let component = sandbox
            .create_plugin_component(&manifest, module.clone(), &HostContext::default())
            .unwrap();

        assert!(component.invoke_load().await);
        assert_eq!(module.loads.load(Ordering::SeqCst), 1);
        assert_eq!(sandbox.storage().get("plugin:counter:data:loaded"), Some(json!(true)));
        assert!(sandbox.has_permission("counter", "storage:write"));
        assert!(!sandbox.has_permission("counter", "network:fetch"));
        assert!(!sandbox.has_permission("counter", "made-up"));
        assert_eq!(component.render(&Value::Null), Surface::Content(json!("counter")));
    }

    #[tokio::test]
    async fn test_lifecycle_fault_is_contained() {
        let sandbox = sandbox();
        let component = sandbox
            .create_plugin_component(
                &Manifest::new("broken", "Broken", "1.0.0"),
                Arc::new(BrokenLoad),
                &HostContext::default(),
            )
            .unwrap();
        assert!(!component.invoke_load().await);
        assert!(component.invoke_unload().await);
    }

    #[test]
    fn test_remove_component() {
        let sandbox = sandbox();
        let manifest = Manifest::new("counter", "Counter", "1.0.0").with_permission("events:subscribe");
        let component = sandbox
            .create_plugin_component(&manifest, Arc::new(Counter::default()), &HostContext::default())
            .unwrap();
        component.api().on("tick", |_| Ok(())).unwrap();

        assert!(sandbox.remove_plugin_component("counter"));
        assert!(!sandbox.remove_plugin_component("counter"));
        assert!(!sandbox.has_permission("counter", "events:subscribe"));
        assert_eq!(sandbox.bus.stats().subscriptions, 0);
    }

    #[test]
    fn test_unhandled_fault_attribution() {
        let sandbox = sandbox();
        let faults = Arc::new(Mutex::new(Vec::new()));
        let f = faults.clone();
        sandbox.bus.on(crate::messaging::events::PLUGIN_FAULT, move |e| {
            f.lock().unwrap().push(FaultReport::from_event(&e.data).unwrap().plugin_id);
            Ok(())
        });
        for id in ["chart", "chart-pro"] {
            sandbox
                .create_plugin_component(&Manifest::new(id, id, "1.0.0"), Arc::new(Counter::default()), &HostContext::default())
                .unwrap();
        }

        let owner = sandbox.report_unhandled("TypeError at chart-pro/render.js:10", FaultKind::Runtime);
        assert_eq!(owner.as_deref(), Some("chart-pro"));
        assert!(sandbox.component("chart-pro").unwrap().render(&Value::Null).is_fallback());
        assert!(!sandbox.component("chart").unwrap().render(&Value::Null).is_fallback());
        assert_eq!(*faults.lock().unwrap(), vec!["chart-pro"]);

        assert!(sandbox.report_unhandled("something else broke", FaultKind::Runtime).is_none());

        let retried = sandbox.component("chart-pro").unwrap().retry(&Value::Null);
        assert_eq!(retried, Surface::Content(json!("counter")));
    }
}
