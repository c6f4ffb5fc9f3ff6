//! Plugin manager.
//!
//! Owns the lifecycle state machine and the status and loaded-instance maps.
//! Every other component is driven from here; none of them write these maps.
//!
//! Loads of the same id are coalesced: a caller that arrives while a load is
//! in flight waits on that load instead of starting another one.

use crate::core::error::panic_message;
use crate::core::{now, sync, Error, Result, RuntimeConfig};
use crate::manifest::{Manifest, ManifestSource, MenuItemDecl, RouteDecl};
use crate::messaging::{events, EventBus, EventBusConfig, HookRegistry};
use crate::plugin::interface::HostContext;
use crate::plugin::loader::ModuleLoader;
use crate::plugin::state::{LifecycleState, LoadedPlugin, PluginStatusView, RuntimeStatus};
use crate::resolver::DependencyResolver;
use crate::sandbox::{FaultKind, Permission, PluginSandbox, SandboxConfig};
use crate::store::{InMemoryStateStore, PluginState, PluginStateStore, PluginStatusRecord};
use crate::validator::{PluginValidator, ValidatorConfig};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Filter applied to the merged menu contributions.
pub const MENU_ITEMS_FILTER: &str = "menu_items";
/// Filter applied to the merged route contributions.
pub const ROUTES_FILTER: &str = "routes";

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<LoadedPlugin>>>>;

/// Manager configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Try to load optional dependencies before their dependent. One whose
    /// load would wait on a load already in progress is left alone.
    pub load_optional_dependencies: bool,
    /// Reject loads whose dependencies do not satisfy the declared versions
    pub check_dependency_versions: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            load_optional_dependencies: true,
            check_dependency_versions: true,
        }
    }
}

/// Outcome of [`PluginManager::initialize`].
#[derive(Clone, Debug, Default)]
pub struct InitReport {
    /// Plugins loaded, in load order
    pub loaded: Vec<String>,
    /// Plugins that failed, with the reason
    pub failed: Vec<(String, Error)>,
    /// Plugins not enabled, left unloaded
    pub skipped: Vec<String>,
    /// Dependency cycle found among the manifests
    pub cycle: Option<Vec<String>>,
}

impl InitReport {
    /// Whether every enabled plugin loaded.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.cycle.is_none()
    }

    /// Failure recorded for a plugin.
    pub fn error_for(&self, plugin_id: &str) -> Option<&Error> {
        self.failed
            .iter()
            .find(|(id, _)| id == plugin_id)
            .map(|(_, e)| e)
    }
}

/// A menu item together with the plugin that declared it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuContribution {
    /// Declaring plugin
    pub plugin_id: String,
    /// The item
    #[serde(flatten)]
    pub item: MenuItemDecl,
}

/// A route together with the plugin that declared it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteContribution {
    /// Declaring plugin
    pub plugin_id: String,
    /// The route
    #[serde(flatten)]
    pub route: RouteDecl,
}

struct ManagerInner {
    config: ManagerConfig,
    source: Arc<dyn ManifestSource>,
    store: Arc<dyn PluginStateStore>,
    loader: Arc<dyn ModuleLoader>,
    validator: PluginValidator,
    sandbox: Arc<PluginSandbox>,
    bus: Arc<EventBus>,
    hooks: Arc<HookRegistry>,
    context: RwLock<HostContext>,
    manifests: RwLock<Vec<Manifest>>,
    /// Ids added through `install_plugin` rather than discovered
    installed: RwLock<HashSet<String>>,
    status: RwLock<HashMap<String, RuntimeStatus>>,
    loaded: RwLock<HashMap<String, Arc<LoadedPlugin>>>,
    load_order: RwLock<Vec<String>>,
    in_flight: Mutex<HashMap<String, LoadFuture>>,
}

/// Central plugin lifecycle orchestrator.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<ManagerInner>,
}

impl PluginManager {
    /// Start building a manager.
    pub fn builder() -> PluginManagerBuilder {
        PluginManagerBuilder::default()
    }

    /// Discover manifests and load every plugin persisted as enabled.
    ///
    /// A dependency cycle fails its members and whatever depends on them;
    /// unrelated plugins still load. A failed plugin fails its dependents
    /// without being retried for each of them.
    pub async fn initialize(&self, context: HostContext) -> Result<InitReport> {
        *sync::write(&self.inner.context) = context;
        let manifests = self.discover().await?;
        let plan = DependencyResolver::new(&manifests).plan();
        let persisted: HashMap<String, PluginState> = self
            .inner
            .store
            .get_all()
            .await?
            .into_iter()
            .map(|record| (record.plugin_id, record.state))
            .collect();
        let is_enabled = |id: &str| persisted.get(id) == Some(&PluginState::Enabled);

        let mut report = InitReport::default();
        let mut failed: HashMap<String, String> = HashMap::new();

        if let Some(members) = plan.cycle.clone() {
            error!(cycle = ?members, blocked = ?plan.blocked, "circular dependency among plugins");
            let err = Error::CircularDependency { members: members.clone() };
            for id in &plan.blocked {
                if is_enabled(id) {
                    self.record_failure(id, &err).await;
                    failed.insert(id.clone(), err.to_string());
                    report.failed.push((id.clone(), err.clone()));
                } else {
                    self.set_status(id, LifecycleState::Error, Some(err.to_string()));
                    report.skipped.push(id.clone());
                }
            }
            report.cycle = Some(members);
        }

        for id in &plan.order {
            if !is_enabled(id) {
                report.skipped.push(id.clone());
                continue;
            }
            let Some(manifest) = manifests.iter().find(|m| &m.id == id) else {
                continue;
            };
            let failed_dependency = manifest
                .required_dependencies()
                .find_map(|dep| failed.get(&dep.id).map(|reason| (dep.id.clone(), reason.clone())));
            if let Some((dependency, reason)) = failed_dependency {
                let err = Error::DependencyFailed {
                    plugin_id: id.clone(),
                    dependency,
                    reason,
                };
                self.record_failure(id, &err).await;
                failed.insert(id.clone(), err.to_string());
                report.failed.push((id.clone(), err));
                continue;
            }

            match self.load_plugin(id).await {
                Ok(_) => report.loaded.push(id.clone()),
                Err(e) => {
                    failed.insert(id.clone(), e.to_string());
                    report.failed.push((id.clone(), e));
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "plugin manager initialized"
        );
        Ok(report)
    }

    /// Load a plugin and its non-optional dependencies.
    ///
    /// Any failure persists the error state and emits `plugin:error`; every
    /// coalesced caller receives the same error.
    pub async fn load_plugin(&self, plugin_id: &str) -> Result<Arc<LoadedPlugin>> {
        if self.manifest(plugin_id).is_none() {
            return Err(Error::NotFound(plugin_id.to_string()));
        }
        self.load_shared(plugin_id).await
    }

    fn load_shared(&self, plugin_id: &str) -> LoadFuture {
        let mut in_flight = sync::lock(&self.inner.in_flight);
        if let Some(loaded) = sync::read(&self.inner.loaded).get(plugin_id) {
            return futures::future::ready(Ok(loaded.clone())).boxed().shared();
        }
        if let Some(pending) = in_flight.get(plugin_id) {
            debug!(plugin_id, "joining in-flight load");
            return pending.clone();
        }
        let load = self.perform_load(plugin_id.to_string()).shared();
        in_flight.insert(plugin_id.to_string(), load.clone());
        load
    }

    fn perform_load(&self, plugin_id: String) -> BoxFuture<'static, Result<Arc<LoadedPlugin>>> {
        let this = self.clone();
        async move {
            this.set_status(&plugin_id, LifecycleState::Loading, None);
            let outcome = match AssertUnwindSafe(this.try_load(&plugin_id)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => Err(Error::Load {
                    plugin_id: plugin_id.clone(),
                    message: format!("panicked while loading: {}", panic_message(payload.as_ref())),
                }),
            };

            match &outcome {
                Ok(loaded) => {
                    sync::write(&this.inner.loaded).insert(plugin_id.clone(), loaded.clone());
                    {
                        let mut order = sync::write(&this.inner.load_order);
                        order.retain(|id| id != &plugin_id);
                        order.push(plugin_id.clone());
                    }
                    this.set_status(&plugin_id, LifecycleState::Loaded, None);
                    info!(plugin_id = %plugin_id, version = %loaded.manifest.version, "plugin loaded");
                    this.inner.bus.emit(
                        events::PLUGIN_LOADED,
                        json!({ "plugin_id": plugin_id, "version": loaded.manifest.version }),
                    );
                }
                Err(e) => this.record_failure(&plugin_id, e).await,
            }

            sync::lock(&this.inner.in_flight).remove(&plugin_id);
            outcome
        }
        .boxed()
    }

    async fn try_load(&self, plugin_id: &str) -> Result<Arc<LoadedPlugin>> {
        let manifests = self.manifests();
        let manifest = manifests
            .iter()
            .find(|m| m.id == plugin_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(plugin_id.to_string()))?;

        let warnings = self.inner.validator.validate(&manifest).into_result(plugin_id)?;
        for warning in &warnings {
            warn!(plugin_id, warning = %warning, "manifest warning");
        }

        let resolver = DependencyResolver::new(&manifests);
        if let Some(members) = resolver.find_cycle_from(plugin_id) {
            return Err(Error::CircularDependency { members });
        }

        let mut unusable_optional = HashSet::new();
        if self.inner.config.check_dependency_versions {
            for mismatch in resolver.check_versions(plugin_id) {
                let optional = match &mismatch {
                    Error::IncompatibleDependency { dependency, .. }
                        if manifest.optional_dependencies().any(|d| &d.id == dependency) =>
                    {
                        Some(dependency.clone())
                    }
                    _ => None,
                };
                let Some(dependency) = optional else {
                    return Err(mismatch);
                };
                warn!(plugin_id, error = %mismatch, "skipping optional dependency");
                unusable_optional.insert(dependency);
            }
        }

        let known = |id: &str| manifests.iter().any(|m| m.id == id);
        for dep in manifest.required_dependencies() {
            if !known(&dep.id) {
                return Err(Error::MissingDependency {
                    plugin_id: plugin_id.to_string(),
                    dependency: dep.id.clone(),
                });
            }
            if let Err(e) = self.load_shared(&dep.id).await {
                return Err(Error::DependencyFailed {
                    plugin_id: plugin_id.to_string(),
                    dependency: dep.id.clone(),
                    reason: e.to_string(),
                });
            }
        }

        if self.inner.config.load_optional_dependencies {
            for dep in manifest.optional_dependencies() {
                if unusable_optional.contains(&dep.id) || !known(&dep.id) {
                    debug!(plugin_id, dependency = %dep.id, "optional dependency not available");
                    continue;
                }
                if let Some(pending) = self.optional_load_blocker(&resolver, &dep.id) {
                    debug!(
                        plugin_id,
                        dependency = %dep.id,
                        pending = %pending,
                        "optional dependency waits on a load in progress, not loading it"
                    );
                    continue;
                }
                if let Err(e) = self.load_shared(&dep.id).await {
                    warn!(plugin_id, dependency = %dep.id, error = %e, "optional dependency failed to load");
                }
            }
        }

        let module = self.inner.loader.load(&manifest).await.map_err(|e| match e {
            Error::Load { .. } => e,
            other => Error::Load {
                plugin_id: plugin_id.to_string(),
                message: other.to_string(),
            },
        })?;
        let context = sync::read(&self.inner.context).clone();
        let component = self
            .inner
            .sandbox
            .create_plugin_component(&manifest, module, &context)?;

        if let Err(e) = self.inner.store.set_enabled(plugin_id).await {
            self.inner.sandbox.remove_plugin_component(plugin_id);
            return Err(e);
        }
        component.invoke_load().await;

        Ok(Arc::new(LoadedPlugin {
            manifest,
            component,
            loaded_at: now(),
        }))
    }

    /// A load in progress that loading `dependency` would wait on.
    ///
    /// The caller's own load is in flight, so a dependency that requires it
    /// back is reported here instead of deadlocking.
    fn optional_load_blocker(&self, resolver: &DependencyResolver, dependency: &str) -> Option<String> {
        if sync::read(&self.inner.loaded).contains_key(dependency) {
            return None;
        }
        let in_flight = sync::lock(&self.inner.in_flight);
        std::iter::once(dependency.to_string())
            .chain(resolver.get_dependencies_recursive(dependency))
            .find(|id| in_flight.contains_key(id))
    }

    async fn record_failure(&self, plugin_id: &str, err: &Error) {
        let message = err.to_string();
        self.set_status(plugin_id, LifecycleState::Error, Some(message.clone()));
        if let Err(store_err) = self.inner.store.set_error(plugin_id, &message).await {
            warn!(plugin_id, error = %store_err, "could not persist plugin error");
        }
        error!(plugin_id, error = %message, "plugin failed to load");
        self.inner
            .bus
            .emit(events::PLUGIN_ERROR, json!({ "plugin_id": plugin_id, "error": message }));
    }

    /// Unload a plugin. Does nothing if it is not loaded.
    ///
    /// A load in flight is awaited first. Dependents stay loaded.
    pub async fn unload_plugin(&self, plugin_id: &str) -> Result<()> {
        self.unload(plugin_id, true).await
    }

    async fn unload(&self, plugin_id: &str, persist: bool) -> Result<()> {
        let pending = sync::lock(&self.inner.in_flight).get(plugin_id).cloned();
        if let Some(pending) = pending {
            debug!(plugin_id, "waiting for in-flight load before unloading");
            let _ = pending.await;
        }

        let removed = sync::write(&self.inner.loaded).remove(plugin_id);
        let Some(loaded) = removed else {
            debug!(plugin_id, "plugin not loaded, nothing to unload");
            return Ok(());
        };

        self.set_status(plugin_id, LifecycleState::Unloading, None);
        loaded.component.invoke_unload().await;
        let current = self.inner.sandbox.component(plugin_id);
        if current.is_some_and(|c| Arc::ptr_eq(&c, &loaded.component)) {
            self.inner.sandbox.remove_plugin_component(plugin_id);
        }
        sync::write(&self.inner.load_order).retain(|id| id != plugin_id);
        self.set_status(plugin_id, LifecycleState::NotLoaded, None);

        if persist {
            self.inner.store.set_disabled(plugin_id).await?;
        }
        info!(plugin_id, "plugin unloaded");
        self.inner
            .bus
            .emit(events::PLUGIN_UNLOADED, json!({ "plugin_id": plugin_id }));
        Ok(())
    }

    /// Unload and load again, picking up a changed manifest from the source.
    pub async fn reload_plugin(&self, plugin_id: &str) -> Result<Arc<LoadedPlugin>> {
        if self.manifest(plugin_id).is_none() {
            return Err(Error::NotFound(plugin_id.to_string()));
        }
        self.refresh_manifest(plugin_id).await;
        self.restart(plugin_id).await
    }

    async fn restart(&self, plugin_id: &str) -> Result<Arc<LoadedPlugin>> {
        self.unload_plugin(plugin_id).await?;
        self.load_plugin(plugin_id).await
    }

    async fn refresh_manifest(&self, plugin_id: &str) {
        if sync::read(&self.inner.installed).contains(plugin_id) {
            return;
        }
        let discovered = match self.inner.source.discover().await {
            Ok(discovered) => discovered,
            Err(e) => {
                warn!(plugin_id, error = %e, "manifest refresh failed, keeping current manifest");
                return;
            }
        };
        let Some(fresh) = discovered.into_iter().find(|m| m.id == plugin_id) else {
            return;
        };
        let mut manifests = sync::write(&self.inner.manifests);
        if let Some(slot) = manifests.iter_mut().find(|m| m.id == plugin_id) {
            if *slot != fresh {
                debug!(plugin_id, version = %fresh.version, "manifest changed");
                *slot = fresh;
            }
        }
    }

    /// Persist the plugin as enabled and load it.
    pub async fn enable_plugin(&self, plugin_id: &str) -> Result<Arc<LoadedPlugin>> {
        self.load_plugin(plugin_id).await
    }

    /// Unload the plugin and persist it as disabled.
    pub async fn disable_plugin(&self, plugin_id: &str) -> Result<()> {
        if self.manifest(plugin_id).is_none() {
            return Err(Error::NotFound(plugin_id.to_string()));
        }
        self.unload(plugin_id, false).await?;
        self.inner.store.set_disabled(plugin_id).await?;
        self.set_status(plugin_id, LifecycleState::NotLoaded, None);
        Ok(())
    }

    /// Add a plugin to the registry, installed but disabled.
    pub async fn install_plugin(&self, manifest: Manifest) -> Result<()> {
        let warnings = self.inner.validator.validate(&manifest).into_result(&manifest.id)?;
        for warning in &warnings {
            warn!(plugin_id = %manifest.id, warning = %warning, "manifest warning");
        }

        let plugin_id = manifest.id.clone();
        let version = manifest.version.clone();
        {
            let mut manifests = sync::write(&self.inner.manifests);
            if manifests.iter().any(|m| m.id == plugin_id) {
                return Err(Error::DuplicatePlugin(plugin_id));
            }
            manifests.push(manifest);
        }

        if let Err(e) = self.inner.store.set_disabled(&plugin_id).await {
            sync::write(&self.inner.manifests).retain(|m| m.id != plugin_id);
            return Err(e);
        }
        sync::write(&self.inner.installed).insert(plugin_id.clone());
        info!(plugin_id = %plugin_id, version = %version, "plugin installed");
        self.inner.bus.emit(
            events::PLUGIN_INSTALLED,
            json!({ "plugin_id": plugin_id, "version": version }),
        );
        Ok(())
    }

    /// Replace an installed manifest, restarting the plugin if it is loaded.
    pub async fn update_plugin(&self, manifest: Manifest) -> Result<()> {
        let Some(current) = self.manifest(&manifest.id) else {
            return Err(Error::NotFound(manifest.id.clone()));
        };
        let report = self.inner.validator.validate_update(&current, &manifest);
        if !report.is_valid {
            return Err(Error::InvalidUpdate {
                plugin_id: manifest.id.clone(),
                errors: report.errors,
            });
        }
        for warning in &report.warnings {
            warn!(plugin_id = %manifest.id, warning = %warning, "update warning");
        }

        let plugin_id = manifest.id.clone();
        if let Some(slot) = sync::write(&self.inner.manifests)
            .iter_mut()
            .find(|m| m.id == plugin_id)
        {
            *slot = manifest;
        }
        if self.is_loaded(&plugin_id) {
            self.restart(&plugin_id).await?;
        }
        Ok(())
    }

    /// Unload a plugin, drop it from the registry and delete its state.
    ///
    /// A plugin that came from the manifest source reappears at the next
    /// `initialize` unless the source drops it too.
    pub async fn uninstall_plugin(&self, plugin_id: &str) -> Result<()> {
        if self.manifest(plugin_id).is_none() {
            return Err(Error::NotFound(plugin_id.to_string()));
        }
        self.unload(plugin_id, false).await?;
        self.inner.store.delete(plugin_id).await?;

        sync::write(&self.inner.manifests).retain(|m| m.id != plugin_id);
        sync::write(&self.inner.installed).remove(plugin_id);
        sync::write(&self.inner.status).remove(plugin_id);
        let cleared = self.inner.sandbox.storage().clear_plugin(plugin_id);

        info!(plugin_id, cleared, "plugin uninstalled");
        self.inner
            .bus
            .emit(events::PLUGIN_UNINSTALLED, json!({ "plugin_id": plugin_id }));
        Ok(())
    }

    /// Status of one registered plugin.
    pub async fn get_plugin_status(&self, plugin_id: &str) -> Result<PluginStatusView> {
        let manifest = self
            .manifest(plugin_id)
            .ok_or_else(|| Error::NotFound(plugin_id.to_string()))?;
        let record = self.inner.store.get(plugin_id).await?;
        Ok(self.status_view(&manifest, record.as_ref()))
    }

    /// Status of every registered plugin, in registry order.
    pub async fn get_all_plugin_statuses(&self) -> Result<Vec<PluginStatusView>> {
        let records: HashMap<String, PluginStatusRecord> = self
            .inner
            .store
            .get_all()
            .await?
            .into_iter()
            .map(|record| (record.plugin_id.clone(), record))
            .collect();
        Ok(self
            .manifests()
            .iter()
            .map(|m| self.status_view(m, records.get(&m.id)))
            .collect())
    }

    fn status_view(&self, manifest: &Manifest, record: Option<&PluginStatusRecord>) -> PluginStatusView {
        let runtime = sync::read(&self.inner.status)
            .get(&manifest.id)
            .cloned()
            .unwrap_or_default();
        let loaded = self.loaded_plugin(&manifest.id);
        PluginStatusView {
            plugin_id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            state: record.map_or(PluginState::NotInstalled, |r| r.state),
            lifecycle: runtime.state,
            error: runtime.error.or_else(|| record.and_then(|r| r.error.clone())),
            fault: loaded.as_ref().and_then(|l| l.component.fault()),
            loaded_at: loaded.map(|l| l.loaded_at),
            updated_at: record.map(|r| r.updated_at),
        }
    }

    /// Menu items of loaded plugins holding `ui:menu`, ordered and filtered.
    pub fn menu_items(&self) -> Vec<MenuContribution> {
        let mut items = Vec::new();
        for plugin in self.contributors(Permission::UiMenu) {
            for item in &plugin.manifest.menu_items {
                items.push(MenuContribution {
                    plugin_id: plugin.manifest.id.clone(),
                    item: item.clone(),
                });
            }
        }
        items.sort_by_key(|c| c.item.order);
        self.filtered(MENU_ITEMS_FILTER, items)
    }

    /// Routes of loaded plugins holding `ui:routes`, filtered.
    pub fn routes(&self) -> Vec<RouteContribution> {
        let mut routes = Vec::new();
        for plugin in self.contributors(Permission::UiRoutes) {
            for route in &plugin.manifest.routes {
                routes.push(RouteContribution {
                    plugin_id: plugin.manifest.id.clone(),
                    route: route.clone(),
                });
            }
        }
        self.filtered(ROUTES_FILTER, routes)
    }

    fn contributors(&self, permission: Permission) -> Vec<Arc<LoadedPlugin>> {
        let loaded = sync::read(&self.inner.loaded);
        sync::read(&self.inner.load_order)
            .iter()
            .filter_map(|id| loaded.get(id))
            .filter(|plugin| plugin.component.api().has_permission(permission))
            .cloned()
            .collect()
    }

    fn filtered<T: Serialize + DeserializeOwned>(&self, filter: &str, items: Vec<T>) -> Vec<T> {
        if !self.inner.hooks.has_filter(filter) {
            return items;
        }
        let value = match serde_json::to_value(&items) {
            Ok(value) => value,
            Err(e) => {
                warn!(filter, error = %e, "could not serialize contributions");
                return items;
            }
        };
        let filtered = self.inner.hooks.apply_filters(filter, value, &Value::Null);
        match serde_json::from_value(filtered) {
            Ok(items) => items,
            Err(e) => {
                warn!(filter, error = %e, "filter returned an unreadable list, using unfiltered");
                items
            }
        }
    }

    /// Attribute a fault the host caught without an owner.
    pub fn report_unhandled_fault(&self, description: &str) -> Option<String> {
        self.inner.sandbox.report_unhandled(description, FaultKind::Runtime)
    }

    /// Unload every plugin in reverse load order.
    ///
    /// Persisted state is left as it is so the same set loads next time.
    pub async fn shutdown(&self) {
        let order: Vec<String> = sync::read(&self.inner.load_order).iter().rev().cloned().collect();
        self.inner
            .bus
            .emit(events::SYSTEM_SHUTDOWN, json!({ "plugins": order.len() }));
        for plugin_id in &order {
            if let Err(e) = self.unload(plugin_id, false).await {
                warn!(plugin_id = %plugin_id, error = %e, "unload during shutdown failed");
            }
        }
        info!(unloaded = order.len(), "plugin manager shut down");
    }

    async fn discover(&self) -> Result<Vec<Manifest>> {
        let discovered = self.inner.source.discover().await?;
        let mut seen = HashSet::new();
        let mut manifests = Vec::with_capacity(discovered.len());
        for manifest in discovered {
            if seen.insert(manifest.id.clone()) {
                manifests.push(manifest);
            } else {
                warn!(plugin_id = %manifest.id, "duplicate manifest id ignored");
            }
        }
        {
            let installed = sync::read(&self.inner.installed);
            let current = sync::read(&self.inner.manifests);
            manifests.extend(
                current
                    .iter()
                    .filter(|m| installed.contains(&m.id) && !seen.contains(&m.id))
                    .cloned(),
            );
        }
        *sync::write(&self.inner.manifests) = manifests.clone();
        info!(count = manifests.len(), "manifests discovered");
        Ok(manifests)
    }

    fn set_status(&self, plugin_id: &str, state: LifecycleState, error: Option<String>) {
        sync::write(&self.inner.status).insert(plugin_id.to_string(), RuntimeStatus { state, error });
    }

    /// Registered manifest by id.
    pub fn manifest(&self, plugin_id: &str) -> Option<Manifest> {
        sync::read(&self.inner.manifests)
            .iter()
            .find(|m| m.id == plugin_id)
            .cloned()
    }

    /// Every registered manifest.
    pub fn manifests(&self) -> Vec<Manifest> {
        sync::read(&self.inner.manifests).clone()
    }

    /// Loaded instance by id.
    pub fn loaded_plugin(&self, plugin_id: &str) -> Option<Arc<LoadedPlugin>> {
        sync::read(&self.inner.loaded).get(plugin_id).cloned()
    }

    /// Whether a plugin is loaded.
    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        sync::read(&self.inner.loaded).contains_key(plugin_id)
    }

    /// Loaded ids in load order.
    pub fn loaded_ids(&self) -> Vec<String> {
        sync::read(&self.inner.load_order).clone()
    }

    /// In-memory lifecycle state.
    pub fn lifecycle(&self, plugin_id: &str) -> LifecycleState {
        sync::read(&self.inner.status)
            .get(plugin_id)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Shared event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Shared hook registry.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.inner.hooks
    }

    /// The sandbox components are built in.
    pub fn sandbox(&self) -> &Arc<PluginSandbox> {
        &self.inner.sandbox
    }

    /// The state store.
    pub fn store(&self) -> &Arc<dyn PluginStateStore> {
        &self.inner.store
    }
}

/// Builder for [`PluginManager`].
#[derive(Default)]
pub struct PluginManagerBuilder {
    config: ManagerConfig,
    validator: ValidatorConfig,
    sandbox: SandboxConfig,
    events: EventBusConfig,
    source: Option<Arc<dyn ManifestSource>>,
    store: Option<Arc<dyn PluginStateStore>>,
    loader: Option<Arc<dyn ModuleLoader>>,
    bus: Option<Arc<EventBus>>,
    hooks: Option<Arc<HookRegistry>>,
    context: HostContext,
}

impl PluginManagerBuilder {
    /// Manifest source (required).
    pub fn with_source(mut self, source: Arc<dyn ManifestSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// State store. Defaults to an in-memory store.
    pub fn with_store(mut self, store: Arc<dyn PluginStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Module loader (required).
    pub fn with_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Share an existing event bus.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Share an existing hook registry.
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_validator_config(mut self, config: ValidatorConfig) -> Self {
        self.validator = config;
        self
    }

    pub fn with_sandbox_config(mut self, config: SandboxConfig) -> Self {
        self.sandbox = config;
        self
    }

    /// Host context used until `initialize` supplies one.
    pub fn with_context(mut self, context: HostContext) -> Self {
        self.context = context;
        self
    }

    /// Take every component section from a runtime configuration.
    pub fn from_runtime_config(mut self, config: &RuntimeConfig) -> Self {
        self.config = config.manager.clone();
        self.validator = config.validator.clone();
        self.sandbox = config.sandbox.clone();
        self.events = config.events.clone();
        self
    }

    /// Build the manager.
    pub fn build(self) -> Result<PluginManager> {
        let source = self
            .source
            .ok_or_else(|| Error::Config("plugin manager needs a manifest source".to_string()))?;
        let loader = self
            .loader
            .ok_or_else(|| Error::Config("plugin manager needs a module loader".to_string()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStateStore::new()));
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(EventBus::new(self.events)));
        let hooks = self.hooks.unwrap_or_else(|| Arc::new(HookRegistry::new()));
        let sandbox = Arc::new(PluginSandbox::new(self.sandbox, bus.clone(), hooks.clone()));

        Ok(PluginManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                source,
                store,
                loader,
                validator: PluginValidator::new(self.validator),
                sandbox,
                bus,
                hooks,
                context: RwLock::new(self.context),
                manifests: RwLock::new(Vec::new()),
                installed: RwLock::new(HashSet::new()),
                status: RwLock::new(HashMap::new()),
                loaded: RwLock::new(HashMap::new()),
                load_order: RwLock::new(Vec::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{DependencySpec, StaticManifestSource};
    use crate::plugin::interface::{PluginModule, PluginResult};
    use crate::plugin::loader::StaticModuleLoader;
    use crate::sandbox::PluginApi;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct Probe {
        loads: AtomicUsize,
        unloads: AtomicUsize,
    }

    #[async_trait]
    impl PluginModule for Probe {
        async fn on_load(&self, _api: &PluginApi) -> PluginResult<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_unload(&self, _api: &PluginApi) -> PluginResult<()> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        manager: PluginManager,
        source: Arc<StaticManifestSource>,
        store: Arc<InMemoryStateStore>,
        loader: Arc<StaticModuleLoader>,
        probe: Arc<Probe>,
    }

    fn harness(manifests: Vec<Manifest>, enabled: &[&str]) -> Harness {
        let probe = Arc::new(Probe::default());
        let loader = Arc::new(StaticModuleLoader::new());
        for manifest in &manifests {
            loader.register_module(manifest.entry.reference(), probe.clone());
        }
        let store = Arc::new(InMemoryStateStore::with_records(
            enabled
                .iter()
                .map(|id| PluginStatusRecord::new(id, PluginState::Enabled)),
        ));
        let source = Arc::new(StaticManifestSource::new(manifests));
        let manager = PluginManager::builder()
            .with_source(source.clone())
            .with_store(store.clone())
            .with_loader(loader.clone())
            .build()
            .unwrap();
        Harness {
            manager,
            source,
            store,
            loader,
            probe,
        }
    }

    fn plugin(id: &str) -> Manifest {
        Manifest::new(id, id, "1.0.0")
    }

    fn requires(id: &str, deps: &[&str]) -> Manifest {
        deps.iter()
            .fold(plugin(id), |m, dep| m.with_dependency(DependencySpec::required(dep)))
    }

    fn collect(bus: &EventBus, event: &str) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on(event, move |e| {
            let id = e.data["plugin_id"].as_str().unwrap_or_default().to_string();
            sink.lock().unwrap().push(id);
            Ok(())
        });
        seen
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = PluginManager::builder().build().err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        let err = PluginManager::builder()
            .with_source(Arc::new(StaticManifestSource::new(Vec::new())))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ref m) if m.contains("loader")));
    }

    #[tokio::test]
    async fn test_initialize_loads_enabled_in_dependency_order() {
        let h = harness(
            vec![
                requires("gamma", &["beta"]),
                requires("beta", &["alpha"]),
                plugin("alpha"),
                plugin("delta"),
            ],
            &["alpha", "beta", "gamma"],
        );
        let loaded = collect(h.manager.bus(), events::PLUGIN_LOADED);

        let report = assert_ok!(h.manager.initialize(HostContext::default()).await);
        assert!(report.is_clean());
        assert_eq!(report.loaded, vec!["alpha", "beta", "gamma"]);
        assert_eq!(report.skipped, vec!["delta"]);
        assert_eq!(*loaded.lock().unwrap(), vec!["alpha", "beta", "gamma"]);
        assert_eq!(h.manager.loaded_ids(), vec!["alpha", "beta", "gamma"]);
        assert_eq!(h.probe.loads.load(Ordering::SeqCst), 3);
        assert_eq!(h.manager.lifecycle("delta"), LifecycleState::NotLoaded);
    }

    #[tokio::test]
    async fn test_concurrent_loads_are_coalesced() {
        let h = harness(vec![plugin("alpha")], &[]);
        h.manager.initialize(HostContext::default()).await.unwrap();

        let (first, second) = tokio::join!(
            h.manager.load_plugin("alpha"),
            h.manager.load_plugin("alpha")
        );
        let first = first.unwrap();
        let second = second.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(h.loader.load_count(), 1);
        assert_eq!(h.probe.loads.load(Ordering::SeqCst), 1);

        h.manager.load_plugin("alpha").await.unwrap();
        assert_eq!(h.loader.load_count(), 1);
        assert_eq!(h.store.state_of("alpha").await.unwrap(), PluginState::Enabled);
    }

    #[tokio::test]
    async fn test_coalesced_failure_reaches_every_caller() {
        let h = harness(vec![plugin("alpha")], &[]);
        h.manager.initialize(HostContext::default()).await.unwrap();
        h.loader.unregister("alpha");
        let errors = collect(h.manager.bus(), events::PLUGIN_ERROR);

        let (first, second) = tokio::join!(
            h.manager.load_plugin("alpha"),
            h.manager.load_plugin("alpha")
        );
        let first = first.err().unwrap();
        assert!(matches!(first, Error::Load { .. }));
        assert_eq!(Some(first), second.err());
        assert_eq!(h.loader.load_count(), 1);
        assert_eq!(*errors.lock().unwrap(), vec!["alpha"]);
        assert_eq!(h.store.state_of("alpha").await.unwrap(), PluginState::Error);
    }

    #[tokio::test]
    async fn test_unload_of_unloaded_plugin_is_noop() {
        let h = harness(vec![plugin("alpha")], &[]);
        h.manager.initialize(HostContext::default()).await.unwrap();
        let unloaded = collect(h.manager.bus(), events::PLUGIN_UNLOADED);

        assert_ok!(h.manager.unload_plugin("alpha").await);
        assert_ok!(h.manager.unload_plugin("ghost").await);
        assert!(h.store.get("alpha").await.unwrap().is_none());
        assert!(unloaded.lock().unwrap().is_empty());
        assert_eq!(h.probe.unloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unload_releases_and_persists_disabled() {
        let h = harness(vec![plugin("alpha").with_permission("events:subscribe")], &["alpha"]);
        h.manager.initialize(HostContext::default()).await.unwrap();
        let loaded = h.manager.loaded_plugin("alpha").unwrap();
        loaded.component.api().on("tick", |_| Ok(())).unwrap();
        let unloaded = collect(h.manager.bus(), events::PLUGIN_UNLOADED);

        h.manager.unload_plugin("alpha").await.unwrap();
        assert!(!h.manager.is_loaded("alpha"));
        assert!(h.manager.sandbox().component("alpha").is_none());
        assert_eq!(h.manager.bus().listener_count("plugin:alpha:tick"), 0);
        assert_eq!(h.probe.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.state_of("alpha").await.unwrap(), PluginState::Disabled);
        assert_eq!(*unloaded.lock().unwrap(), vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_missing_dependency_fails_the_dependent() {
        let h = harness(vec![requires("gamma", &["beta"])], &[]);
        h.manager.initialize(HostContext::default()).await.unwrap();
        let errors = collect(h.manager.bus(), events::PLUGIN_ERROR);

        let err = assert_err!(h.manager.enable_plugin("gamma").await);
        assert_eq!(
            err,
            Error::MissingDependency {
                plugin_id: "gamma".to_string(),
                dependency: "beta".to_string(),
            }
        );
        assert_eq!(h.store.state_of("gamma").await.unwrap(), PluginState::Error);
        assert_eq!(h.manager.lifecycle("gamma"), LifecycleState::Error);
        assert_eq!(*errors.lock().unwrap(), vec!["gamma"]);

        let status = h.manager.get_plugin_status("gamma").await.unwrap();
        assert!(status.is_error());
        assert!(status.error.unwrap().contains("beta"));
        assert_eq!(h.loader.load_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_dependents() {
        let h = harness(
            vec![plugin("alpha"), requires("beta", &["alpha"]), plugin("delta")],
            &["alpha", "beta", "delta"],
        );
        h.loader.unregister("alpha");

        let report = h.manager.initialize(HostContext::default()).await.unwrap();
        assert_eq!(report.loaded, vec!["delta"]);
        assert!(matches!(report.error_for("alpha"), Some(Error::Load { .. })));
        assert!(matches!(
            report.error_for("beta"),
            Some(Error::DependencyFailed { dependency, .. }) if dependency == "alpha"
        ));
        assert_eq!(h.store.state_of("beta").await.unwrap(), PluginState::Error);
        assert_eq!(h.store.state_of("delta").await.unwrap(), PluginState::Enabled);
        assert_eq!(h.loader.load_count(), 2);
    }

    #[tokio::test]
    async fn test_cycle_fails_members_only() {
        let h = harness(
            vec![
                requires("alpha", &["beta"]),
                requires("beta", &["alpha"]),
                requires("gamma", &["alpha"]),
                plugin("delta"),
            ],
            &["alpha", "beta", "gamma", "delta"],
        );

        let report = h.manager.initialize(HostContext::default()).await.unwrap();
        assert!(!report.is_clean());
        let cycle = report.cycle.clone().unwrap();
        assert!(cycle.contains(&"alpha".to_string()) && cycle.contains(&"beta".to_string()));
        assert_eq!(report.loaded, vec!["delta"]);
        for id in ["alpha", "beta", "gamma"] {
            assert!(matches!(report.error_for(id), Some(Error::CircularDependency { .. })));
            assert_eq!(h.store.state_of(id).await.unwrap(), PluginState::Error);
        }

        let err = h.manager.load_plugin("alpha").await.err().unwrap();
        assert!(matches!(err, Error::CircularDependency { .. }));
    }

    #[tokio::test]
    async fn test_dependency_version_mismatch() {
        let h = harness(
            vec![
                plugin("alpha"),
                plugin("beta").with_dependency(DependencySpec::required("alpha").with_version("^2.0.0")),
                plugin("gamma").with_dependency(DependencySpec::optional("alpha").with_version("^3.0.0")),
            ],
            &[],
        );
        h.manager.initialize(HostContext::default()).await.unwrap();

        let err = h.manager.load_plugin("beta").await.err().unwrap();
        assert!(matches!(err, Error::IncompatibleDependency { ref required, .. } if required == "^2.0.0"));

        h.manager.load_plugin("gamma").await.unwrap();
        assert!(!h.manager.is_loaded("alpha"));
    }

    #[tokio::test]
    async fn test_optional_dependencies() {
        let h = harness(
            vec![
                plugin("alpha"),
                plugin("gamma")
                    .with_dependency(DependencySpec::optional("alpha"))
                    .with_dependency(DependencySpec::optional("omega")),
            ],
            &["gamma"],
        );
        let report = h.manager.initialize(HostContext::default()).await.unwrap();
        assert_eq!(report.loaded, vec!["gamma"]);
        assert!(h.manager.is_loaded("alpha"));
        assert_eq!(h.manager.loaded_ids(), vec!["alpha", "gamma"]);
    }

    #[tokio::test]
    async fn test_optional_back_edge_loads_without_waiting() {
        let h = harness(
            vec![
                plugin("alpha").with_dependency(DependencySpec::optional("beta")),
                requires("beta", &["alpha"]),
            ],
            &[],
        );
        h.manager.initialize(HostContext::default()).await.unwrap();

        let loaded = tokio::time::timeout(Duration::from_secs(3), h.manager.load_plugin("alpha"))
            .await
            .expect("load of alpha did not settle");
        assert_ok!(loaded);
        assert!(!h.manager.is_loaded("beta"));

        assert_ok!(h.manager.load_plugin("beta").await);
        assert_eq!(h.manager.loaded_ids(), vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_initialize_with_optional_back_edge() {
        let h = harness(
            vec![
                plugin("alpha").with_dependency(DependencySpec::optional("beta")),
                requires("beta", &["alpha"]),
            ],
            &["alpha", "beta"],
        );
        let report = tokio::time::timeout(
            Duration::from_secs(3),
            h.manager.initialize(HostContext::default()),
        )
        .await
        .expect("initialize did not settle")
        .unwrap();
        assert!(report.is_clean());
        assert_eq!(report.loaded, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_mutual_optional_dependencies() {
        let h = harness(
            vec![
                plugin("alpha").with_dependency(DependencySpec::optional("beta")),
                plugin("beta").with_dependency(DependencySpec::optional("alpha")),
            ],
            &[],
        );
        h.manager.initialize(HostContext::default()).await.unwrap();

        let loaded = tokio::time::timeout(Duration::from_secs(3), h.manager.load_plugin("alpha"))
            .await
            .expect("load of alpha did not settle");
        assert_ok!(loaded);
        assert_eq!(h.manager.loaded_ids(), vec!["beta", "alpha"]);
    }

    #[tokio::test]
    async fn test_concurrent_loads_through_optional_dependency() {
        let h = harness(
            vec![
                plugin("alpha"),
                plugin("gamma").with_dependency(DependencySpec::optional("alpha")),
            ],
            &[],
        );
        h.manager.initialize(HostContext::default()).await.unwrap();

        let (a, g) = tokio::join!(h.manager.load_plugin("alpha"), h.manager.load_plugin("gamma"));
        assert_ok!(a);
        assert_ok!(g);
        assert_eq!(h.loader.load_count(), 2);
        assert!(h.manager.is_loaded("alpha"));
    }

    #[tokio::test]
    async fn test_unknown_plugin() {
        let h = harness(vec![], &[]);
        h.manager.initialize(HostContext::default()).await.unwrap();
        let err = h.manager.load_plugin("ghost").await.err().unwrap();
        assert_eq!(err, Error::NotFound("ghost".to_string()));
        assert!(h.store.get("ghost").await.unwrap().is_none());
        assert!(h.manager.disable_plugin("ghost").await.is_err());
        assert!(h.manager.get_plugin_status("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_install_enable_disable_uninstall() {
        let h = harness(vec![], &[]);
        h.manager.initialize(HostContext::default()).await.unwrap();
        h.loader.register_module("epsilon", h.probe.clone());
        let installed = collect(h.manager.bus(), events::PLUGIN_INSTALLED);

        let invalid = h.manager.install_plugin(plugin("x")).await.err().unwrap();
        assert!(matches!(invalid, Error::Validation { .. }));

        h.manager
            .install_plugin(plugin("epsilon").with_permission("storage:write"))
            .await
            .unwrap();
        assert_eq!(h.store.state_of("epsilon").await.unwrap(), PluginState::Disabled);
        assert_eq!(*installed.lock().unwrap(), vec!["epsilon"]);
        let dup = h.manager.install_plugin(plugin("epsilon")).await.err().unwrap();
        assert_eq!(dup, Error::DuplicatePlugin("epsilon".to_string()));

        let loaded = h.manager.enable_plugin("epsilon").await.unwrap();
        loaded.component.api().storage_set("draft", json!("hi")).unwrap();
        assert_eq!(h.store.state_of("epsilon").await.unwrap(), PluginState::Enabled);

        h.manager.disable_plugin("epsilon").await.unwrap();
        assert!(!h.manager.is_loaded("epsilon"));
        assert_eq!(h.store.state_of("epsilon").await.unwrap(), PluginState::Disabled);

        h.manager.uninstall_plugin("epsilon").await.unwrap();
        assert!(h.manager.manifest("epsilon").is_none());
        assert!(h.store.get("epsilon").await.unwrap().is_none());
        assert!(h.manager.sandbox().storage().is_empty());

        h.manager.initialize(HostContext::default()).await.unwrap();
        assert!(h.manager.manifest("epsilon").is_none());
    }

    #[tokio::test]
    async fn test_installed_plugin_survives_rediscovery() {
        let h = harness(vec![plugin("alpha")], &[]);
        h.manager.initialize(HostContext::default()).await.unwrap();
        h.manager.install_plugin(plugin("epsilon")).await.unwrap();
        h.manager.initialize(HostContext::default()).await.unwrap();
        let ids: Vec<String> = h.manager.manifests().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["alpha", "epsilon"]);
    }

    #[tokio::test]
    async fn test_reload_picks_up_changed_manifest() {
        let h = harness(vec![plugin("alpha")], &["alpha"]);
        h.manager.initialize(HostContext::default()).await.unwrap();
        h.source.upsert(Manifest::new("alpha", "alpha", "1.1.0"));

        let reloaded = h.manager.reload_plugin("alpha").await.unwrap();
        assert_eq!(reloaded.manifest.version, "1.1.0");
        assert_eq!(h.loader.load_count(), 2);
        assert_eq!(h.probe.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.state_of("alpha").await.unwrap(), PluginState::Enabled);
    }

    #[tokio::test]
    async fn test_update_restarts_loaded_plugin() {
        let h = harness(vec![plugin("alpha")], &["alpha"]);
        h.manager.initialize(HostContext::default()).await.unwrap();

        h.manager
            .update_plugin(Manifest::new("alpha", "alpha", "2.0.0"))
            .await
            .unwrap();
        assert_eq!(h.manager.loaded_plugin("alpha").unwrap().manifest.version, "2.0.0");
        assert_eq!(h.loader.load_count(), 2);

        let err = h.manager.update_plugin(plugin("omega")).await.err().unwrap();
        assert_eq!(err, Error::NotFound("omega".to_string()));
    }

    #[tokio::test]
    async fn test_statuses() {
        let h = harness(vec![plugin("alpha"), plugin("beta")], &["alpha"]);
        h.manager.initialize(HostContext::default()).await.unwrap();

        let statuses = h.manager.get_all_plugin_statuses().await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].plugin_id, "alpha");
        assert_eq!(statuses[0].state, PluginState::Enabled);
        assert_eq!(statuses[0].lifecycle, LifecycleState::Loaded);
        assert!(statuses[0].loaded_at.is_some());
        assert_eq!(statuses[1].state, PluginState::NotInstalled);
        assert_eq!(statuses[1].lifecycle, LifecycleState::NotLoaded);
        assert!(!statuses[1].is_error());
    }

    #[tokio::test]
    async fn test_menu_items_and_routes() {
        let h = harness(
            vec![
                plugin("alpha")
                    .with_permission("ui:menu")
                    .with_permission("ui:routes")
                    .with_menu_item(MenuItemDecl::new("alpha-home", "Alpha").with_order(2))
                    .with_route(RouteDecl::new("/alpha", "Alpha")),
                plugin("beta")
                    .with_permission("ui:menu")
                    .with_menu_item(MenuItemDecl::new("beta-home", "Beta").with_order(1))
                    .with_menu_item(MenuItemDecl::new("beta-hidden", "Hidden").with_order(3)),
                plugin("gamma")
                    .with_menu_item(MenuItemDecl::new("gamma-home", "Gamma"))
                    .with_route(RouteDecl::new("/gamma", "Gamma")),
            ],
            &["alpha", "beta", "gamma"],
        );
        h.manager.initialize(HostContext::default()).await.unwrap();

        let ids: Vec<String> = h.manager.menu_items().into_iter().map(|c| c.item.id).collect();
        assert_eq!(ids, vec!["beta-home", "alpha-home", "beta-hidden"]);

        h.manager.hooks().add_filter(MENU_ITEMS_FILTER, 10, None, |value, _| {
            let kept: Vec<Value> = value
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|item| item["label"] != "Hidden")
                .collect();
            Ok(Value::Array(kept))
        });
        let items = h.manager.menu_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].plugin_id, "beta");

        let routes = h.manager.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].route.path, "/alpha");
    }

    #[tokio::test]
    async fn test_shutdown_keeps_persisted_state() {
        let h = harness(vec![plugin("alpha"), requires("beta", &["alpha"])], &["alpha", "beta"]);
        h.manager.initialize(HostContext::default()).await.unwrap();
        let unloaded = collect(h.manager.bus(), events::PLUGIN_UNLOADED);

        h.manager.shutdown().await;
        assert!(h.manager.loaded_ids().is_empty());
        assert_eq!(*unloaded.lock().unwrap(), vec!["beta", "alpha"]);
        assert_eq!(h.store.state_of("alpha").await.unwrap(), PluginState::Enabled);
        assert_eq!(h.store.state_of("beta").await.unwrap(), PluginState::Enabled);
        assert_eq!(h.manager.bus().recent_events(3)[2].event, events::SYSTEM_SHUTDOWN);
    }

    #[tokio::test]
    async fn test_unhandled_fault_trips_owner_boundary() {
        let h = harness(vec![plugin("alpha"), plugin("alpha-pro")], &["alpha", "alpha-pro"]);
        h.manager.initialize(HostContext::default()).await.unwrap();

        let owner = h.manager.report_unhandled_fault("ReferenceError in alpha-pro/view");
        assert_eq!(owner.as_deref(), Some("alpha-pro"));
        let status = h.manager.get_plugin_status("alpha-pro").await.unwrap();
        assert!(status.fault.is_some());
        assert!(h.manager.get_plugin_status("alpha").await.unwrap().fault.is_none());
    }
}
