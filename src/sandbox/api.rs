//! Capability surface handed to plugin code.
//!
//! Every call is checked against the permissions granted when the
//! component was created. Storage keys and event names are namespaced by
//! plugin id so plugins cannot see each other's state.

use crate::core::error::panic_message;
use crate::core::{sync, Error, Result};
use crate::manifest::SettingDecl;
use crate::messaging::{
    ActionOutcome, Event, EventBus, HookId, HookRegistry, SubscribeOptions, SubscriptionId, WILDCARD,
};
use crate::sandbox::boundary::{FaultKind, FaultReporter};
use crate::sandbox::network::{NetworkGuard, NetworkRequest, NetworkResponse};
use crate::sandbox::permissions::{Permission, PermissionSet};
use crate::sandbox::timers::{PluginTimers, TimerHandle};
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Key-value storage shared by every plugin, partitioned by key prefix.
#[derive(Default)]
pub struct SharedStorage {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl SharedStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespaced key for a plugin.
    pub fn scoped_key(plugin_id: &str, key: &str) -> String {
        format!("plugin:{plugin_id}:{key}")
    }

    /// Key of a plugin's own storage entry.
    pub fn data_key(plugin_id: &str, key: &str) -> String {
        format!("plugin:{plugin_id}:data:{key}")
    }

    /// Key of a stored setting value. Never produced by `data_key`.
    pub fn setting_key(plugin_id: &str, key: &str) -> String {
        format!("plugin:{plugin_id}:settings:{key}")
    }

    /// Read a raw key.
    pub fn get(&self, key: &str) -> Option<Value> {
        sync::read(&self.entries).get(key).cloned()
    }

    fn insert(&self, key: String, value: Value) {
        sync::write(&self.entries).insert(key, value);
    }

    fn remove(&self, key: &str) -> bool {
        sync::write(&self.entries).remove(key).is_some()
    }

    /// Keys under a prefix, with the prefix stripped.
    fn keys_under(&self, prefix: &str) -> Vec<String> {
        sync::read(&self.entries)
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    }

    /// Delete every key of a plugin.
    pub fn clear_plugin(&self, plugin_id: &str) -> usize {
        let prefix = Self::scoped_key(plugin_id, "");
        let mut entries = sync::write(&self.entries);
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(&prefix));
        before - entries.len()
    }

    /// Total number of stored keys.
    pub fn len(&self) -> usize {
        sync::read(&self.entries).len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        sync::read(&self.entries).is_empty()
    }
}

/// Shared collaborators a `PluginApi` is built from.
#[derive(Clone)]
pub(crate) struct ApiServices {
    pub bus: Arc<EventBus>,
    pub hooks: Arc<HookRegistry>,
    pub storage: Arc<SharedStorage>,
    pub max_storage_entries: usize,
}

/// The restricted API a plugin sees.
pub struct PluginApi {
    plugin_id: String,
    permissions: PermissionSet,
    settings: Vec<SettingDecl>,
    host_values: HashMap<String, Value>,
    services: ApiServices,
    network: NetworkGuard,
    timers: PluginTimers,
    reporter: FaultReporter,
}

impl PluginApi {
    pub(crate) fn new(
        plugin_id: &str,
        permissions: PermissionSet,
        settings: Vec<SettingDecl>,
        host_values: HashMap<String, Value>,
        services: ApiServices,
        network: NetworkGuard,
    ) -> Self {
        let reporter = FaultReporter::new(plugin_id, services.bus.clone());
        Self {
            plugin_id: plugin_id.to_string(),
            permissions,
            settings,
            host_values,
            timers: PluginTimers::new(reporter.clone()),
            services,
            network,
            reporter,
        }
    }

    /// Owning plugin id.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Whether a permission was granted.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(permission)
    }

    /// Granted permissions.
    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    /// A host-provided value.
    pub fn host_value(&self, key: &str) -> Option<&Value> {
        self.host_values.get(key)
    }

    fn require(&self, permission: Permission) -> Result<()> {
        if self.permissions.contains(permission) {
            Ok(())
        } else {
            Err(Error::Permission {
                plugin_id: self.plugin_id.clone(),
                message: format!("permission '{permission}' was not granted"),
            })
        }
    }

    fn event_name(&self, name: &str) -> String {
        format!("plugin:{}:{}", self.plugin_id, name)
    }

    // ----- storage -----

    /// Read a stored value.
    pub fn storage_get(&self, key: &str) -> Result<Option<Value>> {
        self.require(Permission::StorageRead)?;
        Ok(self
            .services
            .storage
            .get(&SharedStorage::data_key(&self.plugin_id, key)))
    }

    /// Store a value.
    pub fn storage_set(&self, key: &str, value: Value) -> Result<()> {
        self.require(Permission::StorageWrite)?;
        let scoped = SharedStorage::data_key(&self.plugin_id, key);
        let storage = &self.services.storage;
        if storage.get(&scoped).is_none() && self.storage_keys_unchecked().len() >= self.services.max_storage_entries {
            return Err(Error::AccessDenied {
                plugin_id: self.plugin_id.clone(),
                message: format!(
                    "storage quota of {} entries reached",
                    self.services.max_storage_entries
                ),
            });
        }
        storage.insert(scoped, value);
        Ok(())
    }

    /// Delete a stored value.
    pub fn storage_remove(&self, key: &str) -> Result<bool> {
        self.require(Permission::StorageWrite)?;
        Ok(self
            .services
            .storage
            .remove(&SharedStorage::data_key(&self.plugin_id, key)))
    }

    /// This plugin's storage keys.
    pub fn storage_keys(&self) -> Result<Vec<String>> {
        self.require(Permission::StorageRead)?;
        Ok(self.storage_keys_unchecked())
    }

    fn storage_keys_unchecked(&self) -> Vec<String> {
        self.services
            .storage
            .keys_under(&SharedStorage::data_key(&self.plugin_id, ""))
    }

    // ----- settings -----

    /// Current value of a declared setting, falling back to its default.
    pub fn setting(&self, key: &str) -> Result<Option<Value>> {
        self.require(Permission::SettingsRead)?;
        let decl = self.setting_decl(key)?;
        let stored = self
            .services
            .storage
            .get(&SharedStorage::setting_key(&self.plugin_id, key));
        Ok(stored.or_else(|| decl.default.clone()))
    }

    /// Change a declared setting.
    pub fn set_setting(&self, key: &str, value: Value) -> Result<()> {
        self.require(Permission::SettingsWrite)?;
        let decl = self.setting_decl(key)?;
        if decl.kind.needs_options() {
            let allowed = |v: &Value| decl.options.iter().any(|o| v.as_str() == Some(o.value.as_str()));
            let ok = match &value {
                Value::Array(items) => items.iter().all(allowed),
                other => allowed(other),
            };
            if !ok {
                return Err(Error::Validation {
                    plugin_id: self.plugin_id.clone(),
                    errors: vec![format!("value for setting '{key}' is not one of its options")],
                });
            }
        }
        self.services
            .storage
            .insert(SharedStorage::setting_key(&self.plugin_id, key), value);
        Ok(())
    }

    fn setting_decl(&self, key: &str) -> Result<&SettingDecl> {
        self.settings
            .iter()
            .find(|s| s.key == key)
            .ok_or_else(|| Error::NotFound(format!("setting '{key}' of plugin '{}'", self.plugin_id)))
    }

    // ----- events -----

    /// Emit `plugin:<id>:<name>`.
    pub fn emit(&self, name: &str, data: Value) -> Result<usize> {
        self.require(Permission::EventsEmit)?;
        Ok(self.services.bus.emit(&self.event_name(name), data))
    }

    /// Subscribe to `plugin:<id>:<name>`.
    pub fn on<F>(&self, name: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(&self.event_name(name), false, handler)
    }

    /// Subscribe to `plugin:<id>:<name>` for one delivery.
    pub fn once<F>(&self, name: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(&self.event_name(name), true, handler)
    }

    /// Subscribe to a runtime event such as `plugin:loaded`.
    ///
    /// Another plugin's namespace and the wildcard are refused; those
    /// events are only reachable through `send_to` and `broadcast`.
    pub fn on_host_event<F>(&self, event: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        if let Some(owner) = foreign_namespace(event, &self.plugin_id) {
            return Err(Error::AccessDenied {
                plugin_id: self.plugin_id.clone(),
                message: format!("cannot subscribe to '{event}' in the namespace of '{owner}'"),
            });
        }
        self.subscribe(event, false, handler)
    }

    /// Remove one of this plugin's subscriptions.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.services.bus.off(id)
    }

    fn subscribe<F>(&self, event: &str, once: bool, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.require(Permission::EventsSubscribe)?;
        let mut options = SubscribeOptions::default().owned_by(&self.plugin_id);
        if once {
            options = options.once();
        }
        let reporter = self.reporter.clone();
        Ok(self.services.bus.on_with(event, options, move |e| {
            guard_sync(&reporter, FaultKind::Runtime, || handler(e))
        }))
    }

    /// Send an event into another plugin's namespace.
    pub fn send_to(&self, target: &str, name: &str, data: Value) -> Result<usize> {
        self.require(Permission::Messaging)?;
        Ok(self.services.bus.emit(&format!("plugin:{target}:{name}"), data))
    }

    /// Broadcast to every other plugin's `name` subscribers.
    pub fn broadcast(&self, name: &str, data: Value) -> Result<usize> {
        self.require(Permission::Messaging)?;
        Ok(self.services.bus.broadcast(name, data, Some(&self.plugin_id)))
    }

    // ----- hooks -----

    /// Register an action callback owned by this plugin.
    pub fn add_action<F, Fut>(&self, name: &str, priority: i32, handler: F) -> Result<HookId>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.require(Permission::HooksAction)?;
        let reporter = self.reporter.clone();
        let handler = Arc::new(handler);
        Ok(self.services.hooks.add_action(name, priority, Some(&self.plugin_id), move |args| {
            let reporter = reporter.clone();
            let handler = handler.clone();
            async move {
                let outcome = AssertUnwindSafe(async move { handler(args).await })
                    .catch_unwind()
                    .await;
                settle(&reporter, FaultKind::Runtime, outcome)
            }
        }))
    }

    /// Register a filter owned by this plugin.
    pub fn add_filter<F>(&self, name: &str, priority: i32, handler: F) -> Result<HookId>
    where
        F: Fn(Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.require(Permission::HooksFilter)?;
        let reporter = self.reporter.clone();
        Ok(self.services.hooks.add_filter(name, priority, Some(&self.plugin_id), move |value, args| {
            guard_sync(&reporter, FaultKind::Runtime, || handler(value, args))
        }))
    }

    /// Run an action.
    pub async fn do_action(&self, name: &str, args: Value) -> Result<ActionOutcome> {
        self.require(Permission::HooksAction)?;
        Ok(self.services.hooks.do_action(name, args).await)
    }

    /// Apply filters to a value.
    pub fn apply_filters(&self, name: &str, value: Value, args: &Value) -> Result<Value> {
        self.require(Permission::HooksFilter)?;
        Ok(self.services.hooks.apply_filters(name, value, args))
    }

    // ----- network -----

    /// Perform a request through the origin guard.
    pub async fn fetch(&self, request: NetworkRequest) -> Result<NetworkResponse> {
        self.require(Permission::NetworkFetch)?;
        self.network.fetch(request).await
    }

    // ----- timers -----

    /// Run a callback once after `delay`.
    pub fn set_timeout<F, Fut>(&self, delay: Duration, callback: F) -> Result<TimerHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.require(Permission::Timers)?;
        Ok(self.timers.set_timeout(delay, callback))
    }

    /// Run a callback every `period`.
    pub fn set_interval<F, Fut>(&self, period: Duration, callback: F) -> Result<TimerHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.require(Permission::Timers)?;
        Ok(self.timers.set_interval(period, callback))
    }

    // ----- faults -----

    /// Report a fault the plugin caught itself.
    pub fn report_fault(&self, kind: FaultKind, message: &str) {
        self.reporter.report(kind, message);
    }

    /// Stop timers and drop this plugin's subscriptions and hooks.
    pub(crate) fn release(&self) -> usize {
        self.timers.deactivate();
        self.services.bus.remove_owner(&self.plugin_id) + self.services.hooks.remove_plugin_hooks(&self.plugin_id)
    }
}

/// Owner of `event` when it is private to a plugin other than `caller`.
fn foreign_namespace<'a>(event: &'a str, caller: &str) -> Option<&'a str> {
    if event == WILDCARD {
        return Some(WILDCARD);
    }
    let (owner, _) = event.strip_prefix("plugin:")?.split_once(':')?;
    (owner != caller).then_some(owner)
}

/// Run a synchronous plugin callback, tagging any fault with its owner.
fn guard_sync<T, F>(reporter: &FaultReporter, kind: FaultKind, call: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    settle(reporter, kind, std::panic::catch_unwind(AssertUnwindSafe(call)))
}

fn settle<T>(
    reporter: &FaultReporter,
    kind: FaultKind,
    outcome: std::result::Result<Result<T>, Box<dyn std::any::Any + Send>>,
) -> Result<T> {
    let message = match outcome {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };
    reporter.report(kind, &message);
    Err(Error::RuntimeFault {
        plugin_id: reporter.plugin_id().to_string(),
        message,
    })
}
