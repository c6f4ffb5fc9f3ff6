//! Hot reload monitor.
//!
//! Polls fingerprints of watched plugins and reloads them through the
//! manager when they change. Reloads retry with a fixed delay; running out
//! of attempts is reported once and ends monitoring of that plugin.

use crate::core::{sync, Error, Result};
use crate::messaging::{events, SubscriptionId};
use crate::plugin::{LoadedPlugin, PluginManager};
use crate::reload::fingerprint::{Fingerprint, FingerprintSource};
use crate::sandbox::FaultReport;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Hot reload configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    /// Monitoring on at start
    pub enabled: bool,
    /// Poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Reload attempts before giving up
    pub max_retries: u32,
    /// Delay between attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Reload on an attributed fault
    pub reload_on_fault: bool,
    /// Faults within the window after which fault reloads stop
    pub fault_threshold: usize,
    /// Fault counting window in milliseconds
    pub fault_window_ms: u64,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 2_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            reload_on_fault: true,
            fault_threshold: 3,
            fault_window_ms: 60_000,
        }
    }
}

impl HotReloadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn fault_window(&self) -> Duration {
        Duration::from_millis(self.fault_window_ms)
    }
}

/// Result of one check or fault-triggered reload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Nothing changed
    Unchanged,
    /// No reload was attempted
    Skipped(String),
    /// Reloaded on the given attempt
    Reloaded { attempts: u32 },
    /// Every attempt failed
    Exhausted { attempts: u32, last_error: String },
}

#[derive(Default)]
struct Watch {
    refs: usize,
    task: Option<JoinHandle<()>>,
}

struct MonitorInner {
    config: HotReloadConfig,
    manager: PluginManager,
    fingerprints: Arc<dyn FingerprintSource>,
    enabled: AtomicBool,
    disabled: RwLock<HashSet<String>>,
    watches: Mutex<HashMap<String, Watch>>,
    baselines: Mutex<HashMap<String, Fingerprint>>,
    faults: Mutex<HashMap<String, VecDeque<Instant>>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

/// Watches plugins and reloads them when they change.
#[derive(Clone)]
pub struct HotReloadMonitor {
    inner: Arc<MonitorInner>,
}

impl HotReloadMonitor {
    /// Create a monitor driving `manager`.
    pub fn new(config: HotReloadConfig, manager: PluginManager, fingerprints: Arc<dyn FingerprintSource>) -> Self {
        let enabled = AtomicBool::new(config.enabled);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                manager,
                fingerprints,
                enabled,
                disabled: RwLock::new(HashSet::new()),
                watches: Mutex::new(HashMap::new()),
                baselines: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Reload on `plugin:fault` and stop on `system:shutdown`.
    pub fn attach(&self) {
        let bus = self.inner.manager.bus();
        let weak = Arc::downgrade(&self.inner);
        let on_fault = bus.on(events::PLUGIN_FAULT, move |event| {
            let Some(report) = FaultReport::from_event(&event.data) else {
                return Err(Error::Internal("malformed fault event".to_string()));
            };
            let Some(monitor) = upgrade(&weak) else {
                return Ok(());
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        monitor.handle_fault(&report).await;
                    });
                }
                Err(_) => warn!(plugin_id = %report.plugin_id, "no runtime to reload faulted plugin"),
            }
            Ok(())
        });

        let weak = Arc::downgrade(&self.inner);
        let on_shutdown = bus.on(events::SYSTEM_SHUTDOWN, move |_| {
            if let Some(monitor) = upgrade(&weak) {
                monitor.stop();
            }
            Ok(())
        });
        sync::lock(&self.inner.subscriptions).extend([on_fault, on_shutdown]);
    }

    /// Remove the bus subscriptions made by [`attach`](Self::attach).
    pub fn detach(&self) {
        let ids: Vec<SubscriptionId> = sync::lock(&self.inner.subscriptions).drain(..).collect();
        for id in ids {
            self.inner.manager.bus().off(id);
        }
    }

    /// Watch every loaded plugin.
    pub async fn start(&self) {
        for plugin_id in self.inner.manager.loaded_ids() {
            self.watch(&plugin_id).await;
        }
    }

    /// Stop every poll task.
    pub fn stop(&self) {
        let watches: Vec<Watch> = sync::lock(&self.inner.watches).drain().map(|(_, w)| w).collect();
        for task in watches.into_iter().filter_map(|w| w.task) {
            task.abort();
        }
        info!("hot reload monitoring stopped");
    }

    /// Start watching a plugin. Calls are counted per id.
    pub async fn watch(&self, plugin_id: &str) {
        let first = {
            let mut watches = sync::lock(&self.inner.watches);
            let watch = watches.entry(plugin_id.to_string()).or_default();
            watch.refs += 1;
            watch.refs == 1
        };
        if !first {
            return;
        }

        self.record_baseline(plugin_id).await;
        let task = tokio::spawn(self.clone().poll(plugin_id.to_string()));
        let mut watches = sync::lock(&self.inner.watches);
        match watches.get_mut(plugin_id) {
            Some(watch) => watch.task = Some(task),
            None => task.abort(),
        }
        debug!(plugin_id, "watching plugin");
    }

    /// Drop one watch reference. Returns whether the id was watched.
    pub fn unwatch(&self, plugin_id: &str) -> bool {
        let mut watches = sync::lock(&self.inner.watches);
        let Some(watch) = watches.get_mut(plugin_id) else {
            return false;
        };
        watch.refs -= 1;
        if watch.refs == 0 {
            if let Some(task) = watches.remove(plugin_id).and_then(|w| w.task) {
                task.abort();
            }
            debug!(plugin_id, "stopped watching plugin");
        }
        true
    }

    /// Whether a poll task exists for the id.
    pub fn is_watching(&self, plugin_id: &str) -> bool {
        sync::lock(&self.inner.watches).contains_key(plugin_id)
    }

    /// Watch references held for the id.
    pub fn watch_count(&self, plugin_id: &str) -> usize {
        sync::lock(&self.inner.watches)
            .get(plugin_id)
            .map_or(0, |w| w.refs)
    }

    /// Turn monitoring on or off for every plugin.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "hot reload toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Resume monitoring one plugin.
    pub fn enable_for(&self, plugin_id: &str) {
        sync::write(&self.inner.disabled).remove(plugin_id);
    }

    /// Pause monitoring one plugin.
    pub fn disable_for(&self, plugin_id: &str) {
        sync::write(&self.inner.disabled).insert(plugin_id.to_string());
    }

    /// Whether changes and faults of the plugin are acted on.
    pub fn is_monitoring(&self, plugin_id: &str) -> bool {
        self.is_enabled() && !sync::read(&self.inner.disabled).contains(plugin_id)
    }

    async fn poll(self, plugin_id: String) {
        let period = self.inner.config.poll_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !self.is_monitoring(&plugin_id) {
                continue;
            }
            match self.check_now(&plugin_id).await {
                Ok(ReloadOutcome::Exhausted { .. }) => break,
                Ok(_) => {}
                Err(e) => warn!(plugin_id = %plugin_id, error = %e, "fingerprint check failed"),
            }
        }
    }

    async fn record_baseline(&self, plugin_id: &str) {
        match self.inner.fingerprints.fingerprint(plugin_id).await {
            Ok(Some(fingerprint)) => {
                sync::lock(&self.inner.baselines).insert(plugin_id.to_string(), fingerprint);
            }
            Ok(None) => debug!(plugin_id, "no fingerprint yet"),
            Err(e) => warn!(plugin_id, error = %e, "could not fingerprint plugin"),
        }
    }

    /// Compare the fingerprint with the last one seen and reload on change.
    pub async fn check_now(&self, plugin_id: &str) -> Result<ReloadOutcome> {
        let Some(current) = self.inner.fingerprints.fingerprint(plugin_id).await? else {
            return Ok(ReloadOutcome::Skipped("plugin package is gone".to_string()));
        };
        let previous = sync::lock(&self.inner.baselines).insert(plugin_id.to_string(), current.clone());
        match previous {
            None => return Ok(ReloadOutcome::Unchanged),
            Some(previous) if previous == current => return Ok(ReloadOutcome::Unchanged),
            Some(previous) => {
                info!(plugin_id, from = %previous.version, to = %current.version, "plugin changed");
            }
        }

        if !self.inner.manager.is_loaded(plugin_id) {
            return Ok(ReloadOutcome::Skipped("plugin is not loaded".to_string()));
        }
        Ok(self.reload_outcome(plugin_id).await)
    }

    /// React to a fault attributed to a plugin.
    ///
    /// Parse faults never trigger a reload. Neither does a fault past the
    /// threshold within the window.
    pub async fn handle_fault(&self, report: &FaultReport) -> ReloadOutcome {
        let plugin_id = report.plugin_id.as_str();
        if !self.inner.config.reload_on_fault || !self.is_monitoring(plugin_id) {
            return ReloadOutcome::Skipped("monitoring is off".to_string());
        }
        if report.kind.is_parse_class() {
            debug!(plugin_id, kind = %report.kind, "parse fault, not reloading");
            return ReloadOutcome::Skipped("parse fault".to_string());
        }

        let recent = {
            let window = self.inner.config.fault_window();
            let now = Instant::now();
            let mut faults = sync::lock(&self.inner.faults);
            let times = faults.entry(plugin_id.to_string()).or_default();
            while times.front().is_some_and(|t| now.duration_since(*t) > window) {
                times.pop_front();
            }
            times.push_back(now);
            times.len()
        };
        if recent > self.inner.config.fault_threshold {
            warn!(plugin_id, recent, "too many recent faults, not reloading");
            return ReloadOutcome::Skipped("fault threshold exceeded".to_string());
        }

        if !self.inner.manager.is_loaded(plugin_id) {
            return ReloadOutcome::Skipped("plugin is not loaded".to_string());
        }
        info!(plugin_id, kind = %report.kind, "reloading after fault");
        self.reload_outcome(plugin_id).await
    }

    async fn reload_outcome(&self, plugin_id: &str) -> ReloadOutcome {
        match self.reload_with_retry(plugin_id).await {
            Ok((_, attempts)) => ReloadOutcome::Reloaded { attempts },
            Err(Error::ReloadExhausted {
                attempts, last_error, ..
            }) => ReloadOutcome::Exhausted { attempts, last_error },
            Err(e) => ReloadOutcome::Exhausted {
                attempts: 0,
                last_error: e.to_string(),
            },
        }
    }

    /// Reload through the manager, retrying with a fixed delay.
    ///
    /// Every failed attempt emits `plugin:reload-failed`. When attempts run
    /// out `plugin:reload-exhausted` is emitted and the plugin is no longer
    /// watched.
    pub async fn reload_with_retry(&self, plugin_id: &str) -> Result<(Arc<LoadedPlugin>, u32)> {
        let max_attempts = self.inner.config.max_retries.max(1);
        let bus = self.inner.manager.bus();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.inner.manager.reload_plugin(plugin_id).await {
                Ok(loaded) => {
                    info!(plugin_id, attempt, "plugin reloaded");
                    bus.emit(
                        events::PLUGIN_RELOADED,
                        json!({ "plugin_id": plugin_id, "attempts": attempt }),
                    );
                    return Ok((loaded, attempt));
                }
                Err(e) => {
                    warn!(plugin_id, attempt, max_attempts, error = %e, "reload attempt failed");
                    last_error = e.to_string();
                    bus.emit(
                        events::PLUGIN_RELOAD_FAILED,
                        json!({ "plugin_id": plugin_id, "attempt": attempt, "error": last_error }),
                    );
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.inner.config.retry_delay()).await;
            }
        }

        error!(plugin_id, attempts = max_attempts, error = %last_error, "reload attempts exhausted");
        bus.emit(
            events::PLUGIN_RELOAD_EXHAUSTED,
            json!({ "plugin_id": plugin_id, "attempts": max_attempts, "error": last_error }),
        );
        if let Some(task) = sync::lock(&self.inner.watches)
            .remove(plugin_id)
            .and_then(|w| w.task)
        {
            task.abort();
        }
        Err(Error::ReloadExhausted {
            plugin_id: plugin_id.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}

fn upgrade(weak: &Weak<MonitorInner>) -> Option<HotReloadMonitor> {
    weak.upgrade().map(|inner| HotReloadMonitor { inner })
}
