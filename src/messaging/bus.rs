//! Event bus.
//!
//! Synchronous publish/subscribe. Handlers run in the emitting task, in
//! priority order, against a snapshot taken at emit time.

use crate::core::error::panic_message;
use crate::core::{now, sync, Result, Timestamp};
use crate::messaging::dispatch::{HandlerId, HandlerList, Registered, Snapshot, DEFAULT_PRIORITY};
use crate::messaging::history::{EventHistory, HistoryEntry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{trace, warn};

/// Name that receives every emitted event.
pub const WILDCARD: &str = "*";

/// Subscription handle returned by `on`.
pub type SubscriptionId = HandlerId;

/// Event handler.
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

/// A delivered event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name
    pub name: String,
    /// Payload; wildcard subscribers get `{event, data}`
    pub data: Value,
    /// Emission time
    pub timestamp: Timestamp,
}

/// Subscription options.
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    /// Run order, lower first
    pub priority: i32,
    /// Remove after the first delivery
    pub once: bool,
    /// Plugin owning the subscription
    pub owner: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            once: false,
            owner: None,
        }
    }
}

impl SubscribeOptions {
    /// Set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Deliver at most once.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Set the owning plugin.
    pub fn owned_by(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }
}

/// Event bus configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Number of emissions kept in history
    pub history_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
        }
    }
}

/// Event bus counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusStats {
    /// Active subscriptions
    pub subscriptions: usize,
    /// Events emitted or broadcast
    pub events_emitted: u64,
    /// Handler invocations that completed
    pub deliveries: u64,
    /// Handler invocations that failed
    pub handler_failures: u64,
    /// Entries currently in history
    pub history_len: usize,
}

#[derive(Clone)]
struct Subscription {
    handler: EventHandler,
    once: bool,
}

/// Publish/subscribe bus shared by the host and plugins.
pub struct EventBus {
    handlers: RwLock<HashMap<String, HandlerList<Subscription>>>,
    history: Mutex<EventHistory>,
    sequence: AtomicU64,
    emitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

impl EventBus {
    /// Create a bus.
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            history: Mutex::new(EventHistory::new(config.history_capacity)),
            sequence: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Subscribe with default options.
    pub fn on<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.on_with(event, SubscribeOptions::default(), handler)
    }

    /// Subscribe for a single delivery.
    pub fn once<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.on_with(event, SubscribeOptions::default().once(), handler)
    }

    /// Subscribe with explicit options.
    pub fn on_with<F>(&self, event: &str, options: SubscribeOptions, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let subscription = Subscription {
            handler: Arc::new(handler),
            once: options.once,
        };
        // Bus-wide sequence keeps ties in registration order across names.
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        sync::write(&self.handlers)
            .entry(event.to_string())
            .or_default()
            .insert_sequenced(seq, options.priority, options.owner.as_deref(), subscription)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = sync::write(&self.handlers);
        let mut removed = false;
        for list in handlers.values_mut() {
            if list.remove(id).is_some() {
                removed = true;
                break;
            }
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    /// Remove every subscription owned by a plugin.
    pub fn remove_owner(&self, owner: &str) -> usize {
        let mut handlers = sync::write(&self.handlers);
        let removed = handlers.values_mut().map(|l| l.remove_owner(owner)).sum();
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    /// Number of subscriptions for an exact event name.
    pub fn listener_count(&self, event: &str) -> usize {
        sync::read(&self.handlers).get(event).map_or(0, |l| l.len())
    }

    /// Emit an event. Returns the number of handlers invoked.
    pub fn emit(&self, event: &str, data: Value) -> usize {
        self.record(event, &data);

        let direct = self.take(event, None);
        let message = Event {
            name: event.to_string(),
            data,
            timestamp: now(),
        };
        let invoked = self.deliver(&direct, &message) + self.deliver_wildcard(&message, None);
        trace!(event, handlers = invoked, "event emitted");
        invoked
    }

    /// Deliver an event across plugin namespaces.
    ///
    /// Reaches subscribers of `event` itself and of every
    /// `plugin:<id>:<event>`, skipping the namespace and subscriptions of
    /// `exclude`. Wildcard subscribers get the wrapped payload as with
    /// `emit`.
    pub fn broadcast(&self, event: &str, data: Value, exclude: Option<&str>) -> usize {
        self.record(event, &data);

        let targets: Vec<String> = sync::read(&self.handlers)
            .keys()
            .filter(|name| name.as_str() == event || namespaced_match(name, event, exclude))
            .cloned()
            .collect();

        let mut snapshot: Option<Snapshot<Subscription>> = None;
        for name in targets {
            let taken = self.take(&name, exclude);
            snapshot = Some(match snapshot {
                Some(acc) => acc.merge(taken),
                None => taken,
            });
        }

        let message = Event {
            name: event.to_string(),
            data,
            timestamp: now(),
        };
        let invoked = snapshot.map_or(0, |s| self.deliver(&s, &message)) + self.deliver_wildcard(&message, exclude);
        trace!(event, handlers = invoked, exclude = ?exclude, "event broadcast");
        invoked
    }

    /// Most recent history entries, newest first.
    pub fn recent_events(&self, count: usize) -> Vec<HistoryEntry> {
        sync::lock(&self.history).recent(count)
    }

    /// Current counters.
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            subscriptions: sync::read(&self.handlers).values().map(|l| l.len()).sum(),
            events_emitted: self.emitted.load(Ordering::Relaxed),
            deliveries: self.delivered.load(Ordering::Relaxed),
            handler_failures: self.failed.load(Ordering::Relaxed),
            history_len: sync::lock(&self.history).len(),
        }
    }

    /// Drop every subscription and the history.
    pub fn clear(&self) {
        sync::write(&self.handlers).clear();
        sync::lock(&self.history).clear();
    }

    fn record(&self, event: &str, data: &Value) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        sync::lock(&self.history).record(event, data);
    }

    /// Snapshot the handlers of one name. Once-subscriptions in the
    /// snapshot are removed before any of them runs.
    fn take(&self, event: &str, exclude: Option<&str>) -> Snapshot<Subscription> {
        let mut handlers = sync::write(&self.handlers);
        let Some(list) = handlers.get_mut(event) else {
            return HandlerList::new().snapshot();
        };
        let mut snapshot = list.snapshot();
        if let Some(excluded) = exclude {
            snapshot.retain(|e| e.owner.as_deref() != Some(excluded));
        }
        let spent: Vec<HandlerId> = snapshot
            .reduce(Vec::new(), |mut ids, e| {
                if e.handler.once {
                    ids.push(e.id);
                }
                ids
            });
        for id in spent {
            list.remove(id);
        }
        if list.is_empty() {
            handlers.remove(event);
        }
        snapshot
    }

    /// Hand `{event, data}` to wildcard subscribers.
    fn deliver_wildcard(&self, message: &Event, exclude: Option<&str>) -> usize {
        if message.name == WILDCARD {
            return 0;
        }
        let wildcard = self.take(WILDCARD, exclude);
        if wildcard.is_empty() {
            return 0;
        }
        let wrapped = Event {
            name: message.name.clone(),
            data: json!({ "event": message.name, "data": message.data }),
            timestamp: message.timestamp,
        };
        self.deliver(&wildcard, &wrapped)
    }

    fn deliver(&self, snapshot: &Snapshot<Subscription>, event: &Event) -> usize {
        snapshot.broadcast(|entry| self.invoke(entry, event))
    }

    fn invoke(&self, entry: &Registered<Subscription>, event: &Event) {
        let handler = &entry.handler.handler;
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(event = %event.name, owner = ?entry.owner, error = %e, "event handler failed");
            }
            Err(payload) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = %event.name,
                    owner = ?entry.owner,
                    panic = %panic_message(payload.as_ref()),
                    "event handler panicked"
                );
            }
        }
    }
}

fn namespaced_match(name: &str, event: &str, exclude: Option<&str>) -> bool {
    let Some(rest) = name.strip_prefix("plugin:") else {
        return false;
    };
    match rest.split_once(':') {
        Some((source, suffix)) => suffix == event && Some(source) != exclude,
        None => false,
    }
}
