//! Messaging Module
//!
//! Host and plugin communication:
//! - Ordered handler lists shared by every dispatcher
//! - Event bus with history, wildcard and cross-namespace broadcast
//! - Action and filter hooks

pub mod bus;
pub mod dispatch;
pub mod history;
pub mod hooks;

pub use bus::{Event, EventBus, EventBusConfig, EventBusStats, EventHandler, SubscribeOptions, SubscriptionId, WILDCARD};
pub use dispatch::{HandlerId, HandlerList, DEFAULT_PRIORITY};
pub use history::{EventHistory, EventKind, HistoryEntry};
pub use hooks::{ActionOutcome, HookId, HookRegistry};

/// Lifecycle event names emitted by the runtime.
pub mod events {
    /// A plugin finished loading
    pub const PLUGIN_LOADED: &str = "plugin:loaded";
    /// A plugin was unloaded
    pub const PLUGIN_UNLOADED: &str = "plugin:unloaded";
    /// A plugin failed to load
    pub const PLUGIN_ERROR: &str = "plugin:error";
    /// A plugin was installed
    pub const PLUGIN_INSTALLED: &str = "plugin:installed";
    /// A plugin was uninstalled
    pub const PLUGIN_UNINSTALLED: &str = "plugin:uninstalled";
    /// A fault was attributed to a plugin
    pub const PLUGIN_FAULT: &str = "plugin:fault";
    /// A plugin was reloaded after a change
    pub const PLUGIN_RELOADED: &str = "plugin:reloaded";
    /// One reload attempt failed
    pub const PLUGIN_RELOAD_FAILED: &str = "plugin:reload-failed";
    /// Every reload attempt failed
    pub const PLUGIN_RELOAD_EXHAUSTED: &str = "plugin:reload-exhausted";
    /// The manager is shutting down
    pub const SYSTEM_SHUTDOWN: &str = "system:shutdown";
}
