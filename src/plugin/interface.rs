//! Plugin interface definition.
//!
//! Defines the contract a plugin module implements and the host context the
//! sandbox is built with.

use crate::sandbox::api::PluginApi;
use crate::sandbox::boundary::FaultKind;
use crate::sandbox::network::{NetworkTransport, UnavailableTransport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Fault raised by plugin code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginFault {
    /// Fault message
    pub message: String,
    /// Fault class
    pub kind: FaultKind,
}

impl PluginFault {
    /// Runtime fault.
    pub fn runtime(message: &str) -> Self {
        Self {
            message: message.to_string(),
            kind: FaultKind::Runtime,
        }
    }

    /// Parse or syntax fault.
    pub fn parse(message: &str) -> Self {
        Self {
            message: message.to_string(),
            kind: FaultKind::Parse,
        }
    }
}

impl std::fmt::Display for PluginFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} fault: {}", self.kind, self.message)
    }
}

impl std::error::Error for PluginFault {}

/// Result type for plugin callbacks.
pub type PluginResult<T> = std::result::Result<T, PluginFault>;

/// A loaded plugin module.
///
/// Every method has a no-op default; a module implements only what it
/// needs.
#[async_trait]
pub trait PluginModule: Send + Sync {
    /// Called once after the sandboxed component is built.
    async fn on_load(&self, _api: &PluginApi) -> PluginResult<()> {
        Ok(())
    }

    /// Called before the component is released.
    async fn on_unload(&self, _api: &PluginApi) -> PluginResult<()> {
        Ok(())
    }

    /// Produce the plugin's rendered surface.
    fn render(&self, _props: &Value) -> PluginResult<Value> {
        Ok(Value::Null)
    }
}

/// Host-side context shared by every sandboxed component.
#[derive(Clone)]
pub struct HostContext {
    /// Origin plugins may always reach, such as `https://app.example.com`
    pub origin: Option<String>,
    /// Transport used for permitted requests
    pub transport: Arc<dyn NetworkTransport>,
    /// Free-form host values exposed to plugins read-only
    pub values: HashMap<String, Value>,
}

impl Default for HostContext {
    fn default() -> Self {
        Self {
            origin: None,
            transport: Arc::new(UnavailableTransport),
            values: HashMap::new(),
        }
    }
}

impl HostContext {
    /// Create a context for a host origin.
    pub fn new(origin: &str) -> Self {
        Self {
            origin: Some(origin.to_string()),
            ..Self::default()
        }
    }

    /// Set the transport.
    pub fn with_transport(mut self, transport: Arc<dyn NetworkTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Add a host value.
    pub fn with_value(mut self, key: &str, value: Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("origin", &self.origin)
            .field("values", &self.values)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Blank;

    #[async_trait]
    impl PluginModule for Blank {}

    #[test]
    fn test_default_render_is_null() {
        assert_eq!(Blank.render(&Value::Null), Ok(Value::Null));
    }

    #[test]
    fn test_fault_display() {
        assert_eq!(PluginFault::parse("unexpected token").to_string(), "parse fault: unexpected token");
    }

    #[test]
    fn test_host_context_builder() {
        let ctx = HostContext::new("https://app.example.com").with_value("theme", Value::from("dark"));
        assert_eq!(ctx.origin.as_deref(), Some("https://app.example.com"));
        assert_eq!(ctx.values["theme"], "dark");
    }
}
