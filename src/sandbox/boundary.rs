//! Fault boundary around plugin rendering.
//!
//! Faults are tagged with the owning plugin id at the point they are
//! caught and published on the bus as `plugin:fault`.

use crate::core::error::panic_message;
use crate::core::{now, sync, Timestamp};
use crate::messaging::{events, EventBus};
use crate::plugin::interface::PluginModule;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Class of a plugin fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    /// Failure while running plugin code
    Runtime,
    /// Plugin code could not be parsed or compiled
    Parse,
    /// Use of a capability that was not granted
    Permission,
    /// Failed network access
    Network,
    /// Failure inside a load or unload callback
    Lifecycle,
    /// Failure inside a timer callback
    Timer,
}

impl FaultKind {
    /// Whether reloading the same code is pointless.
    pub fn is_parse_class(self) -> bool {
        matches!(self, FaultKind::Parse)
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FaultKind::Runtime => "runtime",
            FaultKind::Parse => "parse",
            FaultKind::Permission => "permission",
            FaultKind::Network => "network",
            FaultKind::Lifecycle => "lifecycle",
            FaultKind::Timer => "timer",
        };
        f.write_str(name)
    }
}

/// A fault attributed to a plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    /// Owning plugin
    pub plugin_id: String,
    /// Fault class
    pub kind: FaultKind,
    /// Fault message
    pub message: String,
    /// When it was caught
    pub at: Timestamp,
}

impl FaultReport {
    /// Create a report stamped now.
    pub fn new(plugin_id: &str, kind: FaultKind, message: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            kind,
            message: message.to_string(),
            at: now(),
        }
    }

    /// Recover a report from a `plugin:fault` payload.
    pub fn from_event(data: &Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }
}

/// Publishes faults for one plugin.
#[derive(Clone)]
pub struct FaultReporter {
    plugin_id: String,
    bus: Arc<EventBus>,
}

impl FaultReporter {
    /// Create a reporter tagged with a plugin id.
    pub fn new(plugin_id: &str, bus: Arc<EventBus>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            bus,
        }
    }

    /// Owning plugin id.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Log and publish a fault.
    pub fn report(&self, kind: FaultKind, message: &str) -> FaultReport {
        let report = FaultReport::new(&self.plugin_id, kind, message);
        error!(plugin_id = %report.plugin_id, kind = %report.kind, message = %report.message, "plugin fault");
        match serde_json::to_value(&report) {
            Ok(data) => {
                self.bus.emit(events::PLUGIN_FAULT, data);
            }
            Err(e) => error!(plugin_id = %report.plugin_id, error = %e, "could not publish fault"),
        }
        report
    }
}

/// What the host should display for a plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Surface {
    /// Plugin output
    Content(Value),
    /// Replacement shown after a fault
    Fallback {
        /// Failed plugin
        plugin_id: String,
        /// Fault message
        message: String,
        /// Whether the host should offer a retry
        retry: bool,
    },
}

impl Surface {
    /// Whether this is the fallback surface.
    pub fn is_fallback(&self) -> bool {
        matches!(self, Surface::Fallback { .. })
    }
}

/// Render wrapper that switches to a fallback after a fault.
pub struct FaultBoundary {
    reporter: FaultReporter,
    tripped: Mutex<Option<String>>,
}

impl FaultBoundary {
    /// Create a boundary.
    pub fn new(reporter: FaultReporter) -> Self {
        Self {
            reporter,
            tripped: Mutex::new(None),
        }
    }

    /// Render through the boundary.
    pub fn render(&self, module: &dyn PluginModule, props: &Value) -> Surface {
        if let Some(message) = sync::lock(&self.tripped).clone() {
            return self.fallback(message);
        }
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| module.render(props)));
        match outcome {
            Ok(Ok(content)) => Surface::Content(content),
            Ok(Err(fault)) => self.trip(fault.kind, &fault.message),
            Err(payload) => self.trip(FaultKind::Runtime, &panic_message(payload.as_ref())),
        }
    }

    /// Switch to the fallback for a fault caught elsewhere.
    pub fn trip(&self, kind: FaultKind, message: &str) -> Surface {
        *sync::lock(&self.tripped) = Some(message.to_string());
        self.reporter.report(kind, message);
        self.fallback(message.to_string())
    }

    /// Clear the fault so the next render tries the plugin again.
    pub fn reset(&self) {
        if sync::lock(&self.tripped).take().is_some() {
            info!(plugin_id = %self.reporter.plugin_id(), "fault boundary reset");
        }
    }

    /// Message of the fault that tripped the boundary.
    pub fn fault(&self) -> Option<String> {
        sync::lock(&self.tripped).clone()
    }

    fn fallback(&self, message: String) -> Surface {
        Surface::Fallback {
            plugin_id: self.reporter.plugin_id().to_string(),
            message,
            retry: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::interface::{PluginFault, PluginResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flaky {
        broken: AtomicBool,
    }

    #[async_trait]
    impl PluginModule for Flaky {
        fn render(&self, props: &Value) -> PluginResult<Value> {
            if self.broken.load(Ordering::SeqCst) {
                Err(PluginFault::runtime("widget exploded"))
            } else {
                Ok(json!({ "echo": props }))
            }
        }
    }

    struct Panicky;

    #[async_trait]
    impl PluginModule for Panicky {
        fn render(&self, _props: &Value) -> PluginResult<Value> {
            panic!("index out of bounds")
        }
    }

    fn boundary(bus: &Arc<EventBus>, id: &str) -> FaultBoundary {
        FaultBoundary::new(FaultReporter::new(id, bus.clone()))
    }

    #[test]
    fn test_render_fault_shows_fallback_until_reset() {
        let bus = Arc::new(EventBus::default());
        let faults = Arc::new(Mutex::new(Vec::new()));
        let f = faults.clone();
        bus.on(events::PLUGIN_FAULT, move |e| {
            f.lock().unwrap().push(FaultReport::from_event(&e.data).unwrap());
            Ok(())
        });

        let module = Flaky { broken: AtomicBool::new(true) };
        let b = boundary(&bus, "clock");

        let surface = b.render(&module, &json!(1));
        assert_eq!(
            surface,
            Surface::Fallback {
                plugin_id: "clock".to_string(),
                message: "widget exploded".to_string(),
                retry: true
            }
        );
        module.broken.store(false, Ordering::SeqCst);
        assert!(b.render(&module, &json!(1)).is_fallback());

        b.reset();
        assert_eq!(b.render(&module, &json!(1)), Surface::Content(json!({"echo": 1})));

        let faults = faults.lock().unwrap();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].plugin_id, "clock");
        assert_eq!(faults[0].kind, FaultKind::Runtime);
    }

    #[test]
    fn test_panicking_render_is_contained() {
        let bus = Arc::new(EventBus::default());
        let b = boundary(&bus, "panicky");
        match b.render(&Panicky, &Value::Null) {
            Surface::Fallback { message, .. } => assert!(message.contains("index out of bounds")),
            other => panic!("expected fallback, got {other:?}"),
        }
        assert_eq!(b.fault().as_deref(), Some("index out of bounds"));
    }

    #[test]
    fn test_parse_class() {
        assert!(FaultKind::Parse.is_parse_class());
        assert!(!FaultKind::Runtime.is_parse_class());
    }
}
