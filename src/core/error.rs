//! Error types for the plugin runtime.

use thiserror::Error;

/// Result type alias for plugin runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in plugin runtime operations.
///
/// The enum is `Clone` so that a single coalesced load can hand the same
/// failure to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Manifest errors
    #[error("Validation failed for plugin '{plugin_id}': {}", errors.join("; "))]
    Validation {
        plugin_id: String,
        errors: Vec<String>,
    },

    #[error("Plugin update rejected for '{plugin_id}': {}", errors.join("; "))]
    InvalidUpdate {
        plugin_id: String,
        errors: Vec<String>,
    },

    #[error("Duplicate plugin id: {0}")]
    DuplicatePlugin(String),

    // Dependency errors
    #[error("Circular dependency detected among: {}", members.join(", "))]
    CircularDependency { members: Vec<String> },

    #[error("Plugin '{plugin_id}' requires missing dependency '{dependency}'")]
    MissingDependency {
        plugin_id: String,
        dependency: String,
    },

    #[error("Plugin '{plugin_id}' requires '{dependency}' {required}, found {available}")]
    IncompatibleDependency {
        plugin_id: String,
        dependency: String,
        required: String,
        available: String,
    },

    #[error("Plugin '{plugin_id}' failed because dependency '{dependency}' failed: {reason}")]
    DependencyFailed {
        plugin_id: String,
        dependency: String,
        reason: String,
    },

    // Sandbox errors
    #[error("Permission error for plugin '{plugin_id}': {message}")]
    Permission { plugin_id: String, message: String },

    #[error("Access denied for plugin '{plugin_id}': {message}")]
    AccessDenied { plugin_id: String, message: String },

    #[error("Runtime fault in plugin '{plugin_id}': {message}")]
    RuntimeFault { plugin_id: String, message: String },

    // Lifecycle errors
    #[error("Failed to load plugin '{plugin_id}': {message}")]
    Load { plugin_id: String, message: String },

    #[error("Hot reload of '{plugin_id}' exhausted after {attempts} attempts: {last_error}")]
    ReloadExhausted {
        plugin_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Plugin not found: {0}")]
    NotFound(String),

    // Collaborator errors
    #[error("State store error: {0}")]
    Store(String),

    #[error("Manifest source error: {0}")]
    Source(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Id of the plugin the error is attributed to, if any.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Error::Validation { plugin_id, .. }
            | Error::InvalidUpdate { plugin_id, .. }
            | Error::MissingDependency { plugin_id, .. }
            | Error::IncompatibleDependency { plugin_id, .. }
            | Error::DependencyFailed { plugin_id, .. }
            | Error::Permission { plugin_id, .. }
            | Error::AccessDenied { plugin_id, .. }
            | Error::RuntimeFault { plugin_id, .. }
            | Error::Load { plugin_id, .. }
            | Error::ReloadExhausted { plugin_id, .. } => Some(plugin_id),
            Error::DuplicatePlugin(id) | Error::NotFound(id) => Some(id),
            _ => None,
        }
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
