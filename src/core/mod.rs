//! Core utilities and common types for the plugin runtime.

pub mod config;
pub mod error;
pub(crate) mod sync;
pub mod types;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use types::*;
