//! Monitoring Module
//!
//! Provides observability for the runtime:
//! - Structured logging setup

pub mod logging;

pub use logging::{init_logging, LogFormat, LogLevel, LoggingConfig};
