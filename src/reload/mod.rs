//! Hot Reload Module
//!
//! Detects changed plugin packages and reloads them through the manager:
//! - Fingerprints (version, content hash, modification time)
//! - Polling monitor with bounded retry
//! - Fault-triggered reload with suppression

pub mod fingerprint;
pub mod monitor;

pub use fingerprint::{Fingerprint, FingerprintSource};
pub use monitor::{HotReloadConfig, HotReloadMonitor, ReloadOutcome};
