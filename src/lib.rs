//! # Plugin Runtime
//!
//! Orchestrates independently authored plugins inside a host application:
//! - **Manifests**: static descriptors, versions and where they come from
//! - **Resolver**: deterministic load order and cycle detection
//! - **Validator**: well-formedness and policy checks
//! - **Sandbox**: permission-checked capability surface per plugin
//! - **Messaging**: event bus plus action and filter hooks
//! - **Manager**: lifecycle state machine with coalesced loads
//! - **Hot reload**: change detection and bounded-retry reload
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use plugin_runtime::manifest::{Manifest, StaticManifestSource};
//! use plugin_runtime::plugin::{HostContext, PluginManager, PluginModule, StaticModuleLoader};
//! use std::sync::Arc;
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl PluginModule for Hello {}
//!
//! #[tokio::main]
//! async fn main() -> plugin_runtime::Result<()> {
//!     let loader = Arc::new(StaticModuleLoader::new());
//!     loader.register_module("hello", Arc::new(Hello));
//!
//!     let manager = PluginManager::builder()
//!         .with_source(Arc::new(StaticManifestSource::new(vec![Manifest::new("hello", "Hello", "1.0.0")])))
//!         .with_loader(loader)
//!         .build()?;
//!     manager.initialize(HostContext::new("https://app.example.com")).await?;
//!     manager.enable_plugin("hello").await?;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod manifest;
pub mod messaging;
pub mod monitoring;
pub mod plugin;
pub mod reload;
pub mod resolver;
pub mod sandbox;
pub mod store;
pub mod validator;

pub use core::error::{Error, Result};
pub use core::RuntimeConfig;
pub use plugin::{PluginManager, PluginModule};
