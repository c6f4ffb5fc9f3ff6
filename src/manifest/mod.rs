//! Manifest Module
//!
//! Plugin descriptors and where they come from:
//! - Manifest data model
//! - Version parsing and compatibility
//! - Manifest sources

pub mod source;
pub mod types;
pub mod version;

pub use source::{DirectoryManifestSource, ManifestSource, StaticManifestSource};
pub use types::{
    DependencySpec, EntryPoint, Manifest, MenuItemDecl, RouteDecl, SettingDecl, SettingKind,
    SettingOption,
};
