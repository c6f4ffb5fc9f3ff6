//! Plugin Module
//!
//! Plugin lifecycle orchestration:
//! - Plugin module contract
//! - Module loading
//! - Lifecycle state and status views
//! - The plugin manager

pub mod interface;
pub mod loader;
pub mod manager;
pub mod state;

pub use interface::{HostContext, PluginFault, PluginModule, PluginResult};
pub use loader::{ModuleFactory, ModuleLoader, StaticModuleLoader};
pub use manager::{
    InitReport, ManagerConfig, MenuContribution, PluginManager, PluginManagerBuilder, RouteContribution,
    MENU_ITEMS_FILTER, ROUTES_FILTER,
};
pub use state::{LifecycleState, LoadedPlugin, PluginStatusView};
