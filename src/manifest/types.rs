//! Manifest data model.
//!
//! A manifest is the static descriptor of a plugin: identity, dependencies,
//! permissions, entry point and the UI contributions it declares. Manifests
//! are immutable once discovered.

use serde::{Deserialize, Serialize};

/// Static plugin descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Globally unique plugin id
    #[serde(default)]
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Semantic version
    #[serde(default)]
    pub version: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Author
    #[serde(default)]
    pub author: String,
    /// Category (validated against an allow-list)
    #[serde(default)]
    pub category: Option<String>,
    /// Requested permissions, kept as raw strings until validated
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Declared dependencies
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    /// Where the plugin code comes from
    #[serde(default)]
    pub entry: EntryPoint,
    /// Declared routes
    #[serde(default)]
    pub routes: Vec<RouteDecl>,
    /// Declared menu items
    #[serde(default)]
    pub menu_items: Vec<MenuItemDecl>,
    /// Declared settings
    #[serde(default)]
    pub settings: Vec<SettingDecl>,
    /// Extra origins the plugin may reach over the network
    #[serde(default)]
    pub network_allowlist: Vec<String>,
    /// Package size in bytes
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// Package content hash (hex)
    #[serde(default)]
    pub hash: Option<String>,
}

impl Manifest {
    /// Create a manifest with a local entry point named after the id.
    pub fn new(id: &str, name: &str, version: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            description: String::new(),
            author: String::new(),
            category: None,
            permissions: Vec::new(),
            dependencies: Vec::new(),
            entry: EntryPoint::Local {
                module: id.to_string(),
            },
            routes: Vec::new(),
            menu_items: Vec::new(),
            settings: Vec::new(),
            network_allowlist: Vec::new(),
            size_bytes: None,
            hash: None,
        }
    }

    /// Set description.
    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = desc.to_string();
        self
    }

    /// Set author.
    pub fn with_author(mut self, author: &str) -> Self {
        self.author = author.to_string();
        self
    }

    /// Set category.
    pub fn with_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    /// Add a permission.
    pub fn with_permission(mut self, permission: &str) -> Self {
        self.permissions.push(permission.to_string());
        self
    }

    /// Add a dependency.
    pub fn with_dependency(mut self, dep: DependencySpec) -> Self {
        self.dependencies.push(dep);
        self
    }

    /// Set entry point.
    pub fn with_entry(mut self, entry: EntryPoint) -> Self {
        self.entry = entry;
        self
    }

    /// Add a route.
    pub fn with_route(mut self, route: RouteDecl) -> Self {
        self.routes.push(route);
        self
    }

    /// Add a menu item.
    pub fn with_menu_item(mut self, item: MenuItemDecl) -> Self {
        self.menu_items.push(item);
        self
    }

    /// Add a setting.
    pub fn with_setting(mut self, setting: SettingDecl) -> Self {
        self.settings.push(setting);
        self
    }

    /// Allow network access to an extra origin.
    pub fn with_network_origin(mut self, origin: &str) -> Self {
        self.network_allowlist.push(origin.to_string());
        self
    }

    /// Set package size.
    pub fn with_size(mut self, bytes: u64) -> Self {
        self.size_bytes = Some(bytes);
        self
    }

    /// Ids of non-optional dependencies.
    pub fn required_dependencies(&self) -> impl Iterator<Item = &DependencySpec> {
        self.dependencies.iter().filter(|d| !d.optional)
    }

    /// Ids of optional dependencies.
    pub fn optional_dependencies(&self) -> impl Iterator<Item = &DependencySpec> {
        self.dependencies.iter().filter(|d| d.optional)
    }
}

/// A dependency on another plugin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Id of the required plugin
    pub id: String,
    /// Minimum version requirement, e.g. `^1.2.0`
    #[serde(default)]
    pub version: Option<String>,
    /// Whether the dependent can run without it
    #[serde(default)]
    pub optional: bool,
}

impl DependencySpec {
    /// A non-optional dependency.
    pub fn required(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: None,
            optional: false,
        }
    }

    /// An optional dependency.
    pub fn optional(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: None,
            optional: true,
        }
    }

    /// Set version requirement.
    pub fn with_version(mut self, requirement: &str) -> Self {
        self.version = Some(requirement.to_string());
        self
    }
}

/// Reference to the plugin's code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntryPoint {
    /// A module compiled into or registered with the host
    Local { module: String },
    /// A module fetched from a remote location
    Remote { url: String },
}

impl EntryPoint {
    /// The raw reference string.
    pub fn reference(&self) -> &str {
        match self {
            EntryPoint::Local { module } => module,
            EntryPoint::Remote { url } => url,
        }
    }

    /// Whether the entry point is fetched remotely.
    pub fn is_remote(&self) -> bool {
        matches!(self, EntryPoint::Remote { .. })
    }
}

impl Default for EntryPoint {
    fn default() -> Self {
        EntryPoint::Local {
            module: String::new(),
        }
    }
}

/// A route contributed by a plugin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecl {
    /// Route path
    pub path: String,
    /// Page title
    #[serde(default)]
    pub title: String,
}

impl RouteDecl {
    /// Create a route.
    pub fn new(path: &str, title: &str) -> Self {
        Self {
            path: path.to_string(),
            title: title.to_string(),
        }
    }
}

/// A menu item contributed by a plugin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItemDecl {
    /// Menu item id (unique within the manifest)
    pub id: String,
    /// Label
    pub label: String,
    /// Route the item navigates to
    #[serde(default)]
    pub route: Option<String>,
    /// Sort order
    #[serde(default)]
    pub order: i32,
}

impl MenuItemDecl {
    /// Create a menu item.
    pub fn new(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            route: None,
            order: 0,
        }
    }

    /// Set target route.
    pub fn with_route(mut self, route: &str) -> Self {
        self.route = Some(route.to_string());
        self
    }

    /// Set sort order.
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

/// Kind of a declared setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SettingKind {
    Text,
    Number,
    Boolean,
    Select,
    MultiSelect,
}

impl SettingKind {
    /// Whether the setting picks from a list of options.
    pub fn needs_options(self) -> bool {
        matches!(self, SettingKind::Select | SettingKind::MultiSelect)
    }
}

/// A selectable option of a `select`/`multi-select` setting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingOption {
    pub value: String,
    pub label: String,
}

/// A setting contributed by a plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettingDecl {
    /// Setting key (unique within the manifest)
    pub key: String,
    /// Label
    #[serde(default)]
    pub label: String,
    /// Kind
    pub kind: SettingKind,
    /// Options for select kinds
    #[serde(default)]
    pub options: Vec<SettingOption>,
    /// Default value
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

impl SettingDecl {
    /// Create a setting.
    pub fn new(key: &str, kind: SettingKind) -> Self {
        Self {
            key: key.to_string(),
            label: key.to_string(),
            kind,
            options: Vec::new(),
            default: None,
        }
    }

    /// Add an option.
    pub fn with_option(mut self, value: &str, label: &str) -> Self {
        self.options.push(SettingOption {
            value: value.to_string(),
            label: label.to_string(),
        });
        self
    }
}
