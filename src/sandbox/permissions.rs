//! Plugin permissions.
//!
//! The allow-list is closed: any string not listed here is rejected by the
//! validator and by sandbox construction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A capability a plugin may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    StorageRead,
    StorageWrite,
    EventsEmit,
    EventsSubscribe,
    Messaging,
    NetworkFetch,
    Timers,
    UiRender,
    UiMenu,
    UiRoutes,
    SettingsRead,
    SettingsWrite,
    HooksAction,
    HooksFilter,
    AdminPlugins,
    AdminUsers,
    AdminSystem,
}

/// Privilege tier of a permission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionTier {
    /// Ordinary capability
    Standard,
    /// Host administration capability
    Admin,
}

impl Permission {
    /// Every recognised permission.
    pub const ALL: [Permission; 17] = [
        Permission::StorageRead,
        Permission::StorageWrite,
        Permission::EventsEmit,
        Permission::EventsSubscribe,
        Permission::Messaging,
        Permission::NetworkFetch,
        Permission::Timers,
        Permission::UiRender,
        Permission::UiMenu,
        Permission::UiRoutes,
        Permission::SettingsRead,
        Permission::SettingsWrite,
        Permission::HooksAction,
        Permission::HooksFilter,
        Permission::AdminPlugins,
        Permission::AdminUsers,
        Permission::AdminSystem,
    ];

    /// Manifest string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::StorageRead => "storage:read",
            Permission::StorageWrite => "storage:write",
            Permission::EventsEmit => "events:emit",
            Permission::EventsSubscribe => "events:subscribe",
            Permission::Messaging => "messaging",
            Permission::NetworkFetch => "network:fetch",
            Permission::Timers => "timers",
            Permission::UiRender => "ui:render",
            Permission::UiMenu => "ui:menu",
            Permission::UiRoutes => "ui:routes",
            Permission::SettingsRead => "settings:read",
            Permission::SettingsWrite => "settings:write",
            Permission::HooksAction => "hooks:action",
            Permission::HooksFilter => "hooks:filter",
            Permission::AdminPlugins => "admin:plugins",
            Permission::AdminUsers => "admin:users",
            Permission::AdminSystem => "admin:system",
        }
    }

    /// Parse a manifest permission string.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }

    /// Privilege tier.
    pub fn tier(self) -> PermissionTier {
        match self {
            Permission::AdminPlugins | Permission::AdminUsers | Permission::AdminSystem => {
                PermissionTier::Admin
            }
            _ => PermissionTier::Standard,
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Permissions granted to one plugin.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionSet {
    granted: BTreeSet<Permission>,
}

impl PermissionSet {
    /// Parse requested permission strings; unknown strings are returned as
    /// the error.
    pub fn parse<S: AsRef<str>>(requested: &[S]) -> Result<Self, Vec<String>> {
        let mut granted = BTreeSet::new();
        let mut unknown = Vec::new();
        for raw in requested {
            match Permission::parse(raw.as_ref()) {
                Some(p) => {
                    granted.insert(p);
                }
                None => unknown.push(raw.as_ref().to_string()),
            }
        }
        if unknown.is_empty() {
            Ok(Self { granted })
        } else {
            Err(unknown)
        }
    }

    /// Whether a permission is granted.
    pub fn contains(&self, permission: Permission) -> bool {
        self.granted.contains(&permission)
    }

    /// Granted permissions in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.granted.iter().copied()
    }

    /// Number of granted permissions.
    pub fn len(&self) -> usize {
        self.granted.len()
    }

    /// Whether nothing is granted.
    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self {
            granted: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip_all() {
        for permission in Permission::ALL {
            assert_eq!(Permission::parse(permission.as_str()), Some(permission));
        }
        assert_eq!(Permission::parse("storage:delete-everything"), None);
    }

    #[test]
    fn test_tiers() {
        assert_eq!(Permission::AdminUsers.tier(), PermissionTier::Admin);
        assert_eq!(Permission::StorageRead.tier(), PermissionTier::Standard);
    }

    #[test]
    fn test_set_rejects_unknown() {
        let err = PermissionSet::parse(&["storage:read", "root", "network:fetch", "kernel"]).unwrap_err();
        assert_eq!(err, vec!["root", "kernel"]);

        let set = PermissionSet::parse(&["storage:read", "storage:read", "timers"]).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(Permission::Timers));
        assert!(!set.contains(Permission::NetworkFetch));
    }
}
