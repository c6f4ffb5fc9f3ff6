//! Validation rule tables and thresholds.

use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Ids that plugins may not claim.
pub const RESERVED_IDS: &[&str] = &[
    "admin", "api", "auth", "core", "host", "plugin", "plugins", "system", "settings", "static",
];

/// Accepted manifest categories.
pub const ALLOWED_CATEGORIES: &[&str] = &[
    "analytics",
    "communication",
    "content",
    "developer",
    "integration",
    "productivity",
    "security",
    "theme",
    "utility",
];

/// Minimum id length.
pub const MIN_ID_LEN: usize = 3;
/// Maximum id length.
pub const MAX_ID_LEN: usize = 50;

pub(crate) static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("valid id pattern"));

/// Text that looks like an attempt to smuggle executable content through a
/// manifest. Matched against the serialized manifest only.
pub(crate) static INJECTION_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)<script",
        r"(?i)javascript:",
        r"(?i)\beval\s*\(",
        r"(?i)new\s+function\s*\(",
        r"(?i)__proto__",
        r"(?i)document\.cookie",
        r"(?i)rm\s+-rf",
        r"\$\(",
    ])
    .expect("valid injection patterns")
});

/// Validator thresholds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Package size above which a warning is raised
    pub max_package_size_bytes: u64,
    /// Dependency count above which a warning is raised
    pub max_dependencies: usize,
    /// Permission count above which a warning is raised
    pub max_permissions: usize,
    /// File name a remote entry point must end with
    pub remote_entry_filename: String,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_package_size_bytes: 10 * 1024 * 1024,
            max_dependencies: 20,
            max_permissions: 10,
            remote_entry_filename: "plugin.wasm".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_pattern() {
        assert!(ID_PATTERN.is_match("my-plugin-2"));
        assert!(ID_PATTERN.is_match("9lives"));
        assert!(!ID_PATTERN.is_match("-leading"));
        assert!(!ID_PATTERN.is_match("Upper"));
        assert!(!ID_PATTERN.is_match("under_score"));
    }

    #[test]
    fn test_injection_patterns() {
        assert!(INJECTION_PATTERNS.is_match(r#"{"description":"<SCRIPT>alert(1)"}"#));
        assert!(INJECTION_PATTERNS.is_match("call eval (x)"));
        assert!(!INJECTION_PATTERNS.is_match("an evaluation helper"));
    }
}
