//! Plugin Validator
//!
//! Static well-formedness and policy checks on manifests. Nothing here
//! executes plugin code; the injection check is a text match on the
//! serialized manifest.

pub mod rules;

pub use rules::ValidatorConfig;

use crate::core::{Error, Result};
use crate::manifest::version::parse_version;
use crate::manifest::{EntryPoint, Manifest};
use crate::sandbox::permissions::{Permission, PermissionTier};
use rules::{ALLOWED_CATEGORIES, ID_PATTERN, INJECTION_PATTERNS, MAX_ID_LEN, MIN_ID_LEN, RESERVED_IDS};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use url::Url;

/// Outcome of validating a manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// No fatal problems
    pub is_valid: bool,
    /// Fatal problems
    pub errors: Vec<String>,
    /// Non-fatal problems
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Convert into a `Result`, failing with [`Error::Validation`].
    pub fn into_result(self, plugin_id: &str) -> Result<Vec<String>> {
        if self.is_valid {
            Ok(self.warnings)
        } else {
            Err(Error::Validation {
                plugin_id: plugin_id.to_string(),
                errors: self.errors,
            })
        }
    }
}

/// Manifest validator.
#[derive(Clone, Debug, Default)]
pub struct PluginValidator {
    config: ValidatorConfig,
}

impl PluginValidator {
    /// Create a validator.
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate one manifest.
    pub fn validate(&self, manifest: &Manifest) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        self.check_required(manifest, &mut errors);
        self.check_id(&manifest.id, &mut errors);
        if !manifest.version.is_empty() && parse_version(&manifest.version).is_none() {
            errors.push(format!("version '{}' is not a semantic version", manifest.version));
        }
        if let Some(category) = &manifest.category {
            if !ALLOWED_CATEGORIES.contains(&category.as_str()) {
                errors.push(format!("category '{category}' is not allowed"));
            }
        }
        self.check_permissions(manifest, &mut errors, &mut warnings);
        self.check_contributions(manifest, &mut errors);
        self.check_entry(&manifest.entry, &mut errors);
        self.check_limits(manifest, &mut warnings);
        self.check_injection(manifest, &mut warnings);

        ValidationReport::from_parts(errors, warnings)
    }

    /// Validate a manifest replacing an installed one.
    pub fn validate_update(&self, old: &Manifest, new: &Manifest) -> ValidationReport {
        let report = self.validate(new);
        let mut errors = report.errors;
        let mut warnings = report.warnings;

        if old.id != new.id {
            errors.push(format!("plugin id cannot change ('{}' -> '{}')", old.id, new.id));
        }

        match (parse_version(&old.version), parse_version(&new.version)) {
            (Some(before), Some(after)) if after <= before => warnings.push(format!(
                "version {} is not newer than installed {}",
                new.version, old.version
            )),
            _ => {}
        }

        let kept: HashSet<&String> = new.permissions.iter().collect();
        for dropped in old.permissions.iter().filter(|p| !kept.contains(p)) {
            warnings.push(format!("permission '{dropped}' was removed"));
        }

        ValidationReport::from_parts(errors, warnings)
    }

    fn check_required(&self, manifest: &Manifest, errors: &mut Vec<String>) {
        let required = [
            ("id", manifest.id.as_str()),
            ("name", manifest.name.as_str()),
            ("version", manifest.version.as_str()),
            ("entry", manifest.entry.reference()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                errors.push(format!("missing required field '{field}'"));
            }
        }
    }

    fn check_id(&self, id: &str, errors: &mut Vec<String>) {
        if id.is_empty() {
            return;
        }
        if !ID_PATTERN.is_match(id) {
            errors.push(format!(
                "id '{id}' must start with a lowercase letter or digit and contain only lowercase letters, digits and hyphens"
            ));
        }
        if !(MIN_ID_LEN..=MAX_ID_LEN).contains(&id.len()) {
            errors.push(format!(
                "id '{id}' must be between {MIN_ID_LEN} and {MAX_ID_LEN} characters"
            ));
        }
        if RESERVED_IDS.contains(&id) {
            errors.push(format!("id '{id}' is reserved"));
        }
    }

    fn check_permissions(&self, manifest: &Manifest, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
        for raw in &manifest.permissions {
            match Permission::parse(raw) {
                None => errors.push(format!("unknown permission '{raw}'")),
                Some(p) if p.tier() == PermissionTier::Admin => {
                    warnings.push(format!("permission '{raw}' grants host administration"))
                }
                Some(_) => {}
            }
        }
    }

    fn check_contributions(&self, manifest: &Manifest, errors: &mut Vec<String>) {
        let mut paths = HashSet::new();
        for route in &manifest.routes {
            if !paths.insert(route.path.as_str()) {
                errors.push(format!("duplicate route path '{}'", route.path));
            }
        }

        let mut items = HashSet::new();
        for item in &manifest.menu_items {
            if !items.insert(item.id.as_str()) {
                errors.push(format!("duplicate menu item id '{}'", item.id));
            }
        }

        let mut keys = HashSet::new();
        for setting in &manifest.settings {
            if !keys.insert(setting.key.as_str()) {
                errors.push(format!("duplicate setting key '{}'", setting.key));
            }
            if setting.kind.needs_options() && setting.options.is_empty() {
                errors.push(format!("setting '{}' needs at least one option", setting.key));
            }
        }
    }

    fn check_entry(&self, entry: &EntryPoint, errors: &mut Vec<String>) {
        let EntryPoint::Remote { url } = entry else {
            return;
        };
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                errors.push(format!("remote entry '{url}' is not a valid URL: {e}"));
                return;
            }
        };

        match parsed.scheme() {
            "https" => {}
            "http" if is_loopback(&parsed) => {}
            "http" => errors.push(format!(
                "remote entry '{url}' uses an insecure transport on a non-loopback host"
            )),
            other => errors.push(format!("remote entry scheme '{other}' is not supported")),
        }

        if !parsed.path().ends_with(&self.config.remote_entry_filename) {
            errors.push(format!(
                "remote entry '{url}' must end with '{}'",
                self.config.remote_entry_filename
            ));
        }
    }

    fn check_limits(&self, manifest: &Manifest, warnings: &mut Vec<String>) {
        if let Some(size) = manifest.size_bytes {
            if size > self.config.max_package_size_bytes {
                warnings.push(format!(
                    "package size {size} bytes exceeds {} bytes",
                    self.config.max_package_size_bytes
                ));
            }
        }
        if manifest.dependencies.len() > self.config.max_dependencies {
            warnings.push(format!(
                "{} dependencies exceeds the recommended {}",
                manifest.dependencies.len(),
                self.config.max_dependencies
            ));
        }
        if manifest.permissions.len() > self.config.max_permissions {
            warnings.push(format!(
                "{} permissions exceeds the recommended {}",
                manifest.permissions.len(),
                self.config.max_permissions
            ));
        }
    }

    fn check_injection(&self, manifest: &Manifest, warnings: &mut Vec<String>) {
        let Ok(serialized) = serde_json::to_string(manifest) else {
            return;
        };
        if INJECTION_PATTERNS.is_match(&serialized) {
            warnings.push("manifest contains suspicious code-like content".to_string());
        }
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false),
        None => false,
    }
}
