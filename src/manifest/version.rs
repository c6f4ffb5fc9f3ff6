//! Version parsing and the compatibility rule.
//!
//! Requirements are minimum versions. A leading operator (`^`, `~`, `>=`,
//! `=`, `v`) is accepted and ignored; missing minor/patch parts are zero.

use semver::Version;

/// Parse a strict semantic version (`1.2.3`, `1.2.3-beta.1`).
pub fn parse_version(s: &str) -> Option<Version> {
    Version::parse(s.trim()).ok()
}

/// Parse a dependency requirement into the minimum version it names.
pub fn parse_requirement(s: &str) -> Option<Version> {
    let trimmed = s
        .trim()
        .trim_start_matches(">=")
        .trim_start_matches(['^', '~', '=', 'v'])
        .trim();
    if trimmed.is_empty() || trimmed == "*" {
        return Some(Version::new(0, 0, 0));
    }

    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }

    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.len() > 3 {
        return None;
    }
    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        *slot = part.parse().ok()?;
    }
    Some(Version::new(numbers[0], numbers[1], numbers[2]))
}

/// Whether `available` satisfies `required`.
///
/// A higher major always satisfies; with equal majors a higher minor
/// satisfies; with equal minors the patch must be at least the required one.
pub fn is_compatible(available: &Version, required: &Version) -> bool {
    if available.major != required.major {
        return available.major > required.major;
    }
    if available.minor != required.minor {
        return available.minor > required.minor;
    }
    available.patch >= required.patch
}

/// String form of [`is_compatible`]. Unparseable input never satisfies.
pub fn satisfies(available: &str, requirement: &str) -> bool {
    match (parse_version(available), parse_requirement(requirement)) {
        (Some(available), Some(required)) => is_compatible(&available, &required),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert!(parse_version("1.2.3").is_some());
        assert!(parse_version("1.2.3-beta.1").is_some());
        assert!(parse_version("1.2").is_none());
        assert!(parse_version("latest").is_none());
    }

    #[test]
    fn test_parse_requirement() {
        assert_eq!(parse_requirement("^1.2.0"), Some(Version::new(1, 2, 0)));
        assert_eq!(parse_requirement(">= 2.0"), Some(Version::new(2, 0, 0)));
        assert_eq!(parse_requirement("~3"), Some(Version::new(3, 0, 0)));
        assert_eq!(parse_requirement("*"), Some(Version::new(0, 0, 0)));
        assert_eq!(parse_requirement("1.x"), None);
    }

    #[test]
    fn test_compatibility_rule() {
        assert!(satisfies("2.0.0", "1.9.9"));
        assert!(satisfies("1.3.0", "1.2.5"));
        assert!(satisfies("1.2.5", "1.2.5"));
        assert!(satisfies("1.2.6", "^1.2.5"));
        assert!(!satisfies("1.2.4", "1.2.5"));
        assert!(!satisfies("1.1.9", "1.2.0"));
        assert!(!satisfies("0.9.0", "1.0.0"));
        assert!(!satisfies("garbage", "1.0.0"));
    }
}
