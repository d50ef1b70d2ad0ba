//! Lenient version handling for distribution package versions.
//!
//! Distribution versions carry epochs (`1:`), release suffixes (`-00`,
//! `-1.1`, `.el8`) and sometimes fewer than three components. They are
//! normalised to [`semver::Version`] by dropping the epoch, keeping the leading
//! run of digits and dots, and padding to three components.

use semver::Version;

use crate::error::{PackageError, PackageResult};

/// Drop a leading `N:` epoch.
#[must_use]
pub fn strip_epoch(version: &str) -> &str {
    match version.split_once(':') {
        Some((epoch, rest)) if epoch.chars().all(|c| c.is_ascii_digit()) => rest,
        _ => version,
    }
}

/// Drop the epoch and everything from the first `-`.
#[must_use]
pub fn strip_release(version: &str) -> &str {
    let version = strip_epoch(version);
    version.split_once('-').map_or(version, |(v, _)| v)
}

/// Parse a distribution version into a comparable [`Version`].
pub fn lenient(version: &str) -> PackageResult<Version> {
    let body = strip_epoch(version.trim());
    let body = body.strip_prefix('v').unwrap_or(body);
    let numeric: String = body
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let mut parts = [0u64; 3];
    let mut found = 0;
    for (slot, part) in parts
        .iter_mut()
        .zip(numeric.split('.').filter(|p| !p.is_empty()))
    {
        *slot = part
            .parse()
            .map_err(|_| PackageError::invalid_version(version))?;
        found += 1;
    }
    if found == 0 {
        return Err(PackageError::invalid_version(version));
    }
    Ok(Version::new(parts[0], parts[1], parts[2]))
}

/// Returns true if `version` starts with `prefix` on a component boundary.
///
/// `1.24.6-00` matches `1.24` and `1.24.6`, but not `1.2`.
#[must_use]
pub fn prefix_matches(version: &str, prefix: &str) -> bool {
    let version = strip_epoch(version);
    if prefix.is_empty() {
        return true;
    }
    version
        .strip_prefix(prefix)
        .is_some_and(|rest| !rest.starts_with(|c: char| c.is_ascii_digit()))
}

/// Highest version in `candidates` matching `prefix`.
///
/// Candidates that do not parse are ignored. Ties keep the first candidate.
#[must_use]
pub fn highest_matching<'a>(candidates: &'a [String], prefix: &str) -> Option<&'a str> {
    let mut best: Option<(&str, Version)> = None;
    for candidate in candidates {
        if !prefix_matches(candidate, prefix) {
            continue;
        }
        let Ok(parsed) = lenient(candidate) else {
            continue;
        };
        if best.as_ref().map_or(true, |(_, v)| parsed > *v) {
            best = Some((candidate.as_str(), parsed));
        }
    }
    best.map(|(raw, _)| raw)
}
