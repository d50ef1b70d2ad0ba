//! Requested packages.

use std::fmt;
use std::str::FromStr;

use crate::error::{PackageError, PackageResult};

/// A package and an optional exact version prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageSpec {
    /// Package name.
    pub name: String,
    /// Version prefix; `None` accepts any installed version.
    pub version: Option<String>,
}

impl PackageSpec {
    /// Any version of `name`.
    #[must_use]
    pub fn any(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// `name` at a version starting with `version`.
    #[must_use]
    pub fn exact(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }

    /// Parse `name` or `name=version`.
    pub fn parse(raw: &str) -> PackageResult<Self> {
        raw.parse()
    }

    /// Parse a whitespace separated list.
    pub fn parse_list(raw: &str) -> PackageResult<Vec<Self>> {
        raw.split_whitespace().map(Self::parse).collect()
    }
}

impl FromStr for PackageSpec {
    type Err = PackageError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (name, version) = match raw.split_once('=') {
            Some((name, version)) => (name, Some(version)),
            None => (raw, None),
        };
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(PackageError::invalid_spec(raw));
        }
        match version {
            Some("") => Err(PackageError::invalid_spec(raw)),
            Some(v) => Ok(Self::exact(name, v)),
            None => Ok(Self::any(name)),
        }
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}={v}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_forms() {
        assert_eq!(PackageSpec::parse("curl").unwrap(), PackageSpec::any("curl"));
        assert_eq!(
            PackageSpec::parse("kubelet=1.24").unwrap(),
            PackageSpec::exact("kubelet", "1.24")
        );
    }

    #[test]
    fn rejects_empty_parts() {
        assert!(PackageSpec::parse("=1.0").is_err());
        assert!(PackageSpec::parse("kubelet=").is_err());
    }

    #[test]
    fn parses_lists() {
        let specs = PackageSpec::parse_list("curl  kubeadm=1.30 wget").unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[1].to_string(), "kubeadm=1.30");
    }
}
