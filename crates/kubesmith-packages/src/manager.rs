//! Package manager dialects.
//!
//! A [`PackageManager`] only builds command lines and decodes output. Running
//! them is the [`Reconciler`](crate::Reconciler)'s job, which keeps every
//! dialect testable without a node.

use std::fmt;
use std::sync::Arc;

use kubesmith_remote::ExitAllowance;

use crate::apt::Apt;
use crate::decode;
use crate::error::{PackageError, PackageResult};
use crate::rpm::{Dnf, Yum};

/// Supported package manager families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Debian-style, Ubuntu.
    Apt,
    /// RPM with yum, CentOS.
    Yum,
    /// RPM with dnf, Rocky Linux.
    Dnf,
}

impl Dialect {
    /// Select the dialect from the `/etc/os-release` distribution name.
    pub fn from_os_name(name: &str) -> PackageResult<Self> {
        let lower = decode::os_name(name);
        if lower.contains("ubuntu") {
            Ok(Self::Apt)
        } else if lower.contains("centos") {
            Ok(Self::Yum)
        } else if lower.contains("rocky") {
            Ok(Self::Dnf)
        } else {
            Err(PackageError::UnsupportedOs(name.trim().to_owned()))
        }
    }

    /// Returns true for the RPM dialects.
    #[must_use]
    pub const fn is_rpm(self) -> bool {
        matches!(self, Self::Yum | Self::Dnf)
    }

    /// The manager implementing this dialect.
    #[must_use]
    pub fn manager(self) -> Arc<dyn PackageManager> {
        match self {
            Self::Apt => Arc::new(Apt),
            Self::Yum => Arc::new(Yum),
            Self::Dnf => Arc::new(Dnf),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apt => f.write_str("apt"),
            Self::Yum => f.write_str("yum"),
            Self::Dnf => f.write_str("dnf"),
        }
    }
}

/// A package repository to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// Human readable name.
    pub name: String,
    /// Section id for RPM `.repo` files.
    pub short_name: String,
    /// File name without extension.
    pub file_name: String,
    /// Repository address; apt lines carry suite and components after it.
    pub address: String,
    /// Signing key URL; `None` marks the repository trusted.
    pub gpg_key_url: Option<String>,
}

/// Commands fetching a signing key and where the key lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInstall {
    /// Path of the installed key.
    pub path: String,
    /// Commands to run, in order.
    pub commands: Vec<String>,
}

/// Command builders and decoders for one package manager.
pub trait PackageManager: Send + Sync + fmt::Debug {
    /// Which dialect this is.
    fn dialect(&self) -> Dialect;

    /// Command printing the installed row for `name`.
    fn query_installed(&self, name: &str) -> String;

    /// Installed version from [`query_installed`](Self::query_installed) output.
    fn decode_installed(&self, name: &str, output: &str) -> Option<String>;

    /// Command listing every available version of `name`.
    fn list_available(&self, name: &str) -> String;

    /// Versions from [`list_available`](Self::list_available) output.
    fn decode_available(&self, name: &str, output: &str) -> Vec<String>;

    /// Character joining name and version in install arguments.
    fn version_separator(&self) -> char;

    /// One command installing every argument.
    fn install(&self, packages: &[String]) -> String;

    /// One command downgrading every argument.
    fn downgrade(&self, packages: &[String]) -> String;

    /// Commands purging `name`.
    fn remove(&self, name: &str) -> Vec<String>;

    /// Command pinning `name` at its installed version.
    fn hold(&self, name: &str) -> String;

    /// Command refreshing repository metadata.
    fn update_repos(&self) -> String;

    /// Directory holding repository signing keys.
    fn key_dir(&self) -> &'static str;

    /// Commands fetching the key at `url` as `name`.
    fn add_gpg_key(&self, url: &str, name: &str) -> KeyInstall;

    /// Command writing the repository definition.
    fn add_repository(&self, repo: &Repository, key_path: Option<&str>) -> String;

    /// Command deleting every repository file starting with `prefix`.
    fn remove_repository_files(&self, prefix: &str) -> String;

    /// Non-zero exits that count as success.
    fn allowed_exits(&self) -> Vec<ExitAllowance>;

    /// Distribution specific packages needed before anything else.
    fn base_packages(&self) -> &'static [&'static str];

    /// `name` joined with `version` for install arguments.
    fn versioned(&self, name: &str, version: &str) -> String {
        format!("{name}{}{version}", self.version_separator())
    }
}
