//! Exact-version package reconciliation for kubesmith.
//!
//! Nodes in one cluster may run different distributions. Each node's dialect
//! is detected from `/etc/os-release`:
//!
//! | Distribution | Dialect | Version join |
//! |--------------|---------|--------------|
//! | Ubuntu       | apt     | `name=version` |
//! | CentOS       | yum     | `name-version` |
//! | Rocky Linux  | dnf     | `name-version` |
//!
//! [`Reconciler`] turns a list of [`PackageSpec`]s into at most one install and
//! one downgrade command, skipping everything already at the requested version.

#![forbid(unsafe_code)]

mod apt;
pub mod decode;
mod error;
mod manager;
mod reconcile;
mod rpm;
mod spec;
pub mod version;

pub use apt::Apt;
pub use error::{PackageError, PackageResult};
pub use manager::{Dialect, KeyInstall, PackageManager, Repository};
pub use reconcile::{
    detect, ReconcileOptions, ReconcileOutcome, Reconciler, OS_RELEASE_QUERY, REMOVE_POLICY_RC,
};
pub use rpm::{Dnf, Yum};
pub use spec::PackageSpec;
