//! Kubernetes cluster bring-up for kubesmith.
//!
//! This crate turns a cluster plan into a running cluster. Every step runs
//! over [`kubesmith_remote::Shell`], so the whole pipeline can be driven by a
//! scripted executor in tests.
//!
//! # Pipeline
//!
//! [`orchestrator::install`] runs, in order:
//!
//! - **Preflight**: connect, make sudo passwordless, detect the package manager
//! - **Preparation**: `/etc/hosts`, repositories, base packages, stale state
//!   removal, swap and SELinux
//! - **Runtime**: containerd from the Docker repository
//! - **Kubernetes packages**: `kubelet`, `kubectl`, `kubeadm`, held
//! - **etcd**: certificates and an external cluster for multi-master plans
//! - **helm** and **keepalived**
//! - **Bring-up**: the [`Bringup`] state machine
//!
//! ```text
//! Init ──▶ FirstMasterReady ──▶ MastersJoined ──▶ WorkersJoined ──▶ Converged
//! ```
//!
//! Teardown runs after every pipeline, on success and on failure.
//!
//! # Example
//!
//! ```ignore
//! use kubesmith_control::{orchestrator, KubesmithConfig, RunContext};
//!
//! let config = KubesmithConfig::from_file("kubesmith.toml")?;
//! let ctx = RunContext::new(config, shell)?;
//! orchestrator::install(&ctx).await?;
//! ```

#![forbid(unsafe_code)]

pub mod archive;
pub mod config;
pub mod context;
pub mod error;
pub mod etcd;
pub mod helm;
pub mod join;
pub mod keepalived;
pub mod kube;
pub mod kubeadm;
pub mod orchestrator;
pub mod pki;
pub mod plan;
pub mod prepare;
pub mod privilege;
pub mod retry;
pub mod runtime;
pub mod state;
pub mod teardown;
mod template;

// Re-export commonly used types at the crate root
pub use config::{KubesmithConfig, ResolvedVersions};
pub use context::{register_credentials, RunContext};
pub use error::{OrchestratorError, OrchestratorResult};
pub use plan::{ClusterPlan, Node, Role};
pub use retry::{Clock, InstantClock, RetryPolicy, TokioClock};
pub use state::{
    Bringup, BringupState, Converged, FirstMasterReady, Init, MastersJoined, WorkersJoined,
};
pub use teardown::teardown;
