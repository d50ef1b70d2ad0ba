//! The cluster as it should be: who is a master, who is a worker and where
//! the API server is reached.

use std::fmt;
use std::net::IpAddr;

use kubesmith_remote::Target;
use serde::Deserialize;

use crate::config::{KubesmithConfig, NodeConfig};
use crate::error::{OrchestratorError, OrchestratorResult};

/// API server port.
pub const API_SERVER_PORT: u16 = 6443;

/// etcd client port.
pub const ETCD_CLIENT_PORT: u16 = 2379;

/// etcd peer port.
pub const ETCD_PEER_PORT: u16 = 2380;

/// Node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Runs the control plane and, in multi-master clusters, etcd.
    Master,
    /// Runs workloads only.
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// A node taking part in the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Hostname.
    pub hostname: String,
    /// SSH address.
    pub ip: IpAddr,
    /// Role.
    pub role: Role,
    /// Interface for keepalived.
    pub interface: String,
}

impl Node {
    /// Where commands for this node run.
    #[must_use]
    pub const fn target(&self) -> Target {
        Target::Node(self.ip)
    }

    /// Returns true for masters.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hostname, self.ip)
    }
}

impl From<&NodeConfig> for Node {
    fn from(config: &NodeConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            ip: config.ip,
            role: config.role,
            interface: config.interface.clone(),
        }
    }
}

/// Masters, workers and the control plane endpoint.
#[derive(Debug, Clone)]
pub struct ClusterPlan {
    nodes: Vec<Node>,
    first_master: usize,
    endpoint: IpAddr,
    virtual_ip: Option<IpAddr>,
}

impl ClusterPlan {
    /// Build the plan from configuration.
    pub fn from_config(config: &KubesmithConfig) -> OrchestratorResult<Self> {
        let nodes: Vec<Node> = config.nodes.iter().map(Node::from).collect();
        let first_master = nodes
            .iter()
            .position(Node::is_master)
            .ok_or_else(|| OrchestratorError::config("at least one master node is required"))?;
        let virtual_ip = config.keepalived.active_virtual_ip();
        Ok(Self {
            endpoint: virtual_ip.unwrap_or(nodes[first_master].ip),
            nodes,
            first_master,
            virtual_ip,
        })
    }

    /// Every node in configuration order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Masters in join order.
    pub fn masters(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.role == Role::Master)
    }

    /// Workers in join order.
    pub fn workers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.role == Role::Worker)
    }

    /// The master running `kubeadm init`.
    #[must_use]
    pub fn first_master(&self) -> &Node {
        &self.nodes[self.first_master]
    }

    /// Returns true with more than one master, which selects external etcd.
    #[must_use]
    pub fn is_multi_master(&self) -> bool {
        self.masters().count() > 1
    }

    /// Address the API server is reached on.
    #[must_use]
    pub const fn control_plane_endpoint(&self) -> IpAddr {
        self.endpoint
    }

    /// keepalived virtual IP, when enabled.
    #[must_use]
    pub const fn virtual_ip(&self) -> Option<IpAddr> {
        self.virtual_ip
    }

    /// Master addresses in order.
    #[must_use]
    pub fn master_ips(&self) -> Vec<IpAddr> {
        self.masters().map(|n| n.ip).collect()
    }

    /// Find a node by hostname.
    #[must_use]
    pub fn node(&self, hostname: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.hostname == hostname)
    }

    /// `hostname=https://ip:2380` for every master, comma joined.
    #[must_use]
    pub fn etcd_initial_cluster(&self) -> String {
        self.masters()
            .map(|n| format!("{}=https://{}:{ETCD_PEER_PORT}", n.hostname, n.ip))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// etcd client URLs for every master.
    #[must_use]
    pub fn etcd_endpoints(&self) -> Vec<String> {
        self.masters()
            .map(|n| format!("https://{}:{ETCD_CLIENT_PORT}", n.ip))
            .collect()
    }
}
