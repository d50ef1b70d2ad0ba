//! kubeadm configuration for the first master.
//!
//! [`compose`] is pure: it renders three YAML documents (`InitConfiguration`,
//! `ClusterConfiguration`, `KubeletConfiguration`) in the schema matching the
//! Kubernetes version.

use std::net::IpAddr;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::config::KubesmithConfig;
use crate::error::OrchestratorResult;
use crate::pki::{CA_CERT_PATH, ETCD_CERT_PATH, ETCD_KEY_PATH};
use crate::plan::{ClusterPlan, API_SERVER_PORT};

const KUBELET_API_VERSION: &str = "kubelet.config.k8s.io/v1beta1";

/// kubeadm config schema for `kubernetes`.
#[must_use]
pub fn schema_for(kubernetes: &Version) -> &'static str {
    if *kubernetes >= Version::new(1, 20, 0) {
        "kubeadm.k8s.io/v1beta3"
    } else if *kubernetes >= Version::new(1, 17, 0) {
        "kubeadm.k8s.io/v1beta2"
    } else {
        "kubeadm.k8s.io/v1beta1"
    }
}

/// Command minting a certificate key; the subcommand left `alpha` in 1.20.
#[must_use]
pub fn certificate_key_command(kubernetes: &Version) -> &'static str {
    if *kubernetes >= Version::new(1, 20, 0) {
        "sudo kubeadm certs certificate-key"
    } else {
        "sudo kubeadm alpha certs certificate-key"
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitConfiguration<'a> {
    api_version: &'static str,
    kind: &'static str,
    certificate_key: &'a str,
    #[serde(rename = "localAPIEndpoint")]
    local_api_endpoint: LocalApiEndpoint,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocalApiEndpoint {
    advertise_address: String,
    bind_port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfiguration<'a> {
    api_version: &'static str,
    kind: &'static str,
    kubernetes_version: String,
    api_server: ApiServer,
    control_plane_endpoint: String,
    networking: Networking<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    etcd: Option<Etcd>,
    image_repository: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns: Option<Dns>,
}

#[derive(Debug, Serialize)]
struct ApiServer {
    #[serde(rename = "certSANs")]
    cert_sans: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Networking<'a> {
    pod_subnet: &'a str,
}

#[derive(Debug, Serialize)]
struct Etcd {
    external: ExternalEtcd,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExternalEtcd {
    endpoints: Vec<String>,
    ca_file: &'static str,
    cert_file: &'static str,
    key_file: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Dns {
    image_repository: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KubeletConfiguration<'a> {
    api_version: &'static str,
    kind: &'static str,
    cgroup_driver: &'a str,
}

/// Render the kubeadm config for `kubeadm init`.
///
/// `endpoint` is the control plane address (virtual IP or first master) and
/// `advertise` the first master's own address. External etcd is configured
/// only for `multi_master`.
pub fn compose(
    version: &Version,
    endpoint: IpAddr,
    advertise: IpAddr,
    certificate_key: &str,
    plan: &ClusterPlan,
    config: &KubesmithConfig,
    multi_master: bool,
) -> OrchestratorResult<String> {
    let schema = schema_for(version);
    let registry = config.kubernetes.image_registry.as_str();

    let init = InitConfiguration {
        api_version: schema,
        kind: "InitConfiguration",
        certificate_key,
        local_api_endpoint: LocalApiEndpoint {
            advertise_address: advertise.to_string(),
            bind_port: API_SERVER_PORT,
        },
    };

    let mut cert_sans: Vec<String> = plan.master_ips().iter().map(ToString::to_string).collect();
    if let Some(vip) = plan.virtual_ip() {
        cert_sans.push(vip.to_string());
    }
    let cluster = ClusterConfiguration {
        api_version: schema,
        kind: "ClusterConfiguration",
        kubernetes_version: format!("v{version}"),
        api_server: ApiServer { cert_sans },
        control_plane_endpoint: format!("{endpoint}:{API_SERVER_PORT}"),
        networking: Networking {
            pod_subnet: &config.kubernetes.pod_subnet,
        },
        etcd: multi_master.then(|| Etcd {
            external: ExternalEtcd {
                endpoints: plan.etcd_endpoints(),
                ca_file: CA_CERT_PATH,
                cert_file: ETCD_CERT_PATH,
                key_file: ETCD_KEY_PATH,
            },
        }),
        image_repository: registry,
        dns: config.kubernetes.custom_registry().then(|| Dns {
            image_repository: format!("{registry}/coredns"),
        }),
    };

    let kubelet = KubeletConfiguration {
        api_version: KUBELET_API_VERSION,
        kind: "KubeletConfiguration",
        cgroup_driver: config.containerd.cgroup_driver(),
    };

    Ok([
        serde_yaml::to_string(&init)?,
        serde_yaml::to_string(&cluster)?,
        serde_yaml::to_string(&kubelet)?,
    ]
    .join("---\n"))
}

/// The `certificateKey` from a composed config, if present.
#[must_use]
pub fn certificate_key(config: &str) -> Option<String> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct WithKey {
        certificate_key: Option<String>,
    }

    serde_yaml::Deserializer::from_str(config)
        .filter_map(|doc| WithKey::deserialize(doc).ok())
        .find_map(|doc| doc.certificate_key)
        .filter(|key| !key.is_empty())
}
