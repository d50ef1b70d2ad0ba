//! Configuration for kubesmith.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use figment::providers::{Env, Format, Toml, Yaml};
use figment::Figment;
use kubesmith_packages::{Dialect, Repository};
use kubesmith_remote::{Credential, DEFAULT_STORE_PATH};
use semver::Version;
use serde::Deserialize;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::plan::Role;

/// Oldest Kubernetes release kubeadm configs are composed for.
pub const MIN_KUBERNETES: Version = Version::new(1, 17, 0);

/// First Kubernetes release without dockershim. Older clusters run on Docker.
pub const DOCKERSHIM_REMOVED: Version = Version::new(1, 24, 0);

/// Oldest supported helm release.
pub const MIN_HELM: Version = Version::new(3, 0, 0);

/// Registry kubeadm pulls from when none is configured.
pub const DEFAULT_IMAGE_REGISTRY: &str = "registry.k8s.io";

/// Version value asking kubesmith to pick a compatible release.
pub const AUTO: &str = "auto";

/// Top-level configuration for a cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct KubesmithConfig {
    /// Component versions.
    #[serde(default)]
    pub versions: VersionsConfig,

    /// Cluster nodes; masters are joined in the order given.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Extra packages installed on every node, `name` or `name=version`.
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,

    /// Node preparation settings.
    #[serde(default)]
    pub system: SystemConfig,

    /// Virtual IP for the control plane.
    #[serde(default)]
    pub keepalived: KeepalivedConfig,

    /// Container runtime settings.
    #[serde(default)]
    pub containerd: ContainerdConfig,

    /// Docker engine settings.
    #[serde(default)]
    pub docker: DockerConfig,

    /// etcd download settings.
    #[serde(default)]
    pub etcd: EtcdConfig,

    /// helm download settings.
    #[serde(default)]
    pub helm: HelmConfig,

    /// Kubernetes settings.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Additional repositories registered on every node.
    #[serde(default)]
    pub custom_repos: Vec<CustomRepo>,

    /// Local paths.
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Default for KubesmithConfig {
    fn default() -> Self {
        Self {
            versions: VersionsConfig::default(),
            nodes: Vec::new(),
            packages: default_packages(),
            system: SystemConfig::default(),
            keepalived: KeepalivedConfig::default(),
            containerd: ContainerdConfig::default(),
            docker: DockerConfig::default(),
            etcd: EtcdConfig::default(),
            helm: HelmConfig::default(),
            kubernetes: KubernetesConfig::default(),
            custom_repos: Vec::new(),
            paths: PathsConfig::default(),
        }
    }
}

fn default_packages() -> Vec<String> {
    ["sshpass", "ca-certificates", "curl", "wget", "bash-completion", "net-tools"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

impl KubesmithConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `kubesmith.toml` in the current directory (if present)
    /// 3. Environment variables with `KUBESMITH_` prefix
    pub fn load() -> OrchestratorResult<Self> {
        Self::extract(Figment::new().merge(Toml::file("kubesmith.toml")))
    }

    /// Load configuration from a specific file.
    ///
    /// Files ending in `.yaml` or `.yml` are read as YAML, anything else as TOML.
    pub fn from_file(path: impl AsRef<Path>) -> OrchestratorResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(OrchestratorError::config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Figment::new().merge(Yaml::file(path)),
            _ => Figment::new().merge(Toml::file(path)),
        };
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> OrchestratorResult<Self> {
        figment
            .merge(Env::prefixed("KUBESMITH_").split("__"))
            .extract()
            .map_err(|e| OrchestratorError::Config(e.to_string()))
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> OrchestratorResult<()> {
        if !self.nodes.iter().any(|n| n.role == Role::Master) {
            return Err(OrchestratorError::config("at least one master node is required"));
        }

        let mut hostnames = HashSet::new();
        let mut addresses = HashSet::new();
        for node in &self.nodes {
            if node.hostname.trim().is_empty() {
                return Err(OrchestratorError::config(format!(
                    "node {} has no hostname",
                    node.ip
                )));
            }
            if !hostnames.insert(node.hostname.as_str()) {
                return Err(OrchestratorError::config(format!(
                    "duplicate hostname: {}",
                    node.hostname
                )));
            }
            if !addresses.insert(node.ip) {
                return Err(OrchestratorError::config(format!(
                    "duplicate node address: {}",
                    node.ip
                )));
            }
        }

        if self.keepalived.enabled && self.keepalived.virtual_ip.is_none() {
            return Err(OrchestratorError::config(
                "keepalived is enabled but no virtual_ip is set",
            ));
        }

        self.versions.resolve()?;
        Ok(())
    }

    /// Find a node by hostname.
    #[must_use]
    pub fn node(&self, hostname: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.hostname == hostname)
    }
}

// =============================================================================
// Versions
// =============================================================================

/// Requested component versions.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionsConfig {
    /// Exact Kubernetes version, e.g. `1.30.1`.
    #[serde(default = "default_kubernetes_version")]
    pub kubernetes: String,

    /// etcd release.
    #[serde(default = "default_etcd_version")]
    pub etcd: String,

    /// helm release.
    #[serde(default = "default_helm_version")]
    pub helm: String,

    /// Calico release, or `auto` to follow the compatibility table.
    #[serde(default = "default_auto")]
    pub calico: String,

    /// containerd.io package version prefix, or `auto` for the latest.
    #[serde(default = "default_auto")]
    pub containerd: String,

    /// docker-ce package version prefix.
    #[serde(default = "default_docker_version")]
    pub docker: String,
}

fn default_kubernetes_version() -> String {
    "1.30.1".to_owned()
}

fn default_etcd_version() -> String {
    "3.5.14".to_owned()
}

fn default_helm_version() -> String {
    "3.15.1".to_owned()
}

fn default_docker_version() -> String {
    "20.10.24".to_owned()
}

fn default_auto() -> String {
    AUTO.to_owned()
}

impl Default for VersionsConfig {
    fn default() -> Self {
        Self {
            kubernetes: default_kubernetes_version(),
            etcd: default_etcd_version(),
            helm: default_helm_version(),
            calico: default_auto(),
            containerd: default_auto(),
            docker: default_docker_version(),
        }
    }
}

/// Versions after validation and `auto` resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersions {
    /// Kubernetes.
    pub kubernetes: Version,
    /// etcd.
    pub etcd: String,
    /// helm.
    pub helm: String,
    /// Calico.
    pub calico: String,
    /// containerd.io prefix; `None` installs whatever is current.
    pub containerd: Option<String>,
    /// docker-ce prefix.
    pub docker: String,
}

impl ResolvedVersions {
    /// `major.minor` of the Kubernetes version, used for repository paths.
    #[must_use]
    pub fn kubernetes_minor(&self) -> String {
        format!("{}.{}", self.kubernetes.major, self.kubernetes.minor)
    }

    /// Whether the kubelet talks to Docker through dockershim.
    #[must_use]
    pub fn dockershim(&self) -> bool {
        self.kubernetes < DOCKERSHIM_REMOVED
    }
}

impl VersionsConfig {
    /// Validate the requested versions and resolve `auto` values.
    pub fn resolve(&self) -> OrchestratorResult<ResolvedVersions> {
        let kubernetes = Version::parse(self.kubernetes.trim()).map_err(|_| {
            OrchestratorError::config(format!(
                "Kubernetes version must be exact, e.g. 1.30.1 (got \"{}\")",
                self.kubernetes
            ))
        })?;
        if kubernetes < MIN_KUBERNETES {
            return Err(OrchestratorError::config(format!(
                "minimum supported Kubernetes version is {MIN_KUBERNETES}"
            )));
        }

        let helm = lenient(&self.helm)?;
        if helm < MIN_HELM {
            return Err(OrchestratorError::config(format!(
                "minimum supported helm version is {MIN_HELM}"
            )));
        }

        let calico = if self.calico == AUTO {
            calico_for(&kubernetes).to_owned()
        } else {
            self.calico.clone()
        };
        let containerd = (self.containerd != AUTO).then(|| self.containerd.clone());

        Ok(ResolvedVersions {
            kubernetes,
            etcd: self.etcd.clone(),
            helm: self.helm.clone(),
            calico,
            containerd,
            docker: self.docker.trim().to_owned(),
        })
    }
}

fn lenient(raw: &str) -> OrchestratorResult<Version> {
    kubesmith_packages::version::lenient(raw).map_err(|e| OrchestratorError::config(e.to_string()))
}

/// Newest Calico release known to work with `kubernetes`.
#[must_use]
pub fn calico_for(kubernetes: &Version) -> &'static str {
    const TABLE: [(u64, &str); 8] = [
        (27, "3.27.2"),
        (24, "3.26.4"),
        (23, "3.25.2"),
        (22, "3.24.6"),
        (21, "3.23"),
        (20, "3.21"),
        (19, "3.20"),
        (18, "3.18"),
    ];
    if kubernetes.major > 1 {
        return TABLE[0].1;
    }
    TABLE
        .iter()
        .find(|(minor, _)| kubernetes.minor >= *minor)
        .map_or("3.17", |(_, calico)| calico)
}

// =============================================================================
// Nodes
// =============================================================================

/// A node entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Hostname the node is registered under.
    pub hostname: String,

    /// Address reachable over SSH.
    pub ip: IpAddr,

    /// Master or worker.
    pub role: Role,

    /// Network interface keepalived binds to.
    #[serde(default = "default_interface")]
    pub interface: String,

    /// SSH user from the plan.
    #[serde(default)]
    pub ssh_user: Option<String>,

    /// SSH password from the plan.
    #[serde(default)]
    pub ssh_password: Option<String>,

    /// SSH private key path from the plan.
    #[serde(default)]
    pub ssh_private_key: Option<String>,
}

fn default_interface() -> String {
    "eth0".to_owned()
}

impl NodeConfig {
    /// The plan credential, if the entry carries a complete one.
    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        let key = self
            .ssh_private_key
            .as_deref()
            .map(|k| shellexpand::tilde(k).into_owned());
        Credential::from_parts(
            self.ssh_user.as_deref(),
            self.ssh_password.as_deref(),
            key.as_deref(),
        )
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Node preparation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// Switch SELinux to permissive on RPM distributions.
    #[serde(default = "default_true")]
    pub selinux_permissive: bool,

    /// `fs.inotify.max_user_watches` applied on every node.
    #[serde(default = "default_max_user_watches")]
    pub inotify_max_user_watches: u64,
}

const fn default_true() -> bool {
    true
}

const fn default_max_user_watches() -> u64 {
    1_048_576
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            selinux_permissive: default_true(),
            inotify_max_user_watches: default_max_user_watches(),
        }
    }
}

/// keepalived configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KeepalivedConfig {
    /// Run keepalived on the masters.
    #[serde(default)]
    pub enabled: bool,

    /// Virtual IP fronting the API servers.
    #[serde(default)]
    pub virtual_ip: Option<IpAddr>,

    /// VRRP router id.
    #[serde(default = "default_virtual_router_id")]
    pub virtual_router_id: u8,

    /// VRRP priority.
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// VRRP password; keepalived uses the first eight characters.
    #[serde(default = "default_auth_pass")]
    pub auth_pass: String,
}

const fn default_virtual_router_id() -> u8 {
    51
}

const fn default_priority() -> u8 {
    100
}

fn default_auth_pass() -> String {
    "k8s-vrrp".to_owned()
}

impl Default for KeepalivedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            virtual_ip: None,
            virtual_router_id: default_virtual_router_id(),
            priority: default_priority(),
            auth_pass: default_auth_pass(),
        }
    }
}

impl KeepalivedConfig {
    /// The virtual IP when keepalived is enabled.
    #[must_use]
    pub fn active_virtual_ip(&self) -> Option<IpAddr> {
        self.virtual_ip.filter(|_| self.enabled)
    }
}

/// containerd configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerdConfig {
    /// Repository providing `containerd.io`.
    #[serde(default = "default_docker_repo")]
    pub repo: RepoConfig,

    /// Sandbox image below the Kubernetes image registry.
    #[serde(default = "default_sandbox_image")]
    pub sandbox_image: String,

    /// Registries reached over plain HTTP.
    #[serde(default)]
    pub insecure_registries: Vec<String>,

    /// Runtime exec options; `native.cgroupdriver=` selects the kubelet cgroup driver.
    #[serde(default = "default_exec_opts")]
    pub exec_opts: Vec<String>,
}

fn default_sandbox_image() -> String {
    "pause:3.9".to_owned()
}

fn default_exec_opts() -> Vec<String> {
    vec!["native.cgroupdriver=systemd".to_owned()]
}

impl Default for ContainerdConfig {
    fn default() -> Self {
        Self {
            repo: default_docker_repo(),
            sandbox_image: default_sandbox_image(),
            insecure_registries: Vec::new(),
            exec_opts: default_exec_opts(),
        }
    }
}

impl ContainerdConfig {
    /// Cgroup driver named in the exec options, `systemd` if none is.
    #[must_use]
    pub fn cgroup_driver(&self) -> &str {
        self.exec_opts
            .iter()
            .rev()
            .find_map(|opt| opt.strip_prefix("native.cgroupdriver="))
            .unwrap_or("systemd")
    }
}

/// Docker engine configuration.
///
/// Docker is installed when `enabled` is set or when the Kubernetes version
/// still relies on dockershim. `/etc/docker/daemon.json` is built from these
/// fields plus the containerd exec options and insecure registries.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    /// Install Docker even when Kubernetes does not need it.
    #[serde(default)]
    pub enabled: bool,

    /// Remove every Docker and containerd package and their data first.
    #[serde(default)]
    pub prune: bool,

    /// Container log driver.
    #[serde(default = "default_log_driver")]
    pub log_driver: String,

    /// Rotated log files kept per container.
    #[serde(default = "default_log_max_file")]
    pub log_max_file: String,

    /// Size at which a container log is rotated.
    #[serde(default = "default_log_max_size")]
    pub log_max_size: String,

    /// Storage driver.
    #[serde(default = "default_storage_driver")]
    pub storage_driver: String,

    /// Registry mirrors.
    #[serde(default)]
    pub registry_mirrors: Vec<String>,
}

fn default_log_driver() -> String {
    "json-file".to_owned()
}

fn default_log_max_file() -> String {
    "3".to_owned()
}

fn default_log_max_size() -> String {
    "100m".to_owned()
}

fn default_storage_driver() -> String {
    "overlay2".to_owned()
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prune: false,
            log_driver: default_log_driver(),
            log_max_file: default_log_max_file(),
            log_max_size: default_log_max_size(),
            storage_driver: default_storage_driver(),
            registry_mirrors: Vec::new(),
        }
    }
}

/// etcd download configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EtcdConfig {
    /// Archive URL; `{version}` is replaced.
    #[serde(default = "default_etcd_url")]
    pub download_url: String,
}

fn default_etcd_url() -> String {
    "https://github.com/etcd-io/etcd/releases/download/v{version}/etcd-v{version}-linux-amd64.tar.gz"
        .to_owned()
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            download_url: default_etcd_url(),
        }
    }
}

/// helm download configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HelmConfig {
    /// Archive URL; `{version}` is replaced.
    #[serde(default = "default_helm_url")]
    pub download_url: String,
}

fn default_helm_url() -> String {
    "https://get.helm.sh/helm-v{version}-linux-amd64.tar.gz".to_owned()
}

impl Default for HelmConfig {
    fn default() -> Self {
        Self {
            download_url: default_helm_url(),
        }
    }
}

/// Kubernetes configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesConfig {
    /// Install kubectl bash completion.
    #[serde(default = "default_true")]
    pub bash_completion: bool,

    /// Repository providing kubelet, kubectl and kubeadm.
    #[serde(default = "default_kubernetes_repo")]
    pub repo: RepoConfig,

    /// Image registry for control plane images.
    #[serde(default = "default_image_registry")]
    pub image_registry: String,

    /// Pod network CIDR.
    #[serde(default = "default_pod_subnet")]
    pub pod_subnet: String,

    /// Remove the control-plane taints so workloads run on masters.
    #[serde(default)]
    pub schedule_pods_on_masters: bool,

    /// Calico overlay settings.
    #[serde(default)]
    pub calico: CalicoConfig,
}

fn default_image_registry() -> String {
    DEFAULT_IMAGE_REGISTRY.to_owned()
}

fn default_pod_subnet() -> String {
    "192.168.0.0/16".to_owned()
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            bash_completion: default_true(),
            repo: default_kubernetes_repo(),
            image_registry: default_image_registry(),
            pod_subnet: default_pod_subnet(),
            schedule_pods_on_masters: false,
            calico: CalicoConfig::default(),
        }
    }
}

impl KubernetesConfig {
    /// Returns true when images come from somewhere other than the default registry.
    #[must_use]
    pub fn custom_registry(&self) -> bool {
        self.image_registry != DEFAULT_IMAGE_REGISTRY
    }
}

/// Calico configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalicoConfig {
    /// Manifest URL; `{version}` is replaced. Defaults to the upstream manifest.
    #[serde(default)]
    pub url: Option<String>,

    /// `KEY=value` pairs set on the `calico-node` daemonset.
    #[serde(default)]
    pub env_vars: Vec<String>,
}

impl CalicoConfig {
    /// Manifest URL for `version`.
    pub fn manifest_url(&self, version: &str) -> OrchestratorResult<String> {
        let template = match &self.url {
            Some(url) => url.clone(),
            // Releases after 3.23 moved out of the docs archive.
            None if lenient(version)? > Version::new(3, 23, 0) => {
                "https://raw.githubusercontent.com/projectcalico/calico/v{version}/manifests/calico.yaml"
                    .to_owned()
            }
            None => "https://docs.projectcalico.org/archive/v{version}/manifests/calico.yaml".to_owned(),
        };
        Ok(template.replace("{version}", version))
    }
}

/// Local paths.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Encrypted SSH credential store.
    #[serde(default = "default_credential_store")]
    pub credential_store: String,
}

fn default_credential_store() -> String {
    DEFAULT_STORE_PATH.to_owned()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            credential_store: default_credential_store(),
        }
    }
}

// =============================================================================
// Repositories
// =============================================================================

/// Repository location for one package format.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoSource {
    /// Repository address; `{version}` is replaced with the Kubernetes minor.
    pub address: String,

    /// Signing key URL.
    #[serde(default)]
    pub key: Option<String>,
}

/// A repository with apt and RPM locations.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    /// Register the repository.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Display name.
    pub name: String,

    /// Location for apt nodes.
    pub apt: RepoSource,

    /// Location for yum and dnf nodes.
    pub rpm: RepoSource,
}

impl RepoConfig {
    /// The repository to register on a node of `dialect`.
    ///
    /// Versioned addresses get a versioned file name so repositories for
    /// different minors never overwrite each other.
    #[must_use]
    pub fn repository(&self, dialect: Dialect, version: &str) -> Repository {
        let source = if dialect.is_rpm() { &self.rpm } else { &self.apt };
        let short_name = short_name(&self.name);
        let file_name = if source.address.contains("{version}") {
            format!("{short_name}-{version}")
        } else {
            short_name.clone()
        };
        Repository {
            name: self.name.clone(),
            short_name,
            file_name,
            address: source.address.replace("{version}", version),
            gpg_key_url: source.key.as_ref().map(|k| k.replace("{version}", version)),
        }
    }
}

fn short_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "")
}

fn default_kubernetes_repo() -> RepoConfig {
    RepoConfig {
        enabled: true,
        name: "Kubernetes".to_owned(),
        apt: RepoSource {
            address: "https://pkgs.k8s.io/core:/stable:/v{version}/deb/ /".to_owned(),
            key: Some("https://pkgs.k8s.io/core:/stable:/v{version}/deb/Release.key".to_owned()),
        },
        rpm: RepoSource {
            address: "https://pkgs.k8s.io/core:/stable:/v{version}/rpm/".to_owned(),
            key: Some(
                "https://pkgs.k8s.io/core:/stable:/v{version}/rpm/repodata/repomd.xml.key"
                    .to_owned(),
            ),
        },
    }
}

fn default_docker_repo() -> RepoConfig {
    RepoConfig {
        enabled: true,
        name: "Docker".to_owned(),
        apt: RepoSource {
            address: "https://download.docker.com/linux/ubuntu $(lsb_release -cs) stable"
                .to_owned(),
            key: Some("https://download.docker.com/linux/ubuntu/gpg".to_owned()),
        },
        rpm: RepoSource {
            address: "https://download.docker.com/linux/centos/$releasever/$basearch/stable"
                .to_owned(),
            key: Some("https://download.docker.com/linux/centos/gpg".to_owned()),
        },
    }
}

/// A user supplied repository, registered as given on every node.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomRepo {
    /// Register the repository.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Display name.
    pub name: String,

    /// Repository address.
    pub address: String,

    /// Signing key URL.
    #[serde(default)]
    pub key: Option<String>,
}

impl CustomRepo {
    /// The repository to register.
    #[must_use]
    pub fn repository(&self) -> Repository {
        let short_name = short_name(&self.name);
        Repository {
            name: self.name.clone(),
            file_name: short_name.clone(),
            short_name,
            address: self.address.clone(),
            gpg_key_url: self.key.clone(),
        }
    }

    /// The first `http(s)` URL in the address.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.address
            .split_whitespace()
            .find(|field| field.starts_with("http"))
    }
}
