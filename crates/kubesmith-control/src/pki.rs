//! Private certificate authority for the etcd cluster.
//!
//! One CA and one leaf certificate are issued per run. The leaf is used as
//! server, peer and client certificate by every etcd member and by the API
//! servers, so its SANs cover every master.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use kubesmith_remote::Shell;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use time::OffsetDateTime;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::plan::Node;

/// Directory the PKI files live in on masters.
pub const PKI_DIR: &str = "/etc/etcd/pki";

/// CA certificate path.
pub const CA_CERT_PATH: &str = "/etc/etcd/pki/ca.pem";

/// CA key path.
pub const CA_KEY_PATH: &str = "/etc/etcd/pki/ca-key.pem";

/// etcd certificate path.
pub const ETCD_CERT_PATH: &str = "/etc/etcd/pki/etcd.pem";

/// etcd key path.
pub const ETCD_KEY_PATH: &str = "/etc/etcd/pki/etcd-key.pem";

/// Validity of the CA and every certificate it signs.
pub const VALIDITY_HOURS: i64 = 87_000;

/// What a signed certificate may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    /// `digitalSignature`.
    DigitalSignature,
    /// `keyEncipherment`.
    KeyEncipherment,
    /// TLS server authentication.
    ServerAuth,
    /// TLS client authentication.
    ClientAuth,
}

/// Named set of usages and an expiry applied when signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningProfile {
    /// Profile name.
    pub name: &'static str,
    /// Allowed usages.
    pub usages: Vec<Usage>,
    /// Validity in hours.
    pub expiry_hours: i64,
}

impl SigningProfile {
    /// The `kubernetes` profile: signature, key encipherment, server and client auth.
    #[must_use]
    pub fn kubernetes() -> Self {
        Self {
            name: "kubernetes",
            usages: vec![
                Usage::DigitalSignature,
                Usage::KeyEncipherment,
                Usage::ServerAuth,
                Usage::ClientAuth,
            ],
            expiry_hours: VALIDITY_HOURS,
        }
    }
}

/// A request to sign, before it reaches the signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    /// Subject common name.
    pub common_name: String,
    /// IP SANs.
    pub hosts: Vec<IpAddr>,
    /// Profile the request is signed under.
    pub profile: SigningProfile,
}

/// Hook consulted before a request is signed.
pub trait RequestValidator: Send + Sync {
    /// Reject the request by returning an error.
    fn validate(&self, request: &CertificateRequest) -> OrchestratorResult<()>;
}

/// Accepts every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl RequestValidator for AcceptAll {
    fn validate(&self, _request: &CertificateRequest) -> OrchestratorResult<()> {
        Ok(())
    }
}

/// PEM encoded CA and etcd certificates with their keys.
///
/// Key material is wiped when the bundle is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CertificateBundle {
    /// CA certificate.
    pub ca_cert: String,
    /// CA private key.
    pub ca_key: String,
    /// etcd certificate.
    pub leaf_cert: String,
    /// etcd private key.
    pub leaf_key: String,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("ca_key", &"[REDACTED]")
            .field("leaf_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl CertificateBundle {
    /// Files to write, as `(path, contents, mode)`. Keys are readable by
    /// root only.
    #[must_use]
    pub fn files(&self) -> [(&'static str, &str, u32); 4] {
        [
            (CA_CERT_PATH, self.ca_cert.as_str(), 0o644),
            (CA_KEY_PATH, self.ca_key.as_str(), 0o600),
            (ETCD_CERT_PATH, self.leaf_cert.as_str(), 0o644),
            (ETCD_KEY_PATH, self.leaf_key.as_str(), 0o600),
        ]
    }

    /// Read an existing bundle back from a master.
    pub async fn fetch(shell: &Shell, master: &Node) -> OrchestratorResult<Self> {
        let target = master.target();
        Ok(Self {
            ca_cert: shell.read_file(&target, CA_CERT_PATH).await?,
            ca_key: shell.read_file(&target, CA_KEY_PATH).await?,
            leaf_cert: shell.read_file(&target, ETCD_CERT_PATH).await?,
            leaf_key: shell.read_file(&target, ETCD_KEY_PATH).await?,
        })
    }
}

/// Issues the CA and etcd certificate.
pub struct Authority {
    validator: Box<dyn RequestValidator>,
}

impl fmt::Debug for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authority").finish_non_exhaustive()
    }
}

impl Default for Authority {
    fn default() -> Self {
        Self::new(Box::new(AcceptAll))
    }
}

impl Authority {
    /// Create an authority consulting `validator` before signing.
    #[must_use]
    pub fn new(validator: Box<dyn RequestValidator>) -> Self {
        Self { validator }
    }

    /// The request for the etcd certificate.
    #[must_use]
    pub fn etcd_request(master_ips: &[IpAddr]) -> CertificateRequest {
        let mut hosts = master_ips.to_vec();
        hosts.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
        CertificateRequest {
            common_name: "etcd".to_owned(),
            hosts,
            profile: SigningProfile::kubernetes(),
        }
    }

    /// Issue a fresh CA and etcd certificate for `master_ips`.
    pub fn issue(&self, master_ips: &[IpAddr]) -> OrchestratorResult<CertificateBundle> {
        let not_before = OffsetDateTime::now_utc();
        let not_after = not_before + time::Duration::hours(VALIDITY_HOURS);

        let ca_key = KeyPair::generate().map_err(OrchestratorError::certificate)?;
        let mut ca_params =
            CertificateParams::new(Vec::<String>::new()).map_err(OrchestratorError::certificate)?;
        ca_params.distinguished_name = common_name("kubernetes");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.not_before = not_before;
        ca_params.not_after = not_after;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(OrchestratorError::certificate)?;
        debug!("issued CA certificate");

        let request = Self::etcd_request(master_ips);
        self.validator.validate(&request)?;

        let leaf_key = KeyPair::generate().map_err(OrchestratorError::certificate)?;
        let leaf_params = leaf_params(&request, not_before)?;
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .map_err(OrchestratorError::certificate)?;
        info!(
            hosts = request.hosts.len(),
            profile = request.profile.name,
            "issued etcd certificate"
        );

        Ok(CertificateBundle {
            ca_cert: ca_cert.pem(),
            ca_key: ca_key.serialize_pem(),
            leaf_cert: leaf_cert.pem(),
            leaf_key: leaf_key.serialize_pem(),
        })
    }
}

fn common_name(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    dn
}

fn leaf_params(
    request: &CertificateRequest,
    not_before: OffsetDateTime,
) -> OrchestratorResult<CertificateParams> {
    let mut params =
        CertificateParams::new(Vec::<String>::new()).map_err(OrchestratorError::certificate)?;
    params.distinguished_name = common_name(&request.common_name);
    params.subject_alt_names = request
        .hosts
        .iter()
        .map(|ip| SanType::IpAddress(*ip))
        .collect();
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::hours(request.profile.expiry_hours);
    for usage in &request.profile.usages {
        match usage {
            Usage::DigitalSignature => params.key_usages.push(KeyUsagePurpose::DigitalSignature),
            Usage::KeyEncipherment => params.key_usages.push(KeyUsagePurpose::KeyEncipherment),
            Usage::ServerAuth => params
                .extended_key_usages
                .push(ExtendedKeyUsagePurpose::ServerAuth),
            Usage::ClientAuth => params
                .extended_key_usages
                .push(ExtendedKeyUsagePurpose::ClientAuth),
        }
    }
    Ok(params)
}

/// Write the bundle to every master. Workers and the local machine get nothing.
pub async fn distribute<'a>(
    shell: &Shell,
    bundle: &CertificateBundle,
    masters: impl IntoIterator<Item = &'a Node>,
) -> OrchestratorResult<()> {
    for master in masters {
        let target = master.target();
        info!(node = %master.ip, "distributing etcd certificates");
        for (path, contents, mode) in bundle.files() {
            shell
                .write_file_with_mode(&target, path, contents.as_bytes(), mode)
                .await?;
        }
    }
    Ok(())
}
