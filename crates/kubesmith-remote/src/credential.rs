//! SSH credentials and where they came from.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

use crate::error::{RemoteError, RemoteResult};

/// Secret half of a credential.
#[derive(Clone)]
pub enum Secret {
    /// Password authentication.
    Password(SecretString),
    /// Public key authentication using a private key file.
    PrivateKey(PathBuf),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password([REDACTED])"),
            Self::PrivateKey(path) => f.debug_tuple("PrivateKey").field(path).finish(),
        }
    }
}

/// A user plus the secret used to log in as that user.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Login user.
    pub user: String,
    /// Password or key path.
    pub secret: Secret,
}

impl Credential {
    /// Create a password credential.
    #[must_use]
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: Secret::Password(SecretString::from(password.into())),
        }
    }

    /// Create a private key credential.
    #[must_use]
    pub fn private_key(user: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            secret: Secret::PrivateKey(path.into()),
        }
    }

    /// The password, if this is a password credential.
    #[must_use]
    pub fn password_str(&self) -> Option<&str> {
        match &self.secret {
            Secret::Password(pw) => Some(pw.expose_secret()),
            Secret::PrivateKey(_) => None,
        }
    }

    /// Build a credential from optional plan fields.
    ///
    /// Returns `None` unless a user and one of password or key path are present.
    /// A password wins over a key path when both are given.
    #[must_use]
    pub fn from_parts(
        user: Option<&str>,
        password: Option<&str>,
        private_key: Option<&str>,
    ) -> Option<Self> {
        let user = user.filter(|u| !u.is_empty())?;
        match (
            password.filter(|p| !p.is_empty()),
            private_key.filter(|k| !k.is_empty()),
        ) {
            (Some(pw), _) => Some(Self::password(user, pw)),
            (None, Some(key)) => Some(Self::private_key(user, key)),
            (None, None) => None,
        }
    }
}

/// Where a credential was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Encrypted on-disk cache.
    Cached,
    /// Deployment plan.
    Plan,
    /// Interactive entry.
    Prompt,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cached => "cached",
            Self::Plan => "plan",
            Self::Prompt => "prompt",
        })
    }
}

/// Parse an `ip:user:password,ip:user:password` auth map.
pub fn parse_auth_map(raw: &str) -> RemoteResult<Vec<(IpAddr, Credential)>> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.trim().splitn(3, ':').collect();
            let [ip, user, password] = parts.as_slice() else {
                return Err(RemoteError::store(format!("auth data invalid: {entry}")));
            };
            let ip: IpAddr = ip
                .parse()
                .map_err(|_| RemoteError::store(format!("auth data invalid address: {ip}")))?;
            if user.is_empty() || password.is_empty() {
                return Err(RemoteError::store(format!("auth data invalid: {entry}")));
            }
            Ok((ip, Credential::password(*user, *password)))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn password_is_redacted_in_debug() {
        let cred = Credential::password("ops", "hunter2");
        let debug = format!("{cred:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn from_parts_prefers_password() {
        let cred = Credential::from_parts(Some("ops"), Some("pw"), Some("/k")).unwrap();
        assert_eq!(cred.password_str(), Some("pw"));

        let cred = Credential::from_parts(Some("ops"), Some(""), Some("/k")).unwrap();
        assert!(matches!(cred.secret, Secret::PrivateKey(_)));

        assert!(Credential::from_parts(Some("ops"), None, None).is_none());
        assert!(Credential::from_parts(None, Some("pw"), None).is_none());
    }

    #[test]
    fn auth_map_parses_entries() {
        let entries = parse_auth_map("10.0.0.1:ops:pw1,10.0.0.2:root:p:w").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(entries[1].1.user, "root");
        assert_eq!(entries[1].1.password_str(), Some("p:w"));
    }

    #[test]
    fn auth_map_rejects_malformed_entries() {
        assert!(parse_auth_map("10.0.0.1:ops").is_err());
        assert!(parse_auth_map("nothost:ops:pw").is_err());
        assert!(parse_auth_map("").unwrap().is_empty());
    }
}
