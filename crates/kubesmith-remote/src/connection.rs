//! One authenticated connection per node address.
//!
//! [`ConnectionManager::ensure`] is the only way the rest of the system obtains a
//! session. The first call for an address probes reachability, then walks the
//! credential sources in a fixed order:
//!
//! 1. the encrypted cache,
//! 2. the credential from the deployment plan,
//! 3. an interactive prompt.
//!
//! A cached credential that is rejected is removed from the cache and the walk
//! continues. A rejected plan credential falls through to the prompt. A rejected
//! prompted credential ends the walk. The first credential that works and did not
//! come from the cache is written to it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credential::{Credential, CredentialSource};
use crate::error::{RemoteError, RemoteResult};
use crate::prompt::{prompt_credential, Prompter};
use crate::ssh::SSH_PORT;
use crate::store::CredentialCache;
use crate::transport::{Dialer, Session};

/// A live connection and the credential that opened it.
#[derive(Clone)]
pub struct Connection {
    /// Node address.
    pub address: IpAddr,
    /// Credential that authenticated.
    pub credential: Credential,
    /// Where the credential came from.
    pub source: CredentialSource,
    session: Arc<dyn Session>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("user", &self.credential.user)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// The underlying session.
    #[must_use]
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }
}

/// Owns the connection cache and consults the credential cache.
pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    cache: Arc<dyn CredentialCache>,
    prompter: Arc<dyn Prompter>,
    plan: RwLock<HashMap<IpAddr, Credential>>,
    connections: Mutex<HashMap<IpAddr, Connection>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("planned", &self.plan.read().len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager.
    #[must_use]
    pub fn new(
        dialer: Arc<dyn Dialer>,
        cache: Arc<dyn CredentialCache>,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        Self {
            dialer,
            cache,
            prompter,
            plan: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register the plan credential for an address.
    pub fn register(&self, address: IpAddr, credential: Option<Credential>) {
        let mut plan = self.plan.write();
        match credential {
            Some(c) => {
                plan.insert(address, c);
            }
            None => {
                plan.remove(&address);
            }
        }
    }

    /// Seed the credential cache, e.g. from an auth map.
    pub fn seed(&self, address: IpAddr, credential: &Credential) -> RemoteResult<()> {
        self.cache.put(address, credential)
    }

    /// Look up or create the connection for `address`.
    ///
    /// Holding the cache lock across the dial guarantees at most one
    /// connection per address even with concurrent callers.
    pub async fn ensure(&self, address: IpAddr) -> RemoteResult<Connection> {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(&address) {
            return Ok(existing.clone());
        }

        if !self.dialer.probe(address).await {
            return Err(RemoteError::Unreachable {
                address,
                port: SSH_PORT,
            });
        }

        let connection = self.authenticate(address).await?;
        info!(
            node = %address,
            user = %connection.credential.user,
            source = %connection.source,
            "SSH connection established"
        );
        connections.insert(address, connection.clone());
        Ok(connection)
    }

    /// The credential of an established connection.
    pub async fn credential(&self, address: IpAddr) -> Option<Credential> {
        self.connections
            .lock()
            .await
            .get(&address)
            .map(|c| c.credential.clone())
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Returns true if no connection is open.
    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Disconnect every cached connection.
    pub async fn close_all(&self) {
        let drained: Vec<Connection> = self
            .connections
            .lock()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in drained {
            match connection.session.close().await {
                Ok(()) => debug!(node = %connection.address, "connection closed"),
                Err(e) => warn!(node = %connection.address, error = %e, "failed to close connection"),
            }
        }
    }

    async fn authenticate(&self, address: IpAddr) -> RemoteResult<Connection> {
        if let Some(cached) = self.cache.get(address)? {
            match self.try_login(address, &cached, CredentialSource::Cached).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_auth_failure() => {
                    warn!(node = %address, user = %cached.user, "cached credential rejected");
                    self.cache.remove(address)?;
                }
                Err(e) => return Err(e),
            }
        }

        let planned = self.plan.read().get(&address).cloned();
        if let Some(planned) = planned {
            match self.try_login(address, &planned, CredentialSource::Plan).await {
                Ok(conn) => {
                    self.cache.put(address, &conn.credential)?;
                    return Ok(conn);
                }
                Err(e) if e.is_auth_failure() => {
                    warn!(node = %address, user = %planned.user, "plan credential rejected");
                }
                Err(e) => return Err(e),
            }
        }

        let prompted = prompt_credential(self.prompter.as_ref(), address)?;
        let conn = self
            .try_login(address, &prompted, CredentialSource::Prompt)
            .await?;
        self.cache.put(address, &conn.credential)?;
        Ok(conn)
    }

    async fn try_login(
        &self,
        address: IpAddr,
        credential: &Credential,
        source: CredentialSource,
    ) -> RemoteResult<Connection> {
        debug!(node = %address, user = %credential.user, source = %source, "authenticating");
        let session = self.dialer.connect(address, credential).await?;
        Ok(Connection {
            address,
            credential: credential.clone(),
            source,
            session,
        })
    }
}
