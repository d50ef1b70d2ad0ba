//! Encrypted on-disk credential cache.
//!
//! The cache is a single file holding an age-encrypted YAML mapping from node
//! address to `{sshUser, sshPass, sshPrivateKeyPath}`. It is decrypted on every
//! read and re-encrypted on every write, so concurrent runs never act on a stale
//! in-memory copy. The identity is bundled with the binary.
//!
//! # Security
//!
//! - The file is created with mode `0600`
//! - Passwords are returned as [`secrecy::SecretString`] and never logged

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read as IoRead, Write as IoWrite};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credential::{Credential, Secret};
use crate::error::{RemoteError, RemoteResult};

const BUNDLED_IDENTITY: &str = include_str!("../resources/store.key");

/// Default location of the credential cache.
pub const DEFAULT_STORE_PATH: &str = "~/.kubesmith/data/ssh";

/// Storage for credentials that have authenticated successfully before.
pub trait CredentialCache: Send + Sync {
    /// Look up the cached credential for an address.
    fn get(&self, address: IpAddr) -> RemoteResult<Option<Credential>>;

    /// Insert or replace the credential for an address.
    fn put(&self, address: IpAddr, credential: &Credential) -> RemoteResult<()>;

    /// Forget the credential for an address.
    fn remove(&self, address: IpAddr) -> RemoteResult<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoredEntry {
    #[serde(rename = "sshUser", default)]
    user: String,
    #[serde(rename = "sshPass", default)]
    password: String,
    #[serde(rename = "sshPrivateKeyPath", default)]
    private_key_path: String,
}

impl StoredEntry {
    fn from_credential(credential: &Credential) -> Self {
        match &credential.secret {
            Secret::Password(_) => Self {
                user: credential.user.clone(),
                password: credential.password_str().unwrap_or_default().to_owned(),
                private_key_path: String::new(),
            },
            Secret::PrivateKey(path) => Self {
                user: credential.user.clone(),
                password: String::new(),
                private_key_path: path.display().to_string(),
            },
        }
    }

    fn to_credential(&self) -> Option<Credential> {
        Credential::from_parts(
            Some(&self.user),
            Some(&self.password),
            Some(&self.private_key_path),
        )
    }
}

type Entries = BTreeMap<String, StoredEntry>;

/// Credential cache backed by an age-encrypted YAML file.
pub struct EncryptedFileStore {
    path: PathBuf,
    identity: age::x25519::Identity,
    recipient: age::x25519::Recipient,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for EncryptedFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl EncryptedFileStore {
    /// Open the store at `path` using the bundled identity.
    ///
    /// A leading `~` is expanded to the current user's home directory. The file is
    /// created lazily on first write.
    pub fn open(path: impl AsRef<str>) -> RemoteResult<Self> {
        let identity = Self::bundled_identity()?;
        let expanded = shellexpand::tilde(path.as_ref());
        Ok(Self {
            path: PathBuf::from(expanded.as_ref()),
            recipient: identity.to_public(),
            identity,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bundled_identity() -> RemoteResult<age::x25519::Identity> {
        BUNDLED_IDENTITY
            .lines()
            .find(|line| !line.starts_with('#') && !line.trim().is_empty())
            .ok_or_else(|| RemoteError::store("bundled identity is empty"))?
            .trim()
            .parse::<age::x25519::Identity>()
            .map_err(|e| RemoteError::store(format!("invalid bundled identity: {e}")))
    }

    fn encrypt(&self, plaintext: &[u8]) -> RemoteResult<Vec<u8>> {
        let encryptor = age::Encryptor::with_recipients(vec![Box::new(self.recipient.clone())])
            .ok_or_else(|| RemoteError::Encryption("no valid encryption recipients".to_owned()))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| RemoteError::Encryption(e.to_string()))?;
        writer
            .write_all(plaintext)
            .map_err(|e| RemoteError::Encryption(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| RemoteError::Encryption(e.to_string()))?;

        Ok(encrypted)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> RemoteResult<Vec<u8>> {
        let age::Decryptor::Recipients(decryptor) =
            age::Decryptor::new(ciphertext).map_err(|e| RemoteError::Decryption(e.to_string()))?
        else {
            return Err(RemoteError::Decryption(
                "unexpected decryptor type".to_owned(),
            ));
        };

        let mut decrypted = vec![];
        let identity: &dyn age::Identity = &self.identity;
        let mut reader = decryptor
            .decrypt(std::iter::once(identity))
            .map_err(|e| RemoteError::Decryption(e.to_string()))?;
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| RemoteError::Decryption(e.to_string()))?;

        Ok(decrypted)
    }

    fn load(&self) -> RemoteResult<Entries> {
        let ciphertext = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Entries::new()),
            Err(e) => return Err(e.into()),
        };
        if ciphertext.is_empty() {
            return Ok(Entries::new());
        }

        let plaintext = self.decrypt(&ciphertext)?;
        if plaintext.iter().all(u8::is_ascii_whitespace) {
            return Ok(Entries::new());
        }
        serde_yaml::from_slice(&plaintext)
            .map_err(|e| RemoteError::store(format!("failed to parse {}: {e}", self.path.display())))
    }

    fn save(&self, entries: &Entries) -> RemoteResult<()> {
        let plaintext = serde_yaml::to_string(entries)
            .map_err(|e| RemoteError::store(format!("failed to serialise credentials: {e}")))?;
        let ciphertext = self.encrypt(plaintext.as_bytes())?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        let mut file = {
            use std::os::unix::fs::OpenOptionsExt;
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)?
        };

        #[cfg(not(unix))]
        let mut file = fs::File::create(&self.path)?;

        file.write_all(&ciphertext)?;
        Ok(())
    }
}

impl CredentialCache for EncryptedFileStore {
    fn get(&self, address: IpAddr) -> RemoteResult<Option<Credential>> {
        let entries = self.load()?;
        Ok(entries
            .get(&address.to_string())
            .and_then(StoredEntry::to_credential))
    }

    fn put(&self, address: IpAddr, credential: &Credential) -> RemoteResult<()> {
        let _guard = self.write_lock.lock();
        let mut entries = self.load()?;
        entries.insert(address.to_string(), StoredEntry::from_credential(credential));
        self.save(&entries)?;
        debug!(node = %address, user = %credential.user, "credential cached");
        Ok(())
    }

    fn remove(&self, address: IpAddr) -> RemoteResult<()> {
        let _guard = self.write_lock.lock();
        let mut entries = self.load()?;
        if entries.remove(&address.to_string()).is_some() {
            self.save(&entries)?;
            debug!(node = %address, "cached credential cleared");
        }
        Ok(())
    }
}

/// In-memory credential cache, used when caching is disabled and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<IpAddr, Credential>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached credentials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl CredentialCache for MemoryStore {
    fn get(&self, address: IpAddr) -> RemoteResult<Option<Credential>> {
        Ok(self.entries.lock().get(&address).cloned())
    }

    fn put(&self, address: IpAddr, credential: &Credential) -> RemoteResult<()> {
        self.entries.lock().insert(address, credential.clone());
        Ok(())
    }

    fn remove(&self, address: IpAddr) -> RemoteResult<()> {
        self.entries.lock().remove(&address);
        Ok(())
    }
}
