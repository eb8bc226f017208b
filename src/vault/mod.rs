//! Opaque blob storage
//!
//! Defines the trait for pluggable vault backends and the key type
//! every backend addresses blobs by. Backends never encrypt: callers
//! seal with an [`Envelope`](crate::Envelope) before `put` and open
//! after `get`.

pub mod local;
pub mod remote;
pub mod sigv4;

pub use local::LocalVault;
pub use remote::RemoteVault;

use crate::config::VaultConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Longest accepted key, in bytes (the S3 object key limit).
pub const MAX_KEY_LEN: usize = 1024;

/// A normalized, namespace-confined blob key.
///
/// Keys are `/`-separated relative paths. Empty and `.` segments are
/// dropped, so `./accounts//alice/` and `accounts/alice` are the same
/// key. Parent references, absolute paths, backslashes, control
/// characters and segments starting with `.` are rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct VaultKey(String);

impl VaultKey {
    /// Normalize and validate a raw key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] for keys that would escape the
    /// vault namespace or normalize to nothing.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidKey(format!("{raw:?}: {why}"));

        if raw.starts_with('/') {
            return Err(invalid("absolute paths are not allowed"));
        }
        if raw.contains('\\') {
            return Err(invalid("backslashes are not allowed"));
        }
        if raw.chars().any(char::is_control) {
            return Err(invalid("control characters are not allowed"));
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => return Err(invalid("parent references are not allowed")),
                s if s.starts_with('.') => {
                    return Err(invalid("segments may not start with '.'"));
                }
                s => segments.push(s),
            }
        }

        if segments.is_empty() {
            return Err(invalid("key is empty"));
        }
        let key = segments.join("/");
        if key.len() > MAX_KEY_LEN {
            return Err(invalid("key is too long"));
        }
        Ok(Self(key))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Whether this key equals `prefix` or lies below it.
    #[must_use]
    pub fn is_within(&self, prefix: &Self) -> bool {
        self.0
            .strip_prefix(prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    /// A key one level below this one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if `child` is not a valid key.
    pub fn join(&self, child: &str) -> Result<Self> {
        Self::parse(&format!("{}/{child}", self.0))
    }
}

impl fmt::Display for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VaultKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for VaultKey {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl AsRef<str> for VaultKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Uniform contract for every blob store.
#[async_trait]
pub trait VaultStorage: Send + Sync {
    /// Store `data` under `key`, replacing any previous blob.
    async fn put(&self, key: &VaultKey, data: &[u8]) -> Result<()>;

    /// Fetch the blob under `key`; [`Error::NotFound`] if absent.
    async fn get(&self, key: &VaultKey) -> Result<Vec<u8>>;

    /// Remove the blob under `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &VaultKey) -> Result<()>;

    /// Every key equal to or below `prefix` (all keys for `None`), in
    /// key order.
    async fn list(&self, prefix: Option<&VaultKey>) -> Result<BTreeSet<VaultKey>>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Build the configured backend. Called once at startup.
///
/// # Errors
///
/// Returns an error if the local directory cannot be created or the
/// HTTP client cannot be built.
pub async fn open_vault(config: &VaultConfig) -> Result<Arc<dyn VaultStorage>> {
    let vault: Arc<dyn VaultStorage> = match config {
        VaultConfig::Local { dir } => Arc::new(LocalVault::open(dir).await?),
        VaultConfig::Remote(remote) => Arc::new(RemoteVault::new(remote.clone())?),
    };
    info!("Vault backend: {}", vault.backend());
    Ok(vault)
}
