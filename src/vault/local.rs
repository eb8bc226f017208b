//! Filesystem vault backend
//!
//! Each key maps to a directory below the base directory, one level per
//! segment, and its blob lives in a [`BLOB_FILE`] inside it. Key
//! segments never start with `.`, so a blob never collides with the
//! directory of a longer key and `a/b` can coexist with `a/b/c`.
//!
//! Directories are created owner-only (0700) and blobs are written
//! owner-only (0600) through a staging file that is renamed into place,
//! so a reader never sees a half-written blob.

use super::{VaultKey, VaultStorage};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Name of the file holding a key's blob inside the key's directory.
pub const BLOB_FILE: &str = ".blob";

#[cfg(unix)]
const DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Vault stored as plain files under one directory.
#[derive(Debug, Clone)]
pub struct LocalVault {
    root: PathBuf,
}

impl LocalVault {
    /// Use `root` as the vault directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        create_dirs(&root).await?;
        debug!("Local vault at {}", root.display());
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, key: &VaultKey) -> PathBuf {
        key.segments().fold(self.root.clone(), |path, s| path.join(s))
    }

    /// Where the blob for `key` is stored.
    #[must_use]
    pub fn blob_path(&self, key: &VaultKey) -> PathBuf {
        self.dir_for(key).join(BLOB_FILE)
    }

    /// Remove directories left empty below the root, innermost first.
    async fn prune(&self, mut dir: PathBuf) {
        while dir != self.root && dir.starts_with(&self.root) {
            if fs::remove_dir(&dir).await.is_err() {
                break;
            }
            if !dir.pop() {
                break;
            }
        }
    }
}

async fn create_dirs(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder
        .create(path)
        .await
        .map_err(|e| Error::Storage(format!("create {}: {e}", path.display())))
}

async fn write_staged(staging: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(FILE_MODE);
    let mut file = options.open(staging).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

#[async_trait]
impl VaultStorage for LocalVault {
    async fn put(&self, key: &VaultKey, data: &[u8]) -> Result<()> {
        let dir = self.dir_for(key);
        create_dirs(&dir).await?;

        let staging = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let written = match write_staged(&staging, data).await {
            Ok(()) => fs::rename(&staging, dir.join(BLOB_FILE)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = fs::remove_file(&staging).await;
            return Err(Error::Storage(format!("write {key}: {e}")));
        }
        debug!("Stored {} bytes under {}", data.len(), key);
        Ok(())
    }

    async fn get(&self, key: &VaultKey) -> Result<Vec<u8>> {
        match fs::read(self.blob_path(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(key.to_string())),
            Err(e) => Err(Error::Storage(format!("read {key}: {e}"))),
        }
    }

    async fn delete(&self, key: &VaultKey) -> Result<()> {
        match fs::remove_file(self.blob_path(key)).await {
            Ok(()) => {
                self.prune(self.dir_for(key)).await;
                debug!("Deleted {}", key);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("delete {key}: {e}"))),
        }
    }

    async fn list(&self, prefix: Option<&VaultKey>) -> Result<BTreeSet<VaultKey>> {
        let start = prefix.map_or_else(|| self.root.clone(), |p| self.dir_for(p));
        let mut keys = BTreeSet::new();

        match fs::metadata(&start).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(keys),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(Error::Storage(format!("list {}: {e}", start.display()))),
        }

        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| Error::Storage(format!("list {}: {e}", dir.display())))?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file()
                    && entry.file_name() == BLOB_FILE
                    && let Some(key) = self.key_for(&dir)
                {
                    keys.insert(key);
                }
            }
        }
        Ok(keys)
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

impl LocalVault {
    /// Map a key directory back to its key. Names that are not valid
    /// keys are skipped.
    fn key_for(&self, dir: &Path) -> Option<VaultKey> {
        let relative = dir.strip_prefix(&self.root).ok()?;
        let segments: Option<Vec<&str>> = relative.iter().map(|s| s.to_str()).collect();
        VaultKey::parse(&segments?.join("/")).ok()
    }
}
