//! Persistent cache tier.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;

use super::keys::QueryKey;
use super::store::CacheEntry;

const PROBE_FILE: &str = ".probe";
const ENTRY_SUFFIX: &str = ".json";
const OWNER_PREFIX_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum TierError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt cache entry: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Slow tier behind the in-process LRU.
///
/// Failures are reported to `CacheStore`, which logs and swallows them.
#[async_trait]
pub trait PersistentTier: Send + Sync {
    async fn read(&self, key: &QueryKey) -> Result<Option<CacheEntry>, TierError>;

    async fn write(&self, entry: &CacheEntry) -> Result<(), TierError>;

    /// Remove every entry whose key belongs to `owner_id`, returning how many went.
    async fn remove_owner(&self, owner_id: &str) -> Result<usize, TierError>;

    async fn len(&self) -> Result<usize, TierError>;
}

/// One JSON file per entry, named `{owner-digest}-{key-digest}.json`.
#[derive(Debug, Clone)]
pub struct FileTier {
    dir: PathBuf,
}

impl FileTier {
    /// Create `dir` if needed and verify it is writable.
    pub async fn probe(dir: impl Into<PathBuf>) -> Result<Self, TierError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let probe = dir.join(PROBE_FILE);
        fs::write(&probe, b"ok").await?;
        fs::remove_file(&probe).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn owner_prefix(owner_id: &str) -> String {
        let mut digest = hex::encode(Sha256::digest(owner_id.as_bytes()));
        digest.truncate(OWNER_PREFIX_LEN);
        digest
    }

    fn path_for(&self, key: &QueryKey) -> PathBuf {
        let key_digest = hex::encode(Sha256::digest(key.as_str().as_bytes()));
        self.dir.join(format!(
            "{}-{key_digest}{ENTRY_SUFFIX}",
            Self::owner_prefix(&key.owner_id())
        ))
    }

    async fn entry_names(&self) -> Result<Vec<String>, TierError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            if let Some(name) = item.file_name().to_str()
                && name.ends_with(ENTRY_SUFFIX)
            {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl PersistentTier for FileTier {
    async fn read(&self, key: &QueryKey) -> Result<Option<CacheEntry>, TierError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => {
                let entry: CacheEntry = serde_json::from_slice(&bytes)?;
                Ok((entry.key == *key).then_some(entry))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, entry: &CacheEntry) -> Result<(), TierError> {
        let path = self.path_for(&entry.key);
        let staging = path.with_extension("tmp");
        let bytes = serde_json::to_vec(entry)?;
        fs::write(&staging, bytes).await?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn remove_owner(&self, owner_id: &str) -> Result<usize, TierError> {
        let prefix = format!("{}-", Self::owner_prefix(owner_id));
        let mut removed = 0;
        for name in self.entry_names().await? {
            if name.starts_with(&prefix) {
                match fs::remove_file(self.dir.join(&name)).await {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(removed)
    }

    async fn len(&self) -> Result<usize, TierError> {
        Ok(self.entry_names().await?.len())
    }
}
