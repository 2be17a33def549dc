//! Two-tier cache storage.
//!
//! The memory tier is a bounded LRU shared by every view in the process. The persistent
//! tier keeps the last-known first page of each view across restarts. Reads go memory
//! first and fall through to disk; a disk hit re-populates memory.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::lock::lock;
use crate::remote::Record;

use super::config::CacheConfig;
use super::keys::QueryKey;
use super::tier::{FileTier, PersistentTier};

const SOURCE: &str = "cache::store";

const METRIC_MEMORY_HIT: &str = "biztrack_cache_memory_hit_total";
const METRIC_MEMORY_MISS: &str = "biztrack_cache_memory_miss_total";
const METRIC_PERSISTENT_HIT: &str = "biztrack_cache_persistent_hit_total";
const METRIC_EVICT: &str = "biztrack_cache_evict_total";
const METRIC_PERSISTENT_ERROR: &str = "biztrack_cache_persistent_error_total";

/// Last-known first page of a view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: QueryKey,
    pub data: Vec<Record>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_capacity: usize,
    /// `None` when the store runs memory-only.
    pub persistent_entries: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Cleared {
    pub memory: usize,
    pub persistent: usize,
}

pub struct CacheStore {
    memory: Mutex<LruCache<QueryKey, CacheEntry>>,
    capacity: usize,
    persistent: Option<Arc<dyn PersistentTier>>,
    max_age: Option<Duration>,
}

impl CacheStore {
    /// Build a store from configuration, probing the persistent tier once.
    ///
    /// An unusable persistent directory degrades the store to memory-only for its
    /// whole lifetime.
    pub async fn open(config: &CacheConfig) -> Self {
        let persistent = match &config.persistent_dir {
            None => {
                info!(
                    target = "biztrack::cache",
                    "Persistent cache tier disabled; running memory-only"
                );
                None
            }
            Some(dir) => match FileTier::probe(dir).await {
                Ok(tier) => {
                    debug!(
                        target = "biztrack::cache",
                        dir = %tier.dir().display(),
                        "Persistent cache tier ready"
                    );
                    Some(Arc::new(tier) as Arc<dyn PersistentTier>)
                }
                Err(err) => {
                    counter!(METRIC_PERSISTENT_ERROR).increment(1);
                    warn!(
                        target = "biztrack::cache",
                        dir = %dir.display(),
                        error = %err,
                        "Persistent cache tier unavailable; running memory-only"
                    );
                    None
                }
            },
        };
        Self::build(config, persistent)
    }

    pub fn memory_only(config: &CacheConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_persistent(config: &CacheConfig, tier: Arc<dyn PersistentTier>) -> Self {
        Self::build(config, Some(tier))
    }

    fn build(config: &CacheConfig, persistent: Option<Arc<dyn PersistentTier>>) -> Self {
        let capacity = config.memory_capacity_non_zero();
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            capacity: capacity.get(),
            persistent,
            max_age: config.max_age,
        }
    }

    pub fn has_persistent_tier(&self) -> bool {
        self.persistent.is_some()
    }

    /// Store a fresh entry for `key`, stamped now.
    pub async fn set(
        &self,
        key: QueryKey,
        data: Vec<Record>,
        owner_id: &str,
        metadata: Option<Value>,
    ) {
        let entry = CacheEntry {
            key,
            data,
            timestamp: OffsetDateTime::now_utc(),
            owner_id: owner_id.to_string(),
            metadata,
        };
        self.restore(entry).await;
    }

    /// Write `entry` back verbatim, timestamp included.
    pub async fn restore(&self, entry: CacheEntry) {
        self.put_memory(entry.clone());

        if let Some(tier) = &self.persistent
            && let Err(err) = tier.write(&entry).await
        {
            counter!(METRIC_PERSISTENT_ERROR).increment(1);
            warn!(
                target = "biztrack::cache",
                key = %entry.key,
                error = %err,
                "Persistent cache write failed"
            );
        }
    }

    pub async fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        {
            let mut memory = lock(&self.memory, SOURCE, "get");
            match memory.get(key).cloned() {
                Some(entry) if self.is_fresh(&entry) => {
                    counter!(METRIC_MEMORY_HIT).increment(1);
                    return Some(entry);
                }
                Some(_) => {
                    memory.pop(key);
                    debug!(target = "biztrack::cache", key = %key, "Dropped stale cache entry");
                }
                None => {}
            }
        }
        counter!(METRIC_MEMORY_MISS).increment(1);

        let tier = self.persistent.as_ref()?;
        match tier.read(key).await {
            Ok(Some(entry)) if self.is_fresh(&entry) => {
                counter!(METRIC_PERSISTENT_HIT).increment(1);
                self.put_memory(entry.clone());
                Some(entry)
            }
            Ok(_) => None,
            Err(err) => {
                counter!(METRIC_PERSISTENT_ERROR).increment(1);
                warn!(
                    target = "biztrack::cache",
                    key = %key,
                    error = %err,
                    "Persistent cache read failed"
                );
                None
            }
        }
    }

    /// Remove every entry owned by `owner_id` from both tiers.
    pub async fn clear_for_owner(&self, owner_id: &str) -> Cleared {
        let memory = {
            let mut memory = lock(&self.memory, SOURCE, "clear_for_owner");
            let owned: Vec<QueryKey> = memory
                .iter()
                .filter(|(_, entry)| entry.owner_id == owner_id)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &owned {
                memory.pop(key);
            }
            owned.len()
        };

        let persistent = match &self.persistent {
            Some(tier) => match tier.remove_owner(owner_id).await {
                Ok(removed) => removed,
                Err(err) => {
                    counter!(METRIC_PERSISTENT_ERROR).increment(1);
                    warn!(
                        target = "biztrack::cache",
                        owner_id,
                        error = %err,
                        "Persistent cache clear failed"
                    );
                    0
                }
            },
            None => 0,
        };

        info!(
            target = "biztrack::cache",
            owner_id, memory, persistent, "Cleared owner cache"
        );
        Cleared { memory, persistent }
    }

    /// Drop `key` from the memory tier only, leaving the persistent copy.
    pub fn evict_memory(&self, key: &QueryKey) -> bool {
        lock(&self.memory, SOURCE, "evict_memory")
            .pop(key)
            .is_some()
    }

    pub async fn stats(&self) -> CacheStats {
        let memory_entries = lock(&self.memory, SOURCE, "stats").len();
        let persistent_entries = match &self.persistent {
            Some(tier) => tier.len().await.ok(),
            None => None,
        };
        CacheStats {
            memory_entries,
            memory_capacity: self.capacity,
            persistent_entries,
        }
    }

    fn put_memory(&self, entry: CacheEntry) {
        let key = entry.key.clone();
        let displaced = lock(&self.memory, SOURCE, "put_memory").push(key.clone(), entry);
        if let Some((evicted, _)) = displaced
            && evicted != key
        {
            counter!(METRIC_EVICT).increment(1);
            debug!(target = "biztrack::cache", key = %evicted, "Evicted cache entry");
        }
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        self.max_age.is_none_or(|max_age| {
            let bound = time::Duration::try_from(max_age).unwrap_or(time::Duration::MAX);
            OffsetDateTime::now_utc() - entry.timestamp <= bound
        })
    }
}
