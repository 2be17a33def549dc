//! Cache configuration.
//!
//! Controls the in-process tier bound, the on-disk tier location and the optional
//! entry age bound via `biztrack.toml`.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MEMORY_CAPACITY: usize = 256;
const DEFAULT_PERSISTENT_DIR: &str = ".biztrack-cache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum entries kept in the in-process LRU tier.
    pub memory_capacity: usize,
    /// Directory of the persistent tier. `None` runs memory-only.
    pub persistent_dir: Option<PathBuf>,
    /// Entries older than this are treated as misses.
    pub max_age: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            persistent_dir: Some(PathBuf::from(DEFAULT_PERSISTENT_DIR)),
            max_age: None,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            memory_capacity: settings.memory_capacity.get(),
            persistent_dir: settings
                .enable_persistent
                .then(|| settings.persistent_dir.clone()),
            max_age: settings
                .max_age_seconds
                .map(|secs| Duration::from_secs(secs.get())),
        }
    }
}

impl CacheConfig {
    /// Memory-only configuration with the given capacity.
    pub fn memory_only(memory_capacity: usize) -> Self {
        Self {
            memory_capacity,
            persistent_dir: None,
            max_age: None,
        }
    }

    /// Returns the memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}
