//! Query cache.
//!
//! Keeps the last-known first page of every live view in two tiers:
//!
//! - **Memory**: bounded LRU shared process-wide
//! - **Persistent**: JSON files on disk, optional
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! memory_capacity = 256
//! persistent_dir = ".biztrack-cache"
//! enable_persistent = true
//! # max_age_seconds = 86400
//! ```

mod config;
mod keys;
mod store;
mod tier;

pub use config::CacheConfig;
pub use keys::{QueryDescriptor, QueryKey, canonical_json};
pub use store::{CacheEntry, CacheStats, CacheStore, Cleared};
pub use tier::{FileTier, PersistentTier, TierError};
