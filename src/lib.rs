//! Reactive data access for document-store backed business apps.
//!
//! Views subscribe to a filtered, ordered collection under the signed-in owner, page
//! forward with cursors and keep their first page in a two-tier cache. Writes go through
//! an optimistic mutator that stages them into the cache and rolls back on rejection.

pub mod cache;
pub mod cleanup;
pub mod config;
pub mod count;
pub mod cursor;
pub mod error;
pub mod identity;
pub mod layer;
pub mod live;
mod lock;
pub mod mutator;
pub mod notify;
pub mod org_tree;
pub mod remote;
pub mod telemetry;

pub use cache::{CacheConfig, CacheEntry, CacheStore, QueryDescriptor, QueryKey};
pub use error::{DataError, MutationKind};
pub use identity::{Identity, IdentityHandle};
pub use layer::DataLayer;
pub use live::{LiveHandle, LiveQuery, LoadMore, QueryState, ViewSpec};
pub use mutator::{EntityLabels, OptimisticMutator};
pub use remote::{MemoryRemote, Record, RemoteStore};
