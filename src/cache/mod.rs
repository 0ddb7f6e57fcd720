//! In-memory cache of query results.
//!
//! - `CacheEntry` holds the data, status and timestamps of one key
//! - `CacheStore` is the process-wide map all coordinators share
//! - `CacheResult` tells a reader whether data came from the network or from
//!   a fresh or stale cache entry

mod entry;
mod store;

pub use entry::{CacheEntry, CacheResult, CacheSource, Data, EntryPatch, QueryStatus, RequestId};
pub use store::CacheStore;

pub(crate) use entry::{EntrySnapshot, PatchId, PatchRecord};
