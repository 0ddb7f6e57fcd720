//! Client-side query cache for the pesantren directory.
//!
//! Reads go through a [`QueryClient`], which deduplicates concurrent fetches
//! per [`QueryKey`], serves fresh data from memory, serves stale data while
//! revalidating it in the background, and notifies every subscriber of a key
//! on each transition. Writes go through [`QueryClient::mutate`], which can
//! apply optimistic updates and rolls them back if the write fails.

pub mod cache;
pub mod client;
pub mod error;
pub mod fetcher;
pub mod key;
pub mod mutation;
pub mod options;
pub mod persist;
pub mod query;
pub mod resource;
pub mod rest;
pub mod subscription;

pub use cache::{CacheEntry, CacheResult, CacheSource, CacheStore, Data, EntryPatch, QueryStatus};
pub use client::QueryClient;
pub use error::{FetchError, KeyError, MutationError, PersistError, RollbackReport};
pub use fetcher::{shared, Fetcher, SharedFetcher};
pub use key::{KeyBuilder, KeyMatcher, Param, QueryKey};
pub use mutation::{AffectedKey, Mutation, MutationCoordinator, MutationOptions, MutationStatus, Reconcile};
pub use options::{ClientConfig, QueryOptions, ResourceConfig, RetryPolicy};
pub use persist::{NoopSnapshotStore, PersistedEntry, SnapshotStore, SqliteSnapshotStore};
pub use query::QueryCoordinator;
pub use resource::{Resource, ResourceState};
pub use rest::{Page, PaginationMeta, RestClient};
pub use subscription::{Subscription, SubscriptionRegistry};
