//! Cache entries and the results handed back to readers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::FetchError;
use crate::key::QueryKey;

/// Cached payload, shared between the store, waiters and subscribers.
pub type Data = Arc<Value>;

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Nothing requested yet
  Idle,
  /// A fetch is running. Previously fetched data, if any, is kept.
  Loading,
  Success,
  Error,
}

/// Identifies one underlying fetch. Unique within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
  pub fn get(self) -> u64 {
    self.0
  }
}

/// Identifies the optimistic patch of one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PatchId(pub(crate) u64);

/// Entry fields a rollback restores.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EntrySnapshot {
  pub data: Option<Data>,
  pub status: QueryStatus,
  pub error: Option<FetchError>,
  pub fetched_at: Option<Instant>,
  pub stale_at: Option<Instant>,
  pub updated_at: Option<DateTime<Utc>>,
}

impl EntrySnapshot {
  pub fn of(entry: &CacheEntry) -> Self {
    Self {
      data: entry.data.clone(),
      status: entry.status,
      error: entry.error.clone(),
      fetched_at: entry.fetched_at,
      stale_at: entry.stale_at,
      updated_at: entry.updated_at,
    }
  }

  pub fn restore_into(self, entry: &mut CacheEntry) {
    entry.data = self.data;
    entry.status = self.status;
    entry.error = self.error;
    entry.fetched_at = self.fetched_at;
    entry.stale_at = self.stale_at;
    entry.updated_at = self.updated_at;
  }
}

/// One pending optimistic patch. `previous` is `None` when the entry did not
/// exist before the patch.
#[derive(Debug, Clone)]
pub(crate) struct PatchRecord {
  pub id: PatchId,
  pub previous: Option<EntrySnapshot>,
}

/// Everything the store knows about one key.
///
/// `status == Success` implies `data` and `fetched_at` are set, and
/// `status == Error` implies `error` is set.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: QueryKey,
  pub data: Option<Data>,
  pub status: QueryStatus,
  pub error: Option<FetchError>,
  pub fetched_at: Option<Instant>,
  pub stale_at: Option<Instant>,
  /// Wall-clock time of the last successful write, for display and persistence.
  pub updated_at: Option<DateTime<Utc>>,
  pub in_flight: Option<RequestId>,
  /// Bumped on every write, monotonic across the whole store.
  pub version: u64,
  pub(crate) patches: Vec<PatchRecord>,
}

impl CacheEntry {
  /// A fresh `Idle` entry with no data.
  pub fn new(key: QueryKey) -> Self {
    Self {
      key,
      data: None,
      status: QueryStatus::Idle,
      error: None,
      fetched_at: None,
      stale_at: None,
      updated_at: None,
      in_flight: None,
      version: 0,
      patches: Vec::new(),
    }
  }

  /// A `Success` entry holding `data` fetched now.
  pub fn success(key: QueryKey, data: Data, stale_time: Duration) -> Self {
    let mut entry = Self::new(key);
    entry.set_success(data, stale_time);
    entry
  }

  pub(crate) fn set_success(&mut self, data: Data, stale_time: Duration) {
    let now = Instant::now();
    self.data = Some(data);
    self.status = QueryStatus::Success;
    self.error = None;
    self.fetched_at = Some(now);
    self.stale_at = Some(now + stale_time);
    self.updated_at = Some(Utc::now());
  }

  /// `true` while `now` is before `stale_at`.
  pub fn is_fresh(&self, now: Instant) -> bool {
    self.data.is_some() && self.stale_at.is_some_and(|stale_at| now < stale_at)
  }

  pub fn is_stale(&self, now: Instant) -> bool {
    !self.is_fresh(now)
  }

  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }

  /// Optimistic patches waiting for their mutation to settle.
  pub fn pending_patches(&self) -> usize {
    self.patches.len()
  }
}

/// Partial update applied by [`CacheStore::patch`](super::CacheStore::patch).
///
/// Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
  data: Option<Option<Data>>,
  status: Option<QueryStatus>,
  error: Option<Option<FetchError>>,
  stale_at: Option<Option<Instant>>,
}

impl EntryPatch {
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn data(mut self, data: Option<Data>) -> Self {
    self.data = Some(data);
    self
  }

  #[must_use]
  pub fn status(mut self, status: QueryStatus) -> Self {
    self.status = Some(status);
    self
  }

  #[must_use]
  pub fn error(mut self, error: Option<FetchError>) -> Self {
    self.error = Some(error);
    self
  }

  #[must_use]
  pub fn stale_at(mut self, stale_at: Option<Instant>) -> Self {
    self.stale_at = Some(stale_at);
    self
  }

  pub(crate) fn apply(self, entry: &mut CacheEntry) {
    if let Some(data) = self.data {
      entry.data = data;
    }
    if let Some(status) = self.status {
      entry.status = status;
    }
    if let Some(error) = self.error {
      entry.error = error;
    }
    if let Some(stale_at) = self.stale_at {
      entry.stale_at = stale_at;
    }
    // keep the status invariants intact
    if entry.status == QueryStatus::Success {
      if entry.data.is_none() {
        entry.status = QueryStatus::Idle;
      } else if entry.fetched_at.is_none() {
        let now = Instant::now();
        entry.fetched_at = Some(now);
        entry.stale_at.get_or_insert(now);
      }
    }
    if entry.status == QueryStatus::Error && entry.error.is_none() {
      entry.status = if entry.data.is_some() {
        QueryStatus::Success
      } else {
        QueryStatus::Idle
      };
    }
  }
}

/// Result of resolving a key, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  /// `None` only when nothing was fetched and nothing is cached.
  pub data: Option<Data>,
  pub source: CacheSource,
  /// When the data was written to the cache
  pub cached_at: Option<DateTime<Utc>>,
}

impl CacheResult {
  pub fn from_network(data: Data, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data: Some(data),
      source: CacheSource::Network,
      cached_at,
    }
  }

  pub fn from_cache(entry: &CacheEntry, is_stale: bool) -> Self {
    Self {
      data: entry.data.clone(),
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: entry.updated_at,
    }
  }

  pub fn skipped(entry: Option<&CacheEntry>) -> Self {
    Self {
      data: entry.and_then(|e| e.data.clone()),
      source: CacheSource::Skipped,
      cached_at: entry.and_then(|e| e.updated_at),
    }
  }

  /// Decode the payload into a typed value.
  pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Option<serde_json::Result<T>> {
    self
      .data
      .as_deref()
      .map(|value| T::deserialize(value))
  }
}

/// Indicates where resolved data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched by this call (or the in-flight request it attached to)
  Network,
  /// From cache, within the staleness window
  CacheFresh,
  /// From cache, past the staleness window. A background refetch was scheduled
  /// unless an optimistic patch is pending on the key.
  CacheStale,
  /// The query is disabled or has no fetcher, the cache was only read
  Skipped,
}
