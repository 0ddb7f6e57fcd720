//! Mutation coordinator.
//!
//! A mutation runs in three steps:
//! 1. apply the optimistic update of every affected key and publish it
//! 2. run the remote write
//! 3. reconcile the affected keys with the server response, or roll the
//!    optimistic updates back if the write failed
//!
//! Each key keeps a stack of pending patches. A patch remembers the entry as
//! it was right before the patch, so a second mutation on the same key builds
//! on top of the first one's speculative data. Rolling back the top patch
//! restores its snapshot. Rolling back a patch that is buried under a newer
//! one hands the snapshot to the newer patch instead.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, EntrySnapshot, PatchId, PatchRecord, QueryStatus};
use crate::error::{FetchError, MutationError, RollbackReport};
use crate::key::{KeyMatcher, QueryKey};
use crate::options::ClientConfig;
use crate::query::QueryCoordinator;

/// Computes speculative data from the data currently cached.
pub type UpdateFn = Arc<dyn Fn(Option<&Value>) -> Value + Send + Sync>;

/// Folds a write response into cached data: `(cached, response) -> new`.
pub type MergeFn = Arc<dyn Fn(Option<&Value>, &Value) -> Value + Send + Sync>;

/// What happens to an affected key after the write succeeds.
#[derive(Clone, Default)]
pub enum Reconcile {
  /// Mark the key stale so observers refetch it
  #[default]
  Invalidate,
  /// The write response is the new value of the key
  Replace,
  /// Merge the write response into the cached value
  Merge(MergeFn),
}

impl std::fmt::Debug for Reconcile {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Invalidate => f.write_str("Invalidate"),
      Self::Replace => f.write_str("Replace"),
      Self::Merge(_) => f.write_str("Merge(..)"),
    }
  }
}

/// A key touched by a mutation.
#[derive(Clone)]
pub struct AffectedKey {
  pub key: QueryKey,
  optimistic: Option<UpdateFn>,
  reconcile: Reconcile,
}

impl AffectedKey {
  /// Invalidate `key` once the write succeeds, no optimistic update.
  pub fn new(key: QueryKey) -> Self {
    Self {
      key,
      optimistic: None,
      reconcile: Reconcile::Invalidate,
    }
  }

  /// Speculative data to show while the write runs.
  ///
  /// `update` runs while the cache store is locked, so it must not read or
  /// write the store or the client.
  #[must_use]
  pub fn optimistic<F>(mut self, update: F) -> Self
  where
    F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
  {
    self.optimistic = Some(Arc::new(update));
    self
  }

  #[must_use]
  pub fn replace(mut self) -> Self {
    self.reconcile = Reconcile::Replace;
    self
  }

  /// Fold the write response into the cached value once the write succeeds.
  ///
  /// Like [`AffectedKey::optimistic`], `merge` runs under the store lock.
  #[must_use]
  pub fn merge<F>(mut self, merge: F) -> Self
  where
    F: Fn(Option<&Value>, &Value) -> Value + Send + Sync + 'static,
  {
    self.reconcile = Reconcile::Merge(Arc::new(merge));
    self
  }

  pub fn reconcile(&self) -> &Reconcile {
    &self.reconcile
  }

  pub fn has_optimistic_update(&self) -> bool {
    self.optimistic.is_some()
  }
}

impl std::fmt::Debug for AffectedKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AffectedKey")
      .field("key", &self.key)
      .field("optimistic", &self.optimistic.is_some())
      .field("reconcile", &self.reconcile)
      .finish()
  }
}

/// Keys a mutation touches and how.
#[derive(Debug, Clone, Default)]
pub struct MutationOptions {
  pub affected: Vec<AffectedKey>,
}

impl MutationOptions {
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn affect(mut self, affected: AffectedKey) -> Self {
    self.affected.push(affected);
    self
  }

  /// Shorthand for a key that is only invalidated.
  #[must_use]
  pub fn invalidate(self, key: QueryKey) -> Self {
    self.affect(AffectedKey::new(key))
  }
}

/// How a write response is folded into an entry and the snapshots below it.
#[derive(Clone, Copy)]
enum Rebase<'a> {
  Stale(Instant),
  Value(&'a Value),
  Merge(&'a MergeFn, &'a Value),
}

impl Rebase<'_> {
  fn data(&self, cached: Option<&Value>) -> Option<Value> {
    match *self {
      Self::Stale(_) => None,
      Self::Value(value) => Some(value.clone()),
      Self::Merge(merge, response) => Some(merge(cached, response)),
    }
  }
}

/// Outcome of rolling back one key.
enum Undo {
  Restored,
  Removed,
  HandedOver,
  Gone,
  Lost,
}

/// Applies optimistic updates and reconciles writes with the cache.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct MutationCoordinator {
  queries: QueryCoordinator,
  config: Arc<ClientConfig>,
  next_patch: Arc<AtomicU64>,
}

impl MutationCoordinator {
  pub fn new(queries: QueryCoordinator) -> Self {
    Self::with_config(queries, Arc::new(ClientConfig::default()))
  }

  /// `config` supplies the staleness window of keys written by a mutation
  /// before anybody resolved them.
  pub fn with_config(queries: QueryCoordinator, config: Arc<ClientConfig>) -> Self {
    Self {
      queries,
      config,
      next_patch: Arc::new(AtomicU64::new(0)),
    }
  }

  pub fn queries(&self) -> &QueryCoordinator {
    &self.queries
  }

  /// Run `write` with the optimistic updates of `options` applied.
  ///
  /// On success the response is reconciled into every affected key and
  /// returned. On failure every optimistic update is rolled back and the
  /// error says whether the rollback left the cache consistent. Dropping the
  /// returned future before the write settles rolls back as well.
  pub async fn mutate<F, Fut>(
    &self,
    write: F,
    options: MutationOptions,
  ) -> Result<Value, MutationError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, FetchError>>,
  {
    let id = PatchId(self.next_patch.fetch_add(1, Ordering::Relaxed) + 1);
    let mut guard = PendingPatches {
      coordinator: self.clone(),
      id,
      applied: Vec::new(),
    };

    for affected in &options.affected {
      if let Some(update) = &affected.optimistic {
        self.apply(&affected.key, id, update);
        guard.applied.push(affected.key.clone());
      }
    }

    let result = write().await;
    let applied = std::mem::take(&mut guard.applied);

    match result {
      Ok(response) => {
        for affected in &options.affected {
          self.commit(affected, id, &response);
        }
        info!(patch = id.0, keys = options.affected.len(), "mutation committed");
        self.after_settle(options.affected.iter().map(|a| &a.key));
        Ok(response)
      }
      Err(err) => {
        warn!(patch = id.0, error = %err, "mutation failed, rolling back");
        let report = self.rollback(id, &applied);
        self.after_settle(options.affected.iter().map(|a| &a.key));
        Err(MutationError::new(err, report))
      }
    }
  }

  fn apply(&self, key: &QueryKey, id: PatchId, update: &UpdateFn) {
    let superseded = self.queries.store().update(key, |slot| {
      let previous = slot.as_ref().map(|entry| {
        let mut snapshot = EntrySnapshot::of(entry);
        // a superseded fetch never settles this entry, so do not bring back its loading state
        if snapshot.status == QueryStatus::Loading {
          snapshot.status = settled_status(entry);
        }
        snapshot
      });

      let entry = slot.get_or_insert_with(|| CacheEntry::new(key.clone()));
      let next = update(entry.data.as_deref());
      entry.patches.push(PatchRecord { id, previous });
      entry.data = Some(Arc::new(next));
      entry.status = QueryStatus::Success;
      entry.error = None;
      let superseded = entry.in_flight.take();
      entry.updated_at = Some(Utc::now());
      if entry.fetched_at.is_none() {
        let now = Instant::now();
        entry.fetched_at = Some(now);
        entry.stale_at = Some(now);
      }
      (superseded, true)
    });
    if let Some(request) = superseded {
      self.queries.supersede(key, request);
    }
    debug!(key = %key, patch = id.0, "optimistic update applied");
  }

  fn commit(&self, affected: &AffectedKey, id: PatchId, response: &Value) {
    let key = &affected.key;
    let stale_time = self.stale_time_of(key);
    let rebase = match &affected.reconcile {
      Reconcile::Invalidate => Rebase::Stale(Instant::now()),
      Reconcile::Replace => Rebase::Value(response),
      Reconcile::Merge(merge) => Rebase::Merge(merge, response),
    };

    self.queries.store().update(key, |slot| {
      if let Rebase::Stale(_) = rebase {
        if slot.is_none() {
          return ((), false);
        }
      }
      let entry = slot.get_or_insert_with(|| CacheEntry::new(key.clone()));
      entry.patches.retain(|record| record.id != id);
      rebase_entry(entry, &rebase, stale_time);
      ((), true)
    });

    if let Reconcile::Invalidate = affected.reconcile {
      self.queries.invalidate(&KeyMatcher::Exact(key.clone()));
    }
    debug!(key = %key, patch = id.0, reconcile = ?affected.reconcile, "mutation reconciled");
  }

  fn rollback(&self, id: PatchId, applied: &[QueryKey]) -> RollbackReport {
    let store = self.queries.store();
    let mut torn_down = Vec::new();

    for key in applied {
      let undo = store.update(key, |slot| {
        let Some(entry) = slot.as_mut() else {
          return (Undo::Gone, false);
        };
        let Some(pos) = entry.patches.iter().position(|r| r.id == id) else {
          return (Undo::Lost, false);
        };
        let record = entry.patches.remove(pos);

        if pos < entry.patches.len() {
          // buried: the patch above restores the pre-both state, and its
          // speculative data still contains ours
          entry.patches[pos].previous = record.previous;
          entry.stale_at = Some(Instant::now());
          return (Undo::HandedOver, true);
        }
        match record.previous {
          Some(snapshot) => {
            snapshot.restore_into(entry);
            (Undo::Restored, true)
          }
          None => {
            *slot = None;
            (Undo::Removed, true)
          }
        }
      });

      match undo {
        Undo::Restored => debug!(key = %key, patch = id.0, "optimistic update rolled back"),
        Undo::Removed => debug!(key = %key, patch = id.0, "optimistic entry removed"),
        Undo::HandedOver => debug!(key = %key, patch = id.0, "snapshot handed to newer patch"),
        Undo::Gone => debug!(key = %key, patch = id.0, "entry evicted before rollback"),
        Undo::Lost => {
          error!(key = %key, patch = id.0, "patch record lost, tearing down entry");
          store.remove(key);
          torn_down.push(key.clone());
        }
      }
    }

    if torn_down.is_empty() {
      RollbackReport::Clean
    } else {
      RollbackReport::Fault { torn_down }
    }
  }

  /// Resume what patches paused: revalidate observed stale keys and let
  /// unobserved ones expire.
  fn after_settle<'a>(&self, keys: impl Iterator<Item = &'a QueryKey>) {
    let store = self.queries.store();
    let registry = store.registry();
    for key in keys {
      let Some(entry) = store.get(key) else {
        continue;
      };
      if entry.pending_patches() > 0 {
        continue;
      }
      if registry.observer_count(key) == 0 {
        registry.schedule_eviction(key);
      } else {
        self.queries.revalidate_if_observed(key);
      }
    }
  }

  fn stale_time_of(&self, key: &QueryKey) -> Duration {
    self
      .queries
      .options_of(key)
      .unwrap_or_else(|| self.config.options_for(key.kind()))
      .stale_time
  }
}

impl std::fmt::Debug for MutationCoordinator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MutationCoordinator")
      .field("patches_issued", &self.next_patch.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}

/// Rolls back optimistic updates still applied when a mutation future is
/// dropped mid-write.
struct PendingPatches {
  coordinator: MutationCoordinator,
  id: PatchId,
  applied: Vec<QueryKey>,
}

impl Drop for PendingPatches {
  fn drop(&mut self) {
    if self.applied.is_empty() {
      return;
    }
    warn!(patch = self.id.0, "mutation dropped before settling, rolling back");
    let report = self.coordinator.rollback(self.id, &self.applied);
    if !report.is_clean() {
      error!(patch = self.id.0, ?report, "rollback of dropped mutation faulted");
    }
    if tokio::runtime::Handle::try_current().is_ok() {
      self.coordinator.after_settle(self.applied.iter());
    }
  }
}

fn settled_status(entry: &CacheEntry) -> QueryStatus {
  if entry.data.is_some() {
    QueryStatus::Success
  } else if entry.error.is_some() {
    QueryStatus::Error
  } else {
    QueryStatus::Idle
  }
}

/// Fold a committed write into the entry and into every snapshot still held
/// by newer patches, so their rollback does not undo the write.
fn rebase_entry(entry: &mut CacheEntry, rebase: &Rebase<'_>, stale_time: Duration) {
  match rebase {
    Rebase::Stale(now) => entry.stale_at = Some(*now),
    _ => {
      if let Some(data) = rebase.data(entry.data.as_deref()) {
        if entry.patches.is_empty() {
          entry.set_success(Arc::new(data), stale_time);
        } else {
          entry.data = Some(Arc::new(data));
          entry.status = QueryStatus::Success;
          entry.error = None;
          entry.updated_at = Some(Utc::now());
        }
      }
    }
  }

  for record in &mut entry.patches {
    if let Rebase::Stale(now) = rebase {
      if let Some(snapshot) = record.previous.as_mut() {
        snapshot.stale_at = Some(*now);
      }
      continue;
    }

    let cached = record.previous.as_ref().and_then(|s| s.data.as_deref());
    let Some(data) = rebase.data(cached) else {
      continue;
    };
    let now = Instant::now();
    match record.previous.as_mut() {
      Some(snapshot) => {
        snapshot.data = Some(Arc::new(data));
        snapshot.status = QueryStatus::Success;
        snapshot.error = None;
        snapshot.fetched_at.get_or_insert(now);
        snapshot.stale_at.get_or_insert(now);
      }
      None => {
        record.previous = Some(EntrySnapshot {
          data: Some(Arc::new(data)),
          status: QueryStatus::Success,
          error: None,
          fetched_at: Some(now),
          stale_at: Some(now + stale_time),
          updated_at: Some(Utc::now()),
        });
      }
    }
  }
}

type WriteFn<I> = dyn Fn(I) -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync;
type OptionsFn<I> = dyn Fn(&I) -> MutationOptions + Send + Sync;

/// Lifecycle of the latest call made through a [`Mutation`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Idle,
  Pending,
  Success,
  Error,
}

#[derive(Debug)]
struct MutationState {
  status: MutationStatus,
  latest: u64,
  data: Option<Value>,
  error: Option<MutationError>,
}

/// A reusable write with its optimistic updates, as handed to UI code.
///
/// `status()` follows the most recent call to [`Mutation::mutate`]. Earlier
/// calls still settle and reconcile, they just no longer drive the status.
pub struct Mutation<I> {
  coordinator: MutationCoordinator,
  write: Arc<WriteFn<I>>,
  options: Arc<OptionsFn<I>>,
  state: Arc<Mutex<MutationState>>,
}

impl<I> Clone for Mutation<I> {
  fn clone(&self) -> Self {
    Self {
      coordinator: self.coordinator.clone(),
      write: self.write.clone(),
      options: self.options.clone(),
      state: self.state.clone(),
    }
  }
}

impl<I: Send + 'static> Mutation<I> {
  pub fn new<W, Fut, O>(coordinator: MutationCoordinator, write: W, options: O) -> Self
  where
    W: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    O: Fn(&I) -> MutationOptions + Send + Sync + 'static,
  {
    Self {
      coordinator,
      write: Arc::new(move |input| write(input).boxed()),
      options: Arc::new(options),
      state: Arc::new(Mutex::new(MutationState {
        status: MutationStatus::Idle,
        latest: 0,
        data: None,
        error: None,
      })),
    }
  }

  pub async fn mutate(&self, input: I) -> Result<Value, MutationError> {
    let options = (self.options)(&input);
    let call = {
      let mut state = self.state.lock();
      state.latest += 1;
      state.status = MutationStatus::Pending;
      state.latest
    };

    let write = self.write.clone();
    let result = self
      .coordinator
      .mutate(move || write(input), options)
      .await;

    let mut state = self.state.lock();
    if state.latest == call {
      match &result {
        Ok(value) => {
          state.status = MutationStatus::Success;
          state.data = Some(value.clone());
          state.error = None;
        }
        Err(err) => {
          state.status = MutationStatus::Error;
          state.error = Some(err.clone());
        }
      }
    }
    result
  }

  pub fn status(&self) -> MutationStatus {
    self.state.lock().status
  }

  pub fn is_pending(&self) -> bool {
    self.status() == MutationStatus::Pending
  }

  /// Response of the latest successful call.
  pub fn data(&self) -> Option<Value> {
    self.state.lock().data.clone()
  }

  pub fn error(&self) -> Option<MutationError> {
    self.state.lock().error.clone()
  }

  /// Back to `Idle`, forgetting the last response and error.
  pub fn reset(&self) {
    let mut state = self.state.lock();
    state.status = MutationStatus::Idle;
    state.data = None;
    state.error = None;
  }
}

impl<I> std::fmt::Debug for Mutation<I> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Mutation")
      .field("status", &self.state.lock().status)
      .finish_non_exhaustive()
  }
}
