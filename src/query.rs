//! Query coordinator.
//!
//! Owns the fetch lifecycle of every key:
//! 1. fresh entry: serve it, no network call
//! 2. stale entry: serve it now and revalidate once in the background
//! 3. no data yet: start a fetch, or join the one already running, and wait
//!
//! Fetches run in their own task, so a caller that stops waiting does not
//! cancel the request. Other callers and subscribers still get the result.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheResult, CacheStore, Data, QueryStatus, RequestId};
use crate::error::FetchError;
use crate::fetcher::SharedFetcher;
use crate::key::{KeyMatcher, QueryKey};
use crate::options::QueryOptions;

type Outcome = Option<Result<Data, FetchError>>;

struct InFlight {
  id: RequestId,
  done: watch::Receiver<Outcome>,
}

/// Fetcher and options last used for a key, kept for refetches.
#[derive(Clone)]
struct Registered {
  fetcher: SharedFetcher,
  options: QueryOptions,
}

enum Attempt {
  Fetched(Data),
  Failed(FetchError),
  /// Every subscriber left while the request was failing
  Abandoned(FetchError),
}

struct CoordinatorInner {
  store: CacheStore,
  in_flight: Mutex<HashMap<QueryKey, InFlight>>,
  registered: Mutex<HashMap<QueryKey, Registered>>,
  next_request: AtomicU64,
}

/// Resolves keys against the cache store, deduplicating fetches per key.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct QueryCoordinator {
  inner: Arc<CoordinatorInner>,
}

impl QueryCoordinator {
  pub fn new(store: CacheStore) -> Self {
    Self {
      inner: Arc::new(CoordinatorInner {
        store,
        in_flight: Mutex::new(HashMap::new()),
        registered: Mutex::new(HashMap::new()),
        next_request: AtomicU64::new(0),
      }),
    }
  }

  pub fn store(&self) -> &CacheStore {
    &self.inner.store
  }

  /// Resolve `key`, fetching with `fetcher` when the cache cannot answer.
  ///
  /// Fetch failures are retried per `options.retry` before they are returned.
  /// A stale hit returns immediately with `CacheSource::CacheStale` while the
  /// revalidation runs in the background.
  pub async fn resolve(
    &self,
    key: &QueryKey,
    fetcher: SharedFetcher,
    options: QueryOptions,
  ) -> Result<CacheResult, FetchError> {
    self.register(key, &fetcher, options);
    let entry = self.inner.store.get(key);

    if !options.enabled {
      return Ok(CacheResult::skipped(entry.as_ref()));
    }

    if let Some(entry) = entry.as_ref().filter(|e| e.has_data()) {
      if entry.is_fresh(Instant::now()) {
        return Ok(CacheResult::from_cache(entry, false));
      }
      if entry.pending_patches() == 0 {
        debug!(key = %key, "serving stale data while revalidating");
        drop(self.start_or_join(key, fetcher, options));
      }
      return Ok(CacheResult::from_cache(entry, true));
    }

    let done = self.start_or_join(key, fetcher, options);
    self.wait(key, done).await
  }

  /// Fetch `key` again with the fetcher it was last resolved with, even if
  /// the cached data is fresh. Joins a request that is already running.
  pub async fn refetch(&self, key: &QueryKey) -> Result<CacheResult, FetchError> {
    let entry = self.inner.store.get(key);
    let registered = self.registered(key);
    let paused = entry.as_ref().is_some_and(|e| e.pending_patches() > 0);

    match registered {
      Some(r) if r.options.enabled && !paused => {
        let done = self.start_or_join(key, r.fetcher, r.options);
        self.wait(key, done).await
      }
      _ => Ok(CacheResult::skipped(entry.as_ref())),
    }
  }

  /// Mark matching entries stale and revalidate the ones somebody observes.
  ///
  /// Revalidation needs a tokio runtime. Called outside one, entries are only
  /// marked stale and refetch on their next resolve.
  pub fn invalidate(&self, matcher: &KeyMatcher) -> Vec<QueryKey> {
    let keys = self.inner.store.invalidate(matcher);
    for key in &keys {
      self.revalidate_if_observed(key);
    }
    self.prune();
    keys
  }

  /// Start one background fetch for `key` if it has subscribers, is stale
  /// and has no optimistic patch pending.
  pub(crate) fn revalidate_if_observed(&self, key: &QueryKey) -> bool {
    let store = &self.inner.store;
    if store.registry().observer_count(key) == 0 {
      return false;
    }
    let Some(entry) = store.get(key) else {
      return false;
    };
    if entry.pending_patches() > 0 || entry.is_fresh(Instant::now()) {
      return false;
    }
    if tokio::runtime::Handle::try_current().is_err() {
      debug!(key = %key, "no runtime, leaving stale entry for the next resolve");
      return false;
    }
    match self.registered(key) {
      Some(r) if r.options.enabled => {
        debug!(key = %key, "background revalidation");
        drop(self.start_or_join(key, r.fetcher, r.options));
        true
      }
      _ => false,
    }
  }

  /// Wait for the request currently running for `key`, if any.
  pub async fn settled(&self, key: &QueryKey) {
    let done = self
      .inner
      .in_flight
      .lock()
      .get(key)
      .map(|f| f.done.clone());
    if let Some(mut done) = done {
      let _ = done.wait_for(Option::is_some).await;
    }
  }

  pub fn is_fetching(&self, key: &QueryKey) -> bool {
    self.inner.in_flight.lock().contains_key(key)
  }

  /// Default options recorded for `key` by its last resolve.
  pub fn options_of(&self, key: &QueryKey) -> Option<QueryOptions> {
    self.registered(key).map(|r| r.options)
  }

  /// Stop deduplicating onto request `id` of `key`. Called once an optimistic
  /// patch has taken the entry over, so the next revalidation starts a new
  /// request instead of joining one whose result will be discarded. Waiters
  /// already attached to `id` still get its outcome.
  pub(crate) fn supersede(&self, key: &QueryKey, id: RequestId) {
    let mut in_flight = self.inner.in_flight.lock();
    if in_flight.get(key).is_some_and(|f| f.id == id) {
      in_flight.remove(key);
      debug!(key = %key, request_id = id.get(), "in-flight request superseded");
    }
  }

  /// Forget every registered fetcher, used when the cache is torn down.
  pub(crate) fn forget_all(&self) {
    self.inner.registered.lock().clear();
  }

  fn register(&self, key: &QueryKey, fetcher: &SharedFetcher, options: QueryOptions) {
    self.inner.registered.lock().insert(
      key.clone(),
      Registered {
        fetcher: fetcher.clone(),
        options,
      },
    );
  }

  fn registered(&self, key: &QueryKey) -> Option<Registered> {
    self.inner.registered.lock().get(key).cloned()
  }

  /// Drop fetchers of keys that left the store.
  fn prune(&self) {
    let store = &self.inner.store;
    self.inner.registered.lock().retain(|key, _| store.contains(key));
  }

  fn start_or_join(
    &self,
    key: &QueryKey,
    fetcher: SharedFetcher,
    options: QueryOptions,
  ) -> watch::Receiver<Outcome> {
    let (id, tx, rx) = {
      let mut in_flight = self.inner.in_flight.lock();
      if let Some(existing) = in_flight.get(key) {
        debug!(key = %key, request_id = existing.id.get(), "joining in-flight request");
        return existing.done.clone();
      }
      let id = RequestId(self.inner.next_request.fetch_add(1, Ordering::Relaxed) + 1);
      let (tx, rx) = watch::channel(None);
      in_flight.insert(
        key.clone(),
        InFlight {
          id,
          done: rx.clone(),
        },
      );
      (id, tx, rx)
    };

    self.inner.store.update(key, |slot| {
      let entry = slot.get_or_insert_with(|| CacheEntry::new(key.clone()));
      entry.status = QueryStatus::Loading;
      entry.in_flight = Some(id);
      ((), true)
    });
    debug!(key = %key, request_id = id.get(), "fetch started");

    tokio::spawn(self.clone().run(key.clone(), id, fetcher, options, tx));
    rx
  }

  async fn run(
    self,
    key: QueryKey,
    id: RequestId,
    fetcher: SharedFetcher,
    options: QueryOptions,
    tx: watch::Sender<Outcome>,
  ) {
    let registry = self.inner.store.registry().clone();
    let observed_at_start = registry.observer_count(&key) > 0;
    let abandoned = || observed_at_start && registry.observer_count(&key) == 0;

    let mut retry = 0;
    let attempt = loop {
      let result = AssertUnwindSafe(fetcher.fetch(&key))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(FetchError::Transport("fetcher panicked".to_string())));

      let err = match result {
        Ok(value) => break Attempt::Fetched(Arc::new(value)),
        Err(err) => err,
      };
      if !err.is_retryable() || retry >= options.retry.max_retries {
        break Attempt::Failed(err);
      }
      if abandoned() {
        break Attempt::Abandoned(err);
      }

      let delay = options.retry.delay_for(retry);
      retry += 1;
      warn!(key = %key, request_id = id.get(), retry, ?delay, error = %err, "fetch failed, retrying");
      tokio::time::sleep(delay).await;

      if abandoned() {
        break Attempt::Abandoned(err);
      }
    };

    let outcome = self.settle(&key, id, attempt, &options);

    {
      let mut in_flight = self.inner.in_flight.lock();
      if in_flight.get(&key).is_some_and(|f| f.id == id) {
        in_flight.remove(&key);
      }
    }
    tx.send_replace(Some(outcome));

    if registry.observer_count(&key) == 0 {
      registry.schedule_eviction(&key);
    }
  }

  /// Write the final transition of request `id`, unless an optimistic patch or
  /// a removal took the entry over in the meantime.
  fn settle(
    &self,
    key: &QueryKey,
    id: RequestId,
    attempt: Attempt,
    options: &QueryOptions,
  ) -> Result<Data, FetchError> {
    let store = &self.inner.store;
    let owns = |slot: &Option<CacheEntry>| slot.as_ref().is_some_and(|e| e.in_flight == Some(id));

    match attempt {
      Attempt::Fetched(data) => {
        let applied = store.update(key, |slot| {
          if !owns(slot) {
            return (false, false);
          }
          if let Some(entry) = slot.as_mut() {
            entry.in_flight = None;
            entry.set_success(data.clone(), options.stale_time);
          }
          (true, true)
        });
        if applied {
          debug!(key = %key, request_id = id.get(), "fetch succeeded");
          Ok(data)
        } else {
          debug!(key = %key, request_id = id.get(), "fetch result superseded");
          Ok(store.get(key).and_then(|e| e.data).unwrap_or(data))
        }
      }
      Attempt::Failed(err) => {
        store.update(key, |slot| {
          if !owns(slot) {
            return ((), false);
          }
          if let Some(entry) = slot.as_mut() {
            entry.in_flight = None;
            entry.status = QueryStatus::Error;
            entry.error = Some(err.clone());
          }
          ((), true)
        });
        warn!(key = %key, request_id = id.get(), error = %err, "fetch failed");
        Err(err)
      }
      Attempt::Abandoned(err) => {
        store.update(key, |slot| {
          if !owns(slot) {
            return ((), false);
          }
          if let Some(entry) = slot.as_mut() {
            entry.in_flight = None;
            entry.status = if entry.data.is_some() {
              QueryStatus::Success
            } else if entry.error.is_some() {
              QueryStatus::Error
            } else {
              QueryStatus::Idle
            };
          }
          ((), true)
        });
        debug!(key = %key, request_id = id.get(), error = %err, "no subscribers left, retries cancelled");
        Err(FetchError::Cancelled)
      }
    }
  }

  async fn wait(
    &self,
    key: &QueryKey,
    mut done: watch::Receiver<Outcome>,
  ) -> Result<CacheResult, FetchError> {
    let outcome = match done.wait_for(Option::is_some).await {
      Ok(outcome) => outcome.clone(),
      Err(_) => None,
    };
    match outcome {
      Some(Ok(data)) => {
        let cached_at = self.inner.store.get(key).and_then(|e| e.updated_at);
        Ok(CacheResult::from_network(data, cached_at))
      }
      Some(Err(err)) => Err(err),
      None => Err(FetchError::Cancelled),
    }
  }
}

impl std::fmt::Debug for QueryCoordinator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryCoordinator")
      .field("in_flight", &self.inner.in_flight.lock().len())
      .field("registered", &self.inner.registered.lock().len())
      .finish_non_exhaustive()
  }
}
