//! The owning instance UI code talks to.
//!
//! A `QueryClient` is created once at application start. It owns the cache
//! store and both coordinators, and is torn down with [`QueryClient::clear`]
//! on logout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheResult, CacheStore};
use crate::error::{FetchError, MutationError, PersistError};
use crate::fetcher::SharedFetcher;
use crate::key::{KeyMatcher, QueryKey};
use crate::mutation::{Mutation, MutationCoordinator, MutationOptions};
use crate::options::{ClientConfig, QueryOptions};
use crate::persist::{PersistedEntry, SnapshotStore};
use crate::query::QueryCoordinator;
use crate::resource::Resource;
use crate::subscription::{Callback, Subscription};

/// Query cache with fetch deduplication, stale-while-revalidate and
/// optimistic mutations. Cheap to clone, clones share the cache.
#[derive(Clone)]
pub struct QueryClient {
  config: Arc<ClientConfig>,
  queries: QueryCoordinator,
  mutations: MutationCoordinator,
}

impl QueryClient {
  pub fn new(config: ClientConfig) -> Self {
    let config = Arc::new(config);
    let queries = QueryCoordinator::new(CacheStore::new(config.gc_time));
    let mutations = MutationCoordinator::with_config(queries.clone(), config.clone());
    info!(
      stale_time = ?config.stale_time,
      gc_time = ?config.gc_time,
      max_retries = config.retry.max_retries,
      "query client created"
    );
    Self {
      config,
      queries,
      mutations,
    }
  }

  pub fn config(&self) -> &ClientConfig {
    &self.config
  }

  pub fn store(&self) -> &CacheStore {
    self.queries.store()
  }

  pub fn queries(&self) -> &QueryCoordinator {
    &self.queries
  }

  pub fn mutations(&self) -> &MutationCoordinator {
    &self.mutations
  }

  /// Configured options for the kind of `key`.
  pub fn options_for(&self, key: &QueryKey) -> QueryOptions {
    self.config.options_for(key.kind())
  }

  /// Resolve `key` with the configured options of its kind.
  pub async fn resolve(
    &self,
    key: &QueryKey,
    fetcher: SharedFetcher,
  ) -> Result<CacheResult, FetchError> {
    self.resolve_with(key, fetcher, self.options_for(key)).await
  }

  pub async fn resolve_with(
    &self,
    key: &QueryKey,
    fetcher: SharedFetcher,
    options: QueryOptions,
  ) -> Result<CacheResult, FetchError> {
    self.queries.resolve(key, fetcher, options).await
  }

  /// Observe `key` and start resolving it. See [`Resource`].
  pub fn use_resource(&self, key: QueryKey, fetcher: SharedFetcher) -> Resource {
    let options = self.options_for(&key);
    self.use_resource_with(key, fetcher, options)
  }

  pub fn use_resource_with(
    &self,
    key: QueryKey,
    fetcher: SharedFetcher,
    options: QueryOptions,
  ) -> Resource {
    Resource::new(self.queries.clone(), key, fetcher, options)
  }

  /// A reusable write. `options` builds the affected keys for each input.
  pub fn use_mutation<I, W, Fut, O>(&self, write: W, options: O) -> Mutation<I>
  where
    I: Send + 'static,
    W: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    O: Fn(&I) -> MutationOptions + Send + Sync + 'static,
  {
    Mutation::new(self.mutations.clone(), write, options)
  }

  /// Run a single write. See [`MutationCoordinator::mutate`].
  pub async fn mutate<F, Fut>(
    &self,
    write: F,
    options: MutationOptions,
  ) -> Result<Value, MutationError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, FetchError>>,
  {
    self.mutations.mutate(write, options).await
  }

  pub fn subscribe(&self, key: &QueryKey, callback: Callback) -> Subscription {
    self.store().subscribe(key, callback)
  }

  /// Mark matching keys stale, refetching the observed ones.
  ///
  /// Outside a tokio runtime nothing is refetched; the keys stay stale until
  /// their next resolve.
  pub fn invalidate(&self, matcher: impl Into<KeyMatcher>) -> Vec<QueryKey> {
    self.queries.invalidate(&matcher.into())
  }

  /// Drop one key from the cache.
  pub fn remove(&self, key: &QueryKey) -> bool {
    self.store().remove(key).is_some()
  }

  /// Evict every entry and forget every registered fetcher, e.g. on logout.
  pub fn clear(&self) -> usize {
    let removed = self.store().clear();
    self.queries.forget_all();
    info!(removed, "query cache cleared");
    removed
  }

  /// Warm the cache from `snapshots`. Restored entries are stale, so they are
  /// served once and revalidated. Keys already holding data are left alone.
  pub fn hydrate(&self, snapshots: &dyn SnapshotStore) -> Result<usize, PersistError> {
    let store = self.store();
    let mut restored = 0;
    for persisted in snapshots.load()? {
      if store.get(&persisted.key).is_some_and(|e| e.has_data()) {
        continue;
      }
      let mut entry = CacheEntry::success(
        persisted.key.clone(),
        Arc::new(persisted.data),
        Duration::ZERO,
      );
      entry.updated_at = Some(persisted.updated_at);
      store.set(entry);
      store.registry().schedule_eviction(&persisted.key);
      restored += 1;
    }
    debug!(restored, "cache hydrated");
    Ok(restored)
  }

  /// Save every entry holding confirmed data. Entries with optimistic
  /// patches pending are skipped.
  pub fn dehydrate(&self, snapshots: &dyn SnapshotStore) -> Result<usize, PersistError> {
    let entries: Vec<PersistedEntry> = self
      .store()
      .snapshot()
      .into_iter()
      .filter(|e| e.pending_patches() == 0)
      .filter_map(|e| {
        let data = e.data.as_deref()?.clone();
        Some(PersistedEntry {
          updated_at: e.updated_at.unwrap_or_else(Utc::now),
          key: e.key,
          data,
        })
      })
      .collect();
    snapshots.save(&entries)?;
    debug!(saved = entries.len(), "cache dehydrated");
    Ok(entries.len())
  }
}

impl Default for QueryClient {
  fn default() -> Self {
    Self::new(ClientConfig::default())
  }
}

impl std::fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryClient")
      .field("store", self.store())
      .field("queries", &self.queries)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use parking_lot::Mutex;
  use serde_json::json;

  use crate::cache::{CacheSource, QueryStatus};
  use crate::fetcher::shared;
  use crate::mutation::AffectedKey;
  use crate::options::{ResourceConfig, RetryPolicy};
  use crate::persist::SqliteSnapshotStore;
  use crate::rest::append_to_page;

  fn counting(calls: &Arc<AtomicUsize>, value: Value) -> SharedFetcher {
    let calls = calls.clone();
    shared(move |_: &QueryKey| {
      calls.fetch_add(1, Ordering::SeqCst);
      let value = value.clone();
      async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(value)
      }
    })
  }

  fn ten_pesantren() -> Value {
    Value::Array((1..=10).map(|id| json!({ "id": id })).collect())
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_while_revalidate_scenario() {
    let client = QueryClient::new(ClientConfig::default().stale_time(Duration::from_secs(60)));
    let key = QueryKey::new(
      "pesantren-list",
      json!({"page": 1, "filter": {"province": "Jawa Barat"}}),
    )
    .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting(&calls, ten_pesantren());

    let first = client.resolve(&key, fetcher.clone()).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    let fetched_at = tokio::time::Instant::now();

    tokio::time::sleep_until(fetched_at + Duration::from_secs(30)).await;
    let at_30 = client.resolve(&key, fetcher.clone()).await.unwrap();
    assert_eq!(at_30.source, CacheSource::CacheFresh);
    assert_eq!(at_30.data.as_deref(), Some(&ten_pesantren()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep_until(fetched_at + Duration::from_secs(70)).await;
    let at_70 = client.resolve(&key, fetcher.clone()).await.unwrap();
    assert_eq!(at_70.source, CacheSource::CacheStale);
    assert_eq!(at_70.data.as_deref(), Some(&ten_pesantren()));
    assert!(client.queries().is_fetching(&key));

    client.queries().settled(&key).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(client
      .store()
      .get(&key)
      .unwrap()
      .is_fresh(tokio::time::Instant::now()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_review_append_rolls_back() {
    let client = QueryClient::default();
    let key = QueryKey::new("reviews", json!({"pesantrenId": "X"})).unwrap();
    let original = json!({
      "data": [{"id": "r1"}, {"id": "r2"}, {"id": "r3"}],
      "pagination": {"page": 1, "limit": 10, "total": 3},
    });
    let calls = Arc::new(AtomicUsize::new(0));
    client
      .resolve(&key, counting(&calls, original.clone()))
      .await
      .unwrap();

    let review = json!({"id": "tmp", "rating": 5, "comment": "Asrama bersih"});
    let options = MutationOptions::new().affect(
      AffectedKey::new(key.clone()).optimistic(move |cached: Option<&Value>| append_to_page(cached, &review)),
    );
    let err = client
      .mutate(
        || async {
          Err(FetchError::Status {
            status: 500,
            message: "Internal server error".into(),
          })
        },
        options,
      )
      .await
      .unwrap_err();

    assert!(err.rolled_back_cleanly());
    let cached = client.store().get(&key).unwrap();
    assert_eq!(cached.data.as_deref(), Some(&original));
    assert_eq!(cached.data.unwrap()["data"].as_array().unwrap().len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_remaining_subscriber_gets_result() {
    let client = QueryClient::default();
    let key = QueryKey::new("news-detail", json!({"id": "42"})).unwrap();
    let first_seen = Arc::new(Mutex::new(Vec::new()));
    let second_seen = Arc::new(Mutex::new(Vec::new()));

    let first = {
      let seen = first_seen.clone();
      client.subscribe(&key, Arc::new(move |e: &CacheEntry| seen.lock().push(e.status)))
    };
    let _second = {
      let seen = second_seen.clone();
      client.subscribe(&key, Arc::new(move |e: &CacheEntry| seen.lock().push(e.status)))
    };

    let calls = Arc::new(AtomicUsize::new(0));
    let resolving = {
      let client = client.clone();
      let key = key.clone();
      let fetcher = counting(&calls, json!({"id": 42, "title": "Haflah akhirussanah"}));
      tokio::spawn(async move { client.resolve(&key, fetcher).await })
    };
    tokio::task::yield_now().await;

    first.unsubscribe();
    resolving.await.unwrap().unwrap();

    assert_eq!(*first_seen.lock(), vec![QueryStatus::Loading]);
    assert_eq!(
      *second_seen.lock(),
      vec![QueryStatus::Loading, QueryStatus::Success]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_resources_share_one_fetch() {
    let client = QueryClient::default();
    let key = QueryKey::new("pesantren-detail", json!({"id": 7})).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = counting(&calls, json!({"id": 7}));

    let mut resources: Vec<Resource> = (0..5)
      .map(|_| client.use_resource(key.clone(), fetcher.clone()))
      .collect();
    for resource in &mut resources {
      assert!(resource.settled().await.is_success());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_kind_overrides_apply() {
    let config = ClientConfig::default().resource(
      "pesantren-stats",
      ResourceConfig {
        stale_time: Some(Duration::from_secs(600)),
        retry: Some(RetryPolicy::none()),
      },
    );
    let client = QueryClient::new(config);

    let stats = QueryKey::new("pesantren-stats", json!({})).unwrap();
    let news = QueryKey::new("news-list", json!({})).unwrap();
    assert_eq!(client.options_for(&stats).stale_time, Duration::from_secs(600));
    assert_eq!(client.options_for(&stats).retry.max_retries, 0);
    assert_eq!(client.options_for(&news).stale_time, Duration::from_secs(60));
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_tears_everything_down() {
    let client = QueryClient::default();
    let calls = Arc::new(AtomicUsize::new(0));
    for page in 1..=3 {
      let key = QueryKey::new("news-list", json!({ "page": page })).unwrap();
      client
        .resolve(&key, counting(&calls, json!([page])))
        .await
        .unwrap();
    }

    assert_eq!(client.clear(), 3);
    assert!(client.store().is_empty());

    let key = QueryKey::new("news-list", json!({"page": 1})).unwrap();
    let result = client.queries().refetch(&key).await.unwrap();
    assert_eq!(result.source, CacheSource::Skipped);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dehydrate_then_hydrate() {
    let snapshots = SqliteSnapshotStore::open_in_memory().unwrap();
    let key = QueryKey::new("news-detail", json!({"id": 42})).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let before = QueryClient::default();
    before
      .resolve(&key, counting(&calls, json!({"id": 42})))
      .await
      .unwrap();
    assert_eq!(before.dehydrate(&snapshots).unwrap(), 1);

    let after = QueryClient::default();
    assert_eq!(after.hydrate(&snapshots).unwrap(), 1);

    let restored = after.resolve(&key, counting(&calls, json!({"id": 42, "v": 2}))).await.unwrap();
    assert_eq!(restored.source, CacheSource::CacheStale);
    assert_eq!(restored.data.as_deref(), Some(&json!({"id": 42})));

    after.queries().settled(&key).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
      after.store().get(&key).unwrap().data.as_deref(),
      Some(&json!({"id": 42, "v": 2}))
    );
  }
}
