//! Consumer handle for one key: `data`, `status`, `error` and `refetch`.
//!
//! A `Resource` subscribes to its key, then resolves it in the background.
//! Every transition of the entry lands in a watch channel, so UI code can
//! either poll it from an event loop tick or await changes.
//!
//! # Example
//!
//! ```ignore
//! let mut news = client.use_resource(key, rest.clone());
//!
//! // In event loop tick
//! if news.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match news.state().status {
//!     QueryStatus::Loading => render_spinner(),
//!     QueryStatus::Success => render_news(news.state().data_as::<News>()),
//!     QueryStatus::Error => render_error(news.state().error),
//!     QueryStatus::Idle => {}
//! }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::{CacheEntry, CacheResult, Data, QueryStatus};
use crate::error::FetchError;
use crate::fetcher::SharedFetcher;
use crate::key::QueryKey;
use crate::options::QueryOptions;
use crate::query::QueryCoordinator;
use crate::subscription::Subscription;

/// What a consumer renders for one key.
#[derive(Debug, Clone)]
pub struct ResourceState {
  pub data: Option<Data>,
  pub status: QueryStatus,
  pub error: Option<FetchError>,
  pub stale_at: Option<Instant>,
  pub updated_at: Option<DateTime<Utc>>,
  /// A request for the key is running, possibly behind cached data
  pub fetching: bool,
  /// Entry version this state was taken from, 0 before the first write.
  pub version: u64,
}

impl ResourceState {
  fn idle() -> Self {
    Self {
      data: None,
      status: QueryStatus::Idle,
      error: None,
      stale_at: None,
      updated_at: None,
      fetching: false,
      version: 0,
    }
  }

  fn of(entry: &CacheEntry) -> Self {
    Self {
      data: entry.data.clone(),
      status: entry.status,
      error: entry.error.clone(),
      stale_at: entry.stale_at,
      updated_at: entry.updated_at,
      fetching: entry.in_flight.is_some(),
      version: entry.version,
    }
  }

  pub fn is_idle(&self) -> bool {
    self.status == QueryStatus::Idle
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  /// Data is missing or past its staleness window.
  pub fn is_stale(&self) -> bool {
    self.data.is_none() || self.stale_at.map_or(true, |stale_at| Instant::now() >= stale_at)
  }

  /// Decode the data into a typed value.
  pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Option<serde_json::Result<T>> {
    self.data.as_deref().map(T::deserialize)
  }
}

/// Live view of one key.
///
/// Dropping the handle detaches it: it gets no further updates, but a fetch
/// it started keeps running for the other subscribers of the key.
pub struct Resource {
  key: QueryKey,
  queries: QueryCoordinator,
  state: watch::Receiver<ResourceState>,
  initial: Option<JoinHandle<()>>,
  subscription: Subscription,
}

impl Resource {
  /// Subscribe to `key` and start resolving it.
  ///
  /// Must be called within a tokio runtime.
  pub fn new(
    queries: QueryCoordinator,
    key: QueryKey,
    fetcher: SharedFetcher,
    options: QueryOptions,
  ) -> Self {
    let store = queries.store();
    let (tx, mut state) = watch::channel(ResourceState::idle());
    let tx = Arc::new(tx);

    // subscribe before reading the entry so no write falls between the two
    let subscription = {
      let tx = tx.clone();
      store.subscribe(&key, Arc::new(move |entry: &CacheEntry| publish(&tx, entry)))
    };
    if let Some(entry) = store.get(&key) {
      publish(&tx, &entry);
    }
    // the seed is the starting point, not a change
    state.borrow_and_update();

    let initial = {
      let queries = queries.clone();
      let key = key.clone();
      tokio::spawn(async move {
        if let Err(err) = queries.resolve(&key, fetcher, options).await {
          debug!(key = %key, error = %err, "resource resolve failed");
        }
      })
    };

    Self {
      key,
      queries,
      state,
      initial: Some(initial),
      subscription,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Current state of the key.
  pub fn state(&self) -> ResourceState {
    self.state.borrow().clone()
  }

  pub fn data(&self) -> Option<Data> {
    self.state.borrow().data.clone()
  }

  pub fn status(&self) -> QueryStatus {
    self.state.borrow().status
  }

  pub fn error(&self) -> Option<FetchError> {
    self.state.borrow().error.clone()
  }

  /// Returns `true` if the state changed since the last `poll` or `changed`.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    match self.state.has_changed() {
      Ok(true) => {
        self.state.borrow_and_update();
        true
      }
      _ => false,
    }
  }

  /// Wait for the next transition and return the state it produced.
  pub async fn changed(&mut self) -> ResourceState {
    // the sender lives as long as our subscription, so this only waits
    let _ = self.state.changed().await;
    self.state.borrow_and_update().clone()
  }

  /// Wait until the initial resolve and any request running for the key have
  /// finished, then return the state.
  pub async fn settled(&mut self) -> ResourceState {
    if let Some(initial) = self.initial.take() {
      let _ = initial.await;
    }
    self.queries.settled(&self.key).await;
    self.state()
  }

  /// Fetch the key again, even if its data is fresh.
  pub async fn refetch(&self) -> Result<CacheResult, FetchError> {
    self.queries.refetch(&self.key).await
  }

  pub fn subscription(&self) -> &Subscription {
    &self.subscription
  }
}

/// Move the state to `entry` unless it already reflects that version or a
/// newer one.
fn publish(tx: &watch::Sender<ResourceState>, entry: &CacheEntry) {
  tx.send_if_modified(|current| {
    if entry.version <= current.version {
      return false;
    }
    *current = ResourceState::of(entry);
    true
  });
}

impl std::fmt::Debug for Resource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Resource")
      .field("key", &self.key)
      .field("state", &*self.state.borrow())
      .finish_non_exhaustive()
  }
}
