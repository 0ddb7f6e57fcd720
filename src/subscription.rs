//! Subscription registry.
//!
//! Tracks which callbacks observe which keys and fans cache transitions out
//! to them. Transitions are queued in the order the store applied them and
//! drained by a single thread at a time, so callbacks for one key always see
//! transitions in order, even when the writes came from different tasks.
//!
//! When the last subscriber of a key leaves, an eviction timer starts. A new
//! subscriber cancels it, otherwise the key is dropped from the store once
//! the window elapses.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::CacheEntry;
use crate::key::QueryKey;

/// Invoked with the entry after every transition of the observed key.
pub type Callback = Arc<dyn Fn(&CacheEntry) + Send + Sync>;

pub(crate) type Evictor = Arc<dyn Fn(&QueryKey) + Send + Sync>;

/// Identifies one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Subscriber {
  id: SubscriberId,
  active: AtomicBool,
  callback: Callback,
}

struct EvictionTimer {
  generation: u64,
  task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryState {
  next_id: u64,
  next_generation: u64,
  by_key: HashMap<QueryKey, Vec<Arc<Subscriber>>>,
  index: HashMap<SubscriberId, QueryKey>,
  timers: HashMap<QueryKey, EvictionTimer>,
}

struct RegistryInner {
  state: Mutex<RegistryState>,
  queue: Mutex<VecDeque<(QueryKey, CacheEntry)>>,
  draining: AtomicBool,
  gc_time: Duration,
  evictor: OnceLock<Evictor>,
}

/// Maps keys to subscriber callbacks. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionRegistry {
  inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
  /// Create a registry whose unobserved keys are evicted after `gc_time`.
  pub fn new(gc_time: Duration) -> Self {
    Self {
      inner: Arc::new(RegistryInner {
        state: Mutex::new(RegistryState::default()),
        queue: Mutex::new(VecDeque::new()),
        draining: AtomicBool::new(false),
        gc_time,
        evictor: OnceLock::new(),
      }),
    }
  }

  /// Install the action run when an eviction timer fires. Set once by the store.
  pub(crate) fn set_evictor(&self, evictor: Evictor) {
    let _ = self.inner.evictor.set(evictor);
  }

  pub fn gc_time(&self) -> Duration {
    self.inner.gc_time
  }

  /// Start observing `key`. Dropping the returned handle unsubscribes.
  pub fn subscribe(&self, key: &QueryKey, callback: Callback) -> Subscription {
    let mut state = self.inner.state.lock();
    state.next_id += 1;
    let id = SubscriberId(state.next_id);

    if let Some(timer) = state.timers.remove(key) {
      debug!(key = %key, "eviction cancelled by new subscriber");
      if let Some(task) = timer.task {
        task.abort();
      }
    }

    state.by_key.entry(key.clone()).or_default().push(Arc::new(Subscriber {
      id,
      active: AtomicBool::new(true),
      callback,
    }));
    state.index.insert(id, key.clone());

    Subscription {
      id,
      key: key.clone(),
      registry: Arc::downgrade(&self.inner),
      detached: false,
    }
  }

  /// Stop delivering to `id`. Takes effect immediately, even for a
  /// notification that is currently being drained.
  pub fn unsubscribe(&self, id: SubscriberId) {
    unsubscribe_inner(&self.inner, id);
  }

  /// Number of active subscribers of `key`.
  pub fn observer_count(&self, key: &QueryKey) -> usize {
    self
      .inner
      .state
      .lock()
      .by_key
      .get(key)
      .map_or(0, Vec::len)
  }

  /// Start the eviction timer for `key` if nobody observes it.
  pub fn schedule_eviction(&self, key: &QueryKey) {
    schedule_eviction_inner(&self.inner, key);
  }

  /// Queue a transition for delivery. Called by the store while it still
  /// holds its lock, which fixes the delivery order.
  pub(crate) fn enqueue(&self, key: &QueryKey, entry: CacheEntry) {
    self.inner.queue.lock().push_back((key.clone(), entry));
  }

  /// Deliver queued transitions. If another thread is already draining, it
  /// picks up whatever this thread queued.
  pub(crate) fn flush(&self) {
    let inner = &self.inner;
    loop {
      if inner
        .draining
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
      {
        return;
      }
      let guard = DrainGuard(&inner.draining);

      loop {
        let next = inner.queue.lock().pop_front();
        let Some((key, entry)) = next else {
          break;
        };
        let subscribers = inner
          .state
          .lock()
          .by_key
          .get(&key)
          .cloned()
          .unwrap_or_default();
        for subscriber in subscribers {
          if subscriber.active.load(Ordering::Acquire) {
            (subscriber.callback)(&entry);
          }
        }
      }

      drop(guard);
      if inner.queue.lock().is_empty() {
        return;
      }
    }
  }
}

impl std::fmt::Debug for SubscriptionRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("SubscriptionRegistry")
      .field("observed_keys", &state.by_key.len())
      .field("subscribers", &state.index.len())
      .field("pending_evictions", &state.timers.len())
      .finish()
  }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

fn unsubscribe_inner(inner: &Arc<RegistryInner>, id: SubscriberId) {
  let orphaned = {
    let mut state = inner.state.lock();
    let Some(key) = state.index.remove(&id) else {
      return;
    };
    let mut orphaned = false;
    if let Some(subscribers) = state.by_key.get_mut(&key) {
      if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
        let subscriber = subscribers.remove(pos);
        subscriber.active.store(false, Ordering::Release);
      }
      orphaned = subscribers.is_empty();
    }
    if orphaned {
      state.by_key.remove(&key);
      Some(key)
    } else {
      None
    }
  };

  if let Some(key) = orphaned {
    debug!(key = %key, "last subscriber left");
    schedule_eviction_inner(inner, &key);
  }
}

fn schedule_eviction_inner(inner: &Arc<RegistryInner>, key: &QueryKey) {
  let generation = {
    let mut state = inner.state.lock();
    if state.by_key.contains_key(key) {
      return;
    }
    state.next_generation += 1;
    let generation = state.next_generation;
    if let Some(old) = state.timers.insert(
      key.clone(),
      EvictionTimer {
        generation,
        task: None,
      },
    ) {
      if let Some(task) = old.task {
        task.abort();
      }
    }
    generation
  };

  if inner.gc_time.is_zero() {
    fire_eviction(inner, key, generation);
    return;
  }

  let Ok(handle) = tokio::runtime::Handle::try_current() else {
    debug!(key = %key, "no runtime, eviction timer not started");
    inner.state.lock().timers.remove(key);
    return;
  };

  let weak = Arc::downgrade(inner);
  let gc_time = inner.gc_time;
  let task_key = key.clone();
  let task = handle.spawn(async move {
    tokio::time::sleep(gc_time).await;
    if let Some(inner) = weak.upgrade() {
      fire_eviction(&inner, &task_key, generation);
    }
  });

  let mut state = inner.state.lock();
  match state.timers.get_mut(key) {
    Some(timer) if timer.generation == generation => timer.task = Some(task),
    // cancelled or replaced while spawning
    _ => task.abort(),
  }
}

fn fire_eviction(inner: &Arc<RegistryInner>, key: &QueryKey, generation: u64) {
  {
    let mut state = inner.state.lock();
    match state.timers.get(key) {
      Some(timer) if timer.generation == generation && !state.by_key.contains_key(key) => {
        state.timers.remove(key);
      }
      _ => return,
    }
  }
  if let Some(evictor) = inner.evictor.get() {
    evictor(key);
  }
}

/// RAII handle of one subscription.
pub struct Subscription {
  id: SubscriberId,
  key: QueryKey,
  registry: Weak<RegistryInner>,
  detached: bool,
}

impl Subscription {
  pub fn id(&self) -> SubscriberId {
    self.id
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Same as dropping the handle.
  pub fn unsubscribe(mut self) {
    self.detach();
  }

  fn detach(&mut self) {
    if self.detached {
      return;
    }
    self.detached = true;
    if let Some(inner) = self.registry.upgrade() {
      unsubscribe_inner(&inner, self.id);
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.detach();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("id", &self.id)
      .field("key", &self.key)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  use serde_json::json;

  fn key(id: &str) -> QueryKey {
    QueryKey::new("news-detail", json!({ "id": id })).unwrap()
  }

  fn counting(counter: &Arc<AtomicUsize>) -> Callback {
    let counter = counter.clone();
    Arc::new(move |_: &CacheEntry| {
      counter.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[test]
  fn test_notifies_in_registration_order() {
    let registry = SubscriptionRegistry::new(Duration::from_secs(60));
    let key = key("42");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let first = {
      let seen = seen.clone();
      registry.subscribe(&key, Arc::new(move |_: &CacheEntry| seen.lock().push("first")))
    };
    let second = {
      let seen = seen.clone();
      registry.subscribe(&key, Arc::new(move |_: &CacheEntry| seen.lock().push("second")))
    };

    registry.enqueue(&key, CacheEntry::new(key.clone()));
    registry.flush();

    assert_eq!(*seen.lock(), vec!["first", "second"]);
    assert_eq!(registry.observer_count(&key), 2);
    drop(first);
    drop(second);
    assert_eq!(registry.observer_count(&key), 0);
  }

  #[test]
  fn test_detached_subscriber_is_not_called() {
    let registry = SubscriptionRegistry::new(Duration::from_secs(60));
    let key = key("42");
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = registry.subscribe(&key, counting(&calls));
    subscription.unsubscribe();

    registry.enqueue(&key, CacheEntry::new(key.clone()));
    registry.flush();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_callback_can_unsubscribe_a_later_subscriber() {
    let registry = SubscriptionRegistry::new(Duration::from_secs(60));
    let key = key("42");
    let calls = Arc::new(AtomicUsize::new(0));

    let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let _killer = {
      let victim = victim.clone();
      registry.subscribe(
        &key,
        Arc::new(move |_: &CacheEntry| {
          victim.lock().take();
        }),
      )
    };
    *victim.lock() = Some(registry.subscribe(&key, counting(&calls)));

    registry.enqueue(&key, CacheEntry::new(key.clone()));
    registry.flush();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_eviction_after_window() {
    let registry = SubscriptionRegistry::new(Duration::from_secs(300));
    let evicted = Arc::new(Mutex::new(Vec::new()));
    {
      let evicted = evicted.clone();
      registry.set_evictor(Arc::new(move |key: &QueryKey| evicted.lock().push(key.clone())));
    }
    let key = key("42");

    let subscription = registry.subscribe(&key, Arc::new(|_: &CacheEntry| {}));
    drop(subscription);

    tokio::time::sleep(Duration::from_secs(299)).await;
    assert!(evicted.lock().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(*evicted.lock(), vec![key]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_resubscribe_cancels_eviction() {
    let registry = SubscriptionRegistry::new(Duration::from_secs(300));
    let evicted = Arc::new(AtomicUsize::new(0));
    {
      let evicted = evicted.clone();
      registry.set_evictor(Arc::new(move |_: &QueryKey| {
        evicted.fetch_add(1, Ordering::SeqCst);
      }));
    }
    let key = key("42");

    drop(registry.subscribe(&key, Arc::new(|_: &CacheEntry| {})));
    tokio::time::sleep(Duration::from_secs(100)).await;
    let _again = registry.subscribe(&key, Arc::new(|_: &CacheEntry| {}));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(evicted.load(Ordering::SeqCst), 0);
  }
}
