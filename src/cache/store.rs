//! Process-wide cache store.
//!
//! One map from key to entry behind a single lock. Every write goes through
//! [`CacheStore::update`], which bumps the entry version and queues the
//! resulting entry for subscribers before the lock is released. Delivery
//! itself happens after the lock is dropped, so callbacks may read or write
//! the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::entry::{CacheEntry, EntryPatch};
use crate::key::{KeyMatcher, QueryKey};
use crate::subscription::{Callback, Subscription, SubscriptionRegistry};

struct StoreInner {
  entries: Mutex<HashMap<QueryKey, CacheEntry>>,
  next_version: AtomicU64,
  registry: SubscriptionRegistry,
}

/// Shared cache of query results. Cheap to clone, clones share the entries.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<StoreInner>,
}

impl CacheStore {
  /// Create an empty store. Keys nobody observes are evicted `gc_time` after
  /// their last subscriber leaves.
  pub fn new(gc_time: Duration) -> Self {
    let inner = Arc::new_cyclic(|weak: &Weak<StoreInner>| {
      let registry = SubscriptionRegistry::new(gc_time);
      let weak = weak.clone();
      registry.set_evictor(Arc::new(move |key: &QueryKey| {
        if let Some(inner) = weak.upgrade() {
          CacheStore { inner }.evict_if_unobserved(key);
        }
      }));
      StoreInner {
        entries: Mutex::new(HashMap::new()),
        next_version: AtomicU64::new(0),
        registry,
      }
    });
    Self { inner }
  }

  pub fn registry(&self) -> &SubscriptionRegistry {
    &self.inner.registry
  }

  /// Observe every transition of `key`.
  pub fn subscribe(&self, key: &QueryKey, callback: Callback) -> Subscription {
    self.inner.registry.subscribe(key, callback)
  }

  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.inner.entries.lock().get(key).cloned()
  }

  pub fn contains(&self, key: &QueryKey) -> bool {
    self.inner.entries.lock().contains_key(key)
  }

  /// Replace the entry for `entry.key`. Pending optimistic patch records of
  /// the old entry are discarded with it.
  pub fn set(&self, entry: CacheEntry) {
    let key = entry.key.clone();
    self.update(&key, move |slot| {
      *slot = Some(entry);
      ((), true)
    });
  }

  /// Apply a partial update, creating an idle entry first if needed.
  pub fn patch(&self, key: &QueryKey, patch: EntryPatch) -> CacheEntry {
    self.update(key, |slot| {
      let entry = slot.get_or_insert_with(|| CacheEntry::new(key.clone()));
      patch.apply(entry);
      (entry.clone(), true)
    })
  }

  /// Drop the entry entirely.
  pub fn remove(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.update(key, |slot| {
      let removed = slot.take();
      let changed = removed.is_some();
      (removed, changed)
    })
  }

  /// Mark matching entries stale without clearing their data. Returns the
  /// keys that were marked.
  pub fn invalidate(&self, matcher: &KeyMatcher) -> Vec<QueryKey> {
    let keys: Vec<QueryKey> = self
      .inner
      .entries
      .lock()
      .keys()
      .filter(|key| matcher.matches(key))
      .cloned()
      .collect();

    let now = Instant::now();
    let mut invalidated = Vec::with_capacity(keys.len());
    for key in keys {
      let marked = self.update(&key, |slot| match slot.as_mut() {
        Some(entry) => {
          entry.stale_at = Some(now);
          (true, true)
        }
        None => (false, false),
      });
      if marked {
        invalidated.push(key);
      }
    }
    debug!(matcher = ?matcher, count = invalidated.len(), "invalidated entries");
    invalidated
  }

  /// Evict every entry, for logout or shutdown.
  pub fn clear(&self) -> usize {
    let keys = self.keys();
    let mut removed = 0;
    for key in keys {
      if self.remove(&key).is_some() {
        removed += 1;
      }
    }
    debug!(removed, "cache cleared");
    removed
  }

  pub fn keys(&self) -> Vec<QueryKey> {
    self.inner.entries.lock().keys().cloned().collect()
  }

  /// Clone of every entry.
  pub fn snapshot(&self) -> Vec<CacheEntry> {
    self.inner.entries.lock().values().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.inner.entries.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.entries.lock().is_empty()
  }

  /// The single write path. `f` returns its result and whether it changed the
  /// slot. Changed entries get a new version and are published to
  /// subscribers, a removal is published as an idle entry without data.
  pub(crate) fn update<R>(
    &self,
    key: &QueryKey,
    f: impl FnOnce(&mut Option<CacheEntry>) -> (R, bool),
  ) -> R {
    let (out, changed) = {
      let mut entries = self.inner.entries.lock();
      let mut slot = entries.remove(key);
      let (out, changed) = f(&mut slot);

      if changed {
        let version = self.inner.next_version.fetch_add(1, Ordering::Relaxed) + 1;
        let published = match slot.as_mut() {
          Some(entry) => {
            entry.version = version;
            entry.clone()
          }
          None => {
            let mut gone = CacheEntry::new(key.clone());
            gone.version = version;
            gone
          }
        };
        self.inner.registry.enqueue(key, published);
      }
      if let Some(entry) = slot {
        entries.insert(key.clone(), entry);
      }
      (out, changed)
    };

    if changed {
      self.inner.registry.flush();
    }
    out
  }

  /// Eviction timer callback: drop the entry unless someone subscribed again
  /// or it is still busy with a fetch or an optimistic patch.
  fn evict_if_unobserved(&self, key: &QueryKey) {
    let registry = self.inner.registry.clone();
    let evicted = self.update(key, |slot| {
      let busy = slot
        .as_ref()
        .is_some_and(|e| e.in_flight.is_some() || e.pending_patches() > 0);
      if slot.is_none() || busy || registry.observer_count(key) > 0 {
        return (false, false);
      }
      *slot = None;
      (true, true)
    });
    if evicted {
      debug!(key = %key, "evicted unobserved entry");
    }
  }
}

impl std::fmt::Debug for CacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheStore")
      .field("entries", &self.len())
      .field("registry", &self.inner.registry)
      .finish()
  }
}
