//! The read capability a caller hands to the query coordinator.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::error::FetchError;
use crate::key::QueryKey;

/// Resolves a key to raw data. Knows nothing about caching.
///
/// Must be side-effect free. It may run concurrently for different keys, the
/// coordinator guarantees at most one concurrent call per key. Deadlines are
/// the fetcher's job and are reported as [`FetchError::Timeout`].
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, key: &QueryKey) -> BoxFuture<'static, Result<Value, FetchError>>;
}

impl<F, Fut> Fetcher for F
where
  F: Fn(&QueryKey) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
  fn fetch(&self, key: &QueryKey) -> BoxFuture<'static, Result<Value, FetchError>> {
    (self)(key).boxed()
  }
}

pub type SharedFetcher = Arc<dyn Fetcher>;

/// Wrap a fetcher for sharing between coordinators.
pub fn shared(fetcher: impl Fetcher) -> SharedFetcher {
  Arc::new(fetcher)
}
