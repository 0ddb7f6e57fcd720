//! Staleness, retry and eviction settings.
//!
//! None of these windows are business rules, so they are inputs with
//! defaults: 60 seconds of freshness, 3 retries with exponential backoff and
//! a 5 minute eviction window for keys nobody observes.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// How failed fetches are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Retries after the first attempt.
  pub max_retries: u32,
  #[serde(rename = "base_delay_ms", deserialize_with = "deserialize_millis")]
  pub base_delay: Duration,
  #[serde(rename = "max_delay_ms", deserialize_with = "deserialize_millis")]
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      ..Default::default()
    }
  }

  #[must_use]
  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  #[must_use]
  pub fn base_delay(mut self, delay: Duration) -> Self {
    self.base_delay = delay;
    self
  }

  /// Delay before retry number `retry` (0-based): the base delay doubled per
  /// retry, capped at `max_delay`.
  pub fn delay_for(&self, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }
}

/// Per-call options for resolving a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
  /// How long fetched data is served without revalidation.
  pub stale_time: Duration,
  pub retry: RetryPolicy,
  /// Disabled queries only read the cache, they never fetch.
  pub enabled: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(60),
      retry: RetryPolicy::default(),
      enabled: true,
    }
  }
}

impl QueryOptions {
  #[must_use]
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  #[must_use]
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  #[must_use]
  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }
}

/// Overrides for a single resource kind.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceConfig {
  #[serde(default, rename = "stale_time_secs", deserialize_with = "deserialize_opt_secs")]
  pub stale_time: Option<Duration>,
  pub retry: Option<RetryPolicy>,
}

/// Settings for a [`QueryClient`](crate::QueryClient).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
  #[serde(rename = "stale_time_secs", deserialize_with = "deserialize_secs")]
  pub stale_time: Duration,
  /// How long an unobserved key stays cached before eviction.
  #[serde(rename = "gc_time_secs", deserialize_with = "deserialize_secs")]
  pub gc_time: Duration,
  pub retry: RetryPolicy,
  /// Keyed by resource kind.
  pub resources: HashMap<String, ResourceConfig>,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(60),
      gc_time: Duration::from_secs(300),
      retry: RetryPolicy::default(),
      resources: HashMap::new(),
    }
  }
}

impl ClientConfig {
  #[must_use]
  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  #[must_use]
  pub fn gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = gc_time;
    self
  }

  #[must_use]
  pub fn retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  #[must_use]
  pub fn resource(mut self, kind: impl Into<String>, config: ResourceConfig) -> Self {
    self.resources.insert(kind.into(), config);
    self
  }

  /// Default options for a resource kind, with its overrides applied.
  pub fn options_for(&self, kind: &str) -> QueryOptions {
    let overrides = self.resources.get(kind);
    QueryOptions {
      stale_time: overrides
        .and_then(|r| r.stale_time)
        .unwrap_or(self.stale_time),
      retry: overrides.and_then(|r| r.retry).unwrap_or(self.retry),
      enabled: true,
    }
  }
}

fn deserialize_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(Duration::from_secs(u64::deserialize(deserializer)?))
}

fn deserialize_opt_secs<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_backoff_doubles_and_caps() {
    let retry = RetryPolicy::default();
    assert_eq!(retry.delay_for(0), Duration::from_secs(1));
    assert_eq!(retry.delay_for(1), Duration::from_secs(2));
    assert_eq!(retry.delay_for(2), Duration::from_secs(4));
    assert_eq!(retry.delay_for(5), Duration::from_secs(30));
    assert_eq!(retry.delay_for(40), Duration::from_secs(30));
  }

  #[test]
  fn test_resource_overrides() {
    let config = ClientConfig::default().resource(
      "news-list",
      ResourceConfig {
        stale_time: Some(Duration::from_secs(10)),
        retry: Some(RetryPolicy::none()),
      },
    );

    let news = config.options_for("news-list");
    assert_eq!(news.stale_time, Duration::from_secs(10));
    assert_eq!(news.retry.max_retries, 0);

    let other = config.options_for("pesantren-list");
    assert_eq!(other.stale_time, Duration::from_secs(60));
    assert_eq!(other.retry.max_retries, 3);
  }

  #[test]
  fn test_config_from_yaml() {
    let yaml = r#"
stale_time_secs: 120
gc_time_secs: 30
retry:
  max_retries: 5
  base_delay_ms: 200
resources:
  reviews:
    stale_time_secs: 15
"#;
    let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.stale_time, Duration::from_secs(120));
    assert_eq!(config.gc_time, Duration::from_secs(30));
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.base_delay, Duration::from_millis(200));
    assert_eq!(config.retry.max_delay, Duration::from_secs(30));
    assert_eq!(
      config.options_for("reviews").stale_time,
      Duration::from_secs(15)
    );
  }
}
