//! Error taxonomy for the query cache.
//!
//! Fetch and timeout failures are retried by the query coordinator and end up
//! as a terminal `error` status on the cache entry. Key errors are raised while
//! building a key and are never retried. Mutation errors are handed back to the
//! caller together with the outcome of the rollback.

use std::time::Duration;

use thiserror::Error;

use crate::key::QueryKey;

/// Failure to build a [`QueryKey`] from a parameter bag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
  #[error("resource kind must not be empty")]
  EmptyKind,

  #[error("parameter `{name}` is not serializable: {reason}")]
  NotSerializable { name: String, reason: String },

  #[error("parameter `{name}` holds a non-finite number")]
  NonFinite { name: String },

  #[error("parameter bag must be a JSON object, got {found}")]
  NotAMap { found: &'static str },

  #[error("malformed canonical key `{input}`: {reason}")]
  Malformed { input: String, reason: String },
}

/// Failure reported by a fetcher or by the REST collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  #[error("server responded with {status}: {message}")]
  Status { status: u16, message: String },

  #[error("transport error: {0}")]
  Transport(String),

  #[error("invalid response body: {0}")]
  Decode(String),

  #[error("request timed out after {0:?}")]
  Timeout(Duration),

  #[error("request cancelled")]
  Cancelled,

  /// The request could not be built, e.g. no route for the resource kind.
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl FetchError {
  /// HTTP status code, when the server produced one.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Status { status, .. } => Some(*status),
      _ => None,
    }
  }

  pub fn is_timeout(&self) -> bool {
    matches!(self, Self::Timeout(_))
  }

  /// Whether the retry policy may try again after this failure.
  ///
  /// Client errors are terminal, except request timeout (408) and
  /// rate limiting (429).
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Status { status, .. } => !(400..500).contains(status) || *status == 408 || *status == 429,
      Self::Transport(_) | Self::Timeout(_) => true,
      Self::Decode(_) | Self::Cancelled | Self::InvalidRequest(_) => false,
    }
  }
}

/// How the cache was left after a failed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackReport {
  /// Every affected key is back to a consistent state.
  Clean,
  /// The patch record of at least one key was lost, so its entry could not be
  /// restored and was removed from the cache instead.
  Fault { torn_down: Vec<QueryKey> },
}

impl RollbackReport {
  pub fn is_clean(&self) -> bool {
    matches!(self, Self::Clean)
  }
}

/// A write failed after its optimistic updates were applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("mutation failed ({rollback_summary}): {source}")]
pub struct MutationError {
  #[source]
  pub source: FetchError,
  pub rollback: RollbackReport,
  rollback_summary: &'static str,
}

impl MutationError {
  pub fn new(source: FetchError, rollback: RollbackReport) -> Self {
    let rollback_summary = if rollback.is_clean() {
      "rolled back"
    } else {
      "rollback fault, entries torn down"
    };
    Self {
      source,
      rollback,
      rollback_summary,
    }
  }

  /// `true` when the cache is consistent again after the rollback.
  pub fn rolled_back_cleanly(&self) -> bool {
    self.rollback.is_clean()
  }
}

/// Failure of the optional snapshot persistence.
#[derive(Debug, Error)]
pub enum PersistError {
  #[error("snapshot database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("snapshot encoding error: {0}")]
  Encoding(#[from] serde_json::Error),

  #[error("snapshot holds an unreadable key: {0}")]
  Key(#[from] KeyError),

  #[error("failed to prepare snapshot location {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_retryable_statuses() {
    let status = |status| FetchError::Status {
      status,
      message: String::new(),
    };
    assert!(status(500).is_retryable());
    assert!(status(503).is_retryable());
    assert!(status(429).is_retryable());
    assert!(status(408).is_retryable());
    assert!(!status(404).is_retryable());
    assert!(!status(422).is_retryable());
    assert!(FetchError::Timeout(Duration::from_secs(5)).is_retryable());
    assert!(!FetchError::Cancelled.is_retryable());
  }

  #[test]
  fn test_mutation_error_reports_rollback() {
    let err = MutationError::new(
      FetchError::Status {
        status: 500,
        message: "boom".into(),
      },
      RollbackReport::Clean,
    );
    assert!(err.rolled_back_cleanly());
    assert_eq!(err.source.status(), Some(500));
    assert!(err.to_string().contains("rolled back"));
  }
}
