//! Error types shared across the sync layer.
//!
//! Query failures never cross component boundaries: they are recorded on the
//! entry as a [`FetchError`]. Mutation failures are returned to the caller as
//! a [`MutationError`] after the rollback has been applied. Store hydration
//! problems are recovered locally and never show up here.

use thiserror::Error;

/// Failure talking to the remote resource endpoints.
#[derive(Debug, Error)]
pub enum ClientError {
  /// Connection, timeout or other transport failure.
  #[error("network error: {0}")]
  Network(#[from] reqwest::Error),

  /// The server answered with a non-2xx status.
  #[error("{method} {url} returned {status}")]
  Status {
    method: &'static str,
    url: String,
    status: u16,
  },

  /// The response body did not match the expected payload.
  #[error("failed to decode response from {url}: {source}")]
  Decode {
    url: String,
    #[source]
    source: serde_json::Error,
  },

  /// An endpoint path could not be joined onto the base URL.
  #[error("invalid url: {0}")]
  InvalidUrl(#[from] url::ParseError),

  /// The resource could not be reached for a reason outside HTTP status codes,
  /// e.g. an offline fetcher. Treated as transient.
  #[error("resource unavailable: {0}")]
  Unavailable(String),
}

impl ClientError {
  /// Whether retrying the same request could plausibly succeed.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Network(_) | Self::Unavailable(_) => true,
      Self::Status { status, .. } => *status >= 500,
      Self::Decode { .. } | Self::InvalidUrl(_) => false,
    }
  }
}

/// Last failure of a query fetch, kept on the entry until the next success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FetchError {
  pub message: String,
  /// Number of attempts made before giving up (initial try plus retries).
  pub attempts: u32,
}

impl FetchError {
  pub fn new(source: &ClientError, attempts: u32) -> Self {
    Self {
      message: source.to_string(),
      attempts,
    }
  }
}

/// A mutation was rejected; the speculative write has already been rolled back.
#[derive(Debug, Error)]
#[error("mutation on {key} failed: {source}")]
pub struct MutationError {
  pub key: String,
  #[source]
  pub source: ClientError,
}

/// Failure of a persisted store action.
#[derive(Debug, Error)]
pub enum StoreError {
  /// An action ran before hydration finished.
  #[error("store is not hydrated yet")]
  NotReady,

  /// Durable storage rejected the write; in-memory state was left untouched.
  #[error("durable storage error: {0}")]
  Storage(String),

  #[error("failed to encode store value: {0}")]
  Encode(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Storage(e.to_string())
  }
}
