//! Async query cache for server data.
//!
//! Inspired by TanStack Query: a [`Query<T>`] describes how to fetch one
//! resource (its key, fetcher, freshness window and retry policy) and a
//! [`QueryCache<T>`] owns one [`QueryEntry<T>`] per key, keeping it up to date.
//!
//! # Example
//!
//! ```ignore
//! let api = products_client.clone();
//! let cache = QueryCache::new();
//! cache.define(
//!   Query::new(QueryKey::from("products"), move || {
//!     let api = api.clone();
//!     async move { api.list_products().await }
//!   })
//!   .with_stale_time(Duration::from_secs(30))
//!   .with_retry(RetryPolicy::new(5)),
//! );
//!
//! // Render path: reading schedules a fetch when the data is stale
//! let entry = cache.read(&QueryKey::from("products"));
//! match entry.status {
//!   QueryStatus::Loading => render_spinner(),
//!   QueryStatus::Success => render_products(entry.data()),
//!   QueryStatus::Error => render_error(entry.error.as_ref()),
//!   QueryStatus::Idle => {}
//! }
//! ```

mod cache;
mod entry;
mod key;
mod retry;

pub use cache::{Listener, QueryCache};
pub(crate) use cache::FetchPause;
pub use entry::{QueryEntry, QueryStatus};
pub use key::{KeyPart, QueryKey};
pub use retry::RetryPolicy;

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ClientError;

/// Freshness window used when a query doesn't set one.
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(30);

/// A factory that creates a new fetch future on every call.
type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, ClientError>> + Send + Sync>;

/// Definition of a cacheable query.
///
/// Query<T> carries:
/// - The key identifying the resource
/// - The fetching logic (via a closure)
/// - The stale time after which a read triggers a background refetch
/// - The retry policy applied to failed fetches
/// - Optional initial data seeded into a fresh entry
pub struct Query<T> {
  key: QueryKey,
  fetcher: FetcherFn<T>,
  stale_time: Duration,
  retry: RetryPolicy,
  initial_data: Option<Arc<T>>,
}

impl<T: Send + Sync + 'static> Query<T> {
  /// Create a new query with the given fetcher function.
  ///
  /// The fetcher is a closure that returns a future. It is called for every
  /// attempt, including retries.
  pub fn new<F, Fut>(key: QueryKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
  {
    Self {
      key,
      fetcher: Arc::new(move || fetcher().boxed()),
      stale_time: DEFAULT_STALE_TIME,
      retry: RetryPolicy::default(),
      initial_data: None,
    }
  }

  /// Set the stale time for this query.
  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Seed the entry with data obtained elsewhere (e.g. rendered on the server).
  ///
  /// Seeded data shows immediately but counts as never fetched, so the first
  /// read still revalidates it in the background.
  pub fn with_initial_data(mut self, data: T) -> Self {
    self.initial_data = Some(Arc::new(data));
    self
  }
}

impl<T> Query<T> {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn stale_time(&self) -> Duration {
    self.stale_time
  }

  pub fn retry(&self) -> RetryPolicy {
    self.retry
  }

  pub(crate) fn fetch(&self) -> BoxFuture<'static, Result<T, ClientError>> {
    (self.fetcher)()
  }

  pub(crate) fn initial_data(&self) -> Option<Arc<T>> {
    self.initial_data.clone()
  }
}

impl<T> Clone for Query<T> {
  fn clone(&self) -> Self {
    Self {
      key: self.key.clone(),
      fetcher: Arc::clone(&self.fetcher),
      stale_time: self.stale_time,
      retry: self.retry,
      initial_data: self.initial_data.clone(),
    }
  }
}

impl<T> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("stale_time", &self.stale_time)
      .field("retry", &self.retry)
      .finish_non_exhaustive()
  }
}
