//! Per-key cache entry and its status.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::FetchError;

/// Lifecycle status of a query entry.
///
/// Independent of [`QueryEntry::is_fetching`]: a background refetch runs while
/// the status stays `Success` and the previous data stays visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Created but never fetched
  Idle,
  /// First fetch in flight, no data yet
  Loading,
  /// Last settled fetch (or cache write) produced data
  Success,
  /// Retries exhausted; `data` may still hold the last good value
  Error,
}

/// Snapshot of one cached resource.
///
/// `data` is shared behind an `Arc`, so cloning an entry is cheap and two reads
/// with nothing in between hand out the very same payload allocation.
#[derive(Debug)]
pub struct QueryEntry<T> {
  pub data: Option<Arc<T>>,
  pub status: QueryStatus,
  pub is_fetching: bool,
  /// When the last successful fetch settled.
  pub last_fetched_at: Option<Instant>,
  pub stale_after: Duration,
  pub retry_count: u32,
  pub max_retries: u32,
  pub error: Option<FetchError>,
  /// Set by `invalidate`; forces the next read to refetch regardless of age.
  pub is_invalidated: bool,
}

impl<T> QueryEntry<T> {
  pub(crate) fn new(stale_after: Duration, max_retries: u32) -> Self {
    Self {
      data: None,
      status: QueryStatus::Idle,
      is_fetching: false,
      last_fetched_at: None,
      stale_after,
      retry_count: 0,
      max_retries,
      error: None,
      is_invalidated: false,
    }
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_deref()
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

  /// Whether the data is past its freshness window at `now`.
  ///
  /// Never-fetched entries are always stale, even when seeded with data.
  pub fn is_stale_at(&self, now: Instant) -> bool {
    if self.is_invalidated {
      return true;
    }
    match self.last_fetched_at {
      Some(fetched_at) => now.saturating_duration_since(fetched_at) > self.stale_after,
      None => true,
    }
  }

  pub fn is_stale(&self) -> bool {
    self.is_stale_at(Instant::now())
  }

  /// Whether a read at `now` should schedule a fetch.
  pub(crate) fn needs_fetch_at(&self, now: Instant) -> bool {
    self.status != QueryStatus::Loading && !self.is_fetching && self.is_stale_at(now)
  }
}

impl<T> Clone for QueryEntry<T> {
  fn clone(&self) -> Self {
    Self {
      data: self.data.clone(),
      status: self.status,
      is_fetching: self.is_fetching,
      last_fetched_at: self.last_fetched_at,
      stale_after: self.stale_after,
      retry_count: self.retry_count,
      max_retries: self.max_retries,
      error: self.error.clone(),
      is_invalidated: self.is_invalidated,
    }
  }
}

impl<T: PartialEq> PartialEq for QueryEntry<T> {
  fn eq(&self, other: &Self) -> bool {
    self.data == other.data
      && self.status == other.status
      && self.is_fetching == other.is_fetching
      && self.last_fetched_at == other.last_fetched_at
      && self.stale_after == other.stale_after
      && self.retry_count == other.retry_count
      && self.max_retries == other.max_retries
      && self.error == other.error
      && self.is_invalidated == other.is_invalidated
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_stale_boundary_is_exclusive() {
    let mut entry: QueryEntry<u32> = QueryEntry::new(Duration::from_millis(100), 0);
    let t0 = Instant::now();
    entry.last_fetched_at = Some(t0);
    entry.status = QueryStatus::Success;

    assert!(!entry.is_stale_at(t0 + Duration::from_millis(99)));
    assert!(!entry.is_stale_at(t0 + Duration::from_millis(100)));
    assert!(entry.is_stale_at(t0 + Duration::from_millis(101)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_never_fetched_is_stale() {
    let entry: QueryEntry<u32> = QueryEntry::new(Duration::from_secs(60), 0);
    assert!(entry.is_stale());
    assert!(entry.needs_fetch_at(Instant::now()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_in_flight_entry_never_needs_fetch() {
    let mut entry: QueryEntry<u32> = QueryEntry::new(Duration::ZERO, 0);
    entry.is_fetching = true;
    assert!(!entry.needs_fetch_at(Instant::now()));

    entry.is_fetching = false;
    entry.status = QueryStatus::Loading;
    assert!(!entry.needs_fetch_at(Instant::now()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidated_is_stale_even_when_fresh() {
    let mut entry: QueryEntry<u32> = QueryEntry::new(Duration::from_secs(60), 0);
    entry.last_fetched_at = Some(Instant::now());
    assert!(!entry.is_stale());
    entry.is_invalidated = true;
    assert!(entry.is_stale());
  }
}
