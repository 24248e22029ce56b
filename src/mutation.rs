//! Optimistic mutations against the query cache.
//!
//! A [`Mutation`] pairs a server call with an optional speculative transform
//! of the cached data. [`MutationCoordinator::mutate`] runs the protocol for
//! one invocation:
//!
//! 1. cancel any in-flight fetch for the key
//! 2. snapshot the current entry
//! 3. write the speculative data so subscribers see it immediately
//! 4. call the server
//! 5. on success, drop the snapshot and invalidate the key so the cache
//!    reconciles with what the server actually stored
//! 6. on failure, restore the snapshot verbatim and return the error
//!
//! A `mutate` future dropped before the server answers (a timeout, a lost
//! `select!` branch) rolls back as on failure, then invalidates the key since
//! the server outcome is unknown.
//!
//! Invocations on the same key run one after another; different keys don't
//! wait for each other.

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ClientError, FetchError, MutationError};
use crate::query::{FetchPause, QueryCache, QueryKey, QueryStatus};

type MutationFn<V, R> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<R, ClientError>> + Send + Sync>;
type OptimisticFn<T, V> = Arc<dyn Fn(&V, Option<&T>) -> Option<T> + Send + Sync>;

/// Entry state captured before a speculative write.
///
/// Owned by the invocation that took it and dropped once that invocation
/// settles. An absent `previous_data` is restored as absent, never as an
/// empty value.
#[derive(Debug)]
pub struct MutationSnapshot<T> {
  pub key: QueryKey,
  pub previous_data: Option<Arc<T>>,
  previous_status: QueryStatus,
  previous_error: Option<FetchError>,
}

/// A server write against the resource cached under `key`.
///
/// `T` is the cached data, `V` the variables passed per invocation and `R`
/// the server's response.
pub struct Mutation<T, V, R> {
  key: QueryKey,
  mutation_fn: MutationFn<V, R>,
  optimistic: Option<OptimisticFn<T, V>>,
}

impl<T, V, R> Mutation<T, V, R>
where
  T: Send + Sync + 'static,
  V: Send + 'static,
  R: Send + 'static,
{
  pub fn new<F, Fut>(key: QueryKey, mutation_fn: F) -> Self
  where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ClientError>> + Send + 'static,
  {
    Self {
      key,
      mutation_fn: Arc::new(move |variables| mutation_fn(variables).boxed()),
      optimistic: None,
    }
  }

  /// Speculative transform `(variables, previous data) -> new data`, applied
  /// before the server call. Must be pure. Returning `None` skips the
  /// speculative write for that invocation.
  pub fn with_optimistic_update<F>(mut self, update: F) -> Self
  where
    F: Fn(&V, Option<&T>) -> Option<T> + Send + Sync + 'static,
  {
    self.optimistic = Some(Arc::new(update));
    self
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }
}

/// Runs [`Mutation`]s against a shared [`QueryCache`].
pub struct MutationCoordinator<T> {
  cache: QueryCache<T>,
}

impl<T> Clone for MutationCoordinator<T> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
    }
  }
}

impl<T: Send + Sync + 'static> MutationCoordinator<T> {
  pub fn new(cache: QueryCache<T>) -> Self {
    Self { cache }
  }

  pub fn cache(&self) -> &QueryCache<T> {
    &self.cache
  }

  /// Execute `mutation` with `variables`, returning the server's response.
  ///
  /// On failure the cached entry is already rolled back when this returns.
  pub async fn mutate<V, R>(
    &self,
    mutation: &Mutation<T, V, R>,
    variables: V,
  ) -> Result<R, MutationError>
  where
    V: Send + 'static,
    R: Send + 'static,
  {
    let key = mutation.key();
    let lock = self.cache.mutation_lock(key);
    let _serialized = lock.lock().await;

    if self.cache.cancel(key) {
      debug!(key = %key, "cancelled in-flight fetch before mutating");
    }
    let pause = self.cache.pause_fetches(key);
    let in_flight = InFlight {
      cache: self.cache.clone(),
      snapshot: Some(self.snapshot(key)),
      pause: Some(pause),
    };

    let speculative = mutation
      .optimistic
      .as_ref()
      .and_then(|update| update(&variables, in_flight.previous_data()));
    if let Some(speculative) = speculative {
      self.cache.set_data(key, speculative);
      debug!(key = %key, "applied optimistic update");
    }

    match (mutation.mutation_fn)(variables).await {
      Ok(response) => {
        in_flight.commit();
        info!(key = %key, "mutation succeeded; invalidating");
        self.cache.invalidate(key);
        Ok(response)
      }
      Err(source) => {
        warn!(key = %key, error = %source, "mutation failed; rolling back");
        in_flight.roll_back();
        Err(MutationError {
          key: key.to_string(),
          source,
        })
      }
    }
  }

  fn snapshot(&self, key: &QueryKey) -> MutationSnapshot<T> {
    let entry = self.cache.peek(key);
    MutationSnapshot {
      key: key.clone(),
      previous_data: entry.as_ref().and_then(|e| e.data.clone()),
      previous_status: entry.as_ref().map_or(QueryStatus::Idle, |e| e.status),
      previous_error: entry.and_then(|e| e.error),
    }
  }
}

/// Snapshot and fetch pause held for one invocation until it settles.
///
/// Dropped unsettled, it restores the snapshot and invalidates the key.
struct InFlight<T: Send + Sync + 'static> {
  cache: QueryCache<T>,
  snapshot: Option<MutationSnapshot<T>>,
  pause: Option<FetchPause<T>>,
}

impl<T: Send + Sync + 'static> InFlight<T> {
  fn previous_data(&self) -> Option<&T> {
    self
      .snapshot
      .as_ref()
      .and_then(|snapshot| snapshot.previous_data.as_deref())
  }

  /// The server accepted the write: keep the speculative data.
  fn commit(mut self) {
    self.snapshot = None;
    self.pause = None;
  }

  fn roll_back(mut self) {
    self.restore();
  }

  fn restore(&mut self) {
    if let Some(snapshot) = self.snapshot.take() {
      // An explicit refetch may have started meanwhile; it must not land
      // on top of the restored data.
      self.cache.cancel(&snapshot.key);
      self.cache.write_settled(
        &snapshot.key,
        snapshot.previous_data,
        snapshot.previous_status,
        snapshot.previous_error,
      );
    }
    self.pause = None;
  }
}

impl<T: Send + Sync + 'static> Drop for InFlight<T> {
  fn drop(&mut self) {
    let Some(key) = self.snapshot.as_ref().map(|snapshot| snapshot.key.clone()) else {
      return;
    };
    warn!(key = %key, "mutation abandoned before settling; rolling back");
    self.restore();
    self.cache.invalidate(&key);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::Product;
  use crate::query::{Query, QueryEntry};
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  fn key() -> QueryKey {
    QueryKey::from("products")
  }

  fn append(name: &'static str, id: u64) -> Mutation<Vec<Product>, Result<(), ()>, Product> {
    Mutation::new(key(), move |outcome: Result<(), ()>| async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      match outcome {
        Ok(()) => Ok(Product::new(id, name)),
        Err(()) => Err(ClientError::Status {
          method: "POST",
          url: "/api/products".to_string(),
          status: 500,
        }),
      }
    })
    .with_optimistic_update(move |_, previous: Option<&Vec<Product>>| {
      let mut next = previous.cloned().unwrap_or_default();
      next.push(Product::new(id, name));
      Some(next)
    })
  }

  fn seeded() -> MutationCoordinator<Vec<Product>> {
    let cache = QueryCache::new();
    cache.set_data(&key(), vec![Product::new(1, "A")]);
    MutationCoordinator::new(cache)
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_mutation_rolls_back_exactly() {
    let coordinator = seeded();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = coordinator
      .cache()
      .subscribe(&key(), move |entry: &QueryEntry<Vec<Product>>| {
        sink.lock().unwrap().push(entry.data().map(|d| d.len()));
      });

    let result = coordinator.mutate(&append("B", 2), Err(())).await;

    let err = result.unwrap_err();
    assert!(err.to_string().contains("500"));
    assert_eq!(
      coordinator.cache().get_data(&key()).as_deref(),
      Some(&vec![Product::new(1, "A")])
    );
    // Subscribers saw the speculative append, then the rollback.
    assert_eq!(*seen.lock().unwrap(), vec![Some(2), Some(1)]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rollback_restores_absent_data() {
    let coordinator: MutationCoordinator<Vec<Product>> = MutationCoordinator::new(QueryCache::new());

    let result = coordinator.mutate(&append("B", 2), Err(())).await;

    assert!(result.is_err());
    let entry = coordinator.cache().peek(&key()).unwrap();
    assert!(entry.data.is_none());
    assert_eq!(entry.status, QueryStatus::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_keeps_speculative_data_and_invalidates() {
    let coordinator = seeded();

    let created = coordinator.mutate(&append("B", 2), Ok(())).await.unwrap();

    assert_eq!(created, Product::new(2, "B"));
    let entry = coordinator.cache().peek(&key()).unwrap();
    assert!(entry.is_invalidated);
    assert_eq!(
      entry.data(),
      Some(&vec![Product::new(1, "A"), Product::new(2, "B")])
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_refetches_mounted_query() {
    let fetches = Arc::new(AtomicU32::new(0));
    let counter = fetches.clone();
    let cache = QueryCache::new();
    cache.define(
      Query::new(key(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(vec![Product::new(1, "A"), Product::new(2, "B (server)")]) }
      })
      .with_stale_time(Duration::from_secs(300)),
    );
    let coordinator = MutationCoordinator::new(cache.clone());

    let _sub = cache.subscribe(&key(), |_: &QueryEntry<Vec<Product>>| {});
    cache.wait_settled(&key()).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    coordinator.mutate(&append("B", 2), Ok(())).await.unwrap();
    cache.wait_settled(&key()).await;

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(
      cache.get_data(&key()).as_deref(),
      Some(&vec![Product::new(1, "A"), Product::new(2, "B (server)")])
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_in_flight_fetch_cannot_overwrite_speculative_write() {
    let fetches = Arc::new(AtomicU32::new(0));
    let counter = fetches.clone();
    let cache = QueryCache::new();
    cache.define(
      Query::new(key(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
          tokio::time::sleep(Duration::from_millis(100)).await;
          Ok(vec![Product::new(9, "stale server copy")])
        }
      })
      .with_initial_data(vec![Product::new(1, "A")])
      .with_stale_time(Duration::ZERO),
    );
    let coordinator = MutationCoordinator::new(cache.clone());

    // Seeded data is fresh at the instant it was defined.
    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(cache.read(&key()).is_fetching);
    let mutation = append("B", 2);
    let mutate = coordinator.mutate(&mutation, Ok(()));
    let read_during = async {
      tokio::time::sleep(Duration::from_millis(5)).await;
      cache.read(&key())
    };
    let (result, during) = tokio::join!(mutate, read_during);
    result.unwrap();

    // The read during the mutation saw the speculative list and started nothing.
    assert!(!during.is_fetching);
    assert_eq!(during.data().map(|d| d.len()), Some(2));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(
      cache.get_data(&key()).as_deref(),
      Some(&vec![Product::new(1, "A"), Product::new(2, "B")])
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_same_key_mutations_are_serialized() {
    let coordinator = seeded();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();

    let second = Mutation::new(key(), |_: ()| async { Ok(()) }).with_optimistic_update(
      move |_, previous: Option<&Vec<Product>>| {
        let previous = previous.cloned().unwrap_or_default();
        sink.lock().unwrap().push(previous.len());
        let mut next = previous;
        next.push(Product::new(3, "C"));
        Some(next)
      },
    );

    let first = append("B", 2);
    let (a, b) = tokio::join!(
      coordinator.mutate(&first, Err(())),
      coordinator.mutate(&second, ())
    );
    assert!(a.is_err());
    assert!(b.is_ok());

    // The second snapshot was taken after the first rolled back.
    assert_eq!(*observed.lock().unwrap(), vec![1]);
    assert_eq!(
      coordinator.cache().get_data(&key()).as_deref(),
      Some(&vec![Product::new(1, "A"), Product::new(3, "C")])
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_rollback_restores_error_state() {
    let cache: QueryCache<Vec<Product>> = QueryCache::new();
    cache.define(
      Query::new(key(), || async { Err(ClientError::Unavailable("down".to_string())) })
        .with_retry(crate::query::RetryPolicy::none()),
    );
    cache.read(&key());
    cache.wait_settled(&key()).await;
    let before = cache.peek(&key()).unwrap();
    assert!(before.is_error());

    let coordinator = MutationCoordinator::new(cache.clone());
    assert!(coordinator.mutate(&append("B", 2), Err(())).await.is_err());

    let after = cache.peek(&key()).unwrap();
    assert!(after.is_error());
    assert!(after.data.is_none());
    assert_eq!(after.error, before.error);
  }

  /// Mounted query counting its fetches, serving `[A, B (server)]`.
  fn mounted_server_query(fetches: Arc<AtomicU32>) -> QueryCache<Vec<Product>> {
    let cache = QueryCache::new();
    cache.define(
      Query::new(key(), move || {
        fetches.fetch_add(1, Ordering::SeqCst);
        async {
          tokio::time::sleep(Duration::from_millis(100)).await;
          Ok(vec![Product::new(1, "A"), Product::new(2, "B (server)")])
        }
      })
      .with_stale_time(Duration::from_secs(300)),
    );
    cache
  }

  #[tokio::test(start_paused = true)]
  async fn test_abandoned_mutation_rolls_back_and_refetches() {
    let fetches = Arc::new(AtomicU32::new(0));
    let cache = QueryCache::new();
    let counter = fetches.clone();
    cache.define(
      Query::new(key(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(vec![Product::new(1, "A")]) }
      })
      .with_stale_time(Duration::from_secs(300)),
    );
    let coordinator = MutationCoordinator::new(cache.clone());
    let _sub = cache.subscribe(&key(), |_: &QueryEntry<Vec<Product>>| {});
    cache.wait_settled(&key()).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let slow = Mutation::new(key(), |_: ()| async {
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok(())
    })
    .with_optimistic_update(|_, previous: Option<&Vec<Product>>| {
      let mut next = previous.cloned().unwrap_or_default();
      next.push(Product::new(2, "B"));
      Some(next)
    });
    let outcome = tokio::time::timeout(Duration::from_secs(1), coordinator.mutate(&slow, ())).await;
    assert!(outcome.is_err());

    // The speculative row is gone and the server copy is fetched again.
    assert_eq!(
      cache.get_data(&key()).as_deref(),
      Some(&vec![Product::new(1, "A")])
    );
    cache.wait_settled(&key()).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    let entry = cache.peek(&key()).unwrap();
    assert!(!entry.is_invalidated);
    assert!(!entry.is_fetching);

    // The per-key lock was released with the dropped future.
    coordinator.mutate(&append("C", 3), Ok(())).await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_cancels_refetch_started_mid_mutation() {
    let fetches = Arc::new(AtomicU32::new(0));
    let cache = mounted_server_query(fetches.clone());
    cache.set_data(&key(), vec![Product::new(1, "A")]);
    let coordinator = MutationCoordinator::new(cache.clone());

    let mutation = append("B", 2);
    let refetch_during = async {
      tokio::time::sleep(Duration::from_millis(5)).await;
      cache.refetch(&key()).await;
    };
    let (result, ()) = tokio::join!(coordinator.mutate(&mutation, Err(())), refetch_during);
    assert!(result.is_err());
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    // The refetch was superseded by the rollback and its result is discarded.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let entry = cache.peek(&key()).unwrap();
    assert!(!entry.is_fetching);
    assert_eq!(entry.data(), Some(&vec![Product::new(1, "A")]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_during_mutation_defers_to_one_refetch() {
    let fetches = Arc::new(AtomicU32::new(0));
    let cache = mounted_server_query(fetches.clone());
    let coordinator = MutationCoordinator::new(cache.clone());
    let _sub = cache.subscribe(&key(), |_: &QueryEntry<Vec<Product>>| {});
    cache.wait_settled(&key()).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let mutation = append("B", 2);
    let invalidate_during = async {
      tokio::time::sleep(Duration::from_millis(5)).await;
      cache.invalidate(&key());
      (cache.peek(&key()).unwrap(), fetches.load(Ordering::SeqCst))
    };
    let (result, (during, fetches_during)) =
      tokio::join!(coordinator.mutate(&mutation, Ok(())), invalidate_during);
    result.unwrap();

    assert!(!during.is_fetching);
    assert!(during.is_invalidated);
    assert_eq!(fetches_during, 1);

    cache.wait_settled(&key()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(
      cache.get_data(&key()).as_deref(),
      Some(&vec![Product::new(1, "A"), Product::new(2, "B (server)")])
    );
  }
}
