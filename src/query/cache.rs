//! Query cache engine.
//!
//! Owns one [`QueryEntry`] per [`QueryKey`] and drives its fetch lifecycle:
//! staleness checks on read, background fetches on a spawned task, retries
//! with exponential backoff, and supersession.
//!
//! Every fetch carries the slot's generation number. Starting, cancelling or
//! superseding a fetch bumps the generation and aborts the previous task;
//! results tagged with an older generation are discarded on arrival, so at
//! most one fetch per key ever writes to the entry.
//!
//! All entry mutations happen synchronously under the slot map lock.
//! Listeners are called after the lock is released, with a copy of the entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::entry::{QueryEntry, QueryStatus};
use super::key::QueryKey;
use super::retry::RetryPolicy;
use super::{Query, DEFAULT_STALE_TIME};
use crate::error::{ClientError, FetchError};
use crate::subscription::Subscription;

/// Callback invoked with the new entry after every change to it.
pub type Listener<T> = Arc<dyn Fn(&QueryEntry<T>) + Send + Sync>;

struct Slot<T> {
  entry: QueryEntry<T>,
  /// Fetch definition; `None` until `define` is called for this key
  query: Option<Query<T>>,
  generation: u64,
  task: Option<AbortHandle>,
  /// A failed attempt is waiting out its backoff delay
  retry_pending: bool,
  /// Outstanding `FetchPause` guards; automatic fetches are held off while > 0
  paused: u32,
  listeners: Vec<(u64, Listener<T>)>,
  /// Woken whenever a fetch settles or is superseded
  settled: Arc<Notify>,
  /// Serializes optimistic mutations on this key
  mutation_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<T> Slot<T> {
  fn undefined() -> Self {
    Self::with_entry(
      QueryEntry::new(DEFAULT_STALE_TIME, RetryPolicy::default().max_retries),
      None,
    )
  }

  fn from_query(query: Query<T>) -> Self {
    let mut entry = QueryEntry::new(query.stale_time(), query.retry().max_retries);
    if let Some(data) = query.initial_data() {
      // Seeded data counts as fetched now and stays fresh for the window.
      entry.data = Some(data);
      entry.status = QueryStatus::Success;
      entry.last_fetched_at = Some(Instant::now());
    }
    Self::with_entry(entry, Some(query))
  }

  fn with_entry(entry: QueryEntry<T>, query: Option<Query<T>>) -> Self {
    Self {
      entry,
      query,
      generation: 0,
      task: None,
      retry_pending: false,
      paused: 0,
      listeners: Vec::new(),
      settled: Arc::new(Notify::new()),
      mutation_lock: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  fn is_current(&self, generation: u64) -> bool {
    self.generation == generation
  }

  /// Whether a read or mount at `now` should start a fetch.
  fn wants_fetch(&self, now: Instant) -> bool {
    self.paused == 0 && self.entry.needs_fetch_at(now)
  }

  /// Retire the current fetch, if any. Its task is aborted and any result it
  /// still delivers is ignored.
  fn supersede(&mut self) {
    self.generation += 1;
    if let Some(task) = self.task.take() {
      task.abort();
    }
    self.retry_pending = false;
    self.settled.notify_waiters();
  }

  fn changed(&self) -> Changed<T> {
    Changed {
      listeners: self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
      entry: self.entry.clone(),
    }
  }
}

/// A pending notification, delivered once the lock is released.
struct Changed<T> {
  listeners: Vec<Listener<T>>,
  entry: QueryEntry<T>,
}

impl<T> Changed<T> {
  fn deliver(self) {
    for listener in &self.listeners {
      listener(&self.entry);
    }
  }
}

type Slots<T> = HashMap<QueryKey, Slot<T>>;

struct Inner<T> {
  slots: Mutex<Slots<T>>,
  next_listener_id: AtomicU64,
}

/// Look up the slot for `key`, creating an undefined one if needed.
fn slot_mut<'a, T>(slots: &'a mut Slots<T>, key: &QueryKey) -> &'a mut Slot<T> {
  slots.entry(key.clone()).or_insert_with(|| {
    debug!(key = %key, "creating entry for undefined query");
    Slot::undefined()
  })
}

/// Cache of server data keyed by [`QueryKey`].
///
/// Cheap to clone; clones share the same entries. Methods that may start a
/// fetch spawn it on the ambient Tokio runtime.
pub struct QueryCache<T> {
  inner: Arc<Inner<T>>,
}

impl<T: Send + Sync + 'static> QueryCache<T> {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        slots: Mutex::new(HashMap::new()),
        next_listener_id: AtomicU64::new(0),
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Slots<T>> {
    self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Register (or replace) the fetch definition for `query.key()`.
  ///
  /// Defining doesn't fetch; the first read or subscription does.
  pub fn define(&self, query: Query<T>) {
    let mut slots = self.lock();
    match slots.get_mut(query.key()) {
      Some(slot) => {
        slot.entry.stale_after = query.stale_time();
        slot.entry.max_retries = query.retry().max_retries;
        slot.query = Some(query);
      }
      None => {
        slots.insert(query.key().clone(), Slot::from_query(query));
      }
    }
  }

  /// Current entry for `key`, scheduling a fetch if the data is stale.
  ///
  /// Repeated reads within the freshness window return the same entry and
  /// never start another fetch.
  pub fn read(&self, key: &QueryKey) -> QueryEntry<T> {
    let (entry, changed) = {
      let mut slots = self.lock();
      let slot = slot_mut(&mut slots, key);
      let changed = if slot.wants_fetch(Instant::now()) {
        self.start_fetch(key, slot)
      } else {
        None
      };
      (slot.entry.clone(), changed)
    };
    if let Some(changed) = changed {
      changed.deliver();
    }
    entry
  }

  /// Current entry for `key` without side effects.
  pub fn peek(&self, key: &QueryKey) -> Option<QueryEntry<T>> {
    self.lock().get(key).map(|slot| slot.entry.clone())
  }

  pub fn get_data(&self, key: &QueryKey) -> Option<Arc<T>> {
    self.lock().get(key).and_then(|slot| slot.entry.data.clone())
  }

  /// Replace the cached data wholesale, as if it had been fetched.
  ///
  /// Doesn't touch `last_fetched_at`: a local write is not server confirmation.
  pub fn set_data(&self, key: &QueryKey, data: T) {
    self.write_settled(key, Some(Arc::new(data)), QueryStatus::Success, None);
  }

  /// Overwrite data, status and error together.
  pub(crate) fn write_settled(
    &self,
    key: &QueryKey,
    data: Option<Arc<T>>,
    status: QueryStatus,
    error: Option<FetchError>,
  ) {
    let changed = {
      let mut slots = self.lock();
      let slot = slot_mut(&mut slots, key);
      slot.entry.data = data;
      slot.entry.status = status;
      slot.entry.error = error;
      slot.changed()
    };
    changed.deliver();
  }

  /// Register a listener for every change to `key`'s entry.
  ///
  /// Subscribing counts as mounting: stale data is refetched, and a retry
  /// waiting out its backoff is superseded by an immediate fresh fetch.
  pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription
  where
    F: Fn(&QueryEntry<T>) + Send + Sync + 'static,
  {
    let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
    let listener: Listener<T> = Arc::new(listener);
    let changed = {
      let mut slots = self.lock();
      let slot = slot_mut(&mut slots, key);
      slot.listeners.push((id, listener));
      if slot.retry_pending {
        debug!(key = %key, "new subscriber supersedes pending retry");
        self.start_fetch(key, slot)
      } else if slot.wants_fetch(Instant::now()) {
        self.start_fetch(key, slot)
      } else {
        None
      }
    };
    if let Some(changed) = changed {
      changed.deliver();
    }

    let inner = Arc::downgrade(&self.inner);
    let key = key.clone();
    Subscription::new(move || {
      if let Some(inner) = inner.upgrade() {
        QueryCache { inner }.unsubscribe(&key, id);
      }
    })
  }

  fn unsubscribe(&self, key: &QueryKey, id: u64) {
    let mut slots = self.lock();
    let Some(slot) = slots.get_mut(key) else {
      return;
    };
    slot.listeners.retain(|(listener_id, _)| *listener_id != id);
    if slot.listeners.is_empty() && slot.entry.is_fetching {
      debug!(key = %key, "last subscriber left; cancelling fetch");
      // Nobody is left to notify.
      let _ = Self::cancel_in_slot(key, slot);
    }
  }

  pub fn subscriber_count(&self, key: &QueryKey) -> usize {
    self.lock().get(key).map_or(0, |slot| slot.listeners.len())
  }

  /// Start a new fetch regardless of staleness and wait for it to settle.
  ///
  /// Any fetch already in flight for `key` is superseded. Returns early if
  /// this fetch is itself superseded before it settles.
  pub async fn refetch(&self, key: &QueryKey) {
    let (generation, settled, changed) = {
      let mut slots = self.lock();
      let slot = slot_mut(&mut slots, key);
      if slot.query.is_none() {
        warn!(key = %key, "refetch of a query with no definition");
        return;
      }
      let changed = self.start_fetch(key, slot);
      (slot.generation, Arc::clone(&slot.settled), changed)
    };
    if let Some(changed) = changed {
      changed.deliver();
    }
    self
      .wait_until(key, &settled, |slot| {
        !slot.is_current(generation) || !slot.entry.is_fetching
      })
      .await;
  }

  /// Mark `key` stale. Mounted queries refetch right away; others refetch
  /// on their next read.
  pub fn invalidate(&self, key: &QueryKey) {
    let changed = {
      let mut slots = self.lock();
      let Some(slot) = slots.get_mut(key) else {
        return;
      };
      slot.entry.is_invalidated = true;
      if !slot.listeners.is_empty() && slot.query.is_some() && slot.paused == 0 {
        debug!(key = %key, "invalidated while mounted; refetching");
        self.start_fetch(key, slot)
      } else {
        debug!(key = %key, "invalidated; refetch deferred to next read");
        Some(slot.changed())
      }
    };
    if let Some(changed) = changed {
      changed.deliver();
    }
  }

  /// Supersede the in-flight fetch for `key` without starting a new one.
  ///
  /// The entry keeps its data; a first load that gets cancelled falls back
  /// to `Idle`. Returns whether a fetch was actually cancelled.
  pub fn cancel(&self, key: &QueryKey) -> bool {
    let changed = {
      let mut slots = self.lock();
      let Some(slot) = slots.get_mut(key) else {
        return false;
      };
      Self::cancel_in_slot(key, slot)
    };
    match changed {
      Some(changed) => {
        changed.deliver();
        true
      }
      None => false,
    }
  }

  fn cancel_in_slot(key: &QueryKey, slot: &mut Slot<T>) -> Option<Changed<T>> {
    if !slot.entry.is_fetching {
      return None;
    }
    debug!(key = %key, generation = slot.generation, "cancelling fetch");
    slot.supersede();
    slot.entry.is_fetching = false;
    // The server state is unknown now, so the next read must revalidate.
    slot.entry.is_invalidated = true;
    if slot.entry.status == QueryStatus::Loading {
      slot.entry.status = if slot.entry.data.is_some() {
        QueryStatus::Success
      } else {
        QueryStatus::Idle
      };
    }
    Some(slot.changed())
  }

  /// Resolve once no fetch is in flight for `key`.
  pub async fn wait_settled(&self, key: &QueryKey) {
    let settled = match self.lock().get(key) {
      Some(slot) => Arc::clone(&slot.settled),
      None => return,
    };
    self
      .wait_until(key, &settled, |slot| !slot.entry.is_fetching)
      .await;
  }

  async fn wait_until(&self, key: &QueryKey, settled: &Notify, done: impl Fn(&Slot<T>) -> bool) {
    loop {
      // Created before the check so a wakeup between the two isn't lost.
      let notified = settled.notified();
      {
        let slots = self.lock();
        match slots.get(key) {
          Some(slot) if !done(slot) => {}
          _ => return,
        }
      }
      notified.await;
    }
  }

  pub(crate) fn mutation_lock(&self, key: &QueryKey) -> Arc<tokio::sync::Mutex<()>> {
    let mut slots = self.lock();
    Arc::clone(&slot_mut(&mut slots, key).mutation_lock)
  }

  /// Hold off read-, mount- and invalidate-triggered fetches for `key` until
  /// the returned guard drops. The entry is marked invalidated, so whatever
  /// happens in between is revalidated by the next read after release.
  /// Explicit `refetch` calls are not held off.
  pub(crate) fn pause_fetches(&self, key: &QueryKey) -> FetchPause<T> {
    {
      let mut slots = self.lock();
      let slot = slot_mut(&mut slots, key);
      slot.paused += 1;
      slot.entry.is_invalidated = true;
    }
    FetchPause {
      cache: self.clone(),
      key: key.clone(),
    }
  }

  /// Supersede whatever is in flight and spawn a new fetch for `slot`.
  fn start_fetch(&self, key: &QueryKey, slot: &mut Slot<T>) -> Option<Changed<T>> {
    let Some(query) = slot.query.clone() else {
      debug!(key = %key, "no fetcher defined; not fetching");
      return None;
    };
    if slot.entry.is_fetching {
      debug!(key = %key, generation = slot.generation, "superseding in-flight fetch");
    }
    slot.supersede();
    let generation = slot.generation;

    slot.entry.is_fetching = true;
    slot.entry.retry_count = 0;
    slot.entry.is_invalidated = false;
    if slot.entry.data.is_none() {
      slot.entry.status = QueryStatus::Loading;
    }

    debug!(key = %key, generation, "starting fetch");
    let handle = tokio::spawn(run_fetch(
      Arc::downgrade(&self.inner),
      key.clone(),
      query,
      generation,
    ));
    slot.task = Some(handle.abort_handle());
    Some(slot.changed())
  }

  fn settle_success(&self, key: &QueryKey, generation: u64, data: T) {
    let changed = {
      let mut slots = self.lock();
      let Some(slot) = slots.get_mut(key) else {
        return;
      };
      if !slot.is_current(generation) {
        debug!(key = %key, generation, "discarding result of superseded fetch");
        return;
      }
      let entry = &mut slot.entry;
      entry.data = Some(Arc::new(data));
      entry.status = QueryStatus::Success;
      entry.last_fetched_at = Some(Instant::now());
      entry.retry_count = 0;
      entry.error = None;
      entry.is_fetching = false;
      slot.task = None;
      slot.retry_pending = false;
      slot.settled.notify_waiters();
      slot.changed()
    };
    changed.deliver();
  }

  /// Record a failed attempt. Returns the backoff delay if another attempt
  /// should follow, `None` if the fetch is over (settled or superseded).
  fn record_failure(
    &self,
    key: &QueryKey,
    generation: u64,
    retry: RetryPolicy,
    error: ClientError,
  ) -> Option<Duration> {
    let (delay, changed) = {
      let mut slots = self.lock();
      let slot = slots.get_mut(key)?;
      if !slot.is_current(generation) {
        debug!(key = %key, generation, "discarding failure of superseded fetch");
        return None;
      }

      if slot.entry.retry_count < slot.entry.max_retries {
        slot.entry.retry_count += 1;
        let attempt = slot.entry.retry_count;
        let delay = retry.delay(attempt);
        slot.retry_pending = true;
        warn!(
          key = %key,
          attempt,
          delay_ms = delay.as_millis() as u64,
          transient = error.is_transient(),
          error = %error,
          "fetch failed; retrying"
        );
        (Some(delay), slot.changed())
      } else {
        let attempts = slot.entry.retry_count + 1;
        warn!(key = %key, attempts, error = %error, "fetch failed; giving up");
        let entry = &mut slot.entry;
        // Last good data stays visible alongside the error.
        entry.status = QueryStatus::Error;
        entry.error = Some(FetchError::new(&error, attempts));
        entry.is_fetching = false;
        entry.is_invalidated = true;
        slot.task = None;
        slot.retry_pending = false;
        slot.settled.notify_waiters();
        (None, slot.changed())
      }
    };
    changed.deliver();
    delay
  }

  /// Called when a backoff delay elapses. Returns false if the fetch was
  /// superseded while waiting.
  fn begin_retry(&self, key: &QueryKey, generation: u64) -> bool {
    let mut slots = self.lock();
    match slots.get_mut(key) {
      Some(slot) if slot.is_current(generation) => {
        slot.retry_pending = false;
        true
      }
      _ => false,
    }
  }
}

/// Guard returned by [`QueryCache::pause_fetches`].
pub(crate) struct FetchPause<T: Send + Sync + 'static> {
  cache: QueryCache<T>,
  key: QueryKey,
}

impl<T: Send + Sync + 'static> Drop for FetchPause<T> {
  fn drop(&mut self) {
    let mut slots = self.cache.lock();
    if let Some(slot) = slots.get_mut(&self.key) {
      slot.paused = slot.paused.saturating_sub(1);
    }
  }
}

/// Body of the spawned fetch task: attempt, then retry with backoff until
/// the fetch settles or is superseded.
async fn run_fetch<T: Send + Sync + 'static>(
  inner: Weak<Inner<T>>,
  key: QueryKey,
  query: Query<T>,
  generation: u64,
) {
  loop {
    let result = query.fetch().await;

    let Some(strong) = inner.upgrade() else {
      return;
    };
    let cache = QueryCache { inner: strong };
    let delay = match result {
      Ok(data) => {
        cache.settle_success(&key, generation, data);
        return;
      }
      Err(error) => match cache.record_failure(&key, generation, query.retry(), error) {
        Some(delay) => delay,
        None => return,
      },
    };
    drop(cache);

    tokio::time::sleep(delay).await;

    let Some(strong) = inner.upgrade() else {
      return;
    };
    if !(QueryCache { inner: strong }).begin_retry(&key, generation) {
      return;
    }
  }
}

impl<T: Send + Sync + 'static> Default for QueryCache<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Clone for QueryCache<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
