//! Persisted UI store: theme and cart, mirrored to durable storage.
//!
//! State transitions are pure functions on [`StoreState`]. [`UiStore`] wraps
//! them with the side effects, in a fixed order: compute the next state,
//! persist it, swap it into memory, then run theme hooks and notify
//! subscribers. Storage stays the source of truth across reloads: if the
//! process dies after persisting, the next hydration picks up the new value.

mod storage;

pub use storage::{DurableStorage, MemoryStorage, SqliteStorage};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::api::Product;
use crate::error::StoreError;
use crate::subscription::Subscription;

/// Storage key for the theme, stored as a bare `light`/`dark` string.
pub const THEME_KEY: &str = "theme";
/// Storage key for the cart, stored as a JSON array of cart items.
pub const CART_KEY: &str = "cart";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
  #[default]
  Light,
  Dark,
}

impl Theme {
  pub fn toggled(self) -> Self {
    match self {
      Theme::Light => Theme::Dark,
      Theme::Dark => Theme::Light,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Theme::Light => "light",
      Theme::Dark => "dark",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "light" => Some(Theme::Light),
      "dark" => Some(Theme::Dark),
      _ => None,
    }
  }
}

impl fmt::Display for Theme {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
  pub id: u64,
  pub name: String,
}

impl CartItem {
  pub fn new(id: u64, name: impl Into<String>) -> Self {
    Self {
      id,
      name: name.into(),
    }
  }
}

impl From<&Product> for CartItem {
  fn from(product: &Product) -> Self {
    Self::new(product.id, product.name.clone())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreState {
  pub theme: Theme,
  pub cart: Vec<CartItem>,
}

impl StoreState {
  pub fn with_toggled_theme(&self) -> Self {
    Self {
      theme: self.theme.toggled(),
      cart: self.cart.clone(),
    }
  }

  /// Append to the end of the cart. Duplicates are kept.
  pub fn with_cart_item(&self, item: CartItem) -> Self {
    let mut cart = self.cart.clone();
    cart.push(item);
    Self {
      theme: self.theme,
      cart,
    }
  }

  pub fn cart_count(&self) -> usize {
    self.cart.len()
  }
}

/// Hydration lifecycle of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
  Uninitialized,
  Hydrating,
  Ready,
}

type StoreListener = Arc<dyn Fn(&StoreState) + Send + Sync>;
type ThemeHook = Arc<dyn Fn(Theme) + Send + Sync>;

/// Which persisted field an action touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
  Theme,
  Cart,
}

struct Shared {
  state: StoreState,
  status: StoreStatus,
  listeners: Vec<(u64, StoreListener)>,
  theme_hooks: Vec<(u64, ThemeHook)>,
}

struct Inner {
  storage: Arc<dyn DurableStorage>,
  shared: Mutex<Shared>,
  next_id: AtomicU64,
}

/// UI-local state (theme, cart) that survives restarts.
///
/// Constructed explicitly and passed to whoever needs it; cheap to clone.
#[derive(Clone)]
pub struct UiStore {
  inner: Arc<Inner>,
}

impl UiStore {
  /// A store in the `Uninitialized` state. Call [`UiStore::hydrate`] before
  /// running actions.
  pub fn new(storage: Arc<dyn DurableStorage>) -> Self {
    Self {
      inner: Arc::new(Inner {
        storage,
        shared: Mutex::new(Shared {
          state: StoreState::default(),
          status: StoreStatus::Uninitialized,
          listeners: Vec::new(),
          theme_hooks: Vec::new(),
        }),
        next_id: AtomicU64::new(0),
      }),
    }
  }

  /// Construct and hydrate in one step.
  pub fn hydrated(storage: Arc<dyn DurableStorage>, system_theme: Theme) -> Self {
    let store = Self::new(storage);
    store.hydrate(system_theme);
    store
  }

  fn lock(&self) -> MutexGuard<'_, Shared> {
    self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn status(&self) -> StoreStatus {
    self.lock().status
  }

  /// Load theme and cart from durable storage.
  ///
  /// A missing or unreadable theme falls back to `system_theme`; a missing
  /// or malformed cart falls back to empty. Never fails. Hydrating a store
  /// that is already ready is a no-op.
  pub fn hydrate(&self, system_theme: Theme) {
    {
      let mut shared = self.lock();
      if shared.status != StoreStatus::Uninitialized {
        debug!(status = ?shared.status, "store already hydrated");
        return;
      }
      shared.status = StoreStatus::Hydrating;
    }

    let state = StoreState {
      theme: self.load_theme(system_theme),
      cart: self.load_cart(),
    };
    debug!(theme = %state.theme, cart_items = state.cart.len(), "store hydrated");

    let (listeners, hooks) = {
      let mut shared = self.lock();
      shared.state = state.clone();
      shared.status = StoreStatus::Ready;
      (
        shared.listeners.iter().map(|(_, l)| Arc::clone(l)).collect::<Vec<_>>(),
        shared.theme_hooks.iter().map(|(_, h)| Arc::clone(h)).collect::<Vec<_>>(),
      )
    };
    for hook in &hooks {
      hook(state.theme);
    }
    for listener in &listeners {
      listener(&state);
    }
  }

  fn load_theme(&self, system_theme: Theme) -> Theme {
    match self.inner.storage.get(THEME_KEY) {
      Ok(Some(raw)) => Theme::parse(&raw).unwrap_or_else(|| {
        warn!(value = %raw, "ignoring unrecognised stored theme");
        system_theme
      }),
      Ok(None) => system_theme,
      Err(e) => {
        warn!(error = %e, "failed to read stored theme");
        system_theme
      }
    }
  }

  fn load_cart(&self) -> Vec<CartItem> {
    match self.inner.storage.get(CART_KEY) {
      Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(error = %e, "ignoring malformed stored cart");
        Vec::new()
      }),
      Ok(None) => Vec::new(),
      Err(e) => {
        warn!(error = %e, "failed to read stored cart");
        Vec::new()
      }
    }
  }

  pub fn get_state(&self) -> StoreState {
    self.lock().state.clone()
  }

  /// Flip between light and dark. Returns the new theme.
  pub fn toggle_theme(&self) -> Result<Theme, StoreError> {
    let state = self.apply(Field::Theme, StoreState::with_toggled_theme)?;
    Ok(state.theme)
  }

  pub fn add_to_cart(&self, item: CartItem) -> Result<(), StoreError> {
    self.apply(Field::Cart, |state| state.with_cart_item(item))?;
    Ok(())
  }

  /// Run one action: compute, persist, swap, then notify.
  ///
  /// The lock is held from compute through swap so concurrent actions can't
  /// interleave; hooks and listeners run after it is released.
  fn apply<F>(&self, field: Field, transition: F) -> Result<StoreState, StoreError>
  where
    F: FnOnce(&StoreState) -> StoreState,
  {
    let (state, listeners, hooks) = {
      let mut shared = self.lock();
      if shared.status != StoreStatus::Ready {
        return Err(StoreError::NotReady);
      }
      let next = transition(&shared.state);
      self.persist(field, &next)?;
      shared.state = next.clone();

      let listeners: Vec<StoreListener> =
        shared.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
      let hooks: Vec<ThemeHook> = match field {
        Field::Theme => shared.theme_hooks.iter().map(|(_, h)| Arc::clone(h)).collect(),
        Field::Cart => Vec::new(),
      };
      (next, listeners, hooks)
    };

    for hook in &hooks {
      hook(state.theme);
    }
    for listener in &listeners {
      listener(&state);
    }
    Ok(state)
  }

  fn persist(&self, field: Field, state: &StoreState) -> Result<(), StoreError> {
    match field {
      Field::Theme => self.inner.storage.set(THEME_KEY, state.theme.as_str()),
      Field::Cart => {
        let encoded = serde_json::to_string(&state.cart)?;
        self.inner.storage.set(CART_KEY, &encoded)
      }
    }
  }

  /// Register a listener called with the new state after every action.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&StoreState) + Send + Sync + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    self.lock().listeners.push((id, Arc::new(listener)));
    let inner = Arc::downgrade(&self.inner);
    Subscription::new(move || {
      if let Some(inner) = inner.upgrade() {
        UiStore { inner }.lock().listeners.retain(|(lid, _)| *lid != id);
      }
    })
  }

  /// Register the presentation-layer side effect for theme changes (e.g.
  /// setting the dark-mode marker on the document root).
  ///
  /// Runs after each committed toggle and once when hydration completes.
  pub fn on_theme_change<F>(&self, hook: F) -> Subscription
  where
    F: Fn(Theme) + Send + Sync + 'static,
  {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    self.lock().theme_hooks.push((id, Arc::new(hook)));
    let inner = Arc::downgrade(&self.inner);
    Subscription::new(move || {
      if let Some(inner) = inner.upgrade() {
        UiStore { inner }.lock().theme_hooks.retain(|(hid, _)| *hid != id);
      }
    })
  }
}

impl fmt::Debug for UiStore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let shared = self.lock();
    f.debug_struct("UiStore")
      .field("status", &shared.status)
      .field("state", &shared.state)
      .finish_non_exhaustive()
  }
}
