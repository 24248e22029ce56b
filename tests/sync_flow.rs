//! Cache, coordinator and store working together against an in-process
//! stand-in for the products backend.

use std::sync::{Arc, Mutex};

use storefront_sync::api::Product;
use storefront_sync::catalog::{products_key, ProductList};
use storefront_sync::store::{DurableStorage, MemoryStorage, SqliteStorage};
use storefront_sync::{
  CartItem, ClientError, Mutation, MutationCoordinator, Query, QueryCache, QueryStatus, StoreStatus,
  Theme, UiStore,
};

/// Server-side product table shared by the query and the mutations.
#[derive(Clone, Default)]
struct Backend {
  products: Arc<Mutex<ProductList>>,
  reject_writes: Arc<Mutex<bool>>,
}

impl Backend {
  fn seeded() -> Self {
    let backend = Self::default();
    backend
      .products
      .lock()
      .unwrap()
      .extend([Product::new(1, "Muhammed"), Product::new(2, "Product B")]);
    backend
  }

  fn query(&self) -> Query<ProductList> {
    let backend = self.clone();
    Query::new(products_key(), move || {
      let backend = backend.clone();
      async move { Ok(backend.products.lock().unwrap().clone()) }
    })
  }

  fn create(&self) -> Mutation<ProductList, String, Product> {
    let backend = self.clone();
    Mutation::new(products_key(), move |name: String| {
      let backend = backend.clone();
      async move {
        if *backend.reject_writes.lock().unwrap() {
          return Err(ClientError::Unavailable("writes disabled".into()));
        }
        let mut products = backend.products.lock().unwrap();
        // The server picks its own id.
        let product = Product::new(100 + products.len() as u64, name);
        products.push(product.clone());
        Ok(product)
      }
    })
    .with_optimistic_update(|name: &String, previous: Option<&ProductList>| {
      let mut next = previous.cloned().unwrap_or_default();
      let id = next.iter().map(|p| p.id).max().unwrap_or(0) + 1;
      next.push(Product::new(id, name.as_str()));
      Some(next)
    })
  }
}

fn names(list: &ProductList) -> Vec<&str> {
  list.iter().map(|p| p.name.as_str()).collect()
}

#[tokio::test]
async fn test_successful_create_reconciles_with_server() {
  let backend = Backend::seeded();
  let cache = QueryCache::new();
  cache.define(backend.query());
  let coordinator = MutationCoordinator::new(cache.clone());
  let key = products_key();

  let seen = Arc::new(Mutex::new(Vec::new()));
  let _sub = {
    let seen = seen.clone();
    cache.subscribe(&key, move |entry| {
      if let Some(list) = entry.data() {
        seen.lock().unwrap().push(list.clone());
      }
    })
  };
  cache.wait_settled(&key).await;

  let created = coordinator.mutate(&backend.create(), "Lamp".into()).await.unwrap();
  assert_eq!(created.id, 102);

  cache.wait_settled(&key).await;
  let data = cache.get_data(&key).unwrap();
  assert_eq!(data.last(), Some(&Product::new(102, "Lamp")));

  // Speculative id first, then the server's.
  let seen = seen.lock().unwrap();
  assert!(seen.iter().any(|list| list.last() == Some(&Product::new(3, "Lamp"))));
  assert_eq!(names(seen.last().unwrap()), ["Muhammed", "Product B", "Lamp"]);
}

#[tokio::test]
async fn test_failed_create_rolls_back_to_server_state() {
  let backend = Backend::seeded();
  *backend.reject_writes.lock().unwrap() = true;
  let cache = QueryCache::new();
  cache.define(backend.query());
  let coordinator = MutationCoordinator::new(cache.clone());
  let key = products_key();

  cache.read(&key);
  cache.wait_settled(&key).await;
  let before = cache.get_data(&key).unwrap();

  let err = coordinator
    .mutate(&backend.create(), "Lamp".into())
    .await
    .unwrap_err();
  assert!(err.to_string().contains("writes disabled"));

  let entry = cache.peek(&key).unwrap();
  assert_eq!(entry.status, QueryStatus::Success);
  assert_eq!(entry.data(), Some(before.as_ref()));
  assert_eq!(backend.products.lock().unwrap().len(), 2);
}

#[test]
fn test_cart_survives_reload() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("store.db");

  {
    let storage: Arc<dyn DurableStorage> = Arc::new(SqliteStorage::open(&path).unwrap());
    let store = UiStore::hydrated(storage, Theme::Light);
    store.add_to_cart(CartItem::new(1, "Muhammed")).unwrap();
    store.add_to_cart(CartItem::new(1, "Muhammed")).unwrap();
    store.toggle_theme().unwrap();
  }

  let storage: Arc<dyn DurableStorage> = Arc::new(SqliteStorage::open(&path).unwrap());
  let store = UiStore::hydrated(storage, Theme::Light);
  let state = store.get_state();
  assert_eq!(state.theme, Theme::Dark);
  assert_eq!(state.cart_count(), 2);
  assert_eq!(state.cart[0], CartItem::new(1, "Muhammed"));
}

#[test]
fn test_stored_dark_theme_fires_hook_on_hydrate() {
  let storage = MemoryStorage::new();
  storage.set("theme", "dark").unwrap();

  let store = UiStore::new(Arc::new(storage));
  assert_eq!(store.status(), StoreStatus::Uninitialized);

  let applied = Arc::new(Mutex::new(Vec::new()));
  let _hook = {
    let applied = applied.clone();
    store.on_theme_change(move |theme| applied.lock().unwrap().push(theme))
  };

  store.hydrate(Theme::Light);
  assert_eq!(store.status(), StoreStatus::Ready);
  assert_eq!(*applied.lock().unwrap(), vec![Theme::Dark]);

  store.toggle_theme().unwrap();
  assert_eq!(*applied.lock().unwrap(), vec![Theme::Dark, Theme::Light]);
}

#[test]
fn test_cart_item_from_cached_product() {
  let product = Product::new(7, "Desk");
  assert_eq!(CartItem::from(&product), CartItem::new(7, "Desk"));
}
