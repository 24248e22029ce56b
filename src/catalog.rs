//! Product catalog wiring: the `["products"]` query and the mutations that
//! edit it.

use chrono::Utc;

use crate::api::{Product, ProductUpdate, ProductsClient};
use crate::config::QueryConfig;
use crate::mutation::Mutation;
use crate::query::{Query, QueryKey};

pub type ProductList = Vec<Product>;

/// Variables for a rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameProduct {
  pub id: u64,
  pub name: String,
}

pub fn products_key() -> QueryKey {
  QueryKey::from("products")
}

/// The product list query, using the configured staleness and retries.
pub fn products_query(client: &ProductsClient, config: &QueryConfig) -> Query<ProductList> {
  let client = client.clone();
  Query::new(products_key(), move || {
    let client = client.clone();
    async move { client.list_products().await }
  })
  .with_stale_time(config.stale_time())
  .with_retry(config.retry())
}

/// Create a product named by the variables. Optimistically appended with the
/// next free id.
pub fn create_product(client: &ProductsClient) -> Mutation<ProductList, String, Product> {
  let client = client.clone();
  Mutation::new(products_key(), move |name: String| {
    let client = client.clone();
    async move {
      let draft = Product::new(draft_id(), name);
      client.create_product(&draft).await
    }
  })
  .with_optimistic_update(|name: &String, previous: Option<&ProductList>| {
    Some(with_appended(previous, name))
  })
}

pub fn update_product(client: &ProductsClient) -> Mutation<ProductList, RenameProduct, Product> {
  let client = client.clone();
  Mutation::new(products_key(), move |rename: RenameProduct| {
    let client = client.clone();
    async move {
      let update = ProductUpdate {
        name: Some(rename.name),
      };
      client.update_product(rename.id, &update).await
    }
  })
  .with_optimistic_update(|rename: &RenameProduct, previous: Option<&ProductList>| {
    previous.map(|list| with_renamed(list, rename))
  })
}

pub fn delete_product(client: &ProductsClient) -> Mutation<ProductList, u64, Product> {
  let client = client.clone();
  Mutation::new(products_key(), move |id: u64| {
    let client = client.clone();
    async move { client.delete_product(id).await }
  })
  .with_optimistic_update(|id: &u64, previous: Option<&ProductList>| {
    previous.map(|list| without(list, *id))
  })
}

fn draft_id() -> u64 {
  u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

fn with_appended(previous: Option<&ProductList>, name: &str) -> ProductList {
  let mut next = previous.cloned().unwrap_or_default();
  let id = next.iter().map(|p| p.id).max().unwrap_or(0) + 1;
  next.push(Product::new(id, name));
  next
}

fn with_renamed(list: &ProductList, rename: &RenameProduct) -> ProductList {
  let update = ProductUpdate {
    name: Some(rename.name.clone()),
  };
  list
    .iter()
    .cloned()
    .map(|mut product| {
      if product.id == rename.id {
        update.apply_to(&mut product);
      }
      product
    })
    .collect()
}

fn without(list: &ProductList, id: u64) -> ProductList {
  list.iter().filter(|p| p.id != id).cloned().collect()
}
