//! Serde types matching the `/api/products` payloads.

use serde::{Deserialize, Serialize};

/// A product record as served by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
  pub id: u64,
  pub name: String,
}

impl Product {
  pub fn new(id: u64, name: impl Into<String>) -> Self {
    Self {
      id,
      name: name.into(),
    }
  }
}

/// Fields accepted by `PUT /api/products/:id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
}

impl ProductUpdate {
  /// Apply the present fields onto `product`.
  pub fn apply_to(&self, product: &mut Product) {
    if let Some(name) = &self.name {
      product.name = name.clone();
    }
  }
}

/// Body of `GET /api/products`.
#[derive(Debug, Deserialize)]
pub(crate) struct ProductsResponse {
  pub products: Vec<Product>,
}
