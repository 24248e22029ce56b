//! Remote resource client for the storefront's product endpoints.

mod types;

pub use types::{Product, ProductUpdate};

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::ApiConfig;
use crate::error::ClientError;
use types::ProductsResponse;

/// HTTP client for `/api/products`.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct ProductsClient {
  http: reqwest::Client,
  base_url: Url,
}

impl ProductsClient {
  /// `config.base_url` may carry a path prefix (`http://host/shop`); endpoint
  /// paths are resolved beneath it.
  pub fn new(config: &ApiConfig) -> Result<Self, ClientError> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_millis(config.timeout_ms))
      .build()?;
    let mut base_url = Url::parse(&config.base_url)?;
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }
    Ok(Self { http, base_url })
  }

  fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
    Ok(self.base_url.join(path)?)
  }

  /// `GET /api/products`
  pub async fn list_products(&self) -> Result<Vec<Product>, ClientError> {
    let url = self.endpoint("api/products")?;
    let response: ProductsResponse = self.send(Method::GET, url, |req| req).await?;
    Ok(response.products)
  }

  /// `POST /api/products`, returning the record the server echoes back.
  pub async fn create_product(&self, product: &Product) -> Result<Product, ClientError> {
    let url = self.endpoint("api/products")?;
    self.send(Method::POST, url, |req| req.json(product)).await
  }

  /// `PUT /api/products/:id`
  pub async fn update_product(
    &self,
    id: u64,
    update: &ProductUpdate,
  ) -> Result<Product, ClientError> {
    let url = self.endpoint(&format!("api/products/{}", id))?;
    self.send(Method::PUT, url, |req| req.json(update)).await
  }

  /// `DELETE /api/products/:id`, returning the deleted record.
  pub async fn delete_product(&self, id: u64) -> Result<Product, ClientError> {
    let url = self.endpoint(&format!("api/products/{}", id))?;
    self.send(Method::DELETE, url, |req| req).await
  }

  async fn send<T, F>(&self, method: Method, url: Url, build: F) -> Result<T, ClientError>
  where
    T: DeserializeOwned,
    F: FnOnce(RequestBuilder) -> RequestBuilder,
  {
    debug!(%method, %url, "sending request");
    let method_name = method_label(&method);
    let response = build(self.http.request(method, url.clone())).send().await?;
    decode(method_name, url, response).await
  }
}

fn method_label(method: &Method) -> &'static str {
  match *method {
    Method::GET => "GET",
    Method::POST => "POST",
    Method::PUT => "PUT",
    Method::DELETE => "DELETE",
    _ => "REQUEST",
  }
}

/// Map non-2xx statuses to errors and parse the JSON body.
async fn decode<T: DeserializeOwned>(
  method: &'static str,
  url: Url,
  response: Response,
) -> Result<T, ClientError> {
  let status = response.status();
  if !status.is_success() {
    return Err(ClientError::Status {
      method,
      url: url.to_string(),
      status: status.as_u16(),
    });
  }
  let body = response.bytes().await?;
  serde_json::from_slice(&body).map_err(|source| ClientError::Decode {
    url: url.to_string(),
    source,
  })
}
