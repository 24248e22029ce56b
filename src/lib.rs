//! Client-side data sync for the storefront demo.
//!
//! - [`query`]: keyed cache of server data with staleness, retries and
//!   subscriptions
//! - [`mutation`]: optimistic writes with rollback on failure
//! - [`store`]: theme and cart, persisted to durable storage
//!
//! [`api`] and [`catalog`] wire the products endpoints into the first two.

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod logging;
pub mod mutation;
pub mod query;
pub mod store;
pub mod subscription;

pub use error::{ClientError, FetchError, MutationError, StoreError};
pub use mutation::{Mutation, MutationCoordinator, MutationSnapshot};
pub use query::{Query, QueryCache, QueryEntry, QueryKey, QueryStatus, RetryPolicy};
pub use store::{CartItem, StoreState, StoreStatus, Theme, UiStore};
pub use subscription::Subscription;
