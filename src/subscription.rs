//! Subscription handle shared by the query cache and the UI store.

/// Keeps a listener registered until dropped or explicitly unsubscribed.
#[must_use = "dropping a Subscription unsubscribes the listener immediately"]
pub struct Subscription {
  unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
  pub(crate) fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
    Self {
      unsubscribe: Some(Box::new(unsubscribe)),
    }
  }

  /// Remove the listener now.
  pub fn unsubscribe(mut self) {
    if let Some(f) = self.unsubscribe.take() {
      f();
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(f) = self.unsubscribe.take() {
      f();
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("active", &self.unsubscribe.is_some())
      .finish()
  }
}
