//! Query keys: ordered, structurally compared identifiers for cached resources.

use std::fmt;

/// One primitive segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
  Str(String),
  Int(i64),
  /// Unsigned values that don't fit in `Int`. Smaller ones convert to `Int`.
  UInt(u64),
  Bool(bool),
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyPart::Str(s) => write!(f, "{:?}", s),
      KeyPart::Int(i) => write!(f, "{}", i),
      KeyPart::UInt(u) => write!(f, "{}", u),
      KeyPart::Bool(b) => write!(f, "{}", b),
    }
  }
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Str(s)
  }
}

impl From<i64> for KeyPart {
  fn from(i: i64) -> Self {
    KeyPart::Int(i)
  }
}

impl From<u64> for KeyPart {
  fn from(i: u64) -> Self {
    i64::try_from(i).map_or(KeyPart::UInt(i), KeyPart::Int)
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    KeyPart::Bool(b)
  }
}

/// Identifier for a cacheable remote resource, e.g. `["products"]`.
///
/// Two keys are the same resource iff their parts are equal in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
  pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
    Self(parts.into_iter().collect())
  }

  /// Append a segment, builder style: `QueryKey::from("products").with(7u64)`.
  pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
    self.0.push(part.into());
    self
  }
}

impl From<&str> for QueryKey {
  fn from(s: &str) -> Self {
    Self(vec![KeyPart::from(s)])
  }
}

impl<const N: usize> From<[KeyPart; N]> for QueryKey {
  fn from(parts: [KeyPart; N]) -> Self {
    Self(parts.into())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, part) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{}", part)?;
    }
    write!(f, "]")
  }
}
