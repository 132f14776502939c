//! Dynamically typed values carried by messages, headers and properties.
//!
//! A [`Value`] is an immutable, cheaply clonable holder for any
//! `Send + Sync + 'static` type. Cloning a `Value` clones an `Arc`, never the
//! payload, so copying an exchange for a splitter or multicast is shallow.
//! Replacing a body means storing a new `Value`, never mutating the old one.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;

// ---------------------------------------------------------------------------
// TypeKey
// ---------------------------------------------------------------------------

/// Identity of a Rust type as seen by the type converter registry.
///
/// Equality and hashing use only the `TypeId`; the name is carried for
/// diagnostics and error messages.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Returns the key for `T`.
    #[must_use]
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The underlying `TypeId`.
    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The fully qualified type name, as reported by `std::any::type_name`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// Type-erased, immutable, shareable value.
#[derive(Clone)]
pub struct Value {
    inner: Arc<dyn Any + Send + Sync>,
    type_key: TypeKey,
}

impl Value {
    /// Wraps `value`. Wrapping a `Value` in a `Value` is never useful; use the
    /// value directly instead.
    #[must_use]
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_key: TypeKey::of::<T>(),
        }
    }

    /// The dynamic type of the held value.
    #[must_use]
    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    /// The dynamic type name of the held value.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_key.name
    }

    /// Returns `true` if the held value is a `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.type_key.id == TypeId::of::<T>()
    }

    /// Borrows the held value as `T`, if it is one.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Returns a clone of the held value as `T`, if it is one.
    #[must_use]
    pub fn cloned<T: Any + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    /// Convenience accessor for string payloads.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.downcast_ref::<String>().map(String::as_str)
    }

    /// Returns `true` if both values point at the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.downcast_ref::<String>() {
            return write!(f, "Value({s:?})");
        }
        if let Some(n) = self.downcast_ref::<i64>() {
            return write!(f, "Value({n}i64)");
        }
        if let Some(n) = self.downcast_ref::<i32>() {
            return write!(f, "Value({n}i32)");
        }
        if let Some(n) = self.downcast_ref::<f64>() {
            return write!(f, "Value({n}f64)");
        }
        if let Some(b) = self.downcast_ref::<bool>() {
            return write!(f, "Value({b})");
        }
        if let Some(bytes) = self.downcast_ref::<Vec<u8>>() {
            return write!(f, "Value(<{} bytes>)", bytes.len());
        }
        if let Some(bytes) = self.downcast_ref::<Bytes>() {
            return write!(f, "Value(<{} bytes>)", bytes.len());
        }
        if let Some(json) = self.downcast_ref::<serde_json::Value>() {
            return write!(f, "Value({json})");
        }
        write!(f, "Value(<{}>)", self.type_key.name)
    }
}

macro_rules! impl_from_for_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::new(value)
                }
            }
        )*
    };
}

impl_from_for_value!(
    String,
    bool,
    i32,
    i64,
    u32,
    u64,
    usize,
    f64,
    Vec<u8>,
    Bytes,
    serde_json::Value,
);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::new(value.to_string())
    }
}
