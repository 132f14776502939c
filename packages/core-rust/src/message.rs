//! Message model: case-insensitive headers, a dynamically typed body and
//! optional attachments.

use std::collections::HashMap;

use bytes::Bytes;

use crate::convert::TypeConverterRegistry;
use crate::error::TypeConversionError;
use crate::value::{TypeKey, Value};

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Header map with case-insensitive keys.
///
/// The spelling used by the most recent `insert` is kept for iteration, and
/// inserting under an existing key (in any case) replaces the previous value.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: HashMap<String, (String, Value)>,
}

fn fold(key: &str) -> String {
    key.to_ascii_lowercase()
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, returning the value it replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        self.entries
            .insert(fold(&key), (key, value.into()))
            .map(|(_, old)| old)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(&fold(key)).map(|(_, v)| v)
    }

    /// Borrows a header as `T` if it is present and holds a `T`.
    #[must_use]
    pub fn get_as<T: 'static>(&self, key: &str) -> Option<&T> {
        self.get(key).and_then(Value::downcast_ref::<T>)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(&fold(key)).map(|(_, v)| v)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&fold(key))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterates `(key, value)` pairs using the last-inserted spelling of each key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v))
    }
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// A named binary attachment.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub content_type: String,
    pub data: Bytes,
}

impl Attachment {
    #[must_use]
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Headers, body and attachments flowing inside an exchange.
///
/// Cloning a message is shallow for the body and header values: they are
/// shared [`Value`]s.
#[derive(Debug, Clone, Default)]
pub struct Message {
    headers: Headers,
    body: Option<Value>,
    attachments: HashMap<String, Attachment>,
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_body(body: impl Into<Value>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = Some(body.into());
    }

    pub fn take_body(&mut self) -> Option<Value> {
        self.body.take()
    }

    /// Borrows the body as `T` without conversion.
    #[must_use]
    pub fn body_ref<T: 'static>(&self) -> Option<&T> {
        self.body.as_ref().and_then(Value::downcast_ref::<T>)
    }

    /// Returns the body converted to `T` through `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`TypeConversionError::MissingBody`] if there is no body, or the
    /// registry's error if no conversion exists or the converter fails.
    pub fn body_as<T>(&self, registry: &TypeConverterRegistry) -> Result<T, TypeConversionError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let body = self.body.as_ref().ok_or(TypeConversionError::MissingBody {
            to: TypeKey::of::<T>(),
        })?;
        registry.mandatory_convert_to::<T>(body)
    }

    /// Non-failing variant of [`Message::body_as`].
    #[must_use]
    pub fn try_body_as<T>(&self, registry: &TypeConverterRegistry) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.body
            .as_ref()
            .and_then(|body| registry.try_convert_to::<T>(body))
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(key, value);
    }

    pub fn remove_header(&mut self, key: &str) -> Option<Value> {
        self.headers.remove(key)
    }

    #[must_use]
    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        self.attachments.get(name)
    }

    pub fn add_attachment(&mut self, name: impl Into<String>, attachment: Attachment) {
        self.attachments.insert(name.into(), attachment);
    }

    pub fn remove_attachment(&mut self, name: &str) -> Option<Attachment> {
        self.attachments.remove(name)
    }

    #[must_use]
    pub fn attachments(&self) -> &HashMap<String, Attachment> {
        &self.attachments
    }

    #[must_use]
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}
