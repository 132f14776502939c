//! Marshal and unmarshal steps over a [`DataFormat`].

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use switchyard_core::{
    AsyncCallback, Completion, DataFormat, Exchange, Processor, TypeConversionError,
    TypeConverterRegistry, TypeKey, Value,
};

/// Writes the body through a data format; the new body is the produced
/// `Bytes`.
pub struct Marshal {
    format: Arc<dyn DataFormat>,
    name: String,
}

impl Marshal {
    #[must_use]
    pub fn new(format: Arc<dyn DataFormat>) -> Self {
        Self {
            name: format!("marshal({})", format.name()),
            format,
        }
    }

    fn marshal(&self, exchange: &Exchange) -> anyhow::Result<Bytes> {
        let body = exchange.body().ok_or(TypeConversionError::MissingBody {
            to: TypeKey::of::<Bytes>(),
        })?;
        let mut out = Vec::new();
        self.format
            .marshal(exchange, body, &mut out)
            .with_context(|| format!("{} marshal failed", self.format.name()))?;
        Ok(Bytes::from(out))
    }
}

impl Processor for Marshal {
    fn process(&self, mut exchange: Exchange, _callback: AsyncCallback) -> Completion {
        match self.marshal(&exchange) {
            Ok(bytes) => exchange.set_body(bytes),
            Err(e) => exchange.set_exception(e),
        }
        Completion::Sync(exchange)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Reads the body through a data format. The current body is first
/// converted to bytes with the type converter registry.
pub struct Unmarshal {
    format: Arc<dyn DataFormat>,
    registry: Arc<TypeConverterRegistry>,
    name: String,
}

impl Unmarshal {
    #[must_use]
    pub fn new(format: Arc<dyn DataFormat>, registry: Arc<TypeConverterRegistry>) -> Self {
        Self {
            name: format!("unmarshal({})", format.name()),
            format,
            registry,
        }
    }

    fn unmarshal(&self, exchange: &Exchange) -> anyhow::Result<Value> {
        let raw = exchange.message().body_as::<Vec<u8>>(&self.registry)?;
        self.format
            .unmarshal(exchange, &mut raw.as_slice())
            .with_context(|| format!("{} unmarshal failed", self.format.name()))
    }
}

impl Processor for Unmarshal {
    fn process(&self, mut exchange: Exchange, _callback: AsyncCallback) -> Completion {
        match self.unmarshal(&exchange) {
            Ok(body) => exchange.set_body(body),
            Err(e) => exchange.set_exception(e),
        }
        Completion::Sync(exchange)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
