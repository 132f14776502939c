//! Inline transformation steps.

use std::sync::Arc;

use switchyard_core::{
    AsyncCallback, Completion, Exchange, Processor, TypeConversionError, TypeConverterRegistry,
    TypeKey, Value,
};

type ValueFn = Arc<dyn Fn(&Exchange) -> Value + Send + Sync>;

// ---------------------------------------------------------------------------
// FnProcessor
// ---------------------------------------------------------------------------

/// A synchronous step backed by a closure. An `Err` fails the exchange.
pub struct FnProcessor<F> {
    name: String,
    f: F,
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync,
{
    fn process(&self, mut exchange: Exchange, _callback: AsyncCallback) -> Completion {
        if let Err(e) = (self.f)(&mut exchange) {
            exchange.set_exception(e);
        }
        Completion::Sync(exchange)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wraps a closure as a processor.
pub fn process_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn Processor>
where
    F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnProcessor {
        name: name.into(),
        f,
    })
}

// ---------------------------------------------------------------------------
// SetBody / SetHeader
// ---------------------------------------------------------------------------

/// Replaces the message body.
pub struct SetBody {
    value: ValueFn,
}

impl SetBody {
    #[must_use]
    pub fn constant(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            value: Arc::new(move |_| value.clone()),
        }
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Exchange) -> Value + Send + Sync + 'static,
    {
        Self { value: Arc::new(f) }
    }
}

impl Processor for SetBody {
    fn process(&self, mut exchange: Exchange, _callback: AsyncCallback) -> Completion {
        let body = (self.value)(&exchange);
        exchange.set_body(body);
        Completion::Sync(exchange)
    }

    fn name(&self) -> &str {
        "set-body"
    }
}

/// Sets one header on the message.
pub struct SetHeader {
    key: String,
    value: ValueFn,
}

impl SetHeader {
    #[must_use]
    pub fn constant(key: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            key: key.into(),
            value: Arc::new(move |_| value.clone()),
        }
    }

    pub fn from_fn<F>(key: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Exchange) -> Value + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            value: Arc::new(f),
        }
    }
}

impl Processor for SetHeader {
    fn process(&self, mut exchange: Exchange, _callback: AsyncCallback) -> Completion {
        let value = (self.value)(&exchange);
        exchange.message_mut().set_header(self.key.clone(), value);
        Completion::Sync(exchange)
    }

    fn name(&self) -> &str {
        "set-header"
    }
}

// ---------------------------------------------------------------------------
// ConvertBodyTo
// ---------------------------------------------------------------------------

/// Converts the body through the type converter registry.
///
/// A missing body or an impossible conversion fails the exchange with a
/// [`TypeConversionError`].
pub struct ConvertBodyTo {
    target: TypeKey,
    registry: Arc<TypeConverterRegistry>,
    name: String,
}

impl ConvertBodyTo {
    #[must_use]
    pub fn new(target: TypeKey, registry: Arc<TypeConverterRegistry>) -> Self {
        Self {
            name: format!("convert-body-to({})", target.name()),
            target,
            registry,
        }
    }

    #[must_use]
    pub fn to<T: 'static>(registry: Arc<TypeConverterRegistry>) -> Self {
        Self::new(TypeKey::of::<T>(), registry)
    }
}

impl Processor for ConvertBodyTo {
    fn process(&self, mut exchange: Exchange, _callback: AsyncCallback) -> Completion {
        let converted = match exchange.body() {
            Some(body) => self.registry.mandatory_convert(self.target, body),
            None => Err(TypeConversionError::MissingBody { to: self.target }),
        };
        match converted {
            Ok(body) => exchange.set_body(body),
            Err(e) => exchange.set_exception(e),
        }
        Completion::Sync(exchange)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(step: &dyn Processor, exchange: Exchange) -> Exchange {
        match step.process(exchange, AsyncCallback::noop()) {
            Completion::Sync(ex) => ex,
            Completion::Async => panic!("inline steps never suspend"),
        }
    }

    #[test]
    fn closure_errors_fail_the_exchange() {
        let step = process_fn("reject", |_| anyhow::bail!("rejected"));
        let ex = run(step.as_ref(), Exchange::new());
        assert_eq!(ex.exception().unwrap().to_string(), "rejected");
        assert_eq!(step.name(), "reject");
    }

    #[test]
    fn set_body_and_header() {
        let ex = run(&SetBody::constant("fixed"), Exchange::with_body("old"));
        assert_eq!(ex.body().and_then(Value::as_str), Some("fixed"));

        let ex = run(
            &SetHeader::from_fn("Length", |ex| {
                Value::from(ex.body().and_then(Value::as_str).map_or(0, str::len))
            }),
            ex,
        );
        assert_eq!(ex.message().headers().get_as::<usize>("length"), Some(&5));
    }

    #[test]
    fn convert_body_uses_the_registry() {
        let registry = Arc::new(TypeConverterRegistry::with_builtins());
        let step = ConvertBodyTo::to::<i64>(Arc::clone(&registry));
        let ex = run(&step, Exchange::with_body("42"));
        assert_eq!(ex.message().body_ref::<i64>(), Some(&42));

        let ex = run(&step, Exchange::with_body("abc"));
        assert!(ex.exception().unwrap().is::<TypeConversionError>());

        let ex = run(&step, Exchange::new());
        assert!(matches!(
            ex.exception().unwrap().downcast_ref::<TypeConversionError>(),
            Some(TypeConversionError::MissingBody { .. })
        ));
    }
}
