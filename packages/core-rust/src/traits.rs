//! Step contracts: [`Processor`], its completion callback and data formats.

use std::fmt;
use std::io::{Read, Write};

use async_trait::async_trait;

use crate::exchange::Exchange;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Result of handing an exchange to a processor.
#[derive(Debug)]
pub enum Completion {
    /// The step finished inline and returns the exchange.
    Sync(Exchange),
    /// The step kept the exchange and will hand it back through its
    /// [`AsyncCallback`], exactly once, from any thread.
    Async,
}

impl Completion {
    #[must_use]
    pub fn is_sync(&self) -> bool {
        matches!(self, Completion::Sync(_))
    }
}

// ---------------------------------------------------------------------------
// AsyncCallback
// ---------------------------------------------------------------------------

type DoneFn = Box<dyn FnOnce(Exchange) + Send>;
type DropFn = Box<dyn FnOnce() + Send>;

/// Continuation handed to a processor.
///
/// [`AsyncCallback::done`] consumes the callback, so it can run at most once.
/// A callback dropped without `done` runs its abandon hook instead, which the
/// engine uses to detect processors that lost an exchange.
#[must_use = "a processor that returns Completion::Async must call done()"]
pub struct AsyncCallback {
    on_done: Option<DoneFn>,
    on_drop: Option<DropFn>,
}

impl AsyncCallback {
    pub fn new<D, A>(on_done: D, on_abandon: A) -> Self
    where
        D: FnOnce(Exchange) + Send + 'static,
        A: FnOnce() + Send + 'static,
    {
        Self {
            on_done: Some(Box::new(on_done)),
            on_drop: Some(Box::new(on_abandon)),
        }
    }

    /// A callback with no abandon hook.
    pub fn from_fn<D>(on_done: D) -> Self
    where
        D: FnOnce(Exchange) + Send + 'static,
    {
        Self {
            on_done: Some(Box::new(on_done)),
            on_drop: None,
        }
    }

    /// A callback that discards the exchange.
    pub fn noop() -> Self {
        Self {
            on_done: None,
            on_drop: None,
        }
    }

    /// Hands the finished exchange back to whoever is waiting for it.
    pub fn done(mut self, exchange: Exchange) {
        self.on_drop = None;
        if let Some(on_done) = self.on_done.take() {
            on_done(exchange);
        }
    }
}

impl Drop for AsyncCallback {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl fmt::Debug for AsyncCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCallback")
            .field("pending", &self.on_done.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// A single routing or transformation step.
///
/// Failures are reported by attaching them to the exchange
/// ([`Exchange::set_exception`]), never by panicking.
pub trait Processor: Send + Sync {
    /// Processes `exchange`, either inline ([`Completion::Sync`]) or later
    /// through `callback` ([`Completion::Async`]).
    ///
    /// A synchronous step may simply drop `callback`: it is only armed once
    /// the step has reported `Async`.
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> Completion;

    /// Name used in logs, metrics and contract-violation reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A step written as an `async fn`. Run through the engine's async adapter.
#[async_trait]
pub trait AsyncProcessor: Send + Sync {
    /// # Errors
    ///
    /// An error is attached to the exchange as its failure.
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// DataFormat
// ---------------------------------------------------------------------------

/// Pluggable marshalling between in-memory bodies and byte streams.
pub trait DataFormat: Send + Sync {
    /// Short name (`"json"`, `"msgpack"`, ...).
    fn name(&self) -> &str;

    /// Writes `body` to `output`.
    ///
    /// # Errors
    ///
    /// Fails if the body type is not supported or encoding fails.
    fn marshal(&self, exchange: &Exchange, body: &Value, output: &mut dyn Write)
        -> anyhow::Result<()>;

    /// Reads a body from `input`.
    ///
    /// # Errors
    ///
    /// Fails if the input cannot be decoded.
    fn unmarshal(&self, exchange: &Exchange, input: &mut dyn Read) -> anyhow::Result<Value>;
}
