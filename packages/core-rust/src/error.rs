//! Error kinds shared by the core model and the engine.
//!
//! Failures carried by an [`Exchange`](crate::Exchange) are [`Failure`]s: a
//! clonable handle around an `anyhow::Error` so arbitrary user errors travel
//! through the route with their source chain intact and can still be
//! classified by concrete type.

use std::fmt;
use std::sync::Arc;

use crate::value::TypeKey;

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// A failure attached to an exchange.
#[derive(Clone)]
pub struct Failure(Arc<anyhow::Error>);

impl Failure {
    /// Wraps any error.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(error.into()))
    }

    /// Returns `true` if any error in the source chain is an `E`.
    #[must_use]
    pub fn is<E>(&self) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    /// Returns the first error in the source chain that is an `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(e) = self.0.downcast_ref::<E>() {
            return Some(e);
        }
        self.0.chain().find_map(|cause| cause.downcast_ref::<E>())
    }

    /// The wrapped error.
    #[must_use]
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    /// Returns `true` if both handles share the same error allocation.
    #[must_use]
    pub fn same_as(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }
}

// ---------------------------------------------------------------------------
// Type conversion
// ---------------------------------------------------------------------------

/// Errors from the type converter registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TypeConversionError {
    #[error("no type converter available to convert from {from} to {to}")]
    NoConversionAvailable { from: TypeKey, to: TypeKey },

    #[error("error converting {from} to {to}: {message}")]
    Failed {
        from: TypeKey,
        to: TypeKey,
        message: String,
    },

    #[error("a type converter from {from} to {to} is already registered")]
    ConverterExists { from: TypeKey, to: TypeKey },

    #[error("message has no body to convert to {to}")]
    MissingBody { to: TypeKey },
}

// ---------------------------------------------------------------------------
// Engine-level failure kinds carried on exchanges
// ---------------------------------------------------------------------------

/// Why an exchange was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The owning route was stopped and the drain timeout elapsed.
    RouteStopped,
    /// The unit of work was aborted by its owner.
    Aborted,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::RouteStopped => f.write_str("route stopped before the exchange drained"),
            CancelReason::Aborted => f.write_str("unit of work aborted"),
        }
    }
}

/// Stop-forced failure attached to exchanges that did not finish in time.
#[derive(Debug, Clone, thiserror::Error)]
#[error("exchange {exchange_id} cancelled: {reason}")]
pub struct ExchangeCancelled {
    pub exchange_id: String,
    pub reason: CancelReason,
}

/// A processor broke the completion contract: it dropped its callback without
/// invoking it, or never invoked it within the configured timeout.
#[derive(Debug, Clone, thiserror::Error)]
#[error("processor `{processor}` violated its completion contract: {detail}")]
pub struct ContractViolation {
    pub processor: String,
    pub detail: String,
}

/// An exchange was handed to a route that is not accepting exchanges.
#[derive(Debug, Clone, thiserror::Error)]
#[error("route `{route_id}` is not started")]
pub struct RouteNotStarted {
    pub route_id: String,
}

/// The dead-letter step itself failed; the original failure is preserved.
#[derive(Debug, thiserror::Error)]
#[error("dead letter delivery failed ({cause}) while handling: {original}")]
pub struct DeadLetterFailed {
    pub original: Failure,
    pub cause: Failure,
}

/// Unit of work misuse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitOfWorkError {
    #[error("unit of work for exchange {exchange_id} already completed")]
    AlreadyCompleted { exchange_id: String },
}
