//! Failure classification, redelivery and dead-lettering.

pub mod handler;
pub mod policy;

use std::fmt;
use std::sync::Arc;

use switchyard_core::Processor;

pub use handler::{ErrorHandler, ErrorHandlerStats};
pub use policy::{Disposition, ExceptionMatcher, ExceptionPolicy, RedeliverFrom, RedeliveryPolicy};

/// Where unrecoverable exchanges go.
#[derive(Clone)]
pub enum DeadLetter {
    Processor(Arc<dyn Processor>),
    /// An endpoint URI, resolved to a producer when the route starts.
    Uri(String),
    /// A processor registered by name on the mediation context.
    Ref(String),
}

impl fmt::Debug for DeadLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetter::Processor(p) => f.debug_tuple("Processor").field(&p.name()).finish(),
            DeadLetter::Uri(uri) => f.debug_tuple("Uri").field(uri).finish(),
            DeadLetter::Ref(name) => f.debug_tuple("Ref").field(name).finish(),
        }
    }
}

/// Error handling for one route.
///
/// `redelivery` falls back to the context's default policy when unset.
#[derive(Debug, Clone, Default)]
pub struct ErrorHandlerDefinition {
    pub redelivery: Option<RedeliveryPolicy>,
    pub exceptions: ExceptionPolicy,
    pub dead_letter: Option<DeadLetter>,
}

impl ErrorHandlerDefinition {
    #[must_use]
    pub fn dead_letter_uri(uri: impl Into<String>) -> Self {
        Self {
            dead_letter: Some(DeadLetter::Uri(uri.into())),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = Some(policy);
        self
    }

    #[must_use]
    pub fn with_exceptions(mut self, exceptions: ExceptionPolicy) -> Self {
        self.exceptions = exceptions;
        self
    }

    #[must_use]
    pub fn with_dead_letter(mut self, dead_letter: DeadLetter) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }
}
