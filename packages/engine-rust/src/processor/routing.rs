//! Message filter and content-based router.

use std::sync::Arc;

use switchyard_core::{AsyncCallback, Completion, Exchange, Processor};
use tracing::debug;

/// A condition evaluated against the exchange.
pub trait Predicate: Send + Sync {
    fn matches(&self, exchange: &Exchange) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Exchange) -> bool + Send + Sync,
{
    fn matches(&self, exchange: &Exchange) -> bool {
        self(exchange)
    }
}

/// Property set by [`Filter`] to record whether the exchange passed.
pub const FILTER_MATCHED: &str = "switchyard.filter_matched";

/// Routes the exchange through `inner` only when the predicate matches.
/// Non-matching exchanges pass through unchanged.
pub struct Filter {
    predicate: Arc<dyn Predicate>,
    inner: Arc<dyn Processor>,
}

impl Filter {
    pub fn new(predicate: impl Predicate + 'static, inner: Arc<dyn Processor>) -> Self {
        Self::from_parts(Arc::new(predicate), inner)
    }

    pub(crate) fn from_parts(predicate: Arc<dyn Predicate>, inner: Arc<dyn Processor>) -> Self {
        Self { predicate, inner }
    }
}

impl Processor for Filter {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> Completion {
        let matched = self.predicate.matches(&exchange);
        exchange.set_property(FILTER_MATCHED, matched);
        if matched {
            self.inner.process(exchange, callback)
        } else {
            debug!(exchange_id = %exchange.id(), "filtered out");
            Completion::Sync(exchange)
        }
    }

    fn name(&self) -> &str {
        "filter"
    }
}

/// Content-based router: the first matching `when` branch handles the
/// exchange, `otherwise` handles the rest. With no match and no `otherwise`
/// the exchange passes through.
#[derive(Default)]
pub struct Choice {
    branches: Vec<(Arc<dyn Predicate>, Arc<dyn Processor>)>,
    otherwise: Option<Arc<dyn Processor>>,
}

impl Choice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn when(mut self, predicate: impl Predicate + 'static, then: Arc<dyn Processor>) -> Self {
        self.branches.push((Arc::new(predicate), then));
        self
    }

    #[must_use]
    pub fn otherwise(mut self, then: Arc<dyn Processor>) -> Self {
        self.otherwise = Some(then);
        self
    }

    pub(crate) fn from_parts(
        branches: Vec<(Arc<dyn Predicate>, Arc<dyn Processor>)>,
        otherwise: Option<Arc<dyn Processor>>,
    ) -> Self {
        Self {
            branches,
            otherwise,
        }
    }
}

impl Processor for Choice {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> Completion {
        let branch = self
            .branches
            .iter()
            .find(|(predicate, _)| predicate.matches(&exchange))
            .map(|(_, then)| then)
            .or(self.otherwise.as_ref());
        match branch {
            Some(then) => then.process(exchange, callback),
            None => Completion::Sync(exchange),
        }
    }

    fn name(&self) -> &str {
        "choice"
    }
}
