//! Ordered composition of processors.

use std::sync::Arc;

use switchyard_core::exchange::{FAILURE_ROUTE_ID, FAILURE_STEP};
use switchyard_core::{
    AsyncCallback, CancelReason, Completion, Exchange, ExchangeCancelled, Failure, Processor,
};
use tracing::debug;

use super::handoff::Invocation;
use super::{call, run, Step, Task};

/// Index at which the next activation of a pipeline starts. Set by the error
/// handler when redelivering from the failed step, consumed by the first
/// pipeline that sees it.
pub(crate) const RESUME_STEP: &str = "switchyard.resume_step";

/// Runs its steps strictly in order: step `i + 1` starts only after step `i`
/// has handed the exchange back, whether it finished inline or later.
///
/// Routing stops early when the exchange fails, when a step sets
/// `route_stop`, once a dead letter handled a failure, or when the exchange's
/// route is being cancelled. A response message left by a step becomes the
/// request message of the next one.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    steps: Arc<[Arc<dyn Processor>]>,
}

impl Pipeline {
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<Arc<dyn Processor>>) -> Self {
        Self {
            name: name.into(),
            steps: steps.into(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Processor for Pipeline {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> Completion {
        let start = exchange
            .remove_property(RESUME_STEP)
            .and_then(|v| v.cloned::<usize>())
            .unwrap_or(0)
            .min(self.steps.len());
        let task = Cursor {
            steps: Arc::clone(&self.steps),
            next: start,
            awaiting: None,
        };
        run(task, exchange, callback)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Cursor {
    steps: Arc<[Arc<dyn Processor>]>,
    next: usize,
    awaiting: Option<usize>,
}

impl Cursor {
    fn finished_step(index: usize, exchange: &mut Exchange) {
        if exchange.is_failed() {
            exchange.set_property(FAILURE_STEP, index);
            if let Some(route_id) = exchange.unit_of_work().route_id() {
                let route_id = route_id.to_string();
                exchange.set_property(FAILURE_ROUTE_ID, route_id);
            }
        }
    }
}

/// Whether the next step may run. Attaches the cancellation failure when the
/// route is being cancelled.
pub(crate) fn may_continue(exchange: &mut Exchange) -> bool {
    if exchange.is_failed() || exchange.is_route_stop() || exchange.is_failure_handled() {
        return false;
    }
    if exchange.unit_of_work().is_cancelled() {
        let cancelled = ExchangeCancelled {
            exchange_id: exchange.id().to_string(),
            reason: CancelReason::RouteStopped,
        };
        debug!(exchange_id = %exchange.id(), "exchange cancelled between steps");
        exchange.set_failure(Failure::new(cancelled));
        return false;
    }
    true
}

impl Task for Cursor {
    fn advance(&mut self, mut exchange: Exchange) -> Step {
        if let Some(index) = self.awaiting.take() {
            Self::finished_step(index, &mut exchange);
        }
        while self.next < self.steps.len() && may_continue(&mut exchange) {
            let index = self.next;
            self.next += 1;
            if index > 0 {
                exchange.promote_response();
            }
            let step = Arc::clone(&self.steps[index]);
            debug!(exchange_id = %exchange.id(), step = step.name(), index, "step");
            match call(step.as_ref(), exchange) {
                Invocation::Done(mut ex) => {
                    Self::finished_step(index, &mut ex);
                    exchange = ex;
                }
                Invocation::Pending(pending) => {
                    self.awaiting = Some(index);
                    return Step::Await(pending);
                }
            }
        }
        Step::Finished(exchange)
    }
}
