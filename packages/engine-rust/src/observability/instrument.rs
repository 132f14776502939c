//! Per-step timing and outcome instrumentation.
//!
//! Records step duration and outcome on a `tracing` span and in `metrics`
//! counters. Without an installed metrics recorder the counters are no-ops.

use std::sync::Arc;
use std::time::Instant;

use switchyard_core::{AsyncCallback, Completion, Exchange, Processor};
use tracing::{debug, info_span};

pub const STEPS_TOTAL: &str = "switchyard_steps_total";
pub const STEP_DURATION_SECONDS: &str = "switchyard_step_duration_seconds";

/// Wraps a processor, recording duration and outcome each time it runs.
///
/// For asynchronous steps the duration spans from the call until the step
/// hands the exchange back.
pub struct Instrumented {
    inner: Arc<dyn Processor>,
    route_id: Arc<str>,
}

impl Instrumented {
    #[must_use]
    pub fn new(inner: Arc<dyn Processor>, route_id: impl Into<Arc<str>>) -> Self {
        Self {
            inner,
            route_id: route_id.into(),
        }
    }
}

fn outcome(exchange: &Exchange) -> &'static str {
    if exchange.is_failed() {
        "error"
    } else {
        "ok"
    }
}

fn record(route_id: &str, step: &str, exchange: &Exchange, started: Instant) {
    let elapsed = started.elapsed();
    let outcome = outcome(exchange);
    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = elapsed.as_millis() as u64;
    debug!(
        exchange_id = %exchange.id(),
        route_id,
        step,
        duration_ms,
        outcome,
        "step complete"
    );
    metrics::counter!(
        STEPS_TOTAL,
        "route" => route_id.to_string(),
        "step" => step.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(STEP_DURATION_SECONDS, "route" => route_id.to_string())
        .record(elapsed.as_secs_f64());
}

impl Processor for Instrumented {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> Completion {
        let step = self.inner.name().to_string();
        let span = info_span!(
            "step",
            route_id = %self.route_id,
            step = %step,
            exchange_id = %exchange.id(),
        );
        let _entered = span.enter();
        let started = Instant::now();

        let route_id = Arc::clone(&self.route_id);
        let step_name = step.clone();
        // Dropping the wrapper drops `callback` with it, which keeps the
        // abandon signal intact for the caller.
        let wrapped = AsyncCallback::from_fn(move |ex: Exchange| {
            record(&route_id, &step_name, &ex, started);
            callback.done(ex);
        });

        match self.inner.process(exchange, wrapped) {
            Completion::Sync(exchange) => {
                record(&self.route_id, &step, &exchange, started);
                Completion::Sync(exchange)
            }
            Completion::Async => Completion::Async,
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
