//! Redelivering error handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use switchyard_core::exchange::{EXCEPTION_CAUGHT, FAILURE_STEP, REDELIVERY_EXHAUSTED};
use switchyard_core::{
    AsyncCallback, CancelReason, Completion, DeadLetterFailed, Exchange, ExchangeCancelled,
    Failure, Message, Processor, Value,
};
use tracing::{error, info, warn};

use super::policy::{Disposition, ExceptionPolicy, RedeliverFrom, RedeliveryPolicy};
use crate::engine::handoff::Invocation;
use crate::engine::pipeline::RESUME_STEP;
use crate::engine::{call, run, Step, Task};

pub const REDELIVERIES_TOTAL: &str = "switchyard_redeliveries_total";
pub const DEAD_LETTERED_TOTAL: &str = "switchyard_dead_lettered_total";
pub const EXHAUSTED_TOTAL: &str = "switchyard_redelivery_exhausted_total";

/// Point-in-time copy of an error handler's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorHandlerStats {
    /// Failed attempts seen, including each failed redelivery.
    pub failures: u64,
    pub redeliveries: u64,
    pub dead_lettered: u64,
    pub dead_letter_failures: u64,
    /// Exchanges left unhandled after their redeliveries ran out.
    pub exhausted: u64,
}

#[derive(Default)]
struct Counters {
    failures: AtomicU64,
    redeliveries: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letter_failures: AtomicU64,
    exhausted: AtomicU64,
}

struct Shared {
    route_id: String,
    inner: Arc<dyn Processor>,
    redelivery: RedeliveryPolicy,
    exceptions: ExceptionPolicy,
    dead_letter: Option<Arc<dyn Processor>>,
    counters: Counters,
}

impl Shared {
    /// Same settings, fresh counters.
    fn detached(&self) -> Self {
        Self {
            route_id: self.route_id.clone(),
            inner: Arc::clone(&self.inner),
            redelivery: self.redelivery.clone(),
            exceptions: self.exceptions.clone(),
            dead_letter: self.dead_letter.clone(),
            counters: Counters::default(),
        }
    }
}

/// Wraps a processor, redelivering failed exchanges and dead-lettering the
/// ones that cannot be recovered.
///
/// A failed-but-handled exchange leaves with no exception, the
/// `failure_handled` flag set and the original failure under
/// [`EXCEPTION_CAUGHT`]. Failures the handler cannot handle leave with the
/// exception still attached and the redelivery count as history.
#[derive(Clone)]
pub struct ErrorHandler {
    shared: Arc<Shared>,
}

impl ErrorHandler {
    #[must_use]
    pub fn new(inner: Arc<dyn Processor>, redelivery: RedeliveryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                route_id: String::new(),
                inner,
                redelivery,
                exceptions: ExceptionPolicy::default(),
                dead_letter: None,
                counters: Counters::default(),
            }),
        }
    }

    /// Configuring a handler that has clones detaches it from them; the
    /// result starts with its own counters.
    fn edit(self, f: impl FnOnce(&mut Shared)) -> Self {
        let mut shared = Arc::try_unwrap(self.shared).unwrap_or_else(|shared| shared.detached());
        f(&mut shared);
        Self {
            shared: Arc::new(shared),
        }
    }

    #[must_use]
    pub fn with_exceptions(self, exceptions: ExceptionPolicy) -> Self {
        self.edit(|s| s.exceptions = exceptions)
    }

    #[must_use]
    pub fn with_dead_letter(self, dead_letter: Arc<dyn Processor>) -> Self {
        self.edit(|s| s.dead_letter = Some(dead_letter))
    }

    #[must_use]
    pub fn with_route_id(self, route_id: impl Into<String>) -> Self {
        let route_id = route_id.into();
        self.edit(|s| s.route_id = route_id)
    }

    #[must_use]
    pub fn redelivery(&self) -> &RedeliveryPolicy {
        &self.shared.redelivery
    }

    #[must_use]
    pub fn stats(&self) -> ErrorHandlerStats {
        let c = &self.shared.counters;
        ErrorHandlerStats {
            failures: c.failures.load(Ordering::Relaxed),
            redeliveries: c.redeliveries.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            dead_letter_failures: c.dead_letter_failures.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl Processor for ErrorHandler {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> Completion {
        let keep_original = self.shared.redelivery.max_redeliveries > 0
            && self.shared.redelivery.redeliver_from == RedeliverFrom::Start;
        let task = Attempt {
            shared: Arc::clone(&self.shared),
            original: keep_original.then(|| exchange.message().clone()),
            phase: Phase::Route,
        };
        run(task, exchange, callback)
    }

    fn name(&self) -> &str {
        "error-handler"
    }
}

// ---------------------------------------------------------------------------
// Attempt
// ---------------------------------------------------------------------------

enum Phase {
    /// Hand the exchange to the wrapped processor.
    Route,
    /// The wrapped processor handed the exchange back.
    Inspect,
    /// The dead letter handed the exchange back.
    DeadLettered(Failure),
}

enum Next {
    Finish(Exchange),
    Redeliver(Exchange, Duration),
    DeadLetter(Exchange, Arc<dyn Processor>, Failure),
}

struct Attempt {
    shared: Arc<Shared>,
    original: Option<Message>,
    phase: Phase,
}

impl Attempt {
    fn inspect(&self, mut exchange: Exchange) -> Next {
        let Some(failure) = exchange.exception().cloned() else {
            return Next::Finish(exchange);
        };
        if exchange.is_failure_handled() {
            return Next::Finish(exchange);
        }
        let shared = &self.shared;
        shared.counters.failures.fetch_add(1, Ordering::Relaxed);

        if exchange.unit_of_work().is_cancelled() {
            if !failure.is::<ExchangeCancelled>() {
                let cancelled = ExchangeCancelled {
                    exchange_id: exchange.id().to_string(),
                    reason: CancelReason::RouteStopped,
                };
                exchange.set_failure(Failure::new(
                    anyhow::Error::new(cancelled).context(failure.to_string()),
                ));
            }
            info!(
                exchange_id = %exchange.id(),
                route_id = %shared.route_id,
                "route stopping, no further redelivery"
            );
            return Next::Finish(exchange);
        }

        let attempts_left = exchange.redelivery_count() < shared.redelivery.max_redeliveries;
        match shared.exceptions.classify(&failure) {
            Disposition::Surface => Next::Finish(exchange),
            Disposition::Retry if attempts_left => self.redeliver(exchange, &failure),
            disposition => {
                let exhausted = disposition == Disposition::Retry;
                if exhausted {
                    exchange.set_property(REDELIVERY_EXHAUSTED, true);
                }
                match &shared.dead_letter {
                    Some(dead_letter) => {
                        let failure = exchange.take_exception().unwrap_or(failure);
                        exchange.set_property(EXCEPTION_CAUGHT, Value::new(failure.clone()));
                        Next::DeadLetter(exchange, Arc::clone(dead_letter), failure)
                    }
                    None => {
                        if exhausted {
                            shared.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!(EXHAUSTED_TOTAL, "route" => shared.route_id.clone())
                                .increment(1);
                        }
                        error!(
                            exchange_id = %exchange.id(),
                            route_id = %shared.route_id,
                            redeliveries = exchange.redelivery_count(),
                            error = %failure,
                            "exchange failed and no dead letter is configured"
                        );
                        Next::Finish(exchange)
                    }
                }
            }
        }
    }

    fn redeliver(&self, mut exchange: Exchange, failure: &Failure) -> Next {
        let shared = &self.shared;
        let _ = exchange.take_exception();
        let attempt = exchange.increment_redelivery_count();
        match shared.redelivery.redeliver_from {
            RedeliverFrom::Start => {
                if let Some(original) = &self.original {
                    exchange.set_message(original.clone());
                }
                let _ = exchange.take_response();
            }
            RedeliverFrom::FailedStep => {
                if let Some(step) = exchange.property_as::<usize>(FAILURE_STEP).copied() {
                    exchange.set_property(RESUME_STEP, step);
                }
            }
        }
        let delay = shared.redelivery.delay_for(attempt);
        #[allow(clippy::cast_possible_truncation)]
        let delay_ms = delay.as_millis() as u64;
        warn!(
            exchange_id = %exchange.id(),
            route_id = %shared.route_id,
            attempt,
            max = shared.redelivery.max_redeliveries,
            delay_ms,
            error = %failure,
            "redelivering exchange"
        );
        shared.counters.redeliveries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(REDELIVERIES_TOTAL, "route" => shared.route_id.clone()).increment(1);
        Next::Redeliver(exchange, delay)
    }

    fn after_dead_letter(&self, mut exchange: Exchange, original: Failure) -> Exchange {
        let shared = &self.shared;
        match exchange.take_exception() {
            Some(cause) => {
                shared
                    .counters
                    .dead_letter_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    exchange_id = %exchange.id(),
                    route_id = %shared.route_id,
                    error = %cause,
                    original = %original,
                    "dead letter failed"
                );
                exchange.set_failure(Failure::new(DeadLetterFailed { original, cause }));
            }
            None => {
                shared.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(DEAD_LETTERED_TOTAL, "route" => shared.route_id.clone())
                    .increment(1);
                warn!(
                    exchange_id = %exchange.id(),
                    route_id = %shared.route_id,
                    redeliveries = exchange.redelivery_count(),
                    error = %original,
                    "exchange dead-lettered"
                );
                exchange.set_failure_handled(true);
            }
        }
        exchange
    }
}

impl Task for Attempt {
    fn advance(&mut self, mut exchange: Exchange) -> Step {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Inspect) {
                Phase::Route => match call(self.shared.inner.as_ref(), exchange) {
                    Invocation::Done(ex) => exchange = ex,
                    Invocation::Pending(pending) => return Step::Await(pending),
                },
                Phase::Inspect => match self.inspect(exchange) {
                    Next::Finish(ex) => return Step::Finished(ex),
                    Next::Redeliver(ex, delay) => {
                        self.phase = Phase::Route;
                        if !delay.is_zero() {
                            return Step::Delay(ex, delay);
                        }
                        exchange = ex;
                    }
                    Next::DeadLetter(ex, dead_letter, failure) => {
                        self.phase = Phase::DeadLettered(failure);
                        match call(dead_letter.as_ref(), ex) {
                            Invocation::Done(ex) => exchange = ex,
                            Invocation::Pending(pending) => return Step::Await(pending),
                        }
                    }
                },
                Phase::DeadLettered(original) => {
                    return Step::Finished(self.after_dead_letter(exchange, original));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use parking_lot::Mutex;
    use switchyard_core::{ContractViolation, TypeConversionError, TypeKey};

    use super::*;
    use crate::engine::Pipeline;
    use crate::error_handler::ExceptionMatcher;

    #[derive(Debug, thiserror::Error)]
    #[error("step two failed")]
    struct StepTwoFailed;

    struct Apply(Box<dyn Fn(&mut Exchange) + Send + Sync>);

    impl Apply {
        fn new(f: impl Fn(&mut Exchange) + Send + Sync + 'static) -> Arc<dyn Processor> {
            Arc::new(Self(Box::new(f)))
        }
    }

    impl Processor for Apply {
        fn process(&self, mut exchange: Exchange, _callback: AsyncCallback) -> Completion {
            (self.0)(&mut exchange);
            Completion::Sync(exchange)
        }
    }

    /// Records what reaches the dead letter.
    #[derive(Default)]
    struct Sink(Mutex<Vec<(u32, Option<String>, String)>>);

    impl Processor for Sink {
        fn process(&self, exchange: Exchange, _callback: AsyncCallback) -> Completion {
            let caught = exchange
                .property_as::<Failure>(EXCEPTION_CAUGHT)
                .map(ToString::to_string);
            let body = exchange
                .body()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.0.lock().push((exchange.redelivery_count(), caught, body));
            Completion::Sync(exchange)
        }
    }

    fn finish(out: Completion) -> Exchange {
        match out {
            Completion::Sync(ex) => ex,
            Completion::Async => panic!("expected synchronous completion"),
        }
    }

    fn no_delay(max: u32) -> RedeliveryPolicy {
        RedeliveryPolicy::default()
            .with_max_redeliveries(max)
            .with_redelivery_delay(Duration::ZERO)
    }

    fn upper_then_fail(attempts: Arc<AtomicU32>) -> Arc<dyn Processor> {
        Arc::new(Pipeline::new(
            "route",
            vec![
                Apply::new(|ex| {
                    let upper = ex.body().and_then(Value::as_str).map(str::to_uppercase);
                    if let Some(upper) = upper {
                        ex.set_body(upper);
                    }
                }),
                Apply::new(move |ex| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    ex.set_exception(StepTwoFailed);
                }),
            ],
        ))
    }

    #[test]
    fn configuring_a_cloned_handler_keeps_the_dead_letter() {
        let attempts = Arc::new(AtomicU32::new(0));
        let base = ErrorHandler::new(upper_then_fail(Arc::clone(&attempts)), no_delay(1));
        let sink = Arc::new(Sink::default());
        let handler = base
            .clone()
            .with_route_id("r")
            .with_dead_letter(Arc::clone(&sink) as Arc<dyn Processor>);

        let out = finish(handler.process(Exchange::with_body("hi"), AsyncCallback::noop()));
        assert!(!out.is_failed());
        assert!(out.is_failure_handled());
        assert_eq!(sink.0.lock().len(), 1);
        assert_eq!(handler.stats().dead_lettered, 1);

        // the original is untouched
        let out = finish(base.process(Exchange::with_body("hi"), AsyncCallback::noop()));
        assert!(out.is_failed());
        assert_eq!(base.stats().dead_lettered, 0);
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[test]
    fn retries_then_dead_letters_with_redelivery_count() {
        let attempts = Arc::new(AtomicU32::new(0));
        let sink = Arc::new(Sink::default());
        let handler = ErrorHandler::new(upper_then_fail(Arc::clone(&attempts)), no_delay(2))
            .with_dead_letter(sink.clone())
            .with_route_id("r1");

        let ex = finish(handler.process(Exchange::with_body("hi"), AsyncCallback::noop()));

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let received = sink.0.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, 2);
        assert_eq!(received[0].1.as_deref(), Some("step two failed"));
        assert_eq!(received[0].2, "HI");
        assert!(!ex.is_failed());
        assert!(ex.is_failure_handled());
        assert_eq!(ex.property_as::<bool>(REDELIVERY_EXHAUSTED), Some(&true));

        let stats = handler.stats();
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.redeliveries, 2);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[test]
    fn redelivery_from_start_restores_the_original_message() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let inner = Arc::new(Pipeline::new(
            "route",
            vec![
                Apply::new(move |ex| {
                    let body = ex.body().and_then(Value::as_str).unwrap_or("").to_string();
                    log.lock().push(body.clone());
                    ex.set_body(format!("{body}+"));
                }),
                Apply::new(|ex| ex.set_exception(StepTwoFailed)),
            ],
        ));
        let handler = ErrorHandler::new(inner, no_delay(2));
        let ex = finish(handler.process(Exchange::with_body("x"), AsyncCallback::noop()));
        assert_eq!(*seen.lock(), vec!["x", "x", "x"]);
        assert!(ex.exception().unwrap().is::<StepTwoFailed>());
        assert_eq!(ex.redelivery_count(), 2);
        assert_eq!(handler.stats().exhausted, 1);
    }

    #[test]
    fn redelivery_from_failed_step_skips_earlier_steps() {
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        let (f, s) = (Arc::clone(&first), Arc::clone(&second));
        let inner = Arc::new(Pipeline::new(
            "route",
            vec![
                Apply::new(move |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
                Apply::new(move |ex| {
                    if s.fetch_add(1, Ordering::SeqCst) < 2 {
                        ex.set_exception(StepTwoFailed);
                    } else {
                        ex.set_body("recovered");
                    }
                }),
            ],
        ));
        let handler = ErrorHandler::new(
            inner,
            no_delay(5).with_redeliver_from(RedeliverFrom::FailedStep),
        );
        let ex = finish(handler.process(Exchange::new(), AsyncCallback::noop()));
        assert!(!ex.is_failed());
        assert_eq!(ex.body().and_then(Value::as_str), Some("recovered"));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 3);
        assert_eq!(ex.redelivery_count(), 2);
    }

    #[test]
    fn non_retryable_goes_straight_to_dead_letter() {
        let attempts = Arc::new(AtomicU32::new(0));
        let sink = Arc::new(Sink::default());
        let handler = ErrorHandler::new(upper_then_fail(Arc::clone(&attempts)), no_delay(5))
            .with_exceptions(
                ExceptionPolicy::default().never_retry(ExceptionMatcher::of::<StepTwoFailed>()),
            )
            .with_dead_letter(sink.clone());
        let ex = finish(handler.process(Exchange::with_body("a"), AsyncCallback::noop()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(sink.0.lock()[0].0, 0);
        assert!(ex.is_failure_handled());
        assert!(ex.property(REDELIVERY_EXHAUSTED).is_none());
    }

    #[test]
    fn conversion_failure_is_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let inner = Apply::new(move |ex| {
            counter.fetch_add(1, Ordering::SeqCst);
            ex.set_exception(TypeConversionError::NoConversionAvailable {
                from: TypeKey::of::<String>(),
                to: TypeKey::of::<i64>(),
            });
        });
        let sink = Arc::new(Sink::default());
        let handler = ErrorHandler::new(inner, no_delay(3)).with_dead_letter(sink.clone());
        let ex = finish(handler.process(Exchange::new(), AsyncCallback::noop()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(sink.0.lock().len(), 1);
        assert!(ex.is_failure_handled());
    }

    #[test]
    fn contract_violation_surfaces_untouched() {
        let inner = Apply::new(|ex| {
            ex.set_exception(ContractViolation {
                processor: "p".into(),
                detail: "lost".into(),
            });
        });
        let sink = Arc::new(Sink::default());
        let handler = ErrorHandler::new(inner, no_delay(3)).with_dead_letter(sink.clone());
        let ex = finish(handler.process(Exchange::new(), AsyncCallback::noop()));
        assert!(ex.exception().unwrap().is::<ContractViolation>());
        assert!(sink.0.lock().is_empty());
        assert_eq!(handler.stats().redeliveries, 0);
    }

    #[test]
    fn failing_dead_letter_surfaces_both_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let dead_letter = Apply::new(|ex| ex.set_exception(anyhow::anyhow!("dlq offline")));
        let handler = ErrorHandler::new(upper_then_fail(attempts), no_delay(0))
            .with_dead_letter(dead_letter);
        let ex = finish(handler.process(Exchange::with_body("a"), AsyncCallback::noop()));
        let failure = ex.exception().unwrap();
        let dlf = failure.downcast_ref::<DeadLetterFailed>().unwrap();
        assert!(dlf.original.is::<StepTwoFailed>());
        assert_eq!(dlf.cause.to_string(), "dlq offline");
        assert!(!ex.is_failure_handled());
        assert_eq!(handler.stats().dead_letter_failures, 1);
    }

    #[test]
    fn cancelled_exchange_is_not_redelivered() {
        let token = switchyard_core::CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let cancel = token.clone();
        let inner = Apply::new(move |ex| {
            counter.fetch_add(1, Ordering::SeqCst);
            cancel.cancel();
            ex.set_exception(StepTwoFailed);
        });
        let handler = ErrorHandler::new(inner, no_delay(5));
        let exchange = Exchange::new();
        exchange.unit_of_work().bind_cancellation(token);
        let ex = finish(handler.process(exchange, AsyncCallback::noop()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(ex.exception().unwrap().is::<ExchangeCancelled>());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_redelivery_suspends_between_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let sink = Arc::new(Sink::default());
        let handler = ErrorHandler::new(
            upper_then_fail(Arc::clone(&attempts)),
            RedeliveryPolicy::default()
                .with_max_redeliveries(2)
                .with_redelivery_delay(Duration::from_millis(500)),
        )
        .with_dead_letter(sink.clone());

        let (tx, rx) = tokio::sync::oneshot::channel();
        let out = handler.process(
            Exchange::with_body("hi"),
            AsyncCallback::from_fn(move |ex| {
                let _ = tx.send(ex);
            }),
        );
        assert!(!out.is_sync());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let ex = rx.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(ex.redelivery_count(), 2);
        assert!(ex.is_failure_handled());
    }
}
