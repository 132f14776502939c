//! Route entry point: admission, in-flight tracking and completion.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::RwLock;
use switchyard_core::{
    AsyncCallback, CancelReason, CancellationToken, Completion, Exchange, ExchangeCancelled,
    Failure, Processor, RouteNotStarted, UnitOfWork,
};
use tracing::{debug, info};

use crate::engine::handoff::Invocation;
use crate::engine::{call, run, Step, Task};

pub const EXCHANGES_TOTAL: &str = "switchyard_exchanges_total";
pub const IN_FLIGHT: &str = "switchyard_route_in_flight";

/// Route lifecycle: `Stopped -> Starting -> Started -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouteState::Stopped => "stopped",
            RouteState::Starting => "starting",
            RouteState::Started => "started",
            RouteState::Stopping => "stopping",
        })
    }
}

/// Exchange counts for one route since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// State shared by a route, its entry processor and its handles.
pub(crate) struct RouteShared {
    pub(crate) id: String,
    state: ArcSwap<RouteState>,
    token: ArcSwap<CancellationToken>,
    pipeline: RwLock<Option<Arc<dyn Processor>>>,
    in_flight: DashMap<String, Arc<UnitOfWork>>,
    counters: Counters,
}

impl RouteShared {
    pub(crate) fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            state: ArcSwap::from_pointee(RouteState::Stopped),
            token: ArcSwap::from_pointee(CancellationToken::new()),
            pipeline: RwLock::new(None),
            in_flight: DashMap::new(),
            counters: Counters::default(),
        })
    }

    pub(crate) fn state(&self) -> RouteState {
        **self.state.load()
    }

    pub(crate) fn transition(&self, to: RouteState) {
        let from = self.state();
        self.state.store(Arc::new(to));
        info!(route_id = %self.id, %from, %to, "route state changed");
    }

    /// Installs the assembled pipeline and a fresh cancellation token.
    pub(crate) fn activate(&self, pipeline: Arc<dyn Processor>) {
        self.token.store(Arc::new(CancellationToken::new()));
        *self.pipeline.write() = Some(pipeline);
    }

    pub(crate) fn deactivate(&self) {
        *self.pipeline.write() = None;
    }

    pub(crate) fn cancel(&self) {
        self.token.load().cancel();
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Waits until no owned exchange is in flight, polling every 10ms.
    /// Returns `false` if `timeout` elapsed first.
    pub(crate) async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Completes every unit of work still in flight with [`ExchangeCancelled`].
    /// Returns how many were aborted.
    pub(crate) fn abort_in_flight(&self) -> usize {
        let ids: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        let mut aborted = 0;
        for id in ids {
            let Some((exchange_id, uow)) = self.in_flight.remove(&id) else {
                continue;
            };
            let failure = Failure::new(ExchangeCancelled {
                exchange_id: exchange_id.clone(),
                reason: CancelReason::RouteStopped,
            });
            if uow.abort(failure) {
                aborted += 1;
                self.record(true);
                debug!(route_id = %self.id, %exchange_id, "in-flight exchange aborted");
            }
        }
        aborted
    }

    /// Tracks `uow` as in flight, then re-checks the state, so a concurrent
    /// stop either drains the exchange or never admits it.
    pub(crate) fn admit(&self, exchange_id: &str, uow: &Arc<UnitOfWork>) -> bool {
        self.in_flight.insert(exchange_id.to_string(), Arc::clone(uow));
        if self.state() == RouteState::Started {
            self.counters.total.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        self.in_flight.remove(exchange_id);
        false
    }

    fn reject(&self, mut exchange: Exchange) -> Exchange {
        debug!(route_id = %self.id, exchange_id = %exchange.id(), "route not started");
        exchange.set_exception(RouteNotStarted {
            route_id: self.id.clone(),
        });
        exchange
    }

    fn record(&self, failed: bool) {
        let (counter, outcome) = if failed {
            (&self.counters.failed, "failed")
        } else {
            (&self.counters.completed, "completed")
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(EXCHANGES_TOTAL, "route" => self.id.clone(), "outcome" => outcome)
            .increment(1);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(IN_FLIGHT, "route" => self.id.clone()).set(self.in_flight.len() as f64);
    }

    pub(crate) fn stats(&self) -> RouteStats {
        RouteStats {
            total: self.counters.total.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }
}

/// The processor consumers feed. Rejects exchanges unless the route is
/// started, and completes the unit of work of every exchange the route owns.
///
/// An exchange arriving from another route through an in-process hand-off is
/// owned by that route; here it is only routed.
pub(crate) struct RouteEntry {
    shared: Arc<RouteShared>,
}

impl RouteEntry {
    pub(crate) fn new(shared: Arc<RouteShared>) -> Self {
        Self { shared }
    }
}

impl Processor for RouteEntry {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> Completion {
        let shared = &self.shared;
        let pipeline = match shared.state() {
            RouteState::Started => shared.pipeline.read().clone(),
            _ => None,
        };
        let Some(pipeline) = pipeline else {
            return Completion::Sync(shared.reject(exchange));
        };

        let uow = Arc::clone(exchange.unit_of_work());
        let owned = uow.claim(&shared.id);
        if owned && !shared.admit(exchange.id(), &uow) {
            return Completion::Sync(shared.reject(exchange));
        }
        uow.bind_cancellation(shared.token.load().child_token());

        let activation = Activation {
            shared: Arc::clone(shared),
            pipeline,
            owned,
            entered: false,
        };
        run(activation, exchange, callback)
    }

    fn name(&self) -> &str {
        &self.shared.id
    }
}

struct Activation {
    shared: Arc<RouteShared>,
    pipeline: Arc<dyn Processor>,
    owned: bool,
    entered: bool,
}

impl Activation {
    fn finish(&self, mut exchange: Exchange) -> Exchange {
        if !self.owned {
            return exchange;
        }
        let uow = Arc::clone(exchange.unit_of_work());
        if !exchange.is_failed() {
            if let Some(failure) = uow.take_child_failures().into_iter().next() {
                exchange.set_failure(failure);
            }
        }
        // Outlived the drain timeout; completes as cancelled even if the last
        // step succeeded.
        if !exchange.is_failed() && uow.is_cancelled() {
            exchange.set_exception(ExchangeCancelled {
                exchange_id: exchange.id().to_string(),
                reason: CancelReason::RouteStopped,
            });
        }
        // Already aborted by a stop that gave up on this exchange.
        if self.shared.in_flight.remove(exchange.id()).is_none() {
            debug!(
                route_id = %self.shared.id,
                exchange_id = %exchange.id(),
                "exchange finished after its unit of work was aborted"
            );
            return exchange;
        }
        let failed = exchange.is_failed();
        self.shared.record(failed);
        uow.done(&exchange);
        debug!(
            route_id = %self.shared.id,
            exchange_id = %exchange.id(),
            failed,
            "exchange completed"
        );
        exchange
    }
}

impl Task for Activation {
    fn advance(&mut self, exchange: Exchange) -> Step {
        if self.entered {
            return Step::Finished(self.finish(exchange));
        }
        self.entered = true;
        match call(self.pipeline.as_ref(), exchange) {
            Invocation::Done(exchange) => Step::Finished(self.finish(exchange)),
            Invocation::Pending(pending) => Step::Await(pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use switchyard_core::Value;

    use super::*;
    use crate::processor::process_fn;

    fn started(pipeline: Arc<dyn Processor>) -> (Arc<RouteShared>, RouteEntry) {
        let shared = RouteShared::new("r");
        shared.activate(pipeline);
        shared.transition(RouteState::Started);
        (Arc::clone(&shared), RouteEntry::new(shared))
    }

    /// Holds the exchange and its callback until the test releases them.
    struct Park(Arc<Mutex<Option<(Exchange, AsyncCallback)>>>);

    impl Processor for Park {
        fn process(&self, exchange: Exchange, callback: AsyncCallback) -> Completion {
            *self.0.lock() = Some((exchange, callback));
            Completion::Async
        }
    }

    fn run_sync(entry: &RouteEntry, exchange: Exchange) -> Exchange {
        match entry.process(exchange, AsyncCallback::noop()) {
            Completion::Sync(ex) => ex,
            Completion::Async => panic!("expected inline completion"),
        }
    }

    #[test]
    fn rejects_exchanges_unless_started() {
        let shared = RouteShared::new("r");
        let entry = RouteEntry::new(Arc::clone(&shared));
        let ex = run_sync(&entry, Exchange::new());
        assert!(ex.exception().unwrap().is::<RouteNotStarted>());
        assert_eq!(shared.stats(), RouteStats::default());
    }

    #[test]
    fn completes_owned_units_of_work_once() {
        let (shared, entry) = started(process_fn("ok", |ex| {
            ex.set_body("done");
            Ok(())
        }));
        let ex = Exchange::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        ex.unit_of_work()
            .on_complete(move |ex| {
                sink.lock().push(ex.body().and_then(Value::as_str).map(String::from));
            })
            .unwrap();

        let ex = run_sync(&entry, ex);
        assert!(ex.unit_of_work().is_completed());
        assert_eq!(*fired.lock(), [Some("done".to_string())]);
        assert_eq!(ex.unit_of_work().owner(), Some("r"));
        assert_eq!(
            shared.stats(),
            RouteStats { total: 1, completed: 1, failed: 0, in_flight: 0 }
        );
    }

    #[test]
    fn leaves_foreign_units_of_work_to_their_owner() {
        let (shared, entry) = started(process_fn("ok", |_| Ok(())));
        let ex = Exchange::new();
        assert!(ex.unit_of_work().claim("upstream"));
        let ex = run_sync(&entry, ex);
        assert!(!ex.unit_of_work().is_completed());
        assert_eq!(shared.stats().total, 0);
    }

    #[test]
    fn failures_are_counted() {
        let (shared, entry) = started(process_fn("boom", |_| anyhow::bail!("boom")));
        let ex = run_sync(&entry, Exchange::new());
        assert!(ex.is_failed());
        assert_eq!(shared.stats().failed, 1);
    }

    #[test]
    fn admission_rechecks_the_state_after_tracking() {
        let (shared, _entry) = started(process_fn("ok", |_| Ok(())));
        assert!(shared.admit("x", &UnitOfWork::new("x")));
        assert_eq!(shared.in_flight_count(), 1);

        shared.transition(RouteState::Stopping);
        assert!(!shared.admit("y", &UnitOfWork::new("y")));
        assert_eq!(shared.in_flight_count(), 1);
        assert_eq!(shared.stats().total, 1);
    }

    #[test]
    fn finishing_after_the_token_trips_completes_as_cancelled() {
        let parked = Arc::new(Mutex::new(None));
        let (shared, entry) = started(Arc::new(Park(Arc::clone(&parked))));

        let ex = Exchange::new();
        let outcome = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcome);
        ex.unit_of_work()
            .on_complete(move |ex| {
                sink.lock()
                    .push(ex.exception().is_some_and(|f| f.is::<ExchangeCancelled>()));
            })
            .unwrap();
        assert!(!entry.process(ex, AsyncCallback::noop()).is_sync());

        shared.cancel();
        let (exchange, callback) = parked.lock().take().unwrap();
        callback.done(exchange);
        assert_eq!(*outcome.lock(), [true]);
        assert_eq!(shared.stats().failed, 1);
        assert_eq!(shared.in_flight_count(), 0);
    }

    #[test]
    fn abort_completes_parked_exchanges_with_cancellation() {
        let parked = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&parked);
        let (shared, entry) = started(Arc::new(Park(slot)));

        let ex = Exchange::new();
        let outcome = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcome);
        ex.unit_of_work()
            .on_complete(move |ex| {
                sink.lock()
                    .push(ex.exception().is_some_and(|f| f.is::<ExchangeCancelled>()));
            })
            .unwrap();
        assert!(!entry.process(ex, AsyncCallback::noop()).is_sync());
        assert_eq!(shared.in_flight_count(), 1);

        assert_eq!(shared.abort_in_flight(), 1);
        assert_eq!(*outcome.lock(), [true]);

        let (exchange, callback) = parked.lock().take().unwrap();
        callback.done(exchange);
        assert_eq!(outcome.lock().len(), 1);
        assert_eq!(shared.stats().failed, 1);
        assert_eq!(shared.stats().completed, 0);
    }
}
