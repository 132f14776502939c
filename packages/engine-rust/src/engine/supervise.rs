//! Deadline enforcement for leaf steps.

use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{AsyncCallback, Completion, Exchange, Processor};

use super::handoff::{self, Invocation, Resume};

/// Wraps a leaf step so that an asynchronous completion that never arrives
/// fails the exchange with a contract violation instead of hanging it.
///
/// Only leaf steps are supervised. Composite processors suspend for as long
/// as their children do, so a deadline on them would fire spuriously.
pub struct Supervised {
    inner: Arc<dyn Processor>,
    deadline: Option<Duration>,
}

impl Supervised {
    #[must_use]
    pub fn new(inner: Arc<dyn Processor>, deadline: Option<Duration>) -> Self {
        Self { inner, deadline }
    }
}

struct Forward(AsyncCallback);

impl Resume for Forward {
    fn resume(self: Box<Self>, exchange: Exchange) {
        self.0.done(exchange);
    }
}

impl Processor for Supervised {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> Completion {
        let inner = &self.inner;
        match handoff::invoke(exchange, inner.name(), |ex, cb| inner.process(ex, cb)) {
            Invocation::Done(exchange) => Completion::Sync(exchange),
            Invocation::Pending(pending) => {
                match pending.with_deadline(self.deadline).park(Forward(callback)) {
                    Ok(()) => Completion::Async,
                    Err((_, exchange)) => Completion::Sync(exchange),
                }
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use switchyard_core::ContractViolation;

    use super::*;

    /// Keeps the exchange and callback forever.
    struct BlackHole(Mutex<Vec<(Exchange, AsyncCallback)>>);

    impl Processor for BlackHole {
        fn process(&self, exchange: Exchange, callback: AsyncCallback) -> Completion {
            self.0.lock().push((exchange, callback));
            Completion::Async
        }

        fn name(&self) -> &str {
            "black-hole"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_completion_fails_after_deadline() {
        let hole = Arc::new(BlackHole(Mutex::new(Vec::new())));
        let supervised = Supervised::new(hole.clone(), Some(Duration::from_millis(100)));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let out = supervised.process(
            Exchange::new(),
            AsyncCallback::from_fn(move |ex| {
                let _ = tx.send(ex);
            }),
        );
        assert!(!out.is_sync());

        let ex = rx.await.unwrap();
        let failure = ex.exception().unwrap();
        assert_eq!(
            failure.downcast_ref::<ContractViolation>().unwrap().processor,
            "black-hole"
        );
        assert_eq!(supervised.name(), "black-hole");
        assert_eq!(hole.0.lock().len(), 1);
    }
}
