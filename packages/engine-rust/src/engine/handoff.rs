//! Hand-off between a step that may finish on another thread and the loop
//! that drives the exchange.
//!
//! Every processor invocation gets one [`Handoff`]. The processor's callback
//! and the driving loop meet in its slot under a lock, so whichever side comes
//! second does the work:
//!
//! - callback first (inline, before `process` returned `Async`): the slot
//!   holds the exchange and the loop picks it up on its own stack frame;
//! - loop first: the loop parks its continuation and returns, and the
//!   callback resumes it on whatever thread it runs on.
//!
//! A callback dropped without being invoked, or not invoked before a
//! deadline, resumes the continuation with a stand-in exchange carrying a
//! [`ContractViolation`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchyard_core::{
    AsyncCallback, Completion, ContractViolation, Exchange, ExchangePattern, Failure, UnitOfWork,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A parked continuation.
pub(crate) trait Resume: Send + 'static {
    fn resume(self: Box<Self>, exchange: Exchange);
}

/// Identity of an exchange, kept so it can be rebuilt if a step loses it.
struct Shell {
    id: String,
    pattern: ExchangePattern,
    unit_of_work: Arc<UnitOfWork>,
}

impl Shell {
    fn of(exchange: &Exchange) -> Self {
        Self {
            id: exchange.id().to_string(),
            pattern: exchange.pattern(),
            unit_of_work: Arc::clone(exchange.unit_of_work()),
        }
    }

    fn failed(&self, failure: Failure) -> Exchange {
        Exchange::stub(
            self.id.clone(),
            self.pattern,
            Arc::clone(&self.unit_of_work),
            failure,
        )
    }
}

enum Slot {
    Running { abandoned: bool },
    Ready(Exchange),
    Parked(Box<dyn Resume>),
    Settled,
}

struct Handoff {
    slot: Mutex<Slot>,
    shell: Shell,
    step: String,
    settled: CancellationToken,
}

impl Handoff {
    fn violation(&self, detail: impl Into<String>) -> Exchange {
        let violation = ContractViolation {
            processor: self.step.clone(),
            detail: detail.into(),
        };
        error!(
            exchange_id = %self.shell.id,
            step = %self.step,
            error = %violation,
            "processor contract violation"
        );
        self.shell.failed(Failure::new(violation))
    }

    fn deliver(&self, exchange: Exchange) {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Settled) {
            Slot::Running { .. } => *slot = Slot::Ready(exchange),
            Slot::Parked(cont) => {
                drop(slot);
                self.settled.cancel();
                cont.resume(exchange);
            }
            previous @ (Slot::Ready(_) | Slot::Settled) => {
                *slot = previous;
                drop(slot);
                error!(
                    exchange_id = %exchange.id(),
                    step = %self.step,
                    "callback invoked after the step was settled; exchange dropped"
                );
            }
        }
    }

    fn abandon(&self) {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Settled) {
            // Dropping the callback is fine if the step ends up finishing inline.
            Slot::Running { .. } => *slot = Slot::Running { abandoned: true },
            Slot::Parked(cont) => {
                drop(slot);
                self.settled.cancel();
                cont.resume(self.violation("callback dropped without being invoked"));
            }
            previous => *slot = previous,
        }
    }

    fn expire(&self, deadline: Duration) {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Settled) {
            Slot::Parked(cont) => {
                drop(slot);
                cont.resume(self.violation(format!("callback not invoked within {deadline:?}")));
            }
            previous => *slot = previous,
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

pub(crate) enum Invocation {
    Done(Exchange),
    Pending(Pending),
}

/// Hands `exchange` to a step through `call` with a fresh callback.
pub(crate) fn invoke<F>(exchange: Exchange, step: &str, call: F) -> Invocation
where
    F: FnOnce(Exchange, AsyncCallback) -> Completion,
{
    let handoff = Arc::new(Handoff {
        slot: Mutex::new(Slot::Running { abandoned: false }),
        shell: Shell::of(&exchange),
        step: step.to_string(),
        settled: CancellationToken::new(),
    });
    let callback = {
        let on_done = Arc::clone(&handoff);
        let on_drop = Arc::clone(&handoff);
        AsyncCallback::new(move |ex| on_done.deliver(ex), move || on_drop.abandon())
    };

    match call(exchange, callback) {
        Completion::Sync(exchange) => {
            let mut slot = handoff.slot.lock();
            if let Slot::Ready(extra) = std::mem::replace(&mut *slot, Slot::Settled) {
                drop(slot);
                error!(
                    exchange_id = %extra.id(),
                    step = %step,
                    "processor completed synchronously and also invoked its callback"
                );
            }
            Invocation::Done(exchange)
        }
        Completion::Async => Invocation::Pending(Pending {
            handoff,
            deadline: None,
        }),
    }
}

/// A step that reported asynchronous completion.
pub(crate) struct Pending {
    handoff: Arc<Handoff>,
    deadline: Option<Duration>,
}

impl Pending {
    /// Fails the step with a contract violation if its callback has not run
    /// within `deadline`. Needs a tokio runtime; ignored without one.
    #[must_use]
    pub(crate) fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Parks `cont` until the step finishes.
    ///
    /// Returns the continuation together with the exchange if the step
    /// already finished, so the caller can keep going on its own frame.
    pub(crate) fn park<R: Resume>(self, cont: R) -> Result<(), (R, Exchange)> {
        let mut slot = self.handoff.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Settled) {
            Slot::Ready(exchange) => Err((cont, exchange)),
            Slot::Running { abandoned: false } => {
                *slot = Slot::Parked(Box::new(cont));
                drop(slot);
                if let Some(deadline) = self.deadline {
                    self.arm(deadline);
                }
                Ok(())
            }
            Slot::Running { abandoned: true } => {
                drop(slot);
                let stub = self
                    .handoff
                    .violation("reported asynchronous completion but dropped its callback");
                Err((cont, stub))
            }
            Slot::Parked(_) | Slot::Settled => {
                drop(slot);
                Err((cont, self.handoff.violation("step resumed more than once")))
            }
        }
    }

    fn arm(&self, deadline: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(step = %self.handoff.step, "no runtime, async step deadline not enforced");
            return;
        };
        let handoff = Arc::clone(&self.handoff);
        runtime.spawn(async move {
            tokio::select! {
                () = handoff.settled.cancelled() => {}
                () = tokio::time::sleep(deadline) => handoff.expire(deadline),
            }
        });
    }
}
