//! Exchange-scoped completion hooks.
//!
//! A [`UnitOfWork`] collects callbacks while an exchange is routed and fires
//! them exactly once, in registration order, when routing finishes. Every
//! exchange owns one; copies made for splitting get a child unit of work that
//! reports unhandled failures back to its parent.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Failure, UnitOfWorkError};
use crate::exchange::{Exchange, ExchangePattern};

/// Callback pair dispatched on the final exchange state.
pub trait Synchronization: Send + Sync {
    /// Called when the exchange finished without an unhandled failure.
    fn on_complete(&self, _exchange: &Exchange) {}

    /// Called when the exchange finished carrying an unhandled failure.
    fn on_failure(&self, _exchange: &Exchange) {}
}

type CompletionFn = Box<dyn FnOnce(&Exchange) + Send>;

enum Hook {
    Closure(CompletionFn),
    Sync(Arc<dyn Synchronization>),
}

pub struct UnitOfWork {
    exchange_id: String,
    hooks: Mutex<Vec<Hook>>,
    completed: AtomicBool,
    parent: Option<Weak<UnitOfWork>>,
    child_failures: Mutex<Vec<Failure>>,
    cancellation: OnceLock<CancellationToken>,
    route_id: OnceLock<String>,
    owner: OnceLock<String>,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("exchange_id", &self.exchange_id)
            .field("completed", &self.is_completed())
            .field("hooks", &self.hooks.lock().len())
            .finish_non_exhaustive()
    }
}

impl UnitOfWork {
    #[must_use]
    pub fn new(exchange_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(exchange_id.into(), None))
    }

    /// Creates a unit of work whose unhandled failure is reported to `parent`.
    ///
    /// The child inherits the parent's route id and a child of its
    /// cancellation token, if any.
    #[must_use]
    pub fn child_of(exchange_id: impl Into<String>, parent: &Arc<UnitOfWork>) -> Arc<Self> {
        let child = Self::build(exchange_id.into(), Some(Arc::downgrade(parent)));
        if let Some(token) = parent.cancellation.get() {
            let _ = child.cancellation.set(token.child_token());
        }
        if let Some(route_id) = parent.route_id.get() {
            let _ = child.route_id.set(route_id.clone());
        }
        Arc::new(child)
    }

    fn build(exchange_id: String, parent: Option<Weak<UnitOfWork>>) -> Self {
        Self {
            exchange_id,
            hooks: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
            parent,
            child_failures: Mutex::new(Vec::new()),
            cancellation: OnceLock::new(),
            route_id: OnceLock::new(),
            owner: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Registers a closure fired with the final exchange.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::AlreadyCompleted`] once the unit of work has
    /// fired.
    pub fn on_complete<F>(&self, hook: F) -> Result<(), UnitOfWorkError>
    where
        F: FnOnce(&Exchange) + Send + 'static,
    {
        self.push(Hook::Closure(Box::new(hook)))
    }

    /// Registers a [`Synchronization`].
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::AlreadyCompleted`] once the unit of work has
    /// fired.
    pub fn add_synchronization(
        &self,
        sync: Arc<dyn Synchronization>,
    ) -> Result<(), UnitOfWorkError> {
        self.push(Hook::Sync(sync))
    }

    fn push(&self, hook: Hook) -> Result<(), UnitOfWorkError> {
        let mut hooks = self.hooks.lock();
        // Checked under the hooks lock so a racing `done` cannot miss the hook.
        if self.is_completed() {
            return Err(UnitOfWorkError::AlreadyCompleted {
                exchange_id: self.exchange_id.clone(),
            });
        }
        hooks.push(hook);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Fires all hooks against the final exchange state.
    ///
    /// Returns `false` without firing anything if the unit of work already
    /// completed. An unhandled failure on `exchange` is reported to the parent
    /// unit of work, if there is one.
    pub fn done(&self, exchange: &Exchange) -> bool {
        let hooks = {
            let mut hooks = self.hooks.lock();
            if self.completed.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *hooks)
        };

        if let (Some(failure), Some(parent)) = (
            exchange.exception(),
            self.parent.as_ref().and_then(Weak::upgrade),
        ) {
            parent.child_failures.lock().push(failure.clone());
        }

        let failed = exchange.is_failed();
        debug!(
            exchange_id = %self.exchange_id,
            hooks = hooks.len(),
            failed,
            "unit of work done"
        );

        for hook in hooks {
            let outcome = catch_unwind(AssertUnwindSafe(|| match hook {
                Hook::Closure(f) => f(exchange),
                Hook::Sync(s) if failed => s.on_failure(exchange),
                Hook::Sync(s) => s.on_complete(exchange),
            }));
            if outcome.is_err() {
                error!(exchange_id = %self.exchange_id, "completion hook panicked");
            }
        }
        true
    }

    /// Completes the unit of work without the exchange, which has been lost.
    ///
    /// Hooks see a stand-in exchange with this unit of work's id, an `InOnly`
    /// pattern and `failure` attached. Returns `false` if already completed.
    pub fn abort(self: &Arc<Self>, failure: Failure) -> bool {
        if self.is_completed() {
            return false;
        }
        let stub = Exchange::stub(
            self.exchange_id.clone(),
            ExchangePattern::InOnly,
            Arc::clone(self),
            failure,
        );
        self.done(&stub)
    }

    // -----------------------------------------------------------------------
    // Child failures
    // -----------------------------------------------------------------------

    /// Drains the unhandled failures reported by child units of work.
    pub fn take_child_failures(&self) -> Vec<Failure> {
        std::mem::take(&mut *self.child_failures.lock())
    }

    #[must_use]
    pub fn has_child_failures(&self) -> bool {
        !self.child_failures.lock().is_empty()
    }

    // -----------------------------------------------------------------------
    // Route binding
    // -----------------------------------------------------------------------

    /// Binds the cancellation token consulted between steps. Only the first
    /// binding takes effect.
    pub fn bind_cancellation(&self, token: CancellationToken) {
        let _ = self.cancellation.set(token);
    }

    #[must_use]
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.get()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .get()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Records the route the exchange entered first. Only the first binding
    /// takes effect.
    pub fn bind_route(&self, route_id: impl Into<String>) {
        let _ = self.route_id.set(route_id.into());
    }

    #[must_use]
    pub fn route_id(&self) -> Option<&str> {
        self.route_id.get().map(String::as_str)
    }

    /// Makes `route_id` responsible for completing this unit of work.
    ///
    /// Returns `true` for the first route to claim it. An exchange handed on
    /// to another route (through `direct:`, say) stays owned by the route it
    /// entered first. Ownership is not inherited by children.
    pub fn claim(&self, route_id: &str) -> bool {
        if self.owner.set(route_id.to_string()).is_err() {
            return false;
        }
        self.bind_route(route_id);
        true
    }

    /// The route that claimed this unit of work.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.owner.get().map(String::as_str)
    }
}
