//! Continuation-passing execution of processors.
//!
//! Multi-step processors (pipelines, the error handler, the splitter, route
//! entry) are written as a [`Task`]: a state machine that is advanced with the
//! exchange each time a step hands it back. [`run`] drives a task in a loop.
//! Steps that finish synchronously keep the loop going on the same stack
//! frame; a step that suspends parks the task, and the step's callback resumes
//! it later from whatever thread completes the work.

pub(crate) mod handoff;
pub mod pipeline;
pub mod supervise;

use std::time::Duration;

use switchyard_core::{AsyncCallback, Completion, Exchange, Processor};

use self::handoff::{Invocation, Pending, Resume};

pub use self::pipeline::Pipeline;
pub use self::supervise::Supervised;

/// What a [`Task`] needs next.
pub(crate) enum Step {
    /// The task is finished with this exchange.
    Finished(Exchange),
    /// A step suspended; advance again with the exchange it hands back.
    Await(Pending),
    /// Advance again with this exchange after `Duration`.
    Delay(Exchange, Duration),
}

/// A resumable computation over one exchange.
pub(crate) trait Task: Send + 'static {
    fn advance(&mut self, exchange: Exchange) -> Step;
}

/// Invokes `processor`, returning the exchange if it finished inline.
pub(crate) fn call(processor: &dyn Processor, exchange: Exchange) -> Invocation {
    handoff::invoke(exchange, processor.name(), |ex, cb| processor.process(ex, cb))
}

/// Runs `task` against `exchange` as the body of a processor.
pub(crate) fn run<T: Task>(task: T, exchange: Exchange, callback: AsyncCallback) -> Completion {
    match drive(task, exchange, callback) {
        Some((exchange, _callback)) => Completion::Sync(exchange),
        None => Completion::Async,
    }
}

struct Parked<T> {
    task: T,
    callback: AsyncCallback,
}

impl<T: Task> Resume for Parked<T> {
    fn resume(self: Box<Self>, exchange: Exchange) {
        let Parked { task, callback } = *self;
        if let Some((exchange, callback)) = drive(task, exchange, callback) {
            callback.done(exchange);
        }
    }
}

/// Returns the finished exchange, or `None` once the task is parked and owns
/// `callback`.
fn drive<T: Task>(
    mut task: T,
    mut exchange: Exchange,
    mut callback: AsyncCallback,
) -> Option<(Exchange, AsyncCallback)> {
    loop {
        match task.advance(exchange) {
            Step::Finished(done) => return Some((done, callback)),
            Step::Await(pending) => match pending.park(Parked { task, callback }) {
                Ok(()) => return None,
                Err((parked, ready)) => {
                    task = parked.task;
                    callback = parked.callback;
                    exchange = ready;
                }
            },
            Step::Delay(next, delay) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        Box::new(Parked { task, callback }).resume(next);
                    });
                    return None;
                }
                std::thread::sleep(delay);
                exchange = next;
            }
        }
    }
}
