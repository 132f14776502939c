//! Adapters for steps written as `async fn` or as tower services.
//!
//! Both run the step on the ambient tokio runtime and report
//! [`Completion::Async`]. Called outside a runtime they fail the exchange.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use switchyard_core::{
    AsyncCallback, AsyncProcessor, Completion, Exchange, Failure, Message, Processor,
};
use tokio::runtime::Handle;
use tower::{BoxError, Service, ServiceExt};

fn runtime_or_fail(exchange: &mut Exchange, step: &str) -> Option<Handle> {
    match Handle::try_current() {
        Ok(handle) => Some(handle),
        Err(_) => {
            exchange.set_exception(anyhow::anyhow!(
                "step '{step}' needs a tokio runtime to run"
            ));
            None
        }
    }
}

// ---------------------------------------------------------------------------
// AsyncStep
// ---------------------------------------------------------------------------

/// Runs an [`AsyncProcessor`] as a spawned task.
///
/// A task that panics drops its callback, which the engine reports as a
/// contract violation on the exchange.
pub struct AsyncStep {
    name: String,
    inner: Arc<dyn AsyncProcessor>,
}

impl AsyncStep {
    #[must_use]
    pub fn new(name: impl Into<String>, inner: Arc<dyn AsyncProcessor>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

impl Processor for AsyncStep {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> Completion {
        let Some(runtime) = runtime_or_fail(&mut exchange, &self.name) else {
            return Completion::Sync(exchange);
        };
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            if let Err(e) = inner.process(&mut exchange).await {
                exchange.set_exception(e);
            }
            callback.done(exchange);
        });
        Completion::Async
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> AsyncProcessor for AsyncFn<F>
where
    F: Fn(Exchange) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Exchange>> + Send,
{
    async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
        let owned = std::mem::take(exchange);
        let (id, pattern, unit_of_work) = (
            owned.id().to_string(),
            owned.pattern(),
            Arc::clone(owned.unit_of_work()),
        );
        match (self.0)(owned).await {
            Ok(done) => *exchange = done,
            // The failure travels on the stand-in.
            Err(e) => *exchange = Exchange::stub(id, pattern, unit_of_work, Failure::new(e)),
        }
        Ok(())
    }
}

/// Wraps an async closure that takes and returns the exchange.
///
/// An `Err` loses the exchange; the failure is reported on a stand-in with
/// the same unit of work.
pub fn async_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn Processor>
where
    F: Fn(Exchange) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Exchange>> + Send + 'static,
{
    Arc::new(AsyncStep::new(name, Arc::new(AsyncFn(f))))
}

// ---------------------------------------------------------------------------
// ServiceStep
// ---------------------------------------------------------------------------

/// Calls a `tower::Service` with a copy of the message; the reply replaces
/// the message, an error fails the exchange.
pub struct ServiceStep<S> {
    name: String,
    service: S,
}

impl<S> ServiceStep<S> {
    pub fn new(name: impl Into<String>, service: S) -> Self {
        Self {
            name: name.into(),
            service,
        }
    }
}

impl<S> Processor for ServiceStep<S>
where
    S: Service<Message, Response = Message> + Clone + Send + Sync + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> Completion {
        let Some(runtime) = runtime_or_fail(&mut exchange, &self.name) else {
            return Completion::Sync(exchange);
        };
        let service = self.service.clone();
        let request = exchange.message().clone();
        runtime.spawn(async move {
            match service.oneshot(request).await {
                Ok(reply) => exchange.set_message(reply),
                Err(e) => {
                    let e: BoxError = e.into();
                    exchange.set_exception(anyhow::anyhow!(e));
                }
            }
            callback.done(exchange);
        });
        Completion::Async
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use switchyard_core::Value;
    use tower::service_fn;

    use super::*;

    async fn complete(step: &dyn Processor, exchange: Exchange) -> Exchange {
        let (tx, rx) = tokio::sync::oneshot::channel();
        match step.process(
            exchange,
            AsyncCallback::from_fn(move |ex| {
                let _ = tx.send(ex);
            }),
        ) {
            Completion::Sync(ex) => ex,
            Completion::Async => rx.await.unwrap(),
        }
    }

    struct Shout;

    #[async_trait]
    impl AsyncProcessor for Shout {
        async fn process(&self, exchange: &mut Exchange) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            let upper = exchange.body().and_then(Value::as_str).map(str::to_uppercase);
            exchange.set_body(upper.unwrap_or_default());
            Ok(())
        }
    }

    #[tokio::test]
    async fn async_processor_runs_on_the_runtime() {
        let step = AsyncStep::new("shout", Arc::new(Shout));
        let ex = complete(&step, Exchange::with_body("hey")).await;
        assert_eq!(ex.body().and_then(Value::as_str), Some("HEY"));
    }

    #[test]
    fn without_runtime_the_exchange_fails() {
        let step = AsyncStep::new("shout", Arc::new(Shout));
        match step.process(Exchange::new(), AsyncCallback::noop()) {
            Completion::Sync(ex) => {
                assert!(ex.exception().unwrap().to_string().contains("tokio runtime"));
            }
            Completion::Async => panic!("expected sync failure"),
        }
    }

    #[tokio::test]
    async fn async_closure_replaces_the_exchange() {
        let step = async_fn("suffix", |mut ex: Exchange| async move {
            let body = ex.body().and_then(Value::as_str).unwrap_or("").to_string();
            ex.set_body(format!("{body}!"));
            Ok::<_, anyhow::Error>(ex)
        });
        let ex = complete(step.as_ref(), Exchange::with_body("hi")).await;
        assert_eq!(ex.body().and_then(Value::as_str), Some("hi!"));
    }

    #[tokio::test]
    async fn failed_async_closure_keeps_the_unit_of_work() {
        let step = async_fn("reject", |_ex: Exchange| async move {
            Err::<Exchange, _>(anyhow::anyhow!("rejected"))
        });
        let exchange = Exchange::with_body("x");
        let id = exchange.id().to_string();
        let unit_of_work = Arc::clone(exchange.unit_of_work());
        let ex = complete(step.as_ref(), exchange).await;
        assert_eq!(ex.id(), id);
        assert!(Arc::ptr_eq(ex.unit_of_work(), &unit_of_work));
        assert_eq!(ex.exception().unwrap().to_string(), "rejected");
    }

    #[tokio::test]
    async fn tower_service_reply_becomes_the_message() {
        let svc = service_fn(|request: Message| async move {
            let len = request.body().and_then(Value::as_str).unwrap_or("").len();
            Ok::<_, Infallible>(Message::with_body(i64::try_from(len).unwrap()))
        });
        let step = ServiceStep::new("length", svc);
        let ex = complete(&step, Exchange::with_body("four")).await;
        assert_eq!(ex.message().body_ref::<i64>(), Some(&4));
    }

    #[tokio::test]
    async fn tower_service_error_fails_the_exchange() {
        let svc = service_fn(|_: Message| async move {
            Err::<Message, BoxError>("upstream refused".into())
        });
        let step = ServiceStep::new("refuse", svc);
        let ex = complete(&step, Exchange::with_body("x")).await;
        assert_eq!(ex.exception().unwrap().to_string(), "upstream refused");
    }
}
