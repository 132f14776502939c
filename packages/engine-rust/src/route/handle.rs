//! Awaitable access to a route for async callers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use switchyard_core::{AsyncCallback, Completion, Exchange, Processor};
use tokio::sync::oneshot;
use tower::Service;

use crate::error::RouteError;

/// Sends exchanges to a route and resolves with the final exchange.
///
/// Routing failures travel on the exchange. The error side only reports an
/// exchange that never came back.
#[derive(Clone)]
pub struct RouteHandle {
    route_id: Arc<str>,
    entry: Arc<dyn Processor>,
}

impl RouteHandle {
    pub(crate) fn new(route_id: &str, entry: Arc<dyn Processor>) -> Self {
        Self {
            route_id: route_id.into(),
            entry,
        }
    }

    #[must_use]
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    /// Routes `exchange` and waits for it to finish.
    ///
    /// # Errors
    ///
    /// [`RouteError::Lost`] if the route dropped the exchange.
    pub async fn request(&self, exchange: Exchange) -> Result<Exchange, RouteError> {
        let (tx, rx) = oneshot::channel();
        let callback = AsyncCallback::from_fn(move |ex| {
            let _ = tx.send(ex);
        });
        match self.entry.process(exchange, callback) {
            Completion::Sync(exchange) => Ok(exchange),
            Completion::Async => rx
                .await
                .map_err(|_| RouteError::Lost(self.route_id.to_string())),
        }
    }
}

impl Service<Exchange> for RouteHandle {
    type Response = Exchange;
    type Error = RouteError;
    type Future = Pin<Box<dyn Future<Output = Result<Exchange, RouteError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let handle = self.clone();
        Box::pin(async move { handle.request(exchange).await })
    }
}
