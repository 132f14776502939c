//! Route start and stop.

use std::sync::Arc;

use parking_lot::RwLock;
use switchyard_core::{Consumer, Processor};
use tracing::warn;

use super::assemble::Assembler;
use super::definition::RouteDefinition;
use super::entry::{RouteEntry, RouteShared, RouteState, RouteStats};
use super::handle::RouteHandle;
use crate::config::EngineConfig;
use crate::context::MediationContext;
use crate::error::{ResolveError, RouteError};
use crate::error_handler::{ErrorHandler, ErrorHandlerStats};

/// A route: its definition, its lifecycle state and, while started, the
/// assembled pipeline and the consumer feeding it.
///
/// `start` and `stop` are serialized; the entry processor reads state without
/// locking.
pub struct Route {
    definition: RouteDefinition,
    shared: Arc<RouteShared>,
    entry: Arc<dyn Processor>,
    consumer: tokio::sync::Mutex<Option<Box<dyn Consumer>>>,
    handler: RwLock<Option<ErrorHandler>>,
}

impl Route {
    #[must_use]
    pub fn new(definition: RouteDefinition) -> Self {
        let shared = RouteShared::new(definition.id.clone());
        Self {
            entry: Arc::new(RouteEntry::new(Arc::clone(&shared))),
            shared,
            definition,
            consumer: tokio::sync::Mutex::new(None),
            handler: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    #[must_use]
    pub fn definition(&self) -> &RouteDefinition {
        &self.definition
    }

    #[must_use]
    pub fn state(&self) -> RouteState {
        self.shared.state()
    }

    #[must_use]
    pub fn stats(&self) -> RouteStats {
        self.shared.stats()
    }

    /// Counters of the error handler of the current activation.
    #[must_use]
    pub fn error_handler_stats(&self) -> Option<ErrorHandlerStats> {
        self.handler.read().as_ref().map(ErrorHandler::stats)
    }

    /// A handle that sends exchanges straight to the route's entry, bypassing
    /// its consumer. Valid across restarts.
    #[must_use]
    pub fn handle(&self) -> RouteHandle {
        RouteHandle::new(self.id(), Arc::clone(&self.entry))
    }

    /// Assembles the route and starts its consumer.
    ///
    /// Starting a started route does nothing.
    ///
    /// # Errors
    ///
    /// [`RouteError::Resolve`] when a reference does not resolve or step lists
    /// include each other, [`RouteError::Consumer`] when the consumer fails to
    /// start. The route is left stopped in both cases.
    pub async fn start(&self, context: &MediationContext) -> Result<(), RouteError> {
        let mut consumer_slot = self.consumer.lock().await;
        match self.state() {
            RouteState::Started => return Ok(()),
            RouteState::Stopped => {}
            other => return Err(self.invalid("start", other)),
        }
        self.shared.transition(RouteState::Starting);

        let (handler, consumer) = match self.assemble(context) {
            Ok(parts) => parts,
            Err(e) => {
                self.shared.transition(RouteState::Stopped);
                return Err(e.into());
            }
        };
        self.shared.activate(Arc::new(handler.clone()));
        *self.handler.write() = Some(handler);
        self.shared.transition(RouteState::Started);

        if let Err(source) = consumer.start().await {
            self.shared.deactivate();
            self.shared.transition(RouteState::Stopped);
            return Err(RouteError::Consumer {
                route_id: self.id().to_string(),
                source,
            });
        }
        *consumer_slot = Some(consumer);
        Ok(())
    }

    fn assemble(
        &self,
        context: &MediationContext,
    ) -> Result<(ErrorHandler, Box<dyn Consumer>), ResolveError> {
        let route_id = self.id();
        let handler = Assembler::new(context, route_id).route(&self.definition)?;
        let from = &self.definition.from;
        let consumer = context
            .resolve_endpoint(route_id, from)?
            .create_consumer(Arc::clone(&self.entry))
            .map_err(|source| ResolveError::Endpoint {
                route_id: route_id.to_string(),
                uri: from.clone(),
                source,
            })?;
        Ok((handler, consumer))
    }

    /// Stops the consumer and drains in-flight exchanges.
    ///
    /// Exchanges still in flight after `drain_timeout` are cancelled: the
    /// route's token trips, they get `cancel_grace` to reach a step boundary,
    /// and whatever is left has its unit of work aborted with
    /// `ExchangeCancelled`. Stopping a stopped route does nothing.
    ///
    /// # Errors
    ///
    /// [`RouteError::Consumer`] if the consumer failed to stop. The route is
    /// stopped regardless.
    pub async fn stop(&self, config: &EngineConfig) -> Result<(), RouteError> {
        let mut consumer_slot = self.consumer.lock().await;
        match self.state() {
            RouteState::Stopped => return Ok(()),
            RouteState::Started => {}
            other => return Err(self.invalid("stop", other)),
        }
        self.shared.transition(RouteState::Stopping);

        let stopped = match consumer_slot.take() {
            Some(consumer) => consumer.stop().await,
            None => Ok(()),
        };
        if let Err(e) = &stopped {
            warn!(route_id = %self.id(), error = %e, "consumer failed to stop");
        }

        if !self.shared.wait_for_drain(config.drain_timeout).await {
            #[allow(clippy::cast_possible_truncation)]
            let drain_timeout_ms = config.drain_timeout.as_millis() as u64;
            warn!(
                route_id = %self.id(),
                in_flight = self.shared.in_flight_count(),
                drain_timeout_ms,
                "drain timed out, cancelling in-flight exchanges"
            );
            self.shared.cancel();
            if !self.shared.wait_for_drain(config.cancel_grace).await {
                let aborted = self.shared.abort_in_flight();
                warn!(route_id = %self.id(), aborted, "aborted exchanges still in flight");
            }
        }

        self.shared.deactivate();
        self.shared.transition(RouteState::Stopped);
        stopped.map_err(|source| RouteError::Consumer {
            route_id: self.id().to_string(),
            source,
        })
    }

    fn invalid(&self, action: &'static str, state: RouteState) -> RouteError {
        RouteError::InvalidState {
            route_id: self.id().to_string(),
            action,
            state: state.to_string(),
        }
    }
}
