//! The mediation context: everything routes resolve against.
//!
//! One explicit value owns the converter registry, components, endpoints,
//! named processors and step lists, data formats and routes. It is passed to
//! whatever needs it; nothing is global.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use switchyard_core::{
    AsyncCallback, Completion, Component, DataFormat, Endpoint, EndpointUri, Exchange, Processor,
    TypeConverterLoader, TypeConverterRegistry,
};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::component::{DirectComponent, LogComponent, MockComponent, SedaComponent};
use crate::config::EngineConfig;
use crate::dataformat::{JsonDataFormat, MsgpackDataFormat, TextDataFormat};
use crate::error::{ResolveError, RouteError};
use crate::route::{Route, RouteDefinition, RouteHandle, StepDefinition};

pub struct MediationContext {
    config: EngineConfig,
    registry: Arc<TypeConverterRegistry>,
    /// Scheme -> component.
    components: DashMap<String, Arc<dyn Component>>,
    /// Concrete component type -> component, for typed lookup.
    components_by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    /// Normalized URI -> endpoint.
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
    processors: DashMap<String, Arc<dyn Processor>>,
    step_lists: DashMap<String, Vec<StepDefinition>>,
    data_formats: DashMap<String, Arc<dyn DataFormat>>,
    /// Registration order drives start order; stop runs in reverse.
    routes: RwLock<Vec<Arc<Route>>>,
}

impl MediationContext {
    /// A context with the built-in converters, the `direct`, `seda`, `log`
    /// and `mock` components and the `json`, `msgpack` and `text` formats.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let context = Self {
            config,
            registry: Arc::new(TypeConverterRegistry::with_builtins()),
            components: DashMap::new(),
            components_by_type: DashMap::new(),
            endpoints: DashMap::new(),
            processors: DashMap::new(),
            step_lists: DashMap::new(),
            data_formats: DashMap::new(),
            routes: RwLock::new(Vec::new()),
        };
        context.add_component(DirectComponent::new());
        context.add_component(SedaComponent::new());
        context.add_component(LogComponent);
        context.add_component(MockComponent::new());
        context.register_data_format("json", Arc::new(JsonDataFormat));
        context.register_data_format("msgpack", Arc::new(MsgpackDataFormat));
        context.register_data_format("text", Arc::new(TextDataFormat));
        context
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TypeConverterRegistry> {
        &self.registry
    }

    /// Runs a converter loader against the context's registry.
    ///
    /// # Errors
    ///
    /// Whatever the loader reports.
    pub fn load_converters(&self, loader: &dyn TypeConverterLoader) -> anyhow::Result<()> {
        loader.load(&self.registry)
    }

    // -----------------------------------------------------------------------
    // Components and endpoints
    // -----------------------------------------------------------------------

    /// Registers a component under its scheme, replacing any previous one.
    pub fn add_component<T: Component>(&self, component: T) {
        let scheme = component.scheme().to_ascii_lowercase();
        let component = Arc::new(component);
        self.components
            .insert(scheme, Arc::clone(&component) as Arc<dyn Component>);
        self.components_by_type
            .insert(TypeId::of::<T>(), component as Arc<dyn Any + Send + Sync>);
    }

    /// The component of concrete type `T`.
    #[must_use]
    pub fn component<T: Component>(&self) -> Option<Arc<T>> {
        self.components_by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| Arc::clone(entry.value()).downcast::<T>().ok())
    }

    #[must_use]
    pub fn component_for(&self, scheme: &str) -> Option<Arc<dyn Component>> {
        self.components
            .get(&scheme.to_ascii_lowercase())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// The endpoint for `uri`, created on first use. URIs differing only in
    /// parameter order share one endpoint.
    ///
    /// # Errors
    ///
    /// Fails on a malformed URI, an unknown scheme or an endpoint the
    /// component cannot create.
    pub fn endpoint(&self, uri: &str) -> anyhow::Result<Arc<dyn Endpoint>> {
        Ok(self.resolve_endpoint("", uri)?)
    }

    pub(crate) fn resolve_endpoint(
        &self,
        route_id: &str,
        uri: &str,
    ) -> Result<Arc<dyn Endpoint>, ResolveError> {
        let parsed = EndpointUri::parse(uri).map_err(|source| ResolveError::InvalidUri {
            route_id: route_id.to_string(),
            uri: uri.to_string(),
            source,
        })?;
        let key = parsed.normalized();
        if let Some(endpoint) = self.endpoints.get(&key) {
            return Ok(Arc::clone(endpoint.value()));
        }
        let component =
            self.component_for(parsed.scheme())
                .ok_or_else(|| ResolveError::UnknownComponent {
                    route_id: route_id.to_string(),
                    scheme: parsed.scheme().to_string(),
                })?;
        let endpoint =
            component
                .create_endpoint(&parsed)
                .map_err(|source| ResolveError::Endpoint {
                    route_id: route_id.to_string(),
                    uri: uri.to_string(),
                    source,
                })?;
        Ok(Arc::clone(
            self.endpoints.entry(key).or_insert(endpoint).value(),
        ))
    }

    /// Sends `exchange` to the endpoint at `uri` and waits for the result.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint cannot be resolved or the producer dropped the
    /// exchange. Routing failures travel on the returned exchange.
    pub async fn request(&self, uri: &str, exchange: Exchange) -> anyhow::Result<Exchange> {
        let producer = self.endpoint(uri)?.create_producer()?;
        let (tx, rx) = oneshot::channel();
        let callback = AsyncCallback::from_fn(move |ex| {
            let _ = tx.send(ex);
        });
        match producer.process(exchange, callback) {
            Completion::Sync(exchange) => Ok(exchange),
            Completion::Async => rx
                .await
                .map_err(|_| anyhow::anyhow!("{uri} never handed the exchange back")),
        }
    }

    // -----------------------------------------------------------------------
    // Named resources
    // -----------------------------------------------------------------------

    pub fn register_processor(&self, name: impl Into<String>, processor: Arc<dyn Processor>) {
        self.processors.insert(name.into(), processor);
    }

    #[must_use]
    pub fn processor(&self, name: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(name).map(|p| Arc::clone(p.value()))
    }

    /// Registers a reusable step list for `Include` steps.
    pub fn register_step_list(&self, name: impl Into<String>, steps: Vec<StepDefinition>) {
        self.step_lists.insert(name.into(), steps);
    }

    pub(crate) fn step_list(&self, name: &str) -> Option<Vec<StepDefinition>> {
        self.step_lists.get(name).map(|s| s.value().clone())
    }

    pub fn register_data_format(&self, name: impl Into<String>, format: Arc<dyn DataFormat>) {
        self.data_formats.insert(name.into(), format);
    }

    #[must_use]
    pub fn data_format(&self, name: &str) -> Option<Arc<dyn DataFormat>> {
        self.data_formats.get(name).map(|f| Arc::clone(f.value()))
    }

    // -----------------------------------------------------------------------
    // Routes
    // -----------------------------------------------------------------------

    /// Adds a route in the stopped state.
    ///
    /// # Errors
    ///
    /// [`RouteError::DuplicateRoute`] if the id is taken.
    pub fn add_route(&self, definition: RouteDefinition) -> Result<Arc<Route>, RouteError> {
        let mut routes = self.routes.write();
        if routes.iter().any(|r| r.id() == definition.id) {
            return Err(RouteError::DuplicateRoute(definition.id));
        }
        let route = Arc::new(Route::new(definition));
        routes.push(Arc::clone(&route));
        Ok(route)
    }

    #[must_use]
    pub fn route(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.read().iter().find(|r| r.id() == id).cloned()
    }

    #[must_use]
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes.read().clone()
    }

    /// # Errors
    ///
    /// [`RouteError::NotFound`] for an unknown id.
    pub fn handle(&self, route_id: &str) -> Result<RouteHandle, RouteError> {
        self.route(route_id)
            .map(|r| r.handle())
            .ok_or_else(|| RouteError::NotFound(route_id.to_string()))
    }

    /// # Errors
    ///
    /// [`RouteError::NotFound`] for an unknown id, or whatever
    /// [`Route::start`] reports.
    pub async fn start_route(&self, route_id: &str) -> Result<(), RouteError> {
        let route = self
            .route(route_id)
            .ok_or_else(|| RouteError::NotFound(route_id.to_string()))?;
        route.start(self).await
    }

    /// # Errors
    ///
    /// [`RouteError::NotFound`] for an unknown id, or whatever
    /// [`Route::stop`] reports.
    pub async fn stop_route(&self, route_id: &str) -> Result<(), RouteError> {
        let route = self
            .route(route_id)
            .ok_or_else(|| RouteError::NotFound(route_id.to_string()))?;
        route.stop(&self.config).await
    }

    /// Starts all routes in registration order. If one fails, the routes
    /// started before it are stopped again and the error is returned.
    ///
    /// # Errors
    ///
    /// The first route start failure.
    pub async fn start(&self) -> Result<(), RouteError> {
        let routes = self.routes();
        for (i, route) in routes.iter().enumerate() {
            if let Err(e) = route.start(self).await {
                warn!(route_id = %route.id(), error = %e, "route failed to start");
                for started in routes[..i].iter().rev() {
                    if let Err(stop) = started.stop(&self.config).await {
                        warn!(route_id = %started.id(), error = %stop, "rollback stop failed");
                    }
                }
                return Err(e);
            }
        }
        info!(routes = routes.len(), "mediation context started");
        Ok(())
    }

    /// Stops all routes in reverse registration order. Every route is
    /// stopped even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// The first route stop failure.
    pub async fn stop(&self) -> Result<(), RouteError> {
        let mut first_error = None;
        for route in self.routes().iter().rev() {
            if let Err(e) = route.stop(&self.config).await {
                warn!(route_id = %route.id(), error = %e, "route failed to stop");
                first_error.get_or_insert(e);
            }
        }
        info!("mediation context stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for MediationContext {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
