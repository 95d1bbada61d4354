use crate::config::EngineConfig;
use crate::endpoint::{
    Component, ComponentRegistry, ComponentRegistryError, Endpoint, EndpointError, EndpointKey,
    EndpointRegistry,
};
use crate::exchange::{Exchange, ExchangePattern};
use crate::executor::{ExecutorServiceStrategy, TokioExecutorStrategy};
use crate::inflight::InflightRepository;
use crate::polling::ReceiveTimeout;
use crate::pool::{ConsumerCache, ProducerCache, ResourceError};
use crate::processor::{AsyncProcessor, SendProcessor};
use crate::route::{LoggingLifecycleStrategy, Route, RouteBuilder, RouteError, SharedLifecycleStrategy};
use crate::service::{Service, ServiceError, ServiceSupport};
use crate::status::ServiceStatus;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Component(#[from] ComponentRegistryError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Route '{route_id}' is already registered.")]
    DuplicateRoute { route_id: String },

    #[error("No route registered with id '{route_id}'.")]
    UnknownRoute { route_id: String },

    #[error("Engine '{engine}' is not running.")]
    NotRunning { engine: String },
}

impl EngineError {
    #[inline]
    pub fn duplicate_route(route_id: impl Into<String>) -> Self {
        EngineError::DuplicateRoute {
            route_id: route_id.into(),
        }
    }

    #[inline]
    pub fn unknown_route(route_id: impl Into<String>) -> Self {
        EngineError::UnknownRoute {
            route_id: route_id.into(),
        }
    }

    #[inline]
    pub fn not_running(engine: impl Into<String>) -> Self {
        EngineError::NotRunning {
            engine: engine.into(),
        }
    }
}

/// The owning instance of every registry and cache.
///
/// Nothing here is process wide: components, endpoints, the producer and consumer caches,
/// the in-flight repository and the thread pools all belong to one engine and are torn
/// down with it.
///
/// # Lifecycle
///
/// [`Engine::start`] starts the caches and then every added route in insertion order. A
/// route that fails to start fails the engine start, and the routes started before it are
/// left running so that [`Engine::stop`] can drain them. [`Engine::stop`] stops routes in
/// reverse order, each with the configured shutdown timeout, and reports whether every
/// route stopped cleanly.
pub struct Engine {
    name: Arc<str>,
    config: EngineConfig,
    support: ServiceSupport,
    components: Arc<ComponentRegistry>,
    endpoints: EndpointRegistry,
    producers: Arc<ProducerCache>,
    consumers: Arc<ConsumerCache>,
    inflight: Arc<InflightRepository>,
    executors: Arc<dyn ExecutorServiceStrategy>,
    lifecycle: SharedLifecycleStrategy,
    routes: RwLock<Vec<Arc<Route>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let components = Arc::new(ComponentRegistry::new());
        let executors: Arc<dyn ExecutorServiceStrategy> =
            Arc::new(TokioExecutorStrategy::new(config.thread_pool_profile.clone()));
        Self {
            name: Arc::from(config.name.as_str()),
            support: ServiceSupport::new(format!("engine:{}", config.name)),
            endpoints: EndpointRegistry::new(components.clone(), config.endpoint_cache_size),
            components,
            producers: Arc::new(ProducerCache::from_config(&config.producer_pool)),
            consumers: Arc::new(ConsumerCache::from_config(&config.consumer_pool)),
            inflight: Arc::new(InflightRepository::new()),
            executors,
            lifecycle: Arc::new(LoggingLifecycleStrategy),
            routes: RwLock::new(Vec::new()),
            config,
        }
    }

    pub fn with_executor_strategy(mut self, executors: Arc<dyn ExecutorServiceStrategy>) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_lifecycle_strategy(mut self, lifecycle: SharedLifecycleStrategy) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ServiceStatus {
        self.support.status()
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn producers(&self) -> &Arc<ProducerCache> {
        &self.producers
    }

    pub fn consumers(&self) -> &Arc<ConsumerCache> {
        &self.consumers
    }

    pub fn inflight(&self) -> &Arc<InflightRepository> {
        &self.inflight
    }

    pub fn executors(&self) -> &Arc<dyn ExecutorServiceStrategy> {
        &self.executors
    }

    pub fn register_component(
        &self,
        scheme: impl Into<String>,
        component: impl Component + 'static,
    ) -> Result<(), EngineError> {
        Ok(self.components.register(scheme, component)?)
    }

    pub fn register_component_fn<F>(&self, scheme: impl Into<String>, factory: F) -> Result<(), EngineError>
    where
        F: Fn(&EndpointKey) -> Result<Arc<dyn Endpoint>, EndpointError> + Send + Sync + 'static,
    {
        Ok(self.components.register_fn(scheme, factory)?)
    }

    pub fn resolve(&self, uri: &str) -> Result<Arc<dyn Endpoint>, EngineError> {
        Ok(self.endpoints.resolve(uri)?)
    }

    /// A new exchange originating from the endpoint at `uri`.
    pub fn create_exchange(
        &self,
        uri: &str,
        pattern: Option<ExchangePattern>,
    ) -> Result<Exchange, EngineError> {
        let endpoint = self.resolve(uri)?;
        let mut exchange = endpoint.create_exchange(pattern);
        exchange.set_context_name(self.name.clone());
        Ok(exchange)
    }

    /// Starts a route definition for the endpoint at `uri`, sharing this engine's in-flight
    /// repository, lifecycle strategy and shutdown settings.
    pub fn route(
        &self,
        id: impl Into<String>,
        uri: &str,
        processor: Arc<dyn AsyncProcessor>,
    ) -> Result<RouteBuilder, EngineError> {
        let endpoint = self.resolve(uri)?;
        Ok(Route::builder(id, endpoint, processor)
            .inflight(self.inflight.clone())
            .lifecycle(self.lifecycle.clone())
            .shutdown_timeout(self.config.shutdown_timeout())
            .abort_after_timeout(self.config.shutdown_abort_after_timeout))
    }

    /// Adds a route. It is started right away when the engine is running.
    pub fn add_route(&self, route: Route) -> Result<Arc<Route>, EngineError> {
        let route = Arc::new(route);
        {
            let mut routes = self.routes.write();
            if routes.iter().any(|existing| existing.id() == route.id()) {
                return Err(EngineError::duplicate_route(route.id()));
            }
            routes.push(route.clone());
        }
        route.lifecycle().on_route_added(route.id());
        if self.support.status().is_started() {
            route.start()?;
        }
        Ok(route)
    }

    pub fn get_route(&self, id: &str) -> Option<Arc<Route>> {
        self.routes
            .read()
            .iter()
            .find(|route| route.id() == id)
            .cloned()
    }

    fn required_route(&self, id: &str) -> Result<Arc<Route>, EngineError> {
        self.get_route(id).ok_or_else(|| EngineError::unknown_route(id))
    }

    pub fn start_route(&self, id: &str) -> Result<(), EngineError> {
        Ok(self.required_route(id)?.start()?)
    }

    pub fn suspend_route(&self, id: &str) -> Result<(), EngineError> {
        Ok(self.required_route(id)?.suspend()?)
    }

    pub fn resume_route(&self, id: &str) -> Result<(), EngineError> {
        Ok(self.required_route(id)?.resume()?)
    }

    /// Gracefully stops a route. See [`Route::stop_with_timeout`] for the meaning of the result.
    pub async fn stop_route(&self, id: &str) -> Result<bool, EngineError> {
        Ok(self.required_route(id)?.stop().await?)
    }

    /// Stops and forgets a route.
    pub async fn remove_route(&self, id: &str) -> Result<bool, EngineError> {
        let route = self.required_route(id)?;
        let clean = route.stop().await?;
        self.routes.write().retain(|existing| existing.id() != id);
        if clean {
            self.inflight.remove_route(id);
        }
        Ok(clean)
    }

    /// A processing step sending to the endpoint at `uri`.
    pub fn to(&self, uri: &str) -> Result<SendProcessor, EngineError> {
        let endpoint = self.resolve(uri)?;
        Ok(SendProcessor::new(endpoint, self.producers.clone()))
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.support.status().is_run_allowed() {
            Ok(())
        } else {
            Err(EngineError::not_running(self.name.as_ref()))
        }
    }

    /// Sends `exchange` to the endpoint at `uri` with a cached producer and returns it once
    /// the producer completed. Failures of the send itself are stored on the exchange.
    pub async fn send(&self, uri: &str, mut exchange: Exchange) -> Result<Exchange, EngineError> {
        self.ensure_running()?;
        let endpoint = self.resolve(uri)?;
        if exchange.context_name().is_none() {
            exchange.set_context_name(self.name.clone());
        }
        Ok(self.producers.send(endpoint.as_ref(), exchange).await?)
    }

    /// Receives one exchange from the endpoint at `uri` with a cached polling consumer.
    pub async fn receive(
        &self,
        uri: &str,
        timeout: impl Into<ReceiveTimeout>,
    ) -> Result<Option<Exchange>, EngineError> {
        self.ensure_running()?;
        let endpoint = self.resolve(uri)?;
        Ok(self.consumers.receive(&endpoint, timeout.into()).await?)
    }

    pub fn start(&self) -> Result<(), EngineError> {
        let routes = self.routes.read().clone();
        self.support.start_with(|| {
            self.producers.start()?;
            self.consumers.start()?;
            for route in &routes {
                route
                    .start()
                    .map_err(|e| ServiceError::start_failed(self.support.name(), e))?;
            }
            log::info!("Engine '{}' started with {} route(s)", self.name, routes.len());
            Ok(())
        })?;
        Ok(())
    }

    /// Stops every route, newest first, then the caches, endpoints and thread pools.
    /// Returns whether every route stopped cleanly.
    pub async fn stop(&self) -> Result<bool, EngineError> {
        let status = self.support.status();
        if status.is_stopped() {
            return Ok(true);
        }
        self.support.cell().set(ServiceStatus::Stopping);
        let routes = self.routes.read().clone();
        let mut clean = true;
        let mut first_error = None;
        for route in routes.iter().rev() {
            match route.stop().await {
                Ok(stopped) => clean &= stopped,
                Err(e) => {
                    log::warn!("Engine '{}' failed to stop route '{}': {}", self.name, route.id(), e);
                    clean = false;
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Err(e) = self.consumers.stop() {
            log::warn!("Engine '{}' failed to stop its consumer cache: {}", self.name, e);
        }
        if let Err(e) = self.producers.stop() {
            log::warn!("Engine '{}' failed to stop its producer cache: {}", self.name, e);
        }
        self.endpoints.stop_all();
        self.executors.shutdown_all();
        self.support.cell().set(ServiceStatus::Stopped);
        log::info!("Engine '{}' stopped, clean={}", self.name, clean);
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(clean),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExhaustedAction, PoolConfig};
    use crate::processor::{AsyncCallback, Pipeline, process_blocking, processor_fn};
    use crate::testing::{GateProcessor, MockEndpoint, RecordingLifecycle};

    fn engine_with(config: EngineConfig, mock: Arc<MockEndpoint>) -> Engine {
        let engine = Engine::new(config);
        engine
            .register_component_fn("mock", move |_key: &EndpointKey| {
                Ok(mock.clone() as Arc<dyn Endpoint>)
            })
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let mock = Arc::new(MockEndpoint::new("mock:orders"));
        let engine = engine_with(EngineConfig::default(), mock.clone());
        assert!(matches!(
            engine.send("mock:orders", Exchange::default()).await,
            Err(EngineError::NotRunning { .. })
        ));
        engine.start().unwrap();

        let mut exchange = engine
            .create_exchange("mock:orders", Some(ExchangePattern::InOut))
            .unwrap();
        exchange.input_mut().set_body("order-1");
        let replied = engine.send("mock:orders", exchange).await.unwrap();
        assert_eq!(
            replied.out().and_then(|out| out.body().as_text()),
            Some("ack:order-1")
        );
        assert_eq!(replied.context_name(), Some("switchyard"));
        assert_eq!(mock.sent(), vec!["order-1"]);

        assert!(engine.receive("mock:orders", ReceiveTimeout::NoWait).await.unwrap().is_none());
        mock.deliver(Exchange::with_body(ExchangePattern::InOnly, "incoming"));
        let received = engine.receive("mock:orders", ReceiveTimeout::NoWait).await.unwrap().unwrap();
        assert_eq!(received.in_body_text().unwrap(), "incoming");

        assert!(engine.stop().await.unwrap());
        assert_eq!(engine.status(), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_routes_follow_engine_lifecycle() {
        let mock = Arc::new(MockEndpoint::new("mock:in"));
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let engine = engine_with(EngineConfig::default(), mock.clone())
            .with_lifecycle_strategy(lifecycle.clone());

        let upper = processor_fn("upper", |exchange: &mut Exchange| {
            let text = exchange.in_body_text()?.to_uppercase();
            exchange.input_mut().set_body(text);
            Ok(())
        });
        let route = engine.route("upper", "mock:in", Arc::new(upper)).unwrap().build();
        engine.add_route(route).unwrap();
        assert!(matches!(
            engine.add_route(
                engine
                    .route("upper", "mock:in", Arc::new(GateProcessor::default()))
                    .unwrap()
                    .build()
            ),
            Err(EngineError::DuplicateRoute { .. })
        ));
        assert_eq!(engine.get_route("upper").unwrap().status(), ServiceStatus::Stopped);

        engine.start().unwrap();
        let delivered = mock
            .deliver(Exchange::with_body(ExchangePattern::InOnly, "abc"))
            .unwrap();
        assert_eq!(delivered.in_body_text().unwrap(), "ABC");

        engine.suspend_route("upper").unwrap();
        assert_eq!(engine.get_route("upper").unwrap().status(), ServiceStatus::Suspended);
        engine.resume_route("upper").unwrap();

        assert!(engine.stop().await.unwrap());
        assert_eq!(
            lifecycle.events(),
            vec![
                "added:upper",
                "service:upper:consumer",
                "started:upper",
                "suspended:upper",
                "resumed:upper",
                "stopped:upper",
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_reports_unclean_route() {
        let mock = Arc::new(MockEndpoint::new("mock:in"));
        let config = EngineConfig {
            shutdown_timeout_ms: 0,
            ..EngineConfig::default()
        };
        let engine = engine_with(config, mock);
        let gate = Arc::new(GateProcessor::default());
        let route = engine.route("gated", "mock:in", gate.clone()).unwrap().build();
        let route = engine.add_route(route).unwrap();
        engine.start().unwrap();
        for _ in 0..3 {
            route.processor().process(Exchange::default(), AsyncCallback::noop());
        }
        assert_eq!(engine.inflight().route_size("gated"), 3);

        assert!(!engine.stop().await.unwrap());
        gate.open();
        assert_eq!(engine.inflight().size(), 0);
    }

    #[tokio::test]
    async fn test_route_sending_to_pooled_producer() {
        let mock = Arc::new(MockEndpoint::new("mock:out"));
        let config = EngineConfig {
            producer_pool: PoolConfig {
                capacity: 1,
                exhausted_policy: ExhaustedAction::Fail,
                ..PoolConfig::default()
            },
            ..EngineConfig::default()
        };
        let engine = engine_with(config, mock.clone());
        engine.start().unwrap();

        let chain = Pipeline::new(
            "forward",
            vec![
                Arc::new(processor_fn("tag", |exchange: &mut Exchange| {
                    exchange.set_property("tagged", true);
                    Ok(())
                })) as Arc<dyn AsyncProcessor>,
                Arc::new(engine.to("mock:out").unwrap()),
            ],
        );
        for body in ["a", "b", "c"] {
            let exchange = Exchange::with_body(ExchangePattern::InOnly, body);
            let done = process_blocking(&chain, exchange).unwrap();
            assert!(!done.is_failed());
        }
        assert_eq!(mock.sent(), vec!["a", "b", "c"]);
        assert_eq!(mock.producers_created(), 1);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_route_and_scheme() {
        let engine = Engine::default();
        assert!(matches!(
            engine.start_route("missing"),
            Err(EngineError::UnknownRoute { .. })
        ));
        assert!(matches!(
            engine.resolve("nope:thing"),
            Err(EngineError::Endpoint(EndpointError::UnknownComponent { .. }))
        ));
    }
}
