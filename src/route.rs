use crate::endpoint::{Consumer, Endpoint, EndpointError};
use crate::inflight::InflightRepository;
use crate::processor::AsyncProcessor;
use crate::service::{Service, ServiceError};
use crate::status::{ServiceStatus, StatusCell};
use crate::unit_of_work::UnitOfWorkProcessor;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Route '{route_id}' failed to start.")]
    Start {
        route_id: String,
        #[source]
        source: ServiceError,
    },

    #[error("Route '{route_id}' failed to stop cleanly.")]
    Stop {
        route_id: String,
        #[source]
        source: ServiceError,
    },

    #[error("Route '{route_id}' failed to suspend.")]
    Suspend {
        route_id: String,
        #[source]
        source: ServiceError,
    },

    #[error("Route '{route_id}' cannot {operation} while {status}.")]
    IllegalState {
        route_id: String,
        operation: &'static str,
        status: ServiceStatus,
    },

    #[error("Route '{route_id}' could not create its consumer.")]
    Consumer {
        route_id: String,
        #[source]
        source: EndpointError,
    },
}

impl RouteError {
    #[inline]
    pub fn start(route_id: impl Into<String>, source: ServiceError) -> Self {
        RouteError::Start {
            route_id: route_id.into(),
            source,
        }
    }

    #[inline]
    pub fn stop(route_id: impl Into<String>, source: ServiceError) -> Self {
        RouteError::Stop {
            route_id: route_id.into(),
            source,
        }
    }

    #[inline]
    pub fn suspend(route_id: impl Into<String>, source: ServiceError) -> Self {
        RouteError::Suspend {
            route_id: route_id.into(),
            source,
        }
    }

    #[inline]
    pub fn illegal_state(
        route_id: impl Into<String>,
        operation: &'static str,
        status: ServiceStatus,
    ) -> Self {
        RouteError::IllegalState {
            route_id: route_id.into(),
            operation,
            status,
        }
    }

    #[inline]
    pub fn consumer(route_id: impl Into<String>, source: EndpointError) -> Self {
        RouteError::Consumer {
            route_id: route_id.into(),
            source,
        }
    }
}

/// Observer of route lifecycle transitions. Every method defaults to doing nothing.
pub trait LifecycleStrategy: Send + Sync {
    fn on_route_added(&self, _route_id: &str) {}

    fn on_route_started(&self, _route_id: &str) {}

    fn on_route_stopped(&self, _route_id: &str) {}

    fn on_route_suspended(&self, _route_id: &str) {}

    fn on_route_resumed(&self, _route_id: &str) {}

    /// A service of the route (`"processor"` or `"consumer"`) was started.
    fn on_service_added(&self, _route_id: &str, _service: &str) {}
}

pub type SharedLifecycleStrategy = Arc<dyn LifecycleStrategy>;

pub struct LoggingLifecycleStrategy;

impl LifecycleStrategy for LoggingLifecycleStrategy {
    fn on_route_added(&self, route_id: &str) {
        log::debug!("Route '{}' added", route_id);
    }

    fn on_route_started(&self, route_id: &str) {
        log::info!("Route '{}' started", route_id);
    }

    fn on_route_stopped(&self, route_id: &str) {
        log::info!("Route '{}' stopped", route_id);
    }

    fn on_route_suspended(&self, route_id: &str) {
        log::info!("Route '{}' suspended", route_id);
    }

    fn on_route_resumed(&self, route_id: &str) {
        log::info!("Route '{}' resumed", route_id);
    }

    fn on_service_added(&self, route_id: &str, service: &str) {
        log::trace!("Route '{}' started its {}", route_id, service);
    }
}

/// Creates the consumer that feeds a route's processor.
pub type ConsumerFactory = Arc<
    dyn Fn(&Arc<dyn Endpoint>, Arc<dyn AsyncProcessor>) -> Result<Arc<dyn Consumer>, EndpointError>
        + Send
        + Sync,
>;

/// A consumer on one endpoint feeding a processing chain.
///
/// The chain is wrapped in a [`UnitOfWorkProcessor`] bound to the route id, so every exchange
/// the consumer delivers gets a unit of work and is counted as in flight for the route.
/// Starting starts the chain's services and then the consumer. Stopping is graceful: the
/// consumer stops taking work, in-flight exchanges get until the shutdown timeout to finish
/// and only then is the chain stopped.
pub struct Route {
    id: String,
    endpoint: Arc<dyn Endpoint>,
    processor: Arc<dyn AsyncProcessor>,
    consumer_factory: ConsumerFactory,
    consumer: Mutex<Option<Arc<dyn Consumer>>>,
    inflight: Arc<InflightRepository>,
    lifecycle: SharedLifecycleStrategy,
    status: StatusCell,
    shutdown_timeout: Duration,
    abort_after_timeout: bool,
}

impl Route {
    pub fn builder(
        id: impl Into<String>,
        endpoint: Arc<dyn Endpoint>,
        processor: Arc<dyn AsyncProcessor>,
    ) -> RouteBuilder {
        RouteBuilder {
            id: id.into(),
            endpoint,
            processor,
            consumer_factory: None,
            inflight: None,
            lifecycle: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            abort_after_timeout: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The route's chain, wrapped in its unit of work processor.
    pub fn processor(&self) -> &Arc<dyn AsyncProcessor> {
        &self.processor
    }

    pub fn consumer(&self) -> Option<Arc<dyn Consumer>> {
        self.consumer.lock().clone()
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.get()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.route_size(&self.id)
    }

    pub(crate) fn lifecycle(&self) -> &SharedLifecycleStrategy {
        &self.lifecycle
    }

    pub fn start(&self) -> Result<(), RouteError> {
        let claimed = self
            .status
            .transition(ServiceStatus::Stopped, ServiceStatus::Starting)
            || self
                .status
                .transition(ServiceStatus::Failed, ServiceStatus::Starting);
        if !claimed {
            return match self.status.get() {
                ServiceStatus::Started | ServiceStatus::Starting => Ok(()),
                ServiceStatus::Suspended => self.resume(),
                other => Err(RouteError::illegal_state(&self.id, "start", other)),
            };
        }
        match self.start_services() {
            Ok(()) => {
                self.status.set(ServiceStatus::Started);
                self.lifecycle.on_route_started(&self.id);
                Ok(())
            }
            Err(e) => {
                log::error!("Route '{}' failed to start: {}", self.id, e);
                self.status.set(ServiceStatus::Failed);
                Err(e)
            }
        }
    }

    fn start_services(&self) -> Result<(), RouteError> {
        let mut services = Vec::new();
        self.processor.collect_services(&mut services);
        for (index, service) in services.iter().enumerate() {
            if let Err(e) = service.start() {
                stop_all(&self.id, services[..index].iter().rev().copied());
                return Err(RouteError::start(&self.id, e));
            }
            self.lifecycle.on_service_added(&self.id, "processor");
        }

        let consumer = match (self.consumer_factory)(&self.endpoint, self.processor.clone()) {
            Ok(consumer) => consumer,
            Err(e) => {
                stop_all(&self.id, services.iter().rev().copied());
                return Err(RouteError::consumer(&self.id, e));
            }
        };
        if let Err(e) = consumer.start() {
            stop_all(&self.id, services.iter().rev().copied());
            return Err(RouteError::start(&self.id, e));
        }
        self.lifecycle.on_service_added(&self.id, "consumer");
        *self.consumer.lock() = Some(consumer);
        Ok(())
    }

    /// Pauses the consumer. Consumers that cannot suspend are stopped and restarted on resume.
    /// The chain and its pooled resources stay up.
    pub fn suspend(&self) -> Result<(), RouteError> {
        if !self
            .status
            .transition(ServiceStatus::Started, ServiceStatus::Suspending)
        {
            return match self.status.get() {
                ServiceStatus::Suspended | ServiceStatus::Suspending => Ok(()),
                other => Err(RouteError::illegal_state(&self.id, "suspend", other)),
            };
        }
        let result = match self.consumer() {
            Some(consumer) => pause(consumer.as_ref()),
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                self.status.set(ServiceStatus::Suspended);
                self.lifecycle.on_route_suspended(&self.id);
                Ok(())
            }
            Err(e) => {
                self.status.set(ServiceStatus::Started);
                Err(RouteError::suspend(&self.id, e))
            }
        }
    }

    pub fn resume(&self) -> Result<(), RouteError> {
        if !self
            .status
            .transition(ServiceStatus::Suspended, ServiceStatus::Starting)
        {
            return match self.status.get() {
                ServiceStatus::Started | ServiceStatus::Starting => Ok(()),
                other => Err(RouteError::illegal_state(&self.id, "resume", other)),
            };
        }
        let result = match self.consumer() {
            Some(consumer) => unpause(consumer.as_ref()),
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                self.status.set(ServiceStatus::Started);
                self.lifecycle.on_route_resumed(&self.id);
                Ok(())
            }
            Err(e) => {
                self.status.set(ServiceStatus::Suspended);
                Err(RouteError::start(&self.id, e))
            }
        }
    }

    /// Stops the route with the configured shutdown timeout.
    pub async fn stop(&self) -> Result<bool, RouteError> {
        self.stop_with_timeout(self.shutdown_timeout).await
    }

    /// Stops the route, giving in-flight exchanges up to `timeout` to complete.
    ///
    /// Returns `Ok(true)` for a clean stop. When exchanges are still in flight at the
    /// deadline the residue is logged and `Ok(false)` is returned: the route is then either
    /// stopped anyway or, with `abort_after_timeout`, left running.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<bool, RouteError> {
        let previous = self.status.get();
        match previous {
            ServiceStatus::Started | ServiceStatus::Suspended => {}
            ServiceStatus::Stopped | ServiceStatus::Failed | ServiceStatus::Stopping => {
                return Ok(true);
            }
            other => return Err(RouteError::illegal_state(&self.id, "stop", other)),
        }
        if !self.status.transition(previous, ServiceStatus::Stopping) {
            return Err(RouteError::illegal_state(&self.id, "stop", self.status.get()));
        }

        let consumer = self.consumer();
        if previous == ServiceStatus::Started {
            if let Some(consumer) = &consumer {
                if let Err(e) = pause(consumer.as_ref()) {
                    log::warn!("Route '{}' could not pause its consumer: {}", self.id, e);
                }
            }
        }

        let drained = self.inflight.wait_drained(Some(&self.id), timeout).await;
        if !drained {
            self.log_residual(timeout);
            if self.abort_after_timeout {
                log::warn!(
                    "Aborting graceful shutdown of route '{}', the route keeps running",
                    self.id
                );
                if previous == ServiceStatus::Started {
                    if let Some(consumer) = &consumer {
                        if let Err(e) = unpause(consumer.as_ref()) {
                            log::error!("Route '{}' could not restart its consumer: {}", self.id, e);
                        }
                    }
                }
                self.status.set(previous);
                return Ok(false);
            }
            log::warn!("Forcing shutdown of route '{}'", self.id);
        }

        let mut first_error = None;
        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.stop() {
                log::warn!("Route '{}' failed to stop its consumer: {}", self.id, e);
                first_error = Some(e);
            }
        }
        let mut services = Vec::new();
        self.processor.collect_services(&mut services);
        for service in services.iter().rev() {
            if let Err(e) = service.stop() {
                log::warn!("Route '{}' failed to stop a processor: {}", self.id, e);
                first_error.get_or_insert(e);
            }
        }
        self.status.set(ServiceStatus::Stopped);
        self.lifecycle.on_route_stopped(&self.id);
        match first_error {
            Some(e) => Err(RouteError::stop(&self.id, e)),
            None => Ok(drained),
        }
    }

    fn log_residual(&self, timeout: Duration) {
        let residual = self.inflight.browse(Some(&self.id));
        log::warn!(
            "Timeout of {:?} reached while stopping route '{}'. {} inflight exchange(s) remain.",
            timeout, self.id, residual.len()
        );
        for entry in residual {
            log::warn!(
                "Inflight exchange '{}' on route '{}' running for {:?}",
                entry.exchange_id,
                self.id,
                entry.elapsed
            );
        }
    }
}

fn pause(consumer: &dyn Consumer) -> Result<(), ServiceError> {
    match consumer.as_suspendable() {
        Some(suspendable) => suspendable.suspend(),
        None => consumer.stop(),
    }
}

fn unpause(consumer: &dyn Consumer) -> Result<(), ServiceError> {
    match consumer.as_suspendable() {
        Some(suspendable) => suspendable.resume(),
        None => consumer.start(),
    }
}

fn stop_all<'a>(route_id: &str, services: impl Iterator<Item = &'a dyn Service>) {
    for service in services {
        if let Err(e) = service.stop() {
            log::warn!("Route '{}' failed to roll back a service: {}", route_id, e);
        }
    }
}

fn endpoint_consumer() -> ConsumerFactory {
    Arc::new(|endpoint: &Arc<dyn Endpoint>, processor: Arc<dyn AsyncProcessor>| {
        endpoint.create_consumer(processor)
    })
}

pub struct RouteBuilder {
    id: String,
    endpoint: Arc<dyn Endpoint>,
    processor: Arc<dyn AsyncProcessor>,
    consumer_factory: Option<ConsumerFactory>,
    inflight: Option<Arc<InflightRepository>>,
    lifecycle: Option<SharedLifecycleStrategy>,
    shutdown_timeout: Duration,
    abort_after_timeout: bool,
}

impl RouteBuilder {
    /// Replaces the endpoint's own consumer, e.g. with a scheduled poll consumer.
    pub fn consumer_factory(mut self, factory: ConsumerFactory) -> Self {
        self.consumer_factory = Some(factory);
        self
    }

    pub fn inflight(mut self, inflight: Arc<InflightRepository>) -> Self {
        self.inflight = Some(inflight);
        self
    }

    pub fn lifecycle(mut self, lifecycle: SharedLifecycleStrategy) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Keep the route running when the shutdown timeout is hit instead of forcing the stop.
    pub fn abort_after_timeout(mut self, abort: bool) -> Self {
        self.abort_after_timeout = abort;
        self
    }

    pub fn build(self) -> Route {
        let inflight = self.inflight.unwrap_or_default();
        let processor = UnitOfWorkProcessor::new(self.processor)
            .with_route(self.id.as_str())
            .with_inflight(inflight.clone());
        let consumer_factory = match self.consumer_factory {
            Some(factory) => factory,
            None => endpoint_consumer(),
        };
        Route {
            id: self.id,
            endpoint: self.endpoint,
            processor: Arc::new(processor),
            consumer_factory,
            consumer: Mutex::new(None),
            inflight,
            lifecycle: self
                .lifecycle
                .unwrap_or_else(|| Arc::new(LoggingLifecycleStrategy)),
            status: StatusCell::default(),
            shutdown_timeout: self.shutdown_timeout,
            abort_after_timeout: self.abort_after_timeout,
        }
    }
}
