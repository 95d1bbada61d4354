//! Test doubles shared by the unit tests of this crate.

use crate::endpoint::{Consumer, Endpoint, EndpointError, EndpointKey, Producer};
use crate::exchange::Exchange;
use crate::handler::{ExceptionHandler, InterruptHandler};
use crate::processor::{AsyncCallback, AsyncProcessor, process_blocking};
use crate::route::LifecycleStrategy;
use crate::service::{Service, ServiceError, ServiceSupport, Suspendable};
use crate::status::ServiceStatus;
use crate::unit_of_work::Synchronization;
use parking_lot::Mutex;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub struct RecordingSynchronization {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    completed: AtomicUsize,
    failed: AtomicUsize,
    handover: bool,
}

impl RecordingSynchronization {
    pub fn new(name: &str) -> Self {
        Self::with_log(name, Arc::new(Mutex::new(Vec::new())))
    }

    pub fn with_log(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            log,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            handover: true,
        }
    }

    /// Refuses to move during a handover.
    pub fn pinned(mut self) -> Self {
        self.handover = false;
        self
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

impl Synchronization for RecordingSynchronization {
    fn on_complete(&self, _exchange: &Exchange) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("{}:complete", self.name));
    }

    fn on_failure(&self, _exchange: &Exchange) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("{}:failure", self.name));
    }

    fn allow_handover(&self) -> bool {
        self.handover
    }
}

pub struct MockService {
    support: ServiceSupport,
    singleton: bool,
    shutdowns: AtomicUsize,
}

impl MockService {
    pub fn new(name: &str) -> Self {
        Self {
            support: ServiceSupport::new(name),
            singleton: false,
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub fn singleton(name: &str) -> Self {
        Self {
            singleton: true,
            ..Self::new(name)
        }
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl Service for MockService {
    fn start(&self) -> Result<(), ServiceError> {
        self.support.start_with(|| Ok(()))
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.support.stop_with(|| Ok(()))
    }

    fn status(&self) -> ServiceStatus {
        self.support.status()
    }

    fn shutdown(&self) -> Result<(), ServiceError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.stop()
    }

    fn is_singleton(&self) -> bool {
        self.singleton
    }
}

#[derive(Default)]
struct MockState {
    producers_created: AtomicUsize,
    consumers_created: AtomicUsize,
    consumers_stopped: AtomicUsize,
    sending: AtomicUsize,
    max_sending: AtomicUsize,
    sent: Mutex<Vec<String>>,
    consumers: Mutex<Vec<Arc<MockConsumer>>>,
}

/// In-memory endpoint. Producers record the text body of what they send and reply with
/// `ack:<body>`, consumers hand delivered exchanges to their processor.
pub struct MockEndpoint {
    key: EndpointKey,
    state: Arc<MockState>,
    send_delay: Option<Duration>,
    fail_producers: bool,
    fail_consumers: bool,
}

impl MockEndpoint {
    pub fn new(uri: &str) -> Self {
        Self::from_key(EndpointKey::parse(uri).expect("valid mock uri"))
    }

    pub fn from_key(key: EndpointKey) -> Self {
        Self {
            key,
            state: Arc::new(MockState::default()),
            send_delay: None,
            fail_producers: false,
            fail_consumers: false,
        }
    }

    /// Producers complete asynchronously after `delay`.
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    pub fn failing_producers(mut self) -> Self {
        self.fail_producers = true;
        self
    }

    pub fn failing_consumers(mut self) -> Self {
        self.fail_consumers = true;
        self
    }

    pub fn producers_created(&self) -> usize {
        self.state.producers_created.load(Ordering::SeqCst)
    }

    pub fn consumers_created(&self) -> usize {
        self.state.consumers_created.load(Ordering::SeqCst)
    }

    pub fn consumers_stopped(&self) -> usize {
        self.state.consumers_stopped.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_sends(&self) -> usize {
        self.state.max_sending.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.sent.lock().clone()
    }

    /// Pushes `exchange` through the most recently started consumer.
    pub fn deliver(&self, exchange: Exchange) -> Option<Exchange> {
        let consumer = self
            .state
            .consumers
            .lock()
            .iter()
            .rev()
            .find(|consumer| consumer.status().is_started())
            .cloned()?;
        process_blocking(consumer.processor.as_ref(), exchange).ok()
    }
}

impl Endpoint for MockEndpoint {
    fn key(&self) -> &EndpointKey {
        &self.key
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EndpointError> {
        if self.fail_producers {
            return Err(EndpointError::creation(
                &self.key,
                "producer",
                std::io::Error::other("producer refused"),
            ));
        }
        self.state.producers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockProducer {
            key: self.key.clone(),
            support: ServiceSupport::new(format!("producer:{}", self.key)),
            state: self.state.clone(),
            send_delay: self.send_delay,
        }))
    }

    fn create_consumer(
        &self,
        processor: Arc<dyn AsyncProcessor>,
    ) -> Result<Arc<dyn Consumer>, EndpointError> {
        if self.fail_consumers {
            return Err(EndpointError::creation(
                &self.key,
                "consumer",
                std::io::Error::other("consumer refused"),
            ));
        }
        self.state.consumers_created.fetch_add(1, Ordering::SeqCst);
        let consumer = Arc::new(MockConsumer {
            key: self.key.clone(),
            support: ServiceSupport::new(format!("consumer:{}", self.key)),
            processor,
            state: self.state.clone(),
        });
        self.state.consumers.lock().push(consumer.clone());
        Ok(consumer)
    }
}

pub struct MockProducer {
    key: EndpointKey,
    support: ServiceSupport,
    state: Arc<MockState>,
    send_delay: Option<Duration>,
}

impl MockProducer {
    fn record(state: &MockState, exchange: &mut Exchange) {
        let body = exchange.input().body().as_text().unwrap_or_default().to_string();
        if exchange.pattern().is_out_capable() {
            exchange.out_mut().set_body(format!("ack:{}", body));
        }
        state.sent.lock().push(body);
    }
}

impl AsyncProcessor for MockProducer {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let Some(delay) = self.send_delay else {
            Self::record(&self.state, &mut exchange);
            callback.done(exchange, true);
            return true;
        };
        let state = self.state.clone();
        let sending = state.sending.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_sending.fetch_max(sending, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::record(&state, &mut exchange);
            state.sending.fetch_sub(1, Ordering::SeqCst);
            callback.done(exchange, false);
        });
        false
    }

    fn name(&self) -> &str {
        "mock-producer"
    }
}

impl Service for MockProducer {
    fn start(&self) -> Result<(), ServiceError> {
        self.support.start_with(|| Ok(()))
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.support.stop_with(|| Ok(()))
    }

    fn status(&self) -> ServiceStatus {
        self.support.status()
    }
}

impl Producer for MockProducer {
    fn endpoint_key(&self) -> &EndpointKey {
        &self.key
    }
}

pub struct MockConsumer {
    key: EndpointKey,
    support: ServiceSupport,
    processor: Arc<dyn AsyncProcessor>,
    state: Arc<MockState>,
}

impl Service for MockConsumer {
    fn start(&self) -> Result<(), ServiceError> {
        self.support.start_with(|| Ok(()))
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.support.stop_with(|| {
            self.state.consumers_stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn status(&self) -> ServiceStatus {
        self.support.status()
    }
}

impl Suspendable for MockConsumer {
    fn suspend(&self) -> Result<(), ServiceError> {
        self.support.suspend_with(|| Ok(()))
    }

    fn resume(&self) -> Result<(), ServiceError> {
        self.support.resume_with(|| Ok(()))
    }
}

impl Consumer for MockConsumer {
    fn endpoint_key(&self) -> &EndpointKey {
        &self.key
    }

    fn as_suspendable(&self) -> Option<&dyn Suspendable> {
        Some(self)
    }
}

#[derive(Default)]
pub struct RecordingExceptionHandler {
    messages: Mutex<Vec<String>>,
}

impl RecordingExceptionHandler {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl ExceptionHandler for RecordingExceptionHandler {
    fn handle(&self, message: &str, _exchange: Option<&Exchange>, _error: &(dyn Error + Send + Sync)) {
        self.messages.lock().push(message.to_string());
    }
}

#[derive(Default)]
pub struct RecordingInterruptHandler {
    endpoints: Mutex<Vec<String>>,
}

impl RecordingInterruptHandler {
    pub fn interrupted_endpoints(&self) -> Vec<String> {
        self.endpoints.lock().clone()
    }
}

impl InterruptHandler for RecordingInterruptHandler {
    fn interrupted(&self, endpoint: &str) {
        self.endpoints.lock().push(endpoint.to_string());
    }
}

/// Parks every exchange until [`GateProcessor::open`] is called, simulating work that is
/// still in flight.
#[derive(Default)]
pub struct GateProcessor {
    parked: Mutex<Vec<(Exchange, AsyncCallback)>>,
}

impl GateProcessor {
    pub fn parked(&self) -> usize {
        self.parked.lock().len()
    }

    /// Completes every parked exchange.
    pub fn open(&self) {
        let parked = std::mem::take(&mut *self.parked.lock());
        for (exchange, callback) in parked {
            callback.done(exchange, false);
        }
    }
}

impl AsyncProcessor for GateProcessor {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        self.parked.lock().push((exchange, callback));
        false
    }

    fn name(&self) -> &str {
        "gate"
    }
}

/// Records route lifecycle notifications as `event:route_id`.
#[derive(Default)]
pub struct RecordingLifecycle {
    events: Mutex<Vec<String>>,
}

impl RecordingLifecycle {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl LifecycleStrategy for RecordingLifecycle {
    fn on_route_added(&self, route_id: &str) {
        self.events.lock().push(format!("added:{}", route_id));
    }

    fn on_route_started(&self, route_id: &str) {
        self.events.lock().push(format!("started:{}", route_id));
    }

    fn on_route_stopped(&self, route_id: &str) {
        self.events.lock().push(format!("stopped:{}", route_id));
    }

    fn on_route_suspended(&self, route_id: &str) {
        self.events.lock().push(format!("suspended:{}", route_id));
    }

    fn on_route_resumed(&self, route_id: &str) {
        self.events.lock().push(format!("resumed:{}", route_id));
    }

    fn on_service_added(&self, route_id: &str, service: &str) {
        self.events.lock().push(format!("service:{}:{}", route_id, service));
    }
}
