use crate::endpoint::{Consumer, Endpoint, EndpointError, EndpointKey};
use crate::exchange::Exchange;
use crate::handler::{LoggingInterruptHandler, SharedInterruptHandler};
use crate::polling::{PollError, PollingConsumer, ReceiveTimeout};
use crate::processor::{AsyncCallback, AsyncProcessor};
use crate::service::{Service, ServiceError, ServiceSupport};
use crate::status::ServiceStatus;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Feeds exchanges delivered by a push consumer into the bridge's queue.
///
/// The queue receives a copy carrying the same id; the delivering consumer gets its own
/// exchange back as soon as the copy is queued.
struct QueueProcessor {
    key: EndpointKey,
    inbox: mpsc::Sender<Exchange>,
    capacity: usize,
    block_when_full: bool,
}

impl QueueProcessor {
    fn queued_copy(exchange: &Exchange) -> Exchange {
        let mut queued = exchange.copy();
        queued.set_id(exchange.id());
        queued
    }
}

impl AsyncProcessor for QueueProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let queued = Self::queued_copy(&exchange);
        match self.inbox.try_send(queued) {
            Ok(()) => {}
            Err(TrySendError::Full(queued)) if self.block_when_full => {
                let Ok(runtime) = Handle::try_current() else {
                    exchange.set_exception(PollError::queue_full(&self.key, self.capacity));
                    callback.done(exchange, true);
                    return true;
                };
                let inbox = self.inbox.clone();
                let key = self.key.clone();
                runtime.spawn(async move {
                    if inbox.send(queued).await.is_err() {
                        exchange.set_exception(PollError::not_started(&key));
                    }
                    callback.done(exchange, false);
                });
                return false;
            }
            Err(TrySendError::Full(_)) => {
                exchange.set_exception(PollError::queue_full(&self.key, self.capacity));
            }
            Err(TrySendError::Closed(_)) => {
                exchange.set_exception(PollError::not_started(&self.key));
            }
        }
        callback.done(exchange, true);
        true
    }

    fn name(&self) -> &str {
        "event-driven-inbox"
    }
}

/// Bridges an endpoint's push [`Consumer`] to pull-style [`PollingConsumer::receive`].
///
/// Starting creates and starts the endpoint's consumer with a processor that queues every
/// delivered exchange. Stopping wakes blocked receivers, which report the interruption to
/// the interrupt handler and return `None`. Queued exchanges survive a restart.
pub struct EventDrivenPollingConsumer {
    endpoint: Arc<dyn Endpoint>,
    key: EndpointKey,
    support: ServiceSupport,
    capacity: usize,
    block_when_full: bool,
    inbox: mpsc::Sender<Exchange>,
    outbox: tokio::sync::Mutex<mpsc::Receiver<Exchange>>,
    consumer: Mutex<Option<Arc<dyn Consumer>>>,
    stopping: Mutex<CancellationToken>,
    interrupt_handler: SharedInterruptHandler,
}

impl EventDrivenPollingConsumer {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        Self::with_capacity(endpoint, DEFAULT_QUEUE_CAPACITY)
    }

    /// A capacity of 0 is raised to 1.
    pub fn with_capacity(endpoint: Arc<dyn Endpoint>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (inbox, outbox) = mpsc::channel(capacity);
        let key = endpoint.key().clone();
        Self {
            support: ServiceSupport::new(format!("event-driven-poll:{}", key)),
            endpoint,
            key,
            capacity,
            block_when_full: false,
            inbox,
            outbox: tokio::sync::Mutex::new(outbox),
            consumer: Mutex::new(None),
            stopping: Mutex::new(CancellationToken::new()),
            interrupt_handler: Arc::new(LoggingInterruptHandler),
        }
    }

    /// Bridges the endpoint's event driven consumer. The consumer is created right away, so an
    /// endpoint that cannot consume fails here rather than on start.
    pub fn bridge(endpoint: Arc<dyn Endpoint>) -> Result<Self, EndpointError> {
        let bridge = Self::new(endpoint);
        let consumer = bridge.create_consumer()?;
        *bridge.consumer.lock() = Some(consumer);
        Ok(bridge)
    }

    /// Make delivering consumers wait for room instead of failing when the queue is full.
    pub fn block_when_full(mut self, block: bool) -> Self {
        self.block_when_full = block;
        // a consumer created by `bridge` captured the old setting
        *self.consumer.get_mut() = None;
        self
    }

    pub fn interrupt_handler(mut self, handler: SharedInterruptHandler) -> Self {
        self.interrupt_handler = handler;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Exchanges queued and not yet received.
    pub fn queue_size(&self) -> usize {
        self.capacity - self.inbox.capacity()
    }

    fn create_consumer(&self) -> Result<Arc<dyn Consumer>, EndpointError> {
        let processor = Arc::new(QueueProcessor {
            key: self.key.clone(),
            inbox: self.inbox.clone(),
            capacity: self.capacity,
            block_when_full: self.block_when_full,
        });
        self.endpoint.create_consumer(processor)
    }

    fn interrupted(&self) -> Option<Exchange> {
        self.interrupt_handler.interrupted(self.key.as_str());
        None
    }
}

impl Service for EventDrivenPollingConsumer {
    fn start(&self) -> Result<(), ServiceError> {
        self.support.start_with(|| {
            let created = self.consumer.lock().clone();
            let consumer = match created {
                Some(consumer) => consumer,
                None => self
                    .create_consumer()
                    .map_err(|e| ServiceError::start_failed(self.support.name(), e))?,
            };
            consumer.start()?;
            *self.stopping.lock() = CancellationToken::new();
            *self.consumer.lock() = Some(consumer);
            Ok(())
        })
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.support.stop_with(|| {
            self.stopping.lock().cancel();
            match self.consumer.lock().take() {
                Some(consumer) => consumer.stop(),
                None => Ok(()),
            }
        })
    }

    fn status(&self) -> ServiceStatus {
        self.support.status()
    }
}

#[async_trait]
impl PollingConsumer for EventDrivenPollingConsumer {
    fn endpoint_key(&self) -> &EndpointKey {
        &self.key
    }

    async fn receive(&self, timeout: ReceiveTimeout) -> Result<Option<Exchange>, PollError> {
        if !self.support.status().is_run_allowed() {
            return Err(PollError::not_started(&self.key));
        }
        let stopping = self.stopping.lock().clone();
        match timeout {
            ReceiveTimeout::NoWait => match self.outbox.try_lock() {
                Ok(mut outbox) => Ok(outbox.try_recv().ok()),
                Err(_) => Ok(None),
            },
            ReceiveTimeout::Block => {
                let mut outbox = tokio::select! {
                    _ = stopping.cancelled() => return Ok(self.interrupted()),
                    outbox = self.outbox.lock() => outbox,
                };
                tokio::select! {
                    _ = stopping.cancelled() => Ok(self.interrupted()),
                    exchange = outbox.recv() => Ok(exchange),
                }
            }
            ReceiveTimeout::Within(timeout) => {
                let waiting = async {
                    let mut outbox = self.outbox.lock().await;
                    outbox.recv().await
                };
                tokio::select! {
                    _ = stopping.cancelled() => Ok(self.interrupted()),
                    received = tokio::time::timeout(timeout, waiting) => Ok(received.ok().flatten()),
                }
            }
        }
    }
}
