use crate::config::PoolConfig;
use crate::endpoint::{Endpoint, EndpointError};
use crate::exchange::Exchange;
use crate::polling::{EventDrivenPollingConsumer, PollingConsumer, ReceiveTimeout};
use crate::pool::{Lease, PoolSettings, ResourceCache, ResourceError};
use crate::service::{Service, ServiceError};
use crate::status::ServiceStatus;
use std::sync::Arc;

pub type ConsumerLease = Lease<dyn PollingConsumer>;

/// Started polling consumers, keyed by endpoint.
///
/// Endpoints without a native polling consumer are bridged with an
/// [`EventDrivenPollingConsumer`] around their push consumer.
pub struct ConsumerCache {
    consumers: ResourceCache<dyn PollingConsumer>,
}

fn create_polling_consumer(
    endpoint: &Arc<dyn Endpoint>,
) -> Result<Arc<dyn PollingConsumer>, EndpointError> {
    match endpoint.create_polling_consumer()? {
        Some(consumer) => Ok(consumer),
        None => {
            log::debug!(
                "Endpoint '{}' has no polling consumer, bridging its event driven consumer",
                endpoint.key()
            );
            Ok(Arc::new(EventDrivenPollingConsumer::bridge(endpoint.clone())?))
        }
    }
}

impl ConsumerCache {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            consumers: ResourceCache::new("consumer", settings),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.settings())
    }

    pub fn empty() -> Self {
        Self {
            consumers: ResourceCache::empty("consumer"),
        }
    }

    pub fn resources(&self) -> &ResourceCache<dyn PollingConsumer> {
        &self.consumers
    }

    pub fn try_acquire_polling_consumer(
        &self,
        endpoint: &Arc<dyn Endpoint>,
    ) -> Result<Option<ConsumerLease>, ResourceError> {
        self.consumers
            .try_acquire(endpoint.key(), || create_polling_consumer(endpoint))
    }

    pub async fn acquire_polling_consumer(
        &self,
        endpoint: &Arc<dyn Endpoint>,
    ) -> Result<ConsumerLease, ResourceError> {
        self.consumers
            .acquire(endpoint.key(), || create_polling_consumer(endpoint))
            .await
    }

    pub fn release_polling_consumer(&self, lease: ConsumerLease) {
        log::trace!("Releasing polling consumer for endpoint '{}'", lease.key());
        lease.release();
    }

    /// Receives one exchange from `endpoint` with a cached polling consumer.
    pub async fn receive(
        &self,
        endpoint: &Arc<dyn Endpoint>,
        timeout: ReceiveTimeout,
    ) -> Result<Option<Exchange>, ResourceError> {
        let lease = self.acquire_polling_consumer(endpoint).await?;
        let received = lease.receive(timeout).await;
        self.release_polling_consumer(lease);
        Ok(received?)
    }
}

impl Default for ConsumerCache {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

impl Service for ConsumerCache {
    fn start(&self) -> Result<(), ServiceError> {
        self.consumers.start()
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.consumers.stop()
    }

    fn status(&self) -> ServiceStatus {
        self.consumers.status()
    }
}
