use crate::config::PoolConfig;
use crate::endpoint::{Endpoint, Producer};
use crate::exchange::Exchange;
use crate::pool::{Lease, PoolSettings, ResourceCache, ResourceError};
use crate::processor::process_async;
use crate::service::{Service, ServiceError};
use crate::status::ServiceStatus;

pub type ProducerLease = Lease<dyn Producer>;

/// Started producers, keyed by endpoint.
///
/// See [`ResourceCache`] for the pooling rules. A cache built with a zero size is the
/// empty variant that creates a producer per acquire and stops it on release.
pub struct ProducerCache {
    producers: ResourceCache<dyn Producer>,
}

impl ProducerCache {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            producers: ResourceCache::new("producer", settings),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.settings())
    }

    pub fn empty() -> Self {
        Self {
            producers: ResourceCache::empty("producer"),
        }
    }

    pub fn resources(&self) -> &ResourceCache<dyn Producer> {
        &self.producers
    }

    /// Acquires a producer without waiting. `Ok(None)` means the pool is exhausted and the
    /// policy is to block.
    pub fn try_acquire_producer(
        &self,
        endpoint: &dyn Endpoint,
    ) -> Result<Option<ProducerLease>, ResourceError> {
        self.producers
            .try_acquire(endpoint.key(), || endpoint.create_producer())
    }

    pub async fn acquire_producer(&self, endpoint: &dyn Endpoint) -> Result<ProducerLease, ResourceError> {
        self.producers
            .acquire(endpoint.key(), || endpoint.create_producer())
            .await
    }

    pub fn release_producer(&self, lease: ProducerLease) {
        log::trace!("Releasing producer for endpoint '{}'", lease.key());
        lease.release();
    }

    /// Sends `exchange` with a cached producer and returns it once the producer completed.
    pub async fn send(&self, endpoint: &dyn Endpoint, exchange: Exchange) -> Result<Exchange, ResourceError> {
        let lease = self.acquire_producer(endpoint).await?;
        let completed = process_async(&*lease, exchange).await;
        self.release_producer(lease);
        Ok(completed?)
    }
}

impl Default for ProducerCache {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

impl Service for ProducerCache {
    fn start(&self) -> Result<(), ServiceError> {
        self.producers.start()
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.producers.stop()
    }

    fn status(&self) -> ServiceStatus {
        self.producers.status()
    }
}
