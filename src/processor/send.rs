use crate::endpoint::Endpoint;
use crate::exchange::Exchange;
use crate::pool::{ProducerCache, ProducerLease};
use crate::processor::{AsyncCallback, AsyncProcessor, ProcessorError};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Sends the exchange to an endpoint with a producer from the cache.
///
/// The producer is released once it completes the exchange. When the pool is exhausted and
/// its policy is to block, the wait happens on a runtime task and the step completes
/// asynchronously instead of blocking the dispatching thread.
pub struct SendProcessor {
    name: String,
    endpoint: Arc<dyn Endpoint>,
    producers: Arc<ProducerCache>,
    runtime: Option<Handle>,
}

impl SendProcessor {
    pub fn new(endpoint: Arc<dyn Endpoint>, producers: Arc<ProducerCache>) -> Self {
        Self {
            name: format!("to({})", endpoint.key()),
            endpoint,
            producers,
            runtime: None,
        }
    }

    /// Runtime used to wait for a producer. Defaults to the runtime of the dispatching thread.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    fn send_with(lease: ProducerLease, exchange: Exchange, callback: AsyncCallback) -> bool {
        let producer = lease.resource().clone();
        producer.process(
            exchange,
            AsyncCallback::new(move |exchange, done_sync| {
                lease.release();
                callback.done(exchange, done_sync);
            }),
        )
    }

    fn wait_for_producer(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let runtime = match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => runtime,
            None => {
                exchange.set_exception(ProcessorError::no_runtime(&self.name));
                callback.done(exchange, true);
                return true;
            }
        };
        log::trace!(
            "No free producer for '{}', waiting on a runtime task",
            self.endpoint.key()
        );
        let endpoint = self.endpoint.clone();
        let producers = self.producers.clone();
        runtime.spawn(async move {
            match producers.acquire_producer(endpoint.as_ref()).await {
                Ok(lease) => {
                    Self::send_with(
                        lease,
                        exchange,
                        AsyncCallback::new(move |exchange, _| callback.done(exchange, false)),
                    );
                }
                Err(e) => {
                    exchange.set_exception(e);
                    callback.done(exchange, false);
                }
            }
        });
        false
    }
}

impl AsyncProcessor for SendProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        match self.producers.try_acquire_producer(self.endpoint.as_ref()) {
            Ok(Some(lease)) => Self::send_with(lease, exchange, callback),
            Ok(None) => self.wait_for_producer(exchange, callback),
            Err(e) => {
                log::debug!("Cannot send to '{}': {}", self.endpoint.key(), e);
                exchange.set_exception(e);
                callback.done(exchange, true);
                true
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangePattern;
    use crate::pool::{ExhaustedPolicy, PoolSettings, ResourceError};
    use crate::processor::{process_async, process_blocking};
    use crate::service::Service;
    use crate::testing::MockEndpoint;
    use std::time::Duration;

    fn producers(policy: ExhaustedPolicy) -> Arc<ProducerCache> {
        let cache = ProducerCache::new(PoolSettings {
            maximum_cache_size: 10,
            capacity: 1,
            exhausted_policy: policy,
        });
        cache.start().unwrap();
        Arc::new(cache)
    }

    #[test]
    fn test_sends_and_releases() {
        let cache = producers(ExhaustedPolicy::Fail);
        let endpoint = Arc::new(MockEndpoint::new("mock:out"));
        let step = SendProcessor::new(endpoint.clone(), cache.clone());
        assert_eq!(step.name(), "to(mock://out)");

        for body in ["a", "b"] {
            let exchange = Exchange::with_body(ExchangePattern::InOut, body);
            let sent = process_blocking(&step, exchange).unwrap();
            assert_eq!(
                sent.out().and_then(|out| out.body().as_text()),
                Some(format!("ack:{}", body).as_str())
            );
        }
        assert_eq!(endpoint.sent(), vec!["a", "b"]);
        assert_eq!(endpoint.producers_created(), 1);
        assert_eq!(cache.resources().pool_size(endpoint.key()), 1);
    }

    #[test]
    fn test_exhausted_pool_fails_exchange() {
        let cache = producers(ExhaustedPolicy::Fail);
        let endpoint = Arc::new(MockEndpoint::new("mock:out"));
        let _held = cache.try_acquire_producer(endpoint.as_ref()).unwrap().unwrap();

        let step = SendProcessor::new(endpoint.clone(), cache.clone());
        let failed = process_blocking(&step, Exchange::default()).unwrap();
        let failure = failed.exception().unwrap();
        assert!(matches!(
            failure.downcast_ref::<ResourceError>(),
            Some(ResourceError::Exhausted { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocked_send_completes_asynchronously() {
        let cache = producers(ExhaustedPolicy::Block { timeout: None });
        let endpoint = Arc::new(MockEndpoint::new("mock:out"));
        let held = cache.try_acquire_producer(endpoint.as_ref()).unwrap().unwrap();

        let step = Arc::new(SendProcessor::new(endpoint.clone(), cache.clone()));
        let pending = {
            let step = step.clone();
            tokio::spawn(async move {
                process_async(step.as_ref(), Exchange::with_body(ExchangePattern::InOnly, "late"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(endpoint.sent().is_empty());

        cache.release_producer(held);
        let sent = pending.await.unwrap().unwrap();
        assert!(!sent.is_failed());
        assert_eq!(endpoint.sent(), vec!["late"]);
        assert_eq!(endpoint.producers_created(), 1);
    }
}
