use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use switchyard::endpoint::{Consumer, Endpoint, EndpointError, EndpointKey, Producer};
use switchyard::exchange::{Exchange, ExchangePattern};
use switchyard::pool::{PoolSettings, ProducerCache};
use switchyard::processor::{AsyncCallback, AsyncProcessor, Pipeline, process_blocking, processor_fn};
use switchyard::service::{Service, ServiceError, ServiceSupport};
use switchyard::status::ServiceStatus;

// Measures the synchronous dispatch path and the producer pool checkout

struct NullProducer {
    key: EndpointKey,
    support: ServiceSupport,
}

impl AsyncProcessor for NullProducer {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        callback.done(exchange, true);
        true
    }

    fn name(&self) -> &str {
        "null-producer"
    }
}

impl Service for NullProducer {
    fn start(&self) -> Result<(), ServiceError> {
        self.support.start_with(|| Ok(()))
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.support.stop_with(|| Ok(()))
    }

    fn status(&self) -> ServiceStatus {
        self.support.status()
    }

    fn is_singleton(&self) -> bool {
        false
    }
}

impl Producer for NullProducer {
    fn endpoint_key(&self) -> &EndpointKey {
        &self.key
    }
}

struct NullEndpoint {
    key: EndpointKey,
}

impl Endpoint for NullEndpoint {
    fn key(&self) -> &EndpointKey {
        &self.key
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EndpointError> {
        Ok(Arc::new(NullProducer {
            key: self.key.clone(),
            support: ServiceSupport::new("null-producer"),
        }))
    }

    fn create_consumer(
        &self,
        _processor: Arc<dyn AsyncProcessor>,
    ) -> Result<Arc<dyn Consumer>, EndpointError> {
        Err(EndpointError::unsupported(&self.key, "consume"))
    }
}

fn create_pipeline(steps: usize) -> Pipeline {
    let mut builder = Pipeline::builder("bench");
    for i in 0..steps {
        builder = builder.step(processor_fn(format!("step-{}", i), |exchange: &mut Exchange| {
            exchange.set_property("visited", true);
            Ok(())
        }));
    }
    builder.build()
}

fn bench_pipeline_dispatch(c: &mut Criterion) {
    let pipeline = create_pipeline(8);

    c.bench_function("pipeline_dispatch_8_steps", |b| {
        b.iter(|| {
            let exchange = Exchange::with_body(ExchangePattern::InOnly, "payload");
            black_box(process_blocking(&pipeline, exchange).ok());
        });
    });
}

fn bench_producer_checkout(c: &mut Criterion) {
    let cache = ProducerCache::new(PoolSettings {
        maximum_cache_size: 16,
        capacity: 4,
        ..PoolSettings::default()
    });
    if let Err(e) = cache.start() {
        panic!("producer cache did not start: {}", e);
    }
    let endpoint = match EndpointKey::parse("null:bench") {
        Ok(key) => NullEndpoint { key },
        Err(e) => panic!("invalid endpoint key: {}", e),
    };

    c.bench_function("producer_checkout_release", |b| {
        b.iter(|| {
            if let Ok(Some(lease)) = cache.try_acquire_producer(&endpoint) {
                cache.release_producer(black_box(lease));
            }
        });
    });
}

fn bench_transient_producer(c: &mut Criterion) {
    let cache = ProducerCache::empty();
    if let Err(e) = cache.start() {
        panic!("producer cache did not start: {}", e);
    }
    let endpoint = match EndpointKey::parse("null:transient") {
        Ok(key) => NullEndpoint { key },
        Err(e) => panic!("invalid endpoint key: {}", e),
    };

    c.bench_function("transient_producer_checkout_release", |b| {
        b.iter(|| {
            if let Ok(Some(lease)) = cache.try_acquire_producer(&endpoint) {
                cache.release_producer(black_box(lease));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_pipeline_dispatch,
    bench_producer_checkout,
    bench_transient_producer
);
criterion_main!(benches);
