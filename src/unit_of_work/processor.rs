use crate::exchange::Exchange;
use crate::inflight::InflightRepository;
use crate::processor::{AsyncCallback, AsyncProcessor};
use crate::service::Service;
use crate::unit_of_work::UnitOfWork;
use std::sync::Arc;
use std::time::Instant;

/// Outermost wrapper of a route's processing chain.
///
/// On entry it attaches a [`UnitOfWork`] when the exchange has none, pushes the route on the
/// unit of work's route stack and counts the exchange as in flight. On completion, in this
/// order: the route is popped and a history entry recorded, the unit of work it created is
/// done, the in-flight count is released and finally the caller's callback fires.
pub struct UnitOfWorkProcessor {
    route_id: Option<String>,
    inner: Arc<dyn AsyncProcessor>,
    inflight: Option<Arc<InflightRepository>>,
}

impl UnitOfWorkProcessor {
    pub fn new(inner: Arc<dyn AsyncProcessor>) -> Self {
        Self {
            route_id: None,
            inner,
            inflight: None,
        }
    }

    pub fn with_route(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = Some(route_id.into());
        self
    }

    pub fn with_inflight(mut self, inflight: Arc<InflightRepository>) -> Self {
        self.inflight = Some(inflight);
        self
    }

    pub fn inner(&self) -> &Arc<dyn AsyncProcessor> {
        &self.inner
    }
}

impl AsyncProcessor for UnitOfWorkProcessor {
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let created = match exchange.unit_of_work() {
            Some(_) => None,
            None => {
                let unit_of_work = Arc::new(UnitOfWork::new(&exchange));
                exchange.set_unit_of_work(unit_of_work.clone());
                Some(unit_of_work)
            }
        };
        if let Some(route_id) = &self.route_id {
            if exchange.from_route_id().is_none() {
                exchange.set_from_route_id(route_id.as_str());
            }
            if let Some(unit_of_work) = exchange.unit_of_work() {
                unit_of_work.push_route(route_id.as_str());
            }
        }
        if let Some(inflight) = &self.inflight {
            inflight.add(&exchange, self.route_id.as_deref());
        }

        let route_id = self.route_id.clone();
        let inflight = self.inflight.clone();
        let node = self.inner.name().to_string();
        let started = Instant::now();
        let completion = AsyncCallback::new(move |mut exchange, done_sync| {
            if let Some(unit_of_work) = exchange.unit_of_work() {
                unit_of_work.add_history(node, started.elapsed());
                if route_id.is_some() {
                    unit_of_work.pop_route();
                }
            }
            if let Some(unit_of_work) = created {
                unit_of_work.done(&exchange);
                exchange.take_unit_of_work();
            }
            if let Some(inflight) = inflight {
                if let Err(e) = inflight.remove(&exchange, route_id.as_deref()) {
                    log::debug!("Exchange '{}' was not in flight: {}", exchange.id(), e);
                }
            }
            callback.done(exchange, done_sync);
        });
        self.inner.process(exchange, completion)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn service(&self) -> Option<&dyn Service> {
        self.inner.service()
    }

    fn collect_services<'a>(&'a self, services: &mut Vec<&'a dyn Service>) {
        self.inner.collect_services(services);
    }
}
