use crate::exchange::Exchange;
use crate::processor::{AsyncCallback, AsyncProcessor, Processor, SyncProcessorAdapter};
use crate::service::Service;
use parking_lot::Mutex;
use std::sync::Arc;

type Steps = Arc<[Arc<dyn AsyncProcessor>]>;

#[derive(Default)]
struct Handoff {
    exchange: Option<Exchange>,
    callback: Option<AsyncCallback>,
}

/// Runs steps in order, feeding each step the previous step's result.
///
/// Steps that complete synchronously are driven by a loop on the calling thread, so a chain
/// of synchronous steps never grows the stack. When a step goes asynchronous the pipeline
/// returns `false` immediately and the rest of the chain resumes from the thread that
/// completes that step. Between steps the out message is promoted to the in message.
/// Processing stops early when the exchange has failed or was marked to stop.
pub struct Pipeline {
    name: String,
    steps: Steps,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: Vec<Arc<dyn AsyncProcessor>>) -> Self {
        Self {
            name: name.into(),
            steps: steps.into(),
        }
    }

    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn should_continue(exchange: &Exchange) -> bool {
        if exchange.is_failed() {
            log::debug!(
                "Exchange '{}' failed, skipping the remaining steps",
                exchange.id()
            );
            return false;
        }
        !exchange.is_route_stop()
    }

    fn run(
        steps: Steps,
        mut index: usize,
        mut exchange: Exchange,
        mut callback: AsyncCallback,
        done_sync: bool,
    ) -> bool {
        loop {
            if index >= steps.len() || !Self::should_continue(&exchange) {
                callback.done(exchange, done_sync);
                return done_sync;
            }
            if index > 0 {
                exchange.promote_out();
            }

            let step = steps[index].clone();
            log::trace!(
                "Exchange '{}' entering step '{}' ({}/{})",
                exchange.id(),
                step.name(),
                index + 1,
                steps.len()
            );
            let handoff = Arc::new(Mutex::new(Handoff {
                exchange: None,
                callback: Some(callback),
            }));
            let step_callback = {
                let handoff = handoff.clone();
                let steps = steps.clone();
                AsyncCallback::new(move |exchange, step_sync| {
                    if step_sync {
                        handoff.lock().exchange = Some(exchange);
                        return;
                    }
                    let callback = handoff.lock().callback.take();
                    match callback {
                        Some(callback) => {
                            Pipeline::run(steps, index + 1, exchange, callback, false);
                        }
                        None => log::error!(
                            "Step {} completed exchange '{}' more than once",
                            index,
                            exchange.id()
                        ),
                    }
                })
            };

            if !step.process(exchange, step_callback) {
                return false;
            }

            let (next, pending) = {
                let mut guard = handoff.lock();
                (guard.exchange.take(), guard.callback.take())
            };
            match (next, pending) {
                (Some(next), Some(pending)) => {
                    exchange = next;
                    callback = pending;
                    index += 1;
                }
                _ => {
                    log::error!(
                        "Step '{}' returned synchronously without completing its callback",
                        step.name()
                    );
                    return true;
                }
            }
        }
    }
}

impl AsyncProcessor for Pipeline {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        Self::run(self.steps.clone(), 0, exchange, callback, true)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn collect_services<'a>(&'a self, services: &mut Vec<&'a dyn Service>) {
        for step in self.steps.iter() {
            step.collect_services(services);
        }
    }
}

pub struct PipelineBuilder {
    name: String,
    steps: Vec<Arc<dyn AsyncProcessor>>,
}

impl PipelineBuilder {
    pub fn step(mut self, step: impl AsyncProcessor + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn processor(self, processor: impl Processor + 'static) -> Self {
        self.step(SyncProcessorAdapter::new(processor))
    }

    pub fn build(self) -> Pipeline {
        Pipeline::new(self.name, self.steps)
    }
}
