pub mod bridge;
pub mod pipeline;
pub mod send;

use crate::exchange::Exchange;
use crate::service::{BoxError, Service};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;

pub use bridge::{BlockingProcessor, DispatchError, process_async, process_blocking};
pub use pipeline::Pipeline;
pub use send::SendProcessor;

pub type SharedAsyncProcessor = Arc<dyn AsyncProcessor>;

/// Failures raised by the processor adapters themselves.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Processor '{processor}' panicked: {message}")]
    Panicked { processor: String, message: String },

    #[error("Processor '{processor}' failed: {message}")]
    Failed { processor: String, message: String },

    #[error("Processor '{processor}' needs a tokio runtime but none is running.")]
    NoRuntime { processor: String },
}

impl ProcessorError {
    #[inline]
    pub fn panicked(processor: impl Into<String>, message: impl Into<String>) -> Self {
        ProcessorError::Panicked {
            processor: processor.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub fn failed(processor: impl Into<String>, message: impl Into<String>) -> Self {
        ProcessorError::Failed {
            processor: processor.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub fn no_runtime(processor: impl Into<String>) -> Self {
        ProcessorError::NoRuntime {
            processor: processor.into(),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic payload")
    }
}

/// Completion continuation handed to an [`AsyncProcessor`].
///
/// The callback is consumed by [`AsyncCallback::done`], so it can fire at most once. It
/// receives the exchange back together with the `done_sync` flag the processor returned.
pub struct AsyncCallback {
    inner: Box<dyn FnOnce(Exchange, bool) + Send + 'static>,
}

impl AsyncCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Exchange, bool) + Send + 'static,
    {
        Self { inner: Box::new(f) }
    }

    /// A callback that discards the exchange.
    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    pub fn done(self, exchange: Exchange, done_sync: bool) {
        (self.inner)(exchange, done_sync)
    }
}

impl Debug for AsyncCallback {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AsyncCallback")
    }
}

/// A step that may finish its work after `process` returns.
///
/// # Contract
/// - When the step finishes before returning it must call `callback.done(exchange, true)`
///   and return `true`.
/// - Otherwise it returns `false` and later calls `callback.done(exchange, false)` exactly
///   once, from whatever thread completes the work.
/// - Failures are stored on the exchange with [`Exchange::set_exception`], never returned.
pub trait AsyncProcessor: Send + Sync {
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool;

    fn name(&self) -> &str;

    /// The managed service behind this step, if it has a lifecycle.
    fn service(&self) -> Option<&dyn Service> {
        None
    }

    /// Collects the managed services of this step and of any nested steps, outermost first.
    fn collect_services<'a>(&'a self, services: &mut Vec<&'a dyn Service>) {
        if let Some(service) = self.service() {
            services.push(service);
        }
    }
}

/// A step that always finishes on the calling thread.
pub trait Processor: Send + Sync {
    fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError>;

    fn name(&self) -> &str;

    fn service(&self) -> Option<&dyn Service> {
        None
    }
}

/// Runs `processor` on the calling thread and completes `callback` with `done_sync = true`.
///
/// Errors and panics raised by the processor are stored on the exchange as its failure.
pub fn run_processor<P>(processor: &P, mut exchange: Exchange, callback: AsyncCallback) -> bool
where
    P: Processor + ?Sized,
{
    let outcome = catch_unwind(AssertUnwindSafe(|| processor.process(&mut exchange)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => exchange.set_failure(Arc::from(e)),
        Err(payload) => {
            let message = panic_message(&*payload);
            log::error!(
                "Processor '{}' panicked while processing exchange '{}': {}",
                processor.name(),
                exchange.id(),
                message
            );
            exchange.set_exception(ProcessorError::panicked(processor.name(), message));
        }
    }
    callback.done(exchange, true);
    true
}

/// Presents a [`Processor`] through the asynchronous contract.
pub struct SyncProcessorAdapter<P> {
    processor: P,
}

impl<P> SyncProcessorAdapter<P>
where
    P: Processor,
{
    pub fn new(processor: P) -> Self {
        Self { processor }
    }

    pub fn inner(&self) -> &P {
        &self.processor
    }
}

impl<P> AsyncProcessor for SyncProcessorAdapter<P>
where
    P: Processor,
{
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        run_processor(&self.processor, exchange, callback)
    }

    fn name(&self) -> &str {
        self.processor.name()
    }

    fn service(&self) -> Option<&dyn Service> {
        self.processor.service()
    }
}

/// Closure-backed processor, usable on both sides of the dispatch contract.
pub struct FnProcessor<F> {
    name: String,
    f: F,
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync,
{
    fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        (self.f)(exchange)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> AsyncProcessor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync,
{
    fn process(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        run_processor(self, exchange, callback)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Builds an asynchronous step from a closure that finishes synchronously.
///
/// # Examples
/// ```rust
/// use switchyard::exchange::{Exchange, ExchangePattern};
/// use switchyard::processor::{AsyncCallback, AsyncProcessor, processor_fn};
///
/// let upper = processor_fn("upper", |exchange: &mut Exchange| {
///     let text = exchange.in_body_text()?.to_uppercase();
///     exchange.input_mut().set_body(text);
///     Ok(())
/// });
/// let exchange = Exchange::with_body(ExchangePattern::InOnly, "abc");
/// assert!(upper.process(exchange, AsyncCallback::new(|exchange, done_sync| {
///     assert!(done_sync);
///     assert_eq!(exchange.in_body_text().unwrap(), "ABC");
/// })));
/// ```
pub fn processor_fn<F>(name: impl Into<String>, f: F) -> FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync,
{
    FnProcessor {
        name: name.into(),
        f,
    }
}

/// A step whose work is a future.
#[async_trait]
pub trait AsyncStep: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError>;

    fn name(&self) -> &str;
}

/// Runs an [`AsyncStep`] as a task on a tokio runtime.
///
/// `process` always returns `false`; the callback fires from the runtime worker that
/// finishes the task. Errors and panics inside the future become the exchange's failure.
pub struct SpawnedStep<S> {
    step: Arc<S>,
    handle: Handle,
}

impl<S> SpawnedStep<S>
where
    S: AsyncStep + 'static,
{
    pub fn new(step: S, handle: Handle) -> Self {
        Self {
            step: Arc::new(step),
            handle,
        }
    }

    /// Binds the step to the runtime of the calling context.
    pub fn current(step: S) -> Result<Self, ProcessorError> {
        match Handle::try_current() {
            Ok(handle) => Ok(Self::new(step, handle)),
            Err(_) => Err(ProcessorError::no_runtime(step.name())),
        }
    }
}

impl<S> AsyncProcessor for SpawnedStep<S>
where
    S: AsyncStep + 'static,
{
    fn process(&self, mut exchange: Exchange, callback: AsyncCallback) -> bool {
        let step = self.step.clone();
        self.handle.spawn(async move {
            let outcome = AssertUnwindSafe(step.process(&mut exchange))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => exchange.set_failure(Arc::from(e)),
                Err(payload) => {
                    let message = panic_message(&*payload);
                    exchange.set_exception(ProcessorError::panicked(step.name(), message));
                }
            }
            callback.done(exchange, false);
        });
        false
    }

    fn name(&self) -> &str {
        self.step.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangePattern;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Upper;

    impl Processor for Upper {
        fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
            let text = exchange.in_body_text()?.to_uppercase();
            exchange.input_mut().set_body(text);
            Ok(())
        }

        fn name(&self) -> &str {
            "upper"
        }
    }

    #[test]
    fn test_sync_adapter_completes_inline() {
        let adapter = SyncProcessorAdapter::new(Upper);
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let done_sync = adapter.process(
            Exchange::with_body(ExchangePattern::InOnly, "abc"),
            AsyncCallback::new(move |exchange, done_sync| {
                *sink.lock().unwrap() = Some((exchange.in_body_text().unwrap().to_string(), done_sync));
            }),
        );
        assert!(done_sync);
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some((String::from("ABC"), true))
        );
    }

    #[test]
    fn test_sync_adapter_captures_errors_and_panics() {
        let failing = processor_fn("failing", |_: &mut Exchange| {
            Err(Box::new(io::Error::other("broken")) as BoxError)
        });
        let panicking = processor_fn("panicking", |_: &mut Exchange| -> Result<(), BoxError> {
            panic!("step exploded")
        });

        let failures = Arc::new(Mutex::new(Vec::new()));
        for step in [&failing as &dyn AsyncProcessor, &panicking as &dyn AsyncProcessor] {
            let sink = failures.clone();
            step.process(
                Exchange::default(),
                AsyncCallback::new(move |exchange, _| {
                    sink.lock()
                        .unwrap()
                        .push(exchange.exception().map(|e| e.to_string()));
                }),
            );
        }
        let failures = failures.lock().unwrap();
        assert_eq!(failures[0].as_deref(), Some("broken"));
        assert!(failures[1].as_deref().unwrap().contains("step exploded"));
    }

    struct Sleepy;

    #[async_trait]
    impl AsyncStep for Sleepy {
        async fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            exchange.set_property("slept", true);
            Ok(())
        }

        fn name(&self) -> &str {
            "sleepy"
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_step_completes_later() {
        let step = SpawnedStep::current(Sleepy).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let done_sync = step.process(
            Exchange::default(),
            AsyncCallback::new(move |exchange, done_sync| {
                let _ = tx.send((exchange, done_sync));
            }),
        );
        assert!(!done_sync);
        let (exchange, callback_sync) = rx.await.unwrap();
        assert!(!callback_sync);
        assert_eq!(exchange.property::<bool>("slept"), Some(&true));
    }

    #[test]
    fn test_spawned_step_requires_runtime() {
        assert!(matches!(
            SpawnedStep::current(Sleepy),
            Err(ProcessorError::NoRuntime { .. })
        ));
    }
}
