use crate::exchange::Exchange;
use crate::processor::{AsyncCallback, AsyncProcessor, Processor};
use crate::service::{BoxError, Service};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Completion callback for exchange '{exchange_id}' was dropped before it fired.")]
    CallbackDropped { exchange_id: String },
}

impl DispatchError {
    #[inline]
    pub fn callback_dropped(exchange_id: impl Into<String>) -> Self {
        DispatchError::CallbackDropped {
            exchange_id: exchange_id.into(),
        }
    }
}

fn completion(exchange: &Exchange) -> (String, AsyncCallback, oneshot::Receiver<Exchange>) {
    let (tx, rx) = oneshot::channel();
    let callback = AsyncCallback::new(move |exchange, _| {
        let _ = tx.send(exchange);
    });
    (exchange.id().to_string(), callback, rx)
}

/// Dispatches `exchange` and resolves once its callback fires.
pub async fn process_async<P>(processor: &P, exchange: Exchange) -> Result<Exchange, DispatchError>
where
    P: AsyncProcessor + ?Sized,
{
    let (exchange_id, callback, rx) = completion(&exchange);
    processor.process(exchange, callback);
    rx.await
        .map_err(|_| DispatchError::callback_dropped(exchange_id))
}

/// Dispatches `exchange` and parks the calling thread until its callback fires.
///
/// Steps that complete synchronously never park. Waiting for an asynchronous step must not
/// happen on a thread that is driving a tokio runtime, use [`process_async`] there.
pub fn process_blocking<P>(processor: &P, exchange: Exchange) -> Result<Exchange, DispatchError>
where
    P: AsyncProcessor + ?Sized,
{
    let (exchange_id, callback, mut rx) = completion(&exchange);
    if processor.process(exchange, callback) {
        return rx
            .try_recv()
            .map_err(|_| DispatchError::callback_dropped(exchange_id));
    }
    log::trace!(
        "Exchange '{}' continues asynchronously, blocking until it completes",
        exchange_id
    );
    rx.blocking_recv()
        .map_err(|_| DispatchError::callback_dropped(exchange_id))
}

/// Presents an [`AsyncProcessor`] as a [`Processor`] by blocking until it completes.
///
/// If the wrapped processor never completes the exchange, the caller keeps a copy with the
/// same id, unit of work and contents it passed in.
pub struct BlockingProcessor {
    inner: Arc<dyn AsyncProcessor>,
}

impl BlockingProcessor {
    pub fn new(inner: Arc<dyn AsyncProcessor>) -> Self {
        Self { inner }
    }
}

impl Processor for BlockingProcessor {
    fn process(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        let mut snapshot = exchange.copy();
        snapshot.set_id(exchange.id());
        if let Some(unit_of_work) = exchange.unit_of_work() {
            snapshot.set_unit_of_work(unit_of_work.clone());
        }
        let taken = std::mem::replace(exchange, snapshot);
        match process_blocking(self.inner.as_ref(), taken) {
            Ok(completed) => {
                *exchange = completed;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn service(&self) -> Option<&dyn Service> {
        self.inner.service()
    }
}
