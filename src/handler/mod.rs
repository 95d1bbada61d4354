use crate::exchange::Exchange;
use std::error::Error;
use std::sync::Arc;

pub type SharedExceptionHandler = Arc<dyn ExceptionHandler>;
pub type SharedInterruptHandler = Arc<dyn InterruptHandler>;

/// Receives failures the engine deliberately does not propagate, such as a poll cycle that
/// failed and will not be retried.
pub trait ExceptionHandler: Send + Sync {
    fn handle(&self, message: &str, exchange: Option<&Exchange>, error: &(dyn Error + Send + Sync));
}

/// Receives interrupted blocking receives, kept apart from [`ExceptionHandler`] so a
/// voluntary shutdown is not mistaken for a failure.
pub trait InterruptHandler: Send + Sync {
    fn interrupted(&self, endpoint: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExceptionHandler;

impl ExceptionHandler for LoggingExceptionHandler {
    fn handle(&self, message: &str, exchange: Option<&Exchange>, error: &(dyn Error + Send + Sync)) {
        match exchange {
            Some(exchange) => log::error!(
                "{} Exchange: {}. Caused by: {}",
                message,
                exchange.id(),
                error
            ),
            None => log::error!("{} Caused by: {}", message, error),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterruptHandler;

impl InterruptHandler for LoggingInterruptHandler {
    fn interrupted(&self, endpoint: &str) {
        log::debug!("Blocking receive on '{}' was interrupted by shutdown", endpoint);
    }
}
