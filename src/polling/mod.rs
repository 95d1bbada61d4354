pub mod receive;
pub mod scheduled;

use crate::endpoint::EndpointKey;
use crate::exchange::Exchange;
use crate::service::{BoxError, Service};
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use thiserror::Error;

pub use receive::EventDrivenPollingConsumer;
pub use scheduled::{PollOutcome, PollStats, PollTask, ScheduledPollConsumer};

#[derive(Error, Debug)]
pub enum PollError {
    #[error("Failed polling endpoint '{endpoint}'.")]
    Failed {
        endpoint: String,
        #[source]
        source: BoxError,
    },

    #[error("Polling consumer for endpoint '{endpoint}' is not started.")]
    NotStarted { endpoint: String },

    #[error("The inbox of endpoint '{endpoint}' is full ({capacity} exchanges).")]
    QueueFull { endpoint: String, capacity: usize },
}

impl PollError {
    #[inline]
    pub fn failed(endpoint: &EndpointKey, source: impl Into<BoxError>) -> Self {
        PollError::Failed {
            endpoint: endpoint.to_string(),
            source: source.into(),
        }
    }

    #[inline]
    pub fn not_started(endpoint: &EndpointKey) -> Self {
        PollError::NotStarted {
            endpoint: endpoint.to_string(),
        }
    }

    #[inline]
    pub fn queue_full(endpoint: &EndpointKey, capacity: usize) -> Self {
        PollError::QueueFull {
            endpoint: endpoint.to_string(),
            capacity,
        }
    }
}

/// How long a [`PollingConsumer::receive`] waits for an exchange.
///
/// The signed millisecond convention maps onto the variants with [`From<i64>`]: negative
/// blocks, zero does not wait, positive waits at most that long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveTimeout {
    /// Wait until an exchange arrives or the consumer stops.
    Block,
    /// Return what is ready right now.
    NoWait,
    Within(Duration),
}

impl ReceiveTimeout {
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            m if m < 0 => ReceiveTimeout::Block,
            0 => ReceiveTimeout::NoWait,
            m => ReceiveTimeout::Within(Duration::from_millis(m.unsigned_abs())),
        }
    }
}

impl From<i64> for ReceiveTimeout {
    fn from(millis: i64) -> Self {
        Self::from_millis(millis)
    }
}

impl From<Duration> for ReceiveTimeout {
    fn from(timeout: Duration) -> Self {
        if timeout.is_zero() {
            ReceiveTimeout::NoWait
        } else {
            ReceiveTimeout::Within(timeout)
        }
    }
}

impl Display for ReceiveTimeout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiveTimeout::Block => write!(f, "block"),
            ReceiveTimeout::NoWait => write!(f, "no-wait"),
            ReceiveTimeout::Within(timeout) => write!(f, "{}ms", timeout.as_millis()),
        }
    }
}

/// Pull-style access to an endpoint.
#[async_trait]
pub trait PollingConsumer: Service {
    fn endpoint_key(&self) -> &EndpointKey;

    /// Returns the next exchange, or `None` when nothing arrived within `timeout` or the
    /// consumer stopped while waiting.
    async fn receive(&self, timeout: ReceiveTimeout) -> Result<Option<Exchange>, PollError>;
}

/// Governs the begin, commit and rollback of each scheduled poll cycle.
pub trait PollStrategy: Send + Sync {
    /// Returning `false` skips the cycle: nothing is polled, committed or rolled back.
    fn begin(&self, endpoint: &EndpointKey) -> bool;

    fn commit(&self, endpoint: &EndpointKey, polled: usize);

    /// Decides whether a failed cycle is retried. `retry_counter` is 0 on the first
    /// attempt. An `Err` ends the cycle and is reported instead of `error`.
    fn rollback(
        &self,
        endpoint: &EndpointKey,
        retry_counter: u32,
        error: &BoxError,
    ) -> Result<bool, BoxError>;
}

/// Always begins, never retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPollStrategy;

impl PollStrategy for DefaultPollStrategy {
    fn begin(&self, _endpoint: &EndpointKey) -> bool {
        true
    }

    fn commit(&self, _endpoint: &EndpointKey, _polled: usize) {}

    fn rollback(
        &self,
        endpoint: &EndpointKey,
        _retry_counter: u32,
        error: &BoxError,
    ) -> Result<bool, BoxError> {
        log::warn!(
            "Consumer failed polling endpoint: {}. Will try again at next poll. Caused by: {}",
            endpoint,
            error
        );
        Ok(false)
    }
}

/// Retries a failed cycle immediately, up to `max_retries` times.
#[derive(Debug, Clone, Copy)]
pub struct RetryPollStrategy {
    max_retries: u32,
}

impl RetryPollStrategy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

impl PollStrategy for RetryPollStrategy {
    fn begin(&self, _endpoint: &EndpointKey) -> bool {
        true
    }

    fn commit(&self, _endpoint: &EndpointKey, _polled: usize) {}

    fn rollback(
        &self,
        endpoint: &EndpointKey,
        retry_counter: u32,
        error: &BoxError,
    ) -> Result<bool, BoxError> {
        if retry_counter < self.max_retries {
            log::debug!(
                "Retrying poll of endpoint '{}' ({}/{}) after: {}",
                endpoint,
                retry_counter + 1,
                self.max_retries,
                error
            );
            return Ok(true);
        }
        log::warn!(
            "Giving up polling endpoint '{}' after {} retries. Caused by: {}",
            endpoint,
            self.max_retries,
            error
        );
        Ok(false)
    }
}
