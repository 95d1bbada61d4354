use crate::config::ScheduledPollConfig;
use crate::endpoint::{Consumer, Endpoint, EndpointKey};
use crate::exchange::Exchange;
use crate::handler::{LoggingExceptionHandler, SharedExceptionHandler};
use crate::polling::{DefaultPollStrategy, PollStrategy};
use crate::processor::{AsyncProcessor, process_async};
use crate::service::{BoxError, Service, ServiceError, ServiceSupport, Suspendable};
use crate::status::ServiceStatus;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The fetch half of a scheduled poll consumer.
#[async_trait]
pub trait PollTask: Send + Sync {
    /// Returns the exchanges that are ready. Each one is dispatched to the consumer's
    /// processor before the cycle commits.
    async fn poll(&self, endpoint: &Arc<dyn Endpoint>) -> Result<Vec<Exchange>, BoxError>;
}

/// What a single run of the poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The consumer is not started.
    NotStarted,
    Suspended,
    /// Skipped because of backoff.
    BackedOff,
    /// The configured repeat count is used up. The scheduler stops.
    RepeatLimitReached,
    /// The poll strategy refused to begin.
    Skipped,
    Polled(usize),
    /// The cycle failed and was reported to the exception handler.
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollStats {
    pub runs: u64,
    pub idle_counter: u32,
    pub error_counter: u32,
    pub success_counter: u32,
    pub backoff_counter: u32,
    pub last_error: Option<String>,
}

struct Poller {
    endpoint: Arc<dyn Endpoint>,
    key: EndpointKey,
    processor: Arc<dyn AsyncProcessor>,
    task: Arc<dyn PollTask>,
    config: ScheduledPollConfig,
    strategy: Arc<dyn PollStrategy>,
    exception_handler: SharedExceptionHandler,
    support: ServiceSupport,
    stats: Mutex<PollStats>,
    running: tokio::sync::Mutex<()>,
}

impl Poller {
    fn is_poll_allowed(&self) -> bool {
        matches!(
            self.support.status(),
            ServiceStatus::Starting | ServiceStatus::Started
        )
    }

    /// Returns `true` while runs should be skipped. Skips `backoff_multiplier` runs once the
    /// idle or error threshold is reached, then resets the counters.
    fn backing_off(&self) -> bool {
        let multiplier = self.config.backoff_multiplier;
        if multiplier == 0 {
            return false;
        }
        let idle_threshold = match self.config.backoff_idle_threshold {
            0 => u32::MAX,
            threshold => threshold,
        };
        let error_threshold = match self.config.backoff_error_threshold {
            0 => u32::MAX,
            threshold => threshold,
        };

        let mut stats = self.stats.lock();
        if stats.idle_counter < idle_threshold && stats.error_counter < error_threshold {
            return false;
        }
        if stats.backoff_counter < multiplier {
            stats.backoff_counter += 1;
            if stats.idle_counter > 0 {
                log::debug!(
                    "Backing off '{}' after {} idle polls ({}/{})",
                    self.key,
                    stats.idle_counter,
                    stats.backoff_counter,
                    multiplier
                );
            } else {
                log::debug!(
                    "Backing off '{}' after {} failed polls ({}/{})",
                    self.key,
                    stats.error_counter,
                    stats.backoff_counter,
                    multiplier
                );
            }
            return true;
        }
        stats.idle_counter = 0;
        stats.error_counter = 0;
        stats.backoff_counter = 0;
        stats.success_counter = 0;
        log::trace!("Backoff of '{}' finished, resetting counters", self.key);
        false
    }

    async fn dispatch(&self, exchange: Exchange) -> Result<(), BoxError> {
        let completed = process_async(self.processor.as_ref(), exchange).await?;
        if let Some(failure) = completed.exception() {
            self.exception_handler.handle(
                "Error processing exchange.",
                Some(&completed),
                failure.as_ref(),
            );
        }
        Ok(())
    }

    async fn poll(&self) -> Result<usize, BoxError> {
        let exchanges = self.task.poll(&self.endpoint).await?;
        let polled = exchanges.len();
        log::trace!("Polled {} messages from '{}'", polled, self.key);
        for exchange in exchanges {
            self.dispatch(exchange).await?;
        }
        if polled == 0 && self.config.send_empty_message_when_idle {
            self.dispatch(self.endpoint.create_exchange(None)).await?;
        }
        Ok(polled)
    }

    async fn run_once(&self) -> PollOutcome {
        let _running = self.running.lock().await;
        let status = self.support.status();
        if status.is_suspended() {
            log::trace!("Cannot start to poll '{}' as it is suspended", self.key);
            return PollOutcome::Suspended;
        }
        if !self.is_poll_allowed() {
            return PollOutcome::NotStarted;
        }
        if self.backing_off() {
            return PollOutcome::BackedOff;
        }

        let runs = {
            let mut stats = self.stats.lock();
            stats.runs += 1;
            stats.runs
        };
        if self.config.repeat_count > 0 && runs > self.config.repeat_count {
            return PollOutcome::RepeatLimitReached;
        }

        let mut retry_counter: Option<u32> = None;
        let mut cause: Option<BoxError>;
        let mut polled = 0;
        let mut began = false;
        loop {
            cause = None;
            let mut done = true;
            if self.is_poll_allowed() {
                match retry_counter {
                    None => log::trace!("Starting to poll '{}'", self.key),
                    Some(attempt) => log::debug!("Retrying attempt {} to poll '{}'", attempt, self.key),
                }
                began = self.strategy.begin(&self.key);
                if began {
                    let attempt = retry_counter.map_or(0, |attempt| attempt + 1);
                    retry_counter = Some(attempt);
                    match self.poll().await {
                        Ok(count) => {
                            polled = count;
                            self.strategy.commit(&self.key, polled);
                            if polled > 0 && self.config.greedy {
                                done = false;
                                retry_counter = None;
                                let mut stats = self.stats.lock();
                                stats.error_counter = 0;
                                stats.last_error = None;
                                log::trace!("Greedy polling '{}' after {} messages", self.key, polled);
                            }
                        }
                        Err(error) => match self.strategy.rollback(&self.key, attempt, &error) {
                            Ok(true) => done = false,
                            Ok(false) => cause = Some(error),
                            Err(rollback_error) => cause = Some(rollback_error),
                        },
                    }
                } else {
                    log::debug!("Cannot begin polling '{}' as the poll strategy returned false", self.key);
                }
            }
            log::trace!("Finished polling '{}'", self.key);

            if let Some(error) = &cause {
                if self.support.status().is_run_allowed() {
                    let message = format!(
                        "Failed polling endpoint: {}. Will try again at next poll.",
                        self.key
                    );
                    self.exception_handler.handle(&message, None, error.as_ref());
                }
            }
            if done {
                break;
            }
        }

        let mut stats = self.stats.lock();
        let outcome = match cause {
            Some(error) => {
                stats.idle_counter = 0;
                stats.success_counter = 0;
                stats.error_counter += 1;
                stats.last_error = Some(error.to_string());
                PollOutcome::Failed
            }
            None => {
                stats.idle_counter = if polled == 0 { stats.idle_counter + 1 } else { 0 };
                stats.success_counter += 1;
                stats.error_counter = 0;
                stats.last_error = None;
                if began {
                    PollOutcome::Polled(polled)
                } else {
                    PollOutcome::Skipped
                }
            }
        };
        log::trace!(
            "Poll run of '{}' done with idle={}, success={}, error={}",
            self.key,
            stats.idle_counter,
            stats.success_counter,
            stats.error_counter
        );
        outcome
    }
}

async fn schedule(poller: Arc<Poller>, token: CancellationToken) {
    let initial_delay = poller.config.initial_delay();
    if !initial_delay.is_zero() {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(initial_delay) => {}
        }
    }
    let delay = poller.config.delay();
    loop {
        let started = Instant::now();
        if poller.run_once().await == PollOutcome::RepeatLimitReached {
            log::debug!(
                "Cancelling scheduler of '{}' as repeat count limit reached after {} counts",
                poller.key,
                poller.config.repeat_count
            );
            break;
        }
        let next = if poller.config.use_fixed_delay {
            Instant::now() + delay
        } else {
            started + delay
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep_until(next) => {}
        }
    }
}

/// A consumer that polls its endpoint on a schedule and feeds what it finds to a processor.
///
/// Each run asks the [`PollStrategy`] to begin, polls the [`PollTask`], dispatches every
/// exchange and commits. A failed run is rolled back, and failures that are not retried are
/// reported to the exception handler. Stopping cancels the schedule but lets a poll that
/// is already running finish.
pub struct ScheduledPollConsumer {
    poller: Arc<Poller>,
    runtime: Option<Handle>,
    scheduler: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ScheduledPollConsumer {
    pub fn builder(
        endpoint: Arc<dyn Endpoint>,
        processor: Arc<dyn AsyncProcessor>,
        task: Arc<dyn PollTask>,
    ) -> ScheduledPollConsumerBuilder {
        ScheduledPollConsumerBuilder {
            endpoint,
            processor,
            task,
            config: ScheduledPollConfig::default(),
            strategy: Arc::new(DefaultPollStrategy),
            exception_handler: Arc::new(LoggingExceptionHandler),
            runtime: None,
        }
    }

    pub fn config(&self) -> &ScheduledPollConfig {
        &self.poller.config
    }

    pub fn stats(&self) -> PollStats {
        self.poller.stats.lock().clone()
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduler
            .lock()
            .as_ref()
            .map(|(_, join)| !join.is_finished())
            .unwrap_or(false)
    }

    /// Runs one poll cycle on the caller's task. Used when the scheduler is not started.
    pub async fn run_once(&self) -> PollOutcome {
        self.poller.run_once().await
    }

    fn start_scheduler(&self) -> Result<(), ServiceError> {
        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| {
                ServiceError::configuration(
                    self.poller.support.name(),
                    "no tokio runtime is available to schedule polls",
                )
            })?,
        };
        let token = CancellationToken::new();
        let join = runtime.spawn(schedule(self.poller.clone(), token.clone()));
        *self.scheduler.lock() = Some((token, join));
        log::debug!(
            "Scheduled polling of '{}' every {:?} after {:?}",
            self.poller.key,
            self.poller.config.delay(),
            self.poller.config.initial_delay()
        );
        Ok(())
    }
}

impl Service for ScheduledPollConsumer {
    fn start(&self) -> Result<(), ServiceError> {
        self.poller.support.start_with(|| {
            self.poller
                .config
                .validate()
                .map_err(|message| ServiceError::configuration(self.poller.support.name(), message))?;
            if self.poller.config.start_scheduler {
                self.start_scheduler()?;
            }
            Ok(())
        })
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.poller.support.stop_with(|| {
            if let Some((token, _)) = self.scheduler.lock().take() {
                token.cancel();
            }
            Ok(())
        })
    }

    fn status(&self) -> ServiceStatus {
        self.poller.support.status()
    }
}

impl Suspendable for ScheduledPollConsumer {
    fn suspend(&self) -> Result<(), ServiceError> {
        self.poller.support.suspend_with(|| Ok(()))
    }

    fn resume(&self) -> Result<(), ServiceError> {
        self.poller.support.resume_with(|| Ok(()))
    }
}

impl Consumer for ScheduledPollConsumer {
    fn endpoint_key(&self) -> &EndpointKey {
        &self.poller.key
    }

    fn as_suspendable(&self) -> Option<&dyn Suspendable> {
        Some(self)
    }
}

pub struct ScheduledPollConsumerBuilder {
    endpoint: Arc<dyn Endpoint>,
    processor: Arc<dyn AsyncProcessor>,
    task: Arc<dyn PollTask>,
    config: ScheduledPollConfig,
    strategy: Arc<dyn PollStrategy>,
    exception_handler: SharedExceptionHandler,
    runtime: Option<Handle>,
}

impl ScheduledPollConsumerBuilder {
    pub fn config(mut self, config: ScheduledPollConfig) -> Self {
        self.config = config;
        self
    }

    pub fn poll_strategy(mut self, strategy: Arc<dyn PollStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn exception_handler(mut self, handler: SharedExceptionHandler) -> Self {
        self.exception_handler = handler;
        self
    }

    /// Runtime the schedule runs on. Defaults to the runtime that calls `start`.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> ScheduledPollConsumer {
        let key = self.endpoint.key().clone();
        ScheduledPollConsumer {
            poller: Arc::new(Poller {
                support: ServiceSupport::new(format!("scheduled-poll:{}", key)),
                endpoint: self.endpoint,
                key,
                processor: self.processor,
                task: self.task,
                config: self.config,
                strategy: self.strategy,
                exception_handler: self.exception_handler,
                stats: Mutex::new(PollStats::default()),
                running: tokio::sync::Mutex::new(()),
            }),
            runtime: self.runtime,
            scheduler: Mutex::new(None),
        }
    }
}
