use crate::status::{ServiceStatus, StatusCell};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while moving a service through its lifecycle.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Service '{service}' failed to start.")]
    Start {
        service: String,
        #[source]
        source: BoxError,
    },

    #[error("Service '{service}' failed to stop.")]
    Stop {
        service: String,
        #[source]
        source: BoxError,
    },

    #[error("Service '{service}' is misconfigured. {message}")]
    Configuration { service: String, message: String },

    #[error("Service '{service}' cannot move from {from} to {to}.")]
    IllegalState {
        service: String,
        from: ServiceStatus,
        to: ServiceStatus,
    },
}

impl ServiceError {
    #[inline]
    pub fn start_failed(service: impl Into<String>, source: impl Into<BoxError>) -> Self {
        ServiceError::Start {
            service: service.into(),
            source: source.into(),
        }
    }

    #[inline]
    pub fn stop_failed(service: impl Into<String>, source: impl Into<BoxError>) -> Self {
        ServiceError::Stop {
            service: service.into(),
            source: source.into(),
        }
    }

    #[inline]
    pub fn configuration(service: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceError::Configuration {
            service: service.into(),
            message: message.into(),
        }
    }

    #[inline]
    pub fn illegal_state(
        service: impl Into<String>,
        from: ServiceStatus,
        to: ServiceStatus,
    ) -> Self {
        ServiceError::IllegalState {
            service: service.into(),
            from,
            to,
        }
    }
}

/// A managed component with a start/stop lifecycle.
///
/// Optional capabilities are expressed as flags (`is_singleton`) or as separate
/// traits reachable through accessor methods on the owning trait (see
/// [`Suspendable`] and `Consumer::as_suspendable`).
pub trait Service: Send + Sync {
    fn start(&self) -> Result<(), ServiceError>;

    fn stop(&self) -> Result<(), ServiceError>;

    fn status(&self) -> ServiceStatus;

    /// Releases everything the service holds. Called once an instance will never be reused.
    fn shutdown(&self) -> Result<(), ServiceError> {
        self.stop()
    }

    /// A singleton instance may be shared by concurrent callers instead of being checked out
    /// exclusively from a pool.
    fn is_singleton(&self) -> bool {
        false
    }
}

/// Capability for services that can pause without releasing their resources.
pub trait Suspendable: Send + Sync {
    fn suspend(&self) -> Result<(), ServiceError>;

    fn resume(&self) -> Result<(), ServiceError>;
}

/// Start/stop bookkeeping shared by the service implementations in this crate.
#[derive(Debug)]
pub struct ServiceSupport {
    name: String,
    status: StatusCell,
}

impl ServiceSupport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StatusCell::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.get()
    }

    pub fn cell(&self) -> &StatusCell {
        &self.status
    }

    /// Runs `f` when the service is stopped (or failed) and records the outcome.
    /// Starting an already started service is a no-op.
    pub fn start_with<F>(&self, f: F) -> Result<(), ServiceError>
    where
        F: FnOnce() -> Result<(), ServiceError>,
    {
        let claimed = self
            .status
            .transition(ServiceStatus::Stopped, ServiceStatus::Starting)
            || self
                .status
                .transition(ServiceStatus::Failed, ServiceStatus::Starting);
        if !claimed {
            return match self.status.get() {
                ServiceStatus::Started | ServiceStatus::Starting => Ok(()),
                other => Err(ServiceError::illegal_state(
                    &self.name,
                    other,
                    ServiceStatus::Started,
                )),
            };
        }
        match f() {
            Ok(()) => {
                self.status.set(ServiceStatus::Started);
                log::debug!("Service '{}' started", self.name);
                Ok(())
            }
            Err(e) => {
                self.status.set(ServiceStatus::Failed);
                Err(e)
            }
        }
    }

    /// Runs `f` unless the service is already stopped. The service ends up stopped even when
    /// `f` fails, the error is still returned to the caller.
    pub fn stop_with<F>(&self, f: F) -> Result<(), ServiceError>
    where
        F: FnOnce() -> Result<(), ServiceError>,
    {
        let current = self.status.get();
        if current.is_stopped() || current == ServiceStatus::Stopping {
            return Ok(());
        }
        self.status.set(ServiceStatus::Stopping);
        let result = f();
        self.status.set(ServiceStatus::Stopped);
        log::debug!("Service '{}' stopped", self.name);
        result
    }

    pub fn suspend_with<F>(&self, f: F) -> Result<(), ServiceError>
    where
        F: FnOnce() -> Result<(), ServiceError>,
    {
        if !self
            .status
            .transition(ServiceStatus::Started, ServiceStatus::Suspending)
        {
            return match self.status.get() {
                ServiceStatus::Suspended | ServiceStatus::Suspending => Ok(()),
                other => Err(ServiceError::illegal_state(
                    &self.name,
                    other,
                    ServiceStatus::Suspended,
                )),
            };
        }
        match f() {
            Ok(()) => {
                self.status.set(ServiceStatus::Suspended);
                Ok(())
            }
            Err(e) => {
                self.status.set(ServiceStatus::Started);
                Err(e)
            }
        }
    }

    pub fn resume_with<F>(&self, f: F) -> Result<(), ServiceError>
    where
        F: FnOnce() -> Result<(), ServiceError>,
    {
        if !self
            .status
            .transition(ServiceStatus::Suspended, ServiceStatus::Starting)
        {
            return match self.status.get() {
                ServiceStatus::Started | ServiceStatus::Starting => Ok(()),
                other => Err(ServiceError::illegal_state(
                    &self.name,
                    other,
                    ServiceStatus::Started,
                )),
            };
        }
        match f() {
            Ok(()) => {
                self.status.set(ServiceStatus::Started);
                Ok(())
            }
            Err(e) => {
                self.status.set(ServiceStatus::Suspended);
                Err(e)
            }
        }
    }
}
