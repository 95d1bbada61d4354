use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state shared by every managed service in the engine.
///
/// The transitions that are legal for a route are
/// `Stopped -> Starting -> Started -> Suspending -> Suspended -> Starting -> Started -> Stopping -> Stopped`.
/// Services that do not support suspension never enter the suspend states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceStatus {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Suspending = 3,
    Suspended = 4,
    Stopping = 5,
    Failed = 6,
}

impl ServiceStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => ServiceStatus::Starting,
            2 => ServiceStatus::Started,
            3 => ServiceStatus::Suspending,
            4 => ServiceStatus::Suspended,
            5 => ServiceStatus::Stopping,
            6 => ServiceStatus::Failed,
            _ => ServiceStatus::Stopped,
        }
    }

    pub fn is_started(&self) -> bool {
        *self == ServiceStatus::Started
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed)
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, ServiceStatus::Suspending | ServiceStatus::Suspended)
    }

    /// Whether new work may still be accepted by a service in this state.
    pub fn is_run_allowed(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Starting | ServiceStatus::Started | ServiceStatus::Suspended
        )
    }
}

impl Display for ServiceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceStatus::Stopped => "Stopped",
            ServiceStatus::Starting => "Starting",
            ServiceStatus::Started => "Started",
            ServiceStatus::Suspending => "Suspending",
            ServiceStatus::Suspended => "Suspended",
            ServiceStatus::Stopping => "Stopping",
            ServiceStatus::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Lock-free holder for a [`ServiceStatus`].
#[derive(Debug)]
pub struct StatusCell {
    value: AtomicU8,
}

impl StatusCell {
    pub const fn new(status: ServiceStatus) -> Self {
        Self {
            value: AtomicU8::new(status as u8),
        }
    }

    pub fn get(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.value.load(Ordering::Acquire))
    }

    pub fn set(&self, status: ServiceStatus) {
        self.value.store(status as u8, Ordering::Release);
    }

    /// Moves from `from` to `to` only if the current state is `from`.
    pub fn transition(&self, from: ServiceStatus, to: ServiceStatus) -> bool {
        self.value
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(ServiceStatus::Stopped)
    }
}
