pub mod processor;

use crate::exchange::{Exchange, Failure, same_failure};
use crate::processor::panic_message;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use processor::UnitOfWorkProcessor;

#[derive(Error, Debug)]
pub enum UnitOfWorkError {
    #[error("Sub unit of work failed with {} distinct error(s).", .causes.len())]
    SubUnitFailed { causes: Vec<Failure> },

    #[error("No sub unit of work is active in unit of work '{unit_of_work_id}'.")]
    NoActiveSubUnit { unit_of_work_id: String },
}

impl UnitOfWorkError {
    #[inline]
    pub fn sub_unit_failed(causes: Vec<Failure>) -> Self {
        UnitOfWorkError::SubUnitFailed { causes }
    }

    #[inline]
    pub fn no_active_sub_unit(unit_of_work_id: impl Into<String>) -> Self {
        UnitOfWorkError::NoActiveSubUnit {
            unit_of_work_id: unit_of_work_id.into(),
        }
    }
}

/// Completion hook registered on a [`UnitOfWork`].
pub trait Synchronization: Send + Sync {
    fn on_complete(&self, exchange: &Exchange);

    fn on_failure(&self, exchange: &Exchange);

    /// Whether the hook may move to a child unit of work during a handover.
    fn allow_handover(&self) -> bool {
        true
    }
}

pub type SharedSynchronization = Arc<dyn Synchronization>;

fn same_synchronization(left: &SharedSynchronization, right: &SharedSynchronization) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(left), Arc::as_ptr(right))
}

/// Outcome tracker for a nested scope such as one branch fan-out.
///
/// Failures reported by several branches are recorded once per distinct error instance.
#[derive(Debug, Default)]
pub struct SubUnitOfWork {
    failures: Mutex<Vec<Failure>>,
}

impl SubUnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `failure` unless the same instance was already recorded. Returns whether it
    /// was added.
    pub fn record_failure(&self, failure: &Failure) -> bool {
        let mut failures = self.failures.lock();
        if failures.iter().any(|known| same_failure(known, failure)) {
            return false;
        }
        failures.push(failure.clone());
        true
    }

    pub fn is_failed(&self) -> bool {
        !self.failures.lock().is_empty()
    }

    pub fn failures(&self) -> Vec<Failure> {
        self.failures.lock().clone()
    }
}

/// One step of the path an exchange took.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    pub route_id: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub elapsed: Duration,
}

/// Completion tracker for one root exchange.
///
/// Holds the registered [`Synchronization`]s and fires each of them exactly once when
/// [`UnitOfWork::done`] is called, in registration order. The branch (`on_complete` or
/// `on_failure`) is chosen from the exchange's state at that moment.
///
/// All methods take `&self` and may be called from any dispatch thread.
pub struct UnitOfWork {
    id: String,
    origin_exchange_id: String,
    created: DateTime<Utc>,
    synchronizations: Mutex<Vec<SharedSynchronization>>,
    sub_units: Mutex<Vec<Arc<SubUnitOfWork>>>,
    routes: Mutex<Vec<String>>,
    history: Mutex<Vec<MessageHistory>>,
    done: AtomicBool,
}

impl UnitOfWork {
    pub fn new(exchange: &Exchange) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin_exchange_id: exchange.id().to_string(),
            created: Utc::now(),
            synchronizations: Mutex::new(Vec::new()),
            sub_units: Mutex::new(Vec::new()),
            routes: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn origin_exchange_id(&self) -> &str {
        &self.origin_exchange_id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Registers a hook. The same hook may be registered more than once, each registration
    /// fires separately.
    pub fn add_synchronization(&self, synchronization: SharedSynchronization) {
        if self.is_done() {
            log::warn!(
                "Synchronization added to unit of work '{}' after it was done, it will never fire",
                self.id
            );
        }
        self.synchronizations.lock().push(synchronization);
    }

    /// Removes one registration of `synchronization`. Returns whether one was found.
    pub fn remove_synchronization(&self, synchronization: &SharedSynchronization) -> bool {
        let mut synchronizations = self.synchronizations.lock();
        match synchronizations
            .iter()
            .position(|known| same_synchronization(known, synchronization))
        {
            Some(index) => {
                synchronizations.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains_synchronization(&self, synchronization: &SharedSynchronization) -> bool {
        self.synchronizations
            .lock()
            .iter()
            .any(|known| same_synchronization(known, synchronization))
    }

    pub fn synchronization_count(&self) -> usize {
        self.synchronizations.lock().len()
    }

    /// Moves every hook that allows it onto `target`. Moved hooks fire only when `target`
    /// is done.
    pub fn handover_synchronization(&self, target: &UnitOfWork) -> usize {
        let moved: Vec<SharedSynchronization> = {
            let mut synchronizations = self.synchronizations.lock();
            let (moved, kept) = std::mem::take(&mut *synchronizations)
                .into_iter()
                .partition(|synchronization| synchronization.allow_handover());
            *synchronizations = kept;
            moved
        };
        let count = moved.len();
        target.synchronizations.lock().extend(moved);
        log::trace!(
            "Handed over {} synchronization(s) from unit of work '{}' to '{}'",
            count,
            self.id,
            target.id
        );
        count
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Fires every registered hook once. Later calls are ignored.
    ///
    /// A hook that panics is logged and does not prevent the remaining hooks from firing.
    pub fn done(&self, exchange: &Exchange) {
        if self.done.swap(true, Ordering::AcqRel) {
            log::warn!("Unit of work '{}' is already done", self.id);
            return;
        }
        let failed = exchange.is_failed();
        let synchronizations = std::mem::take(&mut *self.synchronizations.lock());
        log::trace!(
            "Unit of work '{}' done for exchange '{}' (failed: {}), firing {} synchronization(s)",
            self.id,
            exchange.id(),
            failed,
            synchronizations.len()
        );
        for synchronization in synchronizations {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if failed {
                    synchronization.on_failure(exchange);
                } else {
                    synchronization.on_complete(exchange);
                }
            }));
            if let Err(payload) = outcome {
                log::warn!(
                    "Synchronization on exchange '{}' panicked: {}",
                    exchange.id(),
                    panic_message(&*payload)
                );
            }
        }
    }

    pub fn begin_sub_unit_of_work(&self) -> Arc<SubUnitOfWork> {
        let sub = Arc::new(SubUnitOfWork::new());
        self.sub_units.lock().push(sub.clone());
        sub
    }

    pub fn sub_unit_of_work(&self) -> Option<Arc<SubUnitOfWork>> {
        self.sub_units.lock().last().cloned()
    }

    /// Records the outcome of one branch exchange in the innermost sub unit of work.
    pub fn on_sub_exchange(&self, exchange: &Exchange) {
        let Some(failure) = exchange.exception() else {
            return;
        };
        if let Some(sub) = self.sub_unit_of_work() {
            sub.record_failure(failure);
        }
    }

    /// Closes the innermost sub unit of work. When any branch failed the exchange gets a
    /// [`UnitOfWorkError::SubUnitFailed`] carrying the distinct causes.
    pub fn end_sub_unit_of_work(&self, exchange: &mut Exchange) -> Result<(), UnitOfWorkError> {
        let sub = self.sub_units.lock().pop();
        match sub {
            None => Err(UnitOfWorkError::no_active_sub_unit(&self.id)),
            Some(sub) => {
                if sub.is_failed() {
                    exchange.set_exception(UnitOfWorkError::sub_unit_failed(sub.failures()));
                }
                Ok(())
            }
        }
    }

    pub fn push_route(&self, route_id: impl Into<String>) {
        self.routes.lock().push(route_id.into());
    }

    pub fn pop_route(&self) -> Option<String> {
        self.routes.lock().pop()
    }

    pub fn current_route(&self) -> Option<String> {
        self.routes.lock().last().cloned()
    }

    pub fn add_history(&self, node_id: impl Into<String>, elapsed: Duration) {
        let entry = MessageHistory {
            route_id: self.current_route(),
            node_id: node_id.into(),
            timestamp: Utc::now(),
            elapsed,
        };
        self.history.lock().push(entry);
    }

    pub fn history(&self) -> Vec<MessageHistory> {
        self.history.lock().clone()
    }
}

impl Debug for UnitOfWork {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("origin_exchange_id", &self.origin_exchange_id)
            .field("synchronizations", &self.synchronization_count())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSynchronization;
    use std::io;

    #[test]
    fn test_done_fires_in_registration_order() {
        let exchange = Exchange::default();
        let uow = UnitOfWork::new(&exchange);
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            uow.add_synchronization(Arc::new(RecordingSynchronization::with_log(
                name,
                log.clone(),
            )));
        }
        uow.done(&exchange);
        uow.done(&exchange);
        assert_eq!(
            *log.lock(),
            vec!["first:complete", "second:complete", "third:complete"]
        );
    }

    #[test]
    fn test_duplicate_registration_and_single_remove() {
        let exchange = Exchange::default();
        let uow = UnitOfWork::new(&exchange);
        let sync = Arc::new(RecordingSynchronization::new("dup"));
        let shared: SharedSynchronization = sync.clone();
        uow.add_synchronization(shared.clone());
        uow.add_synchronization(shared.clone());
        assert!(uow.remove_synchronization(&shared));
        assert_eq!(uow.synchronization_count(), 1);
        assert!(uow.contains_synchronization(&shared));

        uow.done(&exchange);
        assert_eq!(sync.completed(), 1);
        assert_eq!(sync.failed(), 0);
    }

    #[test]
    fn test_failure_branch_chosen_at_done() {
        let mut exchange = Exchange::default();
        let uow = UnitOfWork::new(&exchange);
        let sync = Arc::new(RecordingSynchronization::new("s"));
        uow.add_synchronization(sync.clone());
        exchange.set_exception(io::Error::other("late failure"));
        uow.done(&exchange);
        exchange.take_exception();
        assert_eq!(sync.failed(), 1);
        assert_eq!(sync.completed(), 0);
    }

    struct Panicking;

    impl Synchronization for Panicking {
        fn on_complete(&self, _exchange: &Exchange) {
            panic!("hook exploded");
        }

        fn on_failure(&self, _exchange: &Exchange) {}
    }

    #[test]
    fn test_panicking_hook_does_not_stop_others() {
        let exchange = Exchange::default();
        let uow = UnitOfWork::new(&exchange);
        let after = Arc::new(RecordingSynchronization::new("after"));
        uow.add_synchronization(Arc::new(Panicking));
        uow.add_synchronization(after.clone());
        uow.done(&exchange);
        assert_eq!(after.completed(), 1);
    }

    #[test]
    fn test_handover_moves_without_duplication() {
        let parent_exchange = Exchange::default();
        let child_exchange = parent_exchange.copy();
        let parent = UnitOfWork::new(&parent_exchange);
        let child = UnitOfWork::new(&child_exchange);

        let movable = Arc::new(RecordingSynchronization::new("movable"));
        let pinned = Arc::new(RecordingSynchronization::new("pinned").pinned());
        parent.add_synchronization(movable.clone());
        parent.add_synchronization(pinned.clone());

        assert_eq!(parent.handover_synchronization(&child), 1);
        parent.done(&parent_exchange);
        assert_eq!(movable.completed(), 0);
        assert_eq!(pinned.completed(), 1);

        child.done(&child_exchange);
        child.done(&child_exchange);
        assert_eq!(movable.completed(), 1);
        assert_eq!(pinned.completed(), 1);
    }

    #[test]
    fn test_sub_unit_deduplicates_failures() {
        let mut exchange = Exchange::default();
        let uow = UnitOfWork::new(&exchange);
        let outer = uow.begin_sub_unit_of_work();
        let inner = uow.begin_sub_unit_of_work();

        let shared: Failure = Arc::new(io::Error::other("shared"));
        for _ in 0..2 {
            let mut branch = exchange.copy();
            branch.set_failure(shared.clone());
            uow.on_sub_exchange(&branch);
        }
        let mut other = exchange.copy();
        other.set_exception(io::Error::other("other"));
        uow.on_sub_exchange(&other);

        assert_eq!(inner.failures().len(), 2);
        assert!(!outer.is_failed());

        uow.end_sub_unit_of_work(&mut exchange).unwrap();
        match exchange.exception() {
            Some(failure) => assert!(failure.to_string().contains("2 distinct")),
            None => panic!("expected sub unit failure"),
        }

        let mut clean = Exchange::default();
        uow.end_sub_unit_of_work(&mut clean).unwrap();
        assert!(!clean.is_failed());
        assert!(matches!(
            uow.end_sub_unit_of_work(&mut clean),
            Err(UnitOfWorkError::NoActiveSubUnit { .. })
        ));
    }

    #[test]
    fn test_route_stack_and_history() {
        let exchange = Exchange::default();
        let uow = UnitOfWork::new(&exchange);
        uow.push_route("outer");
        uow.push_route("inner");
        uow.add_history("to-log", Duration::from_millis(3));
        assert_eq!(uow.pop_route().as_deref(), Some("inner"));
        assert_eq!(uow.current_route().as_deref(), Some("outer"));
        let history = uow.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].route_id.as_deref(), Some("inner"));
        assert_eq!(history[0].node_id, "to-log");
    }
}
