//! Observers: out-of-band notifications for state changes and event
//! dispatch lifecycles.

use crate::error::MachineError;
use crate::state::State;
use parking_lot::RwLock;
use uuid::Uuid;

/// Notified after a transition has been committed to the instance.
pub trait StateObserver<I>: Send + Sync {
    fn state_changed(&self, instance: &I, previous: &State, current: &State);
}

/// Notified around every event dispatch. All methods default to no-ops so
/// an observer implements only the hooks it cares about.
pub trait EventObserver<I>: Send + Sync {
    fn pre_execute(&self, _instance: &I, _event: &str) {}
    fn post_execute(&self, _instance: &I, _event: &str) {}
    fn execute_fault(&self, _instance: &I, _event: &str, _error: &MachineError) {}
}

/// Token returned by a connect call; pass it back to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(Uuid);

impl ObserverHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Which dispatches an event observer sees.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ObserverScope {
    /// Host-raised events only; transition lifecycle events are skipped.
    #[default]
    Public,
    /// Every dispatch, including transition lifecycle events.
    All,
    /// Dispatches of one named event.
    Event(String),
}

impl ObserverScope {
    pub(crate) fn matches(&self, event: &str, transition: bool) -> bool {
        match self {
            Self::Public => !transition,
            Self::All => true,
            Self::Event(name) => name == event,
        }
    }
}

/// A handle-keyed bag of connected observers.
///
/// Notification clones a snapshot under the read lock and iterates outside
/// it, so an observer may connect or disconnect others from inside its
/// callback without deadlocking.
pub(crate) struct ObserverSet<T: Clone> {
    entries: RwLock<Vec<(ObserverHandle, T)>>,
}

impl<T: Clone> ObserverSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn connect(&self, value: T) -> ObserverHandle {
        let handle = ObserverHandle::new();
        self.entries.write().push((handle, value));
        handle
    }

    /// Removes the observer behind `handle`; false when already gone.
    pub(crate) fn disconnect(&self, handle: ObserverHandle) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != handle);
        entries.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.entries
            .read()
            .iter()
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_and_disconnect() {
        let set: ObserverSet<u32> = ObserverSet::new();
        let first = set.connect(1);
        let second = set.connect(2);

        assert_eq!(set.snapshot(), vec![1, 2]);
        assert!(set.disconnect(first));
        assert_eq!(set.snapshot(), vec![2]);
        assert!(!set.disconnect(first));
        assert!(set.disconnect(second));
        assert!(set.is_empty());
    }

    #[test]
    fn test_scope_matching() {
        assert!(ObserverScope::Public.matches("Start", false));
        assert!(!ObserverScope::Public.matches("Running.Enter", true));
        assert!(ObserverScope::All.matches("Running.Enter", true));
        assert!(ObserverScope::Event("Start".to_string()).matches("Start", false));
        assert!(!ObserverScope::Event("Start".to_string()).matches("Stop", false));
        assert!(
            ObserverScope::Event("Running.Enter".to_string()).matches("Running.Enter", true),
            "naming a lifecycle event explicitly opts in"
        );
    }
}
