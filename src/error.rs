//! Error types for the state machine runtime.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error returned by fallible user activities.
///
/// Whatever an activity closure fails with is preserved here and carried
/// through the dispatch as [`MachineError::Activity`], so exception handlers
/// declared with `try_handle` can downcast back to the concrete type.
pub type ActivityError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced by machine construction and event dispatch.
#[derive(Debug, Error)]
pub enum MachineError {
    /// A state name could not be resolved against the machine's registry.
    #[error("unknown state: {state} in machine {machine}")]
    UnknownState { machine: String, state: String },

    /// An event name could not be resolved against the machine's registry.
    #[error("unknown event: {event} in machine {machine}")]
    UnknownEvent { machine: String, event: String },

    /// An event reached a state with no binding, no ignore rule and no
    /// super state able to take it, and the machine policy is to fail.
    #[error("unhandled event {event} in state {state} of machine {machine}")]
    UnhandledEvent {
        machine: String,
        event: String,
        state: String,
    },

    /// Declaration-time misuse: duplicate names, bad composite member lists,
    /// missing accessor and similar construction failures.
    #[error("invalid definition for machine {machine}: {reason}")]
    InvalidDefinition { machine: String, reason: String },

    /// Event data was absent or did not downcast to the requested type.
    #[error("event {event} carries no data of the requested type")]
    EventDataType { event: String },

    /// The per-dispatch payload bag is full.
    #[error("payload limit reached: capacity {capacity}")]
    PayloadLimit { capacity: usize },

    /// A user activity failed; the original error is preserved as the source.
    #[error("activity failed: {source}")]
    Activity {
        #[source]
        source: ActivityError,
    },
}

impl MachineError {
    /// Wraps an arbitrary error as an activity failure.
    pub fn activity(source: impl Into<ActivityError>) -> Self {
        Self::Activity {
            source: source.into(),
        }
    }

    /// Attempts to view this error as a concrete error type.
    ///
    /// Matches the error itself first, then the boxed source of an
    /// [`MachineError::Activity`]. This is what exception handlers use to
    /// recover the typed error an activity failed with.
    pub fn downcast_ref<E: StdError + Send + Sync + 'static>(&self) -> Option<&E> {
        let direct: &(dyn StdError + 'static) = self;
        if let Some(err) = direct.downcast_ref::<E>() {
            return Some(err);
        }
        if let Self::Activity { source } = self {
            return source.downcast_ref::<E>();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Boom!")
        }
    }

    impl StdError for Boom {}

    #[test]
    fn test_error_display() {
        let err = MachineError::UnhandledEvent {
            machine: "order".to_string(),
            event: "Charge".to_string(),
            state: "Running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unhandled event Charge in state Running of machine order"
        );
    }

    #[test]
    fn test_activity_wrapping_preserves_source() {
        let err = MachineError::activity(Boom);
        assert_eq!(err.to_string(), "activity failed: Boom!");

        let inner = err.downcast_ref::<Boom>().unwrap();
        assert_eq!(inner.to_string(), "Boom!");
    }

    #[test]
    fn test_downcast_matches_machine_error_directly() {
        let err = MachineError::PayloadLimit { capacity: 4 };
        assert!(err.downcast_ref::<MachineError>().is_some());
        assert!(err.downcast_ref::<Boom>().is_none());
    }

    #[test]
    fn test_downcast_misses_unrelated_type() {
        let err = MachineError::activity(Boom);
        assert!(err.downcast_ref::<std::io::Error>().is_none());
    }
}
