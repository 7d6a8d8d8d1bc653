//! Event identity tokens and the erased message that carries a raise.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// Marker for events that carry no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoData;

/// An event identity token declared on a machine.
///
/// Tokens are value types: equality, ordering and hashing go by name alone,
/// so two tokens with the same name compare equal even across machines. The
/// type parameter tags the data a raise of this event carries; trigger
/// events use the [`NoData`] default. Comparing tokens with different data
/// types goes through [`Event::name`].
pub struct Event<T = NoData> {
    name: Arc<str>,
    composite: bool,
    transition: bool,
    _data: PhantomData<fn(T)>,
}

impl<T> Event<T> {
    pub(crate) fn declare(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            composite: false,
            transition: false,
            _data: PhantomData,
        }
    }

    pub(crate) fn declare_composite(name: impl Into<Arc<str>>) -> Self {
        Self {
            composite: true,
            ..Self::declare(name)
        }
    }

    pub(crate) fn declare_transition(name: impl Into<Arc<str>>) -> Self {
        Self {
            transition: true,
            ..Self::declare(name)
        }
    }

    /// The event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Whether this event is raised automatically once all members of a
    /// composite declaration have been observed.
    pub fn is_composite(&self) -> bool {
        self.composite
    }

    /// Whether this is one of the four per-state transition sub-events
    /// (`Enter`, `Leave`, `BeforeEnter`, `AfterLeave`).
    pub fn is_transition_event(&self) -> bool {
        self.transition
    }
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            composite: self.composite,
            transition: self.transition,
            _data: PhantomData,
        }
    }
}

impl<T> PartialEq for Event<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<T> Eq for Event<T> {}

impl<T> PartialOrd for Event<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Event<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl<T> Hash for Event<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("name", &self.name).finish()
    }
}

impl<T> fmt::Display for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Introspection row describing a declared event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    name: Arc<str>,
    composite: bool,
    transition: bool,
    has_data: bool,
}

impl EventInfo {
    pub(crate) fn new(name: Arc<str>, composite: bool, transition: bool, has_data: bool) -> Self {
        Self {
            name,
            composite,
            transition,
            has_data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_composite(&self) -> bool {
        self.composite
    }

    pub fn is_transition_event(&self) -> bool {
        self.transition
    }

    /// Whether raises of this event carry typed data.
    pub fn has_data(&self) -> bool {
        self.has_data
    }
}

/// One in-flight raise: the event identity plus its type-erased data.
///
/// The dispatch that owns the raise keeps the message on its stack; contexts
/// borrow it, so nested raises and proxied sub-event raises each carry their
/// own message without copying event data around.
pub struct EventMessage {
    name: Arc<str>,
    composite: bool,
    transition: bool,
    data: Option<Box<dyn Any + Send + Sync>>,
}

impl EventMessage {
    /// Builds a message for a data-less raise.
    pub fn trigger(event: &Event) -> Self {
        Self {
            name: event.name_arc(),
            composite: event.is_composite(),
            transition: event.is_transition_event(),
            data: None,
        }
    }

    /// Builds a message carrying typed data.
    pub fn with_data<T: Send + Sync + 'static>(event: &Event<T>, data: T) -> Self {
        Self {
            name: event.name_arc(),
            composite: event.is_composite(),
            transition: event.is_transition_event(),
            data: Some(Box::new(data)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_composite(&self) -> bool {
        self.composite
    }

    pub fn is_transition_event(&self) -> bool {
        self.transition
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// The carried data, if present and of type `T`.
    pub fn data_as<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.data.as_deref().and_then(|data| data.downcast_ref())
    }
}

impl fmt::Debug for EventMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventMessage")
            .field("name", &self.name)
            .field("has_data", &self.has_data())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_is_by_name() {
        let a: Event = Event::declare("Started");
        let b: Event = Event::declare("Started");
        let c: Event = Event::declare("Stopped");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
    }

    #[test]
    fn test_hash_follows_name() {
        let mut set = HashSet::new();
        set.insert(Event::<NoData>::declare("Started"));
        assert!(set.contains(&Event::<NoData>::declare("Started")));
        assert!(!set.contains(&Event::<NoData>::declare("Stopped")));
    }

    #[test]
    fn test_cross_data_type_comparison_by_name() {
        let trigger: Event = Event::declare("Submit");
        let typed: Event<String> = Event::declare("Submit");
        assert_eq!(trigger.name(), typed.name());
    }

    #[test]
    fn test_flags() {
        let plain: Event = Event::declare("Started");
        assert!(!plain.is_composite());
        assert!(!plain.is_transition_event());

        let composite: Event = Event::declare_composite("Ready");
        assert!(composite.is_composite());

        let sub: Event = Event::declare_transition("Running.Enter");
        assert!(sub.is_transition_event());
    }

    #[test]
    fn test_display_prints_name() {
        let event: Event = Event::declare("Started");
        assert_eq!(event.to_string(), "Started");
    }

    #[test]
    fn test_trigger_message_has_no_data() {
        let event: Event = Event::declare("Started");
        let message = EventMessage::trigger(&event);
        assert_eq!(message.name(), "Started");
        assert!(!message.has_data());
        assert!(message.data_as::<String>().is_none());
    }

    #[test]
    fn test_data_message_downcasts() {
        let event: Event<String> = Event::declare("Submit");
        let message = EventMessage::with_data(&event, "order-17".to_string());
        assert!(message.has_data());
        assert_eq!(message.data_as::<String>().unwrap(), "order-17");
        assert!(message.data_as::<u32>().is_none());
    }
}
