//! Dispatch context: instance access, event data, payloads and nested raises.

use crate::cancel::CancellationToken;
use crate::error::MachineError;
use crate::event::{Event, EventMessage};
use crate::machine::{Instance, StateMachine};
use std::any::{Any, TypeId};
use std::error::Error as StdError;
use std::fmt;

/// Default capacity of the per-dispatch payload bag.
pub const DEFAULT_PAYLOAD_LIMIT: usize = 16;

/// Ad-hoc typed values attached to a raise and retrievable by type.
///
/// Used for pass-through values the host wants visible to activities without
/// threading them through the instance, such as a request id or a consume
/// context. One value per type; inserting the same type again replaces the
/// previous value. Capacity is bounded so a bag cannot grow without limit.
pub struct Payloads {
    entries: Vec<(TypeId, Box<dyn Any + Send + Sync>)>,
    limit: usize,
}

impl Default for Payloads {
    fn default() -> Self {
        Self::with_limit(DEFAULT_PAYLOAD_LIMIT)
    }
}

impl Payloads {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            limit,
        }
    }

    /// Attaches a value, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Result<(), MachineError> {
        let id = TypeId::of::<T>();
        if let Some(slot) = self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            slot.1 = Box::new(value);
            return Ok(());
        }
        if self.entries.len() >= self.limit {
            return Err(MachineError::PayloadLimit {
                capacity: self.limit,
            });
        }
        self.entries.push((id, Box::new(value)));
        Ok(())
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        let id = TypeId::of::<T>();
        self.entries
            .iter()
            .find(|(existing, _)| *existing == id)
            .and_then(|(_, value)| value.downcast_ref())
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.get::<T>().is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Payloads {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payloads")
            .field("len", &self.entries.len())
            .field("limit", &self.limit)
            .finish()
    }
}

/// Per-raise options: a cancellation token and attached payloads.
#[derive(Debug, Default)]
pub struct RaiseOptions {
    pub cancellation: CancellationToken,
    pub payloads: Payloads,
}

impl RaiseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_payload<T: Any + Send + Sync>(mut self, value: T) -> Result<Self, MachineError> {
        self.payloads.insert(value)?;
        Ok(self)
    }
}

/// Everything an activity can see during one dispatch.
///
/// Borrows the machine, exclusive access to the host instance, the in-flight
/// [`EventMessage`], the cancellation token and the payload bag. Contexts
/// are passed by value down the activity chain; [`reborrow`](Self::reborrow)
/// hands a shorter-lived copy to a callee while keeping the original usable
/// afterwards, and [`proxy`](Self::proxy) rebinds the same dispatch to a
/// different message for sub-event raises.
///
/// Raising further events from inside an activity goes through
/// [`raise`](Self::raise) / [`raise_with`](Self::raise_with): the nested
/// dispatch runs to completion against the instance's current state before
/// control returns, sharing this dispatch's token and payloads.
pub struct EventContext<'a, I: Instance> {
    machine: &'a StateMachine<I>,
    instance: &'a mut I,
    message: &'a EventMessage,
    cancellation: &'a CancellationToken,
    payloads: &'a Payloads,
    fault: Option<&'a MachineError>,
}

impl<'a, I: Instance> EventContext<'a, I> {
    pub(crate) fn new(
        machine: &'a StateMachine<I>,
        instance: &'a mut I,
        message: &'a EventMessage,
        cancellation: &'a CancellationToken,
        payloads: &'a Payloads,
    ) -> Self {
        Self {
            machine,
            instance,
            message,
            cancellation,
            payloads,
            fault: None,
        }
    }

    /// The machine this dispatch runs on.
    pub fn machine(&self) -> &'a StateMachine<I> {
        self.machine
    }

    /// Name of the event being dispatched.
    pub fn event(&self) -> &str {
        self.message.name()
    }

    pub fn message(&self) -> &'a EventMessage {
        self.message
    }

    pub fn instance(&self) -> &I {
        self.instance
    }

    pub fn instance_mut(&mut self) -> &mut I {
        self.instance
    }

    pub fn cancellation(&self) -> &'a CancellationToken {
        self.cancellation
    }

    pub fn payloads(&self) -> &'a Payloads {
        self.payloads
    }

    /// The typed event data, or [`MachineError::EventDataType`] when the
    /// raise carried none or a different type.
    pub fn data<T: Send + Sync + 'static>(&self) -> Result<&T, MachineError> {
        self.message
            .data_as::<T>()
            .ok_or_else(|| MachineError::EventDataType {
                event: self.message.name().to_string(),
            })
    }

    pub fn try_data<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.message.data_as()
    }

    /// Borrows the instance mutably and the event data immutably at once.
    pub fn split_data<T: Send + Sync + 'static>(&mut self) -> Result<(&mut I, &T), MachineError> {
        let message = self.message;
        match message.data_as::<T>() {
            Some(data) => Ok((&mut *self.instance, data)),
            None => Err(MachineError::EventDataType {
                event: message.name().to_string(),
            }),
        }
    }

    /// The error being handled, when this context runs on a faulted path or
    /// inside an exception handler chain.
    pub fn error(&self) -> Option<&'a MachineError> {
        self.fault
    }

    /// The handled error viewed as a concrete type, including the boxed
    /// source of an activity failure.
    pub fn error_as<E: StdError + Send + Sync + 'static>(&self) -> Option<&'a E> {
        self.fault.and_then(|error| error.downcast_ref::<E>())
    }

    /// A shorter-lived copy of this context for a sub-call.
    pub fn reborrow(&mut self) -> EventContext<'_, I> {
        EventContext {
            machine: self.machine,
            instance: &mut *self.instance,
            message: self.message,
            cancellation: self.cancellation,
            payloads: self.payloads,
            fault: self.fault,
        }
    }

    /// This dispatch re-bound to a different message, for sub-event raises.
    /// The fault slot is cleared; the token and payloads are shared.
    pub fn proxy<'b>(&'b mut self, message: &'b EventMessage) -> EventContext<'b, I> {
        EventContext {
            machine: self.machine,
            instance: &mut *self.instance,
            message,
            cancellation: self.cancellation,
            payloads: self.payloads,
            fault: None,
        }
    }

    /// This context with the fault slot set, for running a faulted path.
    pub fn with_error<'b>(&'b mut self, error: &'b MachineError) -> EventContext<'b, I> {
        EventContext {
            machine: self.machine,
            instance: &mut *self.instance,
            message: self.message,
            cancellation: self.cancellation,
            payloads: self.payloads,
            fault: Some(error),
        }
    }

    /// Raises a further event on the same instance and runs it to
    /// completion before returning.
    pub async fn raise(&mut self, event: &Event) -> Result<(), MachineError> {
        let machine = self.machine;
        let message = EventMessage::trigger(event);
        machine.raise_nested(self.proxy(&message)).await
    }

    /// Raises a further data-carrying event on the same instance.
    pub async fn raise_with<T: Send + Sync + 'static>(
        &mut self,
        event: &Event<T>,
        data: T,
    ) -> Result<(), MachineError> {
        let machine = self.machine;
        let message = EventMessage::with_data(event, data);
        machine.raise_nested(self.proxy(&message)).await
    }
}

impl<I: Instance> fmt::Debug for EventContext<'_, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("event", &self.message.name())
            .field("faulted", &self.fault.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct RequestId(u64);

    #[derive(Debug, PartialEq)]
    struct Tenant(&'static str);

    #[test]
    fn test_payloads_retrieve_by_type() {
        let mut payloads = Payloads::default();
        payloads.insert(RequestId(7)).unwrap();
        payloads.insert(Tenant("acme")).unwrap();

        assert_eq!(payloads.get::<RequestId>(), Some(&RequestId(7)));
        assert_eq!(payloads.get::<Tenant>(), Some(&Tenant("acme")));
        assert_eq!(payloads.len(), 2);
    }

    #[test]
    fn test_payloads_replace_same_type() {
        let mut payloads = Payloads::default();
        payloads.insert(RequestId(1)).unwrap();
        payloads.insert(RequestId(2)).unwrap();

        assert_eq!(payloads.get::<RequestId>(), Some(&RequestId(2)));
        assert_eq!(payloads.len(), 1);
    }

    #[test]
    fn test_payloads_enforce_limit() {
        let mut payloads = Payloads::with_limit(1);
        payloads.insert(RequestId(1)).unwrap();

        let err = payloads.insert(Tenant("acme")).unwrap_err();
        assert!(matches!(err, MachineError::PayloadLimit { capacity: 1 }));

        // Replacing within the limit still works.
        payloads.insert(RequestId(2)).unwrap();
        assert_eq!(payloads.get::<RequestId>(), Some(&RequestId(2)));
    }

    #[test]
    fn test_raise_options_builder() {
        let token = CancellationToken::new();
        let opts = RaiseOptions::new()
            .with_cancellation(token.clone())
            .with_payload(RequestId(9))
            .unwrap();

        token.cancel();
        assert!(opts.cancellation.is_cancelled());
        assert_eq!(opts.payloads.get::<RequestId>(), Some(&RequestId(9)));
    }
}
