//! State accessors: how a machine reads and writes the current state
//! stored on a host instance.

use crate::error::MachineError;
use crate::machine::Instance;
use crate::state::{State, StateTable};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Reads and writes the current state on a host instance.
///
/// The machine never caches the state: every dispatch starts with a `get`
/// and every transition ends with a `set`, so an accessor backed by an
/// external store always sees the freshest value. The built-in accessors
/// are declared through the builder; custom ones implement this trait.
#[async_trait]
pub trait StateAccessor<I: Instance>: Send + Sync {
    async fn get(&self, instance: &I) -> Result<State, MachineError>;
    async fn set(&self, instance: &mut I, state: State) -> Result<(), MachineError>;
}

type ReadFn<I, T> = Box<dyn Fn(&I) -> T + Send + Sync>;
type WriteFn<I, T> = Box<dyn Fn(&mut I, T) + Send + Sync>;

/// Accessor over an `Option<State>` field; unset reads as the initial state.
pub(crate) struct TypedStateAccessor<I: Instance> {
    read: ReadFn<I, Option<State>>,
    write: WriteFn<I, State>,
    initial: State,
}

impl<I: Instance> TypedStateAccessor<I> {
    pub(crate) fn new(
        read: impl Fn(&I) -> Option<State> + Send + Sync + 'static,
        write: impl Fn(&mut I, State) + Send + Sync + 'static,
        initial: State,
    ) -> Self {
        Self {
            read: Box::new(read),
            write: Box::new(write),
            initial,
        }
    }
}

#[async_trait]
impl<I: Instance> StateAccessor<I> for TypedStateAccessor<I> {
    async fn get(&self, instance: &I) -> Result<State, MachineError> {
        Ok((self.read)(instance).unwrap_or_else(|| self.initial.clone()))
    }

    async fn set(&self, instance: &mut I, state: State) -> Result<(), MachineError> {
        (self.write)(instance, state);
        Ok(())
    }
}

/// Accessor over a state-name string field; empty reads as the initial
/// state and unknown names are rejected.
pub(crate) struct NameStateAccessor<I: Instance> {
    read: Box<dyn Fn(&I) -> &str + Send + Sync>,
    write: Box<dyn Fn(&mut I, &str) + Send + Sync>,
    table: Arc<StateTable>,
    machine: Arc<str>,
}

impl<I: Instance> NameStateAccessor<I> {
    pub(crate) fn new(
        read: impl Fn(&I) -> &str + Send + Sync + 'static,
        write: impl Fn(&mut I, &str) + Send + Sync + 'static,
        table: Arc<StateTable>,
        machine: Arc<str>,
    ) -> Self {
        Self {
            read: Box::new(read),
            write: Box::new(write),
            table,
            machine,
        }
    }
}

#[async_trait]
impl<I: Instance> StateAccessor<I> for NameStateAccessor<I> {
    async fn get(&self, instance: &I) -> Result<State, MachineError> {
        let name = (self.read)(instance);
        if name.is_empty() {
            return Ok(self.table.initial().clone());
        }
        self.table
            .resolve(name)
            .cloned()
            .ok_or_else(|| MachineError::UnknownState {
                machine: self.machine.to_string(),
                state: name.to_string(),
            })
    }

    async fn set(&self, instance: &mut I, state: State) -> Result<(), MachineError> {
        (self.write)(instance, state.name());
        Ok(())
    }
}

/// Accessor over a `u32` field holding a compact state ordinal.
///
/// Zero means unset and reads as the initial state; 1 is the initial
/// state, 2 the final state, and the declared ordering fills the slots
/// from 3 upward.
pub(crate) struct OrdinalStateAccessor<I: Instance> {
    read: ReadFn<I, u32>,
    write: WriteFn<I, u32>,
    index: Vec<State>,
    positions: HashMap<Arc<str>, u32>,
    machine: Arc<str>,
}

impl<I: Instance> OrdinalStateAccessor<I> {
    pub(crate) fn new(
        read: impl Fn(&I) -> u32 + Send + Sync + 'static,
        write: impl Fn(&mut I, u32) + Send + Sync + 'static,
        table: &StateTable,
        order: Vec<State>,
        machine: Arc<str>,
    ) -> Self {
        let mut index = vec![table.initial().clone(), table.final_state().clone()];
        index.extend(order);
        let positions = index
            .iter()
            .enumerate()
            .map(|(slot, state)| (state.name_arc(), (slot + 1) as u32))
            .collect();
        Self {
            read: Box::new(read),
            write: Box::new(write),
            index,
            positions,
            machine,
        }
    }
}

#[async_trait]
impl<I: Instance> StateAccessor<I> for OrdinalStateAccessor<I> {
    async fn get(&self, instance: &I) -> Result<State, MachineError> {
        let ordinal = (self.read)(instance);
        if ordinal == 0 {
            return Ok(self.index[0].clone());
        }
        self.index
            .get((ordinal - 1) as usize)
            .cloned()
            .ok_or_else(|| MachineError::UnknownState {
                machine: self.machine.to_string(),
                state: format!("ordinal {ordinal}"),
            })
    }

    async fn set(&self, instance: &mut I, state: State) -> Result<(), MachineError> {
        let ordinal = self.positions.get(state.name()).copied().ok_or_else(|| {
            MachineError::UnknownState {
                machine: self.machine.to_string(),
                state: state.name().to_string(),
            }
        })?;
        (self.write)(instance, ordinal);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    fn table() -> Arc<StateTable> {
        Arc::new(StateTable::new(vec![
            State::initial(),
            State::final_state(),
            State::new("Running"),
            State::new("Paused"),
        ]))
    }

    #[derive(Default)]
    struct Typed {
        state: Option<State>,
    }

    #[tokio::test]
    async fn test_typed_accessor_defaults_to_initial() {
        let accessor = TypedStateAccessor::new(
            |i: &Typed| i.state.clone(),
            |i: &mut Typed, s| i.state = Some(s),
            State::initial(),
        );

        let mut instance = Typed::default();
        assert_eq!(accessor.get(&instance).await.unwrap(), State::initial());

        accessor.set(&mut instance, State::new("Running")).await.unwrap();
        assert_eq!(accessor.get(&instance).await.unwrap().name(), "Running");
    }

    #[derive(Default)]
    struct Named {
        state: String,
    }

    #[tokio::test]
    async fn test_name_accessor_round_trip() {
        let accessor = NameStateAccessor::new(
            |i: &Named| i.state.as_str(),
            |i: &mut Named, s| i.state = s.to_string(),
            table(),
            Arc::from("turnstile"),
        );

        let mut instance = Named::default();
        assert_eq!(accessor.get(&instance).await.unwrap(), State::initial());

        accessor.set(&mut instance, State::new("Paused")).await.unwrap();
        assert_eq!(instance.state, "Paused");
        assert_eq!(accessor.get(&instance).await.unwrap().name(), "Paused");
    }

    #[tokio::test]
    async fn test_name_accessor_rejects_unknown_name() {
        let accessor = NameStateAccessor::new(
            |i: &Named| i.state.as_str(),
            |i: &mut Named, s| i.state = s.to_string(),
            table(),
            Arc::from("turnstile"),
        );

        let instance = Named {
            state: "Bogus".to_string(),
        };
        let err = accessor.get(&instance).await.unwrap_err();
        assert!(matches!(err, MachineError::UnknownState { state, .. } if state == "Bogus"));
    }

    #[derive(Default)]
    struct Packed {
        slot: u32,
    }

    #[tokio::test]
    async fn test_ordinal_accessor_layout() {
        let table = table();
        let accessor = OrdinalStateAccessor::new(
            |i: &Packed| i.slot,
            |i: &mut Packed, v| i.slot = v,
            &table,
            vec![State::new("Running"), State::new("Paused")],
            Arc::from("turnstile"),
        );

        let mut instance = Packed::default();
        // Zero is unset and reads as initial.
        assert_eq!(accessor.get(&instance).await.unwrap(), State::initial());

        accessor.set(&mut instance, State::initial()).await.unwrap();
        assert_eq!(instance.slot, 1);
        accessor.set(&mut instance, State::final_state()).await.unwrap();
        assert_eq!(instance.slot, 2);
        accessor.set(&mut instance, State::new("Running")).await.unwrap();
        assert_eq!(instance.slot, 3);
        accessor.set(&mut instance, State::new("Paused")).await.unwrap();
        assert_eq!(instance.slot, 4);
        assert_eq!(accessor.get(&instance).await.unwrap().name(), "Paused");
    }

    #[tokio::test]
    async fn test_ordinal_accessor_rejects_out_of_range() {
        let table = table();
        let accessor = OrdinalStateAccessor::new(
            |i: &Packed| i.slot,
            |i: &mut Packed, v| i.slot = v,
            &table,
            vec![State::new("Running"), State::new("Paused")],
            Arc::from("turnstile"),
        );

        let instance = Packed { slot: 9 };
        let err = accessor.get(&instance).await.unwrap_err();
        assert!(matches!(err, MachineError::UnknownState { state, .. } if state == "ordinal 9"));
    }
}
