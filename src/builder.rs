//! Declarative machine definition, frozen into a [`StateMachine`] by
//! [`StateMachineBuilder::build`].

use crate::accessor::{NameStateAccessor, OrdinalStateAccessor, StateAccessor, TypedStateAccessor};
use crate::activity::{CompositeEventActivity, CompositeLens};
use crate::behavior::{Activity, Behavior};
use crate::binder::{when, EventBinder};
use crate::error::MachineError;
use crate::event::{Event, EventInfo, NoData};
use crate::machine::{GraphEdge, Instance, MachineParts, StateMachine, UnhandledEventPolicy};
use crate::state::{IgnoreFilter, State, StateNode, StateTable, TransitionEvents};
use crate::status::{CompositeEventStatus, MAX_COMPOSITE_EVENTS};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Which reserved states take part in composite member tracking.
///
/// By default members are only tracked in user-declared states; a machine
/// that accumulates members before its first transition or after
/// finalization opts the reserved states in explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompositeOptions {
    pub include_initial: bool,
    pub include_final: bool,
}

impl CompositeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(mut self) -> Self {
        self.include_initial = true;
        self
    }

    pub fn with_final(mut self) -> Self {
        self.include_final = true;
        self
    }
}

enum AccessorDecl<I: Instance> {
    Typed {
        read: Box<dyn Fn(&I) -> Option<State> + Send + Sync>,
        write: Box<dyn Fn(&mut I, State) + Send + Sync>,
    },
    Name {
        read: Box<dyn Fn(&I) -> &str + Send + Sync>,
        write: Box<dyn Fn(&mut I, &str) + Send + Sync>,
    },
    Ordinal {
        read: Box<dyn Fn(&I) -> u32 + Send + Sync>,
        write: Box<dyn Fn(&mut I, u32) + Send + Sync>,
        order: Vec<State>,
    },
    Custom(Arc<dyn StateAccessor<I>>),
}

#[derive(Clone, Copy)]
enum Lifecycle {
    Enter,
    Leave,
    BeforeEnter,
    AfterLeave,
}

struct CompositeDecl<I: Instance> {
    event: Event,
    members: Vec<Arc<str>>,
    lens: Arc<CompositeLens<I>>,
    options: CompositeOptions,
}

/// A binding deferred until build time, when the full state list is known.
struct AnyBinding<I: Instance> {
    event: Arc<str>,
    info: EventInfo,
    activities: Vec<Arc<dyn Activity<I>>>,
    targets: Vec<State>,
}

/// Declares states, events, bindings and the accessor, then freezes them
/// into an immutable [`StateMachine`].
///
/// Declaration order matters only where it is visible: states keep their
/// order for introspection and the ordinal accessor, and repeated bindings
/// for the same state and event append to one behavior chain. Structural
/// mistakes surface as [`MachineError::InvalidDefinition`], either at the
/// declaring call or from [`build`](Self::build).
pub struct StateMachineBuilder<I: Instance> {
    name: Arc<str>,
    states: Vec<State>,
    state_index: HashMap<Arc<str>, usize>,
    super_of: HashMap<usize, usize>,
    events: BTreeMap<Arc<str>, EventInfo>,
    bindings: HashMap<(usize, Arc<str>), Vec<Arc<dyn Activity<I>>>>,
    ignores: HashMap<(usize, Arc<str>), Option<IgnoreFilter<I>>>,
    any_bindings: Vec<AnyBinding<I>>,
    lifecycle_any: Vec<(Lifecycle, Vec<Arc<dyn Activity<I>>>)>,
    composites: Vec<CompositeDecl<I>>,
    accessor: Option<AccessorDecl<I>>,
    unhandled: Option<UnhandledEventPolicy<I>>,
    edges: Vec<GraphEdge>,
    targets: Vec<State>,
}

impl<I: Instance> StateMachineBuilder<I> {
    /// Starts a definition with the two reserved states already in place.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        let initial = State::initial();
        let final_state = State::final_state();
        let mut state_index = HashMap::new();
        state_index.insert(initial.name_arc(), 0);
        state_index.insert(final_state.name_arc(), 1);
        Self {
            name: name.into(),
            states: vec![initial, final_state],
            state_index,
            super_of: HashMap::new(),
            events: BTreeMap::new(),
            bindings: HashMap::new(),
            ignores: HashMap::new(),
            any_bindings: Vec::new(),
            lifecycle_any: Vec::new(),
            composites: Vec::new(),
            accessor: None,
            unhandled: None,
            edges: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// The reserved `Initial` state every fresh instance starts in.
    pub fn initial_state(&self) -> State {
        self.states[0].clone()
    }

    /// The reserved `Final` state [`finalize`](EventBinder::finalize)
    /// targets.
    pub fn final_state(&self) -> State {
        self.states[1].clone()
    }

    /// Declares a state.
    pub fn state(&mut self, name: &str) -> Result<State, MachineError> {
        self.declare_state(name, None)
    }

    /// Declares a state nested under `super_state`. Events the sub-state
    /// does not bind or ignore fall back to the super state.
    pub fn sub_state(&mut self, name: &str, super_state: &State) -> Result<State, MachineError> {
        let super_slot = self.state_slot(super_state)?;
        self.declare_state(name, Some(super_slot))
    }

    /// Declares a trigger event.
    pub fn event(&mut self, name: &str) -> Result<Event, MachineError> {
        self.declare_event::<NoData>(name, false)
    }

    /// Declares an event whose raises carry a `T`.
    pub fn data_event<T: Send + Sync + 'static>(
        &mut self,
        name: &str,
    ) -> Result<Event<T>, MachineError> {
        self.declare_event::<T>(name, true)
    }

    /// Declares a composite event raised automatically once every member
    /// has been observed.
    ///
    /// `read` and `write` connect the accumulation mask to a
    /// [`CompositeEventStatus`] field on the instance; each composite on a
    /// machine needs its own field. Member raises are tracked in every
    /// state `options` allows, whether or not the state binds the member
    /// itself.
    pub fn composite_event(
        &mut self,
        name: &str,
        read: impl Fn(&I) -> CompositeEventStatus + Send + Sync + 'static,
        write: impl Fn(&mut I, CompositeEventStatus) + Send + Sync + 'static,
        members: &[Event],
        options: CompositeOptions,
    ) -> Result<Event, MachineError> {
        self.check_name("event", name)?;
        if self.events.contains_key(name) {
            return Err(self.invalid(format!("event '{name}' is already declared")));
        }
        if members.is_empty() {
            return Err(self.invalid(format!(
                "composite event '{name}' needs at least one member"
            )));
        }
        if members.len() > MAX_COMPOSITE_EVENTS {
            return Err(self.invalid(format!(
                "composite event '{name}' has {} members, the maximum is {MAX_COMPOSITE_EVENTS}",
                members.len()
            )));
        }
        let mut member_names = Vec::with_capacity(members.len());
        for member in members {
            if !self.events.contains_key(member.name()) {
                return Err(self.invalid(format!(
                    "composite member '{member}' is not declared on this machine"
                )));
            }
            member_names.push(member.name_arc());
        }

        let event: Event = Event::declare_composite(name.to_string());
        let info = EventInfo::new(event.name_arc(), true, false, false);
        self.events.insert(event.name_arc(), info);
        self.composites.push(CompositeDecl {
            event: event.clone(),
            members: member_names,
            lens: Arc::new(CompositeLens::new(read, write)),
            options,
        });
        Ok(event)
    }

    /// Binds a behavior in the initial state.
    pub fn initially<T: Send + Sync + 'static>(
        &mut self,
        binder: EventBinder<I, T>,
    ) -> Result<(), MachineError> {
        let initial = self.initial_state();
        self.during(&initial, binder)
    }

    /// Binds a behavior in `state`. Binding the same event again in the
    /// same state appends to the existing chain.
    pub fn during<T: Send + Sync + 'static>(
        &mut self,
        state: &State,
        binder: EventBinder<I, T>,
    ) -> Result<(), MachineError> {
        let slot = self.state_slot(state)?;
        let (event, activities, targets) = binder.into_parts();
        let info = self.events.get(event.name()).cloned().ok_or_else(|| {
            self.invalid(format!("event '{event}' is not declared on this machine"))
        })?;
        record_edge_rows(&mut self.edges, state, &info, &targets);
        self.targets.extend(targets);
        self.bindings
            .entry((slot, event.name_arc()))
            .or_default()
            .extend(activities);
        Ok(())
    }

    /// Binds a behavior in every user-declared state. Expanded when the
    /// machine is built, so it covers states declared after this call too.
    pub fn during_any<T: Send + Sync + 'static>(
        &mut self,
        binder: EventBinder<I, T>,
    ) -> Result<(), MachineError> {
        let (event, activities, targets) = binder.into_parts();
        let info = self.events.get(event.name()).cloned().ok_or_else(|| {
            self.invalid(format!("event '{event}' is not declared on this machine"))
        })?;
        self.any_bindings.push(AnyBinding {
            event: event.name_arc(),
            info,
            activities,
            targets,
        });
        Ok(())
    }

    /// Binds a behavior to entry of the final state.
    pub fn finally(
        &mut self,
        build: impl FnOnce(EventBinder<I, NoData>) -> EventBinder<I, NoData>,
    ) -> Result<(), MachineError> {
        let final_state = self.final_state();
        self.when_enter(&final_state, build)
    }

    /// Binds a behavior to run when `state` is entered, after the state
    /// change is committed.
    pub fn when_enter(
        &mut self,
        state: &State,
        build: impl FnOnce(EventBinder<I, NoData>) -> EventBinder<I, NoData>,
    ) -> Result<(), MachineError> {
        let events = TransitionEvents::for_state(state);
        self.bind_lifecycle(state, build(when(&events.enter)))
    }

    /// Binds a behavior to run when `state` is left, after the state
    /// change is committed.
    pub fn when_leave(
        &mut self,
        state: &State,
        build: impl FnOnce(EventBinder<I, NoData>) -> EventBinder<I, NoData>,
    ) -> Result<(), MachineError> {
        let events = TransitionEvents::for_state(state);
        self.bind_lifecycle(state, build(when(&events.leave)))
    }

    /// Binds a behavior to run before `state` is entered, while the
    /// instance still reads as the old state. The bound event carries the
    /// state being entered.
    pub fn before_enter(
        &mut self,
        state: &State,
        build: impl FnOnce(EventBinder<I, State>) -> EventBinder<I, State>,
    ) -> Result<(), MachineError> {
        let events = TransitionEvents::for_state(state);
        self.bind_lifecycle(state, build(when(&events.before_enter)))
    }

    /// Binds a behavior to run right after a transition away from `state`
    /// begins, before the state change is committed. The bound event
    /// carries the state being left.
    pub fn after_leave(
        &mut self,
        state: &State,
        build: impl FnOnce(EventBinder<I, State>) -> EventBinder<I, State>,
    ) -> Result<(), MachineError> {
        let events = TransitionEvents::for_state(state);
        self.bind_lifecycle(state, build(when(&events.after_leave)))
    }

    /// [`when_enter`](Self::when_enter) applied to every state, reserved
    /// states included.
    pub fn when_enter_any(
        &mut self,
        build: impl FnOnce(EventBinder<I, NoData>) -> EventBinder<I, NoData>,
    ) -> Result<(), MachineError> {
        let seed: Event = Event::declare_transition("Enter");
        let (_, activities, targets) = build(when(&seed)).into_parts();
        self.targets.extend(targets);
        self.lifecycle_any.push((Lifecycle::Enter, activities));
        Ok(())
    }

    /// [`when_leave`](Self::when_leave) applied to every state.
    pub fn when_leave_any(
        &mut self,
        build: impl FnOnce(EventBinder<I, NoData>) -> EventBinder<I, NoData>,
    ) -> Result<(), MachineError> {
        let seed: Event = Event::declare_transition("Leave");
        let (_, activities, targets) = build(when(&seed)).into_parts();
        self.targets.extend(targets);
        self.lifecycle_any.push((Lifecycle::Leave, activities));
        Ok(())
    }

    /// [`before_enter`](Self::before_enter) applied to every state.
    pub fn before_enter_any(
        &mut self,
        build: impl FnOnce(EventBinder<I, State>) -> EventBinder<I, State>,
    ) -> Result<(), MachineError> {
        let seed: Event<State> = Event::declare_transition("BeforeEnter");
        let (_, activities, targets) = build(when(&seed)).into_parts();
        self.targets.extend(targets);
        self.lifecycle_any.push((Lifecycle::BeforeEnter, activities));
        Ok(())
    }

    /// [`after_leave`](Self::after_leave) applied to every state.
    pub fn after_leave_any(
        &mut self,
        build: impl FnOnce(EventBinder<I, State>) -> EventBinder<I, State>,
    ) -> Result<(), MachineError> {
        let seed: Event<State> = Event::declare_transition("AfterLeave");
        let (_, activities, targets) = build(when(&seed)).into_parts();
        self.targets.extend(targets);
        self.lifecycle_any.push((Lifecycle::AfterLeave, activities));
        Ok(())
    }

    /// Declares `event` as a silent no-op in `state`.
    pub fn ignore<T: Send + Sync + 'static>(
        &mut self,
        state: &State,
        event: &Event<T>,
    ) -> Result<(), MachineError> {
        let slot = self.state_slot(state)?;
        self.require_declared(event.name())?;
        self.ignores.insert((slot, event.name_arc()), None);
        Ok(())
    }

    /// [`ignore`](Self::ignore) gated on the event data. When the filter
    /// returns false, or the raise carries no data of type `T`, the rule
    /// does not apply and the event falls through as unbound.
    pub fn ignore_if<T: Send + Sync + 'static>(
        &mut self,
        state: &State,
        event: &Event<T>,
        filter: impl Fn(&I, &T) -> bool + Send + Sync + 'static,
    ) -> Result<(), MachineError> {
        let slot = self.state_slot(state)?;
        self.require_declared(event.name())?;
        let wrapped: IgnoreFilter<I> = Box::new(move |ctx| match ctx.try_data::<T>() {
            Some(data) => filter(ctx.instance(), data),
            None => false,
        });
        self.ignores.insert((slot, event.name_arc()), Some(wrapped));
        Ok(())
    }

    /// Sets the machine-wide unhandled-event policy. Assignable once.
    pub fn on_unhandled_event(
        &mut self,
        policy: UnhandledEventPolicy<I>,
    ) -> Result<(), MachineError> {
        if self.unhandled.is_some() {
            return Err(self.invalid("unhandled-event policy already set"));
        }
        self.unhandled = Some(policy);
        Ok(())
    }

    /// Stores the current state in an `Option<State>` field; `None` reads
    /// as the initial state.
    pub fn instance_state(
        &mut self,
        read: impl Fn(&I) -> Option<State> + Send + Sync + 'static,
        write: impl Fn(&mut I, State) + Send + Sync + 'static,
    ) -> Result<(), MachineError> {
        self.set_accessor(AccessorDecl::Typed {
            read: Box::new(read),
            write: Box::new(write),
        })
    }

    /// Stores the current state as its name in a string field; empty reads
    /// as the initial state.
    pub fn instance_state_name(
        &mut self,
        read: impl Fn(&I) -> &str + Send + Sync + 'static,
        write: impl Fn(&mut I, &str) + Send + Sync + 'static,
    ) -> Result<(), MachineError> {
        self.set_accessor(AccessorDecl::Name {
            read: Box::new(read),
            write: Box::new(write),
        })
    }

    /// Stores the current state as a compact ordinal in a `u32` field.
    ///
    /// `order` fixes the ordinals of the user-declared states and must
    /// list each of them exactly once; the reserved states always take
    /// ordinals 1 and 2, and zero reads as unset. Checked when the
    /// machine is built.
    pub fn instance_state_ordinal(
        &mut self,
        read: impl Fn(&I) -> u32 + Send + Sync + 'static,
        write: impl Fn(&mut I, u32) + Send + Sync + 'static,
        order: &[State],
    ) -> Result<(), MachineError> {
        self.set_accessor(AccessorDecl::Ordinal {
            read: Box::new(read),
            write: Box::new(write),
            order: order.to_vec(),
        })
    }

    /// Supplies a custom [`StateAccessor`] implementation.
    pub fn instance_state_accessor(
        &mut self,
        accessor: impl StateAccessor<I> + 'static,
    ) -> Result<(), MachineError> {
        self.set_accessor(AccessorDecl::Custom(Arc::new(accessor)))
    }

    /// Freezes the definition into a runnable machine.
    pub fn build(self) -> Result<StateMachine<I>, MachineError> {
        let Self {
            name,
            states,
            state_index,
            super_of,
            events,
            mut bindings,
            ignores,
            any_bindings,
            lifecycle_any,
            composites,
            accessor,
            unhandled,
            mut edges,
            mut targets,
        } = self;

        let invalid = |reason: String| MachineError::InvalidDefinition {
            machine: name.to_string(),
            reason,
        };

        let accessor_decl =
            accessor.ok_or_else(|| invalid("no state accessor declared".to_string()))?;

        for binding in any_bindings {
            targets.extend(binding.targets.iter().cloned());
            for slot in 2..states.len() {
                record_edge_rows(&mut edges, &states[slot], &binding.info, &binding.targets);
                bindings
                    .entry((slot, Arc::clone(&binding.event)))
                    .or_default()
                    .extend(binding.activities.iter().cloned());
            }
        }

        for (lifecycle, activities) in lifecycle_any {
            for (slot, state) in states.iter().enumerate() {
                let sub = TransitionEvents::for_state(state);
                let key = match lifecycle {
                    Lifecycle::Enter => sub.enter.name_arc(),
                    Lifecycle::Leave => sub.leave.name_arc(),
                    Lifecycle::BeforeEnter => sub.before_enter.name_arc(),
                    Lifecycle::AfterLeave => sub.after_leave.name_arc(),
                };
                bindings
                    .entry((slot, key))
                    .or_default()
                    .extend(activities.iter().cloned());
            }
        }

        for composite in composites {
            let complete = CompositeEventStatus::new((1u32 << composite.members.len()) - 1);
            for (position, member) in composite.members.iter().enumerate() {
                let flag = CompositeEventStatus::new(1 << position);
                for slot in 0..states.len() {
                    if slot == 0 && !composite.options.include_initial {
                        continue;
                    }
                    if slot == 1 && !composite.options.include_final {
                        continue;
                    }
                    let tracker: Arc<dyn Activity<I>> = Arc::new(CompositeEventActivity::new(
                        flag,
                        complete,
                        composite.event.clone(),
                        Arc::clone(&composite.lens),
                    ));
                    bindings
                        .entry((slot, Arc::clone(member)))
                        .or_default()
                        .push(tracker);
                }
            }
        }

        for target in &targets {
            if !state_index.contains_key(target.name()) {
                return Err(invalid(format!(
                    "transition target '{target}' is not a declared state"
                )));
            }
        }

        let table = Arc::new(StateTable::new(states));
        let mut nodes: Vec<StateNode<I>> = table
            .states()
            .iter()
            .enumerate()
            .map(|(slot, state)| {
                StateNode::new(
                    state.clone(),
                    TransitionEvents::for_state(state),
                    super_of.get(&slot).copied(),
                )
            })
            .collect();

        for ((slot, event), activities) in bindings {
            nodes[slot].bind(event, Behavior::new(activities));
        }
        for ((slot, event), filter) in ignores {
            nodes[slot].add_ignore(event, filter);
        }

        let accessor: Arc<dyn StateAccessor<I>> = match accessor_decl {
            AccessorDecl::Typed { read, write } => {
                Arc::new(TypedStateAccessor::new(read, write, table.initial().clone()))
            }
            AccessorDecl::Name { read, write } => Arc::new(NameStateAccessor::new(
                read,
                write,
                Arc::clone(&table),
                Arc::clone(&name),
            )),
            AccessorDecl::Ordinal { read, write, order } => {
                let mut remaining: BTreeSet<&str> = table
                    .states()
                    .iter()
                    .skip(2)
                    .map(|state| state.name())
                    .collect();
                for state in &order {
                    if state.is_initial() || state.is_final() {
                        return Err(invalid(format!(
                            "ordinal order must not list reserved state '{state}'"
                        )));
                    }
                    if !remaining.remove(state.name()) {
                        return Err(invalid(format!(
                            "ordinal order lists unknown or duplicate state '{state}'"
                        )));
                    }
                }
                if let Some(missing) = remaining.into_iter().next() {
                    return Err(invalid(format!(
                        "ordinal order is missing declared state '{missing}'"
                    )));
                }
                Arc::new(OrdinalStateAccessor::new(
                    read,
                    write,
                    &table,
                    order,
                    Arc::clone(&name),
                ))
            }
            AccessorDecl::Custom(custom) => custom,
        };

        tracing::info!(
            "built state machine '{}': {} states, {} events",
            name,
            table.states().len(),
            events.len()
        );

        Ok(StateMachine::from_parts(MachineParts {
            name,
            table,
            nodes,
            events,
            accessor,
            unhandled: unhandled.unwrap_or_default(),
            edges,
        }))
    }

    fn declare_state(
        &mut self,
        name: &str,
        super_slot: Option<usize>,
    ) -> Result<State, MachineError> {
        self.check_name("state", name)?;
        if self.state_index.contains_key(name) {
            return Err(self.invalid(format!("state '{name}' is already declared")));
        }
        let state = State::new(name.to_string());
        let slot = self.states.len();
        self.state_index.insert(state.name_arc(), slot);
        self.states.push(state.clone());
        if let Some(super_slot) = super_slot {
            self.super_of.insert(slot, super_slot);
        }
        Ok(state)
    }

    fn declare_event<T: Send + Sync + 'static>(
        &mut self,
        name: &str,
        has_data: bool,
    ) -> Result<Event<T>, MachineError> {
        self.check_name("event", name)?;
        if self.events.contains_key(name) {
            return Err(self.invalid(format!("event '{name}' is already declared")));
        }
        let event: Event<T> = Event::declare(name.to_string());
        let info = EventInfo::new(event.name_arc(), false, false, has_data);
        self.events.insert(event.name_arc(), info);
        Ok(event)
    }

    fn bind_lifecycle<T: Send + Sync + 'static>(
        &mut self,
        state: &State,
        binder: EventBinder<I, T>,
    ) -> Result<(), MachineError> {
        let slot = self.state_slot(state)?;
        let (event, activities, targets) = binder.into_parts();
        self.targets.extend(targets);
        self.bindings
            .entry((slot, event.name_arc()))
            .or_default()
            .extend(activities);
        Ok(())
    }

    fn set_accessor(&mut self, decl: AccessorDecl<I>) -> Result<(), MachineError> {
        if self.accessor.is_some() {
            return Err(self.invalid("state accessor already declared"));
        }
        self.accessor = Some(decl);
        Ok(())
    }

    fn state_slot(&self, state: &State) -> Result<usize, MachineError> {
        self.state_index.get(state.name()).copied().ok_or_else(|| {
            self.invalid(format!("state '{state}' is not declared on this machine"))
        })
    }

    fn require_declared(&self, event: &str) -> Result<(), MachineError> {
        if self.events.contains_key(event) {
            Ok(())
        } else {
            Err(self.invalid(format!("event '{event}' is not declared on this machine")))
        }
    }

    fn check_name(&self, kind: &str, name: &str) -> Result<(), MachineError> {
        if name.is_empty() {
            return Err(self.invalid(format!("{kind} name must not be empty")));
        }
        // The dot separates a state name from its transition sub-events.
        if name.contains('.') {
            return Err(self.invalid(format!("{kind} name '{name}' must not contain '.'")));
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> MachineError {
        MachineError::InvalidDefinition {
            machine: self.name.to_string(),
            reason: reason.into(),
        }
    }
}

fn record_edge_rows(
    edges: &mut Vec<GraphEdge>,
    state: &State,
    info: &EventInfo,
    targets: &[State],
) {
    if targets.is_empty() {
        edges.push(GraphEdge {
            state: state.clone(),
            event: info.clone(),
            target: None,
        });
        return;
    }
    for target in targets {
        edges.push(GraphEdge {
            state: state.clone(),
            event: info.clone(),
            target: Some(target.clone()),
        });
    }
}
