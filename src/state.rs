//! State identity tokens and the runtime state nodes they resolve to.

use crate::behavior::Behavior;
use crate::context::EventContext;
use crate::event::{Event, EventMessage};
use crate::machine::Instance;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub(crate) const INITIAL_STATE: &str = "Initial";
pub(crate) const FINAL_STATE: &str = "Final";

/// A state identity token declared on a machine.
///
/// Like events, states are value types: equality, ordering and hashing go by
/// name, and a token deserialized from a persisted name compares equal to
/// the machine's own token. Every machine owns two reserved states named
/// `Initial` and `Final`.
///
/// Serde support writes the bare name, so a host instance that keeps its
/// current state in an `Option<State>` field round-trips through any serde
/// format as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct State {
    name: Arc<str>,
}

impl State {
    pub(crate) fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }

    pub(crate) fn initial() -> Self {
        Self::new(INITIAL_STATE)
    }

    pub(crate) fn final_state() -> Self {
        Self::new(FINAL_STATE)
    }

    /// The state name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Whether this is the reserved `Initial` state.
    pub fn is_initial(&self) -> bool {
        &*self.name == INITIAL_STATE
    }

    /// Whether this is the reserved `Final` state.
    pub fn is_final(&self) -> bool {
        &*self.name == FINAL_STATE
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Serialize for State {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for State {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(State::new(name))
    }
}

/// The four transition sub-events owned by one state.
///
/// Named after the state (`Running.Enter`, `Running.Leave`, and so on).
/// `BeforeEnter` and `AfterLeave` carry the owning state as event data so a
/// handler bound across all states can tell which state it fired for.
pub(crate) struct TransitionEvents {
    pub(crate) enter: Event,
    pub(crate) leave: Event,
    pub(crate) before_enter: Event<State>,
    pub(crate) after_leave: Event<State>,
}

impl TransitionEvents {
    pub(crate) fn for_state(state: &State) -> Self {
        Self {
            enter: Event::declare_transition(format!("{}.Enter", state.name())),
            leave: Event::declare_transition(format!("{}.Leave", state.name())),
            before_enter: Event::declare_transition(format!("{}.BeforeEnter", state.name())),
            after_leave: Event::declare_transition(format!("{}.AfterLeave", state.name())),
        }
    }
}

/// Frozen name-to-state registry shared by the machine and its accessors.
///
/// Slot 0 is always `Initial` and slot 1 always `Final`; declared states
/// follow in declaration order, aligned with the machine's node arena.
pub(crate) struct StateTable {
    states: Vec<State>,
    index: HashMap<Arc<str>, usize>,
}

impl StateTable {
    pub(crate) fn new(states: Vec<State>) -> Self {
        let index = states
            .iter()
            .enumerate()
            .map(|(i, state)| (state.name_arc(), i))
            .collect();
        Self { states, index }
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<&State> {
        self.index.get(name).map(|&i| &self.states[i])
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub(crate) fn initial(&self) -> &State {
        &self.states[0]
    }

    pub(crate) fn final_state(&self) -> &State {
        &self.states[1]
    }

    pub(crate) fn states(&self) -> &[State] {
        &self.states
    }
}

/// Per-event ignore filter; `false` means the rule does not apply and the
/// event falls through as unbound.
pub(crate) type IgnoreFilter<I> = Box<dyn Fn(&EventContext<'_, I>) -> bool + Send + Sync>;

/// Runtime node for one state: bound behaviors, ignore rules and the link to
/// an optional super state.
pub(crate) struct StateNode<I: Instance> {
    state: State,
    events: TransitionEvents,
    behaviors: HashMap<Arc<str>, Behavior<I>>,
    ignores: HashMap<Arc<str>, Option<IgnoreFilter<I>>>,
    super_state: Option<usize>,
}

impl<I: Instance> StateNode<I> {
    /// Creates an empty node. The four transition sub-events start out
    /// ignored on their own state, so an unbound `Enter` or `Leave` raised
    /// during a transition is a silent no-op rather than an unhandled event;
    /// a binding added later takes precedence because bindings are checked
    /// before ignore rules.
    pub(crate) fn new(state: State, events: TransitionEvents, super_state: Option<usize>) -> Self {
        let mut ignores: HashMap<Arc<str>, Option<IgnoreFilter<I>>> = HashMap::new();
        ignores.insert(events.enter.name_arc(), None);
        ignores.insert(events.leave.name_arc(), None);
        ignores.insert(events.before_enter.name_arc(), None);
        ignores.insert(events.after_leave.name_arc(), None);

        Self {
            state,
            events,
            behaviors: HashMap::new(),
            ignores,
            super_state,
        }
    }

    pub(crate) fn state(&self) -> &State {
        &self.state
    }

    pub(crate) fn super_index(&self) -> Option<usize> {
        self.super_state
    }

    pub(crate) fn bind(&mut self, event: Arc<str>, behavior: Behavior<I>) {
        self.behaviors.insert(event, behavior);
    }

    pub(crate) fn add_ignore(&mut self, event: Arc<str>, filter: Option<IgnoreFilter<I>>) {
        self.ignores.insert(event, filter);
    }

    pub(crate) fn behavior(&self, event: &str) -> Option<&Behavior<I>> {
        self.behaviors.get(event)
    }

    /// `Some(true)` ignore applies, `Some(false)` a filter rejected it,
    /// `None` no rule for this event.
    pub(crate) fn ignore_disposition(&self, ctx: &EventContext<'_, I>) -> Option<bool> {
        match self.ignores.get(ctx.event()) {
            Some(Some(filter)) => Some(filter(ctx)),
            Some(None) => Some(true),
            None => None,
        }
    }

    pub(crate) fn bound_events(&self) -> impl Iterator<Item = &Arc<str>> {
        self.behaviors.keys()
    }

    pub(crate) fn ignored_events(&self) -> impl Iterator<Item = &Arc<str>> {
        self.ignores.keys()
    }

    pub(crate) fn enter_message(&self) -> EventMessage {
        EventMessage::trigger(&self.events.enter)
    }

    pub(crate) fn leave_message(&self) -> EventMessage {
        EventMessage::trigger(&self.events.leave)
    }

    pub(crate) fn before_enter_message(&self) -> EventMessage {
        EventMessage::with_data(&self.events.before_enter, self.state.clone())
    }

    pub(crate) fn after_leave_message(&self) -> EventMessage {
        EventMessage::with_data(&self.events.after_leave, self.state.clone())
    }
}
