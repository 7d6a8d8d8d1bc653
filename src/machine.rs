//! The frozen machine definition and its dispatch runtime.

use crate::accessor::StateAccessor;
use crate::activity::TransitionActivity;
use crate::behavior::{Behavior, FaultDisposition};
use crate::context::{EventContext, RaiseOptions};
use crate::error::MachineError;
use crate::event::{Event, EventInfo, EventMessage};
use crate::observe::{EventObserver, ObserverHandle, ObserverScope, ObserverSet, StateObserver};
use crate::state::{State, StateNode, StateTable};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Marker for host instance types a machine can drive.
///
/// Blanket-implemented for every `Send + Sync + 'static` type; hosts never
/// implement it by hand.
pub trait Instance: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Instance for T {}

type UnhandledCallback<I> =
    Box<dyn Fn(&mut EventContext<'_, I>, &State) -> Result<(), MachineError> + Send + Sync>;

/// What a machine does with a raised event that no binding, ignore rule or
/// super-state claims.
pub enum UnhandledEventPolicy<I: Instance> {
    /// Fail the raise with [`MachineError::UnhandledEvent`].
    Error,
    /// Log at debug level and discard.
    Ignore,
    /// Delegate to a host callback, which receives the dispatch context and
    /// the state the dispatch started in.
    Custom(UnhandledCallback<I>),
}

impl<I: Instance> Default for UnhandledEventPolicy<I> {
    fn default() -> Self {
        Self::Error
    }
}

impl<I: Instance> fmt::Debug for UnhandledEventPolicy<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => f.write_str("Error"),
            Self::Ignore => f.write_str("Ignore"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// One row of the declaration-time transition graph, as recorded from the
/// builder's `initially` / `during` / `during_any` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    /// State the binding was declared on.
    pub state: State,
    /// The bound event.
    pub event: EventInfo,
    /// Declared transition target; `None` for bindings that stay put.
    pub target: Option<State>,
}

pub(crate) struct MachineParts<I: Instance> {
    pub(crate) name: Arc<str>,
    pub(crate) table: Arc<StateTable>,
    pub(crate) nodes: Vec<StateNode<I>>,
    pub(crate) events: BTreeMap<Arc<str>, EventInfo>,
    pub(crate) accessor: Arc<dyn StateAccessor<I>>,
    pub(crate) unhandled: UnhandledEventPolicy<I>,
    pub(crate) edges: Vec<GraphEdge>,
}

/// A frozen state machine for host instances of type `I`.
///
/// Built once by [`StateMachineBuilder`](crate::StateMachineBuilder) and
/// immutable afterwards: the state/event registries and behavior tables are
/// read without locks, so one machine drives any number of instances
/// concurrently. All per-instance data (current state, composite tracking
/// bits) lives on the instances themselves, reached through the accessor.
///
/// Overlapping raises against the *same* instance are not serialized here;
/// a caller that needs at-most-one-in-flight per instance supplies its own
/// locking.
pub struct StateMachine<I: Instance> {
    name: Arc<str>,
    table: Arc<StateTable>,
    nodes: Vec<StateNode<I>>,
    events: BTreeMap<Arc<str>, EventInfo>,
    accessor: Arc<dyn StateAccessor<I>>,
    unhandled: UnhandledEventPolicy<I>,
    edges: Vec<GraphEdge>,
    state_observers: ObserverSet<Arc<dyn StateObserver<I>>>,
    event_observers: ObserverSet<(ObserverScope, Arc<dyn EventObserver<I>>)>,
}

impl<I: Instance> StateMachine<I> {
    pub(crate) fn from_parts(parts: MachineParts<I>) -> Self {
        Self {
            name: parts.name,
            table: parts.table,
            nodes: parts.nodes,
            events: parts.events,
            accessor: parts.accessor,
            unhandled: parts.unhandled,
            edges: parts.edges,
            state_observers: ObserverSet::new(),
            event_observers: ObserverSet::new(),
        }
    }

    /// The machine name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raises a trigger event on an instance and drives the bound behavior
    /// to completion.
    pub async fn raise_event(&self, instance: &mut I, event: &Event) -> Result<(), MachineError> {
        self.raise_message(instance, EventMessage::trigger(event), RaiseOptions::new())
            .await
    }

    /// [`raise_event`](Self::raise_event) with a cancellation token and
    /// payloads attached.
    pub async fn raise_event_opts(
        &self,
        instance: &mut I,
        event: &Event,
        options: RaiseOptions,
    ) -> Result<(), MachineError> {
        self.raise_message(instance, EventMessage::trigger(event), options)
            .await
    }

    /// Raises a data-carrying event on an instance.
    pub async fn raise_event_with<T: Send + Sync + 'static>(
        &self,
        instance: &mut I,
        event: &Event<T>,
        data: T,
    ) -> Result<(), MachineError> {
        self.raise_message(instance, EventMessage::with_data(event, data), RaiseOptions::new())
            .await
    }

    /// [`raise_event_with`](Self::raise_event_with) with a cancellation
    /// token and payloads attached.
    pub async fn raise_event_with_opts<T: Send + Sync + 'static>(
        &self,
        instance: &mut I,
        event: &Event<T>,
        data: T,
        options: RaiseOptions,
    ) -> Result<(), MachineError> {
        self.raise_message(instance, EventMessage::with_data(event, data), options)
            .await
    }

    async fn raise_message(
        &self,
        instance: &mut I,
        message: EventMessage,
        options: RaiseOptions,
    ) -> Result<(), MachineError> {
        let ctx = EventContext::new(
            self,
            instance,
            &message,
            &options.cancellation,
            &options.payloads,
        );
        self.raise_nested(ctx).await
    }

    /// Dispatches an already-built context; nested raises from inside
    /// activities re-enter here.
    pub(crate) async fn raise_nested(&self, ctx: EventContext<'_, I>) -> Result<(), MachineError> {
        self.require_event(ctx.event())?;
        let state = self.accessor.get(ctx.instance()).await?;
        let node = self.node_index(&state)?;
        tracing::debug!(
            "raising '{}' on machine '{}' in state '{}'",
            ctx.event(),
            self.name,
            state
        );
        self.dispatch_on_node(node, ctx).await
    }

    /// Runs one dispatch against a node with observer notifications around
    /// it.
    async fn dispatch_on_node(
        &self,
        node: usize,
        mut ctx: EventContext<'_, I>,
    ) -> Result<(), MachineError> {
        self.notify_pre(&ctx);
        let result = self.raise_on_node(node, ctx.reborrow()).await;
        match &result {
            Ok(()) => self.notify_post(&ctx),
            Err(error) => {
                tracing::warn!("event '{}' faulted: {}", ctx.event(), error);
                self.notify_fault(&ctx, error);
            }
        }
        result
    }

    /// Resolves the behavior for the context's event, walking the
    /// super-state chain, and falls back to the unhandled-event policy.
    async fn raise_on_node(
        &self,
        start: usize,
        ctx: EventContext<'_, I>,
    ) -> Result<(), MachineError> {
        let mut current = Some(start);
        while let Some(idx) = current {
            let node = &self.nodes[idx];
            if let Some(behavior) = node.behavior(ctx.event()) {
                return self.run_behavior(behavior, ctx).await;
            }
            match node.ignore_disposition(&ctx) {
                Some(true) => {
                    tracing::debug!(
                        "ignoring event '{}' in state '{}'",
                        ctx.event(),
                        node.state()
                    );
                    return Ok(());
                }
                _ => current = node.super_index(),
            }
        }
        self.apply_unhandled(start, ctx).await
    }

    /// Executes a behavior; on failure, walks its faulted path once and
    /// maps the disposition back onto the original error.
    async fn run_behavior(
        &self,
        behavior: &Behavior<I>,
        mut ctx: EventContext<'_, I>,
    ) -> Result<(), MachineError> {
        match behavior.execute(ctx.reborrow()).await {
            Ok(()) => Ok(()),
            Err(error) => match behavior.faulted(ctx.with_error(&error)).await? {
                FaultDisposition::Handled => Ok(()),
                FaultDisposition::Propagate => Err(error),
            },
        }
    }

    async fn apply_unhandled(
        &self,
        start: usize,
        mut ctx: EventContext<'_, I>,
    ) -> Result<(), MachineError> {
        let state = self.nodes[start].state().clone();
        match &self.unhandled {
            UnhandledEventPolicy::Error => Err(MachineError::UnhandledEvent {
                machine: self.name.to_string(),
                event: ctx.event().to_string(),
                state: state.name().to_string(),
            }),
            UnhandledEventPolicy::Ignore => {
                tracing::debug!(
                    "discarding unhandled event '{}' in state '{}'",
                    ctx.event(),
                    state
                );
                Ok(())
            }
            UnhandledEventPolicy::Custom(callback) => callback(&mut ctx, &state),
        }
    }

    /// Moves the context's instance to `target`, firing the transition
    /// lifecycle: `AfterLeave` on the old state, `BeforeEnter` on the new,
    /// the accessor write, `Leave` on the old, `Enter` on the new, then one
    /// state-changed notification. A transition to the state the instance
    /// is already in is a genuine no-op.
    pub(crate) async fn perform_transition(
        &self,
        ctx: &mut EventContext<'_, I>,
        target: &State,
    ) -> Result<(), MachineError> {
        let current = self.accessor.get(ctx.instance()).await?;
        if current == *target {
            tracing::debug!("instance already in state '{}', transition skipped", target);
            return Ok(());
        }
        let from = self.node_index(&current)?;
        let to = self.node_index(target)?;
        tracing::debug!(
            "transitioning '{}' -> '{}' on machine '{}'",
            current,
            target,
            self.name
        );

        let after_leave = self.nodes[from].after_leave_message();
        self.dispatch_on_node(from, ctx.proxy(&after_leave)).await?;

        let before_enter = self.nodes[to].before_enter_message();
        self.dispatch_on_node(to, ctx.proxy(&before_enter)).await?;

        self.accessor.set(ctx.instance_mut(), target.clone()).await?;

        let leave = self.nodes[from].leave_message();
        self.dispatch_on_node(from, ctx.proxy(&leave)).await?;

        let enter = self.nodes[to].enter_message();
        self.dispatch_on_node(to, ctx.proxy(&enter)).await?;

        self.notify_state_changed(ctx.instance(), &current, target);
        Ok(())
    }

    /// Forces an instance into `target` outside normal event flow, running
    /// the full transition lifecycle.
    pub async fn transition_to_state(
        &self,
        instance: &mut I,
        target: &State,
    ) -> Result<(), MachineError> {
        let node = self.node_index(target)?;
        tracing::debug!(
            "forcing transition to '{}' on machine '{}'",
            target,
            self.name
        );
        let message = self.nodes[node].enter_message();
        let options = RaiseOptions::new();
        let behavior = Behavior::single(Arc::new(TransitionActivity::new(target.clone())));
        let mut ctx = EventContext::new(
            self,
            instance,
            &message,
            &options.cancellation,
            &options.payloads,
        );
        self.notify_pre(&ctx);
        let result = self.run_behavior(&behavior, ctx.reborrow()).await;
        match &result {
            Ok(()) => self.notify_post(&ctx),
            Err(error) => self.notify_fault(&ctx, error),
        }
        result
    }

    /// The instance's current state via the accessor; unset reads as
    /// Initial.
    pub async fn state_of(&self, instance: &I) -> Result<State, MachineError> {
        self.accessor.get(instance).await
    }

    /// Resolves a persisted state name. The empty string resolves to
    /// Initial, completing the name round-trip for hosts that serialize
    /// state as a string.
    pub fn state(&self, name: &str) -> Result<State, MachineError> {
        if name.is_empty() {
            return Ok(self.table.initial().clone());
        }
        self.table
            .resolve(name)
            .cloned()
            .ok_or_else(|| MachineError::UnknownState {
                machine: self.name.to_string(),
                state: name.to_string(),
            })
    }

    /// The reserved initial state.
    pub fn initial_state(&self) -> State {
        self.table.initial().clone()
    }

    /// The reserved final state.
    pub fn final_state(&self) -> State {
        self.table.final_state().clone()
    }

    /// All states in declaration order, starting with Initial and Final.
    pub fn states(&self) -> &[State] {
        self.table.states()
    }

    /// All declared events sorted by name; transition sub-events are not
    /// part of the public registry.
    pub fn events(&self) -> Vec<EventInfo> {
        self.events
            .values()
            .filter(|info| !info.is_transition_event())
            .cloned()
            .collect()
    }

    /// Events the instance can currently respond to: bound or ignored in
    /// its state or any super state, sorted by name, transition sub-events
    /// excluded.
    pub async fn next_events(&self, instance: &I) -> Result<Vec<EventInfo>, MachineError> {
        let state = self.accessor.get(instance).await?;
        let mut node = Some(self.node_index(&state)?);
        let mut names: BTreeSet<&Arc<str>> = BTreeSet::new();
        while let Some(idx) = node {
            names.extend(self.nodes[idx].bound_events());
            names.extend(self.nodes[idx].ignored_events());
            node = self.nodes[idx].super_index();
        }
        Ok(names
            .into_iter()
            .filter_map(|name| self.events.get(&**name))
            .filter(|info| !info.is_transition_event())
            .cloned()
            .collect())
    }

    /// The declaration-time transition graph rows.
    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Registers a state-changed observer; returns the handle to
    /// disconnect it.
    pub fn connect_state_observer(&self, observer: Arc<dyn StateObserver<I>>) -> ObserverHandle {
        self.state_observers.connect(observer)
    }

    pub fn disconnect_state_observer(&self, handle: ObserverHandle) -> bool {
        self.state_observers.disconnect(handle)
    }

    /// Registers an event observer for host-raised events (transition
    /// sub-events excluded).
    pub fn connect_event_observer(&self, observer: Arc<dyn EventObserver<I>>) -> ObserverHandle {
        self.connect_event_observer_scoped(ObserverScope::Public, observer)
    }

    /// Registers an event observer with an explicit scope.
    pub fn connect_event_observer_scoped(
        &self,
        scope: ObserverScope,
        observer: Arc<dyn EventObserver<I>>,
    ) -> ObserverHandle {
        self.event_observers.connect((scope, observer))
    }

    pub fn disconnect_event_observer(&self, handle: ObserverHandle) -> bool {
        self.event_observers.disconnect(handle)
    }

    fn require_event(&self, event: &str) -> Result<(), MachineError> {
        if self.events.contains_key(event) {
            Ok(())
        } else {
            Err(MachineError::UnknownEvent {
                machine: self.name.to_string(),
                event: event.to_string(),
            })
        }
    }

    fn node_index(&self, state: &State) -> Result<usize, MachineError> {
        self.table
            .index_of(state.name())
            .ok_or_else(|| MachineError::UnknownState {
                machine: self.name.to_string(),
                state: state.name().to_string(),
            })
    }

    fn notify_pre(&self, ctx: &EventContext<'_, I>) {
        if self.event_observers.is_empty() {
            return;
        }
        let transition = ctx.message().is_transition_event();
        for (scope, observer) in self.event_observers.snapshot() {
            if scope.matches(ctx.event(), transition) {
                observer.pre_execute(ctx.instance(), ctx.event());
            }
        }
    }

    fn notify_post(&self, ctx: &EventContext<'_, I>) {
        if self.event_observers.is_empty() {
            return;
        }
        let transition = ctx.message().is_transition_event();
        for (scope, observer) in self.event_observers.snapshot() {
            if scope.matches(ctx.event(), transition) {
                observer.post_execute(ctx.instance(), ctx.event());
            }
        }
    }

    fn notify_fault(&self, ctx: &EventContext<'_, I>, error: &MachineError) {
        if self.event_observers.is_empty() {
            return;
        }
        let transition = ctx.message().is_transition_event();
        for (scope, observer) in self.event_observers.snapshot() {
            if scope.matches(ctx.event(), transition) {
                observer.execute_fault(ctx.instance(), ctx.event(), error);
            }
        }
    }

    fn notify_state_changed(&self, instance: &I, previous: &State, current: &State) {
        for observer in self.state_observers.snapshot() {
            observer.state_changed(instance, previous, current);
        }
    }
}

impl<I: Instance> fmt::Debug for StateMachine<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("states", &self.table.states().len())
            .field("events", &self.events.len())
            .finish()
    }
}
