//! Event binders: the fluent surface that composes activities into the
//! behavior bound to an event.

use crate::activity::{
    ConditionActivity, ExceptionHandler, ThenActivity, TransitionActivity, TryActivity,
};
use crate::behavior::{Activity, Behavior};
use crate::context::EventContext;
use crate::error::{ActivityError, MachineError};
use crate::event::{Event, NoData};
use crate::machine::Instance;
use crate::state::State;
use futures::future::BoxFuture;
use futures::{FutureExt, TryFutureExt};
use std::error::Error as StdError;
use std::sync::Arc;

/// Starts a binder for `event`. The binder is handed to
/// [`initially`](crate::StateMachineBuilder::initially) or
/// [`during`](crate::StateMachineBuilder::during) once composed.
pub fn when<I: Instance, T: Send + Sync + 'static>(event: &Event<T>) -> EventBinder<I, T> {
    EventBinder {
        event: event.clone(),
        activities: Vec::new(),
        targets: Vec::new(),
    }
}

/// An event plus the ordered activities to run when it fires.
///
/// Combinators consume and return the binder, so bindings read as one
/// chained expression:
///
/// `when(&deposit).then_data(|acct, amount| acct.balance += amount).transition_to(&open)`
pub struct EventBinder<I: Instance, T = NoData> {
    event: Event<T>,
    activities: Vec<Arc<dyn Activity<I>>>,
    targets: Vec<State>,
}

impl<I: Instance, T: Send + Sync + 'static> EventBinder<I, T> {
    /// Runs a synchronous mutation of the instance.
    pub fn then(mut self, call: impl Fn(&mut I) + Send + Sync + 'static) -> Self {
        self.activities.push(Arc::new(ThenActivity::sync(move |ctx| {
            call(ctx.instance_mut());
            Ok(())
        })));
        self
    }

    /// Runs a synchronous mutation with the event data alongside.
    pub fn then_data(mut self, call: impl Fn(&mut I, &T) + Send + Sync + 'static) -> Self {
        self.activities.push(Arc::new(ThenActivity::sync(move |ctx| {
            let (instance, data) = ctx.split_data::<T>()?;
            call(instance, data);
            Ok(())
        })));
        self
    }

    /// Runs a synchronous callback with the full dispatch context.
    pub fn then_ctx(
        mut self,
        call: impl Fn(&mut EventContext<'_, I>) + Send + Sync + 'static,
    ) -> Self {
        self.activities.push(Arc::new(ThenActivity::sync(move |ctx| {
            call(ctx);
            Ok(())
        })));
        self
    }

    /// Runs a fallible callback; its error faults the dispatch and can be
    /// caught by [`try_handle`](Self::try_handle).
    pub fn then_try(
        mut self,
        call: impl Fn(&mut EventContext<'_, I>) -> Result<(), ActivityError> + Send + Sync + 'static,
    ) -> Self {
        self.activities.push(Arc::new(ThenActivity::sync(move |ctx| {
            call(ctx).map_err(MachineError::activity)
        })));
        self
    }

    /// Runs an asynchronous callback. The closure receives the context by
    /// value and returns a boxed future borrowing from it.
    pub fn then_async(
        mut self,
        call: impl for<'a> Fn(EventContext<'a, I>) -> BoxFuture<'a, Result<(), ActivityError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.activities.push(Arc::new(ThenActivity::future(move |ctx| {
            call(ctx).map_err(MachineError::activity).boxed()
        })));
        self
    }

    /// Moves the instance to `target`, firing the transition lifecycle.
    pub fn transition_to(mut self, target: &State) -> Self {
        self.targets.push(target.clone());
        self.activities
            .push(Arc::new(TransitionActivity::new(target.clone())));
        self
    }

    /// Moves the instance to the final state.
    pub fn finalize(self) -> Self {
        let target = State::final_state();
        self.transition_to(&target)
    }

    /// Runs a nested chain when `condition` holds, then continues with the
    /// rest of this chain either way.
    pub fn if_then(
        mut self,
        condition: impl Fn(&EventContext<'_, I>) -> bool + Send + Sync + 'static,
        build: impl FnOnce(EventBinder<I, T>) -> EventBinder<I, T>,
    ) -> Self {
        let (_, activities, targets) = build(when(&self.event)).into_parts();
        self.targets.extend(targets);
        self.activities.push(Arc::new(ConditionActivity::sync(
            condition,
            Behavior::new(activities),
        )));
        self
    }

    /// [`if_then`](Self::if_then) with an asynchronous condition.
    pub fn if_then_async(
        mut self,
        condition: impl for<'a> Fn(&'a EventContext<'a, I>) -> BoxFuture<'a, bool>
            + Send
            + Sync
            + 'static,
        build: impl FnOnce(EventBinder<I, T>) -> EventBinder<I, T>,
    ) -> Self {
        let (_, activities, targets) = build(when(&self.event)).into_parts();
        self.targets.extend(targets);
        self.activities.push(Arc::new(ConditionActivity::future(
            condition,
            Behavior::new(activities),
        )));
        self
    }

    /// Guards a nested chain with typed exception handlers.
    ///
    /// `build` composes the guarded chain; `handlers` registers catch arms
    /// via [`HandlerSet::handle`]. A fault matched by an arm runs that arm
    /// and the dispatch then continues past the guard.
    pub fn try_handle(
        mut self,
        build: impl FnOnce(EventBinder<I, T>) -> EventBinder<I, T>,
        handlers: impl FnOnce(HandlerSet<I, T>) -> HandlerSet<I, T>,
    ) -> Self {
        let (_, activities, inner_targets) = build(when(&self.event)).into_parts();
        self.targets.extend(inner_targets);
        let (arms, arm_targets) = handlers(HandlerSet::new(self.event.clone())).into_parts();
        self.targets.extend(arm_targets);
        self.activities
            .push(Arc::new(TryActivity::new(Behavior::new(activities), arms)));
        self
    }

    /// Appends a custom activity.
    pub fn activity(mut self, activity: impl Activity<I> + 'static) -> Self {
        self.activities.push(Arc::new(activity));
        self
    }

    pub(crate) fn into_parts(self) -> (Event<T>, Vec<Arc<dyn Activity<I>>>, Vec<State>) {
        (self.event, self.activities, self.targets)
    }
}

/// Catch arms for [`EventBinder::try_handle`], tried in registration order.
pub struct HandlerSet<I: Instance, T = NoData> {
    event: Event<T>,
    arms: Vec<ExceptionHandler<I>>,
    targets: Vec<State>,
}

impl<I: Instance, T: Send + Sync + 'static> HandlerSet<I, T> {
    fn new(event: Event<T>) -> Self {
        Self {
            event,
            arms: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// Catches faults whose source downcasts to `E`.
    pub fn handle<E>(
        mut self,
        build: impl FnOnce(EventBinder<I, T>) -> EventBinder<I, T>,
    ) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let (_, activities, targets) = build(when(&self.event)).into_parts();
        self.targets.extend(targets);
        self.arms.push(ExceptionHandler::new(
            |error: &MachineError| error.downcast_ref::<E>().is_some(),
            Behavior::new(activities),
        ));
        self
    }

    /// Catches any fault.
    pub fn handle_any(
        mut self,
        build: impl FnOnce(EventBinder<I, T>) -> EventBinder<I, T>,
    ) -> Self {
        let (_, activities, targets) = build(when(&self.event)).into_parts();
        self.targets.extend(targets);
        self.arms
            .push(ExceptionHandler::new(|_| true, Behavior::new(activities)));
        self
    }

    fn into_parts(self) -> (Vec<ExceptionHandler<I>>, Vec<State>) {
        (self.arms, self.targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Cart {
        items: u32,
    }

    #[test]
    fn test_binder_composes_in_order() {
        let add: Event<u32> = Event::declare("ItemAdded");
        let checkout = State::new("Checkout");

        let (event, activities, targets) = when::<Cart, u32>(&add)
            .then_data(|cart, count| cart.items += count)
            .then(|cart| cart.items += 1)
            .transition_to(&checkout)
            .into_parts();

        assert_eq!(event.name(), "ItemAdded");
        assert_eq!(activities.len(), 3);
        assert_eq!(targets, vec![checkout]);
    }

    #[test]
    fn test_nested_targets_bubble_up() {
        let submit = Event::declare("Submit");
        let done = State::new("Done");
        let failed = State::new("Failed");

        let (_, activities, targets) = when::<Cart, NoData>(&submit)
            .if_then(|_| true, |b| b.transition_to(&done))
            .try_handle(
                |b| b.then(|_| {}),
                |h| h.handle_any(|b| b.transition_to(&failed)),
            )
            .into_parts();

        assert_eq!(activities.len(), 2);
        assert_eq!(targets, vec![done, failed]);
    }

    #[test]
    fn test_finalize_targets_final_state() {
        let finish = Event::declare("Finish");
        let (_, _, targets) = when::<Cart, NoData>(&finish).finalize().into_parts();
        assert_eq!(targets, vec![State::final_state()]);
    }
}
