//! Built-in activities the binder composes into behaviors.

use crate::behavior::{Activity, Behavior};
use crate::context::EventContext;
use crate::error::MachineError;
use crate::event::Event;
use crate::machine::Instance;
use crate::state::State;
use crate::status::CompositeEventStatus;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

type SyncCall<I> =
    Box<dyn Fn(&mut EventContext<'_, I>) -> Result<(), MachineError> + Send + Sync>;
type AsyncCall<I> = Box<
    dyn for<'a> Fn(EventContext<'a, I>) -> BoxFuture<'a, Result<(), MachineError>> + Send + Sync,
>;

enum Call<I: Instance> {
    Sync(SyncCall<I>),
    Async(AsyncCall<I>),
}

/// Runs a host callback, then the rest of the chain.
pub(crate) struct ThenActivity<I: Instance> {
    call: Call<I>,
}

impl<I: Instance> ThenActivity<I> {
    pub(crate) fn sync(
        call: impl Fn(&mut EventContext<'_, I>) -> Result<(), MachineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            call: Call::Sync(Box::new(call)),
        }
    }

    pub(crate) fn future(
        call: impl for<'a> Fn(EventContext<'a, I>) -> BoxFuture<'a, Result<(), MachineError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            call: Call::Async(Box::new(call)),
        }
    }
}

#[async_trait]
impl<I: Instance> Activity<I> for ThenActivity<I> {
    async fn execute(
        &self,
        mut ctx: EventContext<'_, I>,
        next: &Behavior<I>,
    ) -> Result<(), MachineError> {
        match &self.call {
            Call::Sync(call) => call(&mut ctx)?,
            Call::Async(call) => call(ctx.reborrow()).await?,
        }
        next.execute(ctx).await
    }
}

/// Moves the instance to a target state, then runs the rest of the chain.
pub(crate) struct TransitionActivity {
    target: State,
}

impl TransitionActivity {
    pub(crate) fn new(target: State) -> Self {
        Self { target }
    }
}

#[async_trait]
impl<I: Instance> Activity<I> for TransitionActivity {
    async fn execute(
        &self,
        mut ctx: EventContext<'_, I>,
        next: &Behavior<I>,
    ) -> Result<(), MachineError> {
        let machine = ctx.machine();
        machine.perform_transition(&mut ctx, &self.target).await?;
        next.execute(ctx).await
    }
}

type SyncCondition<I> = Box<dyn Fn(&EventContext<'_, I>) -> bool + Send + Sync>;
type AsyncCondition<I> =
    Box<dyn for<'a> Fn(&'a EventContext<'a, I>) -> BoxFuture<'a, bool> + Send + Sync>;

enum Condition<I: Instance> {
    Sync(SyncCondition<I>),
    Async(AsyncCondition<I>),
}

/// Runs a branch behavior when a condition holds, then continues the chain
/// either way.
pub(crate) struct ConditionActivity<I: Instance> {
    condition: Condition<I>,
    then: Behavior<I>,
}

impl<I: Instance> ConditionActivity<I> {
    pub(crate) fn sync(
        condition: impl Fn(&EventContext<'_, I>) -> bool + Send + Sync + 'static,
        then: Behavior<I>,
    ) -> Self {
        Self {
            condition: Condition::Sync(Box::new(condition)),
            then,
        }
    }

    pub(crate) fn future(
        condition: impl for<'a> Fn(&'a EventContext<'a, I>) -> BoxFuture<'a, bool> + Send + Sync + 'static,
        then: Behavior<I>,
    ) -> Self {
        Self {
            condition: Condition::Async(Box::new(condition)),
            then,
        }
    }
}

#[async_trait]
impl<I: Instance> Activity<I> for ConditionActivity<I> {
    async fn execute(
        &self,
        mut ctx: EventContext<'_, I>,
        next: &Behavior<I>,
    ) -> Result<(), MachineError> {
        let verdict = match &self.condition {
            Condition::Sync(condition) => condition(&ctx),
            Condition::Async(condition) => condition(&ctx).await,
        };
        if verdict {
            self.then.execute(ctx.reborrow()).await?;
        }
        next.execute(ctx).await
    }
}

/// One catch arm of a [`TryActivity`]: a predicate over the fault and the
/// behavior to run when it matches.
pub(crate) struct ExceptionHandler<I: Instance> {
    matches: Box<dyn Fn(&MachineError) -> bool + Send + Sync>,
    behavior: Behavior<I>,
}

impl<I: Instance> ExceptionHandler<I> {
    pub(crate) fn new(
        matches: impl Fn(&MachineError) -> bool + Send + Sync + 'static,
        behavior: Behavior<I>,
    ) -> Self {
        Self {
            matches: Box::new(matches),
            behavior,
        }
    }
}

/// Guards an inner behavior with typed exception handlers.
///
/// A fault from the inner chain is offered to the handlers in declaration
/// order; the first whose predicate matches runs with the fault visible in
/// the context, after which the outer chain continues as if the inner chain
/// had succeeded. An unmatched fault propagates unchanged, and faults raised
/// elsewhere in the outer chain never reach these handlers.
pub(crate) struct TryActivity<I: Instance> {
    inner: Behavior<I>,
    handlers: Vec<ExceptionHandler<I>>,
}

impl<I: Instance> TryActivity<I> {
    pub(crate) fn new(inner: Behavior<I>, handlers: Vec<ExceptionHandler<I>>) -> Self {
        Self { inner, handlers }
    }
}

#[async_trait]
impl<I: Instance> Activity<I> for TryActivity<I> {
    async fn execute(
        &self,
        mut ctx: EventContext<'_, I>,
        next: &Behavior<I>,
    ) -> Result<(), MachineError> {
        match self.inner.execute(ctx.reborrow()).await {
            Ok(()) => next.execute(ctx).await,
            Err(error) => {
                let handler = self.handlers.iter().find(|handler| (handler.matches)(&error));
                match handler {
                    Some(handler) => {
                        handler.behavior.execute(ctx.with_error(&error)).await?;
                        next.execute(ctx).await
                    }
                    None => Err(error),
                }
            }
        }
    }
}

/// How a composite activity reads and writes tracking bits on the instance.
pub(crate) struct CompositeLens<I: Instance> {
    read: Box<dyn Fn(&I) -> CompositeEventStatus + Send + Sync>,
    write: Box<dyn Fn(&mut I, CompositeEventStatus) + Send + Sync>,
}

impl<I: Instance> CompositeLens<I> {
    pub(crate) fn new(
        read: impl Fn(&I) -> CompositeEventStatus + Send + Sync + 'static,
        write: impl Fn(&mut I, CompositeEventStatus) + Send + Sync + 'static,
    ) -> Self {
        Self {
            read: Box::new(read),
            write: Box::new(write),
        }
    }
}

/// Marks one member of a composite as observed and raises the composite
/// event the moment the last member bit lands.
pub(crate) struct CompositeEventActivity<I: Instance> {
    flag: CompositeEventStatus,
    complete: CompositeEventStatus,
    event: Event,
    lens: Arc<CompositeLens<I>>,
}

impl<I: Instance> CompositeEventActivity<I> {
    pub(crate) fn new(
        flag: CompositeEventStatus,
        complete: CompositeEventStatus,
        event: Event,
        lens: Arc<CompositeLens<I>>,
    ) -> Self {
        Self {
            flag,
            complete,
            event,
            lens,
        }
    }
}

#[async_trait]
impl<I: Instance> Activity<I> for CompositeEventActivity<I> {
    async fn execute(
        &self,
        mut ctx: EventContext<'_, I>,
        next: &Behavior<I>,
    ) -> Result<(), MachineError> {
        let mut status = (self.lens.read)(ctx.instance());
        let was_complete = status.is_complete(self.complete);
        status.set(self.flag);
        (self.lens.write)(ctx.instance_mut(), status);
        // Raise only on the transition into complete; members observed
        // after that are recorded but stay silent until the host zeroes
        // the tracked status.
        if !was_complete && status.is_complete(self.complete) {
            ctx.raise(&self.event).await?;
        }
        next.execute(ctx).await
    }
}
