//! Activity chains: ordered behaviors executed when an event is dispatched.

use crate::context::EventContext;
use crate::error::MachineError;
use crate::machine::Instance;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// What a faulted path decided about the error it saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// The error was compensated for; the dispatch completes normally.
    Handled,
    /// Nobody claimed the error; it surfaces to the caller.
    Propagate,
}

/// One unit of work in a behavior chain.
///
/// Activities receive the context by value together with the remainder of
/// the chain, so an activity can run work before and after its successors,
/// skip them, or run them more than once. Most activities end with
/// `next.execute(ctx).await`.
#[async_trait]
pub trait Activity<I: Instance>: Send + Sync {
    /// Runs this activity and, normally, the rest of the chain.
    async fn execute(
        &self,
        ctx: EventContext<'_, I>,
        next: &Behavior<I>,
    ) -> Result<(), MachineError>;

    /// Visits this activity while unwinding a fault raised further down
    /// the chain. The default passes the fault along untouched.
    async fn faulted(
        &self,
        ctx: EventContext<'_, I>,
        next: &Behavior<I>,
    ) -> Result<FaultDisposition, MachineError> {
        next.faulted(ctx).await
    }
}

/// An immutable slice of activities with a cursor.
///
/// Cloning a behavior is cheap: the activity list is shared and only the
/// cursor differs, so `next()` is how an activity hands control onward.
pub struct Behavior<I: Instance> {
    activities: Arc<[Arc<dyn Activity<I>>]>,
    start: usize,
}

impl<I: Instance> Clone for Behavior<I> {
    fn clone(&self) -> Self {
        Self {
            activities: Arc::clone(&self.activities),
            start: self.start,
        }
    }
}

impl<I: Instance> Behavior<I> {
    pub fn empty() -> Self {
        Self {
            activities: Arc::from(Vec::new()),
            start: 0,
        }
    }

    pub fn new(activities: Vec<Arc<dyn Activity<I>>>) -> Self {
        Self {
            activities: Arc::from(activities),
            start: 0,
        }
    }

    pub fn single(activity: Arc<dyn Activity<I>>) -> Self {
        Self::new(vec![activity])
    }

    /// The activity at the cursor, if any.
    fn head(&self) -> Option<&Arc<dyn Activity<I>>> {
        self.activities.get(self.start)
    }

    /// The chain positioned after the current head.
    pub fn next(&self) -> Self {
        Self {
            activities: Arc::clone(&self.activities),
            start: self.start + 1,
        }
    }

    pub fn len(&self) -> usize {
        self.activities.len().saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the chain from the cursor to the end.
    pub async fn execute(&self, ctx: EventContext<'_, I>) -> Result<(), MachineError> {
        match self.head() {
            Some(activity) => {
                let next = self.next();
                activity.execute(ctx, &next).await
            }
            None => Ok(()),
        }
    }

    /// Walks the chain's faulted path. An exhausted chain propagates.
    pub async fn faulted(&self, ctx: EventContext<'_, I>) -> Result<FaultDisposition, MachineError> {
        match self.head() {
            Some(activity) => {
                let next = self.next();
                activity.faulted(ctx, &next).await
            }
            None => Ok(FaultDisposition::Propagate),
        }
    }
}

impl<I: Instance> fmt::Debug for Behavior<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Behavior")
            .field("len", &self.len())
            .finish()
    }
}
