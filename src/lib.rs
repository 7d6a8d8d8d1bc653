//! # statum
//!
//! Declarative in-process state machine runtime.
//!
//! A machine is defined once with [`StateMachineBuilder`] and frozen; it
//! then drives any number of host instances, which carry nothing but their
//! own data and a current state reached through a pluggable accessor.
//!
//! This crate provides:
//! - States and events as value-type identity tokens compared by name
//! - Fluent [`when`] binders composing per-state behaviors
//! - Activity chains with a try/catch-style faulted path
//! - A four-phase transition lifecycle plus observer notifications
//! - Composite events raised once all member events have been observed
//! - Pluggable state storage: typed, by name, by ordinal, or custom

pub mod accessor;
mod activity;
pub mod behavior;
pub mod binder;
pub mod builder;
pub mod cancel;
pub mod context;
pub mod error;
pub mod event;
pub mod machine;
pub mod observe;
pub mod state;
pub mod status;

pub use accessor::StateAccessor;
pub use behavior::{Activity, Behavior, FaultDisposition};
pub use binder::{when, EventBinder, HandlerSet};
pub use builder::{CompositeOptions, StateMachineBuilder};
pub use cancel::CancellationToken;
pub use context::{EventContext, Payloads, RaiseOptions, DEFAULT_PAYLOAD_LIMIT};
pub use error::{ActivityError, MachineError};
pub use event::{Event, EventInfo, EventMessage, NoData};
pub use machine::{GraphEdge, Instance, StateMachine, UnhandledEventPolicy};
pub use observe::{EventObserver, ObserverHandle, ObserverScope, StateObserver};
pub use state::State;
pub use status::{CompositeEventStatus, MAX_COMPOSITE_EVENTS};
