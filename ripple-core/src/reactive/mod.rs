//! Reactive Primitives
//!
//! This module implements the reactive core: observable stores, effects, and
//! the scopes that own them. These primitives form the foundation of
//! Ripple's fine-grained reactivity.
//!
//! # Concepts
//!
//! ## Observables
//!
//! An Observable is a record or list whose fields are tracked individually.
//! When a field is read while an effect is running, the effect becomes a
//! dependent of that field. When the field changes, dependents are asked to
//! rerun.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that reruns whenever the fields
//! it read change. Reruns are batched: they are deferred to a microtask queue
//! and deduplicated, so several writes in one tick cause a single rerun.
//!
//! ## Scopes
//!
//! A Scope is a lifecycle boundary. Effects register themselves on the
//! innermost active scope and are killed when it is disposed. Scopes also
//! route errors to the nearest registered handler.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local stack of tracking tokens to
//! detect dependencies automatically. Each effect run pushes a fresh token;
//! once the effect reruns or dies, old tokens are cleared and dropped lazily
//! from dependency edges.

mod context;
mod effect;
mod observable;
mod runtime;
mod scope;
mod token;
mod value;

pub use context::{unchain, untrack, ReactiveContext, MAX_CHAIN_DEPTH};
pub use effect::{run_effect, Cleanup, Effect};
pub use observable::{use_observable, Field, Observable};
pub use runtime::{flush_effects, settled, AutoFlush, Runtime};
pub use scope::{Scope, ScopeGuard};
pub use token::{Rerun, TokenId, TrackingToken};
pub use value::Value;

pub(crate) use value::json_kind_name;
