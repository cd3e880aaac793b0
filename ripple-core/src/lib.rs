//! Ripple Core
//!
//! This crate provides the core runtime for Ripple, a fine-grained reactive
//! store with a stale-while-revalidate resource cache. It implements:
//!
//! - Observable stores with per-field dependency tracking
//! - Effects with microtask batching, cleanup and cycle detection
//! - Scopes that own effects and route their errors
//! - Deep mirroring of JSON data into existing stores
//! - A shared, self-expiring cache of async loads, including paged ones
//!
//! Everything is single-threaded. Effects rerun when the host drains the
//! microtask queue with [`flush_effects`]; the cache's background tasks run on
//! a tokio [`LocalSet`](tokio::task::LocalSet) and flush on their own.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Observables, effects, scopes and the microtask runtime
//! - `mirror`: Identity-preserving structural updates
//! - `cache`: Loaders, cache entries and resource subscriptions
//! - `config`: Cache defaults
//! - `error`: Error taxonomy
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::reactive::{use_observable, run_effect, flush_effects, Scope};
//!
//! let scope = Scope::root("counter");
//! let _guard = scope.enter();
//!
//! let count = use_observable("count", &json!({ "n": 0 }))?;
//! let c = count.clone();
//! run_effect("print", move || {
//!     println!("n = {:?}", c.get("n"));
//!     Ok(())
//! })?;
//!
//! count.set("n", 1);
//! count.set("n", 2);
//! flush_effects(); // prints "n = 2" once
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod mirror;
pub mod reactive;

pub use cache::{use_paged_resource, use_resource, Loader, PagedResource, ResourceCache, ResourceOptions, Status};
pub use config::CacheConfig;
pub use error::{LoadError, ReactiveError};
pub use mirror::{mirror, mirror_with};
pub use reactive::{
    flush_effects, run_effect, settled, untrack, use_observable, AutoFlush, Effect, Observable, Scope, Value,
};
