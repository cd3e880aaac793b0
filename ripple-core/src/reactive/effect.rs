//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever the fields
//! it read on its last run change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect registers a kill callback on its scope and
//!    runs its body immediately. The first run is never deferred.
//!
//! 2. Each run pushes a fresh tracking token (a "generation") for the
//!    duration of the body. Reads made by the body register that token.
//!
//! 3. When a tracked field changes, the effect is scheduled: a microtask is
//!    queued and further requests are ignored until it runs. Writes made in
//!    the same tick therefore coalesce into a single rerun.
//!
//! 4. Before rerunning, the previous cleanup runs and the previous token is
//!    cleared, so stale generations can never trigger the effect again.
//!
//! # Cycle Detection
//!
//! Every token carries a chain depth: the depth of the token that was active
//! when the rerun was requested, plus one. Effects that keep re-triggering
//! each other grow the depth on every hop; past [`MAX_CHAIN_DEPTH`] the chain
//! is stopped and a [`ReactiveError::Cycle`] is reported to the scope.
//!
//! # Cleanup
//!
//! A body may return a [`Cleanup`]. It runs right before the next run, and
//! once more when the effect is killed.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, trace, trace_span, warn};

use super::context::{ReactiveContext, MAX_CHAIN_DEPTH};
use super::runtime::Runtime;
use super::scope::Scope;
use super::token::{Rerun, TrackingToken};
use crate::error::ReactiveError;

/// Counter for generating unique effect IDs.
static EFFECT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique effect ID.
fn next_effect_id() -> u64 {
    EFFECT_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Work to undo what an effect run set up.
pub struct Cleanup(Option<Box<dyn FnOnce() -> Result<(), ReactiveError>>>);

impl Cleanup {
    /// No cleanup.
    pub fn none() -> Self {
        Self(None)
    }

    /// Run `f` before the next run and when the effect is killed.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<(), ReactiveError> + 'static,
    {
        Self(Some(Box::new(f)))
    }

    fn run(self) -> Result<(), ReactiveError> {
        match self.0 {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}

impl From<()> for Cleanup {
    fn from(_: ()) -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Cleanup").field(&self.0.is_some()).finish()
    }
}

type Body = Box<dyn FnMut() -> Result<Cleanup, ReactiveError>>;

struct EffectInner {
    id: u64,
    name: Rc<str>,
    scope: Scope,
    weak: Weak<EffectInner>,
    body: RefCell<Body>,
    /// Token of the current generation.
    token: RefCell<Option<Rc<TrackingToken>>>,
    last_cleanup: RefCell<Option<Cleanup>>,
    killed: Cell<bool>,
    scheduled: Cell<bool>,
    run_count: Cell<usize>,
}

impl Rerun for EffectInner {
    fn request_rerun(&self) {
        self.schedule();
    }
}

impl EffectInner {
    fn schedule(&self) {
        if self.killed.get() || self.scheduled.get() {
            return;
        }

        let depth = ReactiveContext::child_depth();
        if depth > MAX_CHAIN_DEPTH {
            let err = ReactiveError::Cycle {
                effect: self.name.to_string(),
                depth,
            };
            error!(effect = %self.name, depth, "effect chain too deep");
            self.scope.report(&err);
            return;
        }

        let Some(this) = self.weak.upgrade() else {
            return;
        };
        self.scheduled.set(true);
        trace!(effect = %self.name, depth, "rerun scheduled");
        Runtime::enqueue_rerun(move || {
            this.run_scheduled(depth);
            Runtime::rerun_finished();
        });
    }

    fn run_scheduled(&self, depth: usize) {
        self.scheduled.set(false);
        if self.killed.get() {
            return;
        }
        let _span = trace_span!("effect_microtask", effect = %self.name).entered();
        self.run_last_cleanup();
        if let Err(err) = self.execute(depth) {
            self.scope.report(&err);
        }
    }

    /// Run the body under a new generation token.
    fn execute(&self, depth: usize) -> Result<(), ReactiveError> {
        let _span = trace_span!("effect_run", effect = %self.name, depth).entered();
        let weak: Weak<dyn Rerun> = self.weak.clone() as Weak<dyn Rerun>;
        let token = TrackingToken::new(Rc::clone(&self.name), weak, depth);
        *self.token.borrow_mut() = Some(Rc::clone(&token));

        let result = {
            let Ok(mut body) = self.body.try_borrow_mut() else {
                warn!(effect = %self.name, "skipped re-entrant effect run");
                return Ok(());
            };
            let _scope = self.scope.enter();
            let _ctx = ReactiveContext::enter(token);
            (*body)()
        };
        self.run_count.set(self.run_count.get() + 1);

        let cleanup = result?;
        if self.killed.get() {
            // Killed by its own body: nobody else will run this cleanup.
            return cleanup.run();
        }
        *self.last_cleanup.borrow_mut() = Some(cleanup);
        Ok(())
    }

    fn run_last_cleanup(&self) {
        let token = self.token.borrow_mut().take();
        if let Some(token) = token {
            token.clear();
        }

        let cleanup = self.last_cleanup.borrow_mut().take();
        if let Some(cleanup) = cleanup {
            let _span = trace_span!("effect_cleanup", effect = %self.name).entered();
            if let Err(err) = cleanup.run() {
                self.scope.report(&err);
            }
        }
    }

    fn kill(&self) {
        if self.killed.replace(true) {
            return;
        }
        self.run_last_cleanup();
        trace!(effect = %self.name, "killed");
    }
}

/// A side-effecting computation that reruns when its dependencies change.
///
/// # Example
///
/// ```rust,ignore
/// let scope = Scope::root("app");
/// let _guard = scope.enter();
/// let count = use_observable("count", &json!({ "n": 0 }))?;
///
/// let c = count.clone();
/// Effect::new("log", move || {
///     println!("n = {:?}", c.get("n"));
///     Ok(())
/// })?;
///
/// count.set("n", 5);
/// flush_effects(); // prints "n = 5"
/// ```
#[derive(Clone)]
pub struct Effect {
    inner: Rc<EffectInner>,
}

impl Effect {
    /// Create an effect in the innermost active scope and run it.
    ///
    /// Fails with [`ReactiveError::NoScope`] when no scope is active.
    pub fn new<F, C>(name: &str, body: F) -> Result<Self, ReactiveError>
    where
        F: FnMut() -> Result<C, ReactiveError> + 'static,
        C: Into<Cleanup>,
    {
        let scope = Scope::current().ok_or_else(|| ReactiveError::NoScope {
            effect: name.to_string(),
        })?;
        Self::new_in(&scope, name, body)
    }

    /// Create an effect owned by `scope` and run it.
    ///
    /// An error from the first run is routed to the scope. If no handler
    /// takes it, it is also returned.
    pub fn new_in<F, C>(scope: &Scope, name: &str, mut body: F) -> Result<Self, ReactiveError>
    where
        F: FnMut() -> Result<C, ReactiveError> + 'static,
        C: Into<Cleanup>,
    {
        let body: Body = Box::new(move || body().map(Into::into));
        let inner = Rc::new_cyclic(|weak| EffectInner {
            id: next_effect_id(),
            name: name.into(),
            scope: scope.clone(),
            weak: weak.clone(),
            body: RefCell::new(body),
            token: RefCell::new(None),
            last_cleanup: RefCell::new(None),
            killed: Cell::new(false),
            scheduled: Cell::new(false),
            run_count: Cell::new(0),
        });

        {
            let inner = Rc::clone(&inner);
            scope.push_kill(move || inner.kill());
        }
        let effect = Self { inner };
        if effect.is_killed() {
            return Ok(effect);
        }

        let depth = ReactiveContext::child_depth();
        let result = if depth > MAX_CHAIN_DEPTH {
            Err(ReactiveError::Cycle {
                effect: name.to_string(),
                depth,
            })
        } else {
            effect.inner.execute(depth)
        };

        match result {
            Ok(()) => Ok(effect),
            Err(err) if scope.report(&err) => Ok(effect),
            Err(err) => Err(err),
        }
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Request a rerun, as if a dependency had changed.
    pub fn schedule(&self) {
        self.inner.schedule();
    }

    /// Kill the effect permanently, running its last cleanup. Idempotent.
    pub fn kill(&self) {
        self.inner.kill();
    }

    pub fn is_killed(&self) -> bool {
        self.inner.killed.get()
    }

    /// Whether a rerun is queued.
    pub fn is_scheduled(&self) -> bool {
        self.inner.scheduled.get()
    }

    /// Get the number of times the body has run.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.get()
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("run_count", &self.run_count())
            .field("scheduled", &self.is_scheduled())
            .field("killed", &self.is_killed())
            .finish()
    }
}

/// Create an effect in the innermost active scope. See [`Effect::new`].
pub fn run_effect<F, C>(name: &str, body: F) -> Result<Effect, ReactiveError>
where
    F: FnMut() -> Result<C, ReactiveError> + 'static,
    C: Into<Cleanup>,
{
    Effect::new(name, body)
}

impl Scope {
    /// Create an effect owned by this scope. See [`Effect::new_in`].
    pub fn effect<F, C>(&self, name: &str, body: F) -> Result<Effect, ReactiveError>
    where
        F: FnMut() -> Result<C, ReactiveError> + 'static,
        C: Into<Cleanup>,
    {
        Effect::new_in(self, name, body)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
