//! Scopes
//!
//! A scope is an ownership boundary, such as one component instance. Effects
//! and resource subscriptions register kill callbacks on the innermost active
//! scope; disposing the scope runs them in registration order.
//!
//! Scopes also own error handling. An error raised by an effect body, a
//! cleanup or an init function is offered to the scope's handler, then to
//! each ancestor's handler in turn. If nobody handles it, the error is logged
//! and the scope where it happened is torn down.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, trace, trace_span};

use crate::error::ReactiveError;

/// Counter for generating unique scope IDs.
static SCOPE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static SCOPE_STACK: RefCell<Vec<Scope>> = const { RefCell::new(Vec::new()) };
}

type Kill = Box<dyn FnOnce()>;
type ErrorHandler = Rc<dyn Fn(&ReactiveError) -> Result<(), ReactiveError>>;

struct ScopeInner {
    id: u64,
    name: Rc<str>,
    parent: Option<Scope>,
    kills: RefCell<VecDeque<Kill>>,
    on_error: RefCell<Option<ErrorHandler>>,
    disposed: Cell<bool>,
}

/// A lifecycle boundary owning effects and subscriptions.
#[derive(Clone)]
pub struct Scope {
    inner: Rc<ScopeInner>,
}

/// Keeps a scope active until dropped.
pub struct ScopeGuard {
    id: u64,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPE_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            if let Some(scope) = popped {
                debug_assert_eq!(scope.id(), self.id, "scope stack mismatch");
            }
        });
    }
}

impl Scope {
    fn with_parent(name: &str, parent: Option<Scope>) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                id: SCOPE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                parent,
                kills: RefCell::new(VecDeque::new()),
                on_error: RefCell::new(None),
                disposed: Cell::new(false),
            }),
        }
    }

    /// Create a scope with no parent.
    pub fn root(name: &str) -> Self {
        Self::with_parent(name, None)
    }

    /// Create a scope nested in the innermost active scope.
    ///
    /// Disposing the parent disposes the child. Without an active scope this
    /// is the same as [`Scope::root`].
    pub fn child(name: &str) -> Self {
        let parent = Self::current();
        let scope = Self::with_parent(name, parent.clone());
        if let Some(parent) = parent {
            let weak: Weak<ScopeInner> = Rc::downgrade(&scope.inner);
            parent.push_kill(move || {
                if let Some(inner) = weak.upgrade() {
                    Scope { inner }.dispose();
                }
            });
        }
        scope
    }

    /// The innermost active scope.
    pub fn current() -> Option<Scope> {
        SCOPE_STACK.with(|stack| stack.borrow().last().cloned())
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.inner.parent.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Make this the innermost active scope until the guard is dropped.
    pub fn enter(&self) -> ScopeGuard {
        SCOPE_STACK.with(|stack| stack.borrow_mut().push(self.clone()));
        ScopeGuard { id: self.id() }
    }

    /// Run an init function inside this scope.
    ///
    /// An error returned by `init` is routed like an effect error and `None`
    /// is returned.
    pub fn run<T>(&self, init: impl FnOnce() -> Result<T, ReactiveError>) -> Option<T> {
        let _span = trace_span!("scope_init", scope = %self.name()).entered();
        let result = {
            let _guard = self.enter();
            init()
        };
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.report(&err);
                None
            }
        }
    }

    /// Install the error handler for this scope.
    ///
    /// Returning `Err` from the handler means "not handled": the original
    /// error keeps bubbling to the parent scope.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&ReactiveError) -> Result<(), ReactiveError> + 'static,
    {
        *self.inner.on_error.borrow_mut() = Some(Rc::new(handler));
    }

    /// Register a callback to run when the scope is disposed.
    ///
    /// On an already disposed scope the callback runs immediately.
    pub fn push_kill(&self, kill: impl FnOnce() + 'static) {
        if self.is_disposed() {
            kill();
            return;
        }
        self.inner.kills.borrow_mut().push_back(Box::new(kill));
    }

    /// Tear the scope down, running kill callbacks in registration order.
    ///
    /// Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        let _span = trace_span!("scope_dispose", scope = %self.name()).entered();

        loop {
            let next = self.inner.kills.borrow_mut().pop_front();
            match next {
                Some(kill) => kill(),
                None => break,
            }
        }
    }

    /// Offer an error to this scope and its ancestors.
    ///
    /// Returns whether a handler accepted it. Unhandled errors are logged and
    /// this scope is disposed.
    pub fn report(&self, err: &ReactiveError) -> bool {
        let mut scope = Some(self);
        while let Some(current) = scope {
            let handler = current.inner.on_error.borrow().clone();
            if let Some(handler) = handler {
                trace!(scope = %current.name(), %err, "handling error");
                match handler(err) {
                    Ok(()) => return true,
                    Err(handler_err) => {
                        error!(scope = %current.name(), error = %handler_err, "error handler failed");
                    }
                }
            }
            scope = current.parent();
        }

        error!(scope = %self.name(), error = %err, "unhandled error, disposing scope");
        self.dispose();
        false
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("disposed", &self.is_disposed())
            .field("kills", &self.inner.kills.borrow().len())
            .finish()
    }
}
