//! Reactive Context
//!
//! The reactive context tracks which effect generation is currently running.
//! This enables automatic dependency tracking: when an observable field is
//! read, the token on top of the stack is registered against that field.
//!
//! # Implementation
//!
//! We use a thread-local stack of tracking tokens. Running an effect body
//! pushes that run's token; the guard pops it when dropped. Nested effects
//! (an effect created inside another effect's body) push on top of their
//! parent, and the stack depth of the parent drives cycle detection.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace_span;

use super::token::TrackingToken;

/// Effect chains deeper than this are treated as infinite recursion.
pub const MAX_CHAIN_DEPTH: usize = 500;

thread_local! {
    static TOKEN_STACK: RefCell<Vec<Rc<TrackingToken>>> = const { RefCell::new(Vec::new()) };
}

/// Guard that pops the token when dropped.
///
/// This keeps the stack balanced even if the body panics.
pub struct ReactiveContext {
    token: Rc<TrackingToken>,
}

impl ReactiveContext {
    /// Make `token` the active token until the returned guard is dropped.
    pub fn enter(token: Rc<TrackingToken>) -> Self {
        TOKEN_STACK.with(|stack| stack.borrow_mut().push(Rc::clone(&token)));
        Self { token }
    }

    /// Check if there is an active token.
    pub fn is_active() -> bool {
        TOKEN_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// The token on top of the stack, if any.
    pub fn current() -> Option<Rc<TrackingToken>> {
        TOKEN_STACK.with(|stack| stack.borrow().last().cloned())
    }

    /// The token that reads should subscribe right now.
    ///
    /// Returns `None` outside effects and under `untrack`.
    pub fn tracking_token() -> Option<Rc<TrackingToken>> {
        Self::current().filter(|token| token.is_live())
    }

    /// Chain depth for work started from the current position.
    ///
    /// The active token's depth plus one, or zero when nothing is running.
    pub fn child_depth() -> usize {
        TOKEN_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .map(|token| token.chain_depth() + 1)
                .unwrap_or(0)
        })
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        TOKEN_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some(token) = popped {
                debug_assert_eq!(
                    token.id(),
                    self.token.id(),
                    "ReactiveContext mismatch: expected {:?}, got {:?}",
                    self.token,
                    token
                );
            }
        });
    }
}

/// Run `f` without subscribing to anything it reads.
///
/// An inert token one level deeper than the current one is pushed for the
/// duration of `f`, so writes made inside still count toward the chain depth.
pub fn untrack<T>(name: &str, f: impl FnOnce() -> T) -> T {
    let _span = trace_span!("untrack", label = name).entered();
    let token = TrackingToken::inert(format!("{name} (untrack)"), ReactiveContext::child_depth());
    let _ctx = ReactiveContext::enter(token);
    f()
}

/// Run `f` untracked and with the chain depth reset to zero.
///
/// For deliberate cascades that would otherwise be mistaken for recursion.
pub fn unchain<T>(name: &str, f: impl FnOnce() -> T) -> T {
    let _span = trace_span!("unchain", label = name).entered();
    let token = TrackingToken::inert(format!("{name} (unchain)"), 0);
    let _ctx = ReactiveContext::enter(token);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::token::Rerun;
    use std::rc::Weak;

    struct Noop;

    impl Rerun for Noop {
        fn request_rerun(&self) {}
    }

    fn live_token(target: &Rc<Noop>, depth: usize) -> Rc<TrackingToken> {
        let weak: Weak<dyn Rerun> = Rc::downgrade(target) as Weak<dyn Rerun>;
        TrackingToken::new("test".into(), weak, depth)
    }

    #[test]
    fn context_tracks_token() {
        let target = Rc::new(Noop);
        let token = live_token(&target, 0);

        assert!(!ReactiveContext::is_active());
        assert!(ReactiveContext::current().is_none());

        {
            let _ctx = ReactiveContext::enter(Rc::clone(&token));
            assert!(ReactiveContext::is_active());
            assert_eq!(ReactiveContext::current().map(|t| t.id()), Some(token.id()));
            assert!(ReactiveContext::tracking_token().is_some());
        }

        assert!(!ReactiveContext::is_active());
    }

    #[test]
    fn nested_contexts() {
        let target = Rc::new(Noop);
        let outer = live_token(&target, 0);
        let inner = live_token(&target, 1);

        let _outer_ctx = ReactiveContext::enter(Rc::clone(&outer));
        {
            let _inner_ctx = ReactiveContext::enter(Rc::clone(&inner));
            assert_eq!(ReactiveContext::current().map(|t| t.id()), Some(inner.id()));
            assert_eq!(ReactiveContext::child_depth(), 2);
        }
        assert_eq!(ReactiveContext::current().map(|t| t.id()), Some(outer.id()));
        assert_eq!(ReactiveContext::child_depth(), 1);
    }

    #[test]
    fn untrack_hides_the_active_token() {
        let target = Rc::new(Noop);
        let _ctx = ReactiveContext::enter(live_token(&target, 4));

        untrack("read", || {
            assert!(ReactiveContext::tracking_token().is_none());
            assert_eq!(ReactiveContext::child_depth(), 6);
        });
        assert!(ReactiveContext::tracking_token().is_some());
    }

    #[test]
    fn unchain_resets_depth() {
        let target = Rc::new(Noop);
        let _ctx = ReactiveContext::enter(live_token(&target, 400));

        unchain("restart", || {
            assert_eq!(ReactiveContext::child_depth(), 1);
        });
        assert_eq!(ReactiveContext::child_depth(), 401);
    }

    #[test]
    fn depth_is_zero_outside_effects() {
        assert_eq!(ReactiveContext::child_depth(), 0);
    }
}
