//! Tracking tokens.
//!
//! A tracking token represents one generation of a running effect. Reads made
//! while a token is on top of the context stack register that token against
//! the field that was read. When the field changes, the token's rerun trigger
//! asks the owning effect to run again.
//!
//! Tokens are never removed eagerly. When an effect is superseded by a newer
//! run, or killed, its old token's trigger is cleared and the token becomes
//! dead; dependency edges drop dead tokens the next time they are notified.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a tracking token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(u64);

impl TokenId {
    /// Generate a new unique token ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

/// Something that can be asked to run again.
///
/// Implemented by effects. The request is only a request: effects defer the
/// actual rerun to a microtask.
pub trait Rerun {
    /// Request a rerun.
    fn request_rerun(&self);
}

/// One generation of a running effect.
pub struct TrackingToken {
    id: TokenId,
    effect_name: Rc<str>,
    /// Cleared when the generation is superseded or its effect is killed.
    rerun: RefCell<Option<Weak<dyn Rerun>>>,
    chain_depth: usize,
}

impl TrackingToken {
    /// Create a live token that reruns `target` when triggered.
    pub fn new(effect_name: Rc<str>, target: Weak<dyn Rerun>, chain_depth: usize) -> Rc<Self> {
        Rc::new(Self {
            id: TokenId::new(),
            effect_name,
            rerun: RefCell::new(Some(target)),
            chain_depth,
        })
    }

    /// Create a token with no rerun trigger.
    ///
    /// Reads performed under an inert token subscribe nothing.
    pub fn inert(effect_name: impl Into<Rc<str>>, chain_depth: usize) -> Rc<Self> {
        Rc::new(Self {
            id: TokenId::new(),
            effect_name: effect_name.into(),
            rerun: RefCell::new(None),
            chain_depth,
        })
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    pub fn effect_name(&self) -> &str {
        &self.effect_name
    }

    pub fn chain_depth(&self) -> usize {
        self.chain_depth
    }

    /// Whether the token can still trigger its effect.
    pub fn is_live(&self) -> bool {
        self.rerun
            .borrow()
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Detach the token from its effect. It will never trigger again.
    pub fn clear(&self) {
        self.rerun.borrow_mut().take();
    }

    /// Ask the owning effect to rerun.
    ///
    /// Returns `false` if the token is dead, in which case the caller should
    /// drop it from its edge set.
    pub fn trigger(&self) -> bool {
        let target = self.rerun.borrow().as_ref().and_then(Weak::upgrade);
        match target {
            Some(target) => {
                target.request_rerun();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for TrackingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingToken")
            .field("id", &self.id)
            .field("effect_name", &self.effect_name)
            .field("chain_depth", &self.chain_depth)
            .field("live", &self.is_live())
            .finish()
    }
}
