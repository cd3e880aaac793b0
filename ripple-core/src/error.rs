//! Error Types
//!
//! Two families of errors exist in Ripple:
//!
//! - [`ReactiveError`] covers misuse and failures of the reactive runtime
//!   itself (effects without a scope, runaway effect chains, bad mirror
//!   targets) and failures raised by user effect bodies.
//!
//! - [`LoadError`] covers the outcome of a resource loader. A failed load is
//!   never thrown at subscribers; it is recorded as entry state and read back
//!   through the subscriber's `error` field.

use thiserror::Error;

/// Errors produced by the reactive runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactiveError {
    /// An effect was created while no scope was active.
    #[error("no active scope for effect `{effect}`")]
    NoScope { effect: String },

    /// Effects kept re-triggering each other past the chain ceiling.
    #[error("infinite effect recursion in `{effect}` (chain depth {depth})")]
    Cycle { effect: String, depth: usize },

    /// Source and target of a mirror do not have the same structure.
    #[error("cannot mirror {source_kind} onto {target_kind} at `{path}`")]
    MirrorShapeMismatch {
        path: String,
        source_kind: &'static str,
        target_kind: &'static str,
    },

    /// Resource parameters could not be turned into a cache key.
    #[error("invalid parameters for resource `{resource}`: {message}")]
    InvalidParams { resource: String, message: String },

    /// A failure raised by an effect body, a cleanup or a scope init function.
    #[error("{0}")]
    Failed(String),
}

impl ReactiveError {
    /// Shorthand for [`ReactiveError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Outcome of a failed resource load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The load was superseded. Never surfaced to subscribers.
    #[error("load aborted")]
    Aborted,

    /// The loader returned an error.
    #[error("{0}")]
    Failed(String),
}

/// Frames that belong to the runtime rather than to the loader that failed.
const INTERNAL_FRAME_MARKERS: &[&str] = &["ripple_core::", "tokio::", "futures_util::", "core::future"];

/// Remove runtime-internal lines from a (possibly multi-line) error report.
///
/// Loader errors may carry a rendered backtrace. Only the lines pointing at
/// the caller's code are kept. An empty result falls back to the first line.
pub fn strip_internal_frames(report: &str) -> String {
    let kept: Vec<&str> = report
        .lines()
        .filter(|line| !INTERNAL_FRAME_MARKERS.iter().any(|m| line.contains(m)))
        .collect();

    if kept.is_empty() {
        report.lines().next().unwrap_or_default().to_string()
    } else {
        kept.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_runtime_frames() {
        let report = "connection refused\n  at ripple_core::cache::entry::load\n  at app::fetch_user\n  at tokio::runtime::task::poll";
        assert_eq!(strip_internal_frames(report), "connection refused\n  at app::fetch_user");
    }

    #[test]
    fn keeps_single_line_messages() {
        assert_eq!(strip_internal_frames("boom"), "boom");
    }

    #[test]
    fn display_messages() {
        let err = ReactiveError::Cycle {
            effect: "counter".into(),
            depth: 501,
        };
        assert_eq!(
            err.to_string(),
            "infinite effect recursion in `counter` (chain depth 501)"
        );
        assert_eq!(ReactiveError::failed("nope").to_string(), "nope");
    }
}
