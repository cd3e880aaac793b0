//! Resource Cache
//!
//! A stale-while-revalidate cache of async loads, shared by every subscriber
//! asking for the same loader and parameters.
//!
//! # Lifecycle
//!
//! ```text
//!            subscriber attaches (enabled)
//!   New ───────────────────────────────► Loading ──► Loaded ──(staleAfter)──► Stale
//!    │                                     │  ▲                 │              │
//!    │ last subscriber leaves              │  └── reload ───────┘              │ last subscriber
//!    ▼                                     ▼                                   ▼ leaves
//!  Deleted ◄──(deleteAfter)── StaleOffscreen ◄────────────────────────────────┘
//! ```
//!
//! - Only one load per entry is ever in flight; late subscribers share it.
//! - Values stay visible while revalidating.
//! - Failures are data: the subscriber's `error` field, never a panic or an
//!   error crossing into the subscriber.
//! - A `Loaded` entry always passes through `StaleOffscreen` before deletion.
//! - Deletion follows `deleteAfter` after the last subscriber leaves.
//! - Paged loaders ([`Loader::paged`]) keep every loaded page in one entry
//!   and grow it one page at a time.
//!
//! # Runtime
//!
//! Loads and timers are `!Send` tasks started with
//! [`tokio::task::spawn_local`]: drive the cache from inside a
//! [`tokio::task::LocalSet`].

mod entry;
mod loader;
mod paged;
mod params;
mod registry;
mod resource;
mod status;

pub use entry::{AbortFlag, CacheEntry};
pub use loader::{Loader, LoaderId};
pub use paged::{use_paged_resource, PagedResource, HAS_MORE};
pub use params::canonical_json;
pub use registry::ResourceCache;
pub use resource::{use_resource, ResourceOptions};
pub use status::Status;
