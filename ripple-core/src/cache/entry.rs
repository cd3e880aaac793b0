//! Cache Entry
//!
//! One entry exists per (loader, parameters) pair. It owns the loaded value
//! and walks the status lifecycle; subscribers only ever receive copies of its
//! data through [`mirror`](crate::mirror::mirror).
//!
//! # How Entries Work
//!
//! Every status that waits on something owns exactly one background task:
//!
//! - `Loading` runs the loader.
//! - `Loaded` waits out the freshness window.
//! - `StaleOffscreen` waits out the deletion window.
//!
//! The task carries an [`AbortFlag`]. Any status change raises the flag of
//! the previous task, and a task whose flag is raised drops its result when
//! it resumes. An aborted load therefore can never overwrite a newer state.
//!
//! The deletion window is counted from the moment the last subscriber
//! leaves, whatever the status was then. An entry left while `Loaded` still
//! passes through `StaleOffscreen`: its freshness timer is brought forward
//! so that it is deleted `deleteAfter` after the detach at the latest.
//!
//! Tasks are spawned with [`tokio::task::spawn_local`], so entries must be
//! driven from inside a [`tokio::task::LocalSet`]. After a task changes the
//! entry it flushes pending effect reruns.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value as Json;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::loader::{LoadContext, LoadFuture, LoaderId};
use super::registry::CacheInner;
use super::status::Status;
use crate::error::{strip_internal_frames, LoadError};
use crate::mirror::mirror;
use crate::reactive::{flush_effects, Observable, Value};

/// Counter for generating unique entry IDs.
static ENTRY_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Cooperative cancellation flag for a background task.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Rc<Cell<bool>>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.set(true);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.get()
    }
}

struct Subscriber {
    state: Observable,
    enabled: Cell<bool>,
    /// Value last written to this subscriber, to skip redundant mirrors.
    published: RefCell<Option<Rc<Json>>>,
}

struct EntryState {
    status: Status,
    value: Option<Rc<Json>>,
    error: Option<Rc<str>>,
    loaded_at: Option<u64>,
    subscribers: Vec<Rc<Subscriber>>,
    enabled_count: usize,
    /// Task owned by the current status.
    pending: Option<AbortFlag>,
    /// When the last subscriber left. Cleared when one attaches.
    detached_at: Option<Instant>,
    /// End of the freshness window of the current value.
    stale_at: Option<Instant>,
    /// The next load appends a page instead of reloading every page.
    next_page: bool,
}

/// Snapshot of the data published to subscribers.
struct Published {
    status: Status,
    value: Option<Rc<Json>>,
    error: Option<Rc<str>>,
    loaded_at: Option<u64>,
}

pub(crate) struct EntryConfig {
    pub loader_id: LoaderId,
    pub loader_name: Rc<str>,
    pub params: Json,
    pub params_key: String,
    pub stale_after: Duration,
    pub delete_after: Duration,
    pub load: Box<dyn Fn(LoadContext) -> LoadFuture>,
}

/// The shared state of one (loader, parameters) pair.
pub struct CacheEntry {
    id: u64,
    loader_id: LoaderId,
    loader_name: Rc<str>,
    params: Json,
    params_key: String,
    stale_after: Duration,
    delete_after: Duration,
    load: Box<dyn Fn(LoadContext) -> LoadFuture>,
    cache: Weak<CacheInner>,
    weak: Weak<CacheEntry>,
    state: RefCell<EntryState>,
}

enum Timer {
    Stale,
    Delete,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

impl CacheEntry {
    pub(crate) fn new(config: EntryConfig, cache: Weak<CacheInner>) -> Rc<Self> {
        Rc::new_cyclic(|weak| CacheEntry {
            id: ENTRY_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            loader_id: config.loader_id,
            loader_name: config.loader_name,
            params: config.params,
            params_key: config.params_key,
            stale_after: config.stale_after,
            delete_after: config.delete_after,
            load: config.load,
            cache,
            weak: weak.clone(),
            state: RefCell::new(EntryState {
                status: Status::New,
                value: None,
                error: None,
                loaded_at: None,
                subscribers: Vec::new(),
                enabled_count: 0,
                pending: None,
                detached_at: None,
                stale_at: None,
                next_page: false,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn loader_id(&self) -> LoaderId {
        self.loader_id
    }

    pub fn params(&self) -> &Json {
        &self.params
    }

    /// Canonical parameter key.
    pub fn params_key(&self) -> &str {
        &self.params_key
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn delete_after(&self) -> Duration {
        self.delete_after
    }

    pub fn status(&self) -> Status {
        self.state.borrow().status
    }

    pub fn value(&self) -> Option<Rc<Json>> {
        self.state.borrow().value.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.as_deref().map(str::to_string)
    }

    /// Completion time of the last load, in milliseconds since the UNIX epoch.
    pub fn loaded_at(&self) -> Option<u64> {
        self.state.borrow().loaded_at
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.borrow().subscribers.len()
    }

    pub fn enabled_subscriber_count(&self) -> usize {
        self.state.borrow().enabled_count
    }

    /// Manually revalidate.
    ///
    /// From `Loaded`, `Loading`, `Stale` and `Error` the entry re-enters
    /// `Loading`, aborting whatever it was waiting on and keeping the last
    /// value. Otherwise this is a no-op. Returns whether a load started.
    pub fn reload(&self) -> bool {
        match self.status() {
            Status::Loaded | Status::Loading | Status::Stale | Status::Error => self.transition(Status::Loading, |_| {}),
            status => {
                trace!(entry = %self, %status, "reload ignored");
                false
            }
        }
    }

    /// Revalidate with one more page appended to a paged value.
    ///
    /// Only a `Loaded` or `Stale` entry whose value has a `pages` list can
    /// grow. Returns whether a load started.
    pub fn load_next_page(&self) -> bool {
        {
            let mut state = self.state.borrow_mut();
            let pageable = matches!(state.status, Status::Loaded | Status::Stale)
                && state.value.as_deref().is_some_and(|value| value.get("pages").is_some_and(Json::is_array));
            if !pageable {
                trace!(entry = %self, status = %state.status, "next page ignored");
                return false;
            }
            state.next_page = true;
        }
        let started = self.transition(Status::Loading, |_| {});
        if !started {
            self.state.borrow_mut().next_page = false;
        }
        started
    }

    // ------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------

    /// Attach a subscriber state.
    ///
    /// The current data is published to it right away. An enabled subscriber
    /// starts a load when the entry has no usable value.
    pub(crate) fn add_subscriber(&self, state: &Observable, enabled: bool) {
        let subscriber = Rc::new(Subscriber {
            state: state.clone(),
            enabled: Cell::new(enabled),
            published: RefCell::new(None),
        });
        let (status, returned, snapshot) = {
            let mut entry_state = self.state.borrow_mut();
            let returned = entry_state.detached_at.take().is_some();
            entry_state.subscribers.push(Rc::clone(&subscriber));
            if enabled {
                entry_state.enabled_count += 1;
            }
            (entry_state.status, returned, self.snapshot(&entry_state))
        };
        publish_to(&subscriber, &snapshot);
        if returned && status == Status::Loaded {
            // Undo a freshness timer brought forward by the detach.
            self.restart_stale_timer();
        }
        self.attached(status, enabled);
    }

    /// Change whether an attached subscriber may trigger loads.
    pub(crate) fn set_enabled(&self, state: &Observable, enabled: bool) {
        let status = {
            let mut entry_state = self.state.borrow_mut();
            let Some(subscriber) = entry_state.subscribers.iter().find(|s| s.state.ptr_eq(state)).cloned() else {
                return;
            };
            if subscriber.enabled.replace(enabled) == enabled {
                return;
            }
            if enabled {
                entry_state.enabled_count += 1;
            } else {
                entry_state.enabled_count = entry_state.enabled_count.saturating_sub(1);
            }
            entry_state.status
        };
        if enabled {
            self.attached(status, true);
        }
    }

    fn attached(&self, status: Status, enabled: bool) {
        match status {
            Status::StaleOffscreen if enabled => {
                self.transition(Status::Loading, |_| {});
            }
            Status::StaleOffscreen => {
                self.transition(Status::Stale, |_| {});
            }
            Status::New | Status::Error | Status::Stale if enabled => {
                self.transition(Status::Loading, |_| {});
            }
            _ => debug!(entry = %self, %status, enabled, "observed"),
        }
    }

    /// Detach a subscriber state. Losing the last subscriber starts the
    /// deletion countdown.
    pub(crate) fn remove_subscriber(&self, state: &Observable) {
        let status = {
            let mut entry_state = self.state.borrow_mut();
            let Some(index) = entry_state.subscribers.iter().position(|s| s.state.ptr_eq(state)) else {
                return;
            };
            let subscriber = entry_state.subscribers.remove(index);
            if subscriber.enabled.get() {
                entry_state.enabled_count = entry_state.enabled_count.saturating_sub(1);
            }
            if !entry_state.subscribers.is_empty() {
                return;
            }
            entry_state.detached_at = Some(Instant::now());
            entry_state.status
        };
        match status {
            Status::Stale | Status::Error | Status::Loading => {
                self.transition(Status::StaleOffscreen, |_| {});
            }
            Status::New => {
                self.transition(Status::Deleted, |_| {});
            }
            Status::Loaded => self.restart_stale_timer(),
            Status::StaleOffscreen | Status::Deleted => {}
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Move to `next`, applying `update` to the entry data first.
    ///
    /// Rejected moves are logged and leave the entry untouched.
    fn transition(&self, next: Status, update: impl FnOnce(&mut EntryState)) -> bool {
        let (previous, subscribers, snapshot) = {
            let mut state = self.state.borrow_mut();
            let previous = state.status;
            if !previous.can_transition_to(next) {
                if !previous.is_terminal() {
                    warn!(entry = %self, from = %previous, to = %next, "rejected status change");
                }
                return false;
            }
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
            update(&mut state);
            state.status = next;
            (previous, state.subscribers.clone(), self.snapshot(&state))
        };
        debug!(entry = %self, from = %previous, to = %next, "status");

        match next {
            Status::Loading => self.start_load(),
            Status::Loaded => {
                self.state.borrow_mut().stale_at = Some(Instant::now() + self.stale_after);
                self.start_timer(Timer::Stale, self.stale_deadline());
            }
            Status::StaleOffscreen => self.start_timer(Timer::Delete, self.delete_deadline()),
            Status::Deleted => {
                if let Some(cache) = self.cache.upgrade() {
                    cache.remove(self);
                }
            }
            _ => {}
        }

        for subscriber in &subscribers {
            publish_to(subscriber, &snapshot);
        }
        true
    }

    fn snapshot(&self, state: &EntryState) -> Published {
        Published {
            status: state.status,
            value: state.value.clone(),
            error: state.error.clone(),
            loaded_at: state.loaded_at,
        }
    }

    /// Replace the task of the current status, aborting the previous one.
    fn install_pending(&self) -> AbortFlag {
        let flag = AbortFlag::new();
        if let Some(previous) = self.state.borrow_mut().pending.replace(flag.clone()) {
            previous.abort();
        }
        flag
    }

    /// When the `Loaded` timer should fire: at the end of the freshness
    /// window, or earlier if nobody watches and the deletion window ends first.
    fn stale_deadline(&self) -> Instant {
        let state = self.state.borrow();
        let stale_at = state.stale_at.unwrap_or_else(Instant::now);
        match state.detached_at {
            Some(detached_at) if state.subscribers.is_empty() => stale_at.min(detached_at + self.delete_after),
            _ => stale_at,
        }
    }

    fn delete_deadline(&self) -> Instant {
        self.state.borrow().detached_at.unwrap_or_else(Instant::now) + self.delete_after
    }

    fn restart_stale_timer(&self) {
        self.start_timer(Timer::Stale, self.stale_deadline());
    }

    fn start_load(&self) {
        let flag = self.install_pending();
        let context = {
            let mut state = self.state.borrow_mut();
            LoadContext {
                previous: state.value.clone(),
                next_page: std::mem::take(&mut state.next_page),
            }
        };
        let load = (self.load)(context);
        let weak = self.weak.clone();

        tokio::task::spawn_local(async move {
            let result = load.await;
            let result = if flag.is_aborted() { Err(LoadError::Aborted) } else { result };
            if let Some(entry) = weak.upgrade() {
                entry.finish_load(result);
                flush_effects();
            }
        });
    }

    fn finish_load(&self, result: Result<Json, LoadError>) {
        match result {
            Ok(value) => {
                self.transition(Status::Loaded, |state| {
                    state.value = Some(Rc::new(value));
                    state.error = None;
                    state.loaded_at = Some(now_ms());
                });
            }
            Err(LoadError::Aborted) => trace!(entry = %self, status = %self.status(), "discarded aborted load"),
            Err(LoadError::Failed(report)) => {
                let message = strip_internal_frames(&report);
                error!(entry = %self, error = %message, "load failed");
                self.transition(Status::Error, |state| {
                    state.value = None;
                    state.error = Some(message.as_str().into());
                    state.loaded_at = Some(now_ms());
                });
            }
        }
    }

    fn start_timer(&self, timer: Timer, deadline: Instant) {
        let flag = self.install_pending();
        let weak = self.weak.clone();

        tokio::task::spawn_local(async move {
            tokio::time::sleep_until(deadline).await;
            if flag.is_aborted() {
                return;
            }
            if let Some(entry) = weak.upgrade() {
                entry.timer_elapsed(timer);
                flush_effects();
            }
        });
    }

    fn timer_elapsed(&self, timer: Timer) {
        match timer {
            Timer::Stale if self.subscriber_count() > 0 => self.transition(Status::Stale, |_| {}),
            Timer::Stale => self.transition(Status::StaleOffscreen, |_| {}),
            Timer::Delete => self.transition(Status::Deleted, |_| {}),
        };
    }
}

/// Write entry data into a subscriber state.
///
/// Structured values are mirrored into the subscriber's existing store so
/// unchanged nested stores keep their identity. The first value, or one of a
/// different shape, is written as a fresh store.
fn publish_to(subscriber: &Subscriber, data: &Published) {
    let state = &subscriber.state;
    state.set("status", data.status.as_str());

    match &data.value {
        Some(value) => {
            let already = subscriber
                .published
                .borrow()
                .as_ref()
                .is_some_and(|published| Rc::ptr_eq(published, value));
            if !already {
                write_value(state, value);
                *subscriber.published.borrow_mut() = Some(Rc::clone(value));
            }
        }
        None => {
            state.delete("value");
            *subscriber.published.borrow_mut() = None;
        }
    }

    match data.loaded_at {
        Some(loaded_at) => state.set("loadedAt", loaded_at),
        None => {
            state.delete("loadedAt");
        }
    }
    match &data.error {
        Some(message) => state.set("error", Value::String(Rc::clone(message))),
        None => {
            state.delete("error");
        }
    }
}

fn write_value(state: &Observable, value: &Json) {
    let current = state.get_untracked("value");
    let target = current.as_store().filter(|store| match value {
        Json::Object(_) => store.is_record(),
        Json::Array(_) => store.is_list(),
        _ => false,
    });
    if let Some(target) = target {
        match mirror(value, target) {
            Ok(()) => return,
            Err(err) => warn!(state = %state.name(), %err, "mirror failed, replacing value"),
        }
    }
    state.set("value", Value::from_json(&format!("{}.value", state.name()), value));
}

impl fmt::Display for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.loader_name, self.params_key)
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("loader", &self.loader_name)
            .field("params", &self.params_key)
            .field("status", &state.status)
            .field("subscribers", &state.subscribers.len())
            .field("enabled", &state.enabled_count)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
