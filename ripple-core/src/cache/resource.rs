//! Resource subscriptions.
//!
//! [`use_resource`] connects a component scope to the cache. It returns a
//! subscriber state, an observable record that always holds a copy of the
//! selected entry:
//!
//! | field      | meaning                                         |
//! |------------|-------------------------------------------------|
//! | `status`   | entry status, e.g. `"Loading"`                  |
//! | `value`    | last loaded value, absent before the first load |
//! | `error`    | message of the last failed load                 |
//! | `loadedAt` | completion time of the last load (ms since epoch) |
//!
//! The options function is tracked: when it reads observable fields and they
//! change, it reruns. If it now selects a different entry, the state detaches
//! from the old entry and attaches to the new one within the same rerun.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::trace;

use super::entry::CacheEntry;
use super::loader::Loader;
use super::registry::ResourceCache;
use crate::error::ReactiveError;
use crate::reactive::{untrack, use_observable, Effect, Observable, Scope};

/// What a resource subscription asks for.
pub struct ResourceOptions<P> {
    loader: Loader<P>,
    params: P,
    enabled: bool,
    stale_after: Option<Duration>,
    delete_after: Option<Duration>,
}

impl<P> ResourceOptions<P> {
    /// Load `params` with `loader`, enabled, with the cache's default windows.
    pub fn new(loader: Loader<P>, params: P) -> Self {
        Self {
            loader,
            params,
            enabled: true,
            stale_after: None,
            delete_after: None,
        }
    }

    /// A disabled subscription mirrors the entry but never starts a load.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn delete_after(mut self, delete_after: Duration) -> Self {
        self.delete_after = Some(delete_after);
        self
    }

    pub fn loader(&self) -> &Loader<P> {
        &self.loader
    }

    pub fn params(&self) -> &P {
        &self.params
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn stale_after_or(&self, default: Duration) -> Duration {
        self.stale_after.unwrap_or(default)
    }

    pub(crate) fn delete_after_or(&self, default: Duration) -> Duration {
        self.delete_after.unwrap_or(default)
    }
}

/// The entry a subscriber state is currently attached to.
pub(super) struct Attachment {
    pub entry: Rc<CacheEntry>,
    enabled: bool,
}

pub(super) type AttachmentSlot = Rc<RefCell<Option<Attachment>>>;

/// Subscribe the active scope to a cached resource.
///
/// Returns the subscriber state. The subscription ends when the scope is
/// disposed.
///
/// # Panics
///
/// Loads and timers are spawned with [`tokio::task::spawn_local`]: an
/// enabled subscription panics when called outside of a
/// [`tokio::task::LocalSet`].
///
/// # Example
///
/// ```rust,ignore
/// let page = use_observable("page", &json!({ "n": 1 }))?;
/// let p = page.clone();
/// let todos = use_resource(&cache, "todos", move || {
///     ResourceOptions::new(todos_loader.clone(), p.get("n").as_u64().unwrap_or(1))
/// })?;
/// ```
pub fn use_resource<P, F>(cache: &ResourceCache, name: &str, options: F) -> Result<Observable, ReactiveError>
where
    P: Serialize + Clone + 'static,
    F: Fn() -> ResourceOptions<P> + 'static,
{
    subscribe(cache, name, options).map(|(state, _)| state)
}

/// Create the subscriber state and the effect that keeps it attached.
pub(super) fn subscribe<P, F>(
    cache: &ResourceCache,
    name: &str,
    options: F,
) -> Result<(Observable, AttachmentSlot), ReactiveError>
where
    P: Serialize + Clone + 'static,
    F: Fn() -> ResourceOptions<P> + 'static,
{
    let scope = Scope::current().ok_or_else(|| ReactiveError::NoScope {
        effect: name.to_string(),
    })?;
    let state = use_observable(name, &json!({ "status": "New" }))?;
    let attached: AttachmentSlot = Rc::new(RefCell::new(None));

    {
        let (cache, state, attached) = (cache.clone(), state.clone(), Rc::clone(&attached));
        let resource: Rc<str> = name.into();
        Effect::new_in(&scope, &format!("resource:{name}"), move || {
            let options = options();
            untrack("resource-attach", || {
                let entry = cache.entry_for(&resource, &options)?;
                reattach(&attached, &state, entry, options.is_enabled());
                Ok(())
            })
        })?;
    }

    {
        let (state, attached) = (state.clone(), Rc::clone(&attached));
        scope.push_kill(move || {
            let previous = attached.borrow_mut().take();
            if let Some(previous) = previous {
                previous.entry.remove_subscriber(&state);
            }
        });
    }
    Ok((state, attached))
}

/// Point `state` at `entry`, detaching it from the previous entry first.
fn reattach(attached: &RefCell<Option<Attachment>>, state: &Observable, entry: Rc<CacheEntry>, enabled: bool) {
    let previous = attached.borrow_mut().take();
    match previous {
        Some(previous) if Rc::ptr_eq(&previous.entry, &entry) => {
            if previous.enabled != enabled {
                entry.set_enabled(state, enabled);
            }
        }
        Some(previous) => {
            trace!(from = %previous.entry, to = %entry, "switching entry");
            previous.entry.remove_subscriber(state);
            entry.add_subscriber(state, enabled);
        }
        None => entry.add_subscriber(state, enabled),
    }
    *attached.borrow_mut() = Some(Attachment { entry, enabled });
}

impl ResourceCache {
    /// Subscribe the active scope to a resource. See [`use_resource`].
    pub fn use_resource<P, F>(&self, name: &str, options: F) -> Result<Observable, ReactiveError>
    where
        P: Serialize + Clone + 'static,
        F: Fn() -> ResourceOptions<P> + 'static,
    {
        use_resource(self, name, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Status;
    use crate::reactive::flush_effects;
    use std::cell::Cell;
    use tokio::task::LocalSet;
    use tokio::time::sleep;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn echo(calls: Rc<Cell<usize>>) -> Loader<u64> {
        Loader::new("echo", move |n: u64| {
            calls.set(calls.get() + 1);
            async move {
                sleep(ms(10)).await;
                Ok::<_, String>(json!({ "n": n }))
            }
        })
    }

    #[test]
    fn requires_a_scope() {
        let cache = ResourceCache::new();
        let loader = echo(Rc::new(Cell::new(0)));
        let err = use_resource(&cache, "orphan", move || ResourceOptions::new(loader.clone(), 1)).unwrap_err();
        assert!(matches!(err, ReactiveError::NoScope { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn state_follows_the_entry() {
        LocalSet::new()
            .run_until(async {
                let cache = ResourceCache::new();
                let scope = Scope::root("component");
                let _guard = scope.enter();
                let loader = echo(Rc::new(Cell::new(0)));

                let state = {
                    let loader = loader.clone();
                    cache
                        .use_resource("echo", move || ResourceOptions::new(loader.clone(), 3))
                        .unwrap()
                };
                assert_eq!(state.get_untracked("status").as_str(), Some("Loading"));
                assert!(state.name().ends_with("echo"));

                sleep(ms(20)).await;
                assert_eq!(state.get_untracked("status").as_str(), Some("Loaded"));
                assert_eq!(state.to_json()["value"], json!({ "n": 3 }));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn disposing_the_scope_detaches() {
        LocalSet::new()
            .run_until(async {
                let cache = ResourceCache::new();
                let loader = echo(Rc::new(Cell::new(0)));
                let scope = Scope::root("component");
                {
                    let _guard = scope.enter();
                    let loader = loader.clone();
                    use_resource(&cache, "echo", move || ResourceOptions::new(loader.clone(), 1)).unwrap();
                }
                let entry = cache.lookup(&loader, &1).unwrap();
                assert_eq!(entry.subscriber_count(), 1);

                scope.dispose();
                assert_eq!(entry.subscriber_count(), 0);
                assert_eq!(entry.status(), Status::StaleOffscreen);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn toggling_enabled_keeps_the_entry() {
        LocalSet::new()
            .run_until(async {
                let cache = ResourceCache::new();
                let calls = Rc::new(Cell::new(0));
                let loader = echo(Rc::clone(&calls));
                let scope = Scope::root("component");
                let _guard = scope.enter();
                let switch = use_observable("switch", &json!({ "on": false })).unwrap();

                let state = {
                    let (loader, switch) = (loader.clone(), switch.clone());
                    use_resource(&cache, "echo", move || {
                        let on = switch.get("on").as_bool().unwrap_or(false);
                        ResourceOptions::new(loader.clone(), 1).enabled(on)
                    })
                    .unwrap()
                };
                assert_eq!(state.get_untracked("status").as_str(), Some("New"));
                assert_eq!(calls.get(), 0);

                switch.set("on", true);
                flush_effects();
                assert_eq!(calls.get(), 1);
                assert_eq!(cache.len(), 1);

                sleep(ms(20)).await;
                assert_eq!(state.get_untracked("status").as_str(), Some("Loaded"));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_subscriber_sees_loads_started_by_others() {
        LocalSet::new()
            .run_until(async {
                let cache = ResourceCache::new();
                let loader = echo(Rc::new(Cell::new(0)));
                let scope = Scope::root("page");
                let _guard = scope.enter();

                let passive = {
                    let loader = loader.clone();
                    use_resource(&cache, "passive", move || ResourceOptions::new(loader.clone(), 5).enabled(false))
                        .unwrap()
                };
                let _active = {
                    let loader = loader.clone();
                    use_resource(&cache, "active", move || ResourceOptions::new(loader.clone(), 5)).unwrap()
                };

                sleep(ms(20)).await;
                assert_eq!(passive.to_json()["value"], json!({ "n": 5 }));
            })
            .await;
    }

    #[test]
    #[should_panic(expected = "spawn_local")]
    fn enabled_subscription_needs_a_local_set() {
        let cache = ResourceCache::new();
        let scope = Scope::root("component");
        let _guard = scope.enter();
        let loader = echo(Rc::new(Cell::new(0)));
        let _ = use_resource(&cache, "echo", move || ResourceOptions::new(loader.clone(), 1));
    }

    #[test]
    fn disabled_subscription_runs_without_a_local_set() {
        let cache = ResourceCache::new();
        let scope = Scope::root("component");
        let _guard = scope.enter();
        let loader = echo(Rc::new(Cell::new(0)));
        let state = use_resource(&cache, "echo", move || ResourceOptions::new(loader.clone(), 1).enabled(false)).unwrap();
        assert_eq!(state.get_untracked("status").as_str(), Some("New"));
        scope.dispose();
        assert!(cache.is_empty());
    }

    #[test]
    fn unserializable_params_are_reported() {
        type Grid = std::collections::HashMap<(u8, u8), u8>;

        let cache = ResourceCache::new();
        let scope = Scope::root("component");
        let seen: Rc<RefCell<Vec<ReactiveError>>> = Rc::default();
        {
            let seen = Rc::clone(&seen);
            scope.on_error(move |err| {
                seen.borrow_mut().push(err.clone());
                Ok(())
            });
        }
        let _guard = scope.enter();
        let loader: Loader<Grid> = Loader::new("grid", |grid: Grid| async move { Ok::<_, String>(grid.len()) });

        let state = use_resource(&cache, "grid", move || {
            let mut grid = Grid::new();
            grid.insert((0, 0), 1);
            ResourceOptions::new(loader.clone(), grid)
        })
        .unwrap();

        assert!(cache.is_empty());
        assert_eq!(state.get_untracked("status").as_str(), Some("New"));
        assert!(matches!(
            seen.borrow().as_slice(),
            [ReactiveError::InvalidParams { resource, .. }] if resource == "grid"
        ));
    }
}
