//! Resource cache registry.
//!
//! Maps loader identity, then canonical parameter key, to the shared
//! [`CacheEntry`]. The registry is an ordinary value: tests and hosts create
//! as many isolated caches as they need.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{debug, trace};

use super::entry::{CacheEntry, EntryConfig};
use super::loader::{LoadContext, Loader, LoaderId};
use super::params::params_key;
use super::resource::ResourceOptions;
use super::status::Status;
use crate::config::CacheConfig;
use crate::error::ReactiveError;

type EntryMap = IndexMap<LoaderId, IndexMap<String, Rc<CacheEntry>>>;

pub(crate) struct CacheInner {
    config: CacheConfig,
    entries: RefCell<EntryMap>,
}

impl CacheInner {
    /// Forget `entry` if it is still the one registered under its key.
    pub(crate) fn remove(&self, entry: &CacheEntry) {
        let mut entries = self.entries.borrow_mut();
        let Some(by_params) = entries.get_mut(&entry.loader_id()) else {
            return;
        };
        let registered = by_params
            .get(entry.params_key())
            .is_some_and(|current| std::ptr::eq(Rc::as_ptr(current), entry));
        if registered {
            by_params.shift_remove(entry.params_key());
            debug!(%entry, "entry removed");
        }
        if by_params.is_empty() {
            entries.shift_remove(&entry.loader_id());
        }
    }
}

/// A registry of shared resource entries.
///
/// Cloning the handle shares the registry.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Rc<CacheInner>,
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            inner: Rc::new(CacheInner {
                config,
                entries: RefCell::new(IndexMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Look up the entry for `options`, creating it in the `New` state if needed.
    ///
    /// The freshness and deletion windows of the request that created the
    /// entry apply to everyone sharing it.
    pub(crate) fn entry_for<P>(&self, resource: &str, options: &ResourceOptions<P>) -> Result<Rc<CacheEntry>, ReactiveError>
    where
        P: Serialize + Clone + 'static,
    {
        let loader = options.loader();
        let (params, key) = params_key(resource, options.params())?;

        if let Some(entry) = self.lookup_key(loader.id(), &key) {
            trace!(%entry, "entry reused");
            return Ok(entry);
        }

        let load = {
            let loader = loader.clone();
            let params = options.params().clone();
            Box::new(move |context: LoadContext| loader.call(params.clone(), context))
        };
        let entry = CacheEntry::new(
            EntryConfig {
                loader_id: loader.id(),
                loader_name: loader.name().into(),
                params,
                params_key: key.clone(),
                stale_after: options.stale_after_or(self.inner.config.default_stale_after),
                delete_after: options.delete_after_or(self.inner.config.default_delete_after),
                load,
            },
            Rc::downgrade(&self.inner),
        );
        debug!(%entry, resource, "entry created");

        self.inner
            .entries
            .borrow_mut()
            .entry(loader.id())
            .or_default()
            .insert(key, Rc::clone(&entry));
        Ok(entry)
    }

    fn lookup_key(&self, loader: LoaderId, key: &str) -> Option<Rc<CacheEntry>> {
        self.inner.entries.borrow().get(&loader).and_then(|by_params| by_params.get(key).cloned())
    }

    /// The entry for `loader` and `params`, if one exists.
    pub fn lookup<P: Serialize>(&self, loader: &Loader<P>, params: &P) -> Option<Rc<CacheEntry>> {
        let (_, key) = params_key(loader.name(), params).ok()?;
        self.lookup_key(loader.id(), &key)
    }

    /// Status of the entry for `loader` and `params`, if one exists.
    pub fn status<P: Serialize>(&self, loader: &Loader<P>, params: &P) -> Option<Status> {
        self.lookup(loader, params).map(|entry| entry.status())
    }

    /// Every entry, grouped by loader in creation order.
    pub fn entries(&self) -> Vec<Rc<CacheEntry>> {
        self.inner
            .entries
            .borrow()
            .values()
            .flat_map(|by_params| by_params.values().cloned())
            .collect()
    }

    /// Entries created by `loader`.
    pub fn entries_for(&self, loader: LoaderId) -> Vec<Rc<CacheEntry>> {
        self.inner
            .entries
            .borrow()
            .get(&loader)
            .map(|by_params| by_params.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.borrow().values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reload every entry of `loader` (or of every loader) whose parameters
    /// satisfy `predicate` (default: all).
    ///
    /// Returns the number of entries that started a load.
    pub fn reload_all(&self, loader: Option<LoaderId>, predicate: Option<&dyn Fn(&Json) -> bool>) -> usize {
        let candidates = match loader {
            Some(loader) => self.entries_for(loader),
            None => self.entries(),
        };
        let reloaded = candidates
            .iter()
            .filter(|entry| predicate.map_or(true, |matches| matches(entry.params())))
            .filter(|entry| entry.reload())
            .count();
        debug!(?loader, reloaded, "reload_all");
        reloaded
    }

    /// Revalidate every `Stale` entry, e.g. when the application regains focus.
    pub fn reload_stale(&self) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.status() == Status::Stale)
            .filter(|entry| entry.reload())
            .count()
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("config", &self.inner.config)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Observable;
    use serde_json::json;
    use std::cell::Cell;
    use std::time::Duration;
    use tokio::task::LocalSet;
    use tokio::time::sleep;

    fn counting_loader(name: &str, calls: Rc<Cell<usize>>) -> Loader<Json> {
        Loader::new(name, move |params: Json| {
            calls.set(calls.get() + 1);
            async move { Ok::<_, String>(params) }
        })
    }

    fn state() -> Observable {
        Observable::from_json("sub", &json!({})).unwrap()
    }

    #[test]
    fn same_params_share_an_entry() {
        let cache = ResourceCache::new();
        let loader = counting_loader("q", Rc::new(Cell::new(0)));

        let a = cache
            .entry_for("a", &ResourceOptions::new(loader.clone(), json!({ "x": 1, "y": 2 })))
            .unwrap();
        let b = cache
            .entry_for("b", &ResourceOptions::new(loader.clone(), json!({ "y": 2, "x": 1 })))
            .unwrap();
        let c = cache
            .entry_for("c", &ResourceOptions::new(loader.clone(), json!({ "x": 2 })))
            .unwrap();

        assert!(Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&loader, &json!({ "y": 2, "x": 1 })).is_some());
        assert_eq!(cache.status(&loader, &json!({ "x": 2 })), Some(Status::New));
    }

    fn status_of<P: Serialize>(cache: &ResourceCache, loader: &Loader<P>, params: &P) -> Option<Status> {
        cache.status(loader, params)
    }

    #[test]
    fn lookups_work_for_any_parameter_type() {
        let cache = ResourceCache::new();
        let loader = Loader::new("pair", |(a, b): (u8, u8)| async move { Ok::<_, String>(a + b) });
        assert_eq!(status_of(&cache, &loader, &(1, 2)), None);

        cache.entry_for("pair", &ResourceOptions::new(loader.clone(), (1, 2))).unwrap();
        assert_eq!(status_of(&cache, &loader, &(1, 2)), Some(Status::New));
        assert_eq!(loader.name(), "pair");
    }

    #[test]
    fn different_loaders_do_not_collide() {
        let cache = ResourceCache::new();
        let one = counting_loader("one", Rc::new(Cell::new(0)));
        let two = counting_loader("two", Rc::new(Cell::new(0)));

        let a = cache.entry_for("r", &ResourceOptions::new(one.clone(), json!(1))).unwrap();
        let b = cache.entry_for("r", &ResourceOptions::new(two.clone(), json!(1))).unwrap();
        assert!(!Rc::ptr_eq(&a, &b));
        assert_eq!(cache.entries_for(one.id()).len(), 1);
    }

    #[test]
    fn config_defaults_apply_to_new_entries() {
        let config = CacheConfig::default().with_stale_after(Duration::from_millis(10));
        let cache = ResourceCache::with_config(config);
        let loader = counting_loader("q", Rc::new(Cell::new(0)));

        let entry = cache.entry_for("r", &ResourceOptions::new(loader.clone(), json!(1))).unwrap();
        assert_eq!(entry.stale_after(), Duration::from_millis(10));
        assert_eq!(entry.delete_after(), config.default_delete_after);

        let custom = ResourceOptions::new(loader, json!(2)).delete_after(Duration::from_secs(1));
        let entry = cache.entry_for("r", &custom).unwrap();
        assert_eq!(entry.delete_after(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_all_filters_by_loader_and_predicate() {
        LocalSet::new()
            .run_until(async {
                let cache = ResourceCache::new();
                let calls = Rc::new(Cell::new(0));
                let users = counting_loader("users", Rc::clone(&calls));
                let posts = counting_loader("posts", Rc::new(Cell::new(0)));

                let subscribers: Vec<Observable> = (0..3).map(|_| state()).collect();
                for (page, sub) in subscribers.iter().enumerate() {
                    let entry = cache
                        .entry_for("users", &ResourceOptions::new(users.clone(), json!({ "page": page })))
                        .unwrap();
                    entry.add_subscriber(sub, true);
                }
                let other = state();
                cache
                    .entry_for("posts", &ResourceOptions::new(posts.clone(), json!({ "page": 0 })))
                    .unwrap()
                    .add_subscriber(&other, true);

                sleep(Duration::from_millis(1)).await;
                assert_eq!(calls.get(), 3);

                let even = |params: &Json| params["page"].as_u64().is_some_and(|p| p % 2 == 0);
                assert_eq!(cache.reload_all(Some(users.id()), Some(&even)), 2);
                sleep(Duration::from_millis(1)).await;
                assert_eq!(calls.get(), 5);

                assert_eq!(cache.reload_all(None, None), 4);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn reload_stale_only_touches_stale_entries() {
        LocalSet::new()
            .run_until(async {
                let cache = ResourceCache::new();
                let calls = Rc::new(Cell::new(0));
                let loader = counting_loader("q", Rc::clone(&calls));
                let sub = state();

                let options = ResourceOptions::new(loader, json!(1)).stale_after(Duration::from_millis(100));
                let entry = cache.entry_for("q", &options).unwrap();
                entry.add_subscriber(&sub, false);
                entry.set_enabled(&sub, true);
                sleep(Duration::from_millis(1)).await;
                assert_eq!(cache.reload_stale(), 0);

                sleep(Duration::from_millis(150)).await;
                assert_eq!(entry.status(), Status::Stale);
                assert_eq!(cache.reload_stale(), 1);
                assert_eq!(entry.status(), Status::Loading);
            })
            .await;
    }
}
