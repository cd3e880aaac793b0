//! Paged Resources
//!
//! A paged loader fetches one page at a time and keeps every page loaded so
//! far in a single cache entry:
//!
//! ```text
//! { "pages": [ { "id": 0, "value": <page 0> }, { "id": 1, "value": <page 1> } ] }
//! ```
//!
//! A page announces a following page with `"hasMore": true`. Asking for the
//! next page loads only that page and appends it. Any other revalidation
//! reloads the pages loaded so far, in order, and stops at the first page
//! without `hasMore`. Pages carry their index as `id`, so mirroring keeps
//! each page's store across reloads.

use std::fmt::Display;
use std::future::Future;
use std::rc::Rc;

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Value as Json};
use tracing::{trace, warn};

use super::entry::CacheEntry;
use super::loader::{into_json, LoadContext, LoadFuture, Loader};
use super::registry::ResourceCache;
use super::resource::{subscribe, AttachmentSlot, ResourceOptions};
use crate::error::{LoadError, ReactiveError};
use crate::reactive::Observable;

/// Page field announcing that another page follows.
pub const HAS_MORE: &str = "hasMore";

type PageFn<P> = Rc<dyn Fn(P, usize) -> LoadFuture>;

impl<P: Clone + 'static> Loader<P> {
    /// Wrap an async function that loads page `index` for `params`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let feed = Loader::paged("feed", |query: Query, page: usize| async move {
    ///     api::feed(&query, page).await // { "items": [..], "hasMore": true }
    /// });
    /// ```
    pub fn paged<F, Fut, T, E>(name: &str, f: F) -> Self
    where
        F: Fn(P, usize) -> Fut + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
        T: Serialize,
        E: Display,
    {
        let page: PageFn<P> = Rc::new(move |params: P, index: usize| into_json(f(params, index)));
        Self::from_fn(
            name,
            Rc::new(move |params: P, context: LoadContext| load_pages(Rc::clone(&page), params, context).boxed_local()),
        )
    }
}

fn has_more(page: &Json) -> bool {
    page.get(HAS_MORE).and_then(Json::as_bool).unwrap_or(false)
}

fn page_record(index: usize, value: Json) -> Json {
    json!({ "id": index, "value": value })
}

async fn load_pages<P: Clone>(page: PageFn<P>, params: P, context: LoadContext) -> Result<Json, LoadError> {
    let previous: Vec<Json> = context
        .previous
        .as_deref()
        .and_then(|value| value.get("pages"))
        .and_then(Json::as_array)
        .cloned()
        .unwrap_or_default();

    if context.next_page && !previous.is_empty() {
        let mut pages = previous;
        let index = pages.len();
        trace!(index, "loading next page");
        let value = page(params, index).await?;
        pages.push(page_record(index, value));
        return Ok(json!({ "pages": pages }));
    }

    let wanted = previous.len().max(1);
    let mut pages = Vec::with_capacity(wanted);
    for index in 0..wanted {
        let value = page(params.clone(), index).await?;
        let more = has_more(&value);
        pages.push(page_record(index, value));
        if !more {
            break;
        }
    }
    trace!(wanted, loaded = pages.len(), "reloaded pages");
    Ok(json!({ "pages": pages }))
}

/// Handle of a paged subscription.
///
/// The subscriber state has the same fields as a plain resource; its
/// `value` holds the page list.
#[derive(Clone)]
pub struct PagedResource {
    state: Observable,
    attached: AttachmentSlot,
}

impl PagedResource {
    pub fn state(&self) -> &Observable {
        &self.state
    }

    /// The entry currently selected by the options.
    pub fn entry(&self) -> Option<Rc<CacheEntry>> {
        self.attached.borrow().as_ref().map(|attachment| Rc::clone(&attachment.entry))
    }

    /// Load one more page. Ignored unless the entry is `Loaded` or `Stale`.
    pub fn load_next_page(&self) -> bool {
        match self.entry() {
            Some(entry) => entry.load_next_page(),
            None => {
                warn!(state = %self.state.name(), "next page requested before the options were ready");
                false
            }
        }
    }

    /// Whether the last loaded page announced another one. Tracks.
    pub fn has_next_page(&self) -> bool {
        self.last_page()
            .and_then(|page| page.get("value").as_store().and_then(|value| value.get(HAS_MORE).as_bool()))
            .unwrap_or(false)
    }

    /// Number of loaded pages. Tracks.
    pub fn page_count(&self) -> usize {
        self.pages().map_or(0, |pages| pages.len())
    }

    fn pages(&self) -> Option<Observable> {
        let value = self.state.get("value");
        let value = value.as_store()?;
        value.get("pages").as_store().cloned()
    }

    fn last_page(&self) -> Option<Observable> {
        let pages = self.pages()?;
        let last = pages.len().checked_sub(1)?;
        pages.get(last).as_store().cloned()
    }
}

/// Subscribe the active scope to a paged resource. `options` must select a
/// loader built with [`Loader::paged`].
///
/// # Panics
///
/// Like [`use_resource`](super::use_resource), an enabled subscription panics
/// outside of a [`tokio::task::LocalSet`].
pub fn use_paged_resource<P, F>(cache: &ResourceCache, name: &str, options: F) -> Result<PagedResource, ReactiveError>
where
    P: Serialize + Clone + 'static,
    F: Fn() -> ResourceOptions<P> + 'static,
{
    let (state, attached) = subscribe(cache, name, options)?;
    Ok(PagedResource { state, attached })
}

impl ResourceCache {
    /// Subscribe the active scope to a paged resource. See [`use_paged_resource`].
    pub fn use_paged_resource<P, F>(&self, name: &str, options: F) -> Result<PagedResource, ReactiveError>
    where
        P: Serialize + Clone + 'static,
        F: Fn() -> ResourceOptions<P> + 'static,
    {
        use_paged_resource(self, name, options)
    }
}

impl std::fmt::Debug for PagedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedResource")
            .field("state", &self.state.name())
            .field("entry", &self.entry().map(|entry| entry.to_string()))
            .finish()
    }
}
