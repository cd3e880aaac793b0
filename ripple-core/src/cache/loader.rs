//! Loaders
//!
//! A loader is a named async function from parameters to a serializable
//! value. Its identity is assigned once at construction and shared by every
//! clone, and together with the canonical parameter key it selects a cache
//! entry.

use std::fmt::{self, Display};
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value as Json;

use crate::error::LoadError;

/// Counter for generating unique loader IDs.
static LOADER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique loader identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(u64);

impl LoaderId {
    fn next() -> Self {
        Self(LOADER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader#{}", self.0)
    }
}

pub(crate) type LoadFuture = LocalBoxFuture<'static, Result<Json, LoadError>>;
pub(crate) type LoadFn<P> = Rc<dyn Fn(P, LoadContext) -> LoadFuture>;

/// What the entry knows when it starts a load.
#[derive(Debug, Clone, Default)]
pub(crate) struct LoadContext {
    /// Value of the previous successful load, kept while revalidating.
    pub previous: Option<Rc<Json>>,
    /// A subscriber asked for one more page.
    pub next_page: bool,
}

/// Run a user future and store its outcome as JSON.
pub(crate) fn into_json<Fut, T, E>(future: Fut) -> LoadFuture
where
    Fut: Future<Output = Result<T, E>> + 'static,
    T: Serialize,
    E: Display,
{
    future
        .map(|result| match result {
            Ok(value) => serde_json::to_value(value).map_err(|err| LoadError::Failed(err.to_string())),
            Err(err) => Err(LoadError::Failed(err.to_string())),
        })
        .boxed_local()
}

/// A named async data source.
///
/// # Example
///
/// ```rust,ignore
/// let todos = Loader::new("todos", |page: u32| async move {
///     api::fetch_todos(page).await
/// });
/// ```
pub struct Loader<P> {
    id: LoaderId,
    name: Rc<str>,
    load: LoadFn<P>,
}

impl<P: 'static> Loader<P> {
    /// Wrap an async function. The value is stored as JSON and errors are
    /// recorded by their `Display` text.
    pub fn new<F, Fut, T, E>(name: &str, f: F) -> Self
    where
        F: Fn(P) -> Fut + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
        T: Serialize,
        E: Display,
    {
        Self::from_fn(name, Rc::new(move |params: P, _: LoadContext| into_json(f(params))))
    }

    pub(crate) fn from_fn(name: &str, load: LoadFn<P>) -> Self {
        Self {
            id: LoaderId::next(),
            name: name.into(),
            load,
        }
    }

    pub(crate) fn call(&self, params: P, context: LoadContext) -> LoadFuture {
        (self.load)(params, context)
    }
}

impl<P> Loader<P> {
    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<P> Clone for Loader<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: Rc::clone(&self.name),
            load: Rc::clone(&self.load),
        }
    }
}

impl<P> fmt::Debug for Loader<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader").field("id", &self.id).field("name", &self.name).finish()
    }
}
