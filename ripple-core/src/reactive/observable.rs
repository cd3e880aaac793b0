//! Observable Implementation
//!
//! An Observable is a record or a list whose reads and writes are
//! interceptable. It is the reactive state container of Ripple.
//!
//! # How Observables Work
//!
//! 1. When a field is read while an effect generation is active, the
//!    generation's tracking token is registered against that field.
//!
//! 2. When a field is written and its value actually changed, every live
//!    token registered for that field is triggered. Dead tokens found along
//!    the way are dropped from the edge set.
//!
//! 3. Structural changes (keys added or removed, list length changes)
//!    additionally notify the synthetic [`Field::Length`].
//!
//! # Deep Reactivity
//!
//! Fields holding records or lists hold nested observables, each with its
//! own edge table. A read that returns one of them therefore returns
//! something that is itself trackable.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::context::ReactiveContext;
use super::scope::Scope;
use super::token::TrackingToken;
use super::value::Value;
use crate::error::ReactiveError;

/// Counter for generating unique observable IDs.
static OBSERVABLE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique observable ID.
fn next_observable_id() -> u64 {
    OBSERVABLE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A field of an observable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    /// A record key.
    Key(Rc<str>),
    /// A list index.
    Index(usize),
    /// Synthetic field notified on structural changes.
    Length,
}

impl From<&str> for Field {
    fn from(key: &str) -> Self {
        Field::Key(key.into())
    }
}

impl From<String> for Field {
    fn from(key: String) -> Self {
        Field::Key(key.into())
    }
}

impl From<Rc<str>> for Field {
    fn from(key: Rc<str>) -> Self {
        Field::Key(key)
    }
}

impl From<usize> for Field {
    fn from(index: usize) -> Self {
        Field::Index(index)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Key(key) => f.write_str(key),
            Field::Index(index) => write!(f, "{index}"),
            Field::Length => f.write_str("length"),
        }
    }
}

enum Shape {
    Record(IndexMap<Rc<str>, Value>),
    List(Vec<Value>),
}

type Edges = HashMap<Field, SmallVec<[Rc<TrackingToken>; 2]>>;

struct ObservableInner {
    id: u64,
    name: Rc<str>,
    data: RefCell<Shape>,
    /// Dependency edges, created lazily on first tracked read.
    edges: RefCell<Edges>,
}

/// A trackable record or list.
///
/// Cloning an `Observable` clones the handle; both handles share state, and
/// [`ptr_eq`](Observable::ptr_eq) is the identity used by the equality policy.
///
/// # Example
///
/// ```rust,ignore
/// let todo = Observable::record("todo");
/// todo.set("title", "write docs");
///
/// // Inside an effect, this read subscribes the effect to `title`.
/// let title = todo.get("title");
/// ```
#[derive(Clone)]
pub struct Observable {
    inner: Rc<ObservableInner>,
}

impl Observable {
    fn with_shape(name: impl Into<Rc<str>>, shape: Shape) -> Self {
        Self {
            inner: Rc::new(ObservableInner {
                id: next_observable_id(),
                name: name.into(),
                data: RefCell::new(shape),
                edges: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Create an empty record.
    pub fn record(name: impl Into<Rc<str>>) -> Self {
        Self::with_shape(name, Shape::Record(IndexMap::new()))
    }

    /// Create an empty list.
    pub fn list(name: impl Into<Rc<str>>) -> Self {
        Self::with_shape(name, Shape::List(Vec::new()))
    }

    /// Create a record from a JSON object, converting nested containers.
    pub fn record_from_json(name: &str, map: &serde_json::Map<String, serde_json::Value>) -> Self {
        let fields = map
            .iter()
            .map(|(key, value)| {
                let child_name = format!("{name}.{key}");
                (Rc::<str>::from(key.as_str()), Value::from_json(&child_name, value))
            })
            .collect();
        Self::with_shape(name, Shape::Record(fields))
    }

    /// Create a list from a JSON array, converting nested containers.
    pub fn list_from_json(name: &str, items: &[serde_json::Value]) -> Self {
        let items = items
            .iter()
            .enumerate()
            .map(|(index, value)| Value::from_json(&format!("{name}.{index}"), value))
            .collect();
        Self::with_shape(name, Shape::List(items))
    }

    /// Create an observable from a JSON object or array.
    pub fn from_json(name: &str, json: &serde_json::Value) -> Result<Self, ReactiveError> {
        match Value::from_json(name, json) {
            Value::Store(store) => Ok(store),
            other => Err(ReactiveError::failed(format!(
                "observable `{name}` needs an object or an array, got {}",
                other.kind_name()
            ))),
        }
    }

    /// Get the observable's unique ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Debug name of this observable.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_list(&self) -> bool {
        matches!(&*self.inner.data.borrow(), Shape::List(_))
    }

    pub fn is_record(&self) -> bool {
        !self.is_list()
    }

    /// Whether both handles point at the same observable.
    pub fn ptr_eq(&self, other: &Observable) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Map a field onto the addressing scheme of this observable's shape.
    fn resolve(&self, field: Field) -> Field {
        match (&*self.inner.data.borrow(), field) {
            (Shape::Record(_), Field::Index(index)) => Field::Key(index.to_string().into()),
            (Shape::List(_), Field::Key(key)) => {
                if &*key == "length" {
                    Field::Length
                } else if let Ok(index) = key.parse::<usize>() {
                    Field::Index(index)
                } else {
                    Field::Key(key)
                }
            }
            (_, field) => field,
        }
    }

    // ------------------------------------------------------------------
    // Dependency tracking
    // ------------------------------------------------------------------

    /// Register the active generation, if any, against `field`.
    fn track(&self, field: &Field) {
        let Some(token) = ReactiveContext::tracking_token() else {
            return;
        };
        trace!(store = %self.name(), %field, effect = token.effect_name(), "tracked read");

        let mut edges = self.inner.edges.borrow_mut();
        let tokens = edges.entry(field.clone()).or_default();
        if !tokens.iter().any(|t| Rc::ptr_eq(t, &token)) {
            tokens.push(token);
        }
    }

    /// Trigger every live token registered for `field`, then drop dead ones.
    fn notify(&self, field: &Field) {
        let tokens: SmallVec<[Rc<TrackingToken>; 2]> = match self.inner.edges.borrow().get(field) {
            Some(tokens) if !tokens.is_empty() => tokens.clone(),
            _ => return,
        };
        debug!(store = %self.name(), %field, "state changed");

        let mut found_dead = false;
        for token in &tokens {
            if !token.trigger() {
                found_dead = true;
            }
        }

        if found_dead {
            let mut edges = self.inner.edges.borrow_mut();
            if let Some(tokens) = edges.get_mut(field) {
                tokens.retain(|t| t.is_live());
                if tokens.is_empty() {
                    edges.remove(field);
                }
            }
        }
    }

    /// Number of tokens currently registered against `field`, live or not.
    pub fn subscriber_count(&self, field: impl Into<Field>) -> usize {
        let field = self.resolve(field.into());
        self.inner
            .edges
            .borrow()
            .get(&field)
            .map(|tokens| tokens.len())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn read(&self, field: &Field) -> Value {
        match (&*self.inner.data.borrow(), field) {
            (Shape::Record(map), Field::Key(key)) => map.get(key).cloned().unwrap_or_default(),
            (Shape::Record(map), Field::Length) => Value::from(map.len()),
            (Shape::List(items), Field::Index(index)) => items.get(*index).cloned().unwrap_or_default(),
            (Shape::List(items), Field::Length) => Value::from(items.len()),
            _ => Value::Null,
        }
    }

    /// Get a field's value, subscribing the active effect to it.
    ///
    /// Missing fields read as [`Value::Null`].
    pub fn get(&self, field: impl Into<Field>) -> Value {
        let field = self.resolve(field.into());
        self.track(&field);
        self.read(&field)
    }

    /// Get a field's value without tracking.
    pub fn get_untracked(&self, field: impl Into<Field>) -> Value {
        let field = self.resolve(field.into());
        self.read(&field)
    }

    /// Whether the field exists. Tracks the field.
    pub fn has(&self, field: impl Into<Field>) -> bool {
        let field = self.resolve(field.into());
        self.track(&field);
        match (&*self.inner.data.borrow(), &field) {
            (Shape::Record(map), Field::Key(key)) => map.contains_key(key),
            (Shape::List(items), Field::Index(index)) => *index < items.len(),
            (_, Field::Length) => true,
            _ => false,
        }
    }

    /// Number of keys or items. Tracks [`Field::Length`].
    pub fn len(&self) -> usize {
        self.track(&Field::Length);
        self.len_untracked()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn len_untracked(&self) -> usize {
        match &*self.inner.data.borrow() {
            Shape::Record(map) => map.len(),
            Shape::List(items) => items.len(),
        }
    }

    /// Record keys in insertion order, or list indices. Tracks [`Field::Length`].
    pub fn keys(&self) -> Vec<Field> {
        self.track(&Field::Length);
        match &*self.inner.data.borrow() {
            Shape::Record(map) => map.keys().cloned().map(Field::Key).collect(),
            Shape::List(items) => (0..items.len()).map(Field::Index).collect(),
        }
    }

    /// All list items, or all record values. Tracks every field and the length.
    pub fn values(&self) -> Vec<Value> {
        let keys = self.keys();
        keys.into_iter().map(|field| self.get(field)).collect()
    }

    /// Snapshot as JSON. Does not track.
    pub fn to_json(&self) -> serde_json::Value {
        match &*self.inner.data.borrow() {
            Shape::Record(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, value)| (key.to_string(), value.to_json()))
                    .collect(),
            ),
            Shape::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Set a field. Notifies only when the value is not the same as before.
    ///
    /// On lists, writing past the end pads with `Null`; writing
    /// [`Field::Length`] with a number resizes the list.
    pub fn set(&self, field: impl Into<Field>, value: impl Into<Value>) {
        let field = self.resolve(field.into());
        let value = value.into();

        if self.is_list() {
            self.set_list_field(field, value);
            return;
        }

        let Field::Key(key) = field else {
            debug!(store = %self.name(), %field, "ignored write to a non-key record field");
            return;
        };
        let added = {
            let mut data = self.inner.data.borrow_mut();
            let Shape::Record(map) = &mut *data else {
                return;
            };
            if map.get(&key).is_some_and(|old| old.same(&value)) {
                return;
            }
            map.insert(Rc::clone(&key), value).is_none()
        };

        self.notify(&Field::Key(key));
        if added {
            self.notify(&Field::Length);
        }
    }

    fn set_list_field(&self, field: Field, value: Value) {
        match field {
            Field::Index(index) => {
                let in_bounds = {
                    let mut data = self.inner.data.borrow_mut();
                    let Shape::List(items) = &mut *data else {
                        return;
                    };
                    match items.get_mut(index) {
                        Some(old) if old.same(&value) => return,
                        Some(old) => {
                            *old = value.clone();
                            true
                        }
                        None => false,
                    }
                };
                if in_bounds {
                    self.notify(&Field::Index(index));
                } else {
                    self.splice_with(|items| {
                        items.resize(index, Value::Null);
                        items.push(value);
                    });
                }
            }
            Field::Length => match value.as_u64() {
                Some(len) => {
                    self.splice_with(|items| items.resize(len as usize, Value::Null));
                }
                None => debug!(store = %self.name(), "ignored non-numeric length"),
            },
            Field::Key(key) => debug!(store = %self.name(), %key, "ignored keyed write on a list"),
        }
    }

    /// Delete a field. Returns whether something was removed.
    ///
    /// On lists, deleting an index clears it to `Null` without shifting.
    pub fn delete(&self, field: impl Into<Field>) -> bool {
        let field = self.resolve(field.into());
        if self.is_list() {
            let Field::Index(index) = field else {
                return false;
            };
            if index >= self.len_untracked() {
                return false;
            }
            self.set_list_field(Field::Index(index), Value::Null);
            return true;
        }

        let Field::Key(key) = field else {
            return false;
        };
        let removed = {
            let mut data = self.inner.data.borrow_mut();
            match &mut *data {
                Shape::Record(map) => map.shift_remove(&key).is_some(),
                Shape::List(_) => false,
            }
        };
        if removed {
            self.notify(&Field::Key(key));
            self.notify(&Field::Length);
        }
        removed
    }

    /// Append an item to a list.
    pub fn push(&self, value: impl Into<Value>) {
        let value = value.into();
        self.splice_with(|items| items.push(value));
    }

    /// Insert an item into a list, shifting later items. `index` is clamped to the length.
    pub fn insert(&self, index: usize, value: impl Into<Value>) {
        let value = value.into();
        self.splice_with(|items| {
            let index = index.min(items.len());
            items.insert(index, value);
        });
    }

    /// Remove an item from a list, shifting later items.
    pub fn remove(&self, index: usize) -> Option<Value> {
        if index >= self.len_untracked() {
            return None;
        }
        self.splice_with(|items| items.remove(index))
    }

    /// Shorten a list to `len` items.
    pub fn truncate(&self, len: usize) {
        if len < self.len_untracked() {
            self.splice_with(|items| items.truncate(len));
        }
    }

    /// Apply a structural change to a list, then notify every index whose
    /// value is no longer the same, and the length if it changed.
    fn splice_with<R>(&self, change: impl FnOnce(&mut Vec<Value>) -> R) -> Option<R> {
        let (result, changed, length_changed) = {
            let mut data = self.inner.data.borrow_mut();
            let Shape::List(items) = &mut *data else {
                debug!(store = %self.name(), "ignored list operation on a record");
                return None;
            };
            let before = items.clone();
            let result = change(items);

            let longest = before.len().max(items.len());
            let changed: Vec<usize> = (0..longest)
                .filter(|&i| match (before.get(i), items.get(i)) {
                    (Some(old), Some(new)) => !old.same(new),
                    (None, None) => false,
                    _ => true,
                })
                .collect();
            (result, changed, before.len() != items.len())
        };

        for index in changed {
            self.notify(&Field::Index(index));
        }
        if length_changed {
            self.notify(&Field::Length);
        }
        Some(result)
    }
}

impl Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("value", &self.to_json())
            .finish()
    }
}

/// Create a trackable store for component-local state.
///
/// The store is named after the innermost active scope, as `scope→name`.
pub fn use_observable(name: &str, initial: &serde_json::Value) -> Result<Observable, ReactiveError> {
    let debug_name = match Scope::current() {
        Some(scope) => format!("{}→{name}", scope.name()),
        None => format!("-→{name}"),
    };
    Observable::from_json(&debug_name, initial)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
