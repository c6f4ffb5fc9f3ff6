//! Ordered handler lists.
//!
//! Shared by the event bus and both hook registries. Handlers run lowest
//! priority first; equal priorities run in registration order.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority used when a caller does not choose one.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Identifier of a registered handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerId(pub Uuid);

impl HandlerId {
    /// Generate a new id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One registered handler.
#[derive(Clone, Debug)]
pub struct Registered<T> {
    /// Handler id
    pub id: HandlerId,
    /// Run order key, lower first
    pub priority: i32,
    /// Plugin that registered the handler, if any
    pub owner: Option<String>,
    /// The handler itself
    pub handler: T,
    seq: u64,
}

/// Handlers kept sorted by `(priority, registration sequence)`.
#[derive(Clone, Debug)]
pub struct HandlerList<T> {
    entries: Vec<Registered<T>>,
    next_seq: u64,
}

impl<T> Default for HandlerList<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 0,
        }
    }
}

impl<T> HandlerList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler and return its id.
    pub fn insert(&mut self, priority: i32, owner: Option<&str>, handler: T) -> HandlerId {
        let seq = self.next_seq;
        self.insert_sequenced(seq, priority, owner, handler)
    }

    /// Register a handler under a sequence number drawn from a counter
    /// shared by several lists, so their snapshots merge in registration
    /// order.
    pub fn insert_sequenced(&mut self, seq: u64, priority: i32, owner: Option<&str>, handler: T) -> HandlerId {
        let id = HandlerId::generate();
        self.next_seq = self.next_seq.max(seq + 1);
        let entry = Registered {
            id,
            priority,
            owner: owner.map(str::to_string),
            handler,
            seq,
        };
        let at = self
            .entries
            .partition_point(|e| (e.priority, e.seq) <= (priority, seq));
        self.entries.insert(at, entry);
        id
    }

    /// Remove a handler by id.
    pub fn remove(&mut self, id: HandlerId) -> Option<Registered<T>> {
        let at = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(at))
    }

    /// Remove every handler registered by `owner`.
    pub fn remove_owner(&mut self, owner: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.owner.as_deref() != Some(owner));
        before - self.entries.len()
    }

    /// Whether a handler id is registered.
    pub fn contains(&self, id: HandlerId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handlers in run order.
    pub fn iter(&self) -> impl Iterator<Item = &Registered<T>> {
        self.entries.iter()
    }
}

impl<T: Clone> HandlerList<T> {
    /// Copy of the handlers in run order.
    ///
    /// Dispatch works on a snapshot so handlers may register or remove
    /// handlers while they run.
    pub fn snapshot(&self) -> Snapshot<T> {
        Snapshot(self.entries.clone())
    }
}

/// Handlers captured for one dispatch.
#[derive(Clone, Debug)]
pub struct Snapshot<T>(Vec<Registered<T>>);

impl<T> Snapshot<T> {
    /// Invoke every handler in order; returns how many were invoked.
    pub fn broadcast<F>(&self, mut call: F) -> usize
    where
        F: FnMut(&Registered<T>),
    {
        for entry in &self.0 {
            call(entry);
        }
        self.0.len()
    }

    /// Thread a value through every handler in order.
    pub fn reduce<V, F>(&self, init: V, mut step: F) -> V
    where
        F: FnMut(V, &Registered<T>) -> V,
    {
        self.0.iter().fold(init, |acc, entry| step(acc, entry))
    }

    /// Number of captured handlers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only the handlers matching `keep`.
    pub fn retain<F: FnMut(&Registered<T>) -> bool>(&mut self, keep: F) {
        self.0.retain(keep);
    }

    /// Merge another snapshot, ordering by priority then sequence.
    pub fn merge(mut self, other: Snapshot<T>) -> Self {
        self.0.extend(other.0);
        self.0.sort_by_key(|e| (e.priority, e.seq));
        self
    }
}

impl<T> IntoIterator for Snapshot<T> {
    type Item = Registered<T>;
    type IntoIter = std::vec::IntoIter<Registered<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
