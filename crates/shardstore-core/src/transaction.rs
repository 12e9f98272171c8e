//! Copy-on-write transactions
//!
//! A [`Transaction`] buffers writes and deletes over a shared target and
//! applies them in one step on [`Transaction::commit`]. Readers of the target
//! never observe a half-applied transaction: the overlay is private until
//! commit, and commit runs under a single write lock.
//!
//! ```text
//!   get(k):  pending delete? -> None
//!            overlay[k]?     -> overlay value
//!            otherwise       -> base value
//! ```
//!
//! Commit replays the buffered operations in issue order, so sequences
//! (where a write pads and an erase may shorten) end up exactly as if every
//! operation had been applied directly.

use crate::Record;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

/// Shared handle to a live target
pub type Shared<T> = Arc<RwLock<T>>;

/// Something a transaction can overlay: a keyed container with point reads,
/// writes and deletes.
pub trait TxTarget {
    type Key: Clone + Eq + Hash + fmt::Debug;
    type Value: Clone + PartialEq;

    fn read(&self, key: &Self::Key) -> Option<&Self::Value>;

    /// Keys in enumeration order
    fn keys(&self) -> Vec<Self::Key>;

    fn write(&mut self, key: Self::Key, value: Self::Value);

    /// Remove `key`; a missing key is a no-op
    fn erase(&mut self, key: &Self::Key);
}

impl TxTarget for Map<String, Value> {
    type Key = String;
    type Value = Value;

    fn read(&self, key: &String) -> Option<&Value> {
        self.get(key)
    }

    fn keys(&self) -> Vec<String> {
        Map::keys(self).cloned().collect()
    }

    fn write(&mut self, key: String, value: Value) {
        self.insert(key, value);
    }

    fn erase(&mut self, key: &String) {
        self.remove(key);
    }
}

impl TxTarget for Record {
    type Key = String;
    type Value = Value;

    fn read(&self, key: &String) -> Option<&Value> {
        self.get(key)
    }

    fn keys(&self) -> Vec<String> {
        Record::keys(self).cloned().collect()
    }

    fn write(&mut self, key: String, value: Value) {
        self.insert(key, value);
    }

    fn erase(&mut self, key: &String) {
        self.remove(key);
    }
}

/// Sequences are keyed by index. Writing past the end pads with
/// `T::default()`; erasing the last element shortens the sequence, erasing an
/// inner one leaves `T::default()` in its slot.
impl<T: Clone + PartialEq + Default> TxTarget for Vec<T> {
    type Key = usize;
    type Value = T;

    fn read(&self, key: &usize) -> Option<&T> {
        self.get(*key)
    }

    fn keys(&self) -> Vec<usize> {
        (0..self.len()).collect()
    }

    fn write(&mut self, key: usize, value: T) {
        if key >= self.len() {
            self.resize(key + 1, T::default());
        }
        self[key] = value;
    }

    fn erase(&mut self, key: &usize) {
        let key = *key;
        if key + 1 == self.len() {
            self.pop();
        } else if key < self.len() {
            self[key] = T::default();
        }
    }
}

/// One buffered operation
#[derive(Clone, Debug)]
enum Pending<K, V> {
    Write(K, V),
    Erase(K),
}

impl<K, V> Pending<K, V> {
    fn apply_to<T: TxTarget<Key = K, Value = V>>(self, target: &mut T) {
        match self {
            Self::Write(key, value) => target.write(key, value),
            Self::Erase(key) => target.erase(&key),
        }
    }
}

/// Copy-on-write overlay over a shared target
pub struct Transaction<T: TxTarget> {
    base: Shared<T>,
    delta: HashMap<T::Key, T::Value>,
    // first-write order of the keys in `delta`
    written: Vec<T::Key>,
    deletes: Vec<T::Key>,
    // every set and delete in issue order, replayed on commit
    log: Vec<Pending<T::Key, T::Value>>,
}

impl<T: TxTarget> Transaction<T> {
    /// Start a transaction over `base`
    pub fn start(base: Shared<T>) -> Self {
        Self {
            base,
            delta: HashMap::new(),
            written: Vec::new(),
            deletes: Vec::new(),
            log: Vec::new(),
        }
    }

    /// The observed target
    pub fn base(&self) -> &Shared<T> {
        &self.base
    }

    pub fn get(&self, key: &T::Key) -> Option<T::Value> {
        if self.deletes.contains(key) {
            return None;
        }
        if let Some(value) = self.delta.get(key) {
            return Some(value.clone());
        }
        self.base.read().read(key).cloned()
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.get(key).is_some()
    }

    /// Buffer `key = value`. Writing the base value back drops the overlay
    /// entry so the delta stays minimal.
    pub fn set(&mut self, key: T::Key, value: T::Value) {
        self.log.push(Pending::Write(key.clone(), value.clone()));
        self.deletes.retain(|pending| pending != &key);
        let unchanged = self.base.read().read(&key) == Some(&value);
        if unchanged {
            if self.delta.remove(&key).is_some() {
                self.written.retain(|written| written != &key);
            }
        } else if self.delta.insert(key.clone(), value).is_none() {
            self.written.push(key);
        }
    }

    /// Buffer a delete; deleting an already deleted key is a no-op
    pub fn delete(&mut self, key: &T::Key) {
        if self.deletes.contains(key) {
            return;
        }
        self.log.push(Pending::Erase(key.clone()));
        if self.delta.remove(key).is_some() {
            self.written.retain(|written| written != key);
        }
        self.deletes.push(key.clone());
    }

    /// Visible keys: base keys first, then overlay keys, without duplicates
    pub fn keys(&self) -> Vec<T::Key> {
        let mut keys: Vec<T::Key> = self
            .base
            .read()
            .keys()
            .into_iter()
            .filter(|key| !self.deletes.contains(key))
            .collect();
        for key in &self.written {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Visible `(key, value)` pairs in [`keys`](Self::keys) order
    pub fn entries(&self) -> Vec<(T::Key, T::Value)> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.get(&key).map(|value| (key, value)))
            .collect()
    }

    /// Whether anything is buffered
    pub fn is_dirty(&self) -> bool {
        !self.delta.is_empty() || !self.deletes.is_empty()
    }

    pub fn pending_writes(&self) -> usize {
        self.delta.len()
    }

    pub fn pending_deletes(&self) -> usize {
        self.deletes.len()
    }

    /// Replay the buffered operations on the base under one write lock and
    /// reset the overlay.
    pub fn commit(&mut self) {
        let (deletes, writes, operations) = (self.deletes.len(), self.delta.len(), self.log.len());
        {
            let mut base = self.base.write();
            for pending in self.log.drain(..) {
                pending.apply_to(&mut *base);
            }
        }
        self.rollback();
        debug!(deletes, writes, operations, "transaction committed");
    }

    /// Discard the overlay, leaving the base untouched
    pub fn rollback(&mut self) {
        self.delta.clear();
        self.written.clear();
        self.deletes.clear();
        self.log.clear();
    }
}

impl<T: TxTarget + Clone> Transaction<T> {
    /// The target as it would look after commit
    pub fn view(&self) -> T {
        let mut view = self.base.read().clone();
        for pending in &self.log {
            pending.clone().apply_to(&mut view);
        }
        view
    }
}

impl<V: Clone + PartialEq + Default> Transaction<Vec<V>> {
    /// One past the highest visible index
    pub fn len(&self) -> usize {
        self.keys().into_iter().max().map_or(0, |last| last + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append through the overlay
    pub fn push(&mut self, value: V) {
        let next = self.len();
        self.set(next, value);
    }
}

/// A second transaction over the same base, seeded with this overlay
impl<T: TxTarget> Clone for Transaction<T> {
    fn clone(&self) -> Self {
        Self {
            base: Arc::clone(&self.base),
            delta: self.delta.clone(),
            written: self.written.clone(),
            deletes: self.deletes.clone(),
            log: self.log.clone(),
        }
    }
}

impl<T: TxTarget> fmt::Debug for Transaction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("written", &self.written)
            .field("deletes", &self.deletes)
            .field("operations", &self.log.len())
            .finish()
    }
}
