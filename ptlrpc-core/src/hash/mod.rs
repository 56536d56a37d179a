//! Generic two-level locked hash table.
//!
//! [`ClassHash`] maps a key (uuid, nid or process id) to shared objects. A
//! table-wide [`RwLock`] guards only the bucket array; each bucket carries its
//! own [`Mutex`] around its chain, so lookups in different buckets never
//! contend.
//!
//! Chains keep the most recently inserted object at the head, and every scan
//! runs the table's [`HashOps::compare`], which is where "failed" objects are
//! hidden from lookups.

mod ops;

pub use ops::{djb2, HashOps};

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors returned by [`ClassHash`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HashError {
    /// A unique insert found a matching object already linked.
    #[error("key already present")]
    AlreadyExists,

    /// No object matches the key.
    #[error("key not found")]
    NotFound,

    /// The table has been torn down.
    #[error("hash table torn down")]
    TornDown,

    /// Table size must be non-zero.
    #[error("hash table size must be non-zero")]
    ZeroSize,

    /// Table size must be a power of two so the index is a mask.
    #[error("hash table size {size} is not a power of two")]
    SizeNotPowerOfTwo {
        /// Rejected size.
        size: u32,
    },
}

type Chain<V> = Mutex<VecDeque<Arc<V>>>;

/// Concurrent hash table with pluggable hash, compare and reference hooks.
pub struct ClassHash<O: HashOps> {
    name: String,
    ops: O,
    mask: u32,
    buckets: RwLock<Option<Box<[Chain<O::Object>]>>>,
}

impl<O: HashOps> ClassHash<O> {
    /// Create a table with `size` buckets.
    ///
    /// # Errors
    ///
    /// `size` must be a non-zero power of two.
    pub fn new(name: impl Into<String>, size: u32, ops: O) -> Result<Self, HashError> {
        if size == 0 {
            return Err(HashError::ZeroSize);
        }
        if !size.is_power_of_two() {
            return Err(HashError::SizeNotPowerOfTwo { size });
        }

        let buckets: Box<[Chain<O::Object>]> =
            (0..size).map(|_| Mutex::new(VecDeque::new())).collect();

        Ok(Self {
            name: name.into(),
            ops,
            mask: size - 1,
            buckets: RwLock::new(Some(buckets)),
        })
    }

    /// Table name, used in log output.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operation set of this table.
    pub fn ops(&self) -> &O {
        &self.ops
    }

    fn index(&self, key: &O::Key) -> usize {
        (self.ops.hash(key, self.mask) & self.mask) as usize
    }

    /// Link `object` under `key` unless a matching object is already present.
    ///
    /// # Errors
    ///
    /// [`HashError::AlreadyExists`] leaves the table untouched.
    pub fn add_unique(&self, key: &O::Key, object: Arc<O::Object>) -> Result<(), HashError> {
        let table = self.buckets.read();
        let buckets = table.as_deref().ok_or(HashError::TornDown)?;
        let mut chain = buckets[self.index(key)].lock();

        if chain.iter().any(|o| self.ops.compare(key, o)) {
            debug!(hash = %self.name, "unique insert refused, key present");
            return Err(HashError::AlreadyExists);
        }

        self.ops.get(&object);
        chain.push_front(object);
        Ok(())
    }

    /// Link `object` under `key`, allowing other objects with the same key.
    pub fn add(&self, key: &O::Key, object: Arc<O::Object>) -> Result<(), HashError> {
        let table = self.buckets.read();
        let buckets = table.as_deref().ok_or(HashError::TornDown)?;
        let mut chain = buckets[self.index(key)].lock();

        self.ops.get(&object);
        chain.push_front(object);
        Ok(())
    }

    /// First object matching `key`, with a reference taken for the caller.
    pub fn get(&self, key: &O::Key) -> Option<Arc<O::Object>> {
        let table = self.buckets.read();
        let buckets = table.as_deref()?;
        let chain = buckets[self.index(key)].lock();

        let found = chain.iter().find(|o| self.ops.compare(key, o))?;
        self.ops.get(found);
        Some(Arc::clone(found))
    }

    /// Unlink the first object matching `key`.
    ///
    /// # Errors
    ///
    /// [`HashError::NotFound`] if nothing matches.
    pub fn del_key(&self, key: &O::Key) -> Result<(), HashError> {
        self.unlink(key, |o| self.ops.compare(key, o))
            .map(|_| ())
            .ok_or(HashError::NotFound)
    }

    /// Unlink exactly `object`, which was inserted under `key`.
    ///
    /// # Errors
    ///
    /// [`HashError::NotFound`] if `object` is not linked in `key`'s bucket.
    pub fn del(&self, key: &O::Key, object: &Arc<O::Object>) -> Result<(), HashError> {
        self.unlink(key, |o| Arc::ptr_eq(o, object))
            .map(|_| ())
            .ok_or(HashError::NotFound)
    }

    /// Unlink `object` if `pred` holds while the bucket is locked.
    ///
    /// Returns whether the object was removed.
    pub fn remove_if<F>(&self, key: &O::Key, object: &Arc<O::Object>, pred: F) -> bool
    where
        F: FnOnce(&Arc<O::Object>) -> bool,
    {
        let mut pred = Some(pred);
        self.unlink(key, |o| {
            Arc::ptr_eq(o, object) && pred.take().is_some_and(|p| p(o))
        })
        .is_some()
    }

    fn unlink<F>(&self, key: &O::Key, mut matches: F) -> Option<Arc<O::Object>>
    where
        F: FnMut(&Arc<O::Object>) -> bool,
    {
        let table = self.buckets.read();
        let buckets = table.as_deref()?;

        let removed = {
            let mut chain = buckets[self.index(key)].lock();
            let pos = chain.iter().position(&mut matches)?;
            chain.remove(pos)?
        };

        // Release outside the bucket lock.
        self.ops.put(&removed);
        Some(removed)
    }

    /// Visit every object matching `key`.
    ///
    /// The bucket stays locked for the duration, so `visit` must not touch
    /// this table.
    pub fn for_each_matching<F>(&self, key: &O::Key, mut visit: F)
    where
        F: FnMut(&Arc<O::Object>),
    {
        let table = self.buckets.read();
        let Some(buckets) = table.as_deref() else {
            return;
        };
        let chain = buckets[self.index(key)].lock();

        for object in chain.iter().filter(|o| self.ops.compare(key, o)) {
            self.ops.get(object);
            visit(object);
            self.ops.put(object);
        }
    }

    /// Number of linked objects.
    pub fn len(&self) -> usize {
        self.buckets
            .read()
            .as_deref()
            .map_or(0, |buckets| buckets.iter().map(|chain| chain.lock().len()).sum())
    }

    /// Whether no object is linked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unlink and release every object.
    ///
    /// Callers must have stopped all inserts and lookups. Calling this twice is
    /// harmless.
    pub fn teardown(&self) {
        let Some(buckets) = self.buckets.write().take() else {
            warn!(hash = %self.name, "hash already torn down");
            return;
        };

        let released: Vec<Arc<O::Object>> = buckets
            .iter()
            .flat_map(|chain| std::mem::take(&mut *chain.lock()))
            .collect();

        debug!(hash = %self.name, released = released.len(), "hash torn down");
        for object in &released {
            self.ops.put(object);
        }
    }
}

impl<O: HashOps> Drop for ClassHash<O> {
    fn drop(&mut self) {
        if self.buckets.get_mut().is_some() {
            self.teardown();
        }
    }
}

impl<O: HashOps> std::fmt::Debug for ClassHash<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassHash")
            .field("name", &self.name)
            .field("size", &(self.mask + 1))
            .finish_non_exhaustive()
    }
}
