//! Object registry
//!
//! Maps integer [`ObjectId`]s to tracked host objects. Ids are registry
//! positions; released positions are reused LIFO. An entry is either strong
//! (the registry keeps the object alive) or weak (something else does, and
//! the entry only observes it).
//!
//! ```text
//!   entries: [ Strong(a) | Vacant | Weak(b) | Strong(c) ]
//!   free:    [ 1 ]                      ← next register() gets id 1
//! ```
//!
//! Lookups take the read lock only.

use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::RwLock;
use tether_sdk::ObjectId;

enum Entry<T> {
    Vacant,
    Strong(Arc<T>),
    Weak(Weak<T>),
}

struct Inner<T> {
    entries: Vec<Entry<T>>,
    free: Vec<usize>,
}

/// Registry of tracked objects keyed by [`ObjectId`]
pub struct ObjectRegistry<T> {
    inner: RwLock<Inner<T>>,
}

impl<T> ObjectRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Register an object built from its own id.
    ///
    /// `build` runs under the write lock and must not touch the registry. If
    /// it fails, the id is returned to the free list.
    pub fn register_with<E>(&self, build: impl FnOnce(ObjectId) -> Result<Arc<T>, E>) -> Result<Arc<T>, E> {
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.entries.push(Entry::Vacant);
                inner.entries.len() - 1
            }
        };

        match build(ObjectId::from_index(index)) {
            Ok(object) => {
                inner.entries[index] = Entry::Strong(object.clone());
                Ok(object)
            }
            Err(e) => {
                inner.free.push(index);
                Err(e)
            }
        }
    }

    /// Register an existing object
    pub fn register(&self, object: Arc<T>) -> ObjectId {
        let mut id = ObjectId::UNSET;
        let registered: Result<Arc<T>, ()> = self.register_with(|assigned| {
            id = assigned;
            Ok(object)
        });
        debug_assert!(registered.is_ok());
        id
    }

    /// Look up an object. Weak entries resolve only while the object is alive.
    pub fn lookup(&self, id: ObjectId) -> Option<Arc<T>> {
        let index = id.index()?;
        match self.inner.read().entries.get(index)? {
            Entry::Strong(object) => Some(object.clone()),
            Entry::Weak(object) => object.upgrade(),
            Entry::Vacant => None,
        }
    }

    /// Downgrade a strong entry. Returns the strong reference the registry
    /// held so the caller can take over ownership.
    pub fn mark_weak(&self, id: ObjectId) -> Option<Arc<T>> {
        let index = id.index()?;
        let mut inner = self.inner.write();
        let entry = inner.entries.get_mut(index)?;
        let Entry::Strong(object) = entry else {
            return None;
        };
        let object = object.clone();
        *entry = Entry::Weak(Arc::downgrade(&object));
        Some(object)
    }

    /// Upgrade a weak entry back to strong. Returns false if the entry is
    /// not a weak reference to `object`.
    pub fn mark_strong(&self, id: ObjectId, object: Arc<T>) -> bool {
        let Some(index) = id.index() else {
            return false;
        };
        let mut inner = self.inner.write();
        match inner.entries.get_mut(index) {
            Some(entry @ Entry::Weak(_)) => {
                let same = matches!(entry, Entry::Weak(w) if std::ptr::eq(w.as_ptr(), Arc::as_ptr(&object)));
                if same {
                    *entry = Entry::Strong(object);
                }
                same
            }
            _ => false,
        }
    }

    /// True if the entry exists and is weak
    pub fn is_weak(&self, id: ObjectId) -> bool {
        let Some(index) = id.index() else {
            return false;
        };
        matches!(self.inner.read().entries.get(index), Some(Entry::Weak(_)))
    }

    /// Vacate an entry and put its id on the free list
    pub fn release(&self, id: ObjectId) -> bool {
        let Some(index) = id.index() else {
            return false;
        };
        let mut inner = self.inner.write();
        match inner.entries.get_mut(index) {
            Some(entry @ (Entry::Strong(_) | Entry::Weak(_))) => {
                *entry = Entry::Vacant;
                inner.free.push(index);
                true
            }
            _ => {
                warn!("Release of unknown object {}", id);
                false
            }
        }
    }

    /// Number of occupied entries
    pub fn count(&self) -> usize {
        let inner = self.inner.read();
        inner.entries.len() - inner.free.len()
    }

    /// Number of reusable ids
    pub fn free_count(&self) -> usize {
        self.inner.read().free.len()
    }

    /// Ids of all occupied entries
    pub fn all_ids(&self) -> Vec<ObjectId> {
        self.inner
            .read()
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !matches!(entry, Entry::Vacant))
            .map(|(index, _)| ObjectId::from_index(index))
            .collect()
    }

    /// Remove every entry (for shutdown). Returns the objects still alive.
    pub fn drain(&self) -> Vec<Arc<T>> {
        let mut inner = self.inner.write();
        let entries = std::mem::take(&mut inner.entries);
        inner.free.clear();
        entries
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Strong(object) => Some(object),
                Entry::Weak(object) => object.upgrade(),
                Entry::Vacant => None,
            })
            .collect()
    }
}

impl<T> Default for ObjectRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
