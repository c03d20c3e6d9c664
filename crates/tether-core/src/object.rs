//! Tracked host objects
//!
//! A [`TrackedObject`] pairs a host value with the native object that
//! represents it in scripts. Its lifetime moves strictly forward:
//!
//! ```text
//!   Strong ──(last HostRef dropped)──► Weak ──(native GC callback)──► PendingFinalize ──► Finalized
//!     ▲                                  │
//!     └──────────(wrap_object)───────────┘
//! ```
//!
//! While `Strong`, the registry keeps the object alive. In `Weak`, only the
//! native side does (through the coordinator's anchor table), and the native
//! collector may reclaim the script object once unreachable.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLockReadGuard, RwLockWriteGuard};
use tether_sdk::{NativeValue, ObjectId, SlotId};

use crate::binder::{HostObject, HostType, Shared, SharedAny, TypeBinder};
use crate::engine::EngineShared;
use crate::error::BridgeResult;
use crate::handle::Handle;

/// Lifetime state of a tracked object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LifetimeState {
    /// Host code holds references; the registry entry is strong
    Strong,
    /// Only scripts may reference it; the native collector decides
    Weak,
    /// The native object died; teardown is running
    PendingFinalize,
    /// Fully released
    Finalized,
}

/// A host object bound to a native object
pub struct TrackedObject {
    id: ObjectId,
    slot: SlotId,
    value: NativeValue,
    host: HostObject,
    binder: Arc<TypeBinder>,
    engine: Weak<EngineShared>,
    state: Mutex<LifetimeState>,
    host_refs: AtomicUsize,
}

impl TrackedObject {
    pub(crate) fn new(
        id: ObjectId,
        slot: SlotId,
        value: NativeValue,
        host: HostObject,
        binder: Arc<TypeBinder>,
        engine: Weak<EngineShared>,
    ) -> Self {
        Self {
            id,
            slot,
            value,
            host,
            binder,
            engine,
            state: Mutex::new(LifetimeState::Strong),
            host_refs: AtomicUsize::new(0),
        }
    }

    /// Registry id
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Anchored native slot
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Native object value
    pub fn value(&self) -> &NativeValue {
        &self.value
    }

    /// Script-visible type name
    pub fn type_name(&self) -> &'static str {
        self.binder.name()
    }

    /// Host type id
    pub fn type_id(&self) -> TypeId {
        self.host.type_id
    }

    /// Binder of the object's host type
    pub fn binder(&self) -> &Arc<TypeBinder> {
        &self.binder
    }

    /// Current lifetime state
    pub fn state(&self) -> LifetimeState {
        *self.state.lock()
    }

    /// Number of live [`HostRef`]s
    pub fn host_ref_count(&self) -> usize {
        self.host_refs.load(Ordering::Acquire)
    }

    /// Typed access to the host value
    pub fn downcast<T: HostType>(&self) -> Option<Shared<T>> {
        self.host.downcast::<T>()
    }

    pub(crate) fn host(&self) -> &HostObject {
        &self.host
    }

    pub(crate) fn cell(&self) -> &SharedAny {
        &self.host.cell
    }

    pub(crate) fn read_cell(&self) -> RwLockReadGuard<'_, dyn Any + Send + Sync> {
        self.host.cell.read()
    }

    pub(crate) fn write_cell(&self) -> RwLockWriteGuard<'_, dyn Any + Send + Sync> {
        self.host.cell.write()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, LifetimeState> {
        self.state.lock()
    }

    pub(crate) fn set_state(&self, state: LifetimeState) {
        let mut current = self.state.lock();
        debug_assert!(state >= *current, "lifetime state moved backwards");
        *current = state;
    }
}

impl fmt::Debug for TrackedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedObject")
            .field("id", &self.id)
            .field("type", &self.type_name())
            .field("slot", &self.slot)
            .field("state", &self.state.try_lock().map(|s| *s))
            .field("host_refs", &self.host_ref_count())
            .finish()
    }
}

/// Typed host-side reference to a tracked object.
///
/// While at least one `HostRef` exists the object stays `Strong`. Dropping
/// the last one queues the object to be made weak.
pub struct HostRef<T: HostType> {
    object: Arc<TrackedObject>,
    cell: Shared<T>,
}

impl<T: HostType> HostRef<T> {
    /// Caller must hold the object's state lock when racing with the
    /// coordinator.
    pub(crate) fn attach(object: Arc<TrackedObject>, cell: Shared<T>) -> Self {
        object.host_refs.fetch_add(1, Ordering::AcqRel);
        Self { object, cell }
    }

    /// Registry id
    pub fn id(&self) -> ObjectId {
        self.object.id
    }

    /// Current lifetime state
    pub fn state(&self) -> LifetimeState {
        self.object.state()
    }

    /// The tracked object
    pub fn object(&self) -> &Arc<TrackedObject> {
        &self.object
    }

    /// Shared cell holding the host value
    pub fn shared(&self) -> &Shared<T> {
        &self.cell
    }

    /// Read the host value
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.cell.read()
    }

    /// Mutate the host value
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.cell.write()
    }

    /// New handle to the native object
    pub fn handle(&self) -> BridgeResult<Handle> {
        let engine = self
            .object
            .engine
            .upgrade()
            .ok_or(crate::error::BridgeError::Disposed)?;
        engine.handle_for(&self.object)
    }
}

impl<T: HostType> Clone for HostRef<T> {
    fn clone(&self) -> Self {
        Self::attach(self.object.clone(), self.cell.clone())
    }
}

impl<T: HostType> Drop for HostRef<T> {
    fn drop(&mut self) {
        if self.object.host_refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(engine) = self.object.engine.upgrade() {
                engine.host_refs_released(self.object.id);
            }
        }
    }
}

impl<T: HostType> fmt::Debug for HostRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRef")
            .field("id", &self.object.id)
            .field("type", &T::NAME)
            .finish()
    }
}
