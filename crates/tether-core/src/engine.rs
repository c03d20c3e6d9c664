//! Engine facade
//!
//! [`Engine`] is the composition root: it owns the native engine (through
//! the handle context), the object registry, the binder cache and the
//! lifetime coordinator.
//!
//! ```text
//!                    ┌──────────────── Engine ─────────────────┐
//!   host code ──────►│ create_value / bind / create_object     │
//!                    │ register_type / wrap_object / execute   │
//!                    └───┬──────────────┬───────────────┬──────┘
//!                        │              │               │
//!                 HandleContext   ObjectRegistry   LifetimeCoordinator
//!                        │              ▲               │
//!                        ▼              │               ▼
//!                  NativeEngine ── GC callback ──► ToFinalize queue
//! ```
//!
//! Engines are addressable by a small integer index. The GC callback
//! captures only that index and resolves the engine through a global table,
//! so a callback arriving after disposal finds nothing and is dropped.

use std::any::TypeId;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use dashmap::DashMap;
use log::{debug, trace, warn};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tether_sdk::{NativeEngine, NativeValue, ObjectId, ScriptError, SlotId};

use crate::binder::{share, HostKind, HostObject, HostType, Shared, TypeBinder, TypeDescription};
use crate::config::{BinderOptions, EngineOptions};
use crate::coordinator::{
    CoordinatorStats, FinalizeOutcome, LifetimeCoordinator, LifetimeHost, MarkOutcome, TerminateOutcome,
};
use crate::error::{BridgeError, BridgeResult};
use crate::frontend::ScriptFrontEnd;
use crate::handle::{Handle, HandleContext};
use crate::isolate::Isolate;
use crate::object::{HostRef, LifetimeState, TrackedObject};
use crate::registry::ObjectRegistry;

/// Live engines by index
static ENGINES: Lazy<RwLock<Vec<Option<Weak<EngineShared>>>>> = Lazy::new(|| RwLock::new(Vec::new()));

fn reserve_index() -> usize {
    let mut table = ENGINES.write();
    match table.iter().position(Option::is_none) {
        Some(index) => {
            table[index] = Some(Weak::new());
            index
        }
        None => {
            table.push(Some(Weak::new()));
            table.len() - 1
        }
    }
}

/// Engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Objects in the registry
    pub tracked_objects: usize,
    /// Tracked objects only the native side keeps alive
    pub weak_objects: usize,
    /// Cached type binders
    pub binders: usize,
    /// Coordinator counters
    pub coordinator: CoordinatorStats,
}

/// State shared by the facade, the binder callbacks and the coordinator
pub(crate) struct EngineShared {
    index: usize,
    this: Weak<EngineShared>,
    options: EngineOptions,
    handles: Arc<HandleContext>,
    registry: ObjectRegistry<TrackedObject>,
    binders: DashMap<TypeId, Arc<TypeBinder>>,
    markers: DashMap<ObjectId, TypeId>,
    next_marker: AtomicU32,
    /// Host cell address → tracked id, for bind-with-identity
    identity: Mutex<FxHashMap<usize, ObjectId>>,
    /// Strong owners of weak objects until the native GC lets go
    anchors: Mutex<FxHashMap<ObjectId, Arc<TrackedObject>>>,
    coordinator: LifetimeCoordinator,
    front_end: RwLock<Option<Arc<dyn ScriptFrontEnd>>>,
    disposed: AtomicBool,
}

impl EngineShared {
    pub(crate) fn by_index(index: usize) -> Option<Arc<EngineShared>> {
        let weak = ENGINES.read().get(index).cloned().flatten()?;
        weak.upgrade()
    }

    pub(crate) fn native(&self) -> BridgeResult<Arc<dyn NativeEngine>> {
        self.handles.native().map_err(|_| BridgeError::Disposed)
    }

    pub(crate) fn handles(&self) -> &Arc<HandleContext> {
        &self.handles
    }

    pub(crate) fn registry(&self) -> &ObjectRegistry<TrackedObject> {
        &self.registry
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn arc(&self) -> BridgeResult<Arc<EngineShared>> {
        self.this.upgrade().ok_or(BridgeError::Disposed)
    }

    /// Tracked object behind a native value, if it is a live bound object
    pub(crate) fn tracked_object(&self, value: &NativeValue) -> Option<Arc<TrackedObject>> {
        let native = self.native().ok()?;
        let id = native.object_id_of(value);
        if !id.is_tracked() {
            return None;
        }
        self.registry.lookup(id).filter(|object| object.value() == value)
    }

    // ------------------------------------------------------------------
    // Binders
    // ------------------------------------------------------------------

    /// Binder for a host type built with `options`. An existing binder with
    /// other options is replaced.
    pub(crate) fn register_binder(
        &self,
        type_id: TypeId,
        describe: fn() -> TypeDescription,
        options: BinderOptions,
    ) -> BridgeResult<Arc<TypeBinder>> {
        if self.is_disposed() {
            return Err(BridgeError::Disposed);
        }
        if let Some(existing) = self.binders.get(&type_id) {
            if existing.options() == options {
                return Ok(existing.clone());
            }
        }

        let desc = describe();
        let base = match &desc.base {
            Some(link) => Some(self.register_binder(link.type_id, link.describe, options)?),
            None => None,
        };
        let marker = ObjectId::marker(self.next_marker.fetch_add(1, Ordering::Relaxed));
        let binder = TypeBinder::build(&self.arc()?, desc, base, options, marker)?;
        if let Some(previous) = self.binders.insert(type_id, binder.clone()) {
            debug!(
                "Rebuilt binder {} with {:?} (was {:?})",
                binder.name(),
                options,
                previous.options()
            );
            self.markers.remove(&previous.marker());
        }
        self.markers.insert(marker, type_id);
        Ok(binder)
    }

    /// Cached binder of any options, or a new one with the engine defaults
    fn binder_for(&self, host: &HostObject) -> BridgeResult<Arc<TypeBinder>> {
        if let Some(binder) = self.binders.get(&host.type_id) {
            return Ok(binder.clone());
        }
        self.register_binder(host.type_id, host.describe, self.options.binder)
    }

    pub(crate) fn kind_by_name(&self, name: &str) -> Option<HostKind> {
        self.binders
            .iter()
            .find(|entry| entry.value().name() == name)
            .map(|entry| HostKind::Object {
                type_id: *entry.key(),
                name: entry.value().name(),
            })
    }

    pub(crate) fn kind_by_marker(&self, marker: ObjectId) -> Option<HostKind> {
        let type_id = *self.markers.get(&marker)?;
        let binder = self.binders.get(&type_id)?;
        Some(HostKind::Object {
            type_id,
            name: binder.name(),
        })
    }

    // ------------------------------------------------------------------
    // Tracking
    // ------------------------------------------------------------------

    fn track(&self, host: HostObject, binder: Arc<TypeBinder>) -> BridgeResult<Arc<TrackedObject>> {
        let native = self.native()?;
        let template = binder.instance_template();
        let addr = host.addr();
        let object = self.registry.register_with(|id| {
            let (slot, value) = native.create_tracked_object(template, id)?;
            Ok::<_, BridgeError>(Arc::new(TrackedObject::new(id, slot, value, host, binder, self.this.clone())))
        })?;
        self.identity.lock().insert(addr, object.id());
        trace!("Tracking {} {} in {}", object.type_name(), object.id(), object.slot());
        Ok(object)
    }

    /// Live tracked object already bound to the same host cell
    fn identified(&self, host: &HostObject) -> Option<Arc<TrackedObject>> {
        let id = *self.identity.lock().get(&host.addr())?;
        let native = self.native().ok()?;
        self.registry.lookup(id).filter(|object| {
            object.host().addr() == host.addr()
                && object.state() < LifetimeState::PendingFinalize
                && native.is_alive(object.slot())
        })
    }

    /// Track `host` (or find its existing object). The flag is true for a
    /// newly tracked object.
    fn bind_host(&self, host: HostObject) -> BridgeResult<(Arc<TrackedObject>, bool)> {
        if self.is_disposed() {
            return Err(BridgeError::Disposed);
        }
        if let Some(object) = self.identified(&host) {
            return Ok((object, false));
        }
        let binder = self.binder_for(&host)?;
        Ok((self.track(host, binder)?, true))
    }

    /// Bind a host object that only scripts will reference
    pub(crate) fn bind_host_object(&self, host: HostObject) -> BridgeResult<(Arc<TrackedObject>, NativeValue)> {
        let (object, created) = self.bind_host(host)?;
        if created {
            self.coordinator.enqueue_mark_weak(object.id());
        }
        let value = object.value().clone();
        Ok((object, value))
    }

    /// Attach a host reference, re-registering a weak object as strong
    fn pin<T: HostType>(&self, object: Arc<TrackedObject>, cell: Shared<T>) -> BridgeResult<HostRef<T>> {
        let native = self.native()?;
        let mut state = object.lock_state();
        match *state {
            LifetimeState::Strong => {}
            LifetimeState::Weak => {
                if !native.clear_weak(object.slot())? {
                    return Err(BridgeError::ObjectCollected(object.id()));
                }
                self.registry.mark_strong(object.id(), object.clone());
                self.anchors.lock().remove(&object.id());
                *state = LifetimeState::Strong;
                debug!("{} {} re-registered as strong", object.type_name(), object.id());
            }
            LifetimeState::PendingFinalize | LifetimeState::Finalized => {
                return Err(BridgeError::ObjectCollected(object.id()));
            }
        }
        let pinned = HostRef::attach(object.clone(), cell);
        drop(state);
        Ok(pinned)
    }

    fn host_ref<T: HostType>(&self, cell: Shared<T>) -> BridgeResult<HostRef<T>> {
        if self.is_disposed() {
            return Err(BridgeError::Disposed);
        }
        let host = HostObject::new(cell.clone());
        if let Some(object) = self.identified(&host) {
            return self.pin(object, cell);
        }
        let binder = self.binder_for(&host)?;
        let object = self.track(host, binder)?;
        Ok(HostRef::attach(object, cell))
    }

    /// New owned handle to a tracked object's native value
    pub(crate) fn handle_for(&self, object: &TrackedObject) -> BridgeResult<Handle> {
        if self.is_disposed() {
            return Err(BridgeError::Disposed);
        }
        if object.state() >= LifetimeState::PendingFinalize || !self.native()?.is_alive(object.slot()) {
            return Err(BridgeError::ObjectCollected(object.id()));
        }
        Ok(Handle::retained(&self.handles, object.slot())?)
    }

    /// The last [`HostRef`] of `id` was dropped
    pub(crate) fn host_refs_released(&self, id: ObjectId) {
        if !self.is_disposed() {
            self.coordinator.enqueue_mark_weak(id);
        }
    }

    fn value_handle(&self, value: NativeValue) -> BridgeResult<Handle> {
        Ok(Handle::from_value(&self.handles, value)?)
    }

    /// Wrap a script result; error values become [`BridgeError::Script`]
    fn script_result(&self, value: NativeValue) -> BridgeResult<Handle> {
        match value {
            NativeValue::Error(error) => Err(BridgeError::Script(error)),
            value => self.value_handle(value),
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Disposing engine {}", self.index);
        if let Some(entry) = ENGINES.write().get_mut(self.index) {
            *entry = None;
        }

        if self.coordinator.terminate(self.options.coordinator.terminate_timeout()) == TerminateOutcome::Forced {
            warn!("Engine {}: coordinator was forced to stop", self.index);
        }
        let dropped = self.coordinator.take_pending_finalize().len();
        if let Ok(native) = self.native() {
            native.set_gc_callback(None);
        }

        let objects = self.registry.drain();
        for object in &objects {
            object.set_state(LifetimeState::Finalized);
        }
        self.anchors.lock().clear();
        self.identity.lock().clear();
        self.front_end.write().take();

        let native = self.handles.poison();
        self.binders.clear();
        self.markers.clear();
        debug!(
            "Engine {} disposed ({} objects invalidated, {} finalize requests dropped)",
            self.index,
            objects.len(),
            dropped
        );
        drop(objects);
        drop(native);
    }
}

impl LifetimeHost for EngineShared {
    fn mark_weak(&self, id: ObjectId) -> MarkOutcome {
        let (Some(object), Ok(native)) = (self.registry.lookup(id), self.native()) else {
            return MarkOutcome::Skipped;
        };
        let mut state = object.lock_state();
        if *state != LifetimeState::Strong || object.host_ref_count() > 0 {
            return MarkOutcome::Skipped;
        }
        if let Err(e) = native.make_weak(object.slot()) {
            warn!("Cannot make {} of object {} weak: {}", object.slot(), id, e);
            return MarkOutcome::Skipped;
        }
        if let Some(strong) = self.registry.mark_weak(id) {
            self.anchors.lock().insert(id, strong);
        }
        *state = LifetimeState::Weak;
        MarkOutcome::Marked
    }

    fn finalize(&self, slot: SlotId, id: ObjectId) -> FinalizeOutcome {
        let Ok(native) = self.native() else {
            return FinalizeOutcome::Orphan;
        };
        let anchored = self.anchors.lock().get(&id).cloned();
        let Some(object) = anchored.filter(|object| object.slot() == slot) else {
            warn!("GC callback for untracked {} (object {}); releasing the slot", slot, id);
            if let Err(e) = native.release_anchor(slot) {
                warn!("Cannot release orphan {}: {}", slot, e);
            }
            return FinalizeOutcome::Orphan;
        };

        {
            let mut state = object.lock_state();
            if *state != LifetimeState::Weak {
                warn!("GC callback for object {} in state {:?}; ignored", id, *state);
                return FinalizeOutcome::Orphan;
            }
            *state = LifetimeState::PendingFinalize;
        }

        object.binder().teardown(&object);
        self.registry.release(id);
        self.anchors.lock().remove(&id);
        {
            let mut identity = self.identity.lock();
            let addr = object.host().addr();
            if identity.get(&addr) == Some(&id) {
                identity.remove(&addr);
            }
        }
        if let Err(e) = native.release_anchor(slot) {
            warn!("Cannot release {} of object {}: {}", slot, id, e);
        }
        object.set_state(LifetimeState::Finalized);
        FinalizeOutcome::Finalized
    }

    fn idle_gc_step(&self) -> bool {
        self.native().map(|native| native.idle_gc_step()).unwrap_or(false)
    }
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A script engine with its object bridge.
///
/// Clones share one engine. Dropping the last clone disposes it.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Engine with default options on an in-process [`Isolate`]
    pub fn new() -> Self {
        let options = EngineOptions::default();
        let native = Arc::new(Isolate::new(&options.heap));
        Self::build(native, options)
    }

    /// Engine on an in-process [`Isolate`]
    pub fn with_options(options: EngineOptions) -> BridgeResult<Self> {
        options.validate()?;
        let native = Arc::new(Isolate::new(&options.heap));
        Ok(Self::build(native, options))
    }

    /// Engine on a caller-supplied native engine
    pub fn with_native(native: Arc<dyn NativeEngine>, options: EngineOptions) -> BridgeResult<Self> {
        options.validate()?;
        Ok(Self::build(native, options))
    }

    fn build(native: Arc<dyn NativeEngine>, options: EngineOptions) -> Self {
        let index = reserve_index();
        let shared = Arc::new_cyclic(|this| EngineShared {
            index,
            this: this.clone(),
            handles: HandleContext::new(native.clone(), index),
            registry: ObjectRegistry::new(),
            binders: DashMap::new(),
            markers: DashMap::new(),
            next_marker: AtomicU32::new(0),
            identity: Mutex::new(FxHashMap::default()),
            anchors: Mutex::new(FxHashMap::default()),
            coordinator: LifetimeCoordinator::new(options.coordinator.clone(), index),
            front_end: RwLock::new(None),
            disposed: AtomicBool::new(false),
            options,
        });
        if let Some(entry) = ENGINES.write().get_mut(index) {
            *entry = Some(Arc::downgrade(&shared));
        }

        native.set_gc_callback(Some(Arc::new(move |slot: SlotId, object: ObjectId| match EngineShared::by_index(index) {
            Some(engine) => engine.coordinator.enqueue_finalize(slot, object),
            None => trace!("GC callback for {} after engine {} shut down", slot, index),
        })));
        let host: Weak<dyn LifetimeHost> = Arc::downgrade(&shared) as Weak<EngineShared>;
        shared.coordinator.start(host);
        debug!("Engine {} created", index);
        Self { shared }
    }

    /// The live engine at `index`
    pub fn by_index(index: usize) -> Option<Engine> {
        EngineShared::by_index(index).map(|shared| Engine { shared })
    }

    /// Index in the engine table
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Options the engine was created with
    pub fn options(&self) -> &EngineOptions {
        &self.shared.options
    }

    /// The native engine
    pub fn native(&self) -> BridgeResult<Arc<dyn NativeEngine>> {
        self.shared.native()
    }

    /// The lifetime coordinator
    pub fn coordinator(&self) -> &LifetimeCoordinator {
        &self.shared.coordinator
    }

    /// Counter snapshot
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            tracked_objects: self.shared.registry.count(),
            weak_objects: self.shared.anchors.lock().len(),
            binders: self.shared.binders.len(),
            coordinator: self.shared.coordinator.stats(),
        }
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    /// Store a primitive in a new handle
    pub fn create_value(&self, value: impl Into<NativeValue>) -> BridgeResult<Handle> {
        self.shared.native()?;
        self.shared.value_handle(value.into())
    }

    /// Store a point in time
    pub fn create_date(&self, time: SystemTime) -> BridgeResult<Handle> {
        self.create_value(NativeValue::from_system_time(time))
    }

    /// `undefined`
    pub fn undefined(&self) -> BridgeResult<Handle> {
        self.create_value(NativeValue::Undefined)
    }

    /// `null`
    pub fn null(&self) -> BridgeResult<Handle> {
        self.create_value(NativeValue::Null)
    }

    /// New array holding `elements`
    pub fn create_array(&self, elements: Vec<NativeValue>) -> BridgeResult<Handle> {
        let array = self.shared.native()?.create_array(elements);
        self.shared.value_handle(array)
    }

    /// The global object
    pub fn global(&self) -> BridgeResult<Handle> {
        let global = self.shared.native()?.global();
        self.shared.value_handle(global)
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    /// Binder for `T` with the engine's default binder options
    pub fn register_type<T: HostType>(&self) -> BridgeResult<Arc<TypeBinder>> {
        self.register_type_with::<T>(self.shared.options.binder)
    }

    /// Binder for `T` built with `options`; the cached binder is returned
    /// when its options match
    pub fn register_type_with<T: HostType>(&self, options: BinderOptions) -> BridgeResult<Arc<TypeBinder>> {
        self.shared
            .register_binder(TypeId::of::<T>(), TypeDescription::of::<T>, options)
    }

    /// Cached binder of `T`
    pub fn binder<T: HostType>(&self) -> Option<Arc<TypeBinder>> {
        self.shared.binders.get(&TypeId::of::<T>()).map(|b| b.clone())
    }

    /// Script constructor function of `T`
    pub fn constructor<T: HostType>(&self) -> BridgeResult<Handle> {
        let binder = match self.binder::<T>() {
            Some(binder) => binder,
            None => self.register_type::<T>()?,
        };
        let value = binder.constructor_value(&self.shared)?;
        self.shared.value_handle(value)
    }

    /// Publish `T`'s constructor as a global named after the type
    pub fn expose_type<T: HostType>(&self) -> BridgeResult<Handle> {
        let constructor = self.constructor::<T>()?;
        let native = self.shared.native()?;
        native.set_property(&native.global(), T::NAME, constructor.value()?)?;
        Ok(constructor)
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Track `value` and return a strong host reference to it
    pub fn create_object<T: HostType>(&self, value: T) -> BridgeResult<HostRef<T>> {
        self.shared.host_ref(share(value))
    }

    /// Track a shared cell (or re-acquire its tracked object)
    pub fn adopt<T: HostType>(&self, cell: &Shared<T>) -> BridgeResult<HostRef<T>> {
        self.shared.host_ref(cell.clone())
    }

    /// Host reference to the object behind a script value. A weak object is
    /// re-registered as strong.
    pub fn wrap_object<T: HostType>(&self, handle: &Handle) -> BridgeResult<HostRef<T>> {
        let object = self.tracked(handle)?;
        let cell = object.downcast::<T>().ok_or(BridgeError::TypeMismatch {
            expected: T::NAME,
            actual: object.type_name(),
        })?;
        self.shared.pin(object, cell)
    }

    /// Bind `value` for scripts. The host keeps no reference, so the object
    /// lives as long as scripts can reach it.
    pub fn bind<T: HostType>(&self, value: T) -> BridgeResult<Handle> {
        self.bind_shared(&share(value))
    }

    /// Bind a shared cell for scripts. Binding the same cell again yields
    /// the same script object while it is alive.
    pub fn bind_shared<T: HostType>(&self, cell: &Shared<T>) -> BridgeResult<Handle> {
        let (object, created) = self.shared.bind_host(HostObject::new(cell.clone()))?;
        let handle = self.shared.handle_for(&object)?;
        if created {
            self.shared.coordinator.enqueue_mark_weak(object.id());
        }
        Ok(handle)
    }

    /// Tracked object behind a script value
    pub fn tracked(&self, handle: &Handle) -> BridgeResult<Arc<TrackedObject>> {
        let value = handle.value()?;
        if let Some(object) = self.shared.tracked_object(&value) {
            return Ok(object);
        }
        let id = self.shared.native()?.object_id_of(&value);
        if id.is_tracked() {
            Err(BridgeError::ObjectCollected(id))
        } else {
            Err(BridgeError::NotBound(value.tag()))
        }
    }

    /// Registry lookup
    pub fn lookup(&self, id: ObjectId) -> Option<Arc<TrackedObject>> {
        self.shared.registry.lookup(id)
    }

    // ------------------------------------------------------------------
    // Script operations
    // ------------------------------------------------------------------

    /// `target[name]`
    pub fn get_property(&self, target: &Handle, name: &str) -> BridgeResult<Handle> {
        let value = self.shared.native()?.get_property(&target.value()?, name)?;
        self.shared.script_result(value)
    }

    /// `target[name] = value`
    pub fn set_property(&self, target: &Handle, name: &str, value: impl Into<NativeValue>) -> BridgeResult<Handle> {
        let stored = self
            .shared
            .native()?
            .set_property(&target.value()?, name, value.into())?;
        self.shared.script_result(stored)
    }

    /// `target[index]`
    pub fn get_index(&self, target: &Handle, index: u32) -> BridgeResult<Handle> {
        let value = self.shared.native()?.get_index(&target.value()?, index)?;
        self.shared.script_result(value)
    }

    /// `target[index] = value`
    pub fn set_index(&self, target: &Handle, index: u32, value: impl Into<NativeValue>) -> BridgeResult<Handle> {
        let stored = self
            .shared
            .native()?
            .set_index(&target.value()?, index, value.into())?;
        self.shared.script_result(stored)
    }

    /// Enumerable property names of `target`
    pub fn property_names(&self, target: &Handle) -> BridgeResult<Vec<String>> {
        Ok(self.shared.native()?.property_names(&target.value()?)?)
    }

    /// `target.name(args..)`
    pub fn call_method(&self, target: &Handle, name: &str, args: &[NativeValue]) -> BridgeResult<Handle> {
        let native = self.shared.native()?;
        let this = target.value()?;
        let callee = native.get_property(&this, name)?;
        match callee {
            NativeValue::Function(_) => {
                let result = native.call(&callee, &this, args)?;
                self.shared.script_result(result)
            }
            NativeValue::Error(error) => Err(BridgeError::Script(error)),
            other => Err(BridgeError::Script(ScriptError::type_error(format!(
                "{} is not a function ({})",
                name,
                other.tag()
            )))),
        }
    }

    /// `callee.call(this, args..)`
    pub fn call_function(&self, callee: &Handle, this: Option<&Handle>, args: &[NativeValue]) -> BridgeResult<Handle> {
        let this = match this {
            Some(handle) => handle.value()?,
            None => NativeValue::Undefined,
        };
        let result = self.shared.native()?.call(&callee.value()?, &this, args)?;
        self.shared.script_result(result)
    }

    /// `new callee(args..)`
    pub fn construct(&self, callee: &Handle, args: &[NativeValue]) -> BridgeResult<Handle> {
        let result = self.shared.native()?.construct(&callee.value()?, args)?;
        self.shared.script_result(result)
    }

    // ------------------------------------------------------------------
    // Front end
    // ------------------------------------------------------------------

    /// Install the script front end used by [`execute`](Self::execute)
    pub fn set_front_end(&self, front_end: Arc<dyn ScriptFrontEnd>) {
        *self.shared.front_end.write() = Some(front_end);
    }

    /// Run script source through the installed front end
    pub fn execute(&self, source: &str, origin: &str) -> BridgeResult<Handle> {
        if self.shared.is_disposed() {
            return Err(BridgeError::Disposed);
        }
        let front_end = self.shared.front_end.read().clone().ok_or(BridgeError::NoFrontEnd)?;
        front_end.execute(self, source, origin).map_err(BridgeError::Script)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Run a full native collection; returns the number of objects reclaimed.
    /// Weak objects found dead are queued for finalization.
    pub fn collect_garbage(&self) -> BridgeResult<usize> {
        Ok(self.shared.native()?.collect())
    }

    /// True after [`dispose`](Self::dispose)
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Stop the coordinator, invalidate every tracked object and handle,
    /// and release the native engine. Calling it again does nothing.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("index", &self.shared.index)
            .field("disposed", &self.is_disposed())
            .field("tracked", &self.shared.registry.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::TypeBuilder;
    use std::time::Duration;

    struct Probe {
        value: i32,
    }

    impl HostType for Probe {
        const NAME: &'static str = "Probe";

        fn describe(ty: &mut TypeBuilder<Self>) {
            ty.field("value", |p| p.value, |p, v| p.value = v);
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_engine_table() {
        let engine = Engine::new();
        let index = engine.index();
        let found = Engine::by_index(index).expect("engine is registered");
        assert_eq!(found.index(), index);
        drop(found);
        assert!(!engine.is_disposed(), "dropping a clone keeps the engine");

        engine.dispose();
        assert!(Engine::by_index(index).is_none());
    }

    #[test]
    fn test_binder_cache_by_options() {
        let engine = Engine::new();
        let a = engine.register_type::<Probe>().unwrap();
        let b = engine.register_type::<Probe>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = engine.register_type_with::<Probe>(BinderOptions::recursive()).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(&c, &engine.binder::<Probe>().unwrap()));
        assert_eq!(engine.stats().binders, 1);
    }

    #[test]
    fn test_identity_binding() {
        let engine = Engine::new();
        let cell = share(Probe { value: 1 });
        let a = engine.bind_shared(&cell).unwrap();
        let b = engine.bind_shared(&cell).unwrap();
        assert_eq!(a, b);
        assert_eq!(engine.stats().tracked_objects, 1);

        let pinned = engine.adopt(&cell).unwrap();
        assert_eq!(pinned.id(), engine.tracked(&a).unwrap().id());
    }

    #[test]
    fn test_marker_resolves_kind() {
        let engine = Engine::new();
        let ctor = engine.constructor::<Probe>().unwrap();
        let native = engine.native().unwrap();
        let marker = native.object_id_of(&ctor.value().unwrap());
        assert!(marker.is_marker());
        assert_eq!(engine.shared.kind_by_marker(marker), Some(HostKind::object::<Probe>()));
        assert_eq!(engine.shared.kind_by_name("Probe"), Some(HostKind::object::<Probe>()));
        assert_eq!(engine.shared.kind_by_name("Nope"), None);
    }

    #[test]
    fn test_weak_cycle_through_coordinator() {
        let engine = Engine::new();
        let handle = engine.bind(Probe { value: 2 }).unwrap();
        let object = engine.tracked(&handle).unwrap();
        assert!(engine.coordinator().flush(WAIT));
        assert_eq!(object.state(), LifetimeState::Weak);

        drop(handle);
        engine.collect_garbage().unwrap();
        assert!(engine.coordinator().flush(WAIT));
        assert_eq!(object.state(), LifetimeState::Finalized);
        assert!(engine.lookup(object.id()).is_none());
    }
}
