//! In-process native engine
//!
//! [`Isolate`] is a small script-engine core that implements
//! [`NativeEngine`]: a reference-counted slot table, a generational object
//! heap with templates and interceptors, and a mark-sweep collector that
//! reports weak slots whose objects died.
//!
//! ```text
//!   roots = global ∪ { slot.value | refs > 0 }
//!                  ∪ { slot.value | anchored ∧ ¬weak }
//!
//!   collect():  mark(roots) → fire weak slots with unmarked objects → sweep
//! ```
//!
//! Weak callbacks are delivered after the isolate lock is released, so a
//! callback may call straight back into the isolate.

mod heap;
mod slots;

use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use tether_sdk::{
    CallHandler, CallInfo, GcCallback, NamedInterceptor, NativeEngine, NativeError, NativeResult,
    NativeValue, ObjRef, ObjectId, SlotId, SlotRelease, TemplateId, TemplateSpec, ValueTag,
};

use crate::config::HeapOptions;
use heap::{HeapObject, ObjectHeap, ObjectKind};
use slots::SlotTable;

/// Collector statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsolateStats {
    /// Completed collections
    pub collections: usize,
    /// Heap objects reclaimed
    pub objects_freed: usize,
    /// Weak callbacks fired
    pub weak_callbacks: usize,
}

struct IsolateState {
    slots: SlotTable,
    heap: ObjectHeap,
    templates: Vec<TemplateSpec>,
    global: ObjRef,
    allocations: usize,
    gc_threshold: usize,
    stats: IsolateStats,
}

impl IsolateState {
    fn allocate(&mut self, object: HeapObject) -> ObjRef {
        self.allocations += 1;
        self.heap.allocate(object)
    }

    fn template(&self, id: TemplateId) -> NativeResult<&TemplateSpec> {
        self.templates
            .get(id.0 as usize)
            .ok_or(NativeError::UnknownTemplate(id))
    }

    fn interceptor(&self, r: ObjRef) -> NativeResult<Option<(Arc<dyn NamedInterceptor>, ObjectId)>> {
        let object = self.heap.get(r)?;
        Ok(object
            .template
            .and_then(|t| self.templates.get(t.0 as usize))
            .and_then(|spec| spec.interceptor.clone())
            .map(|interceptor| (interceptor, object.internal)))
    }

    fn call_handler(&self, r: ObjRef) -> NativeResult<Arc<dyn CallHandler>> {
        let object = self.heap.get(r)?;
        object
            .template
            .and_then(|t| self.templates.get(t.0 as usize))
            .and_then(|spec| spec.call_handler.clone())
            .ok_or(NativeError::NotCallable(ValueTag::Object))
    }

    fn holder_of(&self, value: &NativeValue) -> ObjectId {
        value
            .object_ref()
            .and_then(|r| self.heap.get(r).ok())
            .map(|o| o.internal)
            .unwrap_or(ObjectId::UNSET)
    }

    fn own_property(&self, r: ObjRef, name: &str) -> NativeResult<NativeValue> {
        let object = self.heap.get(r)?;
        if let Some(value) = object.properties.get(name) {
            return Ok(value.clone());
        }
        if object.kind == ObjectKind::Array && name == "length" {
            return Ok(NativeValue::Int32(object.elements.len() as i32));
        }
        Ok(NativeValue::Undefined)
    }

    fn collect(&mut self) -> (Vec<(SlotId, ObjectId)>, usize) {
        let mut roots = vec![self.global];
        for (_, slot) in self.slots.iter_live() {
            if let Some(r) = slot.value.object_ref() {
                if slot.refs > 0 || (!slot.anchor.is_unset() && !slot.weak) {
                    roots.push(r);
                }
            }
        }
        self.heap.mark(roots);

        let mut fired = Vec::new();
        for (id, slot) in self.slots.iter_live_mut() {
            if !slot.weak {
                continue;
            }
            if let Some(r) = slot.value.object_ref() {
                if !self.heap.is_marked(r) {
                    slot.weak = false;
                    fired.push((id, slot.anchor));
                }
            }
        }

        let freed = self.heap.sweep();
        self.allocations = 0;
        self.stats.collections += 1;
        self.stats.objects_freed += freed;
        self.stats.weak_callbacks += fired.len();
        (fired, freed)
    }
}

/// In-process script engine core
pub struct Isolate {
    state: Mutex<IsolateState>,
    gc_callback: RwLock<Option<GcCallback>>,
}

impl Isolate {
    /// Create an isolate with its global object
    pub fn new(options: &HeapOptions) -> Self {
        let mut heap = ObjectHeap::default();
        let global = heap.allocate(HeapObject::new(ObjectKind::Plain, None, ObjectId::UNSET));
        Self {
            state: Mutex::new(IsolateState {
                slots: SlotTable::with_capacity(options.initial_slots),
                heap,
                templates: Vec::new(),
                global,
                allocations: 0,
                gc_threshold: options.gc_threshold.max(1),
                stats: IsolateStats::default(),
            }),
            gc_callback: RwLock::new(None),
        }
    }

    /// Collector statistics
    pub fn stats(&self) -> IsolateStats {
        self.state.lock().stats.clone()
    }

    /// Reference count of a slot, `None` if stale
    pub fn slot_ref_count(&self, slot: SlotId) -> Option<u32> {
        self.state.lock().slots.get(slot).ok().map(|s| s.refs)
    }

    /// True if the slot is weak
    pub fn is_weak(&self, slot: SlotId) -> bool {
        self.state.lock().slots.get(slot).map(|s| s.weak).unwrap_or(false)
    }

    /// Tracked object a slot is anchored to
    pub fn slot_anchor(&self, slot: SlotId) -> Option<ObjectId> {
        self.state
            .lock()
            .slots
            .get(slot)
            .ok()
            .map(|s| s.anchor)
            .filter(|id| !id.is_unset())
    }

    /// Number of live slots
    pub fn live_slot_count(&self) -> usize {
        self.state.lock().slots.live_count()
    }

    /// Number of slots on the free list
    pub fn free_slot_count(&self) -> usize {
        self.state.lock().slots.free_count()
    }

    /// Number of live heap objects (including the global object)
    pub fn live_object_count(&self) -> usize {
        self.state.lock().heap.live_count()
    }

    /// Template class name of an object
    pub fn class_name(&self, value: &NativeValue) -> Option<String> {
        let state = self.state.lock();
        let object = state.heap.get(value.object_ref()?).ok()?;
        let template = object.template?;
        state.template(template).ok().map(|t| t.class_name.clone())
    }

    fn deliver(&self, fired: Vec<(SlotId, ObjectId)>) {
        if fired.is_empty() {
            return;
        }
        let callback = self.gc_callback.read().clone();
        match callback {
            Some(callback) => {
                for (slot, object) in fired {
                    trace!("Weak callback for {} (object {})", slot, object);
                    callback(slot, object);
                }
            }
            None => debug!("{} weak callbacks dropped: no callback installed", fired.len()),
        }
    }

    fn expect_object(value: &NativeValue) -> NativeResult<ObjRef> {
        value
            .object_ref()
            .ok_or_else(|| NativeError::NotAnObject(value.tag()))
    }
}

impl NativeEngine for Isolate {
    fn create_slot(&self, value: NativeValue) -> SlotId {
        self.state.lock().slots.allocate(value)
    }

    fn retain_slot(&self, slot: SlotId) -> NativeResult<u32> {
        self.state.lock().slots.retain(slot)
    }

    fn release_slot(&self, slot: SlotId) -> NativeResult<SlotRelease> {
        self.state.lock().slots.release(slot)
    }

    fn slot_value(&self, slot: SlotId) -> NativeResult<NativeValue> {
        Ok(self.state.lock().slots.get(slot)?.value.clone())
    }

    fn slot_tag(&self, slot: SlotId) -> NativeResult<ValueTag> {
        Ok(self.state.lock().slots.get(slot)?.value.tag())
    }

    fn anchor_slot(&self, slot: SlotId, object: ObjectId) -> NativeResult<()> {
        self.state.lock().slots.anchor(slot, object)
    }

    fn release_anchor(&self, slot: SlotId) -> NativeResult<SlotRelease> {
        self.state.lock().slots.release_anchor(slot)
    }

    fn make_weak(&self, slot: SlotId) -> NativeResult<()> {
        self.state.lock().slots.get_mut(slot)?.weak = true;
        Ok(())
    }

    fn clear_weak(&self, slot: SlotId) -> NativeResult<bool> {
        let mut state = self.state.lock();
        let target = state.slots.get(slot)?.value.object_ref();
        if let Some(r) = target {
            if !state.heap.contains(r) {
                return Ok(false);
            }
        }
        state.slots.get_mut(slot)?.weak = false;
        Ok(true)
    }

    fn is_alive(&self, slot: SlotId) -> bool {
        let state = self.state.lock();
        match state.slots.get(slot) {
            Ok(s) => s.value.object_ref().map(|r| state.heap.contains(r)).unwrap_or(true),
            Err(_) => false,
        }
    }

    fn create_template(&self, spec: TemplateSpec) -> TemplateId {
        let mut state = self.state.lock();
        let id = TemplateId(state.templates.len() as u32);
        state.templates.push(spec);
        id
    }

    fn create_object(&self, template: Option<TemplateId>, internal: ObjectId) -> NativeResult<NativeValue> {
        let mut state = self.state.lock();
        if let Some(t) = template {
            state.template(t)?;
        }
        let r = state.allocate(HeapObject::new(ObjectKind::Plain, template, internal));
        Ok(NativeValue::Object(r))
    }

    fn create_tracked_object(&self, template: TemplateId, internal: ObjectId) -> NativeResult<(SlotId, NativeValue)> {
        let mut state = self.state.lock();
        state.template(template)?;
        let r = state.allocate(HeapObject::new(ObjectKind::Plain, Some(template), internal));
        let value = NativeValue::Object(r);
        let slot = state.slots.allocate_anchored(value.clone(), internal);
        Ok((slot, value))
    }

    fn create_function(&self, template: TemplateId, internal: ObjectId) -> NativeResult<NativeValue> {
        let mut state = self.state.lock();
        state.template(template)?;
        let r = state.allocate(HeapObject::new(ObjectKind::Function, Some(template), internal));
        Ok(NativeValue::Function(r))
    }

    fn create_array(&self, elements: Vec<NativeValue>) -> NativeValue {
        let mut object = HeapObject::new(ObjectKind::Array, None, ObjectId::UNSET);
        object.elements = elements;
        let r = self.state.lock().allocate(object);
        NativeValue::Array(r)
    }

    fn global(&self) -> NativeValue {
        NativeValue::Object(self.state.lock().global)
    }

    fn object_id_of(&self, value: &NativeValue) -> ObjectId {
        self.state.lock().holder_of(value)
    }

    fn get_property(&self, target: &NativeValue, name: &str) -> NativeResult<NativeValue> {
        let r = Self::expect_object(target)?;
        let intercepted = self.state.lock().interceptor(r)?;
        if let Some((interceptor, holder)) = intercepted {
            if let Some(value) = interceptor.get(holder, name) {
                return Ok(value);
            }
        }
        self.state.lock().own_property(r, name)
    }

    fn set_property(&self, target: &NativeValue, name: &str, value: NativeValue) -> NativeResult<NativeValue> {
        let r = Self::expect_object(target)?;
        let intercepted = self.state.lock().interceptor(r)?;
        if let Some((interceptor, holder)) = intercepted {
            if let Some(result) = interceptor.set(holder, name, &value) {
                return Ok(result);
            }
        }
        let mut state = self.state.lock();
        state
            .heap
            .get_mut(r)?
            .properties
            .insert(name.to_string(), value.clone());
        Ok(value)
    }

    fn get_index(&self, target: &NativeValue, index: u32) -> NativeResult<NativeValue> {
        let r = Self::expect_object(target)?;
        let intercepted = self.state.lock().interceptor(r)?;
        if let Some((interceptor, holder)) = intercepted {
            if let Some(value) = interceptor.get_index(holder, index) {
                return Ok(value);
            }
        }
        let state = self.state.lock();
        let object = state.heap.get(r)?;
        if object.kind == ObjectKind::Array {
            return Ok(object
                .elements
                .get(index as usize)
                .cloned()
                .unwrap_or(NativeValue::Undefined));
        }
        state.own_property(r, &index.to_string())
    }

    fn set_index(&self, target: &NativeValue, index: u32, value: NativeValue) -> NativeResult<NativeValue> {
        let r = Self::expect_object(target)?;
        let intercepted = self.state.lock().interceptor(r)?;
        if let Some((interceptor, holder)) = intercepted {
            if let Some(result) = interceptor.set_index(holder, index, &value) {
                return Ok(result);
            }
        }
        let mut state = self.state.lock();
        let object = state.heap.get_mut(r)?;
        if object.kind == ObjectKind::Array {
            let index = index as usize;
            if object.elements.len() <= index {
                object.elements.resize(index + 1, NativeValue::Undefined);
            }
            object.elements[index] = value.clone();
        } else {
            object.properties.insert(index.to_string(), value.clone());
        }
        Ok(value)
    }

    fn property_names(&self, target: &NativeValue) -> NativeResult<Vec<String>> {
        let r = Self::expect_object(target)?;
        let intercepted = self.state.lock().interceptor(r)?;
        let mut names = match intercepted {
            Some((interceptor, holder)) => interceptor.names(holder),
            None => Vec::new(),
        };
        let state = self.state.lock();
        let object = state.heap.get(r)?;
        if object.kind == ObjectKind::Array {
            names.extend((0..object.elements.len()).map(|i| i.to_string()));
        }
        let mut own: Vec<String> = object
            .properties
            .keys()
            .filter(|k| !names.contains(k))
            .cloned()
            .collect();
        own.sort();
        names.extend(own);
        Ok(names)
    }

    fn call(&self, callee: &NativeValue, this: &NativeValue, args: &[NativeValue]) -> NativeResult<NativeValue> {
        let NativeValue::Function(r) = callee else {
            return Err(NativeError::NotCallable(callee.tag()));
        };
        let (handler, holder) = {
            let state = self.state.lock();
            (state.call_handler(*r)?, state.holder_of(this))
        };
        Ok(handler.call(CallInfo {
            this,
            holder,
            args,
            is_construct: false,
        }))
    }

    fn construct(&self, callee: &NativeValue, args: &[NativeValue]) -> NativeResult<NativeValue> {
        let NativeValue::Function(r) = callee else {
            return Err(NativeError::NotCallable(callee.tag()));
        };
        let handler = self.state.lock().call_handler(*r)?;
        Ok(handler.call(CallInfo {
            this: &NativeValue::Undefined,
            holder: ObjectId::UNSET,
            args,
            is_construct: true,
        }))
    }

    fn set_gc_callback(&self, callback: Option<GcCallback>) {
        *self.gc_callback.write() = callback;
    }

    fn collect(&self) -> usize {
        let (fired, freed) = self.state.lock().collect();
        debug!("Isolate GC: {} objects freed, {} weak callbacks", freed, fired.len());
        self.deliver(fired);
        freed
    }

    fn idle_gc_step(&self) -> bool {
        let due = {
            let state = self.state.lock();
            state.allocations >= state.gc_threshold
        };
        if due {
            self.collect();
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn isolate() -> Isolate {
        Isolate::new(&HeapOptions::default())
    }

    struct Counter {
        calls: AtomicUsize,
    }

    impl CallHandler for Counter {
        fn call(&self, info: CallInfo<'_>) -> NativeValue {
            self.calls.fetch_add(1, Ordering::SeqCst);
            NativeValue::Int32(info.args.len() as i32)
        }
    }

    struct Fixed;

    impl NamedInterceptor for Fixed {
        fn get(&self, holder: ObjectId, name: &str) -> Option<NativeValue> {
            (name == "id").then(|| NativeValue::Int32(holder.raw()))
        }

        fn set(&self, _holder: ObjectId, name: &str, _value: &NativeValue) -> Option<NativeValue> {
            (name == "id").then(|| NativeValue::error(tether_sdk::ErrorKind::Security, "read-only"))
        }
    }

    #[test]
    fn test_plain_properties() {
        let iso = isolate();
        let obj = iso.create_object(None, ObjectId::UNSET).unwrap();
        iso.set_property(&obj, "a", NativeValue::Int32(1)).unwrap();
        assert_eq!(iso.get_property(&obj, "a").unwrap(), NativeValue::Int32(1));
        assert_eq!(iso.get_property(&obj, "b").unwrap(), NativeValue::Undefined);
        assert_eq!(iso.property_names(&obj).unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_interceptor_takes_precedence() {
        let iso = isolate();
        let t = iso.create_template(TemplateSpec::named("Thing").with_interceptor(Arc::new(Fixed)));
        let obj = iso.create_object(Some(t), ObjectId::new(9)).unwrap();
        assert_eq!(iso.get_property(&obj, "id").unwrap(), NativeValue::Int32(9));
        assert!(iso.set_property(&obj, "id", NativeValue::Int32(1)).unwrap().is_error());
        iso.set_property(&obj, "other", NativeValue::Bool(true)).unwrap();
        assert_eq!(iso.get_property(&obj, "other").unwrap(), NativeValue::Bool(true));
        assert_eq!(iso.class_name(&obj).as_deref(), Some("Thing"));
        assert_eq!(iso.object_id_of(&obj), ObjectId::new(9));
    }

    #[test]
    fn test_arrays() {
        let iso = isolate();
        let arr = iso.create_array(vec![NativeValue::Int32(1)]);
        iso.set_index(&arr, 2, NativeValue::Int32(3)).unwrap();
        assert_eq!(iso.get_property(&arr, "length").unwrap(), NativeValue::Int32(3));
        assert_eq!(iso.get_index(&arr, 1).unwrap(), NativeValue::Undefined);
        assert_eq!(iso.get_index(&arr, 2).unwrap(), NativeValue::Int32(3));
    }

    #[test]
    fn test_call_and_construct() {
        let iso = isolate();
        let counter = Arc::new(Counter {
            calls: AtomicUsize::new(0),
        });
        let t = iso.create_template(TemplateSpec::named("f").with_call_handler(counter.clone()));
        let f = iso.create_function(t, ObjectId::marker(0)).unwrap();
        let args = [NativeValue::Null, NativeValue::Null];
        assert_eq!(iso.call(&f, &NativeValue::Undefined, &args).unwrap(), NativeValue::Int32(2));
        assert_eq!(iso.construct(&f, &[]).unwrap(), NativeValue::Int32(0));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);

        let err = iso.call(&NativeValue::Int32(1), &NativeValue::Undefined, &[]).unwrap_err();
        assert_eq!(err, NativeError::NotCallable(ValueTag::Int32));
    }

    #[test]
    fn test_unknown_template() {
        let iso = isolate();
        let err = iso.create_object(Some(TemplateId(42)), ObjectId::UNSET).unwrap_err();
        assert_eq!(err, NativeError::UnknownTemplate(TemplateId(42)));
    }

    #[test]
    fn test_referenced_slots_survive_collection() {
        let iso = isolate();
        let obj = iso.create_object(None, ObjectId::UNSET).unwrap();
        let slot = iso.create_slot(obj);
        iso.create_object(None, ObjectId::UNSET).unwrap();

        assert_eq!(iso.collect(), 1);
        assert!(iso.is_alive(slot));
        iso.release_slot(slot).unwrap();
        assert_eq!(iso.collect(), 1);
        assert_eq!(iso.live_object_count(), 1);
    }

    #[test]
    fn test_weak_anchor_fires_callback_after_unlock() {
        let iso = Arc::new(isolate());
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let reentrant = iso.clone();
        iso.set_gc_callback(Some(Arc::new(move |slot, object| {
            // Re-entering the isolate from the callback must not deadlock.
            assert!(!reentrant.is_alive(slot));
            sink.lock().push((slot, object));
        })));

        let obj = iso.create_object(None, ObjectId::new(0)).unwrap();
        let slot = iso.create_slot(obj);
        iso.anchor_slot(slot, ObjectId::new(0)).unwrap();
        assert_eq!(iso.release_slot(slot).unwrap(), SlotRelease::Deferred(ObjectId::new(0)));

        iso.collect();
        assert!(iso.is_alive(slot), "strong anchor keeps the object");
        assert!(fired.lock().is_empty());

        iso.make_weak(slot).unwrap();
        assert!(iso.is_weak(slot));
        iso.collect();
        assert_eq!(fired.lock().as_slice(), &[(slot, ObjectId::new(0))]);
        assert_eq!(iso.clear_weak(slot), Ok(false));
        assert_eq!(iso.release_anchor(slot).unwrap(), SlotRelease::Freed);
        assert_eq!(iso.stats().weak_callbacks, 1);
    }

    #[test]
    fn test_clear_weak_before_collection() {
        let iso = isolate();
        let obj = iso.create_object(None, ObjectId::new(0)).unwrap();
        let slot = iso.create_slot(obj);
        iso.anchor_slot(slot, ObjectId::new(0)).unwrap();
        iso.release_slot(slot).unwrap();
        iso.make_weak(slot).unwrap();
        assert_eq!(iso.clear_weak(slot), Ok(true));
        iso.collect();
        assert!(iso.is_alive(slot));
    }

    #[test]
    fn test_tracked_object_is_anchored_without_refs() {
        let iso = isolate();
        let template = iso.create_template(TemplateSpec::named("Thing"));
        let (slot, value) = iso.create_tracked_object(template, ObjectId::new(5)).unwrap();
        assert_eq!(iso.slot_ref_count(slot), Some(0));
        assert_eq!(iso.slot_anchor(slot), Some(ObjectId::new(5)));
        assert_eq!(iso.object_id_of(&value), ObjectId::new(5));
        assert_eq!(iso.class_name(&value).as_deref(), Some("Thing"));

        iso.collect();
        assert!(iso.is_alive(slot));
        assert_eq!(iso.release_anchor(slot).unwrap(), SlotRelease::Freed);
    }

    #[test]
    fn test_idle_step_respects_threshold() {
        let iso = Isolate::new(&HeapOptions {
            initial_slots: 4,
            gc_threshold: 2,
        });
        iso.create_object(None, ObjectId::UNSET).unwrap();
        assert!(!iso.idle_gc_step());
        iso.create_object(None, ObjectId::UNSET).unwrap();
        assert!(iso.idle_gc_step());
        assert_eq!(iso.stats().collections, 1);
    }
}
