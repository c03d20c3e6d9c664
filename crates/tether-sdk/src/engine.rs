//! The native engine contract
//!
//! The bridge drives a script engine through [`NativeEngine`]. The engine
//! owns a reference-counted slot table and a garbage-collected object heap:
//!
//! ```text
//!   host side                    native side
//!   ─────────                    ───────────
//!   Handle ──── SlotId ────────► slot { value, refs, anchor, weak }
//!                                   │
//!                                   ▼
//!   TrackedObject ◄── ObjectId ── heap object (template ⇒ interceptor)
//! ```
//!
//! A slot anchored to an [`ObjectId`] is kept alive by the bridge even when
//! its reference count drops to zero, until the bridge makes it weak and the
//! collector proves the object unreachable. The collector then reports the
//! slot through the [`GcCallback`]; the bridge finalizes the host object and
//! calls [`NativeEngine::release_anchor`].

use std::sync::Arc;

use crate::error::NativeResult;
use crate::value::{NativeValue, ObjectId, SlotId, TemplateId, ValueTag};

/// Outcome of dropping one reference to a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRelease {
    /// Other references remain
    Retained(u32),
    /// The slot was freed
    Freed,
    /// No references remain, but the slot is anchored to a tracked object
    Deferred(ObjectId),
}

/// Weak-collection notification: the slot whose object was collected and the
/// tracked object it was anchored to
pub type GcCallback = Arc<dyn Fn(SlotId, ObjectId) + Send + Sync>;

/// Property interception for objects created from a template.
///
/// Every method receives the [`ObjectId`] stored in the holder object.
/// Returning `None` means "not handled": the engine falls back to the
/// object's own properties.
pub trait NamedInterceptor: Send + Sync {
    /// Read a named property
    fn get(&self, holder: ObjectId, name: &str) -> Option<NativeValue>;

    /// Write a named property. `Some(error)` rejects the assignment.
    fn set(&self, holder: ObjectId, name: &str, value: &NativeValue) -> Option<NativeValue>;

    /// Read an indexed element
    fn get_index(&self, _holder: ObjectId, _index: u32) -> Option<NativeValue> {
        None
    }

    /// Write an indexed element
    fn set_index(&self, _holder: ObjectId, _index: u32, _value: &NativeValue) -> Option<NativeValue> {
        None
    }

    /// Enumerable names
    fn names(&self, _holder: ObjectId) -> Vec<String> {
        Vec::new()
    }
}

/// Arguments of a native function invocation
#[derive(Debug)]
pub struct CallInfo<'a> {
    /// Receiver value
    pub this: &'a NativeValue,
    /// Object id stored in the receiver, [`ObjectId::UNSET`] if none
    pub holder: ObjectId,
    /// Call arguments
    pub args: &'a [NativeValue],
    /// True when invoked as a constructor
    pub is_construct: bool,
}

/// Behavior of functions created from a template
pub trait CallHandler: Send + Sync {
    /// Invoke the function. Failures are returned as error values.
    fn call(&self, info: CallInfo<'_>) -> NativeValue;
}

/// Template for native objects and functions
#[derive(Clone, Default)]
pub struct TemplateSpec {
    /// Class name reported for instances
    pub class_name: String,
    /// Property interception
    pub interceptor: Option<Arc<dyn NamedInterceptor>>,
    /// Call behavior (function templates only)
    pub call_handler: Option<Arc<dyn CallHandler>>,
}

impl TemplateSpec {
    /// Template with only a class name
    pub fn named(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            ..Self::default()
        }
    }

    /// Attach a property interceptor
    pub fn with_interceptor(mut self, interceptor: Arc<dyn NamedInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Attach a call handler
    pub fn with_call_handler(mut self, handler: Arc<dyn CallHandler>) -> Self {
        self.call_handler = Some(handler);
        self
    }
}

/// A script engine as seen by the bridge.
///
/// Implementations must be callable from any thread. Interceptors and call
/// handlers are invoked without internal locks held, so they may call back
/// into the engine.
pub trait NativeEngine: Send + Sync {
    // ------------------------------------------------------------------
    // Slots
    // ------------------------------------------------------------------

    /// Allocate a slot holding `value` with a reference count of one
    fn create_slot(&self, value: NativeValue) -> SlotId;

    /// Add a reference; returns the new count
    fn retain_slot(&self, slot: SlotId) -> NativeResult<u32>;

    /// Drop a reference
    fn release_slot(&self, slot: SlotId) -> NativeResult<SlotRelease>;

    /// Value stored in a slot
    fn slot_value(&self, slot: SlotId) -> NativeResult<NativeValue>;

    /// Type tag of the value stored in a slot
    fn slot_tag(&self, slot: SlotId) -> NativeResult<ValueTag> {
        self.slot_value(slot).map(|v| v.tag())
    }

    /// Tie a slot to a tracked object so it survives a zero reference count
    fn anchor_slot(&self, slot: SlotId, object: ObjectId) -> NativeResult<()>;

    /// Remove the anchor; frees the slot if no references remain
    fn release_anchor(&self, slot: SlotId) -> NativeResult<SlotRelease>;

    /// Let the collector reclaim the anchored object once unreachable
    fn make_weak(&self, slot: SlotId) -> NativeResult<()>;

    /// Undo [`NativeEngine::make_weak`]. Returns false if the object was
    /// already collected.
    fn clear_weak(&self, slot: SlotId) -> NativeResult<bool>;

    /// True if the slot is live and its heap object (if any) still exists
    fn is_alive(&self, slot: SlotId) -> bool;

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Register an object template
    fn create_template(&self, spec: TemplateSpec) -> TemplateId;

    /// Allocate an object, optionally from a template, storing `internal`
    fn create_object(&self, template: Option<TemplateId>, internal: ObjectId) -> NativeResult<NativeValue>;

    /// Allocate an object from `template` together with a slot anchored to
    /// `internal`. The slot holds no references; the anchor alone keeps it,
    /// so the object is never unrooted between the two steps.
    fn create_tracked_object(&self, template: TemplateId, internal: ObjectId) -> NativeResult<(SlotId, NativeValue)>;

    /// Allocate a function from a template with a call handler
    fn create_function(&self, template: TemplateId, internal: ObjectId) -> NativeResult<NativeValue>;

    /// Allocate an array
    fn create_array(&self, elements: Vec<NativeValue>) -> NativeValue;

    /// The global object
    fn global(&self) -> NativeValue;

    /// Object id stored in a heap value, [`ObjectId::UNSET`] otherwise
    fn object_id_of(&self, value: &NativeValue) -> ObjectId;

    /// Read a named property
    fn get_property(&self, target: &NativeValue, name: &str) -> NativeResult<NativeValue>;

    /// Write a named property. Returns the stored value or an error value.
    fn set_property(&self, target: &NativeValue, name: &str, value: NativeValue) -> NativeResult<NativeValue>;

    /// Read an indexed element
    fn get_index(&self, target: &NativeValue, index: u32) -> NativeResult<NativeValue>;

    /// Write an indexed element. Returns the stored value or an error value.
    fn set_index(&self, target: &NativeValue, index: u32, value: NativeValue) -> NativeResult<NativeValue>;

    /// Enumerable property names
    fn property_names(&self, target: &NativeValue) -> NativeResult<Vec<String>>;

    /// Call a function
    fn call(&self, callee: &NativeValue, this: &NativeValue, args: &[NativeValue]) -> NativeResult<NativeValue>;

    /// Call a function as a constructor
    fn construct(&self, callee: &NativeValue, args: &[NativeValue]) -> NativeResult<NativeValue>;

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Install (or clear) the weak-collection callback
    fn set_gc_callback(&self, callback: Option<GcCallback>);

    /// Run a full collection; returns the number of objects reclaimed
    fn collect(&self) -> usize;

    /// Collect if enough garbage has accumulated. Returns true if a
    /// collection ran.
    fn idle_gc_step(&self) -> bool;
}
