//! Handles to native slots
//!
//! A [`Handle`] owns one reference to a native slot. Cloning retains the
//! slot, dropping releases it, and [`Handle::set`] retains the new slot
//! before letting go of the old one, so a handle never dangles between the
//! two. A [`HandleRef`] is a borrowed view that touches no counts.
//!
//! All handles of an engine share a [`HandleContext`]. Disposing the engine
//! poisons the context: live handles then report
//! [`HandleError::EngineDisposed`] and their releases become no-ops.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;
use std::time::SystemTime;

use log::{trace, warn};
use parking_lot::RwLock;
use tether_sdk::{NativeEngine, NativeValue, ScriptError, SlotId, SlotRelease, ValueTag};

use crate::error::HandleError;

/// Per-engine state shared by every handle
pub(crate) struct HandleContext {
    native: RwLock<Option<Arc<dyn NativeEngine>>>,
    engine_index: usize,
}

impl HandleContext {
    pub(crate) fn new(native: Arc<dyn NativeEngine>, engine_index: usize) -> Arc<Self> {
        Arc::new(Self {
            native: RwLock::new(Some(native)),
            engine_index,
        })
    }

    pub(crate) fn native(&self) -> Result<Arc<dyn NativeEngine>, HandleError> {
        self.native.read().clone().ok_or(HandleError::EngineDisposed)
    }

    /// Detach the native engine; returns it so the caller can drop it last
    pub(crate) fn poison(&self) -> Option<Arc<dyn NativeEngine>> {
        self.native.write().take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Binding {
    Empty,
    Live(SlotId),
    Disposed,
}

/// Owned reference to a native value
pub struct Handle {
    binding: Binding,
    tag: Option<ValueTag>,
    context: Option<Arc<HandleContext>>,
}

impl Handle {
    /// A handle that refers to nothing
    pub fn empty() -> Self {
        Self {
            binding: Binding::Empty,
            tag: None,
            context: None,
        }
    }

    /// Take over the reference a freshly created slot starts with
    pub(crate) fn adopt(context: Arc<HandleContext>, slot: SlotId, tag: ValueTag) -> Self {
        Self {
            binding: Binding::Live(slot),
            tag: Some(tag),
            context: Some(context),
        }
    }

    /// Store `value` in a new slot
    pub(crate) fn from_value(context: &Arc<HandleContext>, value: NativeValue) -> Result<Self, HandleError> {
        let native = context.native()?;
        let tag = value.tag();
        let slot = native.create_slot(value);
        Ok(Self::adopt(context.clone(), slot, tag))
    }

    /// Add a reference to an existing slot
    pub(crate) fn retained(context: &Arc<HandleContext>, slot: SlotId) -> Result<Self, HandleError> {
        let native = context.native()?;
        native.retain_slot(slot)?;
        let tag = match native.slot_tag(slot) {
            Ok(tag) => tag,
            Err(e) => {
                let _ = native.release_slot(slot);
                return Err(e.into());
            }
        };
        Ok(Self::adopt(context.clone(), slot, tag))
    }

    /// True if the handle never referred to a slot
    pub fn is_empty(&self) -> bool {
        self.binding == Binding::Empty
    }

    /// True after [`Handle::dispose`]
    pub fn is_disposed(&self) -> bool {
        self.binding == Binding::Disposed
    }

    /// True if the handle holds a slot reference
    pub fn is_live(&self) -> bool {
        matches!(self.binding, Binding::Live(_))
    }

    /// Slot the handle refers to
    pub fn slot(&self) -> Result<SlotId, HandleError> {
        match self.binding {
            Binding::Live(slot) => Ok(slot),
            Binding::Empty => Err(HandleError::Empty),
            Binding::Disposed => Err(HandleError::Disposed),
        }
    }

    /// Index of the owning engine
    pub fn engine_index(&self) -> Option<usize> {
        self.context.as_ref().map(|c| c.engine_index)
    }

    /// Cached type tag; `None` unless live
    pub fn tag(&self) -> Option<ValueTag> {
        match self.binding {
            Binding::Live(_) => self.tag,
            _ => None,
        }
    }

    fn has_tag(&self, tag: ValueTag) -> bool {
        self.tag() == Some(tag)
    }

    /// `undefined`
    pub fn is_undefined(&self) -> bool {
        self.has_tag(ValueTag::Undefined)
    }

    /// `null`
    pub fn is_null(&self) -> bool {
        self.has_tag(ValueTag::Null)
    }

    /// Boolean
    pub fn is_bool(&self) -> bool {
        self.has_tag(ValueTag::Bool)
    }

    /// 32-bit integer
    pub fn is_int32(&self) -> bool {
        self.has_tag(ValueTag::Int32)
    }

    /// Any number (int32 included)
    pub fn is_number(&self) -> bool {
        self.has_tag(ValueTag::Number) || self.is_int32()
    }

    /// String
    pub fn is_string(&self) -> bool {
        self.has_tag(ValueTag::String)
    }

    /// Date
    pub fn is_date(&self) -> bool {
        self.has_tag(ValueTag::Date)
    }

    /// Object, function or array
    pub fn is_object(&self) -> bool {
        self.tag().map(ValueTag::is_heap).unwrap_or(false)
    }

    /// Function
    pub fn is_function(&self) -> bool {
        self.has_tag(ValueTag::Function)
    }

    /// Array
    pub fn is_array(&self) -> bool {
        self.has_tag(ValueTag::Array)
    }

    /// Script-level error
    pub fn is_error(&self) -> bool {
        self.has_tag(ValueTag::Error)
    }

    fn native(&self) -> Result<(Arc<dyn NativeEngine>, SlotId), HandleError> {
        let slot = self.slot()?;
        let context = self.context.as_ref().ok_or(HandleError::Empty)?;
        Ok((context.native()?, slot))
    }

    pub(crate) fn context(&self) -> Option<&Arc<HandleContext>> {
        self.context.as_ref()
    }

    /// Value stored in the slot
    pub fn value(&self) -> Result<NativeValue, HandleError> {
        let (native, slot) = self.native()?;
        Ok(native.slot_value(slot)?)
    }

    /// Truthiness of the value
    pub fn as_bool(&self) -> Result<bool, HandleError> {
        Ok(self.value()?.to_boolean())
    }

    /// Value wrapped to a 32-bit integer
    pub fn as_i32(&self) -> Result<i32, HandleError> {
        Ok(self.value()?.to_int32())
    }

    /// Numeric value
    pub fn as_f64(&self) -> Result<f64, HandleError> {
        Ok(self.value()?.to_number())
    }

    /// String rendering of the value
    pub fn as_string(&self) -> Result<String, HandleError> {
        Ok(self.value()?.to_display_string())
    }

    /// Date and number values as a point in time
    pub fn as_date(&self) -> Result<SystemTime, HandleError> {
        let value = self.value()?;
        value.to_system_time().ok_or(HandleError::NotConvertible {
            expected: "date",
            actual: value.tag(),
        })
    }

    /// Error payload of an error value
    pub fn as_error(&self) -> Result<ScriptError, HandleError> {
        match self.value()? {
            NativeValue::Error(e) => Ok(e),
            other => Err(HandleError::NotConvertible {
                expected: "error",
                actual: other.tag(),
            }),
        }
    }

    /// Point this handle at the slot `other` refers to.
    ///
    /// The new slot is retained before the old one is released. Setting a
    /// handle to the slot it already holds changes nothing.
    pub fn set(&mut self, other: &Handle) -> Result<(), HandleError> {
        if self.is_disposed() {
            return Err(HandleError::Disposed);
        }
        match other.binding {
            Binding::Disposed => Err(HandleError::Disposed),
            Binding::Empty => {
                self.release();
                self.binding = Binding::Empty;
                self.tag = None;
                self.context = None;
                Ok(())
            }
            Binding::Live(slot) => {
                if *self == *other {
                    return Ok(());
                }
                let context = other.context.clone().ok_or(HandleError::Empty)?;
                context.native()?.retain_slot(slot)?;
                self.release();
                self.binding = Binding::Live(slot);
                self.tag = other.tag;
                self.context = Some(context);
                Ok(())
            }
        }
    }

    /// Release the slot reference. Disposing twice is a no-op.
    pub fn dispose(&mut self) {
        if self.is_live() {
            self.release();
            self.binding = Binding::Disposed;
        }
    }

    /// Borrowed view of this handle
    pub fn borrow(&self) -> HandleRef<'_> {
        HandleRef { handle: self }
    }

    /// Drop this handle's count on its slot. A slot anchored to a tracked
    /// object reports `Deferred`: it is reclaimed later through the weak
    /// flag and the GC callback, not through an enqueue here.
    fn release(&mut self) {
        let Binding::Live(slot) = self.binding else {
            return;
        };
        let Some(context) = self.context.as_ref() else {
            return;
        };
        match context.native() {
            Ok(native) => match native.release_slot(slot) {
                Ok(SlotRelease::Deferred(object)) => {
                    trace!("Released {} (anchored to object {})", slot, object)
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to release {}: {}", slot, e),
            },
            Err(_) => trace!("Release of {} after engine disposal ignored", slot),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        if let (Binding::Live(slot), Some(context)) = (self.binding, self.context.as_ref()) {
            let retained = context
                .native()
                .and_then(|n| n.retain_slot(slot).map_err(HandleError::from));
            if let Err(e) = retained {
                warn!("Failed to retain {}: {}", slot, e);
                return Self {
                    binding: Binding::Disposed,
                    tag: None,
                    context: self.context.clone(),
                };
            }
        }
        Self {
            binding: self.binding,
            tag: self.tag,
            context: self.context.clone(),
        }
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.binding == other.binding && self.engine_index() == other.engine_index()
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.binding.hash(state);
        self.engine_index().hash(state);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.binding {
            Binding::Empty => f.write_str("Handle(empty)"),
            Binding::Disposed => f.write_str("Handle(disposed)"),
            Binding::Live(slot) => write!(
                f,
                "Handle({}, {})",
                slot,
                self.tag.map(ValueTag::name).unwrap_or("?")
            ),
        }
    }
}

/// Borrowed view of a [`Handle`]; never touches reference counts
#[derive(Clone, Copy)]
pub struct HandleRef<'a> {
    handle: &'a Handle,
}

impl<'a> HandleRef<'a> {
    /// Take out an owned reference to the same slot
    pub fn to_handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl<'a> From<&'a Handle> for HandleRef<'a> {
    fn from(handle: &'a Handle) -> Self {
        handle.borrow()
    }
}

impl Deref for HandleRef<'_> {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        self.handle
    }
}

impl fmt::Debug for HandleRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{:?}", self.handle)
    }
}
