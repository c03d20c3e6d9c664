//! Value model shared between the bridge and a native engine
//!
//! Native values are plain data: primitives are stored inline and heap
//! objects are referenced through [`ObjRef`], an index plus the generation
//! the object was allocated in. Anything the host side keeps across calls is
//! held through a [`SlotId`], which the native engine reference-counts.

use std::fmt;
use std::sync::Arc;

use crate::error::{ErrorKind, ScriptError};

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a native slot.
///
/// Slots are reused after they are freed; the generation makes a stale
/// `SlotId` detectable instead of silently aliasing the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    /// Create a slot id from its parts
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Position of the slot in the native slot table
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation the slot was allocated in
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}.{}", self.index, self.generation)
    }
}

/// Integer identity of a tracked host object.
///
/// Non-negative values index the object registry. `-1` means "not set";
/// values below `-1` are reserved markers for native objects that belong to
/// the bridge itself (constructor and method functions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(i32);

impl ObjectId {
    /// No tracked object is associated
    pub const UNSET: ObjectId = ObjectId(-1);

    /// Wrap a raw id
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Id for registry position `index`
    pub fn from_index(index: usize) -> Self {
        Self(i32::try_from(index).unwrap_or(i32::MAX))
    }

    /// Reserved marker id `n` (`-2 - n`)
    pub const fn marker(n: u32) -> Self {
        Self(-2 - (n as i32 & 0x3fff_ffff))
    }

    /// Raw integer value
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// True if this id refers to a registry entry
    pub const fn is_tracked(self) -> bool {
        self.0 >= 0
    }

    /// True for [`ObjectId::UNSET`]
    pub const fn is_unset(self) -> bool {
        self.0 == -1
    }

    /// True for reserved marker ids
    pub const fn is_marker(self) -> bool {
        self.0 < -1
    }

    /// Registry position, if tracked
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::UNSET
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reference to an object in the native heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

impl ObjRef {
    /// Create an object reference from its parts
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Heap position
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Heap generation of the referenced object
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}.{}", self.index, self.generation)
    }
}

/// Identifier of an object template registered with the native engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemplateId(pub u32);

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template#{}", self.0)
    }
}

// ============================================================================
// Value tags
// ============================================================================

/// Type tag of a native value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueTag {
    /// `undefined`
    Undefined = 0,
    /// `null`
    Null = 1,
    /// Boolean
    Bool = 2,
    /// 32-bit integer
    Int32 = 3,
    /// Double precision number
    Number = 4,
    /// String
    String = 5,
    /// Date (milliseconds since the Unix epoch)
    Date = 6,
    /// Plain or bound object
    Object = 7,
    /// Callable object
    Function = 8,
    /// Array object
    Array = 9,
    /// Script-level error value
    Error = 10,
}

impl ValueTag {
    /// Script-visible name of the tag
    pub const fn name(self) -> &'static str {
        match self {
            ValueTag::Undefined => "undefined",
            ValueTag::Null => "null",
            ValueTag::Bool => "boolean",
            ValueTag::Int32 => "int32",
            ValueTag::Number => "number",
            ValueTag::String => "string",
            ValueTag::Date => "date",
            ValueTag::Object => "object",
            ValueTag::Function => "function",
            ValueTag::Array => "array",
            ValueTag::Error => "error",
        }
    }

    /// True for tags whose values live in the native heap
    pub const fn is_heap(self) -> bool {
        matches!(self, ValueTag::Object | ValueTag::Function | ValueTag::Array)
    }
}

impl fmt::Display for ValueTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Native values
// ============================================================================

/// A value as the native engine sees it.
///
/// Errors are values too: binder failures surface to scripts as
/// [`NativeValue::Error`] rather than as host-side failures.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// 32-bit integer
    Int32(i32),
    /// Double precision number
    Number(f64),
    /// Immutable string
    String(Arc<str>),
    /// Milliseconds since the Unix epoch
    Date(f64),
    /// Plain or bound object
    Object(ObjRef),
    /// Callable object
    Function(ObjRef),
    /// Array object
    Array(ObjRef),
    /// Script-level error
    Error(ScriptError),
}

impl NativeValue {
    /// Build a string value
    pub fn string(s: impl AsRef<str>) -> Self {
        NativeValue::String(Arc::from(s.as_ref()))
    }

    /// Build an error value
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        NativeValue::Error(ScriptError::new(kind, message))
    }

    /// Type tag of the value
    pub fn tag(&self) -> ValueTag {
        match self {
            NativeValue::Undefined => ValueTag::Undefined,
            NativeValue::Null => ValueTag::Null,
            NativeValue::Bool(_) => ValueTag::Bool,
            NativeValue::Int32(_) => ValueTag::Int32,
            NativeValue::Number(_) => ValueTag::Number,
            NativeValue::String(_) => ValueTag::String,
            NativeValue::Date(_) => ValueTag::Date,
            NativeValue::Object(_) => ValueTag::Object,
            NativeValue::Function(_) => ValueTag::Function,
            NativeValue::Array(_) => ValueTag::Array,
            NativeValue::Error(_) => ValueTag::Error,
        }
    }

    /// Heap reference for object, function and array values
    pub fn object_ref(&self) -> Option<ObjRef> {
        match self {
            NativeValue::Object(r) | NativeValue::Function(r) | NativeValue::Array(r) => Some(*r),
            _ => None,
        }
    }

    /// True for `undefined` and `null`
    pub fn is_nullish(&self) -> bool {
        matches!(self, NativeValue::Undefined | NativeValue::Null)
    }

    /// True for error values
    pub fn is_error(&self) -> bool {
        matches!(self, NativeValue::Error(_))
    }

    /// Borrow the error payload
    pub fn as_error(&self) -> Option<&ScriptError> {
        match self {
            NativeValue::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Numeric payload of int32 and number values
    pub fn as_number(&self) -> Option<f64> {
        match self {
            NativeValue::Int32(i) => Some(f64::from(*i)),
            NativeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Borrow the string payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            NativeValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for NativeValue {
    fn from(b: bool) -> Self {
        NativeValue::Bool(b)
    }
}

impl From<i32> for NativeValue {
    fn from(i: i32) -> Self {
        NativeValue::Int32(i)
    }
}

impl From<f64> for NativeValue {
    fn from(n: f64) -> Self {
        NativeValue::Number(n)
    }
}

impl From<&str> for NativeValue {
    fn from(s: &str) -> Self {
        NativeValue::string(s)
    }
}

impl From<String> for NativeValue {
    fn from(s: String) -> Self {
        NativeValue::String(Arc::from(s))
    }
}

impl From<ScriptError> for NativeValue {
    fn from(e: ScriptError) -> Self {
        NativeValue::Error(e)
    }
}

impl fmt::Display for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_ranges() {
        assert!(ObjectId::UNSET.is_unset());
        assert!(!ObjectId::UNSET.is_tracked());
        assert!(ObjectId::new(0).is_tracked());
        assert_eq!(ObjectId::new(7).index(), Some(7));
        assert_eq!(ObjectId::UNSET.index(), None);

        let marker = ObjectId::marker(0);
        assert_eq!(marker.raw(), -2);
        assert!(marker.is_marker());
        assert!(!marker.is_unset());
        assert_eq!(ObjectId::marker(3).raw(), -5);
    }

    #[test]
    fn test_value_tags() {
        assert_eq!(NativeValue::from(1).tag(), ValueTag::Int32);
        assert_eq!(NativeValue::from(1.5).tag(), ValueTag::Number);
        assert_eq!(NativeValue::from("x").tag(), ValueTag::String);
        assert_eq!(NativeValue::Date(0.0).tag(), ValueTag::Date);
        assert!(ValueTag::Array.is_heap());
        assert!(!ValueTag::Date.is_heap());
        assert_eq!(ValueTag::Bool.to_string(), "boolean");
    }

    #[test]
    fn test_object_ref_only_for_heap_values() {
        let r = ObjRef::new(3, 1);
        assert_eq!(NativeValue::Function(r).object_ref(), Some(r));
        assert_eq!(NativeValue::Int32(3).object_ref(), None);
    }

    #[test]
    fn test_error_values() {
        let v = NativeValue::error(ErrorKind::Type, "bad");
        assert!(v.is_error());
        assert_eq!(v.as_error().map(|e| e.kind), Some(ErrorKind::Type));
    }
}
