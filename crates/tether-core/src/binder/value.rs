//! Host-side values crossing the binder
//!
//! [`HostKind`] describes the declared type of a member or parameter and
//! [`HostValue`] carries a converted value of that type. Typed accessors
//! and methods use [`FromHost`] / [`IntoHost`] to move between `HostValue`
//! and plain Rust types.

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tether_sdk::NativeValue;

use super::builder::{HostType, TypeDescription};
use super::TypeBinder;

/// Host value shared between the host and the bridge
pub type Shared<T> = Arc<RwLock<T>>;

/// Type-erased [`Shared`]
pub type SharedAny = Arc<RwLock<dyn Any + Send + Sync>>;

/// Wrap a value for sharing
pub fn share<T>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(value))
}

/// Declared type of a member, parameter or return value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostKind {
    /// No value
    Unit,
    /// `bool`
    Bool,
    /// `i8`
    I8,
    /// `i16`
    I16,
    /// `i32`
    I32,
    /// `i64`
    I64,
    /// `u8`
    U8,
    /// `u16`
    U16,
    /// `u32`
    U32,
    /// `u64`
    U64,
    /// `f32`
    F32,
    /// `f64`
    F64,
    /// `char`
    Char,
    /// `String`
    String,
    /// `SystemTime`
    Date,
    /// `Duration` (milliseconds in scripts)
    TimeSpan,
    /// A [`HostEnum`]
    Enum {
        /// Enum name
        name: &'static str,
        /// Valid discriminants
        variants: &'static [i64],
    },
    /// A bound host type
    Object {
        /// Host type id
        type_id: TypeId,
        /// Script-visible name
        name: &'static str,
    },
    /// A bound host type or any bound type deriving from it
    Derived {
        /// Host type id of the base
        type_id: TypeId,
        /// Script-visible name of the base
        name: &'static str,
    },
    /// Any native value, passed through untouched
    Value,
    /// List of type arguments (generic methods)
    Types,
}

impl HostKind {
    /// Kind of a bound host type
    pub fn object<T: HostType>() -> Self {
        HostKind::Object {
            type_id: TypeId::of::<T>(),
            name: T::NAME,
        }
    }

    /// Kind accepting `T` and every type deriving from it
    pub fn derived<T: HostType>() -> Self {
        HostKind::Derived {
            type_id: TypeId::of::<T>(),
            name: T::NAME,
        }
    }

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            HostKind::Unit => "void",
            HostKind::Bool => "bool",
            HostKind::I8 => "i8",
            HostKind::I16 => "i16",
            HostKind::I32 => "i32",
            HostKind::I64 => "i64",
            HostKind::U8 => "u8",
            HostKind::U16 => "u16",
            HostKind::U32 => "u32",
            HostKind::U64 => "u64",
            HostKind::F32 => "f32",
            HostKind::F64 => "f64",
            HostKind::Char => "char",
            HostKind::String => "string",
            HostKind::Date => "date",
            HostKind::TimeSpan => "timespan",
            HostKind::Enum { name, .. } => *name,
            HostKind::Object { name, .. } | HostKind::Derived { name, .. } => *name,
            HostKind::Value => "any",
            HostKind::Types => "type[]",
        }
    }

    /// Kind for a primitive type name used as a generic type token
    pub fn from_type_name(name: &str) -> Option<Self> {
        let kind = match name {
            "bool" | "boolean" => HostKind::Bool,
            "i8" => HostKind::I8,
            "i16" => HostKind::I16,
            "i32" | "int" | "int32" => HostKind::I32,
            "i64" => HostKind::I64,
            "u8" => HostKind::U8,
            "u16" => HostKind::U16,
            "u32" => HostKind::U32,
            "u64" => HostKind::U64,
            "f32" => HostKind::F32,
            "f64" | "number" => HostKind::F64,
            "char" => HostKind::Char,
            "string" => HostKind::String,
            "date" => HostKind::Date,
            "timespan" => HostKind::TimeSpan,
            "any" => HostKind::Value,
            _ => return None,
        };
        Some(kind)
    }

    /// True for bound host types
    pub fn is_object(&self) -> bool {
        matches!(self, HostKind::Object { .. } | HostKind::Derived { .. })
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A bound host value together with how to describe its type
#[derive(Clone)]
pub struct HostObject {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) cell: SharedAny,
    pub(crate) typed: Arc<dyn Any + Send + Sync>,
    pub(crate) describe: fn() -> TypeDescription,
}

impl HostObject {
    /// Erase a shared host value
    pub fn new<T: HostType>(cell: Shared<T>) -> Self {
        let erased: SharedAny = cell.clone();
        Self {
            type_id: TypeId::of::<T>(),
            type_name: T::NAME,
            cell: erased,
            typed: cell,
            describe: TypeDescription::of::<T>,
        }
    }

    /// Script-visible type name
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Recover the typed cell
    pub fn downcast<T: HostType>(&self) -> Option<Shared<T>> {
        self.typed.clone().downcast::<RwLock<T>>().ok()
    }

    /// Identity of the shared cell
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.typed) as *const () as usize
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({} @ {:#x})", self.type_name, self.addr())
    }
}

/// A bound host object seen as one of its types (its own or a base)
#[derive(Clone)]
pub struct AnyView {
    pub(crate) object: HostObject,
    pub(crate) binder: Arc<TypeBinder>,
    pub(crate) target: TypeId,
    pub(crate) target_name: &'static str,
}

impl AnyView {
    /// Script-visible name of the object's own type
    pub fn type_name(&self) -> &'static str {
        self.object.type_name
    }

    /// Script-visible name of the type the object is seen as
    pub fn target_name(&self) -> &'static str {
        self.target_name
    }
}

impl fmt::Debug for AnyView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyView({:?} as {})", self.object, self.target_name)
    }
}

/// Parameter type accepting a bound `T` or any bound type deriving from
/// `T`. Access goes through the derived type's base projection, so the
/// object keeps its own type.
pub struct ObjectView<T> {
    view: AnyView,
    _marker: PhantomData<fn() -> T>,
}

impl<T: HostType> ObjectView<T> {
    /// Script-visible name of the object's own type
    pub fn type_name(&self) -> &'static str {
        self.view.type_name()
    }

    /// The `T` part of the object
    pub fn read(&self) -> Option<MappedRwLockReadGuard<'_, T>> {
        let view = &self.view;
        RwLockReadGuard::try_map(view.object.cell.read(), |value| {
            view.binder.project(value, view.target)?.downcast_ref::<T>()
        })
        .ok()
    }

    /// The `T` part of the object, mutably
    pub fn write(&self) -> Option<MappedRwLockWriteGuard<'_, T>> {
        let view = &self.view;
        RwLockWriteGuard::try_map(view.object.cell.write(), |value| {
            view.binder.project_mut(value, view.target)?.downcast_mut::<T>()
        })
        .ok()
    }
}

impl<T> Clone for ObjectView<T> {
    fn clone(&self) -> Self {
        Self {
            view: self.view.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ObjectView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.view.fmt(f)
    }
}

/// A converted value on the host side of the binder
#[derive(Debug, Clone)]
pub enum HostValue {
    /// No value
    Unit,
    /// `bool`
    Bool(bool),
    /// `i8`
    I8(i8),
    /// `i16`
    I16(i16),
    /// `i32`
    I32(i32),
    /// `i64`
    I64(i64),
    /// `u8`
    U8(u8),
    /// `u16`
    U16(u16),
    /// `u32`
    U32(u32),
    /// `u64`
    U64(u64),
    /// `f32`
    F32(f32),
    /// `f64`
    F64(f64),
    /// `char`
    Char(char),
    /// `String`
    String(String),
    /// Point in time
    Date(SystemTime),
    /// Time span
    TimeSpan(Duration),
    /// Enum discriminant
    Enum {
        /// Enum name
        name: &'static str,
        /// Discriminant
        value: i64,
    },
    /// Bound host object
    Object(HostObject),
    /// Bound host object seen as a base type
    View(AnyView),
    /// Untouched native value
    Value(NativeValue),
    /// Generic type arguments
    Types(Vec<HostKind>),
}

/// Failure raised by host code invoked from a script
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct InvokeError(pub String);

impl InvokeError {
    /// Create an error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for InvokeError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InvokeError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Conversion from a [`HostValue`] into a Rust type
pub trait FromHost: Sized {
    /// Declared kind
    fn host_kind() -> HostKind;
    /// Take the value out; `None` if the variant does not match
    fn from_host(value: HostValue) -> Option<Self>;
}

/// Conversion from a Rust type into a [`HostValue`]
pub trait IntoHost {
    /// Declared kind
    fn host_kind() -> HostKind;
    /// Wrap the value
    fn into_host(self) -> HostValue;
}

/// Return values of script-callable host functions
pub trait IntoInvokeResult {
    /// Declared return kind
    fn host_kind() -> HostKind;
    /// Convert, surfacing host failures
    fn into_result(self) -> Result<HostValue, InvokeError>;
}

/// Enums exposed to scripts as their integer discriminants
pub trait HostEnum: Copy + Send + Sync + 'static {
    /// Script-visible name
    const NAME: &'static str;
    /// Valid discriminants
    const VARIANTS: &'static [i64];
    /// Discriminant of a variant
    fn to_i64(self) -> i64;
    /// Variant for a discriminant
    fn from_i64(value: i64) -> Option<Self>;
}

/// Wrapper passing a [`HostEnum`] through typed accessors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumValue<E>(pub E);

macro_rules! impl_host_primitive {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromHost for $ty {
                fn host_kind() -> HostKind {
                    HostKind::$variant
                }

                fn from_host(value: HostValue) -> Option<Self> {
                    match value {
                        HostValue::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }

            impl IntoHost for $ty {
                fn host_kind() -> HostKind {
                    HostKind::$variant
                }

                fn into_host(self) -> HostValue {
                    HostValue::$variant(self)
                }
            }

            impl IntoInvokeResult for $ty {
                fn host_kind() -> HostKind {
                    HostKind::$variant
                }

                fn into_result(self) -> Result<HostValue, InvokeError> {
                    Ok(HostValue::$variant(self))
                }
            }
        )*
    };
}

impl_host_primitive! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    char => Char,
    String => String,
    SystemTime => Date,
    Duration => TimeSpan,
}

impl IntoHost for () {
    fn host_kind() -> HostKind {
        HostKind::Unit
    }

    fn into_host(self) -> HostValue {
        HostValue::Unit
    }
}

impl IntoInvokeResult for () {
    fn host_kind() -> HostKind {
        HostKind::Unit
    }

    fn into_result(self) -> Result<HostValue, InvokeError> {
        Ok(HostValue::Unit)
    }
}

impl IntoHost for &str {
    fn host_kind() -> HostKind {
        HostKind::String
    }

    fn into_host(self) -> HostValue {
        HostValue::String(self.to_string())
    }
}

impl FromHost for NativeValue {
    fn host_kind() -> HostKind {
        HostKind::Value
    }

    fn from_host(value: HostValue) -> Option<Self> {
        match value {
            HostValue::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl IntoHost for NativeValue {
    fn host_kind() -> HostKind {
        HostKind::Value
    }

    fn into_host(self) -> HostValue {
        HostValue::Value(self)
    }
}

impl IntoInvokeResult for NativeValue {
    fn host_kind() -> HostKind {
        HostKind::Value
    }

    fn into_result(self) -> Result<HostValue, InvokeError> {
        Ok(HostValue::Value(self))
    }
}

impl<T: HostType> FromHost for Shared<T> {
    fn host_kind() -> HostKind {
        HostKind::object::<T>()
    }

    fn from_host(value: HostValue) -> Option<Self> {
        match value {
            HostValue::Object(o) => o.downcast::<T>(),
            _ => None,
        }
    }
}

impl<T: HostType> IntoHost for Shared<T> {
    fn host_kind() -> HostKind {
        HostKind::object::<T>()
    }

    fn into_host(self) -> HostValue {
        HostValue::Object(HostObject::new(self))
    }
}

impl<T: HostType> IntoInvokeResult for Shared<T> {
    fn host_kind() -> HostKind {
        HostKind::object::<T>()
    }

    fn into_result(self) -> Result<HostValue, InvokeError> {
        Ok(self.into_host())
    }
}

impl<T: HostType> FromHost for ObjectView<T> {
    fn host_kind() -> HostKind {
        HostKind::derived::<T>()
    }

    fn from_host(value: HostValue) -> Option<Self> {
        match value {
            HostValue::View(view) if view.target == TypeId::of::<T>() => Some(ObjectView {
                view,
                _marker: PhantomData,
            }),
            _ => None,
        }
    }
}

impl<E: HostEnum> FromHost for EnumValue<E> {
    fn host_kind() -> HostKind {
        HostKind::Enum {
            name: E::NAME,
            variants: E::VARIANTS,
        }
    }

    fn from_host(value: HostValue) -> Option<Self> {
        match value {
            HostValue::Enum { value, .. } => E::from_i64(value).map(EnumValue),
            _ => None,
        }
    }
}

impl<E: HostEnum> IntoHost for EnumValue<E> {
    fn host_kind() -> HostKind {
        <Self as FromHost>::host_kind()
    }

    fn into_host(self) -> HostValue {
        HostValue::Enum {
            name: E::NAME,
            value: self.0.to_i64(),
        }
    }
}

impl<E: HostEnum> IntoInvokeResult for EnumValue<E> {
    fn host_kind() -> HostKind {
        <Self as FromHost>::host_kind()
    }

    fn into_result(self) -> Result<HostValue, InvokeError> {
        Ok(self.into_host())
    }
}

impl<V: IntoHost> IntoHost for Option<V> {
    fn host_kind() -> HostKind {
        V::host_kind()
    }

    fn into_host(self) -> HostValue {
        match self {
            Some(v) => v.into_host(),
            None => HostValue::Value(NativeValue::Null),
        }
    }
}

impl<V: IntoHost> IntoInvokeResult for Option<V> {
    fn host_kind() -> HostKind {
        V::host_kind()
    }

    fn into_result(self) -> Result<HostValue, InvokeError> {
        Ok(self.into_host())
    }
}

impl<V: IntoHost, E: fmt::Display> IntoInvokeResult for Result<V, E> {
    fn host_kind() -> HostKind {
        V::host_kind()
    }

    fn into_result(self) -> Result<HostValue, InvokeError> {
        self.map(IntoHost::into_host)
            .map_err(|e| InvokeError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Color {
        Red = 1,
        Blue = 4,
    }

    impl HostEnum for Color {
        const NAME: &'static str = "Color";
        const VARIANTS: &'static [i64] = &[1, 4];

        fn to_i64(self) -> i64 {
            self as i64
        }

        fn from_i64(value: i64) -> Option<Self> {
            match value {
                1 => Some(Color::Red),
                4 => Some(Color::Blue),
                _ => None,
            }
        }
    }

    #[test]
    fn test_primitive_conversions() {
        assert_eq!(<i32 as FromHost>::host_kind(), HostKind::I32);
        assert_eq!(i32::from_host(HostValue::I32(5)), Some(5));
        assert_eq!(i32::from_host(HostValue::I64(5)), None);
        assert!(matches!("x".into_host(), HostValue::String(s) if s == "x"));
    }

    #[test]
    fn test_enum_wrapper() {
        let kind = <EnumValue<Color> as FromHost>::host_kind();
        assert_eq!(kind.name(), "Color");
        let value = EnumValue(Color::Blue).into_host();
        assert!(matches!(value, HostValue::Enum { value: 4, .. }));
        assert_eq!(EnumValue::<Color>::from_host(value), Some(EnumValue(Color::Blue)));
        assert_eq!(
            EnumValue::<Color>::from_host(HostValue::Enum { name: "Color", value: 2 }),
            None
        );
        assert_eq!(Color::Red.to_i64(), 1);
    }

    #[test]
    fn test_result_into_invoke_result() {
        let ok: Result<i32, String> = Ok(3);
        assert!(matches!(ok.into_result(), Ok(HostValue::I32(3))));
        let err: Result<i32, String> = Err("boom".to_string());
        assert_eq!(err.into_result().unwrap_err(), InvokeError::new("boom"));
    }

    #[test]
    fn test_option_none_is_null() {
        let none: Option<i32> = None;
        assert!(matches!(none.into_host(), HostValue::Value(NativeValue::Null)));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(HostKind::from_type_name("int32"), Some(HostKind::I32));
        assert_eq!(HostKind::from_type_name("Point"), None);
        assert_eq!(HostKind::TimeSpan.to_string(), "timespan");
        assert!(HostKind::Derived {
            type_id: TypeId::of::<u8>(),
            name: "Base",
        }
        .is_object());
    }
}
