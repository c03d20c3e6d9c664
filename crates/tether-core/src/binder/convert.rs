//! Conversions between native values and host values
//!
//! Primitive kinds go through a fixed dispatch table ([`codec`]); each entry
//! scores how well a native value fits (0 = no, 1 = convertible, 2 = exact)
//! and converts in both directions. Enums, bound objects, pass-through
//! values and type lists need the engine and are handled by [`score`],
//! [`to_host`] and [`to_native`].

use std::time::Duration;

use tether_sdk::{NativeValue, ScriptError};

use super::value::{AnyView, HostKind, HostValue};
use crate::engine::EngineShared;
use crate::error::BridgeResult;

/// No conversion
pub(crate) const NO_MATCH: u8 = 0;
/// Convertible with coercion
pub(crate) const CONVERTIBLE: u8 = 1;
/// Natural representation
pub(crate) const EXACT: u8 = 2;

/// Primitive kinds covered by the dispatch table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Primitive {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Char,
    String,
    Date,
    TimeSpan,
}

impl Primitive {
    pub(crate) fn of(kind: &HostKind) -> Option<Self> {
        let primitive = match kind {
            HostKind::Bool => Primitive::Bool,
            HostKind::I8 => Primitive::I8,
            HostKind::I16 => Primitive::I16,
            HostKind::I32 => Primitive::I32,
            HostKind::I64 => Primitive::I64,
            HostKind::U8 => Primitive::U8,
            HostKind::U16 => Primitive::U16,
            HostKind::U32 => Primitive::U32,
            HostKind::U64 => Primitive::U64,
            HostKind::F32 => Primitive::F32,
            HostKind::F64 => Primitive::F64,
            HostKind::Char => Primitive::Char,
            HostKind::String => Primitive::String,
            HostKind::Date => Primitive::Date,
            HostKind::TimeSpan => Primitive::TimeSpan,
            _ => return None,
        };
        Some(primitive)
    }
}

/// One row of the dispatch table
pub(crate) struct Codec {
    pub score: fn(&NativeValue) -> u8,
    pub to_host: fn(&NativeValue) -> Option<HostValue>,
    pub to_native: fn(HostValue) -> Option<NativeValue>,
}

/// Table row for a primitive kind
pub(crate) fn codec(primitive: Primitive) -> &'static Codec {
    &CODECS[primitive as usize]
}

fn integral(n: f64, min: f64, max: f64) -> bool {
    n.fract() == 0.0 && n >= min && n <= max
}

fn wide_int(v: i128) -> NativeValue {
    match i32::try_from(v) {
        Ok(i) => NativeValue::Int32(i),
        Err(_) => NativeValue::Number(v as f64),
    }
}

macro_rules! int_codec {
    ($score:ident, $to_host:ident, $to_native:ident, $ty:ty, $variant:ident, $exact:expr) => {
        fn $score(value: &NativeValue) -> u8 {
            match value {
                NativeValue::Int32(i) if <$ty>::try_from(*i).is_ok() => {
                    if $exact {
                        EXACT
                    } else {
                        CONVERTIBLE
                    }
                }
                NativeValue::Number(n) if integral(*n, <$ty>::MIN as f64, <$ty>::MAX as f64) => CONVERTIBLE,
                _ => NO_MATCH,
            }
        }

        fn $to_host(value: &NativeValue) -> Option<HostValue> {
            let v = match value {
                NativeValue::Int32(i) => <$ty>::try_from(*i).ok()?,
                NativeValue::Number(n) if integral(*n, <$ty>::MIN as f64, <$ty>::MAX as f64) => *n as $ty,
                _ => return None,
            };
            Some(HostValue::$variant(v))
        }

        fn $to_native(value: HostValue) -> Option<NativeValue> {
            match value {
                HostValue::$variant(v) => Some(wide_int(v as i128)),
                _ => None,
            }
        }
    };
}

int_codec!(score_i8, host_i8, native_i8, i8, I8, false);
int_codec!(score_i16, host_i16, native_i16, i16, I16, false);
int_codec!(score_i32, host_i32, native_i32, i32, I32, true);
int_codec!(score_i64, host_i64, native_i64, i64, I64, false);
int_codec!(score_u8, host_u8, native_u8, u8, U8, false);
int_codec!(score_u16, host_u16, native_u16, u16, U16, false);
int_codec!(score_u32, host_u32, native_u32, u32, U32, false);
int_codec!(score_u64, host_u64, native_u64, u64, U64, false);

fn score_bool(value: &NativeValue) -> u8 {
    match value {
        NativeValue::Bool(_) => EXACT,
        _ => NO_MATCH,
    }
}

fn host_bool(value: &NativeValue) -> Option<HostValue> {
    match value {
        NativeValue::Bool(b) => Some(HostValue::Bool(*b)),
        _ => None,
    }
}

fn native_bool(value: HostValue) -> Option<NativeValue> {
    match value {
        HostValue::Bool(b) => Some(NativeValue::Bool(b)),
        _ => None,
    }
}

fn score_f64(value: &NativeValue) -> u8 {
    match value {
        NativeValue::Number(_) => EXACT,
        NativeValue::Int32(_) => CONVERTIBLE,
        _ => NO_MATCH,
    }
}

fn host_f64(value: &NativeValue) -> Option<HostValue> {
    match value {
        NativeValue::Number(n) => Some(HostValue::F64(*n)),
        NativeValue::Int32(i) => Some(HostValue::F64(*i as f64)),
        _ => None,
    }
}

fn native_f64(value: HostValue) -> Option<NativeValue> {
    match value {
        HostValue::F64(n) => Some(NativeValue::Number(n)),
        _ => None,
    }
}

fn score_f32(value: &NativeValue) -> u8 {
    match value {
        NativeValue::Number(_) | NativeValue::Int32(_) => CONVERTIBLE,
        _ => NO_MATCH,
    }
}

fn host_f32(value: &NativeValue) -> Option<HostValue> {
    match value {
        NativeValue::Number(n) => Some(HostValue::F32(*n as f32)),
        NativeValue::Int32(i) => Some(HostValue::F32(*i as f32)),
        _ => None,
    }
}

fn native_f32(value: HostValue) -> Option<NativeValue> {
    match value {
        HostValue::F32(n) => Some(NativeValue::Number(n as f64)),
        _ => None,
    }
}

fn single_char(s: &str) -> Option<char> {
    let mut chars = s.chars();
    let c = chars.next()?;
    chars.next().is_none().then_some(c)
}

fn score_char(value: &NativeValue) -> u8 {
    match value.as_str().and_then(single_char) {
        Some(_) => CONVERTIBLE,
        None => NO_MATCH,
    }
}

fn host_char(value: &NativeValue) -> Option<HostValue> {
    value.as_str().and_then(single_char).map(HostValue::Char)
}

fn native_char(value: HostValue) -> Option<NativeValue> {
    match value {
        HostValue::Char(c) => Some(NativeValue::string(c.to_string())),
        _ => None,
    }
}

fn score_string(value: &NativeValue) -> u8 {
    match value {
        NativeValue::String(_) => EXACT,
        _ => NO_MATCH,
    }
}

fn host_string(value: &NativeValue) -> Option<HostValue> {
    value.as_str().map(|s| HostValue::String(s.to_string()))
}

fn native_string(value: HostValue) -> Option<NativeValue> {
    match value {
        HostValue::String(s) => Some(NativeValue::string(s)),
        _ => None,
    }
}

fn score_date(value: &NativeValue) -> u8 {
    match value {
        NativeValue::Date(_) => EXACT,
        _ => NO_MATCH,
    }
}

fn host_date(value: &NativeValue) -> Option<HostValue> {
    match value {
        NativeValue::Date(_) => value.to_system_time().map(HostValue::Date),
        _ => None,
    }
}

fn native_date(value: HostValue) -> Option<NativeValue> {
    match value {
        HostValue::Date(t) => Some(NativeValue::from_system_time(t)),
        _ => None,
    }
}

fn score_timespan(value: &NativeValue) -> u8 {
    match value.as_number() {
        Some(ms) if ms >= 0.0 && ms.is_finite() => CONVERTIBLE,
        _ => NO_MATCH,
    }
}

fn host_timespan(value: &NativeValue) -> Option<HostValue> {
    let ms = value.as_number().filter(|ms| *ms >= 0.0 && ms.is_finite())?;
    Some(HostValue::TimeSpan(Duration::from_secs_f64(ms / 1000.0)))
}

fn native_timespan(value: HostValue) -> Option<NativeValue> {
    match value {
        HostValue::TimeSpan(d) => Some(NativeValue::Number(d.as_secs_f64() * 1000.0)),
        _ => None,
    }
}

macro_rules! row {
    ($score:ident, $to_host:ident, $to_native:ident) => {
        Codec {
            score: $score,
            to_host: $to_host,
            to_native: $to_native,
        }
    };
}

// Indexed by `Primitive as usize`
static CODECS: [Codec; 15] = [
    row!(score_bool, host_bool, native_bool),
    row!(score_i8, host_i8, native_i8),
    row!(score_i16, host_i16, native_i16),
    row!(score_i32, host_i32, native_i32),
    row!(score_i64, host_i64, native_i64),
    row!(score_u8, host_u8, native_u8),
    row!(score_u16, host_u16, native_u16),
    row!(score_u32, host_u32, native_u32),
    row!(score_u64, host_u64, native_u64),
    row!(score_f32, host_f32, native_f32),
    row!(score_f64, host_f64, native_f64),
    row!(score_char, host_char, native_char),
    row!(score_string, host_string, native_string),
    row!(score_date, host_date, native_date),
    row!(score_timespan, host_timespan, native_timespan),
];

/// The kind a native value maps to without coercion
pub(crate) fn natural_kind(value: &NativeValue) -> Option<HostKind> {
    let kind = match value {
        NativeValue::Bool(_) => HostKind::Bool,
        NativeValue::Int32(_) => HostKind::I32,
        NativeValue::Number(_) => HostKind::F64,
        NativeValue::String(_) => HostKind::String,
        NativeValue::Date(_) => HostKind::Date,
        _ => return None,
    };
    Some(kind)
}

fn enum_discriminant(value: &NativeValue, variants: &[i64]) -> Option<(i64, u8)> {
    let (v, score) = match value {
        NativeValue::Int32(i) => (*i as i64, EXACT),
        NativeValue::Number(n) if n.fract() == 0.0 && n.is_finite() => (*n as i64, CONVERTIBLE),
        _ => return None,
    };
    variants.contains(&v).then_some((v, score))
}

/// How well `value` fits a parameter of `kind`
pub(crate) fn score(engine: &EngineShared, kind: &HostKind, value: &NativeValue) -> u8 {
    if let Some(p) = Primitive::of(kind) {
        return (codec(p).score)(value);
    }
    match kind {
        HostKind::Enum { variants, .. } => enum_discriminant(value, variants).map(|(_, s)| s).unwrap_or(NO_MATCH),
        HostKind::Object { type_id, .. } => match engine.tracked_object(value) {
            Some(object) if object.type_id() == *type_id => EXACT,
            _ => NO_MATCH,
        },
        HostKind::Derived { type_id, .. } => match engine.tracked_object(value) {
            Some(object) if object.type_id() == *type_id => EXACT,
            Some(object) if object.binder().is_assignable_to(*type_id) => CONVERTIBLE,
            _ => NO_MATCH,
        },
        HostKind::Value => CONVERTIBLE,
        HostKind::Types => match value {
            NativeValue::Array(_) => CONVERTIBLE,
            _ => NO_MATCH,
        },
        _ => NO_MATCH,
    }
}

/// Convert a native value for a parameter or member of `kind`
pub(crate) fn to_host(engine: &EngineShared, kind: &HostKind, value: &NativeValue) -> Option<HostValue> {
    if let Some(p) = Primitive::of(kind) {
        return (codec(p).to_host)(value);
    }
    match kind {
        HostKind::Enum { name, variants } => {
            enum_discriminant(value, variants).map(|(value, _)| HostValue::Enum { name: *name, value })
        }
        HostKind::Object { type_id, .. } => {
            let object = engine.tracked_object(value)?;
            (object.type_id() == *type_id).then(|| HostValue::Object(object.host().clone()))
        }
        HostKind::Derived { type_id, name } => {
            let object = engine.tracked_object(value)?;
            object.binder().is_assignable_to(*type_id).then(|| {
                HostValue::View(AnyView {
                    object: object.host().clone(),
                    binder: object.binder().clone(),
                    target: *type_id,
                    target_name: *name,
                })
            })
        }
        HostKind::Value => Some(HostValue::Value(value.clone())),
        HostKind::Types => type_tokens(engine, value).ok().map(HostValue::Types),
        _ => None,
    }
}

/// Convert a host value for scripts. Host objects are bound on the way out.
pub(crate) fn to_native(engine: &EngineShared, value: HostValue) -> BridgeResult<NativeValue> {
    let native = match value {
        HostValue::Unit => NativeValue::Undefined,
        HostValue::Enum { value, .. } => wide_int(value as i128),
        HostValue::Object(host) => engine.bind_host_object(host)?.1,
        HostValue::View(view) => engine.bind_host_object(view.object)?.1,
        HostValue::Value(v) => v,
        HostValue::Types(kinds) => {
            let names = kinds.iter().map(|k| NativeValue::string(k.name())).collect();
            engine.native()?.create_array(names)
        }
        primitive => primitive_to_native(primitive).unwrap_or(NativeValue::Undefined),
    };
    Ok(native)
}

fn primitive_to_native(value: HostValue) -> Option<NativeValue> {
    let p = match &value {
        HostValue::Bool(_) => Primitive::Bool,
        HostValue::I8(_) => Primitive::I8,
        HostValue::I16(_) => Primitive::I16,
        HostValue::I32(_) => Primitive::I32,
        HostValue::I64(_) => Primitive::I64,
        HostValue::U8(_) => Primitive::U8,
        HostValue::U16(_) => Primitive::U16,
        HostValue::U32(_) => Primitive::U32,
        HostValue::U64(_) => Primitive::U64,
        HostValue::F32(_) => Primitive::F32,
        HostValue::F64(_) => Primitive::F64,
        HostValue::Char(_) => Primitive::Char,
        HostValue::String(_) => Primitive::String,
        HostValue::Date(_) => Primitive::Date,
        HostValue::TimeSpan(_) => Primitive::TimeSpan,
        _ => return None,
    };
    (codec(p).to_native)(value)
}

/// Read an array of type tokens: primitive type names, registered type
/// names, or constructor functions of registered types
pub(crate) fn type_tokens(engine: &EngineShared, value: &NativeValue) -> Result<Vec<HostKind>, ScriptError> {
    if !matches!(value, NativeValue::Array(_)) {
        return Err(ScriptError::type_error(format!(
            "expected an array of type arguments, got {}",
            value.tag()
        )));
    }
    let native = engine
        .native()
        .map_err(|e| ScriptError::reference(e.to_string()))?;
    let length = native
        .get_property(value, "length")
        .map_err(|e| ScriptError::type_error(e.to_string()))?
        .to_int32()
        .max(0) as u32;

    let mut kinds = Vec::with_capacity(length as usize);
    for index in 0..length {
        let token = native
            .get_index(value, index)
            .map_err(|e| ScriptError::type_error(e.to_string()))?;
        let kind = match &token {
            NativeValue::String(name) => HostKind::from_type_name(name).or_else(|| engine.kind_by_name(name)),
            NativeValue::Function(_) => engine.kind_by_marker(native.object_id_of(&token)),
            _ => None,
        };
        match kind {
            Some(kind) => kinds.push(kind),
            None => {
                return Err(ScriptError::type_error(format!(
                    "type argument {} ({}) does not name a known type",
                    index + 1,
                    token
                )))
            }
        }
    }
    Ok(kinds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn host(kind: HostKind, value: NativeValue) -> Option<HostValue> {
        Primitive::of(&kind).and_then(|p| (codec(p).to_host)(&value))
    }

    #[test]
    fn test_int32_scores() {
        let i32_codec = codec(Primitive::I32);
        assert_eq!((i32_codec.score)(&NativeValue::Int32(3)), EXACT);
        assert_eq!((i32_codec.score)(&NativeValue::Number(3.0)), CONVERTIBLE);
        assert_eq!((i32_codec.score)(&NativeValue::Number(3.5)), NO_MATCH);
        assert_eq!((i32_codec.score)(&NativeValue::string("3")), NO_MATCH);
        assert_eq!((codec(Primitive::I64).score)(&NativeValue::Int32(3)), CONVERTIBLE);
    }

    #[test]
    fn test_integer_range_checks() {
        assert!(matches!(host(HostKind::U8, NativeValue::Int32(255)), Some(HostValue::U8(255))));
        assert!(host(HostKind::U8, NativeValue::Int32(256)).is_none());
        assert!(host(HostKind::U32, NativeValue::Int32(-1)).is_none());
        assert!(matches!(
            host(HostKind::I64, NativeValue::Number(5e10)),
            Some(HostValue::I64(50_000_000_000))
        ));
    }

    #[test]
    fn test_wide_integers_become_numbers() {
        assert_eq!(primitive_to_native(HostValue::U64(7)), Some(NativeValue::Int32(7)));
        assert_eq!(
            primitive_to_native(HostValue::I64(1 << 40)),
            Some(NativeValue::Number((1u64 << 40) as f64))
        );
    }

    #[test]
    fn test_float_scores() {
        assert_eq!((codec(Primitive::F64).score)(&NativeValue::Number(1.5)), EXACT);
        assert_eq!((codec(Primitive::F64).score)(&NativeValue::Int32(1)), CONVERTIBLE);
        assert!(matches!(host(HostKind::F32, NativeValue::Int32(2)), Some(HostValue::F32(v)) if v == 2.0));
    }

    #[test]
    fn test_char_needs_single_character() {
        assert!(matches!(host(HostKind::Char, NativeValue::string("x")), Some(HostValue::Char('x'))));
        assert!(host(HostKind::Char, NativeValue::string("xy")).is_none());
        assert!(host(HostKind::Char, NativeValue::string("")).is_none());
        assert_eq!(primitive_to_native(HostValue::Char('q')), Some(NativeValue::string("q")));
    }

    #[test]
    fn test_dates_and_timespans() {
        let t = UNIX_EPOCH + Duration::from_millis(1500);
        let native = primitive_to_native(HostValue::Date(t)).unwrap();
        assert_eq!(native, NativeValue::Date(1500.0));
        assert!(matches!(host(HostKind::Date, native), Some(HostValue::Date(back)) if back == t));

        assert!(matches!(
            host(HostKind::TimeSpan, NativeValue::Int32(250)),
            Some(HostValue::TimeSpan(d)) if d == Duration::from_millis(250)
        ));
        assert!(host(HostKind::TimeSpan, NativeValue::Int32(-1)).is_none());
    }

    #[test]
    fn test_natural_kinds() {
        assert_eq!(natural_kind(&NativeValue::Int32(1)), Some(HostKind::I32));
        assert_eq!(natural_kind(&NativeValue::Number(1.0)), Some(HostKind::F64));
        assert_eq!(natural_kind(&NativeValue::Null), None);
    }

    #[test]
    fn test_enum_discriminants() {
        assert_eq!(enum_discriminant(&NativeValue::Int32(4), &[1, 4]), Some((4, EXACT)));
        assert_eq!(enum_discriminant(&NativeValue::Number(1.0), &[1, 4]), Some((1, CONVERTIBLE)));
        assert_eq!(enum_discriminant(&NativeValue::Int32(2), &[1, 4]), None);
    }
}
