//! Script-style coercions of native values

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::value::NativeValue;

impl NativeValue {
    /// Truthiness
    pub fn to_boolean(&self) -> bool {
        match self {
            NativeValue::Undefined | NativeValue::Null => false,
            NativeValue::Bool(b) => *b,
            NativeValue::Int32(i) => *i != 0,
            NativeValue::Number(n) => *n != 0.0 && !n.is_nan(),
            NativeValue::String(s) => !s.is_empty(),
            NativeValue::Date(_)
            | NativeValue::Object(_)
            | NativeValue::Function(_)
            | NativeValue::Array(_)
            | NativeValue::Error(_) => true,
        }
    }

    /// Numeric value; `NaN` when there is none
    pub fn to_number(&self) -> f64 {
        match self {
            NativeValue::Undefined => f64::NAN,
            NativeValue::Null => 0.0,
            NativeValue::Bool(b) => f64::from(u8::from(*b)),
            NativeValue::Int32(i) => f64::from(*i),
            NativeValue::Number(n) | NativeValue::Date(n) => *n,
            NativeValue::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            _ => f64::NAN,
        }
    }

    /// Numeric value wrapped to 32 bits
    pub fn to_int32(&self) -> i32 {
        if let NativeValue::Int32(i) = self {
            return *i;
        }
        wrap_int32(self.to_number())
    }

    /// String rendering of the value
    pub fn to_display_string(&self) -> String {
        match self {
            NativeValue::Undefined => "undefined".to_string(),
            NativeValue::Null => "null".to_string(),
            NativeValue::Bool(b) => b.to_string(),
            NativeValue::Int32(i) => i.to_string(),
            NativeValue::Number(n) => format_number(*n),
            NativeValue::String(s) => s.to_string(),
            NativeValue::Date(ms) => format!("Date({})", format_number(*ms)),
            NativeValue::Object(_) => "[object Object]".to_string(),
            NativeValue::Function(_) => "function () { [native code] }".to_string(),
            NativeValue::Array(_) => "[object Array]".to_string(),
            NativeValue::Error(e) => e.to_string(),
        }
    }

    /// Date value for a point in time
    pub fn from_system_time(time: SystemTime) -> Self {
        NativeValue::Date(system_time_to_millis(time))
    }

    /// Point in time for date and number values
    pub fn to_system_time(&self) -> Option<SystemTime> {
        match self {
            NativeValue::Date(ms) | NativeValue::Number(ms) => millis_to_system_time(*ms),
            NativeValue::Int32(ms) => millis_to_system_time(f64::from(*ms)),
            _ => None,
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn system_time_to_millis(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs_f64() * 1000.0,
        Err(before) => -(before.duration().as_secs_f64() * 1000.0),
    }
}

/// Inverse of [`system_time_to_millis`]; `None` for non-finite input
pub fn millis_to_system_time(ms: f64) -> Option<SystemTime> {
    if !ms.is_finite() {
        return None;
    }
    let offset = Duration::try_from_secs_f64(ms.abs() / 1000.0).ok()?;
    if ms >= 0.0 {
        UNIX_EPOCH.checked_add(offset)
    } else {
        UNIX_EPOCH.checked_sub(offset)
    }
}

fn wrap_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let wrapped = n.trunc().rem_euclid(4_294_967_296.0);
    if wrapped >= 2_147_483_648.0 {
        (wrapped - 4_294_967_296.0) as i32
    } else {
        wrapped as i32
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!NativeValue::Undefined.to_boolean());
        assert!(!NativeValue::Number(f64::NAN).to_boolean());
        assert!(!NativeValue::from("").to_boolean());
        assert!(NativeValue::from("0").to_boolean());
        assert!(NativeValue::Int32(-1).to_boolean());
    }

    #[test]
    fn test_to_number() {
        assert_eq!(NativeValue::Null.to_number(), 0.0);
        assert_eq!(NativeValue::from(" 42 ").to_number(), 42.0);
        assert!(NativeValue::from("abc").to_number().is_nan());
        assert_eq!(NativeValue::Bool(true).to_number(), 1.0);
    }

    #[test]
    fn test_to_int32_wraps() {
        assert_eq!(NativeValue::Number(4_294_967_297.0).to_int32(), 1);
        assert_eq!(NativeValue::Number(2_147_483_648.0).to_int32(), i32::MIN);
        assert_eq!(NativeValue::Number(-1.9).to_int32(), -1);
        assert_eq!(NativeValue::Number(f64::NAN).to_int32(), 0);
    }

    #[test]
    fn test_display_string() {
        assert_eq!(NativeValue::Number(3.0).to_display_string(), "3");
        assert_eq!(NativeValue::Number(2.5).to_display_string(), "2.5");
        assert_eq!(NativeValue::Number(f64::NEG_INFINITY).to_display_string(), "-Infinity");
        assert_eq!(NativeValue::Null.to_display_string(), "null");
    }

    #[test]
    fn test_dates_before_and_after_epoch() {
        let later = UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(system_time_to_millis(later), 1_500.0);
        assert_eq!(millis_to_system_time(1_500.0), Some(later));

        let earlier = UNIX_EPOCH - Duration::from_millis(250);
        assert_eq!(system_time_to_millis(earlier), -250.0);
        assert_eq!(NativeValue::Date(-250.0).to_system_time(), Some(earlier));
        assert_eq!(millis_to_system_time(f64::INFINITY), None);
    }
}
