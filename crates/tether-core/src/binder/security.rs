//! Member security flags
//!
//! Each bound member carries flags deciding what scripts may do with it.
//! Flags come from the member itself, then the type default, then the
//! binder options default.
//!
//! | Flag      | Effect                                        |
//! |-----------|-----------------------------------------------|
//! | `READ`    | value may be read, method may be invoked      |
//! | `WRITE`   | value may be assigned                         |
//! | `HIDDEN`  | member is invisible (reads fall through)      |
//!
//! In TOML the flags are written by name, combined with `|`:
//! `default_security = "READ|WRITE"`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Script access flags (bitflags)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecurityFlags(u8);

impl SecurityFlags {
    /// No access
    pub const NONE: Self = Self(0x00);
    /// Read values and invoke methods
    pub const READ: Self = Self(0x01);
    /// Assign values
    pub const WRITE: Self = Self(0x02);
    /// Invisible to scripts
    pub const HIDDEN: Self = Self(0x04);

    /// READ | WRITE
    pub const READ_WRITE: Self = Self(0x03);

    /// Create from raw bits
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x07)
    }

    /// Raw bits
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check if all flags in `other` are set
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union of flags
    pub const fn union(&self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Remove flags
    pub const fn difference(&self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Readable and not hidden
    pub const fn can_read(&self) -> bool {
        self.contains(Self::READ) && !self.is_hidden()
    }

    /// Writable and not hidden
    pub const fn can_write(&self) -> bool {
        self.contains(Self::WRITE) && !self.is_hidden()
    }

    /// Invisible to scripts
    pub const fn is_hidden(&self) -> bool {
        self.contains(Self::HIDDEN)
    }

    /// Parse a single flag name or number
    pub fn parse_flag(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NONE" => Some(Self::NONE),
            "READ" | "READ_ONLY" => Some(Self::READ),
            "WRITE" => Some(Self::WRITE),
            "HIDDEN" => Some(Self::HIDDEN),
            "READ_WRITE" => Some(Self::READ_WRITE),
            _ => {
                if let Some(hex) = s.strip_prefix("0x") {
                    u8::from_str_radix(hex, 16).ok().map(Self::from_bits)
                } else {
                    s.parse::<u8>().ok().map(Self::from_bits)
                }
            }
        }
    }

    /// Parse pipe-separated flags (e.g. `"READ|HIDDEN"`)
    pub fn parse(s: &str) -> Option<Self> {
        let mut result = Self::NONE;
        for part in s.split('|') {
            result = result.union(Self::parse_flag(part.trim())?);
        }
        Some(result)
    }

    /// Canonical name
    pub fn name(&self) -> String {
        match *self {
            Self::NONE => "NONE".to_string(),
            Self::READ => "READ".to_string(),
            Self::WRITE => "WRITE".to_string(),
            Self::HIDDEN => "HIDDEN".to_string(),
            Self::READ_WRITE => "READ_WRITE".to_string(),
            _ => {
                let mut parts = Vec::new();
                for (flag, name) in [(Self::READ, "READ"), (Self::WRITE, "WRITE"), (Self::HIDDEN, "HIDDEN")] {
                    if self.contains(flag) {
                        parts.push(name);
                    }
                }
                parts.join("|")
            }
        }
    }
}

impl Default for SecurityFlags {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

impl fmt::Display for SecurityFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl TryFrom<String> for SecurityFlags {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).ok_or_else(|| format!("invalid security flags '{}'", s))
    }
}

impl From<SecurityFlags> for String {
    fn from(flags: SecurityFlags) -> Self {
        flags.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        assert!(SecurityFlags::READ_WRITE.contains(SecurityFlags::READ));
        assert!(SecurityFlags::READ_WRITE.contains(SecurityFlags::WRITE));
        assert!(!SecurityFlags::READ.contains(SecurityFlags::WRITE));
    }

    #[test]
    fn test_hidden_blocks_access() {
        let flags = SecurityFlags::READ_WRITE.union(SecurityFlags::HIDDEN);
        assert!(flags.is_hidden());
        assert!(!flags.can_read());
        assert!(!flags.can_write());
        assert!(flags.difference(SecurityFlags::HIDDEN).can_read());
    }

    #[test]
    fn test_parse() {
        assert_eq!(SecurityFlags::parse("read"), Some(SecurityFlags::READ));
        assert_eq!(SecurityFlags::parse("READ | WRITE"), Some(SecurityFlags::READ_WRITE));
        assert_eq!(SecurityFlags::parse("0x04"), Some(SecurityFlags::HIDDEN));
        assert_eq!(SecurityFlags::parse("EXECUTE"), None);
    }

    #[test]
    fn test_names() {
        assert_eq!(SecurityFlags::READ_WRITE.to_string(), "READ_WRITE");
        assert_eq!(SecurityFlags::from_bits(0x05).to_string(), "READ|HIDDEN");
        assert_eq!(String::from(SecurityFlags::NONE), "NONE");
    }
}
