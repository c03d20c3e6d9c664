//! Error types for the native engine contract

use std::fmt;

use crate::value::{SlotId, TemplateId, ValueTag};

/// Result type for native engine calls
pub type NativeResult<T> = Result<T, NativeError>;

/// Category of a script-level error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Wrong value type (argument or assignment mismatch)
    Type,
    /// Unknown or released object
    Reference,
    /// Value out of range for the target type
    Range,
    /// Member access denied by its security flags
    Security,
    /// Type could not be bound (abstract type, no constructor, bad type token)
    Binding,
    /// Host code failed or panicked
    Execution,
}

impl ErrorKind {
    /// Script-visible error class name
    pub const fn name(self) -> &'static str {
        match self {
            ErrorKind::Type => "TypeError",
            ErrorKind::Reference => "ReferenceError",
            ErrorKind::Range => "RangeError",
            ErrorKind::Security => "SecurityError",
            ErrorKind::Binding => "BindingError",
            ErrorKind::Execution => "ExecutionError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error value visible to scripts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ScriptError {
    /// Error category
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
}

impl ScriptError {
    /// Create a new script error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// `TypeError`
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    /// `ReferenceError`
    pub fn reference(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Reference, message)
    }

    /// `RangeError`
    pub fn range(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Range, message)
    }

    /// `SecurityError`
    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Security, message)
    }

    /// `BindingError`
    pub fn binding(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Binding, message)
    }

    /// `ExecutionError`
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }
}

/// Failures of the native engine contract itself
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NativeError {
    /// Slot was freed or reused
    #[error("Stale slot: {0}")]
    StaleSlot(SlotId),

    /// Slot was released more often than it was retained
    #[error("Slot over-released: {0}")]
    OverRelease(SlotId),

    /// Referenced heap object no longer exists
    #[error("Object has been collected")]
    Collected,

    /// Operation needs an object
    #[error("Not an object: {0}")]
    NotAnObject(ValueTag),

    /// Operation needs a function
    #[error("Not callable: {0}")]
    NotCallable(ValueTag),

    /// Template id was never registered
    #[error("Unknown template: {0}")]
    UnknownTemplate(TemplateId),

    /// Native engine has been torn down
    #[error("Native engine disposed")]
    Disposed,
}
