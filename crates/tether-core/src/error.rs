//! Error types for the bridge

use tether_sdk::{NativeError, ObjectId, ScriptError, ValueTag};

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised by [`Handle`](crate::Handle) operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandleError {
    /// The handle does not refer to a slot
    #[error("Handle is empty")]
    Empty,

    /// The handle was disposed
    #[error("Handle has been disposed")]
    Disposed,

    /// The owning engine was disposed
    #[error("Engine has been disposed")]
    EngineDisposed,

    /// Value cannot be read as the requested type
    #[error("Cannot convert {actual} to {expected}")]
    NotConvertible {
        /// Requested type
        expected: &'static str,
        /// Tag of the stored value
        actual: ValueTag,
    },

    /// The native engine rejected the operation
    #[error(transparent)]
    Native(#[from] NativeError),
}

/// Errors raised by engine facade operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// Engine has been disposed
    #[error("Engine has been disposed")]
    Disposed,

    /// Handle failure
    #[error(transparent)]
    Handle(#[from] HandleError),

    /// Native engine failure
    #[error(transparent)]
    Native(#[from] NativeError),

    /// Value is not a tracked host object
    #[error("Value is not a bound host object (found {0})")]
    NotBound(ValueTag),

    /// Tracked object has a different host type
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Requested host type
        expected: &'static str,
        /// Host type of the tracked object
        actual: &'static str,
    },

    /// Native collector already claimed the object
    #[error("Object {0} has been collected")]
    ObjectCollected(ObjectId),

    /// Type could not be bound
    #[error("Binding error: {0}")]
    Binding(String),

    /// No script front end installed
    #[error("No script front end installed")]
    NoFrontEnd,

    /// Script raised an error
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for BridgeError {
    fn from(e: toml::de::Error) -> Self {
        BridgeError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_error_display() {
        let e = HandleError::NotConvertible {
            expected: "date",
            actual: ValueTag::Bool,
        };
        assert_eq!(e.to_string(), "Cannot convert boolean to date");
    }

    #[test]
    fn test_bridge_error_from_native() {
        let e: BridgeError = NativeError::Collected.into();
        assert_eq!(e, BridgeError::Native(NativeError::Collected));
        assert_eq!(e.to_string(), "Object has been collected");
    }
}
