//! Tether SDK - value model and native engine contract
//!
//! This crate holds the types shared between the object bridge
//! (`tether-core`) and any script engine that plugs into it:
//!
//! - [`NativeValue`] and its identifiers ([`SlotId`], [`ObjectId`], [`ObjRef`])
//! - [`NativeEngine`], the contract an engine implements
//! - [`ScriptError`], errors as scripts see them
//!
//! # Example
//!
//! ```ignore
//! use tether_sdk::{NativeEngine, NativeValue};
//!
//! fn store(engine: &dyn NativeEngine) {
//!     let slot = engine.create_slot(NativeValue::from(42));
//!     assert_eq!(engine.slot_value(slot).unwrap(), NativeValue::Int32(42));
//!     engine.release_slot(slot).unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod convert;
pub mod engine;
pub mod error;
pub mod value;

pub use convert::{millis_to_system_time, system_time_to_millis};
pub use engine::{
    CallHandler, CallInfo, GcCallback, NamedInterceptor, NativeEngine, SlotRelease, TemplateSpec,
};
pub use error::{ErrorKind, NativeError, NativeResult, ScriptError};
pub use value::{NativeValue, ObjRef, ObjectId, SlotId, TemplateId, ValueTag};
