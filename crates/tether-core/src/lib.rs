//! Tether - object lifetime bridge
//!
//! This crate keeps host objects and a garbage-collected script engine in
//! agreement about who owns what:
//! - **Handles**: owned references to native value slots (`handle` module)
//! - **Registry**: integer ids for tracked host objects (`registry` module)
//! - **Coordinator**: the background thread that walks objects from
//!   `Strong` to `Finalized` (`coordinator` module)
//! - **Binder**: native templates and lazy accessors for host types
//!   (`binder` module)
//! - **Engine**: the facade that ties them together (`engine` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{Engine, HostType, TypeBuilder};
//!
//! struct Point {
//!     x: i32,
//!     y: i32,
//! }
//!
//! impl HostType for Point {
//!     const NAME: &'static str = "Point";
//!
//!     fn describe(ty: &mut TypeBuilder<Self>) {
//!         ty.field("x", |p| p.x, |p, v| p.x = v);
//!         ty.field("y", |p| p.y, |p, v| p.y = v);
//!     }
//! }
//!
//! let engine = Engine::new();
//! let point = engine.bind(Point { x: 3, y: 4 })?;
//! assert_eq!(engine.get_property(&point, "x")?.as_i32()?, 3);
//! engine.set_property(&point, "y", 10)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Modules
// ============================================================================

pub mod binder;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod frontend;
pub mod handle;
pub mod isolate;
pub mod object;
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use binder::{
    share, AnyView, EnumValue, FromHost, GenericInstance, HostConstructor, HostEnum, HostFunction, HostKind, HostMethod,
    HostObject, HostType, HostValue, IntoHost, IntoInvokeResult, InvokeError, MemberConfig, MemberDescriptor,
    MemberKind, ObjectView, SecurityFlags, Shared, TypeBinder, TypeBuilder, TypeDescription,
};
pub use config::{BinderOptions, CoordinatorOptions, EngineOptions, HeapOptions};
pub use coordinator::{CoordinatorStats, LifetimeCoordinator, TerminateOutcome};
pub use engine::{Engine, EngineStats};
pub use error::{BridgeError, BridgeResult, HandleError};
pub use frontend::ScriptFrontEnd;
pub use handle::{Handle, HandleRef};
pub use isolate::{Isolate, IsolateStats};
pub use object::{HostRef, LifetimeState, TrackedObject};
pub use registry::ObjectRegistry;

pub use tether_sdk::{ErrorKind, NativeEngine, NativeValue, ObjectId, ScriptError, SlotId, ValueTag};
