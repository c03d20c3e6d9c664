//! Native callbacks of bound types
//!
//! The native engine calls back into the binder through these:
//!
//! | Callback               | Installed on               | Serves                       |
//! |------------------------|----------------------------|------------------------------|
//! | [`InstanceInterceptor`]| instance template          | `obj.member`, `obj[i]`       |
//! | [`StaticInterceptor`]  | constructor template       | `Type.member`                |
//! | [`ConstructorHandler`] | constructor template       | `new Type(..)`               |
//! | [`MethodHandler`]      | one template per method    | `obj.method(..)`             |
//!
//! All of them hold weak references only; a callback arriving after the
//! engine or binder is gone answers with a `ReferenceError` value.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use tether_sdk::{CallHandler, CallInfo, NamedInterceptor, NativeValue, ObjectId, ScriptError};

use super::convert;
use super::member::MemberDescriptor;
use super::overload::panic_message;
use super::TypeBinder;
use crate::engine::EngineShared;
use crate::object::TrackedObject;

fn gone(what: &str) -> NativeValue {
    NativeValue::Error(ScriptError::reference(format!("{} is no longer available", what)))
}

fn indexer_panicked(binder: &TypeBinder, payload: &(dyn Any + Send)) -> NativeValue {
    NativeValue::Error(ScriptError::execution(format!(
        "{} indexer panicked: {}",
        binder.name(),
        panic_message(payload)
    )))
}

fn upgrade(binder: &Weak<TypeBinder>, engine: &Weak<EngineShared>) -> Option<(Arc<TypeBinder>, Arc<EngineShared>)> {
    Some((binder.upgrade()?, engine.upgrade()?))
}

fn holder_object(engine: &EngineShared, holder: ObjectId) -> Result<Arc<TrackedObject>, NativeValue> {
    engine.registry().lookup(holder).ok_or_else(|| {
        NativeValue::Error(ScriptError::reference(format!("object {} is no longer tracked", holder)))
    })
}

/// Instance member access
pub(crate) struct InstanceInterceptor {
    binder: Weak<TypeBinder>,
    engine: Weak<EngineShared>,
}

impl InstanceInterceptor {
    pub(crate) fn new(binder: Weak<TypeBinder>, engine: Weak<EngineShared>) -> Self {
        Self { binder, engine }
    }
}

impl NamedInterceptor for InstanceInterceptor {
    fn get(&self, holder: ObjectId, name: &str) -> Option<NativeValue> {
        let Some((binder, engine)) = upgrade(&self.binder, &self.engine) else {
            return Some(gone("bound type"));
        };
        let member = binder.member(name)?;
        Some(match holder_object(&engine, holder) {
            Ok(object) => member.read(&engine, &object),
            Err(error) => error,
        })
    }

    fn set(&self, holder: ObjectId, name: &str, value: &NativeValue) -> Option<NativeValue> {
        let Some((binder, engine)) = upgrade(&self.binder, &self.engine) else {
            return Some(gone("bound type"));
        };
        let member = binder.member(name)?;
        Some(match holder_object(&engine, holder) {
            Ok(object) => member.write(&engine, &object, value),
            Err(error) => error,
        })
    }

    fn get_index(&self, holder: ObjectId, index: u32) -> Option<NativeValue> {
        let (binder, engine) = upgrade(&self.binder, &self.engine)?;
        let (owner, indexer) = binder.indexer()?;
        let object = match holder_object(&engine, holder) {
            Ok(object) => object,
            Err(error) => return Some(error),
        };
        let read = {
            let cell = object.read_cell();
            catch_unwind(AssertUnwindSafe(|| {
                object.binder().project(&*cell, owner).and_then(|this| (indexer.get)(this, index))
            }))
        };
        Some(match read {
            Ok(Some(value)) => convert::to_native(&engine, value)
                .unwrap_or_else(|e| NativeValue::Error(ScriptError::binding(e.to_string()))),
            Ok(None) => NativeValue::Undefined,
            Err(payload) => indexer_panicked(&binder, payload.as_ref()),
        })
    }

    fn set_index(&self, holder: ObjectId, index: u32, value: &NativeValue) -> Option<NativeValue> {
        let (binder, engine) = upgrade(&self.binder, &self.engine)?;
        let (owner, indexer) = binder.indexer()?;
        let Some(set) = indexer.set.as_ref() else {
            return Some(NativeValue::Error(ScriptError::security(format!(
                "{} indexer is read-only",
                binder.name()
            ))));
        };
        let Some(host) = convert::to_host(&engine, &indexer.kind, value) else {
            return Some(NativeValue::Error(ScriptError::type_error(format!(
                "cannot store {} in {}[{}] ({})",
                value.tag(),
                binder.name(),
                index,
                indexer.kind
            ))));
        };
        let object = match holder_object(&engine, holder) {
            Ok(object) => object,
            Err(error) => return Some(error),
        };
        let stored = {
            let mut cell = object.write_cell();
            catch_unwind(AssertUnwindSafe(|| {
                object
                    .binder()
                    .project_mut(&mut *cell, owner)
                    .map(|this| set(this, index, host))
                    .unwrap_or(false)
            }))
        };
        Some(match stored {
            Ok(true) => value.clone(),
            Ok(false) => NativeValue::Error(ScriptError::range(format!("{}[{}] is out of range", binder.name(), index))),
            Err(payload) => indexer_panicked(&binder, payload.as_ref()),
        })
    }

    fn names(&self, _holder: ObjectId) -> Vec<String> {
        self.binder.upgrade().map(|b| b.member_names()).unwrap_or_default()
    }
}

/// Static member access on the constructor function
pub(crate) struct StaticInterceptor {
    binder: Weak<TypeBinder>,
    engine: Weak<EngineShared>,
}

impl StaticInterceptor {
    pub(crate) fn new(binder: Weak<TypeBinder>, engine: Weak<EngineShared>) -> Self {
        Self { binder, engine }
    }
}

impl NamedInterceptor for StaticInterceptor {
    fn get(&self, _holder: ObjectId, name: &str) -> Option<NativeValue> {
        let Some((binder, engine)) = upgrade(&self.binder, &self.engine) else {
            return Some(gone("bound type"));
        };
        let member = binder.static_member(name)?;
        Some(member.read_static(&engine))
    }

    fn set(&self, _holder: ObjectId, name: &str, _value: &NativeValue) -> Option<NativeValue> {
        let binder = self.binder.upgrade()?;
        binder.static_member(name)?;
        Some(NativeValue::Error(ScriptError::security(format!(
            "{}.{} is read-only",
            binder.name(),
            name
        ))))
    }

    fn names(&self, _holder: ObjectId) -> Vec<String> {
        self.binder.upgrade().map(|b| b.static_member_names()).unwrap_or_default()
    }
}

/// `new Type(..)`
pub(crate) struct ConstructorHandler {
    binder: Weak<TypeBinder>,
    engine: Weak<EngineShared>,
}

impl ConstructorHandler {
    pub(crate) fn new(binder: Weak<TypeBinder>, engine: Weak<EngineShared>) -> Self {
        Self { binder, engine }
    }
}

impl CallHandler for ConstructorHandler {
    fn call(&self, info: CallInfo<'_>) -> NativeValue {
        let Some((binder, engine)) = upgrade(&self.binder, &self.engine) else {
            return gone("bound type");
        };
        if !info.is_construct {
            return NativeValue::Error(ScriptError::type_error(format!(
                "constructor {} cannot be invoked without 'new'",
                binder.name()
            )));
        }
        match binder.construct(&engine, info.args) {
            Ok(value) => value,
            Err(error) => NativeValue::Error(error),
        }
    }
}

/// Calls of a bound method's native function
pub(crate) struct MethodHandler {
    member: Weak<MemberDescriptor>,
    engine: Weak<EngineShared>,
}

impl MethodHandler {
    pub(crate) fn new(member: Weak<MemberDescriptor>, engine: Weak<EngineShared>) -> Self {
        Self { member, engine }
    }
}

impl CallHandler for MethodHandler {
    fn call(&self, info: CallInfo<'_>) -> NativeValue {
        let (Some(member), Some(engine)) = (self.member.upgrade(), self.engine.upgrade()) else {
            return gone("method");
        };
        if member.kind().is_static() {
            return member.invoke(&engine, None, info.args);
        }
        match holder_object(&engine, info.holder) {
            Ok(object) => member.invoke(&engine, Some(&object), info.args),
            Err(_) => NativeValue::Error(ScriptError::type_error(format!(
                "{}.{} called on a value that is not a bound {} ({})",
                member.owner_name(),
                member.name(),
                member.owner_name(),
                info.this.tag()
            ))),
        }
    }
}
