//! Member descriptors
//!
//! A [`MemberDescriptor`] is one script-visible member of a bound type. Its
//! accessor is materialized on first script access only:
//!
//! ```text
//!   Unbound ──(first get/set/call)──► Bound(Data { codec })
//!                                   └► Bound(Function { native function })
//! ```
//!
//! Data accessors cache the primitive codec of the member's kind; callable
//! members cache the native function object scripts receive.

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::debug;
use once_cell::sync::OnceCell;
use tether_sdk::{NativeValue, ObjectId, ScriptError, TemplateSpec};

use super::convert::{self, codec, Codec, Primitive};
use super::interceptor::MethodHandler;
use super::overload::{panic_message, GenericMethod, OverloadSet, Resolved};
use super::security::SecurityFlags;
use super::value::{HostKind, HostValue};
use crate::engine::EngineShared;
use crate::handle::Handle;
use crate::object::TrackedObject;

pub(crate) type Getter = Arc<dyn Fn(&dyn Any) -> Option<HostValue> + Send + Sync>;
pub(crate) type Setter = Arc<dyn Fn(&mut dyn Any, HostValue) -> bool + Send + Sync>;
pub(crate) type StaticGetter = Arc<dyn Fn() -> HostValue + Send + Sync>;
pub(crate) type IndexGetter = Arc<dyn Fn(&dyn Any, u32) -> Option<HostValue> + Send + Sync>;
pub(crate) type IndexSetter = Arc<dyn Fn(&mut dyn Any, u32, HostValue) -> bool + Send + Sync>;
pub(crate) type GenericFactory = Arc<dyn Fn(&[HostKind]) -> Result<super::overload::Overload, String> + Send + Sync>;
pub(crate) type TeardownFn = Arc<dyn Fn(&mut dyn Any) + Send + Sync>;

/// What a member is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    /// Readable and assignable data
    Field,
    /// Read-only computed value
    Property,
    /// Instance method (possibly overloaded)
    Method,
    /// Generic instance method
    GenericMethod,
    /// Static value on the constructor
    StaticProperty,
    /// Static function on the constructor
    StaticMethod,
}

impl MemberKind {
    /// True for members invoked rather than read
    pub fn is_callable(self) -> bool {
        matches!(self, MemberKind::Method | MemberKind::GenericMethod | MemberKind::StaticMethod)
    }

    /// True for members living on the constructor
    pub fn is_static(self) -> bool {
        matches!(self, MemberKind::StaticProperty | MemberKind::StaticMethod)
    }
}

pub(crate) enum MemberBody {
    Data {
        kind: HostKind,
        get: Getter,
        set: Option<Setter>,
    },
    Methods(Arc<OverloadSet>),
    Generic(Arc<GenericMethod>),
    StaticData {
        kind: HostKind,
        get: StaticGetter,
    },
    StaticMethods(Arc<OverloadSet>),
}

pub(crate) enum Accessor {
    Data { codec: Option<&'static Codec> },
    Function { value: NativeValue, _handle: Handle },
}

/// One script-visible member
pub struct MemberDescriptor {
    name: String,
    owner: TypeId,
    owner_name: &'static str,
    security: SecurityFlags,
    kind: MemberKind,
    body: MemberBody,
    accessor: OnceCell<Accessor>,
}

fn script_error(error: ScriptError) -> NativeValue {
    NativeValue::Error(error)
}

impl MemberDescriptor {
    pub(crate) fn new(
        name: String,
        owner: TypeId,
        owner_name: &'static str,
        security: SecurityFlags,
        kind: MemberKind,
        body: MemberBody,
    ) -> Self {
        Self {
            name,
            owner,
            owner_name,
            security,
            kind,
            body,
            accessor: OnceCell::new(),
        }
    }

    /// Script name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the declaring type
    pub fn owner_name(&self) -> &'static str {
        self.owner_name
    }

    /// Member kind
    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    /// Effective security flags
    pub fn security(&self) -> SecurityFlags {
        self.security
    }

    /// True once the accessor has been materialized
    pub fn is_bound(&self) -> bool {
        self.accessor.get().is_some()
    }

    /// Declared kind of data members
    pub fn value_kind(&self) -> Option<&HostKind> {
        match &self.body {
            MemberBody::Data { kind, .. } | MemberBody::StaticData { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Signatures of callable members
    pub fn signatures(&self) -> Vec<String> {
        match &self.body {
            MemberBody::Methods(set) | MemberBody::StaticMethods(set) => set.signatures(),
            MemberBody::Generic(g) => vec![format!("{}<..>(type[], ..)", g.name())],
            _ => Vec::new(),
        }
    }

    /// Number of generic instantiations built so far
    pub fn generic_instances(&self) -> usize {
        match &self.body {
            MemberBody::Generic(g) => g.instance_count(),
            _ => 0,
        }
    }

    pub(crate) fn owner(&self) -> TypeId {
        self.owner
    }

    fn qualified(&self) -> String {
        format!("{}.{}", self.owner_name, self.name)
    }

    fn data_codec(&self, kind: &HostKind) -> Option<&'static Codec> {
        let accessor = self.accessor.get_or_init(|| {
            debug!("Bound data accessor {} ({})", self.qualified(), kind);
            Accessor::Data {
                codec: Primitive::of(kind).map(codec),
            }
        });
        match accessor {
            Accessor::Data { codec } => *codec,
            Accessor::Function { .. } => None,
        }
    }

    fn function(self: &Arc<Self>, engine: &Arc<EngineShared>) -> Result<NativeValue, ScriptError> {
        let accessor = self.accessor.get_or_try_init(|| {
            let native = engine.native().map_err(|e| ScriptError::reference(e.to_string()))?;
            let handler = MethodHandler::new(Arc::downgrade(self), Arc::downgrade(engine));
            let template = native.create_template(TemplateSpec::named(self.name.clone()).with_call_handler(Arc::new(handler)));
            let value = native
                .create_function(template, ObjectId::UNSET)
                .map_err(|e| ScriptError::binding(e.to_string()))?;
            let handle = Handle::from_value(engine.handles(), value.clone())
                .map_err(|e| ScriptError::reference(e.to_string()))?;
            debug!("Bound function accessor {}", self.qualified());
            Ok::<_, ScriptError>(Accessor::Function { value, _handle: handle })
        })?;
        match accessor {
            Accessor::Function { value, .. } => Ok(value.clone()),
            Accessor::Data { .. } => Err(ScriptError::binding(format!("{} is not callable", self.qualified()))),
        }
    }

    fn host_to_native(&self, engine: &EngineShared, codec: Option<&'static Codec>, value: HostValue) -> NativeValue {
        if let Some(codec) = codec {
            if let Some(native) = (codec.to_native)(value.clone()) {
                return native;
            }
        }
        convert::to_native(engine, value)
            .unwrap_or_else(|e| script_error(ScriptError::binding(format!("{}: {}", self.qualified(), e))))
    }

    /// Read an instance member of `object`
    pub(crate) fn read(self: &Arc<Self>, engine: &Arc<EngineShared>, object: &TrackedObject) -> NativeValue {
        if !self.security.can_read() {
            return script_error(ScriptError::security(format!("{} is not readable", self.qualified())));
        }
        match &self.body {
            MemberBody::Data { kind, get, .. } => {
                let codec = self.data_codec(kind);
                let read = {
                    let cell = object.read_cell();
                    let Some(this) = object.binder().project(&*cell, self.owner) else {
                        return script_error(ScriptError::type_error(format!(
                            "{} is not a {}",
                            object.type_name(),
                            self.owner_name
                        )));
                    };
                    catch_unwind(AssertUnwindSafe(|| get(this)))
                };
                match read {
                    Ok(Some(value)) => self.host_to_native(engine, codec, value),
                    Ok(None) => script_error(ScriptError::type_error(format!("cannot read {}", self.qualified()))),
                    Err(payload) => script_error(ScriptError::execution(format!(
                        "getter {} panicked: {}",
                        self.qualified(),
                        panic_message(payload.as_ref())
                    ))),
                }
            }
            MemberBody::Methods(_) | MemberBody::Generic(_) => self.function(engine).unwrap_or_else(script_error),
            MemberBody::StaticData { .. } | MemberBody::StaticMethods(_) => NativeValue::Undefined,
        }
    }

    /// Assign an instance member of `object`. Returns the assigned value or
    /// an error value.
    pub(crate) fn write(&self, engine: &EngineShared, object: &TrackedObject, value: &NativeValue) -> NativeValue {
        let MemberBody::Data { kind, set: Some(set), .. } = &self.body else {
            return script_error(ScriptError::security(format!("{} is read-only", self.qualified())));
        };
        if !self.security.can_write() {
            return script_error(ScriptError::security(format!("{} is read-only", self.qualified())));
        }

        let converted = match self.data_codec(kind) {
            Some(codec) => (codec.to_host)(value),
            None => convert::to_host(engine, kind, value),
        };
        let Some(host) = converted else {
            return script_error(ScriptError::type_error(format!(
                "cannot assign {} to {} ({})",
                value.tag(),
                self.qualified(),
                kind
            )));
        };

        let written = {
            let mut cell = object.write_cell();
            let Some(this) = object.binder().project_mut(&mut *cell, self.owner) else {
                return script_error(ScriptError::type_error(format!(
                    "{} is not a {}",
                    object.type_name(),
                    self.owner_name
                )));
            };
            catch_unwind(AssertUnwindSafe(|| set(this, host)))
        };
        match written {
            Ok(true) => value.clone(),
            Ok(false) => script_error(ScriptError::type_error(format!("cannot assign {}", self.qualified()))),
            Err(payload) => script_error(ScriptError::execution(format!(
                "setter {} panicked: {}",
                self.qualified(),
                panic_message(payload.as_ref())
            ))),
        }
    }

    /// Read a static member
    pub(crate) fn read_static(self: &Arc<Self>, engine: &Arc<EngineShared>) -> NativeValue {
        if !self.security.can_read() {
            return script_error(ScriptError::security(format!("{} is not readable", self.qualified())));
        }
        match &self.body {
            MemberBody::StaticData { kind, get } => {
                let codec = self.data_codec(kind);
                match catch_unwind(AssertUnwindSafe(|| get())) {
                    Ok(value) => self.host_to_native(engine, codec, value),
                    Err(payload) => script_error(ScriptError::execution(format!(
                        "getter {} panicked: {}",
                        self.qualified(),
                        panic_message(payload.as_ref())
                    ))),
                }
            }
            MemberBody::StaticMethods(_) => self.function(engine).unwrap_or_else(script_error),
            _ => NativeValue::Undefined,
        }
    }

    /// Call a method member. `receiver` is `None` for statics.
    pub(crate) fn invoke(&self, engine: &EngineShared, receiver: Option<&TrackedObject>, args: &[NativeValue]) -> NativeValue {
        if !self.security.can_read() {
            return script_error(ScriptError::security(format!("{} is not callable", self.qualified())));
        }
        let resolved = match &self.body {
            MemberBody::Methods(set) | MemberBody::StaticMethods(set) => set.resolve(engine, args),
            MemberBody::Generic(generic) => match args.split_first() {
                Some((types, rest)) => convert::type_tokens(engine, types)
                    .and_then(|kinds| generic.instance(kinds))
                    .and_then(|set| set.resolve(engine, rest)),
                None => Err(ScriptError::type_error(format!(
                    "{} expects an array of type arguments first",
                    self.qualified()
                ))),
            },
            _ => Err(ScriptError::type_error(format!("{} is not a function", self.qualified()))),
        };
        match resolved {
            Ok(resolved) => self.call_resolved(engine, receiver, resolved),
            Err(e) => script_error(e),
        }
    }

    fn call_resolved(&self, engine: &EngineShared, receiver: Option<&TrackedObject>, resolved: Resolved) -> NativeValue {
        let Resolved { overload, args } = resolved;
        let result = match receiver {
            Some(object) => {
                let mut cell = object.write_cell();
                match object.binder().project_mut(&mut *cell, self.owner) {
                    Some(this) => overload.call(&self.name, Some(this), args),
                    None => Err(ScriptError::type_error(format!(
                        "{} called on a {}",
                        self.qualified(),
                        object.type_name()
                    ))),
                }
            }
            None => overload.call(&self.name, None, args),
        };
        match result {
            Ok(value) => self.host_to_native(engine, None, value),
            Err(e) => script_error(e),
        }
    }
}

impl fmt::Debug for MemberDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberDescriptor")
            .field("name", &self.qualified())
            .field("kind", &self.kind)
            .field("security", &self.security)
            .field("bound", &self.is_bound())
            .finish()
    }
}
