//! Type binder
//!
//! Turns a [`TypeDescription`] into the native templates and member table
//! scripts see. One [`TypeBinder`] exists per (engine, host type); the
//! engine caches them by `TypeId`.
//!
//! # Building
//!
//! ```text
//!   describe::<T>()
//!       │
//!       ├─ base binder first (recursively)
//!       ├─ base members flattened by reference (Arc clones)
//!       ├─ own members grouped by script name → overload sets
//!       │     hidden members and non-recursive object members dropped
//!       ├─ upcasts flattened: T → Base, T → Base → BaseBase, …
//!       └─ templates: instance (interceptor), constructor (call + statics)
//! ```
//!
//! Accessors are not built here: each [`MemberDescriptor`] binds its own
//! on first script access.

mod builder;
mod convert;
mod interceptor;
mod member;
mod overload;
mod security;
mod value;

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use log::{debug, warn};
use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;
use tether_sdk::{NativeValue, ObjectId, ScriptError, TemplateId, TemplateSpec};

pub use builder::{
    GenericInstance, HostConstructor, HostFunction, HostMethod, HostType, MemberConfig, TypeBuilder,
    TypeDescription,
};
pub use member::{MemberDescriptor, MemberKind};
pub use security::SecurityFlags;
pub use value::{
    share, AnyView, EnumValue, FromHost, HostEnum, HostKind, HostObject, HostValue, IntoHost, IntoInvokeResult,
    InvokeError, ObjectView, Shared, SharedAny,
};

use builder::{ChainedUpcast, DefBody, IndexerDef, MemberDef, Upcast};
use interceptor::{ConstructorHandler, InstanceInterceptor, StaticInterceptor};
use member::{MemberBody, TeardownFn};
use overload::{panic_message, GenericMethod, Overload, OverloadSet, Resolved};

use crate::config::BinderOptions;
use crate::engine::EngineShared;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::Handle;
use crate::object::TrackedObject;

/// Declarations of one script name before grouping
enum Pending {
    Data {
        kind: HostKind,
        get: member::Getter,
        set: Option<member::Setter>,
        property: bool,
    },
    Methods(Vec<Overload>),
    Generic {
        type_params: usize,
        factory: member::GenericFactory,
    },
    StaticData {
        kind: HostKind,
        get: member::StaticGetter,
    },
    StaticMethods(Vec<Overload>),
}

impl From<DefBody> for Pending {
    fn from(body: DefBody) -> Self {
        match body {
            DefBody::Field {
                kind,
                get,
                set,
                property,
            } => Pending::Data {
                kind,
                get,
                set,
                property,
            },
            DefBody::Method(o) => Pending::Methods(vec![o]),
            DefBody::Generic { type_params, factory } => Pending::Generic { type_params, factory },
            DefBody::StaticProperty { kind, get } => Pending::StaticData { kind, get },
            DefBody::StaticMethod(o) => Pending::StaticMethods(vec![o]),
        }
    }
}

/// Binding metadata and native templates of one host type
pub struct TypeBinder {
    type_id: TypeId,
    name: &'static str,
    options: BinderOptions,
    is_abstract: bool,
    base: Option<Arc<TypeBinder>>,
    members: FxHashMap<String, Arc<MemberDescriptor>>,
    statics: FxHashMap<String, Arc<MemberDescriptor>>,
    constructors: Option<OverloadSet>,
    indexer: Option<(TypeId, Arc<IndexerDef>)>,
    upcasts: FxHashMap<TypeId, Arc<dyn Upcast>>,
    teardowns: Vec<(TypeId, TeardownFn)>,
    instance_template: TemplateId,
    constructor_template: TemplateId,
    constructor: OnceCell<Handle>,
    marker: ObjectId,
}

impl TypeBinder {
    /// Build the binder for `desc`. `base` must be the binder of
    /// `desc`'s base type, built with the same options.
    pub(crate) fn build(
        engine: &Arc<EngineShared>,
        desc: TypeDescription,
        base: Option<Arc<TypeBinder>>,
        options: BinderOptions,
        marker: ObjectId,
    ) -> BridgeResult<Arc<Self>> {
        let native = engine.native()?;
        let TypeDescription {
            type_id,
            name,
            is_abstract,
            default_security,
            base: base_link,
            members: defs,
            constructors,
            indexer,
            teardown,
        } = desc;
        let default_security = default_security.unwrap_or(options.default_security);

        let mut upcasts: FxHashMap<TypeId, Arc<dyn Upcast>> = FxHashMap::default();
        let mut members = FxHashMap::default();
        let mut teardowns = Vec::new();
        let mut inherited_indexer = None;
        if let Some(teardown) = teardown {
            teardowns.push((type_id, teardown));
        }
        match (&base, base_link) {
            (Some(base), Some(link)) => {
                if base.type_id != link.type_id {
                    return Err(BridgeError::Binding(format!(
                        "{}: base binder is {}, expected {}",
                        name, base.name, link.name
                    )));
                }
                members = base.members.clone();
                upcasts.insert(link.type_id, link.upcast.clone());
                for (ancestor, up) in &base.upcasts {
                    let chained: Arc<dyn Upcast> = Arc::new(ChainedUpcast {
                        first: link.upcast.clone(),
                        then: up.clone(),
                    });
                    upcasts.insert(*ancestor, chained);
                }
                teardowns.extend(base.teardowns.iter().cloned());
                inherited_indexer = base.indexer.clone();
            }
            (None, None) => {}
            (_, link) => {
                return Err(BridgeError::Binding(format!(
                    "{}: base {} was not built",
                    name,
                    link.map(|l| l.name).unwrap_or("<none>")
                )));
            }
        }

        let mut pending: Vec<(String, Option<SecurityFlags>, Pending)> = Vec::new();
        let mut positions: FxHashMap<String, usize> = FxHashMap::default();
        for MemberDef { name: script_name, security, body } in defs {
            let Some(&at) = positions.get(&script_name) else {
                positions.insert(script_name.clone(), pending.len());
                pending.push((script_name, security, body.into()));
                continue;
            };
            let replaced = match (&mut pending[at].2, body) {
                (Pending::Methods(list), DefBody::Method(o)) | (Pending::StaticMethods(list), DefBody::StaticMethod(o)) => {
                    list.push(o);
                    None
                }
                (_, body) => Some(body),
            };
            if let Some(body) = replaced {
                warn!("{}.{} declared twice; keeping the last declaration", name, script_name);
                pending[at] = (script_name, security, body.into());
            }
        }

        let mut statics = FxHashMap::default();
        for (script_name, security, body) in pending {
            let security = security.unwrap_or(default_security);
            if security.is_hidden() {
                debug!("{}.{} is hidden", name, script_name);
                continue;
            }
            let (kind, body) = match body {
                Pending::Data {
                    kind,
                    get,
                    set,
                    property,
                } => {
                    if kind.is_object() && !options.recursive {
                        debug!("{}.{} ({}) not exposed without recursive binding", name, script_name, kind);
                        continue;
                    }
                    let member_kind = if property { MemberKind::Property } else { MemberKind::Field };
                    (member_kind, MemberBody::Data { kind, get, set })
                }
                Pending::Methods(list) => (
                    MemberKind::Method,
                    MemberBody::Methods(Arc::new(OverloadSet::new(script_name.clone(), list))),
                ),
                Pending::Generic { type_params, factory } => (
                    MemberKind::GenericMethod,
                    MemberBody::Generic(Arc::new(GenericMethod::new(script_name.clone(), type_params, factory))),
                ),
                Pending::StaticData { kind, get } => (MemberKind::StaticProperty, MemberBody::StaticData { kind, get }),
                Pending::StaticMethods(list) => (
                    MemberKind::StaticMethod,
                    MemberBody::StaticMethods(Arc::new(OverloadSet::new(script_name.clone(), list))),
                ),
            };
            let descriptor = Arc::new(MemberDescriptor::new(script_name.clone(), type_id, name, security, kind, body));
            if kind.is_static() {
                statics.insert(script_name, descriptor);
            } else {
                members.insert(script_name, descriptor);
            }
        }

        let constructors = (!constructors.is_empty()).then(|| OverloadSet::new(name, constructors));
        let indexer = indexer.map(|def| (type_id, Arc::new(def))).or(inherited_indexer);

        let binder = Arc::new_cyclic(|this: &Weak<TypeBinder>| {
            let instance_template = native.create_template(
                TemplateSpec::named(name)
                    .with_interceptor(Arc::new(InstanceInterceptor::new(this.clone(), Arc::downgrade(engine)))),
            );
            let constructor_template = native.create_template(
                TemplateSpec::named(name)
                    .with_interceptor(Arc::new(StaticInterceptor::new(this.clone(), Arc::downgrade(engine))))
                    .with_call_handler(Arc::new(ConstructorHandler::new(this.clone(), Arc::downgrade(engine)))),
            );
            TypeBinder {
                type_id,
                name,
                options,
                is_abstract,
                base,
                members,
                statics,
                constructors,
                indexer,
                upcasts,
                teardowns,
                instance_template,
                constructor_template,
                constructor: OnceCell::new(),
                marker,
            }
        });
        debug!(
            "Built binder {} ({} members, {} statics, base {:?})",
            name,
            binder.members.len(),
            binder.statics.len(),
            binder.base_name()
        );
        Ok(binder)
    }

    /// Script-visible type name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Host type id
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Options the binder was built with
    pub fn options(&self) -> BinderOptions {
        self.options
    }

    /// True if scripts may not construct the type
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Binder of the base type
    pub fn base(&self) -> Option<&Arc<TypeBinder>> {
        self.base.as_ref()
    }

    /// Name of the base type
    pub fn base_name(&self) -> Option<&'static str> {
        self.base.as_ref().map(|b| b.name)
    }

    /// Instance member by script name (inherited members included)
    pub fn member(&self, name: &str) -> Option<&Arc<MemberDescriptor>> {
        self.members.get(name)
    }

    /// Static member by script name
    pub fn static_member(&self, name: &str) -> Option<&Arc<MemberDescriptor>> {
        self.statics.get(name)
    }

    /// Sorted instance member names
    pub fn member_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.members.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted static member names
    pub fn static_member_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.statics.keys().cloned().collect();
        names.sort();
        names
    }

    /// True if scripts can construct the type
    pub fn has_constructor(&self) -> bool {
        !self.is_abstract && self.constructors.is_some()
    }

    /// Signatures of the script constructors
    pub fn constructor_signatures(&self) -> Vec<String> {
        self.constructors.as_ref().map(OverloadSet::signatures).unwrap_or_default()
    }

    /// True if a value of this type can stand in for `other`
    pub fn is_assignable_to(&self, other: TypeId) -> bool {
        other == self.type_id || self.upcasts.contains_key(&other)
    }

    /// Number of members whose accessor has been materialized
    pub fn bound_accessor_count(&self) -> usize {
        self.members
            .values()
            .chain(self.statics.values())
            .filter(|m| m.is_bound())
            .count()
    }

    /// Marker id of the constructor function
    pub fn marker(&self) -> ObjectId {
        self.marker
    }

    pub(crate) fn instance_template(&self) -> TemplateId {
        self.instance_template
    }

    pub(crate) fn indexer(&self) -> Option<(TypeId, &IndexerDef)> {
        self.indexer.as_ref().map(|(owner, def)| (*owner, def.as_ref()))
    }

    /// View `value` (a `Self`-typed host value) as the declaring type `owner`
    pub(crate) fn project<'a>(&self, value: &'a dyn Any, owner: TypeId) -> Option<&'a dyn Any> {
        if owner == self.type_id {
            return Some(value);
        }
        self.upcasts.get(&owner)?.upcast(value)
    }

    pub(crate) fn project_mut<'a>(&self, value: &'a mut dyn Any, owner: TypeId) -> Option<&'a mut dyn Any> {
        if owner == self.type_id {
            return Some(value);
        }
        self.upcasts.get(&owner)?.upcast_mut(value)
    }

    /// Script constructor function, created on first use
    pub(crate) fn constructor_value(&self, engine: &EngineShared) -> BridgeResult<NativeValue> {
        let handle = self.constructor.get_or_try_init(|| {
            let native = engine.native()?;
            let value = native.create_function(self.constructor_template, self.marker)?;
            debug!("Created constructor function for {}", self.name);
            Handle::from_value(engine.handles(), value).map_err(BridgeError::from)
        })?;
        Ok(handle.value()?)
    }

    /// `new T(..)` from script
    pub(crate) fn construct(&self, engine: &EngineShared, args: &[NativeValue]) -> Result<NativeValue, ScriptError> {
        if self.is_abstract {
            return Err(ScriptError::binding(format!("cannot construct abstract type {}", self.name)));
        }
        let Some(constructors) = &self.constructors else {
            return Err(ScriptError::binding(format!("{} has no script constructor", self.name)));
        };
        let Resolved { overload, args } = constructors.resolve(engine, args)?;
        match overload.call(self.name, None, args)? {
            HostValue::Object(host) => engine
                .bind_host_object(host)
                .map(|(_, value)| value)
                .map_err(|e| ScriptError::binding(e.to_string())),
            other => Err(ScriptError::binding(format!(
                "constructor of {} returned {:?}",
                self.name, other
            ))),
        }
    }

    /// Run teardown hooks, most derived first
    pub(crate) fn teardown(&self, object: &TrackedObject) {
        if self.teardowns.is_empty() {
            return;
        }
        let mut cell = object.write_cell();
        for (owner, hook) in &self.teardowns {
            let Some(this) = self.project_mut(&mut *cell, *owner) else {
                continue;
            };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(this))) {
                warn!(
                    "Teardown of {} {} panicked: {}",
                    self.name,
                    object.id(),
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

impl fmt::Debug for TypeBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeBinder")
            .field("name", &self.name)
            .field("base", &self.base_name())
            .field("members", &self.member_names())
            .field("statics", &self.static_member_names())
            .field("options", &self.options)
            .finish()
    }
}
