//! Describing host types
//!
//! A host type lists its script-visible surface once, in
//! [`HostType::describe`]:
//!
//! ```ignore
//! impl HostType for Point {
//!     const NAME: &'static str = "Point";
//!
//!     fn describe(ty: &mut TypeBuilder<Self>) {
//!         ty.constructor(|x: i32, y: i32| Point { x, y });
//!         ty.field("x", |p| p.x, |p, v| p.x = v);
//!         ty.method("norm", |p: &mut Point| p.norm());
//!     }
//! }
//! ```
//!
//! The builder only records what was declared. Binding (accessor closures,
//! native function objects, overload tables) happens later and lazily in
//! [`TypeBinder`](super::TypeBinder).

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

use super::member::{
    GenericFactory, Getter, IndexGetter, IndexSetter, Setter, StaticGetter, TeardownFn,
};
use super::overload::Overload;
use super::security::SecurityFlags;
use super::value::{FromHost, HostKind, HostValue, IntoHost, IntoInvokeResult, InvokeError};

/// A Rust type that can be exposed to scripts
pub trait HostType: Any + Send + Sync + Sized {
    /// Script-visible type name
    const NAME: &'static str;

    /// Declare the script-visible surface
    fn describe(ty: &mut TypeBuilder<Self>);
}

// ============================================================================
// Upcasts
// ============================================================================

/// Projection from a derived host value to one of its bases
pub(crate) trait Upcast: Send + Sync {
    fn upcast<'a>(&self, value: &'a dyn Any) -> Option<&'a dyn Any>;
    fn upcast_mut<'a>(&self, value: &'a mut dyn Any) -> Option<&'a mut dyn Any>;
}

struct FieldUpcast<T, B> {
    get: fn(&T) -> &B,
    get_mut: fn(&mut T) -> &mut B,
}

impl<T: Any, B: Any> Upcast for FieldUpcast<T, B> {
    fn upcast<'a>(&self, value: &'a dyn Any) -> Option<&'a dyn Any> {
        let this = value.downcast_ref::<T>()?;
        Some((self.get)(this) as &dyn Any)
    }

    fn upcast_mut<'a>(&self, value: &'a mut dyn Any) -> Option<&'a mut dyn Any> {
        let this = value.downcast_mut::<T>()?;
        Some((self.get_mut)(this) as &mut dyn Any)
    }
}

/// Two projections applied in sequence (derived → base → base's base)
pub(crate) struct ChainedUpcast {
    pub first: Arc<dyn Upcast>,
    pub then: Arc<dyn Upcast>,
}

impl Upcast for ChainedUpcast {
    fn upcast<'a>(&self, value: &'a dyn Any) -> Option<&'a dyn Any> {
        self.then.upcast(self.first.upcast(value)?)
    }

    fn upcast_mut<'a>(&self, value: &'a mut dyn Any) -> Option<&'a mut dyn Any> {
        self.then.upcast_mut(self.first.upcast_mut(value)?)
    }
}

// ============================================================================
// Declarations
// ============================================================================

pub(crate) struct BaseLink {
    pub type_id: TypeId,
    pub name: &'static str,
    pub describe: fn() -> TypeDescription,
    pub upcast: Arc<dyn Upcast>,
}

pub(crate) enum DefBody {
    Field {
        kind: HostKind,
        get: Getter,
        set: Option<Setter>,
        property: bool,
    },
    Method(Overload),
    Generic {
        type_params: usize,
        factory: GenericFactory,
    },
    StaticProperty {
        kind: HostKind,
        get: StaticGetter,
    },
    StaticMethod(Overload),
}

pub(crate) struct MemberDef {
    pub name: String,
    pub security: Option<SecurityFlags>,
    pub body: DefBody,
}

pub(crate) struct IndexerDef {
    pub kind: HostKind,
    pub get: IndexGetter,
    pub set: Option<IndexSetter>,
}

/// Everything a host type declared about itself
pub struct TypeDescription {
    pub(crate) type_id: TypeId,
    pub(crate) name: &'static str,
    pub(crate) is_abstract: bool,
    pub(crate) default_security: Option<SecurityFlags>,
    pub(crate) base: Option<BaseLink>,
    pub(crate) members: Vec<MemberDef>,
    pub(crate) constructors: Vec<Overload>,
    pub(crate) indexer: Option<IndexerDef>,
    pub(crate) teardown: Option<TeardownFn>,
}

impl TypeDescription {
    /// Run `T::describe`
    pub fn of<T: HostType>() -> Self {
        let mut builder = TypeBuilder::<T>::new();
        T::describe(&mut builder);
        builder.desc
    }

    /// Script-visible type name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Host type id
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Script names of the declared (not inherited) members
    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name.as_str()).collect()
    }
}

// ============================================================================
// Typed callables
// ============================================================================

/// Instance methods: `Fn(&mut T, A, B, ..) -> R`
pub trait HostMethod<T, Args>: Send + Sync + 'static {
    /// Parameter kinds
    fn params() -> Vec<HostKind>;
    /// Return kind
    fn returns() -> HostKind;
    /// Call with converted arguments
    fn invoke(&self, this: &mut T, args: Vec<HostValue>) -> Result<HostValue, InvokeError>;
}

/// Static functions: `Fn(A, B, ..) -> R`
pub trait HostFunction<Args>: Send + Sync + 'static {
    /// Parameter kinds
    fn params() -> Vec<HostKind>;
    /// Return kind
    fn returns() -> HostKind;
    /// Call with converted arguments
    fn invoke(&self, args: Vec<HostValue>) -> Result<HostValue, InvokeError>;
}

/// Constructors: `Fn(A, B, ..) -> T`
pub trait HostConstructor<T, Args>: Send + Sync + 'static {
    /// Parameter kinds
    fn params() -> Vec<HostKind>;
    /// Build a new instance
    fn construct(&self, args: Vec<HostValue>) -> Result<T, InvokeError>;
}

fn next_arg<A: FromHost>(args: &mut std::vec::IntoIter<HostValue>, index: usize) -> Result<A, InvokeError> {
    args.next()
        .and_then(A::from_host)
        .ok_or_else(|| InvokeError(format!("argument {} is not a {}", index + 1, A::host_kind())))
}

macro_rules! impl_callables {
    ($($arg:ident),*) => {
        impl<T, F, R, $($arg,)*> HostMethod<T, ($($arg,)*)> for F
        where
            F: Fn(&mut T, $($arg),*) -> R + Send + Sync + 'static,
            R: IntoInvokeResult,
            $($arg: FromHost,)*
        {
            fn params() -> Vec<HostKind> {
                vec![$(<$arg as FromHost>::host_kind()),*]
            }

            fn returns() -> HostKind {
                R::host_kind()
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn invoke(&self, this: &mut T, args: Vec<HostValue>) -> Result<HostValue, InvokeError> {
                let mut args = args.into_iter();
                let mut index = 0usize;
                $(
                    let $arg = next_arg::<$arg>(&mut args, index)?;
                    index += 1;
                )*
                (self)(this, $($arg),*).into_result()
            }
        }

        impl<F, R, $($arg,)*> HostFunction<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: IntoInvokeResult,
            $($arg: FromHost,)*
        {
            fn params() -> Vec<HostKind> {
                vec![$(<$arg as FromHost>::host_kind()),*]
            }

            fn returns() -> HostKind {
                R::host_kind()
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn invoke(&self, args: Vec<HostValue>) -> Result<HostValue, InvokeError> {
                let mut args = args.into_iter();
                let mut index = 0usize;
                $(
                    let $arg = next_arg::<$arg>(&mut args, index)?;
                    index += 1;
                )*
                (self)($($arg),*).into_result()
            }
        }

        impl<T, F, $($arg,)*> HostConstructor<T, ($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> T + Send + Sync + 'static,
            $($arg: FromHost,)*
        {
            fn params() -> Vec<HostKind> {
                vec![$(<$arg as FromHost>::host_kind()),*]
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn construct(&self, args: Vec<HostValue>) -> Result<T, InvokeError> {
                let mut args = args.into_iter();
                let mut index = 0usize;
                $(
                    let $arg = next_arg::<$arg>(&mut args, index)?;
                    index += 1;
                )*
                Ok((self)($($arg),*))
            }
        }
    };
}

impl_callables!();
impl_callables!(A);
impl_callables!(A, B);
impl_callables!(A, B, C);
impl_callables!(A, B, C, D);

// ============================================================================
// Builder
// ============================================================================

/// Records the script-visible surface of `T`
pub struct TypeBuilder<T: HostType> {
    desc: TypeDescription,
    _marker: PhantomData<fn() -> T>,
}

/// Adjusts the member that was just declared
pub struct MemberConfig<'a> {
    member: &'a mut MemberDef,
}

impl MemberConfig<'_> {
    /// Expose under a different script name
    pub fn named(self, script_name: &str) -> Self {
        self.member.name = script_name.to_string();
        self
    }

    /// Explicit security flags
    pub fn security(self, flags: SecurityFlags) -> Self {
        self.member.security = Some(flags);
        self
    }

    /// Readable but not assignable
    pub fn read_only(self) -> Self {
        self.security(SecurityFlags::READ)
    }

    /// Invisible to scripts
    pub fn hidden(self) -> Self {
        let flags = self.member.security.unwrap_or(SecurityFlags::NONE);
        self.security(flags.union(SecurityFlags::HIDDEN))
    }
}

/// A generic method instantiated for concrete type arguments
pub struct GenericInstance<T> {
    pub(crate) overload: Overload,
    _marker: PhantomData<fn(&mut T)>,
}

impl<T: HostType> GenericInstance<T> {
    /// Instantiate as a typed method
    pub fn method<Args: 'static, M: HostMethod<T, Args>>(method: M) -> Self {
        Self {
            overload: Overload::instance::<T, Args, M>(method),
            _marker: PhantomData,
        }
    }

    /// Instantiate with explicit parameter kinds
    pub fn raw(
        params: Vec<HostKind>,
        returns: HostKind,
        f: impl Fn(&mut T, Vec<HostValue>) -> Result<HostValue, InvokeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            overload: Overload::raw_instance::<T>(params, returns, f),
            _marker: PhantomData,
        }
    }
}

impl<T: HostType> TypeBuilder<T> {
    fn new() -> Self {
        Self {
            desc: TypeDescription {
                type_id: TypeId::of::<T>(),
                name: T::NAME,
                is_abstract: false,
                default_security: None,
                base: None,
                members: Vec::new(),
                constructors: Vec::new(),
                indexer: None,
                teardown: None,
            },
            _marker: PhantomData,
        }
    }

    fn push(&mut self, name: &str, body: DefBody) -> MemberConfig<'_> {
        let index = self.desc.members.len();
        self.desc.members.push(MemberDef {
            name: name.to_string(),
            security: None,
            body,
        });
        MemberConfig {
            member: &mut self.desc.members[index],
        }
    }

    /// Inherit the members of `B`; `T` embeds a `B` reachable through the
    /// two projections
    pub fn base<B: HostType>(&mut self, upcast: fn(&T) -> &B, upcast_mut: fn(&mut T) -> &mut B) -> &mut Self {
        self.desc.base = Some(BaseLink {
            type_id: TypeId::of::<B>(),
            name: B::NAME,
            describe: TypeDescription::of::<B>,
            upcast: Arc::new(FieldUpcast {
                get: upcast,
                get_mut: upcast_mut,
            }),
        });
        self
    }

    /// Scripts may not construct this type
    pub fn abstract_type(&mut self) -> &mut Self {
        self.desc.is_abstract = true;
        self
    }

    /// Security for members that declare none
    pub fn default_security(&mut self, flags: SecurityFlags) -> &mut Self {
        self.desc.default_security = Some(flags);
        self
    }

    /// Readable and assignable data member
    pub fn field<V>(
        &mut self,
        name: &str,
        get: impl Fn(&T) -> V + Send + Sync + 'static,
        set: impl Fn(&mut T, V) + Send + Sync + 'static,
    ) -> MemberConfig<'_>
    where
        V: FromHost + IntoHost,
    {
        let getter: Getter = Arc::new(move |this: &dyn Any| this.downcast_ref::<T>().map(|t| get(t).into_host()));
        let setter: Setter = Arc::new(move |this: &mut dyn Any, value: HostValue| {
            match (this.downcast_mut::<T>(), V::from_host(value)) {
                (Some(t), Some(v)) => {
                    set(t, v);
                    true
                }
                _ => false,
            }
        });
        self.push(
            name,
            DefBody::Field {
                kind: <V as FromHost>::host_kind(),
                get: getter,
                set: Some(setter),
                property: false,
            },
        )
    }

    /// Read-only computed property
    pub fn property<V: IntoHost>(&mut self, name: &str, get: impl Fn(&T) -> V + Send + Sync + 'static) -> MemberConfig<'_> {
        let getter: Getter = Arc::new(move |this: &dyn Any| this.downcast_ref::<T>().map(|t| get(t).into_host()));
        self.push(
            name,
            DefBody::Field {
                kind: V::host_kind(),
                get: getter,
                set: None,
                property: true,
            },
        )
    }

    /// Instance method. Declaring the same script name twice adds an
    /// overload.
    pub fn method<Args: 'static, M: HostMethod<T, Args>>(&mut self, name: &str, method: M) -> MemberConfig<'_> {
        self.push(name, DefBody::Method(Overload::instance::<T, Args, M>(method)))
    }

    /// Instance method with explicit parameter kinds
    pub fn raw_method(
        &mut self,
        name: &str,
        params: Vec<HostKind>,
        returns: HostKind,
        f: impl Fn(&mut T, Vec<HostValue>) -> Result<HostValue, InvokeError> + Send + Sync + 'static,
    ) -> MemberConfig<'_> {
        self.push(name, DefBody::Method(Overload::raw_instance::<T>(params, returns, f)))
    }

    /// Generic method. Scripts pass an array of type tokens as the first
    /// argument; `factory` instantiates the method for those types.
    pub fn generic_method(
        &mut self,
        name: &str,
        type_params: usize,
        factory: impl Fn(&[HostKind]) -> Result<GenericInstance<T>, String> + Send + Sync + 'static,
    ) -> MemberConfig<'_> {
        let factory: GenericFactory = Arc::new(move |kinds: &[HostKind]| factory(kinds).map(|g| g.overload));
        self.push(name, DefBody::Generic { type_params, factory })
    }

    /// Static function exposed on the constructor
    pub fn static_method<Args: 'static, F: HostFunction<Args>>(&mut self, name: &str, f: F) -> MemberConfig<'_> {
        self.push(name, DefBody::StaticMethod(Overload::function::<Args, F>(f)))
    }

    /// Static read-only value exposed on the constructor
    pub fn static_property<V: IntoHost>(&mut self, name: &str, get: impl Fn() -> V + Send + Sync + 'static) -> MemberConfig<'_> {
        let getter: StaticGetter = Arc::new(move || get().into_host());
        self.push(
            name,
            DefBody::StaticProperty {
                kind: V::host_kind(),
                get: getter,
            },
        )
    }

    /// Script constructor. Declaring several adds overloads.
    pub fn constructor<Args: 'static, C: HostConstructor<T, Args>>(&mut self, ctor: C) -> &mut Self {
        self.desc.constructors.push(Overload::constructor::<T, Args, C>(ctor));
        self
    }

    /// Indexed access (`obj[i]`). `set` returns false for out-of-range
    /// indices.
    pub fn indexer<V>(
        &mut self,
        get: impl Fn(&T, u32) -> Option<V> + Send + Sync + 'static,
        set: impl Fn(&mut T, u32, V) -> bool + Send + Sync + 'static,
    ) -> &mut Self
    where
        V: FromHost + IntoHost,
    {
        let getter: IndexGetter = Arc::new(move |this: &dyn Any, index: u32| {
            this.downcast_ref::<T>()
                .and_then(|t| get(t, index))
                .map(IntoHost::into_host)
        });
        let setter: IndexSetter = Arc::new(move |this: &mut dyn Any, index: u32, value: HostValue| {
            match (this.downcast_mut::<T>(), V::from_host(value)) {
                (Some(t), Some(v)) => set(t, index, v),
                _ => false,
            }
        });
        self.desc.indexer = Some(IndexerDef {
            kind: <V as FromHost>::host_kind(),
            get: getter,
            set: Some(setter),
        });
        self
    }

    /// Hook run on the coordinator thread once the script object died
    pub fn on_teardown(&mut self, hook: impl Fn(&mut T) + Send + Sync + 'static) -> &mut Self {
        let hook: TeardownFn = Arc::new(move |this: &mut dyn Any| {
            if let Some(t) = this.downcast_mut::<T>() {
                hook(t);
            }
        });
        self.desc.teardown = Some(hook);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        count: i32,
    }

    impl HostType for Counter {
        const NAME: &'static str = "Counter";

        fn describe(ty: &mut TypeBuilder<Self>) {
            ty.constructor(|| Counter { count: 0 });
            ty.field("count", |c| c.count, |c, v| c.count = v);
            ty.method("add", |c: &mut Counter, n: i32| {
                c.count += n;
                c.count
            });
            ty.property("double", |c| c.count * 2).named("twice");
        }
    }

    #[test]
    fn test_description_records_members() {
        let desc = TypeDescription::of::<Counter>();
        assert_eq!(desc.name(), "Counter");
        assert_eq!(desc.member_names(), vec!["count", "add", "twice"]);
        assert_eq!(desc.constructors.len(), 1);
        assert!(!desc.is_abstract);
    }

    #[test]
    fn test_typed_method_signature() {
        type AddFn = fn(&mut Counter, i32) -> i32;
        assert_eq!(<AddFn as HostMethod<Counter, (i32,)>>::params(), vec![HostKind::I32]);
        assert_eq!(<AddFn as HostMethod<Counter, (i32,)>>::returns(), HostKind::I32);
    }

    #[test]
    fn test_typed_method_invoke() {
        let add = |c: &mut Counter, n: i32| {
            c.count += n;
            c.count
        };
        let mut counter = Counter { count: 1 };
        let result = HostMethod::<Counter, (i32,)>::invoke(&add, &mut counter, vec![HostValue::I32(4)]);
        assert!(matches!(result, Ok(HostValue::I32(5))));

        let err = HostMethod::<Counter, (i32,)>::invoke(&add, &mut counter, vec![HostValue::Bool(true)]);
        assert_eq!(err.unwrap_err(), InvokeError::new("argument 1 is not a i32"));
    }

    #[test]
    fn test_field_accessors_downcast() {
        let desc = TypeDescription::of::<Counter>();
        let DefBody::Field { get, set, .. } = &desc.members[0].body else {
            panic!("count is a field");
        };
        let mut counter = Counter { count: 3 };
        assert!(matches!(get(&counter as &dyn Any), Some(HostValue::I32(3))));
        assert!(set.as_ref().unwrap()(&mut counter as &mut dyn Any, HostValue::I32(9)));
        assert_eq!(counter.count, 9);
        assert!(get(&5u8 as &dyn Any).is_none());
    }

    struct Base {
        id: i32,
    }

    struct Derived {
        base: Base,
    }

    #[test]
    fn test_upcast_chain() {
        let up: Arc<dyn Upcast> = Arc::new(FieldUpcast::<Derived, Base> {
            get: |d| &d.base,
            get_mut: |d| &mut d.base,
        });
        let derived = Derived { base: Base { id: 7 } };
        let base = up.upcast(&derived).and_then(|b| b.downcast_ref::<Base>());
        assert_eq!(base.map(|b| b.id), Some(7));
        assert!(up.upcast(&derived.base).is_none());
    }
}
