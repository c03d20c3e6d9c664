//! Overload tables and invocation
//!
//! Every callable member is an [`OverloadSet`], even with a single
//! overload. Resolution tries, in order:
//!
//! ```text
//!   1. solo          exactly one overload: convert and go
//!   2. exact cache   argument tags seen before → overload index
//!   3. signature     natural kinds of the arguments (int32 → i32, …)
//!   4. scored        every overload of matching arity; exact args score 2,
//!                    convertible ones 1; the first highest total wins.
//!                    Only all-exact wins enter the exact cache.
//! ```
//!
//! Failure yields a `TypeError` listing every signature and, per candidate,
//! the first argument position that did not fit.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::trace;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tether_sdk::{NativeValue, ScriptError, ValueTag};

use super::builder::{HostConstructor, HostFunction, HostMethod, HostType};
use super::convert::{self, EXACT, NO_MATCH};
use super::member::GenericFactory;
use super::value::{share, HostKind, HostObject, HostValue, InvokeError};
use crate::engine::EngineShared;

pub(crate) type Invoker =
    Arc<dyn Fn(Option<&mut dyn Any>, Vec<HostValue>) -> Result<HostValue, InvokeError> + Send + Sync>;

/// One concrete callable
pub(crate) struct Overload {
    pub params: Vec<HostKind>,
    pub returns: HostKind,
    invoke: Invoker,
}

impl Overload {
    pub(crate) fn instance<T: HostType, Args: 'static, M: HostMethod<T, Args>>(method: M) -> Self {
        let invoke: Invoker = Arc::new(move |this: Option<&mut dyn Any>, args: Vec<HostValue>| {
            let this = this
                .and_then(|t| t.downcast_mut::<T>())
                .ok_or_else(|| InvokeError(format!("receiver is not a {}", T::NAME)))?;
            method.invoke(this, args)
        });
        Self {
            params: M::params(),
            returns: M::returns(),
            invoke,
        }
    }

    pub(crate) fn raw_instance<T: HostType>(
        params: Vec<HostKind>,
        returns: HostKind,
        f: impl Fn(&mut T, Vec<HostValue>) -> Result<HostValue, InvokeError> + Send + Sync + 'static,
    ) -> Self {
        let invoke: Invoker = Arc::new(move |this: Option<&mut dyn Any>, args: Vec<HostValue>| {
            let this = this
                .and_then(|t| t.downcast_mut::<T>())
                .ok_or_else(|| InvokeError(format!("receiver is not a {}", T::NAME)))?;
            f(this, args)
        });
        Self { params, returns, invoke }
    }

    pub(crate) fn function<Args: 'static, F: HostFunction<Args>>(f: F) -> Self {
        let invoke: Invoker = Arc::new(move |_: Option<&mut dyn Any>, args: Vec<HostValue>| f.invoke(args));
        Self {
            params: F::params(),
            returns: F::returns(),
            invoke,
        }
    }

    pub(crate) fn constructor<T: HostType, Args: 'static, C: HostConstructor<T, Args>>(ctor: C) -> Self {
        let invoke: Invoker = Arc::new(move |_: Option<&mut dyn Any>, args: Vec<HostValue>| {
            let value = ctor.construct(args)?;
            Ok(HostValue::Object(HostObject::new(share(value))))
        });
        Self {
            params: C::params(),
            returns: HostKind::object::<T>(),
            invoke,
        }
    }

    /// Call with already converted arguments. Panics become
    /// `ExecutionError`s.
    pub(crate) fn call(&self, name: &str, this: Option<&mut dyn Any>, args: Vec<HostValue>) -> Result<HostValue, ScriptError> {
        match catch_unwind(AssertUnwindSafe(|| (self.invoke)(this, args))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ScriptError::execution(format!("{} (in {})", e, self.signature(name)))),
            Err(payload) => Err(ScriptError::execution(format!(
                "{} panicked: {} (in {})",
                name,
                panic_message(payload.as_ref()),
                self.signature(name)
            ))),
        }
    }

    /// True if a win with `score` holds for every argument list with the
    /// same tags. Partial scores depend on value ranges, and enum scores on
    /// the variant.
    fn decided_by_tags(&self, score: u32) -> bool {
        score == u32::from(EXACT) * self.params.len() as u32
            && !self.params.iter().any(|k| matches!(k, HostKind::Enum { .. }))
    }

    pub(crate) fn signature(&self, name: &str) -> String {
        let params: Vec<&str> = self.params.iter().map(HostKind::name).collect();
        format!("{}({}) -> {}", name, params.join(", "), self.returns)
    }

    /// Convert every argument, or report the first position that fails
    fn convert_args(&self, engine: &EngineShared, args: &[NativeValue]) -> Result<Vec<HostValue>, String> {
        if args.len() != self.params.len() {
            return Err(format!("expects {} arguments, got {}", self.params.len(), args.len()));
        }
        self.params
            .iter()
            .zip(args)
            .enumerate()
            .map(|(i, (kind, arg))| {
                convert::to_host(engine, kind, arg)
                    .ok_or_else(|| format!("argument {}: expected {}, got {}", i + 1, kind, arg.tag()))
            })
            .collect()
    }

    fn score(&self, engine: &EngineShared, args: &[NativeValue]) -> Option<u32> {
        if args.len() != self.params.len() {
            return None;
        }
        let mut total = 0u32;
        for (kind, arg) in self.params.iter().zip(args) {
            match convert::score(engine, kind, arg) {
                NO_MATCH => return None,
                s => total += s as u32,
            }
        }
        Some(total)
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A resolved call: the overload and its converted arguments
pub(crate) struct Resolved {
    pub overload: Arc<Overload>,
    pub args: Vec<HostValue>,
}

/// All overloads sharing one script name
pub(crate) struct OverloadSet {
    name: String,
    overloads: Vec<Arc<Overload>>,
    by_signature: FxHashMap<Vec<HostKind>, usize>,
    exact_cache: RwLock<FxHashMap<Vec<ValueTag>, usize>>,
}

impl OverloadSet {
    pub(crate) fn new(name: impl Into<String>, overloads: Vec<Overload>) -> Self {
        let mut by_signature = FxHashMap::default();
        for (i, overload) in overloads.iter().enumerate() {
            by_signature.entry(overload.params.clone()).or_insert(i);
        }
        Self {
            name: name.into(),
            overloads: overloads.into_iter().map(Arc::new).collect(),
            by_signature,
            exact_cache: RwLock::new(FxHashMap::default()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn len(&self) -> usize {
        self.overloads.len()
    }

    pub(crate) fn signatures(&self) -> Vec<String> {
        self.overloads.iter().map(|o| o.signature(&self.name)).collect()
    }

    fn found(&self, index: usize, args: Vec<HostValue>) -> Resolved {
        Resolved {
            overload: self.overloads[index].clone(),
            args,
        }
    }

    /// Pick the overload for `args`
    pub(crate) fn resolve(&self, engine: &EngineShared, args: &[NativeValue]) -> Result<Resolved, ScriptError> {
        if let [solo] = self.overloads.as_slice() {
            return match solo.convert_args(engine, args) {
                Ok(converted) => Ok(self.found(0, converted)),
                Err(why) => Err(ScriptError::type_error(format!("{}: {}", solo.signature(&self.name), why))),
            };
        }

        let tags: Vec<ValueTag> = args.iter().map(NativeValue::tag).collect();
        let cacheable = !tags.iter().any(|t| t.is_heap());
        if cacheable {
            let cached = self.exact_cache.read().get(&tags).copied();
            if let Some(index) = cached {
                if let Ok(converted) = self.overloads[index].convert_args(engine, args) {
                    return Ok(self.found(index, converted));
                }
            }
        }

        let natural: Option<Vec<HostKind>> = args.iter().map(convert::natural_kind).collect();
        if let Some(index) = natural.and_then(|kinds| self.by_signature.get(&kinds).copied()) {
            if let Ok(converted) = self.overloads[index].convert_args(engine, args) {
                if cacheable {
                    self.exact_cache.write().insert(tags, index);
                }
                return Ok(self.found(index, converted));
            }
        }

        let mut best: Option<(usize, u32)> = None;
        for (index, overload) in self.overloads.iter().enumerate() {
            if let Some(score) = overload.score(engine, args) {
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((index, score));
                }
            }
        }
        if let Some((index, score)) = best {
            if let Ok(converted) = self.overloads[index].convert_args(engine, args) {
                trace!("{}: resolved {:?} to overload {}", self.name, tags, index);
                if cacheable && self.overloads[index].decided_by_tags(score) {
                    self.exact_cache.write().insert(tags, index);
                }
                return Ok(self.found(index, converted));
            }
        }

        Err(self.mismatch(engine, args, &tags))
    }

    fn mismatch(&self, engine: &EngineShared, args: &[NativeValue], tags: &[ValueTag]) -> ScriptError {
        let given: Vec<&str> = tags.iter().map(|t| t.name()).collect();
        let candidates: Vec<String> = self
            .overloads
            .iter()
            .map(|o| match o.convert_args(engine, args) {
                Err(why) => format!("{} [{}]", o.signature(&self.name), why),
                Ok(_) => o.signature(&self.name),
            })
            .collect();
        ScriptError::type_error(format!(
            "no overload of {} matches ({}); available: {}",
            self.name,
            given.join(", "),
            candidates.join("; ")
        ))
    }
}

/// A generic method and its instantiations, keyed by type arguments
pub(crate) struct GenericMethod {
    name: String,
    type_params: usize,
    factory: GenericFactory,
    instances: RwLock<FxHashMap<Vec<HostKind>, Arc<OverloadSet>>>,
}

impl GenericMethod {
    pub(crate) fn new(name: impl Into<String>, type_params: usize, factory: GenericFactory) -> Self {
        Self {
            name: name.into(),
            type_params,
            factory,
            instances: RwLock::new(FxHashMap::default()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Instantiation for `kinds`, built on first use
    pub(crate) fn instance(&self, kinds: Vec<HostKind>) -> Result<Arc<OverloadSet>, ScriptError> {
        if kinds.len() != self.type_params {
            return Err(ScriptError::type_error(format!(
                "{} takes {} type arguments, got {}",
                self.name,
                self.type_params,
                kinds.len()
            )));
        }
        if let Some(set) = self.instances.read().get(&kinds) {
            return Ok(set.clone());
        }

        let overload = (self.factory)(&kinds).map_err(|e| {
            let names: Vec<&str> = kinds.iter().map(HostKind::name).collect();
            ScriptError::binding(format!("{}<{}>: {}", self.name, names.join(", "), e))
        })?;
        trace!("{}: instantiated for {:?}", self.name, kinds);
        let set = Arc::new(OverloadSet::new(self.name.clone(), vec![overload]));
        Ok(self.instances.write().entry(kinds).or_insert(set).clone())
    }

    pub(crate) fn instance_count(&self) -> usize {
        self.instances.read().len()
    }
}
