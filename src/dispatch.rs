//! Per-type method and property dispatch tables.
//!
//! The invoker layer never touches a concrete service type directly; it
//! calls through a [`ServiceDispatcher`], the reflection-free stand-in for a
//! generated accessor class. A dispatcher is assembled once per service type
//! from typed registration calls on [`DispatcherBuilder`] — each call
//! monomorphizes a shim that downcasts the `dyn Any` target and argument
//! values — and cached process-wide in a [`DispatcherCache`].
//!
//! Method resolution is by name plus exact parameter-type match; properties
//! follow the bean convention (named get/set accessors).

use std::any::Any;
use std::any::TypeId;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use snafu::Snafu;

/// A boxed argument or return value crossing the dispatch boundary.
pub type Value = Box<dyn Any + Send + Sync>;

/// The type-erased service object a dispatcher operates on.
pub type Target = dyn Any + Send + Sync;

/// Dispatch failures.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DispatchError {
    /// No method with that name and exact parameter-type signature.
    #[snafu(display("no method {method:?} with matching signature on {type_name}"))]
    NoSuchMethod { type_name: String, method: String },

    /// No property with that name (or it lacks the requested accessor).
    #[snafu(display("no property {property:?} on {type_name}"))]
    NoSuchProperty { type_name: String, property: String },

    /// The target object is not of the type this dispatcher was built for.
    #[snafu(display("target passed to the {type_name} dispatcher has the wrong type"))]
    WrongTarget { type_name: String },

    /// An argument value did not match its declared parameter type.
    #[snafu(display("argument of wrong type passed to {type_name}::{method}"))]
    ArgumentMismatch { type_name: String, method: String },
}

type MethodFn = Box<dyn Fn(&Target, &[Value]) -> Result<Option<Value>, DispatchError> + Send + Sync>;
type GetFn = Box<dyn Fn(&Target) -> Result<Value, DispatchError> + Send + Sync>;
type SetFn = Box<dyn Fn(&Target, Value) -> Result<(), DispatchError> + Send + Sync>;

#[derive(Default)]
struct PropertyAccess {
    get: Option<GetFn>,
    set: Option<SetFn>,
}

/// Uniform reflective surface over one service type.
pub struct ServiceDispatcher {
    type_name: String,
    methods: HashMap<(String, Vec<TypeId>), MethodFn>,
    declared: BTreeSet<String>,
    inherited: BTreeSet<String>,
    properties: HashMap<String, PropertyAccess>,
}

impl ServiceDispatcher {
    /// The service type name this dispatcher was built for.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Names of methods declared directly on the service type.
    pub fn declared_method_names(&self) -> Vec<String> {
        self.declared.iter().cloned().collect()
    }

    /// All callable method names, inherited ones included.
    pub fn method_names(&self) -> Vec<String> {
        self.declared.union(&self.inherited).cloned().collect()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.declared.contains(name) || self.inherited.contains(name)
    }

    /// Invoke `name` on `target` with an exact parameter-type match.
    pub fn invoke_method(
        &self,
        target: &Target,
        name: &str,
        param_types: &[TypeId],
        args: &[Value],
    ) -> Result<Option<Value>, DispatchError> {
        let key = (name.to_string(), param_types.to_vec());
        let method = self.methods.get(&key).ok_or_else(|| {
            NoSuchMethodSnafu { type_name: self.type_name.clone(), method: name.to_string() }
                .build()
        })?;
        method(target, args)
    }

    /// Read the property `name` from `target`.
    pub fn get_property(&self, target: &Target, name: &str) -> Result<Value, DispatchError> {
        let getter = self
            .properties
            .get(name)
            .and_then(|p| p.get.as_ref())
            .ok_or_else(|| {
                NoSuchPropertySnafu {
                    type_name: self.type_name.clone(),
                    property: name.to_string(),
                }
                .build()
            })?;
        getter(target)
    }

    /// Write the property `name` on `target`.
    pub fn set_property(
        &self,
        target: &Target,
        name: &str,
        value: Value,
    ) -> Result<(), DispatchError> {
        let setter = self
            .properties
            .get(name)
            .and_then(|p| p.set.as_ref())
            .ok_or_else(|| {
                NoSuchPropertySnafu {
                    type_name: self.type_name.clone(),
                    property: name.to_string(),
                }
                .build()
            })?;
        setter(target, value)
    }
}

/// Wrap a method return value; unit returns become `None`.
fn box_return<R: Any + Send + Sync>(value: R) -> Option<Value> {
    if TypeId::of::<R>() == TypeId::of::<()>() {
        None
    } else {
        Some(Box::new(value))
    }
}

/// Typed assembly of a [`ServiceDispatcher`] for service type `S`.
pub struct DispatcherBuilder<S> {
    dispatcher: ServiceDispatcher,
    _marker: std::marker::PhantomData<fn(S)>,
}

impl<S: Any + Send + Sync> DispatcherBuilder<S> {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            dispatcher: ServiceDispatcher {
                type_name: type_name.into(),
                methods: HashMap::new(),
                declared: BTreeSet::new(),
                inherited: BTreeSet::new(),
                properties: HashMap::new(),
            },
            _marker: std::marker::PhantomData,
        }
    }

    fn register(mut self, name: &str, param_types: Vec<TypeId>, f: MethodFn) -> Self {
        self.dispatcher.methods.insert((name.to_string(), param_types), f);
        self.dispatcher.declared.insert(name.to_string());
        self
    }

    /// Register a niladic method.
    pub fn method0<R, F>(self, name: &str, f: F) -> Self
    where
        R: Any + Send + Sync,
        F: Fn(&S) -> R + Send + Sync + 'static,
    {
        let type_name = self.dispatcher.type_name.clone();
        let shim: MethodFn = Box::new(move |target, _args| {
            let target = target.downcast_ref::<S>().ok_or_else(|| {
                WrongTargetSnafu { type_name: type_name.clone() }.build()
            })?;
            Ok(box_return(f(target)))
        });
        self.register(name, Vec::new(), shim)
    }

    /// Register a one-argument method.
    pub fn method1<A1, R, F>(self, name: &str, f: F) -> Self
    where
        A1: Any + Send + Sync + Clone,
        R: Any + Send + Sync,
        F: Fn(&S, A1) -> R + Send + Sync + 'static,
    {
        let type_name = self.dispatcher.type_name.clone();
        let method = name.to_string();
        let shim: MethodFn = Box::new(move |target, args| {
            let target = target.downcast_ref::<S>().ok_or_else(|| {
                WrongTargetSnafu { type_name: type_name.clone() }.build()
            })?;
            let a1 = downcast_arg::<A1>(args, 0, &type_name, &method)?;
            Ok(box_return(f(target, a1)))
        });
        self.register(name, vec![TypeId::of::<A1>()], shim)
    }

    /// Register a two-argument method.
    pub fn method2<A1, A2, R, F>(self, name: &str, f: F) -> Self
    where
        A1: Any + Send + Sync + Clone,
        A2: Any + Send + Sync + Clone,
        R: Any + Send + Sync,
        F: Fn(&S, A1, A2) -> R + Send + Sync + 'static,
    {
        let type_name = self.dispatcher.type_name.clone();
        let method = name.to_string();
        let shim: MethodFn = Box::new(move |target, args| {
            let target = target.downcast_ref::<S>().ok_or_else(|| {
                WrongTargetSnafu { type_name: type_name.clone() }.build()
            })?;
            let a1 = downcast_arg::<A1>(args, 0, &type_name, &method)?;
            let a2 = downcast_arg::<A2>(args, 1, &type_name, &method)?;
            Ok(box_return(f(target, a1, a2)))
        });
        self.register(name, vec![TypeId::of::<A1>(), TypeId::of::<A2>()], shim)
    }

    /// Register a three-argument method.
    pub fn method3<A1, A2, A3, R, F>(self, name: &str, f: F) -> Self
    where
        A1: Any + Send + Sync + Clone,
        A2: Any + Send + Sync + Clone,
        A3: Any + Send + Sync + Clone,
        R: Any + Send + Sync,
        F: Fn(&S, A1, A2, A3) -> R + Send + Sync + 'static,
    {
        let type_name = self.dispatcher.type_name.clone();
        let method = name.to_string();
        let shim: MethodFn = Box::new(move |target, args| {
            let target = target.downcast_ref::<S>().ok_or_else(|| {
                WrongTargetSnafu { type_name: type_name.clone() }.build()
            })?;
            let a1 = downcast_arg::<A1>(args, 0, &type_name, &method)?;
            let a2 = downcast_arg::<A2>(args, 1, &type_name, &method)?;
            let a3 = downcast_arg::<A3>(args, 2, &type_name, &method)?;
            Ok(box_return(f(target, a1, a2, a3)))
        });
        self.register(
            name,
            vec![TypeId::of::<A1>(), TypeId::of::<A2>(), TypeId::of::<A3>()],
            shim,
        )
    }

    /// Reclassify an already-registered method as inherited: callable, but
    /// excluded from the declared set.
    pub fn mark_inherited(mut self, name: &str) -> Self {
        if self.dispatcher.declared.remove(name) {
            self.dispatcher.inherited.insert(name.to_string());
        }
        self
    }

    /// Register a read-only property.
    pub fn property<V, G>(mut self, name: &str, get: G) -> Self
    where
        V: Any + Send + Sync,
        G: Fn(&S) -> V + Send + Sync + 'static,
    {
        let type_name = self.dispatcher.type_name.clone();
        let getter: GetFn = Box::new(move |target| {
            let target = target.downcast_ref::<S>().ok_or_else(|| {
                WrongTargetSnafu { type_name: type_name.clone() }.build()
            })?;
            Ok(Box::new(get(target)) as Value)
        });
        self.dispatcher.properties.entry(name.to_string()).or_default().get = Some(getter);
        self
    }

    /// Register a writable property. The setter receives a shared reference;
    /// mutable properties use interior mutability, matching how service
    /// objects are shared across invokers.
    pub fn writable_property<V, G, W>(self, name: &str, get: G, set: W) -> Self
    where
        V: Any + Send + Sync + Clone,
        G: Fn(&S) -> V + Send + Sync + 'static,
        W: Fn(&S, V) + Send + Sync + 'static,
    {
        let mut this = self.property(name, get);
        let type_name = this.dispatcher.type_name.clone();
        let property = name.to_string();
        let setter: SetFn = Box::new(move |target, value| {
            let target = target.downcast_ref::<S>().ok_or_else(|| {
                WrongTargetSnafu { type_name: type_name.clone() }.build()
            })?;
            let value = value.downcast::<V>().map_err(|_| {
                ArgumentMismatchSnafu {
                    type_name: type_name.clone(),
                    method: property.clone(),
                }
                .build()
            })?;
            set(target, *value);
            Ok(())
        });
        this.dispatcher.properties.entry(name.to_string()).or_default().set = Some(setter);
        this
    }

    pub fn build(self) -> ServiceDispatcher {
        self.dispatcher
    }
}

fn downcast_arg<A: Any + Send + Sync + Clone>(
    args: &[Value],
    index: usize,
    type_name: &str,
    method: &str,
) -> Result<A, DispatchError> {
    args.get(index)
        .and_then(|v| v.downcast_ref::<A>())
        .cloned()
        .ok_or_else(|| {
            ArgumentMismatchSnafu {
                type_name: type_name.to_string(),
                method: method.to_string(),
            }
            .build()
        })
}

/// Process-wide dispatcher cache, one entry per service type.
#[derive(Default)]
pub struct DispatcherCache {
    dispatchers: DashMap<TypeId, Arc<ServiceDispatcher>>,
}

impl DispatcherCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The dispatcher for `S`, building it on first use.
    pub fn dispatcher_for<S, F>(&self, build: F) -> Arc<ServiceDispatcher>
    where
        S: Any + Send + Sync,
        F: FnOnce() -> ServiceDispatcher,
    {
        self.dispatchers
            .entry(TypeId::of::<S>())
            .or_insert_with(|| Arc::new(build()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    struct Greeter {
        greeting: String,
        calls: AtomicU64,
    }

    impl Greeter {
        fn new(greeting: &str) -> Self {
            Self { greeting: greeting.to_string(), calls: AtomicU64::new(0) }
        }

        fn hello(&self, who: String) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            format!("{} {who}", self.greeting)
        }
    }

    fn greeter_dispatcher() -> ServiceDispatcher {
        DispatcherBuilder::<Greeter>::new("demo.Greeter")
            .method1("hello", Greeter::hello)
            .method2("repeat", |g: &Greeter, who: String, times: u64| {
                vec![g.hello(who); times as usize].join(", ")
            })
            .method0("reset", |g: &Greeter| g.calls.store(0, Ordering::SeqCst))
            .method0("to_string", |g: &Greeter| format!("Greeter({})", g.greeting))
            .mark_inherited("to_string")
            .property("greeting", |g: &Greeter| g.greeting.clone())
            .writable_property(
                "calls",
                |g: &Greeter| g.calls.load(Ordering::SeqCst),
                |g: &Greeter, v: u64| g.calls.store(v, Ordering::SeqCst),
            )
            .build()
    }

    fn val<T: Any + Send + Sync>(v: T) -> Value {
        Box::new(v)
    }

    #[test]
    fn test_invoke_method_exact_signature() {
        let d = greeter_dispatcher();
        let g: Box<Target> = Box::new(Greeter::new("hi"));
        let out = d
            .invoke_method(g.as_ref(), "hello", &[TypeId::of::<String>()], &[val("bob".to_string())])
            .unwrap()
            .unwrap();
        assert_eq!(out.downcast_ref::<String>().unwrap(), "hi bob");
    }

    #[test]
    fn test_unit_return_is_none() {
        let d = greeter_dispatcher();
        let g: Box<Target> = Box::new(Greeter::new("hi"));
        let out = d.invoke_method(g.as_ref(), "reset", &[], &[]).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_signature_mismatch_is_no_such_method() {
        let d = greeter_dispatcher();
        let g: Box<Target> = Box::new(Greeter::new("hi"));
        // Right name, wrong parameter types.
        let err = d
            .invoke_method(g.as_ref(), "hello", &[TypeId::of::<u64>()], &[val(1u64)])
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoSuchMethod { .. }));
        // Unknown name.
        let err = d.invoke_method(g.as_ref(), "goodbye", &[], &[]).unwrap_err();
        assert!(matches!(err, DispatchError::NoSuchMethod { .. }));
    }

    #[test]
    fn test_wrong_target_type_rejected() {
        let d = greeter_dispatcher();
        let not_a_greeter: Box<Target> = Box::new(42u64);
        let err = d.invoke_method(not_a_greeter.as_ref(), "reset", &[], &[]).unwrap_err();
        assert!(matches!(err, DispatchError::WrongTarget { .. }));
    }

    #[test]
    fn test_declared_vs_all_method_names() {
        let d = greeter_dispatcher();
        assert_eq!(d.declared_method_names(), vec!["hello", "repeat", "reset"]);
        assert_eq!(d.method_names(), vec!["hello", "repeat", "reset", "to_string"]);
        assert!(d.has_method("to_string"));
    }

    #[test]
    fn test_property_round_trip() {
        let d = greeter_dispatcher();
        let g: Box<Target> = Box::new(Greeter::new("hi"));

        let greeting = d.get_property(g.as_ref(), "greeting").unwrap();
        assert_eq!(greeting.downcast_ref::<String>().unwrap(), "hi");

        d.set_property(g.as_ref(), "calls", val(7u64)).unwrap();
        let calls = d.get_property(g.as_ref(), "calls").unwrap();
        assert_eq!(*calls.downcast_ref::<u64>().unwrap(), 7);
    }

    #[test]
    fn test_missing_property() {
        let d = greeter_dispatcher();
        let g: Box<Target> = Box::new(Greeter::new("hi"));
        let err = d.get_property(g.as_ref(), "nope").unwrap_err();
        assert!(matches!(err, DispatchError::NoSuchProperty { .. }));
        // `greeting` has no setter.
        let err = d.set_property(g.as_ref(), "greeting", val("x".to_string())).unwrap_err();
        assert!(matches!(err, DispatchError::NoSuchProperty { .. }));
    }

    #[test]
    fn test_cache_builds_once_per_type() {
        let cache = DispatcherCache::new();
        let a = cache.dispatcher_for::<Greeter, _>(greeter_dispatcher);
        let b = cache.dispatcher_for::<Greeter, _>(|| panic!("must not rebuild"));
        assert!(Arc::ptr_eq(&a, &b));
    }
}
