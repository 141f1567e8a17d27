//! Proxy factory: bridges service objects and invokers in both directions.
//!
//! On the provider side it wraps a service object plus its dispatch table
//! into an [`Invoker`]; on the consumer side it wraps an invoker into a
//! [`ServiceProxy`] call handle. The adaptive instance picks the factory
//! from the `proxy` URL parameter.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::dispatch::ServiceDispatcher;
use crate::dispatch::Target;
use crate::extension::ExtensionError;
use crate::extension::ExtensionPoint;
use crate::extension::ExtensionProvider;
use crate::extension::ExtensionRegistry;
use crate::extension::resolve_adaptive_name;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::RpcError;
use crate::rpc::RpcResult;
use crate::rpc::Value;
use crate::rpc::error::SerializationSnafu;
use crate::url::Url;

/// A service object paired with its dispatch table.
#[derive(Clone)]
pub struct ServiceModel {
    service: String,
    instance: Arc<Target>,
    dispatcher: Arc<ServiceDispatcher>,
}

impl ServiceModel {
    pub fn new(
        service: impl Into<String>,
        instance: Arc<Target>,
        dispatcher: Arc<ServiceDispatcher>,
    ) -> Self {
        Self { service: service.into(), instance, dispatcher }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn dispatcher(&self) -> &Arc<ServiceDispatcher> {
        &self.dispatcher
    }
}

/// Builds provider invokers and consumer proxies.
pub trait ProxyFactory: Send + Sync {
    /// Wrap a local service object into an invoker advertising `url`.
    fn invoker(&self, model: ServiceModel, url: &Url) -> Result<Arc<dyn Invoker>, RpcError>;

    /// Wrap a consumer invoker into a call handle.
    fn proxy(&self, invoker: Arc<dyn Invoker>) -> Result<ServiceProxy, RpcError>;
}

impl ExtensionPoint for dyn ProxyFactory {
    const TYPE_PATH: &'static str = "banyan.rpc.ProxyFactory";
    const DEFAULT_NAME: Option<&'static str> = Some("table");

    fn providers() -> Vec<ExtensionProvider<Self>> {
        vec![ExtensionProvider::named("banyan.rpc.DispatchProxyFactory", provide_table)]
    }

    fn embedded_manifest() -> &'static str {
        "table = banyan.rpc.DispatchProxyFactory\n"
    }

    fn synthesize_adaptive(
        registry: &Arc<ExtensionRegistry>,
    ) -> Result<Option<Arc<Self>>, ExtensionError> {
        Ok(Some(Arc::new(AdaptiveProxyFactory { registry: Arc::downgrade(registry) })))
    }
}

fn provide_table(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn ProxyFactory>, ExtensionError> {
    Ok(Arc::new(DispatchProxyFactory))
}

/// The dispatch-table proxy factory.
pub struct DispatchProxyFactory;

impl ProxyFactory for DispatchProxyFactory {
    fn invoker(&self, model: ServiceModel, url: &Url) -> Result<Arc<dyn Invoker>, RpcError> {
        Ok(Arc::new(DispatchInvoker {
            model,
            url: url.clone(),
            destroyed: AtomicBool::new(false),
        }))
    }

    fn proxy(&self, invoker: Arc<dyn Invoker>) -> Result<ServiceProxy, RpcError> {
        Ok(ServiceProxy { invoker })
    }
}

struct AdaptiveProxyFactory {
    registry: Weak<ExtensionRegistry>,
}

impl AdaptiveProxyFactory {
    fn resolve(&self, method: &str, url: &Url) -> Result<Arc<dyn ProxyFactory>, RpcError> {
        let name = resolve_adaptive_name(
            <dyn ProxyFactory as ExtensionPoint>::TYPE_PATH,
            <dyn ProxyFactory as ExtensionPoint>::DEFAULT_NAME,
            method,
            &["proxy"],
            url,
        )?;
        let registry = self.registry.upgrade().ok_or_else(|| RpcError::Network {
            target: url.address(),
            message: "extension registry dropped".to_string(),
        })?;
        Ok(registry.loader::<dyn ProxyFactory>()?.get(&name)?)
    }
}

impl ProxyFactory for AdaptiveProxyFactory {
    fn invoker(&self, model: ServiceModel, url: &Url) -> Result<Arc<dyn Invoker>, RpcError> {
        self.resolve("invoker", url)?.invoker(model, url)
    }

    fn proxy(&self, invoker: Arc<dyn Invoker>) -> Result<ServiceProxy, RpcError> {
        let factory = self.resolve("proxy", invoker.url())?;
        factory.proxy(invoker)
    }
}

/// Proxy-wrapping invoker: delegates through the dispatch table to a local
/// service object.
struct DispatchInvoker {
    model: ServiceModel,
    url: Url,
    destroyed: AtomicBool,
}

impl Invoker for DispatchInvoker {
    fn url(&self) -> &Url {
        &self.url
    }

    fn service(&self) -> &str {
        &self.model.service
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
    }

    fn invoke(&self, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RpcError::Destroyed { service: self.model.service.clone() });
        }
        let value = self.model.dispatcher.invoke_method(
            self.model.instance.as_ref(),
            invocation.method(),
            invocation.param_types(),
            invocation.args(),
        )?;
        Ok(RpcResult::ok(value))
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Consumer-side call handle over an invoker.
pub struct ServiceProxy {
    invoker: Arc<dyn Invoker>,
}

impl ServiceProxy {
    pub fn invoker(&self) -> &Arc<dyn Invoker> {
        &self.invoker
    }

    /// Raw call: value or error, unit returns as `None`.
    pub fn call(&self, invocation: Invocation) -> Result<Option<Value>, RpcError> {
        self.invoker.invoke(&invocation)?.into_value()
    }

    /// Niladic typed call.
    pub fn call0<R: Send + Sync + 'static>(&self, method: &str) -> Result<R, RpcError> {
        self.typed(method, self.call(Invocation::new(method))?)
    }

    /// One-argument typed call.
    pub fn call1<A, R>(&self, method: &str, arg: A) -> Result<R, RpcError>
    where
        A: Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        self.typed(method, self.call(Invocation::new(method).with_arg(arg))?)
    }

    /// Two-argument typed call.
    pub fn call2<A1, A2, R>(&self, method: &str, a1: A1, a2: A2) -> Result<R, RpcError>
    where
        A1: Send + Sync + 'static,
        A2: Send + Sync + 'static,
        R: Send + Sync + 'static,
    {
        self.typed(method, self.call(Invocation::new(method).with_arg(a1).with_arg(a2))?)
    }

    fn typed<R: Send + Sync + 'static>(
        &self,
        method: &str,
        value: Option<Value>,
    ) -> Result<R, RpcError> {
        value
            .and_then(|v| v.downcast::<R>().ok())
            .map(|b| *b)
            .ok_or_else(|| {
                SerializationSnafu {
                    message: format!("unexpected return type from {method:?}"),
                }
                .build()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatcherBuilder;

    struct Calc {
        base: u64,
    }
    impl Calc {
        fn add(&self, n: u64) -> u64 {
            self.base + n
        }
    }

    fn calc_model() -> ServiceModel {
        ServiceModel::new(
            "demo.Calc",
            Arc::new(Calc { base: 40 }),
            Arc::new(
                DispatcherBuilder::<Calc>::new("demo.Calc").method1("add", Calc::add).build(),
            ),
        )
    }

    fn url() -> Url {
        Url::parse("local://127.0.0.1:0/demo.Calc").unwrap()
    }

    #[test]
    fn test_dispatch_invoker_calls_service_object() {
        let invoker = DispatchProxyFactory.invoker(calc_model(), &url()).unwrap();
        let result = invoker.invoke(&Invocation::new("add").with_arg(2u64)).unwrap();
        assert_eq!(*result.value_as::<u64>().unwrap(), 42);
    }

    #[test]
    fn test_destroyed_invoker_rejects_calls() {
        let invoker = DispatchProxyFactory.invoker(calc_model(), &url()).unwrap();
        invoker.destroy();
        assert!(!invoker.is_available());
        let err = invoker.invoke(&Invocation::new("add").with_arg(2u64)).unwrap_err();
        assert!(matches!(err, RpcError::Destroyed { .. }));
        // Idempotent.
        invoker.destroy();
    }

    #[test]
    fn test_proxy_typed_calls() {
        let invoker = DispatchProxyFactory.invoker(calc_model(), &url()).unwrap();
        let proxy = DispatchProxyFactory.proxy(invoker).unwrap();
        let out: u64 = proxy.call1("add", 2u64).unwrap();
        assert_eq!(out, 42);

        // Wrong return type surfaces as a serialization failure.
        let err = proxy.call1::<u64, String>("add", 2u64).unwrap_err();
        assert!(matches!(err, RpcError::Serialization { .. }));
    }

    #[test]
    fn test_adaptive_proxy_factory_uses_default() {
        let registry = ExtensionRegistry::new();
        let adaptive = registry.loader::<dyn ProxyFactory>().unwrap().adaptive().unwrap();
        let invoker = adaptive.invoker(calc_model(), &url()).unwrap();
        let proxy = adaptive.proxy(invoker).unwrap();
        let out: u64 = proxy.call1("add", 1u64).unwrap();
        assert_eq!(out, 41);
    }
}
