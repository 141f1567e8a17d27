//! Shared harness for the integration suites: a small greeter service, its
//! dispatch table, and helpers that export/refer through the registry
//! protocol against the in-memory registry and configuration backends.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use banyan::Url;
use banyan::config::DynamicConfiguration;
use banyan::dispatch::DispatcherBuilder;
use banyan::extension::ExtensionRegistry;
use banyan::registry::Registry;
use banyan::registry::RegistryFactory;
use banyan::rpc::Exporter;
use banyan::rpc::Invoker;
use banyan::rpc::Protocol;
use banyan::rpc::ProxyFactory;
use banyan::rpc::ServiceModel;

pub const REGISTRY_ADDR: &str = "127.0.0.1:2181";
pub const GREETER_SERVICE: &str = "demo.Greeter";

/// Route framework logs to the test output when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The provider-side service object.
pub struct Greeter {
    pub greeting: String,
    pub calls: AtomicU64,
}

impl Greeter {
    pub fn new(greeting: &str) -> Self {
        Self { greeting: greeting.to_string(), calls: AtomicU64::new(0) }
    }

    fn hello(&self, who: String) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        format!("{} {who}", self.greeting)
    }
}

pub fn greeter_model(greeter: Arc<Greeter>) -> ServiceModel {
    let dispatcher = DispatcherBuilder::<Greeter>::new(GREETER_SERVICE)
        .method1("hello", Greeter::hello)
        .build();
    ServiceModel::new(GREETER_SERVICE, greeter, Arc::new(dispatcher))
}

/// The `registry://` URL a provider exports through.
pub fn export_url(provider_url: &Url, shutdown_timeout_ms: u64) -> Url {
    Url::parse(&format!("registry://{REGISTRY_ADDR}"))
        .unwrap()
        .with_param("registry", "memory")
        .with_param("export", provider_url.to_string())
        .with_param("shutdown.timeout", shutdown_timeout_ms.to_string())
}

/// The `registry://` URL a consumer refers through.
pub fn refer_url(refer_query: &str) -> Url {
    Url::parse(&format!("registry://{REGISTRY_ADDR}"))
        .unwrap()
        .with_param("registry", "memory")
        .with_param("refer", refer_query)
}

pub fn adaptive_protocol(ext: &Arc<ExtensionRegistry>) -> Arc<dyn Protocol> {
    ext.loader::<dyn Protocol>().unwrap().adaptive().unwrap()
}

/// Export a greeter through the registry protocol via adaptive dispatch.
pub fn export_greeter(
    ext: &Arc<ExtensionRegistry>,
    greeter: Arc<Greeter>,
    provider_url: &Url,
    shutdown_timeout_ms: u64,
) -> Arc<dyn Exporter> {
    init_tracing();
    let proxy_factory = ext.loader::<dyn ProxyFactory>().unwrap().adaptive().unwrap();
    let origin = proxy_factory
        .invoker(greeter_model(greeter), &export_url(provider_url, shutdown_timeout_ms))
        .unwrap();
    adaptive_protocol(ext).export(origin).unwrap()
}

/// Refer a consumer invoker for the greeter.
pub fn refer_greeter(ext: &Arc<ExtensionRegistry>, refer_query: &str) -> Arc<dyn Invoker> {
    init_tracing();
    adaptive_protocol(ext).refer(GREETER_SERVICE, &refer_url(refer_query)).unwrap()
}

/// The memory registry instance the protocol talks to.
pub fn backend_registry(ext: &Arc<ExtensionRegistry>) -> Arc<dyn Registry> {
    let factory = ext.loader::<dyn RegistryFactory>().unwrap().adaptive().unwrap();
    factory.registry(&Url::parse(&format!("memory://{REGISTRY_ADDR}")).unwrap()).unwrap()
}

/// The memory configuration backend shared across the process.
pub fn backend_config(ext: &Arc<ExtensionRegistry>) -> Arc<dyn DynamicConfiguration> {
    ext.loader::<dyn DynamicConfiguration>().unwrap().default_extension().unwrap()
}

/// Call `hello` through a consumer invoker and unwrap the string result.
pub fn call_hello(invoker: &Arc<dyn Invoker>, who: &str) -> Result<String, banyan::rpc::RpcError> {
    let invocation = banyan::rpc::Invocation::new("hello").with_arg(who.to_string());
    let result = invoker.invoke(&invocation)?;
    Ok(result.value_as::<String>().expect("string result").clone())
}
