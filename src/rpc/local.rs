//! In-process transport: exports live in a service-key table, refers look
//! them up at call time.
//!
//! This is the only transport the core ships; wire protocols are external
//! collaborators behind the same `Protocol` seam. Consumer invokers hold a
//! weak handle to the exporter table and resolve the provider per call, so a
//! re-export is picked up immediately and an unexport turns into a call-time
//! failure instead of a dangling reference.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tracing::debug;

use crate::extension::ExtensionError;
use crate::extension::ExtensionRegistry;
use crate::rpc::Exporter;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::Protocol;
use crate::rpc::RpcError;
use crate::rpc::RpcResult;
use crate::url::Url;

type ExporterTable = DashMap<String, Arc<LocalExporter>>;

/// Provider entry point used by the `Protocol` manifest.
pub(crate) fn provide(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn Protocol>, ExtensionError> {
    Ok(Arc::new(LocalProtocol::new()))
}

/// The in-process protocol.
pub struct LocalProtocol {
    exporters: Arc<ExporterTable>,
}

impl LocalProtocol {
    pub fn new() -> Self {
        Self { exporters: Arc::new(DashMap::new()) }
    }
}

impl Default for LocalProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for LocalProtocol {
    fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>, RpcError> {
        let key = invoker.url().service_key();
        debug!(service_key = key.as_str(), "exporting local endpoint");
        let exporter = Arc::new(LocalExporter {
            key: key.clone(),
            invoker,
            exporters: Arc::downgrade(&self.exporters),
            unexported: AtomicBool::new(false),
        });
        self.exporters.insert(key, exporter.clone());
        Ok(exporter)
    }

    fn refer(&self, service: &str, url: &Url) -> Result<Arc<dyn Invoker>, RpcError> {
        Ok(Arc::new(LocalInvoker {
            service: service.to_string(),
            key: url.service_key(),
            url: url.clone(),
            exporters: Arc::downgrade(&self.exporters),
            destroyed: AtomicBool::new(false),
        }))
    }

    fn destroy(&self) {
        let keys: Vec<String> = self.exporters.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, exporter)) = self.exporters.remove(&key) {
                exporter.invoker.destroy();
            }
        }
    }

    fn default_port(&self) -> u16 {
        0
    }
}

struct LocalExporter {
    key: String,
    invoker: Arc<dyn Invoker>,
    exporters: Weak<ExporterTable>,
    unexported: AtomicBool,
}

impl Exporter for LocalExporter {
    fn invoker(&self) -> Arc<dyn Invoker> {
        self.invoker.clone()
    }

    fn unexport(&self) {
        if self.unexported.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(exporters) = self.exporters.upgrade() {
            // Only remove the slot if it is still ours; a re-export may have
            // replaced it.
            exporters.remove_if(&self.key, |_, current| {
                std::ptr::eq(Arc::as_ptr(current), self as *const _)
            });
        }
        self.invoker.destroy();
        debug!(service_key = self.key.as_str(), "unexported local endpoint");
    }
}

struct LocalInvoker {
    service: String,
    key: String,
    url: Url,
    exporters: Weak<ExporterTable>,
    destroyed: AtomicBool,
}

impl Invoker for LocalInvoker {
    fn url(&self) -> &Url {
        &self.url
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn is_available(&self) -> bool {
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        self.exporters.upgrade().is_some_and(|e| e.contains_key(&self.key))
    }

    fn invoke(&self, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RpcError::Destroyed { service: self.service.clone() });
        }
        let exporters = self.exporters.upgrade().ok_or_else(|| RpcError::Network {
            target: self.url.address(),
            message: "local protocol destroyed".to_string(),
        })?;
        let exporter = exporters.get(&self.key).ok_or_else(|| RpcError::Network {
            target: self.url.address(),
            message: format!("no local provider exported for {}", self.key),
        })?;
        let invoker = exporter.invoker();
        drop(exporter);
        invoker.invoke(invocation)
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatcherBuilder;
    use crate::rpc::ServiceModel;
    use crate::rpc::proxy::DispatchProxyFactory;
    use crate::rpc::proxy::ProxyFactory;

    struct Greeter;
    impl Greeter {
        fn hello(&self, who: String) -> String {
            format!("hello {who}")
        }
    }

    fn greeter_model() -> ServiceModel {
        ServiceModel::new(
            "demo.Greeter",
            Arc::new(Greeter),
            Arc::new(
                DispatcherBuilder::<Greeter>::new("demo.Greeter")
                    .method1("hello", Greeter::hello)
                    .build(),
            ),
        )
    }

    fn provider_url() -> Url {
        Url::parse("local://127.0.0.1:0/demo.Greeter?methods=hello").unwrap()
    }

    #[test]
    fn test_export_then_refer_round_trip() {
        let protocol = LocalProtocol::new();
        let factory = DispatchProxyFactory;
        let invoker = factory.invoker(greeter_model(), &provider_url()).unwrap();
        let _exporter = protocol.export(invoker).unwrap();

        let consumer = protocol.refer("demo.Greeter", &provider_url()).unwrap();
        assert!(consumer.is_available());
        let result = consumer
            .invoke(&Invocation::new("hello").with_arg("bob".to_string()))
            .unwrap();
        assert_eq!(result.value_as::<String>().unwrap(), "hello bob");
    }

    #[test]
    fn test_refer_without_export_fails_at_call_time() {
        let protocol = LocalProtocol::new();
        let consumer = protocol.refer("demo.Greeter", &provider_url()).unwrap();
        assert!(!consumer.is_available());
        let err = consumer.invoke(&Invocation::new("hello")).unwrap_err();
        assert!(matches!(err, RpcError::Network { .. }));
    }

    #[test]
    fn test_unexport_is_idempotent_and_detaches() {
        let protocol = LocalProtocol::new();
        let factory = DispatchProxyFactory;
        let invoker = factory.invoker(greeter_model(), &provider_url()).unwrap();
        let exporter = protocol.export(invoker).unwrap();
        let consumer = protocol.refer("demo.Greeter", &provider_url()).unwrap();

        exporter.unexport();
        exporter.unexport();
        assert!(!consumer.is_available());
        assert!(consumer.invoke(&Invocation::new("hello")).is_err());
        // The underlying invoker was destroyed exactly once.
        assert!(!exporter.invoker().is_available());
    }

    #[test]
    fn test_destroyed_consumer_invoker_fails() {
        let protocol = LocalProtocol::new();
        let factory = DispatchProxyFactory;
        let invoker = factory.invoker(greeter_model(), &provider_url()).unwrap();
        let _exporter = protocol.export(invoker).unwrap();
        let consumer = protocol.refer("demo.Greeter", &provider_url()).unwrap();

        consumer.destroy();
        assert!(!consumer.is_available());
        let err = consumer.invoke(&Invocation::new("hello")).unwrap_err();
        assert!(matches!(err, RpcError::Destroyed { .. }));
    }
}
