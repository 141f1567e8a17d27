//! Filter chains around invokers, assembled from activated extensions.
//!
//! `FilterProtocolWrapper` is a wrapper extension on `Protocol`: on export
//! it builds the provider-side chain from `service.filter`, on refer the
//! consumer-side chain from `reference.filter`. Registry URLs pass through
//! untouched; the chain belongs around the transport endpoint, not around
//! the registry integration.

use std::sync::Arc;
use std::sync::Weak;

use tracing::info;

use crate::constants::ACCESSLOG_KEY;
use crate::constants::REFERENCE_FILTER_KEY;
use crate::constants::REGISTRY_PROTOCOL;
use crate::constants::SERVICE_FILTER_KEY;
use crate::constants::SIDE_KEY;
use crate::extension::Activation;
use crate::extension::ExtensionError;
use crate::extension::ExtensionPoint;
use crate::extension::ExtensionProvider;
use crate::extension::ExtensionRegistry;
use crate::rpc::Exporter;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::Protocol;
use crate::rpc::RpcError;
use crate::rpc::RpcResult;
use crate::url::Url;

/// Pre/post behavior around an invoker.
pub trait Filter: Send + Sync {
    fn invoke(&self, next: &dyn Invoker, invocation: &Invocation) -> Result<RpcResult, RpcError>;
}

impl ExtensionPoint for dyn Filter {
    const TYPE_PATH: &'static str = "banyan.rpc.Filter";
    const DEFAULT_NAME: Option<&'static str> = None;

    fn providers() -> Vec<ExtensionProvider<Self>> {
        vec![
            ExtensionProvider::activated(
                "banyan.rpc.ContextFilter",
                provide_context,
                Activation { groups: &["provider", "consumer"], values: &[], order: -100 },
            ),
            ExtensionProvider::activated(
                "banyan.rpc.AccessLogFilter",
                provide_accesslog,
                Activation { groups: &["provider"], values: &[ACCESSLOG_KEY], order: -50 },
            ),
        ]
    }

    fn embedded_manifest() -> &'static str {
        "context = banyan.rpc.ContextFilter\n\
         accesslog = banyan.rpc.AccessLogFilter\n"
    }
}

fn provide_context(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn Filter>, ExtensionError> {
    Ok(Arc::new(ContextFilter))
}

fn provide_accesslog(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn Filter>, ExtensionError> {
    Ok(Arc::new(AccessLogFilter))
}

/// Stamps which side served the call into the result attachments.
struct ContextFilter;

impl Filter for ContextFilter {
    fn invoke(&self, next: &dyn Invoker, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        let side = next.url().param_or(SIDE_KEY, "provider").to_string();
        let mut result = next.invoke(invocation)?;
        result.set_attachment(SIDE_KEY, side);
        Ok(result)
    }
}

/// Logs every call; activated by a truthy `accesslog` URL parameter.
struct AccessLogFilter;

impl Filter for AccessLogFilter {
    fn invoke(&self, next: &dyn Invoker, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        info!(
            service = next.service(),
            method = invocation.method(),
            args = invocation.args().len(),
            "access"
        );
        next.invoke(invocation)
    }
}

/// One node of a filter chain.
struct FilterInvoker {
    filter: Arc<dyn Filter>,
    next: Arc<dyn Invoker>,
}

impl Invoker for FilterInvoker {
    fn url(&self) -> &Url {
        self.next.url()
    }

    fn service(&self) -> &str {
        self.next.service()
    }

    fn is_available(&self) -> bool {
        self.next.is_available()
    }

    fn invoke(&self, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        self.filter.invoke(self.next.as_ref(), invocation)
    }

    fn destroy(&self) {
        self.next.destroy();
    }
}

/// Fold `filters` around `invoker`; the first filter runs first.
pub fn build_filter_chain(
    invoker: Arc<dyn Invoker>,
    filters: Vec<Arc<dyn Filter>>,
) -> Arc<dyn Invoker> {
    let mut chain = invoker;
    for filter in filters.into_iter().rev() {
        chain = Arc::new(FilterInvoker { filter, next: chain });
    }
    chain
}

/// Wrapper provider entry point used by the `Protocol` manifest.
pub(crate) fn provide_wrapper(
    inner: Arc<dyn Protocol>,
    registry: &Arc<ExtensionRegistry>,
) -> Result<Arc<dyn Protocol>, ExtensionError> {
    Ok(Arc::new(FilterProtocolWrapper { inner, registry: Arc::downgrade(registry) }))
}

/// Decorates every protocol with activation-driven filter chains.
pub struct FilterProtocolWrapper {
    inner: Arc<dyn Protocol>,
    registry: Weak<ExtensionRegistry>,
}

impl FilterProtocolWrapper {
    fn filters(&self, url: &Url, key: &str, group: &str) -> Result<Vec<Arc<dyn Filter>>, RpcError> {
        let registry = match self.registry.upgrade() {
            Some(registry) => registry,
            None => return Ok(Vec::new()),
        };
        Ok(registry.loader::<dyn Filter>()?.activated(url, key, group)?)
    }
}

impl Protocol for FilterProtocolWrapper {
    fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>, RpcError> {
        if invoker.url().protocol() == REGISTRY_PROTOCOL {
            return self.inner.export(invoker);
        }
        let filters = self.filters(invoker.url(), SERVICE_FILTER_KEY, "provider")?;
        self.inner.export(build_filter_chain(invoker, filters))
    }

    fn refer(&self, service: &str, url: &Url) -> Result<Arc<dyn Invoker>, RpcError> {
        if url.protocol() == REGISTRY_PROTOCOL {
            return self.inner.refer(service, url);
        }
        let invoker = self.inner.refer(service, url)?;
        let filters = self.filters(url, REFERENCE_FILTER_KEY, "consumer")?;
        Ok(build_filter_chain(invoker, filters))
    }

    fn destroy(&self) {
        self.inner.destroy();
    }

    fn default_port(&self) -> u16 {
        self.inner.default_port()
    }
}
