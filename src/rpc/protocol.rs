//! The `Protocol` capability: export a live invoker, refer a remote one.
//!
//! The adaptive instance dispatches on the URL's protocol, which is how
//! `registry://` URLs route to the registry protocol and plain provider
//! URLs route to their transport.

use std::sync::Arc;
use std::sync::Weak;

use tracing::warn;

use crate::extension::ExtensionPoint;
use crate::extension::ExtensionProvider;
use crate::extension::ExtensionRegistry;
use crate::extension::resolve_adaptive_name;
use crate::rpc::Exporter;
use crate::rpc::Invoker;
use crate::rpc::RpcError;
use crate::url::Url;

/// Exporting and referring endpoint capability.
pub trait Protocol: Send + Sync {
    /// Expose `invoker` as a live endpoint.
    fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>, RpcError>;

    /// Build a consumer-side invoker for `service` at `url`.
    fn refer(&self, service: &str, url: &Url) -> Result<Arc<dyn Invoker>, RpcError>;

    /// Tear down every endpoint this protocol holds.
    fn destroy(&self);

    /// Port used when a URL names none.
    fn default_port(&self) -> u16;
}

impl ExtensionPoint for dyn Protocol {
    const TYPE_PATH: &'static str = "banyan.rpc.Protocol";
    const DEFAULT_NAME: Option<&'static str> = Some("local");

    fn providers() -> Vec<ExtensionProvider<Self>> {
        vec![
            ExtensionProvider::named("banyan.rpc.LocalProtocol", crate::rpc::local::provide),
            ExtensionProvider::named(
                "banyan.registry.RegistryProtocol",
                crate::registry::integration::provide_registry_protocol,
            ),
            ExtensionProvider::wrapper(
                "banyan.rpc.FilterProtocolWrapper",
                crate::rpc::filter::provide_wrapper,
            ),
        ]
    }

    fn embedded_manifest() -> &'static str {
        "local = banyan.rpc.LocalProtocol\n\
         registry = banyan.registry.RegistryProtocol\n\
         filter = banyan.rpc.FilterProtocolWrapper\n"
    }

    fn synthesize_adaptive(
        registry: &Arc<ExtensionRegistry>,
    ) -> Result<Option<Arc<Self>>, crate::extension::ExtensionError> {
        Ok(Some(Arc::new(AdaptiveProtocol { registry: Arc::downgrade(registry) })))
    }
}

/// Synthetic adaptive `Protocol`: both `export` and `refer` resolve the real
/// protocol from the URL at every call.
pub struct AdaptiveProtocol {
    registry: Weak<ExtensionRegistry>,
}

impl AdaptiveProtocol {
    fn resolve(&self, method: &str, url: &Url) -> Result<Arc<dyn Protocol>, RpcError> {
        let name = resolve_adaptive_name(
            <dyn Protocol as ExtensionPoint>::TYPE_PATH,
            <dyn Protocol as ExtensionPoint>::DEFAULT_NAME,
            method,
            &["protocol"],
            url,
        )?;
        let registry = self.registry.upgrade().ok_or_else(|| RpcError::Network {
            target: url.address(),
            message: "extension registry dropped".to_string(),
        })?;
        Ok(registry.loader::<dyn Protocol>()?.get(&name)?)
    }
}

impl Protocol for AdaptiveProtocol {
    fn export(&self, invoker: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>, RpcError> {
        let protocol = self.resolve("export", invoker.url())?;
        protocol.export(invoker)
    }

    fn refer(&self, service: &str, url: &Url) -> Result<Arc<dyn Invoker>, RpcError> {
        self.resolve("refer", url)?.refer(service, url)
    }

    fn destroy(&self) {
        // Not an adaptive method; there is no URL to dispatch on.
        warn!("destroy called on the adaptive protocol; ignoring");
    }

    fn default_port(&self) -> u16 {
        0
    }
}
