//! Registry contracts: registration, discovery, push notifications.
//!
//! The core consumes these; concrete coordination-service clients live
//! outside. The built-in [`memory`] backend implements the full contract
//! in-process and doubles as the test registry. The
//! [`integration`] module composes a registry with the protocol and cluster
//! layers into the registry protocol.

pub mod integration;
pub mod memory;

pub use memory::MemoryRegistry;

use std::sync::Arc;
use std::sync::Weak;

use snafu::Snafu;

use crate::constants::ANY_VALUE;
use crate::constants::CATEGORY_KEY;
use crate::constants::GROUP_KEY;
use crate::constants::PROVIDERS_CATEGORY;
use crate::constants::REGISTRY_SERVICE_TYPE;
use crate::constants::VERSION_KEY;
use crate::extension::ExtensionError;
use crate::extension::ExtensionPoint;
use crate::extension::ExtensionProvider;
use crate::extension::ExtensionRegistry;
use crate::extension::resolve_adaptive_name;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::RpcError;
use crate::rpc::RpcResult;
use crate::url::Url;

/// Registry-backend failures.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegistryError {
    /// The backend refused the operation.
    #[snafu(display("registry {registry} rejected {url}: {message}"))]
    Rejected { registry: String, url: String, message: String },

    /// The backend could not be reached.
    #[snafu(display("registry {registry} unreachable: {message}"))]
    Unreachable { registry: String, message: String },

    /// Extension resolution failed while locating the backend.
    #[snafu(context(false), display("extension failure: {source}"))]
    Extension { source: ExtensionError },
}

/// Receives the authoritative URL snapshot on every change.
pub trait NotifyListener: Send + Sync {
    fn notify(&self, urls: Vec<Url>);
}

/// The registry contract the core consumes.
pub trait Registry: Send + Sync {
    /// The registry backend's own URL.
    fn url(&self) -> &Url;

    fn register(&self, url: &Url) -> Result<(), RegistryError>;

    fn unregister(&self, url: &Url) -> Result<(), RegistryError>;

    fn subscribe(&self, url: &Url, listener: Arc<dyn NotifyListener>)
    -> Result<(), RegistryError>;

    fn unsubscribe(
        &self,
        url: &Url,
        listener: &Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError>;

    fn lookup(&self, url: &Url) -> Result<Vec<Url>, RegistryError>;
}

impl std::fmt::Debug for dyn Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Registry").field("url", self.url()).finish()
    }
}

/// Produces (and caches) registries per backend address.
pub trait RegistryFactory: Send + Sync {
    fn registry(&self, url: &Url) -> Result<Arc<dyn Registry>, RegistryError>;
}

impl ExtensionPoint for dyn RegistryFactory {
    const TYPE_PATH: &'static str = "banyan.registry.RegistryFactory";
    const DEFAULT_NAME: Option<&'static str> = Some("memory");

    fn providers() -> Vec<ExtensionProvider<Self>> {
        vec![ExtensionProvider::named(
            "banyan.registry.MemoryRegistryFactory",
            memory::provide_factory,
        )]
    }

    fn embedded_manifest() -> &'static str {
        "memory = banyan.registry.MemoryRegistryFactory\n"
    }

    fn synthesize_adaptive(
        registry: &Arc<ExtensionRegistry>,
    ) -> Result<Option<Arc<Self>>, ExtensionError> {
        Ok(Some(Arc::new(AdaptiveRegistryFactory { registry: Arc::downgrade(registry) })))
    }
}

/// Synthetic adaptive factory: the backend comes from the URL's protocol.
struct AdaptiveRegistryFactory {
    registry: Weak<ExtensionRegistry>,
}

impl RegistryFactory for AdaptiveRegistryFactory {
    fn registry(&self, url: &Url) -> Result<Arc<dyn Registry>, RegistryError> {
        let name = resolve_adaptive_name(
            <dyn RegistryFactory as ExtensionPoint>::TYPE_PATH,
            <dyn RegistryFactory as ExtensionPoint>::DEFAULT_NAME,
            "registry",
            &["protocol"],
            url,
        )?;
        let registry = self.registry.upgrade().ok_or_else(|| {
            UnreachableSnafu {
                registry: url.address(),
                message: "extension registry dropped".to_string(),
            }
            .build()
        })?;
        let factory = registry.loader::<dyn RegistryFactory>()?.get(&name)?;
        factory.registry(url)
    }
}

/// The data category a registry URL belongs to, inferring configurator and
/// router protocols when the parameter is absent.
pub(crate) fn category_of(url: &Url) -> &str {
    if let Some(category) = url.param(CATEGORY_KEY).filter(|c| !c.is_empty()) {
        return category;
    }
    match url.protocol() {
        crate::constants::OVERRIDE_PROTOCOL | crate::constants::ABSENT_PROTOCOL => {
            crate::constants::CONFIGURATORS_CATEGORY
        }
        "condition" | "tag" => crate::constants::ROUTERS_CATEGORY,
        _ => PROVIDERS_CATEGORY,
    }
}

fn wildcard_eq(subscribed: Option<&str>, candidate: Option<&str>) -> bool {
    match subscribed.filter(|v| !v.is_empty()) {
        None => true,
        Some(ANY_VALUE) => true,
        Some(sub) => candidate == Some(sub),
    }
}

/// Does `candidate` fall inside `subscribe`'s interest: interface, group,
/// version, and category all match (wildcards allowed)?
pub(crate) fn url_matches(subscribe: &Url, candidate: &Url) -> bool {
    let sub_interface = subscribe.service_interface();
    let cand_interface = candidate.service_interface();
    let interface_ok = sub_interface == ANY_VALUE
        || cand_interface == ANY_VALUE
        || sub_interface == cand_interface;

    let group_ok = wildcard_eq(subscribe.param(GROUP_KEY), candidate.param(GROUP_KEY));
    let version_ok = wildcard_eq(subscribe.param(VERSION_KEY), candidate.param(VERSION_KEY));

    let categories = subscribe.param_or(CATEGORY_KEY, PROVIDERS_CATEGORY);
    let category_ok = categories.split(',').map(str::trim).any(|c| c == category_of(candidate));

    interface_ok && group_ok && version_ok && category_ok
}

/// Wraps a registry as an invoker; returned when a consumer refers the
/// registry management service itself.
pub(crate) struct RegistryServiceInvoker {
    registry: Arc<dyn Registry>,
    url: Url,
}

impl RegistryServiceInvoker {
    pub(crate) fn new(registry: Arc<dyn Registry>, url: Url) -> Self {
        Self { registry, url }
    }
}

impl Invoker for RegistryServiceInvoker {
    fn url(&self) -> &Url {
        &self.url
    }

    fn service(&self) -> &str {
        REGISTRY_SERVICE_TYPE
    }

    fn is_available(&self) -> bool {
        true
    }

    fn invoke(&self, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        let url_arg = || -> Result<Url, RpcError> {
            invocation
                .args()
                .first()
                .and_then(|a| a.downcast_ref::<Url>())
                .cloned()
                .ok_or_else(|| {
                    crate::dispatch::DispatchError::NoSuchMethod {
                        type_name: REGISTRY_SERVICE_TYPE.to_string(),
                        method: invocation.method().to_string(),
                    }
                    .into()
                })
        };
        match invocation.method() {
            "register" => {
                self.registry.register(&url_arg()?).map_err(registration_error)?;
                Ok(RpcResult::ok(None))
            }
            "unregister" => {
                self.registry.unregister(&url_arg()?).map_err(registration_error)?;
                Ok(RpcResult::ok(None))
            }
            "lookup" => {
                let found = self.registry.lookup(&url_arg()?).map_err(registration_error)?;
                Ok(RpcResult::from_value(found))
            }
            other => Err(crate::dispatch::DispatchError::NoSuchMethod {
                type_name: REGISTRY_SERVICE_TYPE.to_string(),
                method: other.to_string(),
            }
            .into()),
        }
    }

    fn destroy(&self) {}
}

fn registration_error(source: RegistryError) -> RpcError {
    RpcError::Registration { source }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_category_inference() {
        assert_eq!(category_of(&url("local://h:1/s")), "providers");
        assert_eq!(category_of(&url("override://0.0.0.0/s?weight=1")), "configurators");
        assert_eq!(category_of(&url("condition://0.0.0.0/s")), "routers");
        assert_eq!(category_of(&url("empty://h/s?category=routers")), "routers");
    }

    #[test]
    fn test_url_matches_interface_and_category() {
        let sub = url("provider://10.0.0.1:20880/svc.Demo?category=configurators&check=false");
        assert!(url_matches(&sub, &url("override://0.0.0.0/svc.Demo?weight=200")));
        assert!(!url_matches(&sub, &url("override://0.0.0.0/other.Svc?weight=200")));
        // Provider URLs are not in the configurators category.
        assert!(!url_matches(&sub, &url("local://10.0.0.1:20880/svc.Demo")));
    }

    #[test]
    fn test_url_matches_group_version_wildcards() {
        let sub = url("consumer://c/svc.Demo?group=*");
        assert!(url_matches(&sub, &url("local://h:1/svc.Demo?group=a")));

        let sub = url("consumer://c/svc.Demo?group=a");
        assert!(url_matches(&sub, &url("local://h:1/svc.Demo?group=a")));
        assert!(!url_matches(&sub, &url("local://h:1/svc.Demo?group=b")));

        let sub = url("consumer://c/svc.Demo?version=1");
        assert!(!url_matches(&sub, &url("local://h:1/svc.Demo?version=2")));
    }

    #[test]
    fn test_adaptive_factory_dispatches_on_protocol() {
        let registry = ExtensionRegistry::new();
        let factory = registry.loader::<dyn RegistryFactory>().unwrap().adaptive().unwrap();
        let backend = factory.registry(&url("memory://127.0.0.1:2181")).unwrap();
        assert_eq!(backend.url().protocol(), "memory");

        let err = factory.registry(&url("nosuch://127.0.0.1:2181")).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Extension { source: ExtensionError::NoSuchExtension { .. } }
        ));
    }
}
