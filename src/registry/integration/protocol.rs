//! The registry protocol: registry-aware export and refer.
//!
//! # Export
//! The incoming invoker advertises a `registry://` URL whose `export`
//! parameter nests the real provider URL. Export rewrites the registry URL
//! to its backend, folds the application- and service-scoped configurators
//! into the provider URL, exports locally exactly once per cache key
//! (through the adaptive protocol), registers the allowlisted provider URL,
//! and subscribes an override listener that re-exports on rule changes.
//!
//! # Refer
//! Builds a [`RegistryDirectory`] subscribed to
//! `providers,configurators,routers`, registers the consumer, and joins the
//! directory through the URL-selected cluster (mergeable when the consumer
//! asks for several groups).

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cluster::Cluster;
use crate::cluster::Configurator;
use crate::cluster::configurator::apply_configurators;
use crate::cluster::configurator::to_configurators;
use crate::config::DynamicConfiguration;
use crate::constants::ANY_VALUE;
use crate::constants::APPLICATION_KEY;
use crate::constants::CATEGORY_KEY;
use crate::constants::CHECK_KEY;
use crate::constants::CLUSTER_KEY;
use crate::constants::CONFIGURATORS_CATEGORY;
use crate::constants::CONFIGURATORS_SUFFIX;
use crate::constants::CONSUMERS_CATEGORY;
use crate::constants::CONSUMER_PROTOCOL;
use crate::constants::DEFAULT_REGISTRY;
use crate::constants::DEFAULT_SHUTDOWN_TIMEOUT_MS;
use crate::constants::EXPORT_KEY;
use crate::constants::EXTRA_KEYS_KEY;
use crate::constants::GROUP_KEY;
use crate::constants::INTERFACE_KEY;
use crate::constants::LOADBALANCE_KEY;
use crate::constants::METHODS_KEY;
use crate::constants::MOCK_KEY;
use crate::constants::PROVIDERS_CATEGORY;
use crate::constants::PROVIDER_PROTOCOL;
use crate::constants::REFER_KEY;
use crate::constants::REGISTER_KEY;
use crate::constants::REGISTRY_KEY;
use crate::constants::REGISTRY_PROTOCOL;
use crate::constants::REGISTRY_PROTOCOL_PORT;
use crate::constants::REGISTRY_SERVICE_TYPE;
use crate::constants::ROUTERS_CATEGORY;
use crate::constants::SHUTDOWN_TIMEOUT_KEY;
use crate::constants::SIDE_KEY;
use crate::constants::TIMEOUT_KEY;
use crate::constants::VERSION_KEY;
use crate::extension::ExtensionError;
use crate::extension::ExtensionRegistry;
use crate::registry::NotifyListener;
use crate::registry::Registry;
use crate::registry::RegistryFactory;
use crate::registry::RegistryServiceInvoker;
use crate::registry::integration::directory::RegistryDirectory;
use crate::registry::integration::listener::ConfiguratorListener;
use crate::registry::url_matches;
use crate::rpc::Exporter;
use crate::rpc::Invoker;
use crate::rpc::InvokerDelegate;
use crate::rpc::Protocol;
use crate::rpc::RpcError;
use crate::rpc::error::ExportMissingSnafu;
use crate::rpc::error::RegistrationSnafu;
use crate::rpc::error::SubscriptionSnafu;
use crate::url::Url;

/// Application name assumed when a provider URL names none.
const DEFAULT_APPLICATION: &str = "application";

/// The registered-parameter allowlist: what a provider registration
/// advertises. Behavioral knobs applied locally (such as `weight`) stay
/// off the registry so overriding them never churns registrations.
const DEFAULT_REGISTER_PROVIDER_KEYS: [&str; 9] = [
    APPLICATION_KEY,
    GROUP_KEY,
    VERSION_KEY,
    METHODS_KEY,
    TIMEOUT_KEY,
    CLUSTER_KEY,
    LOADBALANCE_KEY,
    MOCK_KEY,
    SIDE_KEY,
];

/// Provider entry point used by the `Protocol` manifest; wires the
/// configuration backend in through the registry handle.
pub(crate) fn provide_registry_protocol(
    registry: &Arc<ExtensionRegistry>,
) -> Result<Arc<dyn Protocol>, ExtensionError> {
    let config = registry.loader::<dyn DynamicConfiguration>()?.default_extension()?;
    Ok(RegistryProtocol::new(registry, config))
}

/// The composite registry-aware protocol.
pub struct RegistryProtocol {
    ext: Weak<ExtensionRegistry>,
    self_ref: Weak<RegistryProtocol>,
    config: Arc<dyn DynamicConfiguration>,

    /// Cache key → live local export slot; at most one per key.
    bounds: DashMap<String, Arc<ChangeableExporter>>,
    /// Override subscription URL → listener, one per export.
    override_listeners: DashMap<Url, Arc<OverrideListener>>,
    /// Service key → service-scoped configurator listener.
    service_config_listeners: DashMap<String, Arc<ConfiguratorListener>>,
    /// Application → app-scoped configurator listener, created on first
    /// export for that application.
    provider_config_listeners: DashMap<String, Arc<ConfiguratorListener>>,
}

impl RegistryProtocol {
    pub fn new(
        ext: &Arc<ExtensionRegistry>,
        config: Arc<dyn DynamicConfiguration>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            ext: Arc::downgrade(ext),
            self_ref: self_ref.clone(),
            config,
            bounds: DashMap::new(),
            override_listeners: DashMap::new(),
            service_config_listeners: DashMap::new(),
            provider_config_listeners: DashMap::new(),
        })
    }

    fn ext(&self) -> Result<Arc<ExtensionRegistry>, RpcError> {
        self.ext.upgrade().ok_or_else(|| RpcError::Network {
            target: "registry-protocol".to_string(),
            message: "extension registry dropped".to_string(),
        })
    }

    fn adaptive_protocol(&self) -> Result<Arc<dyn Protocol>, RpcError> {
        Ok(self.ext()?.loader::<dyn Protocol>()?.adaptive()?)
    }

    fn registry_for(&self, registry_url: &Url) -> Result<Arc<dyn Registry>, RpcError> {
        let factory = self.ext()?.loader::<dyn RegistryFactory>()?.adaptive()?;
        factory.registry(registry_url).context(RegistrationSnafu)
    }

    /// Rewrite a `registry://` URL to its backend protocol.
    fn registry_url(invoker_url: &Url) -> Url {
        if invoker_url.protocol() == REGISTRY_PROTOCOL {
            let backend = invoker_url.param_or(REGISTRY_KEY, DEFAULT_REGISTRY).to_string();
            invoker_url.with_protocol(backend).without_param(REGISTRY_KEY)
        } else {
            invoker_url.clone()
        }
    }

    /// The nested provider URL carried by the `export` parameter.
    fn provider_url_of(invoker_url: &Url) -> Result<Url, RpcError> {
        match invoker_url.url_param(EXPORT_KEY) {
            Some(Ok(url)) => Ok(url),
            Some(Err(source)) => Err(source.into()),
            None => ExportMissingSnafu { url: invoker_url.to_string() }.fail(),
        }
    }

    /// Provider URL rewritten for the override subscription.
    fn override_subscribe_url(provider_url: &Url) -> Url {
        provider_url.with_protocol(PROVIDER_PROTOCOL).with_params([
            (CATEGORY_KEY, CONFIGURATORS_CATEGORY),
            (CHECK_KEY, "false"),
        ])
    }

    /// The URL actually registered: the provider URL filtered to the
    /// registered-parameter allowlist, extendable per registry via
    /// `extra-keys`.
    fn registered_provider_url(provider_url: &Url, registry_url: &Url) -> Url {
        let mut keep: Vec<&str> = DEFAULT_REGISTER_PROVIDER_KEYS.to_vec();
        let extra = registry_url.param_or(EXTRA_KEYS_KEY, "").to_string();
        for key in extra.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            keep.push(key);
        }
        // Keep the interface parameter when the path differs from it, so
        // the registry still groups by interface.
        if provider_url.path() != provider_url.param_or(INTERFACE_KEY, provider_url.path()) {
            keep.push(INTERFACE_KEY);
        }
        provider_url.retaining_params(&keep)
    }

    /// Fold the app-scoped then the service-scoped configurators into a
    /// provider URL, creating (and registering) the listeners on first use.
    fn override_with_config(
        &self,
        provider_url: &Url,
        export_listener: &Arc<OverrideListener>,
    ) -> Url {
        let app = provider_url.param_or(APPLICATION_KEY, DEFAULT_APPLICATION).to_string();
        let app_listener = self
            .provider_config_listeners
            .entry(app.clone())
            .or_insert_with(|| {
                let me = self.self_ref.clone();
                ConfiguratorListener::bind(
                    format!("{app}{CONFIGURATORS_SUFFIX}"),
                    &self.config,
                    Box::new(move || {
                        if let Some(protocol) = me.upgrade() {
                            protocol.notify_all_overrides();
                        }
                    }),
                )
            })
            .clone();
        let url = app_listener.fold(provider_url.clone());

        let service_key = provider_url.service_key();
        let export_listener = Arc::downgrade(export_listener);
        let service_listener = ConfiguratorListener::bind(
            format!("{service_key}{CONFIGURATORS_SUFFIX}"),
            &self.config,
            Box::new(move || {
                if let Some(listener) = export_listener.upgrade() {
                    listener.do_override_if_necessary();
                }
            }),
        );
        self.service_config_listeners.insert(service_key, service_listener.clone());
        service_listener.fold(url)
    }

    /// App-scoped rules fan out to every export's override listener.
    fn notify_all_overrides(&self) {
        let listeners: Vec<Arc<OverrideListener>> =
            self.override_listeners.iter().map(|e| e.value().clone()).collect();
        for listener in listeners {
            listener.do_override_if_necessary();
        }
    }

    /// Export locally through the adaptive protocol, at most once per cache
    /// key; the slot wrapper lets reexport swap the underlying exporter
    /// without changing the caller's handle.
    fn do_local_export(
        &self,
        origin: &Arc<dyn Invoker>,
        provider_url: &Url,
        cache_key: &str,
    ) -> Result<Arc<ChangeableExporter>, RpcError> {
        use dashmap::mapref::entry::Entry;
        match self.bounds.entry(cache_key.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let delegate: Arc<dyn Invoker> =
                    Arc::new(InvokerDelegate::new(origin.clone(), provider_url.clone()));
                let inner = self.adaptive_protocol()?.export(delegate)?;
                let exporter = Arc::new(ChangeableExporter {
                    protocol: self.self_ref.clone(),
                    origin: origin.clone(),
                    cache_key: cache_key.to_string(),
                    service_key: provider_url.service_key(),
                    shutdown_timeout_ms: origin
                        .url()
                        .u64_param(SHUTDOWN_TIMEOUT_KEY, DEFAULT_SHUTDOWN_TIMEOUT_MS),
                    inner: Mutex::new(inner),
                    registry: Mutex::new(None),
                    register_url: Mutex::new(None),
                    subscribe_url: Mutex::new(None),
                    unexported: AtomicBool::new(false),
                });
                entry.insert(exporter.clone());
                Ok(exporter)
            }
        }
    }

    /// Swap the local export and reconcile the registration after an
    /// override changed the effective provider URL.
    fn re_export(&self, origin: &Arc<dyn Invoker>, new_url: &Url) -> Result<(), RpcError> {
        let cache_key = Self::provider_url_of(origin.url())?.cache_key();
        let Some(exporter) = self.bounds.get(&cache_key).map(|e| e.value().clone()) else {
            warn!(cache_key = cache_key.as_str(), "reexport requested but no local export exists");
            return Ok(());
        };

        let delegate: Arc<dyn Invoker> =
            Arc::new(InvokerDelegate::new(origin.clone(), new_url.clone()));
        let new_inner = self.adaptive_protocol()?.export(delegate)?;
        exporter.swap_inner(new_inner);

        let registry_url = Self::registry_url(origin.url());
        let new_registered = Self::registered_provider_url(new_url, &registry_url);
        let previous = exporter.register_url.lock().clone();
        if let Some(previous) = previous {
            if previous != new_registered {
                let registry = exporter.registry.lock().clone();
                if let Some(registry) = registry {
                    registry.unregister(&previous).context(RegistrationSnafu)?;
                    registry.register(&new_registered).context(RegistrationSnafu)?;
                    *exporter.register_url.lock() = Some(new_registered);
                }
            }
        }
        Ok(())
    }
}

impl Protocol for RegistryProtocol {
    fn export(&self, origin: Arc<dyn Invoker>) -> Result<Arc<dyn Exporter>, RpcError> {
        let registry_url = Self::registry_url(origin.url());
        let provider_url = Self::provider_url_of(origin.url())?;
        let cache_key = provider_url.cache_key();

        let subscribe_url = Self::override_subscribe_url(&provider_url);
        let listener = Arc::new(OverrideListener {
            subscribe_url: subscribe_url.clone(),
            origin: origin.clone(),
            protocol: self.self_ref.clone(),
            configurators: Mutex::new(Vec::new()),
        });
        self.override_listeners.insert(subscribe_url.clone(), listener.clone());

        let merged_url = self.override_with_config(&provider_url, &listener);
        let exporter = self.do_local_export(&origin, &merged_url, &cache_key)?;

        let registry = self.registry_for(&registry_url)?;
        *exporter.registry.lock() = Some(registry.clone());
        *exporter.subscribe_url.lock() = Some(subscribe_url.clone());

        let registered_url = Self::registered_provider_url(&merged_url, &registry_url);
        if registered_url.bool_param(REGISTER_KEY, true) {
            registry.register(&registered_url).context(RegistrationSnafu)?;
            *exporter.register_url.lock() = Some(registered_url.clone());
            info!(provider = %registered_url, "provider registered");
        }

        let as_notify: Arc<dyn NotifyListener> = listener;
        registry.subscribe(&subscribe_url, as_notify).context(SubscriptionSnafu)?;

        Ok(exporter)
    }

    fn refer(&self, service: &str, url: &Url) -> Result<Arc<dyn Invoker>, RpcError> {
        let registry_url = Self::registry_url(url);
        let registry = self.registry_for(&registry_url)?;

        if service == REGISTRY_SERVICE_TYPE {
            return Ok(Arc::new(RegistryServiceInvoker::new(registry, registry_url)));
        }

        let refer_params = match url.param(REFER_KEY) {
            Some(query) => Url::parse_query(query)?,
            None => Default::default(),
        };
        let group = refer_params.get(GROUP_KEY).map(String::as_str).unwrap_or("");
        let ext = self.ext()?;
        let cluster: Arc<dyn Cluster> = if group.contains(',') || group == ANY_VALUE {
            ext.loader::<dyn Cluster>()?.get("mergeable")?
        } else {
            ext.loader::<dyn Cluster>()?.adaptive()?
        };

        let consumer_url =
            Url::new(CONSUMER_PROTOCOL, url.host(), 0, service, refer_params);

        let directory = RegistryDirectory::new(
            service,
            consumer_url.clone(),
            registry.clone(),
            self.adaptive_protocol()?,
            &ext,
        );
        directory.build_router_chain(&consumer_url)?;

        if service != ANY_VALUE && consumer_url.bool_param(REGISTER_KEY, true) {
            let registered_consumer = consumer_url.with_params([
                (CATEGORY_KEY, CONSUMERS_CATEGORY),
                (CHECK_KEY, "false"),
            ]);
            registry.register(&registered_consumer).context(RegistrationSnafu)?;
            directory.set_registered_consumer_url(registered_consumer);
        }

        let categories =
            format!("{PROVIDERS_CATEGORY},{CONFIGURATORS_CATEGORY},{ROUTERS_CATEGORY}");
        directory.subscribe(consumer_url.with_param(CATEGORY_KEY, categories))?;

        debug!(service, consumer = %consumer_url, "consumer referred");
        cluster.join(directory)
    }

    fn destroy(&self) {
        let exporters: Vec<Arc<ChangeableExporter>> =
            self.bounds.iter().map(|e| e.value().clone()).collect();
        for exporter in exporters {
            exporter.unexport();
        }
        self.bounds.clear();
        let apps: Vec<String> =
            self.provider_config_listeners.iter().map(|e| e.key().clone()).collect();
        for app in apps {
            if let Some((_, listener)) = self.provider_config_listeners.remove(&app) {
                listener.unbind(&self.config);
            }
        }
    }

    fn default_port(&self) -> u16 {
        REGISTRY_PROTOCOL_PORT
    }
}

/// Per-export override listener: keeps the pushed configurators and
/// re-exports when they change the effective URL. `notify` and the
/// reexport path are serialized by the configurator lock.
struct OverrideListener {
    subscribe_url: Url,
    origin: Arc<dyn Invoker>,
    protocol: Weak<RegistryProtocol>,
    configurators: Mutex<Vec<Arc<dyn Configurator>>>,
}

impl OverrideListener {
    fn do_override_if_necessary(&self) {
        let configurators = self.configurators.lock();
        self.do_override_with(&configurators);
    }

    /// Recompute `service ∘ app ∘ listener` over the original provider URL
    /// and swap the local export when the result changed.
    fn do_override_with(&self, listener_configurators: &[Arc<dyn Configurator>]) {
        let Some(protocol) = self.protocol.upgrade() else {
            return;
        };
        let origin_url = match RegistryProtocol::provider_url_of(self.origin.url()) {
            Ok(url) => url,
            Err(error) => {
                warn!(error = %error, "override listener cannot recover the provider URL");
                return;
            }
        };
        let cache_key = origin_url.cache_key();
        let Some(exporter) = protocol.bounds.get(&cache_key).map(|e| e.value().clone()) else {
            warn!(cache_key = cache_key.as_str(), "override arrived for a service with no local export");
            return;
        };

        let current_url = exporter.current_url();
        let mut new_url = apply_configurators(listener_configurators, origin_url.clone());
        let app = origin_url.param_or(APPLICATION_KEY, DEFAULT_APPLICATION).to_string();
        if let Some(app_listener) = protocol.provider_config_listeners.get(&app) {
            new_url = app_listener.fold(new_url);
        }
        if let Some(service_listener) =
            protocol.service_config_listeners.get(&origin_url.service_key())
        {
            new_url = service_listener.fold(new_url);
        }

        if current_url != new_url {
            match protocol.re_export(&self.origin, &new_url) {
                Ok(()) => info!(old = %current_url, new = %new_url, "provider re-exported"),
                Err(error) => warn!(error = %error, "reexport after override failed"),
            }
        }
    }
}

impl NotifyListener for OverrideListener {
    fn notify(&self, urls: Vec<Url>) {
        let matched: Vec<Url> =
            urls.into_iter().filter(|u| url_matches(&self.subscribe_url, u)).collect();
        if matched.is_empty() {
            return;
        }
        let mut configurators = self.configurators.lock();
        if let Some(next) = to_configurators(&matched) {
            *configurators = next;
        }
        self.do_override_with(&configurators);
    }
}

/// The mutable export slot behind a cache key. Reexport swaps the inner
/// exporter; the handle returned to the caller never changes.
struct ChangeableExporter {
    protocol: Weak<RegistryProtocol>,
    origin: Arc<dyn Invoker>,
    cache_key: String,
    service_key: String,
    shutdown_timeout_ms: u64,
    inner: Mutex<Arc<dyn Exporter>>,
    registry: Mutex<Option<Arc<dyn Registry>>>,
    register_url: Mutex<Option<Url>>,
    subscribe_url: Mutex<Option<Url>>,
    unexported: AtomicBool,
}

impl ChangeableExporter {
    fn current_url(&self) -> Url {
        self.inner.lock().invoker().url().clone()
    }

    /// Replace the inner exporter; the old one is destroyed after the
    /// grace period so in-flight consumers drain first.
    fn swap_inner(&self, new_inner: Arc<dyn Exporter>) {
        let old = std::mem::replace(&mut *self.inner.lock(), new_inner);
        schedule_grace_unexport(old, None, self.shutdown_timeout_ms);
    }
}

impl Exporter for ChangeableExporter {
    fn invoker(&self) -> Arc<dyn Invoker> {
        self.inner.lock().invoker()
    }

    fn unexport(&self) {
        if self.unexported.swap(true, Ordering::SeqCst) {
            return;
        }

        // 1. Leave the protocol's export cache.
        let protocol = self.protocol.upgrade();
        if let Some(protocol) = &protocol {
            protocol.bounds.remove(&self.cache_key);
        }

        // 2. Withdraw the registration.
        let registry = self.registry.lock().clone();
        if let (Some(registry), Some(registered)) = (&registry, self.register_url.lock().clone())
        {
            if let Err(error) = registry.unregister(&registered) {
                warn!(error = %error, "unregister on unexport failed");
            }
        }

        // 3. Drop the override subscription and the service-scoped rule
        //    listener.
        if let Some(subscribe_url) = self.subscribe_url.lock().take() {
            if let Some(protocol) = &protocol {
                if let Some((_, listener)) = protocol.override_listeners.remove(&subscribe_url) {
                    if let Some(registry) = &registry {
                        let as_notify: Arc<dyn NotifyListener> = listener;
                        if let Err(error) = registry.unsubscribe(&subscribe_url, &as_notify) {
                            warn!(error = %error, "unsubscribe on unexport failed");
                        }
                    }
                }
                if let Some((_, listener)) =
                    protocol.service_config_listeners.remove(&self.service_key)
                {
                    listener.unbind(&protocol.config);
                }
            }
        }

        // 4. Destroy the local endpoint after the grace period, on a
        //    dedicated single-task executor.
        let inner = self.inner.lock().clone();
        schedule_grace_unexport(inner, Some(self.origin.clone()), self.shutdown_timeout_ms);
    }
}

/// Unexport (and optionally destroy the origin invoker) on a dedicated
/// thread after the shutdown grace period.
fn schedule_grace_unexport(
    exporter: Arc<dyn Exporter>,
    origin: Option<Arc<dyn Invoker>>,
    timeout_ms: u64,
) {
    let task = move || {
        if timeout_ms > 0 {
            info!(timeout_ms, "waiting for consumers before destroying local export");
            std::thread::sleep(Duration::from_millis(timeout_ms));
        }
        exporter.unexport();
        if let Some(origin) = origin {
            origin.destroy();
        }
    };
    if let Err(error) =
        std::thread::Builder::new().name("exporter-unexport".to_string()).spawn(task)
    {
        warn!(error = %error, "failed to spawn the unexport executor");
    }
}
