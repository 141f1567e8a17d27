//! Registry-backed directory: the live replica set for one service key.
//!
//! Subscribed with `category=providers,configurators,routers`. Every
//! notification is partitioned by category: configurator URLs replace the
//! configurator list, router URLs replace the dynamic routers, provider
//! URLs drive the invoker refresh. Refresh merges each provider URL through
//! the configurator fold, materializes invokers via the adaptive protocol
//! (reusing unchanged ones), destroys stale invokers, and swaps the
//! snapshot atomically so a concurrent `list` never sees a torn set.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cluster::Configurator;
use crate::cluster::Directory;
use crate::cluster::RouterChain;
use crate::cluster::configurator::apply_configurators;
use crate::cluster::configurator::to_configurators;
use crate::cluster::router::routers_from_urls;
use crate::config::DynamicConfiguration;
use crate::constants::CHECK_KEY;
use crate::constants::CONFIGURATORS_CATEGORY;
use crate::constants::EMPTY_PROTOCOL;
use crate::constants::PROVIDERS_CATEGORY;
use crate::constants::ROUTERS_CATEGORY;
use crate::extension::ExtensionRegistry;
use crate::registry::NotifyListener;
use crate::registry::Registry;
use crate::registry::category_of;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::Protocol;
use crate::rpc::RpcError;
use crate::rpc::error::SubscriptionSnafu;
use crate::url::Url;

use snafu::ResultExt;

/// Dynamic set of invokers for one service key, kept current by registry
/// notifications.
pub struct RegistryDirectory {
    service: String,
    url: Url,
    registry: Arc<dyn Registry>,
    protocol: Arc<dyn Protocol>,
    ext: Weak<ExtensionRegistry>,
    self_ref: Weak<RegistryDirectory>,

    router_chain: RwLock<Option<Arc<RouterChain>>>,
    configurators: Mutex<Vec<Arc<dyn Configurator>>>,
    /// Current snapshot, swapped wholesale on refresh.
    invokers: ArcSwap<Vec<Arc<dyn Invoker>>>,
    /// Merged-URL → invoker; also serializes refresh against itself.
    invoker_map: Mutex<HashMap<String, Arc<dyn Invoker>>>,
    /// Last provider snapshot, replayed when configurators change.
    cached_provider_urls: Mutex<Vec<Url>>,

    subscribe_url: Mutex<Option<Url>>,
    registered_consumer_url: Mutex<Option<Url>>,
    forbidden: AtomicBool,
    destroyed: AtomicBool,
}

impl RegistryDirectory {
    pub fn new(
        service: impl Into<String>,
        url: Url,
        registry: Arc<dyn Registry>,
        protocol: Arc<dyn Protocol>,
        ext: &Arc<ExtensionRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            service: service.into(),
            url,
            registry,
            protocol,
            ext: Arc::downgrade(ext),
            self_ref: self_ref.clone(),
            router_chain: RwLock::new(None),
            configurators: Mutex::new(Vec::new()),
            invokers: ArcSwap::from_pointee(Vec::new()),
            invoker_map: Mutex::new(HashMap::new()),
            cached_provider_urls: Mutex::new(Vec::new()),
            subscribe_url: Mutex::new(None),
            registered_consumer_url: Mutex::new(None),
            forbidden: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Build the router chain from the consumer URL.
    pub fn build_router_chain(&self, url: &Url) -> Result<(), RpcError> {
        let Some(ext) = self.ext.upgrade() else {
            return Ok(());
        };
        let config: Arc<dyn DynamicConfiguration> =
            ext.loader::<dyn DynamicConfiguration>()?.default_extension()?;
        *self.router_chain.write() = Some(Arc::new(RouterChain::build(url, &config)));
        Ok(())
    }

    /// Record the consumer URL registered on refer, for cleanup on destroy.
    pub fn set_registered_consumer_url(&self, url: Url) {
        *self.registered_consumer_url.lock() = Some(url);
    }

    /// Subscribe this directory to its registry. Idempotent.
    pub fn subscribe(self: &Arc<Self>, url: Url) -> Result<(), RpcError> {
        {
            let mut slot = self.subscribe_url.lock();
            if slot.is_some() {
                return Ok(());
            }
            *slot = Some(url.clone());
        }
        let listener: Arc<dyn NotifyListener> = self.clone();
        self.registry.subscribe(&url, listener).context(SubscriptionSnafu)?;
        Ok(())
    }

    /// Current invoker count (post-refresh, pre-routing).
    pub fn invoker_count(&self) -> usize {
        self.invokers.load().len()
    }

    fn refresh_invokers(&self, provider_urls: &[Url]) {
        // One refresh at a time; `list` keeps reading the old snapshot.
        let mut invoker_map = self.invoker_map.lock();

        let only_empty = provider_urls.len() == 1
            && provider_urls[0].protocol() == EMPTY_PROTOCOL;
        if only_empty {
            if !invoker_map.is_empty() {
                info!(service = self.service.as_str(), "provider set emptied; forbidding access");
            }
            self.forbidden.store(true, Ordering::SeqCst);
            for invoker in invoker_map.values() {
                invoker.destroy();
            }
            invoker_map.clear();
            self.invokers.store(Arc::new(Vec::new()));
            return;
        }

        self.forbidden.store(false, Ordering::SeqCst);
        let configurators = self.configurators.lock().clone();

        let mut next: HashMap<String, Arc<dyn Invoker>> = HashMap::new();
        let mut ordered: Vec<Arc<dyn Invoker>> = Vec::new();
        for provider_url in provider_urls {
            if provider_url.protocol() == EMPTY_PROTOCOL {
                continue;
            }
            let merged = self.merge_provider_url(provider_url, &configurators);
            let key = merged.to_string();
            if next.contains_key(&key) {
                // Duplicates by URL are disallowed.
                continue;
            }
            if let Some(existing) = invoker_map.get(&key) {
                ordered.push(existing.clone());
                next.insert(key, existing.clone());
                continue;
            }
            match self.protocol.refer(&self.service, &merged) {
                Ok(invoker) => {
                    debug!(provider = %merged, "materialized provider invoker");
                    next.insert(key, invoker.clone());
                    ordered.push(invoker);
                }
                Err(error) => {
                    warn!(provider = %merged, error = %error, "failed to refer provider");
                }
            }
        }

        let mut destroyed = 0usize;
        for (key, invoker) in invoker_map.iter() {
            if !next.contains_key(key) {
                invoker.destroy();
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            debug!(service = self.service.as_str(), destroyed, "destroyed stale invokers");
        }

        *invoker_map = next;
        self.invokers.store(Arc::new(ordered));
    }

    /// Provider URL as the consumer should see it: configurator fold plus
    /// the subscription-side `check=false`.
    fn merge_provider_url(&self, provider_url: &Url, configurators: &[Arc<dyn Configurator>]) -> Url {
        let merged = apply_configurators(configurators, provider_url.clone());
        merged.with_param(CHECK_KEY, "false")
    }
}

impl NotifyListener for RegistryDirectory {
    fn notify(&self, urls: Vec<Url>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let mut provider_urls: Vec<Url> = Vec::new();
        let mut configurator_urls: Vec<Url> = Vec::new();
        let mut router_urls: Vec<Url> = Vec::new();
        for url in urls {
            match category_of(&url) {
                CONFIGURATORS_CATEGORY => configurator_urls.push(url),
                ROUTERS_CATEGORY => router_urls.push(url),
                PROVIDERS_CATEGORY => provider_urls.push(url),
                other => {
                    debug!(category = other, %url, "ignoring notification category");
                }
            }
        }

        if !configurator_urls.is_empty() {
            if let Some(next) = to_configurators(&configurator_urls) {
                *self.configurators.lock() = next;
            }
        }

        if !router_urls.is_empty() {
            let has_clear = router_urls.iter().any(|u| u.protocol() == EMPTY_PROTOCOL);
            let routers = routers_from_urls(&router_urls);
            if let Some(chain) = self.router_chain.read().as_ref() {
                if has_clear || !routers.is_empty() {
                    chain.replace_dynamic(routers);
                }
            }
        }

        if !provider_urls.is_empty() {
            *self.cached_provider_urls.lock() = provider_urls.clone();
            self.refresh_invokers(&provider_urls);
        } else if !configurator_urls.is_empty() {
            // A configurator-only push still reshapes the provider URLs.
            let cached = self.cached_provider_urls.lock().clone();
            if !cached.is_empty() {
                self.refresh_invokers(&cached);
            }
        }
    }
}

impl Directory for RegistryDirectory {
    fn url(&self) -> &Url {
        &self.url
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn list(&self, invocation: &Invocation) -> Result<Vec<Arc<dyn Invoker>>, RpcError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RpcError::Destroyed { service: self.service.clone() });
        }
        if self.forbidden.load(Ordering::SeqCst) {
            return Err(RpcError::Forbidden { service: self.service.clone() });
        }
        let snapshot = self.invokers.load_full();
        let invokers = (*snapshot).clone();
        match self.router_chain.read().as_ref() {
            Some(chain) => Ok(chain.route(invokers, &self.url, invocation)),
            None => Ok(invokers),
        }
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
            && !self.forbidden.load(Ordering::SeqCst)
            && self.invokers.load().iter().any(|i| i.is_available())
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registered) = self.registered_consumer_url.lock().take() {
            if let Err(error) = self.registry.unregister(&registered) {
                warn!(error = %error, "failed to unregister consumer URL");
            }
        }
        if let Some(subscribe_url) = self.subscribe_url.lock().take() {
            if let Some(me) = self.self_ref.upgrade() {
                let listener: Arc<dyn NotifyListener> = me;
                if let Err(error) = self.registry.unsubscribe(&subscribe_url, &listener) {
                    warn!(error = %error, "failed to cancel registry subscription");
                }
            }
        }
        let mut invoker_map = self.invoker_map.lock();
        for invoker in invoker_map.values() {
            invoker.destroy();
        }
        invoker_map.clear();
        self.invokers.store(Arc::new(Vec::new()));
        info!(service = self.service.as_str(), "directory destroyed");
    }
}
