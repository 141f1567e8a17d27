//! In-memory registry: the default backend and the test double.
//!
//! Registrations and subscriptions live in process memory; every mutation
//! pushes the full matching snapshot (never a delta) to each affected
//! subscriber, with `empty://` placeholders for categories that emptied
//! out. That mirrors the notification contract of a real coordination
//! service closely enough for the integration layer not to know the
//! difference.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::constants::CATEGORY_KEY;
use crate::constants::PROVIDERS_CATEGORY;
use crate::extension::ExtensionError;
use crate::extension::ExtensionRegistry;
use crate::registry::NotifyListener;
use crate::registry::Registry;
use crate::registry::RegistryError;
use crate::registry::RegistryFactory;
use crate::registry::category_of;
use crate::registry::url_matches;
use crate::url::Url;

pub(crate) fn provide_factory(
    _: &Arc<ExtensionRegistry>,
) -> Result<Arc<dyn RegistryFactory>, ExtensionError> {
    Ok(Arc::new(MemoryRegistryFactory::new()))
}

/// Caches one [`MemoryRegistry`] per backend address.
pub struct MemoryRegistryFactory {
    registries: DashMap<String, Arc<dyn Registry>>,
}

impl MemoryRegistryFactory {
    pub fn new() -> Self {
        Self { registries: DashMap::new() }
    }
}

impl Default for MemoryRegistryFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryFactory for MemoryRegistryFactory {
    fn registry(&self, url: &Url) -> Result<Arc<dyn Registry>, RegistryError> {
        let key = url.address();
        let registry = self
            .registries
            .entry(key)
            .or_insert_with(|| Arc::new(MemoryRegistry::new(url.clone())) as Arc<dyn Registry>)
            .clone();
        Ok(registry)
    }
}

struct Subscription {
    url: Url,
    listener: Arc<dyn NotifyListener>,
}

/// The in-process registry.
pub struct MemoryRegistry {
    url: Url,
    registered: Mutex<Vec<Url>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MemoryRegistry {
    pub fn new(url: Url) -> Self {
        Self { url, registered: Mutex::new(Vec::new()), subscriptions: Mutex::new(Vec::new()) }
    }

    /// Snapshot for one subscription: all matching registrations, plus an
    /// `empty://` placeholder for each subscribed category without any.
    fn snapshot_for(&self, subscribe: &Url) -> Vec<Url> {
        let registered = self.registered.lock();
        let mut snapshot: Vec<Url> = Vec::new();
        let categories: Vec<&str> = subscribe
            .param_or(CATEGORY_KEY, PROVIDERS_CATEGORY)
            .split(',')
            .map(str::trim)
            .collect();
        for category in categories {
            let matching: Vec<Url> = registered
                .iter()
                .filter(|candidate| {
                    category_of(candidate) == category && url_matches(subscribe, candidate)
                })
                .cloned()
                .collect();
            if matching.is_empty() {
                snapshot.push(
                    Url::new(
                        crate::constants::EMPTY_PROTOCOL,
                        subscribe.host(),
                        0,
                        subscribe.service_interface(),
                        Default::default(),
                    )
                    .with_param(CATEGORY_KEY, category),
                );
            } else {
                snapshot.extend(matching);
            }
        }
        snapshot
    }

    /// Notify every subscriber whose interest covers `changed`.
    fn push_to_affected(&self, changed: &Url) {
        let affected: Vec<(Url, Arc<dyn NotifyListener>)> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| url_matches(&s.url, changed))
            .map(|s| (s.url.clone(), s.listener.clone()))
            .collect();
        for (subscribe, listener) in affected {
            let snapshot = self.snapshot_for(&subscribe);
            debug!(%subscribe, urls = snapshot.len(), "registry push");
            listener.notify(snapshot);
        }
    }
}

impl Registry for MemoryRegistry {
    fn url(&self) -> &Url {
        &self.url
    }

    fn register(&self, url: &Url) -> Result<(), RegistryError> {
        {
            let mut registered = self.registered.lock();
            if !registered.contains(url) {
                registered.push(url.clone());
            }
        }
        debug!(%url, "registered");
        self.push_to_affected(url);
        Ok(())
    }

    fn unregister(&self, url: &Url) -> Result<(), RegistryError> {
        self.registered.lock().retain(|u| u != url);
        debug!(%url, "unregistered");
        self.push_to_affected(url);
        Ok(())
    }

    fn subscribe(
        &self,
        url: &Url,
        listener: Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError> {
        self.subscriptions
            .lock()
            .push(Subscription { url: url.clone(), listener: listener.clone() });
        // First notification is the current snapshot.
        listener.notify(self.snapshot_for(url));
        Ok(())
    }

    fn unsubscribe(
        &self,
        url: &Url,
        listener: &Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError> {
        self.subscriptions
            .lock()
            .retain(|s| !(s.url == *url && Arc::ptr_eq(&s.listener, listener)));
        Ok(())
    }

    fn lookup(&self, url: &Url) -> Result<Vec<Url>, RegistryError> {
        Ok(self
            .registered
            .lock()
            .iter()
            .filter(|candidate| url_matches(url, candidate))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        notifications: Mutex<Vec<Vec<Url>>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self { notifications: Mutex::new(Vec::new()) })
        }

        fn last(&self) -> Vec<Url> {
            self.notifications.lock().last().cloned().unwrap_or_default()
        }

        fn count(&self) -> usize {
            self.notifications.lock().len()
        }
    }

    impl NotifyListener for Recorder {
        fn notify(&self, urls: Vec<Url>) {
            self.notifications.lock().push(urls);
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn registry() -> MemoryRegistry {
        MemoryRegistry::new(url("memory://127.0.0.1:2181"))
    }

    #[test]
    fn test_subscribe_gets_initial_snapshot() {
        let reg = registry();
        reg.register(&url("local://p1:1/svc.Demo")).unwrap();

        let recorder = Recorder::new();
        reg.subscribe(&url("consumer://c/svc.Demo?category=providers"), recorder.clone())
            .unwrap();

        assert_eq!(recorder.count(), 1);
        assert_eq!(recorder.last(), vec![url("local://p1:1/svc.Demo")]);
    }

    #[test]
    fn test_register_pushes_full_snapshot() {
        let reg = registry();
        let recorder = Recorder::new();
        reg.subscribe(&url("consumer://c/svc.Demo?category=providers"), recorder.clone())
            .unwrap();

        reg.register(&url("local://p1:1/svc.Demo")).unwrap();
        reg.register(&url("local://p2:1/svc.Demo")).unwrap();

        // Initial empty snapshot, then one per register; the last carries
        // the complete provider set.
        assert_eq!(recorder.count(), 3);
        assert_eq!(recorder.last().len(), 2);
    }

    #[test]
    fn test_empty_placeholder_per_category() {
        let reg = registry();
        let recorder = Recorder::new();
        reg.subscribe(
            &url("consumer://c/svc.Demo?category=providers,configurators"),
            recorder.clone(),
        )
        .unwrap();

        let snapshot = recorder.last();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|u| u.protocol() == "empty"));
        // The snapshot is never empty.
        reg.register(&url("local://p1:1/svc.Demo")).unwrap();
        let snapshot = recorder.last();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|u| u.protocol() == "local"));
        assert!(
            snapshot
                .iter()
                .any(|u| u.protocol() == "empty" && u.param("category") == Some("configurators"))
        );
    }

    #[test]
    fn test_unregister_pushes_empty_placeholder() {
        let reg = registry();
        let provider = url("local://p1:1/svc.Demo");
        reg.register(&provider).unwrap();

        let recorder = Recorder::new();
        reg.subscribe(&url("consumer://c/svc.Demo"), recorder.clone()).unwrap();
        reg.unregister(&provider).unwrap();

        let snapshot = recorder.last();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].protocol(), "empty");
    }

    #[test]
    fn test_unsubscribed_listener_stops_receiving() {
        let reg = registry();
        let recorder = Recorder::new();
        let sub = url("consumer://c/svc.Demo");
        let as_listener: Arc<dyn NotifyListener> = recorder.clone();
        reg.subscribe(&sub, as_listener.clone()).unwrap();
        reg.unsubscribe(&sub, &as_listener).unwrap();

        reg.register(&url("local://p1:1/svc.Demo")).unwrap();
        assert_eq!(recorder.count(), 1); // initial snapshot only
    }

    #[test]
    fn test_other_services_not_notified() {
        let reg = registry();
        let recorder = Recorder::new();
        reg.subscribe(&url("consumer://c/svc.Demo"), recorder.clone()).unwrap();

        reg.register(&url("local://p1:1/other.Svc")).unwrap();
        assert_eq!(recorder.count(), 1);
    }

    #[test]
    fn test_factory_caches_per_address() {
        let factory = MemoryRegistryFactory::new();
        let a = factory.registry(&url("memory://127.0.0.1:2181")).unwrap();
        let b = factory.registry(&url("memory://127.0.0.1:2181?registry=memory")).unwrap();
        let c = factory.registry(&url("memory://127.0.0.1:2182")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_lookup_matches_subscription_semantics() {
        let reg = registry();
        reg.register(&url("local://p1:1/svc.Demo")).unwrap();
        reg.register(&url("local://p2:1/other.Svc")).unwrap();

        let found = reg.lookup(&url("consumer://c/svc.Demo")).unwrap();
        assert_eq!(found, vec![url("local://p1:1/svc.Demo")]);
    }
}
