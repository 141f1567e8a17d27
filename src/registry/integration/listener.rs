//! Configuration listeners: rule key → live configurator list.
//!
//! One listener binds to one rule key (application or service scope). It
//! seeds from the current rule, replaces its list on ADDED/MODIFIED,
//! clears on DELETED, and keeps the prior list when a payload fails to
//! parse (fail-open). After every accepted change it invokes its
//! `on_change` hook, which the registry protocol wires to the override
//! listeners of the affected exports.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;
use tracing::info;

use crate::cluster::Configurator;
use crate::cluster::configurator::apply_configurators;
use crate::cluster::configurator::parse_rule;
use crate::cluster::configurator::to_configurators;
use crate::config::ConfigChangeEvent;
use crate::config::ConfigChangeType;
use crate::config::ConfigurationListener;
use crate::config::DEFAULT_RULE_GROUP;
use crate::config::DynamicConfiguration;
use crate::url::Url;

type OnChange = Box<dyn Fn() + Send + Sync>;

/// A configurator list kept current by one dynamic-configuration rule key.
pub struct ConfiguratorListener {
    key: String,
    configurators: Mutex<Vec<Arc<dyn Configurator>>>,
    on_change: OnChange,
}

impl ConfiguratorListener {
    /// Bind to `key`: register with the configuration backend and seed from
    /// the current rule, without firing `on_change`.
    pub fn bind(
        key: String,
        config: &Arc<dyn DynamicConfiguration>,
        on_change: OnChange,
    ) -> Arc<Self> {
        let listener = Arc::new(Self {
            key: key.clone(),
            configurators: Mutex::new(Vec::new()),
            on_change,
        });
        config.add_listener(&key, listener.clone());
        if let Some(raw) = config.rule(&key, DEFAULT_RULE_GROUP) {
            listener.apply(&raw);
        }
        listener
    }

    /// Detach from the configuration backend.
    pub fn unbind(self: &Arc<Self>, config: &Arc<dyn DynamicConfiguration>) {
        let as_listener: Arc<dyn ConfigurationListener> = self.clone();
        config.remove_listener(&self.key, &as_listener);
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The current rule set (a copy; application is a left fold).
    pub fn configurators(&self) -> Vec<Arc<dyn Configurator>> {
        self.configurators.lock().clone()
    }

    /// Apply the current rule set to a URL.
    pub fn fold(&self, url: Url) -> Url {
        apply_configurators(&self.configurators.lock(), url)
    }

    /// Parse and install a raw rule. Returns false (keeping the prior list)
    /// when the payload does not parse.
    fn apply(&self, raw: &str) -> bool {
        let urls = match parse_rule(raw) {
            Ok(urls) => urls,
            Err(source) => {
                error!(
                    key = self.key.as_str(),
                    error = %source,
                    "configurator rule failed to parse; keeping previous rules"
                );
                return false;
            }
        };
        if let Some(next) = to_configurators(&urls) {
            info!(key = self.key.as_str(), rules = next.len(), "configurator rules replaced");
            *self.configurators.lock() = next;
        }
        true
    }
}

impl ConfigurationListener for ConfiguratorListener {
    fn process(&self, event: ConfigChangeEvent) {
        match event.change_type {
            ConfigChangeType::Deleted => {
                self.configurators.lock().clear();
            }
            ConfigChangeType::Added | ConfigChangeType::Modified => {
                if !self.apply(&event.content) {
                    return;
                }
            }
        }
        (self.on_change)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfiguration;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    fn setup() -> (Arc<dyn DynamicConfiguration>, Arc<ConfiguratorListener>, Arc<AtomicU64>) {
        let config: Arc<dyn DynamicConfiguration> = Arc::new(MemoryConfiguration::new());
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        let listener = ConfiguratorListener::bind(
            "svc.Demo.configurators".to_string(),
            &config,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (config, listener, fired)
    }

    fn provider() -> Url {
        Url::parse("local://10.0.0.1:20880/svc.Demo?weight=100").unwrap()
    }

    #[test]
    fn test_rule_replaces_list_and_fires() {
        let (config, listener, fired) = setup();
        config.publish_rule(
            "svc.Demo.configurators",
            DEFAULT_RULE_GROUP,
            "override://0.0.0.0/svc.Demo?weight=200",
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(listener.fold(provider()).param("weight"), Some("200"));
    }

    #[test]
    fn test_delete_clears_and_fires() {
        let (config, listener, fired) = setup();
        config.publish_rule(
            "svc.Demo.configurators",
            DEFAULT_RULE_GROUP,
            "override://0.0.0.0/svc.Demo?weight=200",
        );
        config.delete_rule("svc.Demo.configurators", DEFAULT_RULE_GROUP);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(listener.fold(provider()).param("weight"), Some("100"));
    }

    #[test]
    fn test_parse_failure_keeps_prior_and_stays_silent() {
        let (config, listener, fired) = setup();
        config.publish_rule(
            "svc.Demo.configurators",
            DEFAULT_RULE_GROUP,
            "override://0.0.0.0/svc.Demo?weight=200",
        );
        config.publish_rule("svc.Demo.configurators", DEFAULT_RULE_GROUP, ":::garbage:::");
        // The bad push neither cleared the rules nor notified.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(listener.fold(provider()).param("weight"), Some("200"));
    }

    #[test]
    fn test_bind_seeds_from_existing_rule_without_firing() {
        let config: Arc<dyn DynamicConfiguration> = Arc::new(MemoryConfiguration::new());
        config.publish_rule(
            "svc.Demo.configurators",
            DEFAULT_RULE_GROUP,
            "override://0.0.0.0/svc.Demo?weight=300",
        );
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        let listener = ConfiguratorListener::bind(
            "svc.Demo.configurators".to_string(),
            &config,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(listener.fold(provider()).param("weight"), Some("300"));
    }

    #[test]
    fn test_unbind_detaches() {
        let (config, listener, fired) = setup();
        listener.unbind(&config);
        config.publish_rule(
            "svc.Demo.configurators",
            DEFAULT_RULE_GROUP,
            "override://0.0.0.0/svc.Demo?weight=200",
        );
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
