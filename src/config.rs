//! Dynamic-configuration capability: push-updated rule storage.
//!
//! The registry protocol and the scoped routers obtain the process's
//! configuration handle through the extension registry (default backend:
//! `memory`), so there is no global configuration instance. Rule payloads
//! are raw strings; parsing them into configurators or router rules is the
//! listener's job.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::extension::ExtensionError;
use crate::extension::ExtensionPoint;
use crate::extension::ExtensionProvider;
use crate::extension::ExtensionRegistry;

/// Group rules are published under when the caller names none.
pub const DEFAULT_RULE_GROUP: &str = "banyan";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChangeType {
    Added,
    Modified,
    Deleted,
}

/// One push notification for a rule key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChangeEvent {
    pub key: String,
    pub change_type: ConfigChangeType,
    /// Raw rule payload; empty on delete.
    pub content: String,
}

/// Receiver of rule-change pushes.
pub trait ConfigurationListener: Send + Sync {
    fn process(&self, event: ConfigChangeEvent);
}

/// Push-capable rule store.
pub trait DynamicConfiguration: Send + Sync {
    fn add_listener(&self, key: &str, listener: Arc<dyn ConfigurationListener>);

    fn remove_listener(&self, key: &str, listener: &Arc<dyn ConfigurationListener>);

    /// Current raw rule for `key`, if any.
    fn rule(&self, key: &str, group: &str) -> Option<String>;

    /// Publish or replace a rule and notify the key's listeners.
    fn publish_rule(&self, key: &str, group: &str, content: &str);

    /// Delete a rule and notify the key's listeners.
    fn delete_rule(&self, key: &str, group: &str);
}

impl ExtensionPoint for dyn DynamicConfiguration {
    const TYPE_PATH: &'static str = "banyan.config.DynamicConfiguration";
    const DEFAULT_NAME: Option<&'static str> = Some("memory");

    fn providers() -> Vec<ExtensionProvider<Self>> {
        vec![ExtensionProvider::named("banyan.config.MemoryConfiguration", provide_memory)]
    }

    fn embedded_manifest() -> &'static str {
        "memory = banyan.config.MemoryConfiguration\n"
    }
}

fn provide_memory(
    _: &Arc<ExtensionRegistry>,
) -> Result<Arc<dyn DynamicConfiguration>, ExtensionError> {
    Ok(Arc::new(MemoryConfiguration::new()))
}

/// In-memory rule store; the default backend and the test double.
pub struct MemoryConfiguration {
    rules: Mutex<HashMap<(String, String), String>>,
    listeners: Mutex<HashMap<String, Vec<Arc<dyn ConfigurationListener>>>>,
}

impl MemoryConfiguration {
    pub fn new() -> Self {
        Self { rules: Mutex::new(HashMap::new()), listeners: Mutex::new(HashMap::new()) }
    }

    fn listeners_for(&self, key: &str) -> Vec<Arc<dyn ConfigurationListener>> {
        self.listeners.lock().get(key).cloned().unwrap_or_default()
    }
}

impl Default for MemoryConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicConfiguration for MemoryConfiguration {
    fn add_listener(&self, key: &str, listener: Arc<dyn ConfigurationListener>) {
        self.listeners.lock().entry(key.to_string()).or_default().push(listener);
    }

    fn remove_listener(&self, key: &str, listener: &Arc<dyn ConfigurationListener>) {
        if let Some(list) = self.listeners.lock().get_mut(key) {
            list.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    fn rule(&self, key: &str, group: &str) -> Option<String> {
        self.rules.lock().get(&(key.to_string(), group.to_string())).cloned()
    }

    fn publish_rule(&self, key: &str, group: &str, content: &str) {
        let change_type = {
            let mut rules = self.rules.lock();
            let previous =
                rules.insert((key.to_string(), group.to_string()), content.to_string());
            if previous.is_some() { ConfigChangeType::Modified } else { ConfigChangeType::Added }
        };
        debug!(key, ?change_type, "rule published");
        // Listeners run outside the rule lock; a listener may read back the
        // current rule while handling the event.
        for listener in self.listeners_for(key) {
            listener.process(ConfigChangeEvent {
                key: key.to_string(),
                change_type,
                content: content.to_string(),
            });
        }
    }

    fn delete_rule(&self, key: &str, group: &str) {
        let removed = self.rules.lock().remove(&(key.to_string(), group.to_string()));
        if removed.is_none() {
            return;
        }
        debug!(key, "rule deleted");
        for listener in self.listeners_for(key) {
            listener.process(ConfigChangeEvent {
                key: key.to_string(),
                change_type: ConfigChangeType::Deleted,
                content: String::new(),
            });
        }
    }
}
