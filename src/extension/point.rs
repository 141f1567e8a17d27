//! Capability declarations: the static tables the registry composes from.
//!
//! A capability (extension point) is a trait; its `dyn Trait` type implements
//! [`ExtensionPoint`] to declare the manifest type path, the default
//! extension name, and the compiled-in provider table. Manifests (embedded or
//! on disk) then select and name providers out of that table — the table is
//! the compile-time replacement for classpath scanning, the manifest keeps
//! its role as the declarative wiring surface.

use std::sync::Arc;

use crate::extension::ExtensionRegistry;
use crate::extension::error::ExtensionError;
use crate::url::Url;

/// Constructor for a named or adaptive provider. Receives the registry so an
/// implementation can pull the adaptive handles of the capabilities it
/// depends on — the explicit-wiring form of dependency injection.
pub type Constructor<T> = fn(&Arc<ExtensionRegistry>) -> Result<Arc<T>, ExtensionError>;

/// Constructor for a wrapper (decorator) provider; receives the instance it
/// wraps plus the registry for its own dependencies.
pub type WrapperConstructor<T> =
    fn(Arc<T>, &Arc<ExtensionRegistry>) -> Result<Arc<T>, ExtensionError>;

/// Conditional-activation descriptor attached to a named provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct Activation {
    /// Groups this extension activates in; empty matches every group.
    pub groups: &'static [&'static str],
    /// URL parameter keys (exact or `.suffix` match) that must be present
    /// and non-empty; empty matches every URL.
    pub values: &'static [&'static str],
    /// Sort order inside the auto-activated block (lower first).
    pub order: i32,
}

impl Activation {
    /// Does this descriptor activate for the requested group?
    pub fn matches_group(&self, group: &str) -> bool {
        group.is_empty() || self.groups.is_empty() || self.groups.contains(&group)
    }

    /// Does this descriptor activate for the given URL? True when `values`
    /// is empty, or when some URL parameter key equals a listed value (or
    /// ends with `.<value>`) with a non-empty value.
    pub fn matches_url(&self, url: &Url) -> bool {
        if self.values.is_empty() {
            return true;
        }
        self.values.iter().any(|value| {
            url.parameters().iter().any(|(k, v)| {
                !v.is_empty() && (k == value || k.ends_with(&format!(".{value}")))
            })
        })
    }
}

/// One compiled-in implementation of a capability.
pub struct ExtensionProvider<T: ?Sized> {
    /// Fully-qualified (dotted) path a manifest entry refers to this
    /// provider by.
    pub type_path: &'static str,
    pub kind: ProviderKind<T>,
}

/// How a provider participates in composition.
pub enum ProviderKind<T: ?Sized> {
    /// Ordinary named implementation, optionally condition-activated.
    Named {
        construct: Constructor<T>,
        activate: Option<Activation>,
    },
    /// Decorator whose constructor takes the wrapped instance.
    Wrapper { construct: WrapperConstructor<T> },
    /// Hand-declared adaptive implementation (at most one per capability).
    Adaptive { construct: Constructor<T> },
}

impl<T: ?Sized> ExtensionProvider<T> {
    pub fn named(type_path: &'static str, construct: Constructor<T>) -> Self {
        Self { type_path, kind: ProviderKind::Named { construct, activate: None } }
    }

    pub fn activated(
        type_path: &'static str,
        construct: Constructor<T>,
        activate: Activation,
    ) -> Self {
        Self { type_path, kind: ProviderKind::Named { construct, activate: Some(activate) } }
    }

    pub fn wrapper(type_path: &'static str, construct: WrapperConstructor<T>) -> Self {
        Self { type_path, kind: ProviderKind::Wrapper { construct } }
    }

    pub fn adaptive(type_path: &'static str, construct: Constructor<T>) -> Self {
        Self { type_path, kind: ProviderKind::Adaptive { construct } }
    }
}

/// Declares `dyn Trait` as a capability the registry can load.
pub trait ExtensionPoint: Send + Sync + 'static {
    /// Dotted type path manifests are named by (e.g. `banyan.rpc.Protocol`).
    const TYPE_PATH: &'static str;

    /// Default extension name, if the capability declares one.
    const DEFAULT_NAME: Option<&'static str>;

    /// The compiled-in provider table.
    fn providers() -> Vec<ExtensionProvider<Self>>;

    /// Manifest text shipped with the capability itself; parsed before any
    /// on-disk manifest.
    fn embedded_manifest() -> &'static str {
        ""
    }

    /// Build the per-call dispatcher for capabilities with adaptive methods.
    /// `Ok(None)` means the capability has no adaptive methods and
    /// `adaptive()` must fail with [`ExtensionError::NoAdaptiveMethod`].
    fn synthesize_adaptive(
        _registry: &Arc<ExtensionRegistry>,
    ) -> Result<Option<Arc<Self>>, ExtensionError> {
        Ok(None)
    }
}

/// Last segment of a dotted type path.
pub(crate) fn simple_type_name(type_path: &str) -> &str {
    type_path.rsplit('.').next().unwrap_or(type_path)
}

/// Derive the default URL key for a capability from its simple type name:
/// split on uppercase letters, join lowercased with `.`
/// (`YyyInvokerWrapper` → `yyy.invoker.wrapper`).
pub fn derived_url_key(simple_name: &str) -> String {
    let mut key = String::with_capacity(simple_name.len() + 4);
    for (i, ch) in simple_name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                key.push('.');
            }
            key.extend(ch.to_lowercase());
        } else {
            key.push(ch);
        }
    }
    key
}

/// Resolve the extension name an adaptive method call dispatches to.
///
/// Consults `keys` in declaration order (the literal key `protocol` reads
/// the URL's protocol instead of a parameter), then the key derived from the
/// capability's simple type name when `keys` is empty, then the capability's
/// default name.
pub fn resolve_adaptive_name(
    type_path: &str,
    default_name: Option<&str>,
    method: &str,
    keys: &[&str],
    url: &Url,
) -> Result<String, ExtensionError> {
    let derived;
    let derived_slot;
    let effective: &[&str] = if keys.is_empty() {
        derived = derived_url_key(simple_type_name(type_path));
        derived_slot = [derived.as_str()];
        &derived_slot
    } else {
        keys
    };
    for key in effective {
        if *key == "protocol" {
            if !url.protocol().is_empty() {
                return Ok(url.protocol().to_string());
            }
        } else if let Some(value) = url.param(key).filter(|v| !v.is_empty()) {
            return Ok(value.to_string());
        }
    }
    if let Some(default) = default_name {
        return Ok(default.to_string());
    }
    super::error::AdaptiveNameUnresolvedSnafu {
        type_path: type_path.to_string(),
        method: method.to_string(),
        keys: keys.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        url: url.to_string(),
    }
    .fail()
}
