//! Configurators: URL → URL overrides derived from pushed rules.
//!
//! A rule payload is one configurator URL per line. `override://` replaces
//! parameters on matching targets, `absent://` only fills in missing ones.
//! An `empty://` line clears the active rule set. Application of an ordered
//! rule set is a left fold over [`Configurator::configure`].

use std::sync::Arc;

use tracing::warn;

use crate::constants::ABSENT_PROTOCOL;
use crate::constants::ANY_VALUE;
use crate::constants::APPLICATION_KEY;
use crate::constants::CATEGORY_KEY;
use crate::constants::CHECK_KEY;
use crate::constants::DYNAMIC_KEY;
use crate::constants::EMPTY_PROTOCOL;
use crate::constants::ENABLED_KEY;
use crate::constants::GROUP_KEY;
use crate::constants::INTERFACE_KEY;
use crate::constants::OVERRIDE_PROTOCOL;
use crate::constants::SIDE_KEY;
use crate::constants::VERSION_KEY;
use crate::url::Url;
use crate::url::UrlError;

/// Keys that carry rule metadata rather than override payload.
const META_KEYS: [&str; 9] = [
    CATEGORY_KEY,
    CHECK_KEY,
    DYNAMIC_KEY,
    ENABLED_KEY,
    GROUP_KEY,
    VERSION_KEY,
    APPLICATION_KEY,
    SIDE_KEY,
    INTERFACE_KEY,
];

/// A single URL override rule.
pub trait Configurator: Send + Sync {
    /// The rule URL this configurator was built from.
    fn url(&self) -> &Url;

    /// Apply the rule; non-matching targets come back unchanged.
    fn configure(&self, target: &Url) -> Url;
}

/// Left-fold an ordered rule set over a URL.
pub fn apply_configurators(configurators: &[Arc<dyn Configurator>], url: Url) -> Url {
    configurators.iter().fold(url, |url, c| c.configure(&url))
}

/// Parse a raw rule payload (one configurator URL per line).
pub fn parse_rule(raw: &str) -> Result<Vec<Url>, UrlError> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Url::parse)
        .collect()
}

/// Build configurators from rule URLs.
///
/// `None` means "no information, keep what you have" (empty input);
/// `Some(vec![])` means "explicitly cleared" (an `empty://` rule).
pub fn to_configurators(urls: &[Url]) -> Option<Vec<Arc<dyn Configurator>>> {
    if urls.is_empty() {
        return None;
    }
    let mut configurators: Vec<Arc<dyn Configurator>> = Vec::new();
    for url in urls {
        if url.protocol() == EMPTY_PROTOCOL {
            return Some(Vec::new());
        }
        if url.parameters().is_empty() {
            continue;
        }
        match url.protocol() {
            OVERRIDE_PROTOCOL => {
                configurators.push(Arc::new(OverrideConfigurator { url: url.clone() }));
            }
            ABSENT_PROTOCOL => {
                configurators.push(Arc::new(AbsentConfigurator { url: url.clone() }));
            }
            other => {
                warn!(protocol = other, %url, "unknown configurator protocol ignored");
            }
        }
    }
    Some(configurators)
}

/// Does the rule URL address this target?
fn applies_to(rule: &Url, target: &Url) -> bool {
    let service = rule.service_interface();
    let service_match =
        service.is_empty() || service == ANY_VALUE || service == target.service_interface();
    let host_match =
        rule.host().is_empty() || rule.host() == "0.0.0.0" || rule.host() == target.host();
    let port_match = rule.port() == 0 || rule.port() == target.port();
    service_match && host_match && port_match
}

/// The rule parameters that actually override the target.
fn payload(rule: &Url) -> impl Iterator<Item = (&String, &String)> + '_ {
    rule.parameters().iter().filter(|(k, _)| !META_KEYS.contains(&k.as_str()))
}

/// Replaces parameters on matching targets.
pub struct OverrideConfigurator {
    url: Url,
}

impl Configurator for OverrideConfigurator {
    fn url(&self) -> &Url {
        &self.url
    }

    fn configure(&self, target: &Url) -> Url {
        if !applies_to(&self.url, target) {
            return target.clone();
        }
        target.with_params(payload(&self.url).map(|(k, v)| (k.clone(), v.clone())))
    }
}

/// Fills in parameters the target does not set yet.
pub struct AbsentConfigurator {
    url: Url,
}

impl Configurator for AbsentConfigurator {
    fn url(&self) -> &Url {
        &self.url
    }

    fn configure(&self, target: &Url) -> Url {
        if !applies_to(&self.url, target) {
            return target.clone();
        }
        let missing: Vec<(String, String)> = payload(&self.url)
            .filter(|(k, _)| target.param(k).is_none())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        target.with_params(missing)
    }
}
