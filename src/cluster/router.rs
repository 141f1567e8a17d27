//! Routers: filter the replica set before load balancing.
//!
//! Every directory builds one [`RouterChain`] from its consumer URL. The
//! chain always contains the tag router (inert until a rule arrives), an
//! application-scoped and a service-scoped condition router (each bound to
//! its dynamic-configuration rule key), and whatever condition routers the
//! registry pushes under the `routers` category.
//!
//! Rule grammar is deliberately small: one `key=value` condition per line
//! for condition routers (a provider must match every condition to stay),
//! `tag=<name>` lines for the tag router. A rule that parses to nothing
//! keeps the previous one (fail-open).

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use tracing::warn;

use crate::config::ConfigChangeEvent;
use crate::config::ConfigChangeType;
use crate::config::ConfigurationListener;
use crate::config::DEFAULT_RULE_GROUP;
use crate::config::DynamicConfiguration;
use crate::constants::APPLICATION_KEY;
use crate::constants::ROUTER_SUFFIX;
use crate::constants::TAG_KEY;
use crate::constants::TAG_ROUTER_SUFFIX;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::url::Url;

/// Filters a replica set for one invocation.
pub trait Router: Send + Sync {
    fn route(
        &self,
        invokers: Vec<Arc<dyn Invoker>>,
        url: &Url,
        invocation: &Invocation,
    ) -> Vec<Arc<dyn Invoker>>;
}

// ---------------------------------------------------------------------------
// Condition router
// ---------------------------------------------------------------------------

/// Keeps providers whose URL matches every `key=value` condition. An empty
/// result falls back to the unfiltered set so routing never blacks out a
/// service.
pub struct ConditionRouter {
    conditions: Vec<(String, String)>,
}

impl ConditionRouter {
    pub fn new(conditions: Vec<(String, String)>) -> Self {
        Self { conditions }
    }

    /// Parse `key=value` lines. `None` when no line parses.
    pub fn parse(rule: &str) -> Option<Self> {
        let mut conditions = Vec::new();
        for line in rule.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=')?;
            conditions.push((key.trim().to_string(), value.trim().to_string()));
        }
        if conditions.is_empty() { None } else { Some(Self { conditions }) }
    }

    fn matches(&self, url: &Url) -> bool {
        self.conditions.iter().all(|(key, value)| url.param(key) == Some(value.as_str()))
    }
}

impl Router for ConditionRouter {
    fn route(
        &self,
        invokers: Vec<Arc<dyn Invoker>>,
        _url: &Url,
        _invocation: &Invocation,
    ) -> Vec<Arc<dyn Invoker>> {
        let filtered: Vec<_> =
            invokers.iter().filter(|i| self.matches(i.url())).cloned().collect();
        if filtered.is_empty() {
            warn!("condition route matched no provider; keeping the full set");
            invokers
        } else {
            filtered
        }
    }
}

// ---------------------------------------------------------------------------
// Tag router
// ---------------------------------------------------------------------------

/// Routes by the `tag` invocation attachment once a tag rule has been
/// pushed; a no-op until then.
pub struct TagRouter {
    /// Tags named by the active rule; `None` while no rule is in force.
    known_tags: RwLock<Option<Vec<String>>>,
}

impl TagRouter {
    pub fn new() -> Self {
        Self { known_tags: RwLock::new(None) }
    }

    fn set_rule(&self, rule: Option<&str>) {
        let tags = rule.map(|text| {
            text.lines()
                .filter_map(|line| line.trim().strip_prefix("tag="))
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        });
        *self.known_tags.write() = tags;
    }
}

impl Default for TagRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Router for TagRouter {
    fn route(
        &self,
        invokers: Vec<Arc<dyn Invoker>>,
        _url: &Url,
        invocation: &Invocation,
    ) -> Vec<Arc<dyn Invoker>> {
        let guard = self.known_tags.read();
        let known = match guard.as_ref() {
            Some(known) => known,
            None => return invokers,
        };
        let requested = invocation.attachment(TAG_KEY).unwrap_or("");
        if !requested.is_empty() && known.iter().any(|t| t == requested) {
            let tagged: Vec<_> = invokers
                .iter()
                .filter(|i| i.url().param(TAG_KEY) == Some(requested))
                .cloned()
                .collect();
            if !tagged.is_empty() {
                return tagged;
            }
            // Fall back to untagged providers when the tag has none.
        }
        invokers
            .into_iter()
            .filter(|i| i.url().param(TAG_KEY).is_none_or(|t| t.is_empty()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Rule-bound routers (app / service scope, tag rules)
// ---------------------------------------------------------------------------

/// A condition router kept current by a dynamic-configuration rule key.
struct ScopedConditionRouter {
    key: String,
    current: RwLock<Option<ConditionRouter>>,
}

impl ScopedConditionRouter {
    fn bind(key: String, config: &Arc<dyn DynamicConfiguration>) -> Arc<Self> {
        let router = Arc::new(Self { key: key.clone(), current: RwLock::new(None) });
        config.add_listener(&key, router.clone());
        if let Some(rule) = config.rule(&key, DEFAULT_RULE_GROUP) {
            router.apply(&rule);
        }
        router
    }

    fn apply(&self, rule: &str) {
        match ConditionRouter::parse(rule) {
            Some(parsed) => {
                debug!(key = self.key.as_str(), "condition-router rule applied");
                *self.current.write() = Some(parsed);
            }
            None => {
                // Fail-open: an unparsable rule keeps the previous one.
                warn!(key = self.key.as_str(), "unparsable condition-router rule ignored");
            }
        }
    }
}

impl ConfigurationListener for ScopedConditionRouter {
    fn process(&self, event: ConfigChangeEvent) {
        if event.change_type == ConfigChangeType::Deleted {
            *self.current.write() = None;
        } else {
            self.apply(&event.content);
        }
    }
}

impl Router for ScopedConditionRouter {
    fn route(
        &self,
        invokers: Vec<Arc<dyn Invoker>>,
        url: &Url,
        invocation: &Invocation,
    ) -> Vec<Arc<dyn Invoker>> {
        match &*self.current.read() {
            Some(router) => router.route(invokers, url, invocation),
            None => invokers,
        }
    }
}

/// Tag router kept current by its rule key.
struct ScopedTagRouter {
    inner: TagRouter,
}

impl ScopedTagRouter {
    fn bind(key: &str, config: &Arc<dyn DynamicConfiguration>) -> Arc<Self> {
        let router = Arc::new(Self { inner: TagRouter::new() });
        config.add_listener(key, router.clone());
        if let Some(rule) = config.rule(key, DEFAULT_RULE_GROUP) {
            router.inner.set_rule(Some(&rule));
        }
        router
    }
}

impl ConfigurationListener for ScopedTagRouter {
    fn process(&self, event: ConfigChangeEvent) {
        if event.change_type == ConfigChangeType::Deleted {
            self.inner.set_rule(None);
        } else {
            self.inner.set_rule(Some(&event.content));
        }
    }
}

impl Router for ScopedTagRouter {
    fn route(
        &self,
        invokers: Vec<Arc<dyn Invoker>>,
        url: &Url,
        invocation: &Invocation,
    ) -> Vec<Arc<dyn Invoker>> {
        self.inner.route(invokers, url, invocation)
    }
}

// ---------------------------------------------------------------------------
// Router chain
// ---------------------------------------------------------------------------

/// Built once per directory: tag + app + service routers, plus the
/// registry-pushed condition routers, applied in that order.
pub struct RouterChain {
    builtin: Vec<Arc<dyn Router>>,
    dynamic: RwLock<Vec<Arc<dyn Router>>>,
}

impl RouterChain {
    /// Assemble the chain for a consumer URL, binding the scoped routers to
    /// their rule keys.
    pub fn build(url: &Url, config: &Arc<dyn DynamicConfiguration>) -> Self {
        let application = url.param_or(APPLICATION_KEY, "application");
        let service_key = url.service_key();

        let tag = ScopedTagRouter::bind(&format!("{application}{TAG_ROUTER_SUFFIX}"), config);
        let app =
            ScopedConditionRouter::bind(format!("{application}{ROUTER_SUFFIX}"), config);
        let service =
            ScopedConditionRouter::bind(format!("{service_key}{ROUTER_SUFFIX}"), config);

        Self {
            builtin: vec![tag as Arc<dyn Router>, app as Arc<dyn Router>, service as Arc<dyn Router>],
            dynamic: RwLock::new(Vec::new()),
        }
    }

    /// A chain with no routers; used when no configuration backend exists.
    pub fn empty() -> Self {
        Self { builtin: Vec::new(), dynamic: RwLock::new(Vec::new()) }
    }

    /// Replace the registry-pushed routers wholesale.
    pub fn replace_dynamic(&self, routers: Vec<Arc<dyn Router>>) {
        *self.dynamic.write() = routers;
    }

    pub fn route(
        &self,
        mut invokers: Vec<Arc<dyn Invoker>>,
        url: &Url,
        invocation: &Invocation,
    ) -> Vec<Arc<dyn Invoker>> {
        for router in &self.builtin {
            invokers = router.route(invokers, url, invocation);
        }
        for router in self.dynamic.read().iter() {
            invokers = router.route(invokers, url, invocation);
        }
        invokers
    }
}

/// Build condition routers from registry-pushed router URLs (`condition://`
/// with the rule in the `rule` parameter).
pub fn routers_from_urls(urls: &[Url]) -> Vec<Arc<dyn Router>> {
    let mut routers: Vec<Arc<dyn Router>> = Vec::new();
    for url in urls {
        if url.protocol() != "condition" {
            continue;
        }
        match url.param("rule").and_then(ConditionRouter::parse) {
            Some(router) => routers.push(Arc::new(router)),
            None => warn!(%url, "router URL carries no parsable rule"),
        }
    }
    routers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcResult;
    use crate::rpc::RpcError;

    struct FakeInvoker {
        url: Url,
    }

    impl Invoker for FakeInvoker {
        fn url(&self) -> &Url {
            &self.url
        }
        fn service(&self) -> &str {
            "demo.Greeter"
        }
        fn is_available(&self) -> bool {
            true
        }
        fn invoke(&self, _invocation: &Invocation) -> Result<RpcResult, RpcError> {
            Ok(RpcResult::ok(None))
        }
        fn destroy(&self) {}
    }

    fn invoker(spec: &str) -> Arc<dyn Invoker> {
        Arc::new(FakeInvoker { url: Url::parse(spec).unwrap() })
    }

    fn hosts(invokers: &[Arc<dyn Invoker>]) -> Vec<String> {
        invokers.iter().map(|i| i.url().host().to_string()).collect()
    }

    fn consumer_url() -> Url {
        Url::parse("consumer://c/demo.Greeter?application=shop").unwrap()
    }

    #[test]
    fn test_condition_router_filters_by_params() {
        let router = ConditionRouter::parse("zone=east\n").unwrap();
        let set = vec![
            invoker("local://a:1/demo.Greeter?zone=east"),
            invoker("local://b:1/demo.Greeter?zone=west"),
        ];
        let routed = router.route(set, &consumer_url(), &Invocation::new("hello"));
        assert_eq!(hosts(&routed), vec!["a"]);
    }

    #[test]
    fn test_condition_router_keeps_full_set_when_nothing_matches() {
        let router = ConditionRouter::parse("zone=north\n").unwrap();
        let set = vec![
            invoker("local://a:1/demo.Greeter?zone=east"),
            invoker("local://b:1/demo.Greeter?zone=west"),
        ];
        let routed = router.route(set, &consumer_url(), &Invocation::new("hello"));
        assert_eq!(routed.len(), 2);
    }

    #[test]
    fn test_tag_router_noop_until_rule_pushed() {
        let router = TagRouter::new();
        let set = vec![
            invoker("local://a:1/demo.Greeter?tag=canary"),
            invoker("local://b:1/demo.Greeter"),
        ];
        let inv = Invocation::new("hello").with_attachment(TAG_KEY, "canary");
        let routed = router.route(set.clone(), &consumer_url(), &inv);
        assert_eq!(routed.len(), 2);

        router.set_rule(Some("tag=canary\n"));
        let routed = router.route(set.clone(), &consumer_url(), &inv);
        assert_eq!(hosts(&routed), vec!["a"]);

        // Untagged requests avoid tagged providers once the rule is active.
        let routed = router.route(set, &consumer_url(), &Invocation::new("hello"));
        assert_eq!(hosts(&routed), vec!["b"]);
    }

    #[test]
    fn test_tag_router_falls_back_to_untagged() {
        let router = TagRouter::new();
        router.set_rule(Some("tag=canary\n"));
        let set = vec![invoker("local://b:1/demo.Greeter")];
        let inv = Invocation::new("hello").with_attachment(TAG_KEY, "canary");
        let routed = router.route(set, &consumer_url(), &inv);
        assert_eq!(hosts(&routed), vec!["b"]);
    }

    #[test]
    fn test_chain_applies_scoped_rules_from_configuration() {
        let config: Arc<dyn DynamicConfiguration> =
            Arc::new(crate::config::MemoryConfiguration::new());
        let chain = RouterChain::build(&consumer_url(), &config);

        let set = vec![
            invoker("local://a:1/demo.Greeter?zone=east"),
            invoker("local://b:1/demo.Greeter?zone=west"),
        ];
        let inv = Invocation::new("hello");

        // No rules yet: everything passes.
        assert_eq!(chain.route(set.clone(), &consumer_url(), &inv).len(), 2);

        // Service-scoped rule narrows to east.
        config.publish_rule("demo.Greeter.condition-router", DEFAULT_RULE_GROUP, "zone=east");
        assert_eq!(hosts(&chain.route(set.clone(), &consumer_url(), &inv)), vec!["a"]);

        // Deleting restores the full set.
        config.delete_rule("demo.Greeter.condition-router", DEFAULT_RULE_GROUP);
        assert_eq!(chain.route(set.clone(), &consumer_url(), &inv).len(), 2);

        // Unparsable rules keep the prior state.
        config.publish_rule("demo.Greeter.condition-router", DEFAULT_RULE_GROUP, "zone=east");
        config.publish_rule("demo.Greeter.condition-router", DEFAULT_RULE_GROUP, "not a rule");
        assert_eq!(hosts(&chain.route(set, &consumer_url(), &inv)), vec!["a"]);
    }

    #[test]
    fn test_dynamic_routers_from_urls() {
        let chain = RouterChain::empty();
        let rule_url = Url::parse("condition://0.0.0.0/demo.Greeter?category=routers")
            .unwrap()
            .with_param("rule", "zone=west");
        chain.replace_dynamic(routers_from_urls(&[rule_url]));

        let set = vec![
            invoker("local://a:1/demo.Greeter?zone=east"),
            invoker("local://b:1/demo.Greeter?zone=west"),
        ];
        let routed = chain.route(set, &consumer_url(), &Invocation::new("hello"));
        assert_eq!(hosts(&routed), vec!["b"]);
    }
}
