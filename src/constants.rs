//! URL parameter keys and framework defaults.
//!
//! Every behavioral knob in the framework travels as a URL parameter, so the
//! key strings are centralized here and referenced by constant everywhere
//! else. Keys are grouped by the layer that interprets them.

// ============================================================================
// Addressing keys
// ============================================================================

/// Service interface name carried alongside the URL path.
pub const INTERFACE_KEY: &str = "interface";
/// Service group, part of the service key.
pub const GROUP_KEY: &str = "group";
/// Service version, part of the service key.
pub const VERSION_KEY: &str = "version";
/// Comma-separated method list advertised by a provider.
pub const METHODS_KEY: &str = "methods";
/// Which side of the call a URL describes (`provider` / `consumer`).
pub const SIDE_KEY: &str = "side";
/// Application name owning the exported or referred service.
pub const APPLICATION_KEY: &str = "application";

// ============================================================================
// Registry-layer keys
// ============================================================================

/// Names the registry backend extension a `registry://` URL resolves to.
pub const REGISTRY_KEY: &str = "registry";
/// Data category of a registry URL (`providers`, `configurators`, `routers`, `consumers`).
pub const CATEGORY_KEY: &str = "category";
/// Whether a subscription failure should fail the caller.
pub const CHECK_KEY: &str = "check";
/// Whether to register with the registry at all (default true).
pub const REGISTER_KEY: &str = "register";
/// Marks a registration as dynamic (removed from the cache key).
pub const DYNAMIC_KEY: &str = "dynamic";
/// Enablement flag (removed from the cache key).
pub const ENABLED_KEY: &str = "enabled";
/// Nested provider URL carried (percent-encoded) on a registry export URL.
pub const EXPORT_KEY: &str = "export";
/// Nested consumer parameters carried (percent-encoded) on a registry refer URL.
pub const REFER_KEY: &str = "refer";
/// Extra parameter keys to keep on registered URLs, set on the registry URL.
pub const EXTRA_KEYS_KEY: &str = "extra-keys";
/// Milliseconds to wait before destroying a local exporter on unexport.
pub const SHUTDOWN_TIMEOUT_KEY: &str = "shutdown.timeout";

pub const PROVIDERS_CATEGORY: &str = "providers";
pub const CONFIGURATORS_CATEGORY: &str = "configurators";
pub const ROUTERS_CATEGORY: &str = "routers";
pub const CONSUMERS_CATEGORY: &str = "consumers";

/// Protocol of the synthetic URL a provider subscribes overrides with.
pub const PROVIDER_PROTOCOL: &str = "provider";
/// Protocol of consumer-side subscription URLs.
pub const CONSUMER_PROTOCOL: &str = "consumer";
/// Protocol of override configurator rules.
pub const OVERRIDE_PROTOCOL: &str = "override";
/// Protocol of absent (set-if-missing) configurator rules.
pub const ABSENT_PROTOCOL: &str = "absent";
/// Protocol signalling an intentionally empty provider snapshot.
pub const EMPTY_PROTOCOL: &str = "empty";
/// Protocol name under which the registry protocol itself is exported.
pub const REGISTRY_PROTOCOL: &str = "registry";

/// Rule-key suffix for configurator rules in dynamic configuration.
pub const CONFIGURATORS_SUFFIX: &str = ".configurators";
/// Rule-key suffix for condition-router rules in dynamic configuration.
pub const ROUTER_SUFFIX: &str = ".condition-router";
/// Rule-key suffix for tag-router rules in dynamic configuration.
pub const TAG_ROUTER_SUFFIX: &str = ".tag-router";

// ============================================================================
// Invocation-layer keys
// ============================================================================

/// Cluster policy extension name (default [`DEFAULT_CLUSTER`]).
pub const CLUSTER_KEY: &str = "cluster";
/// Load balancing extension name (default [`DEFAULT_LOADBALANCE`]).
pub const LOADBALANCE_KEY: &str = "loadbalance";
/// Retry budget for failover (total attempts = retries + 1).
pub const RETRIES_KEY: &str = "retries";
/// Parallel fork count for the forking cluster.
pub const FORKS_KEY: &str = "forks";
/// Call timeout in milliseconds.
pub const TIMEOUT_KEY: &str = "timeout";
/// Mock directive (`force:return x`, `fail:return x`, or truthy).
pub const MOCK_KEY: &str = "mock";
/// Proxy factory extension name.
pub const PROXY_KEY: &str = "proxy";
/// Provider-side filter selection.
pub const SERVICE_FILTER_KEY: &str = "service.filter";
/// Consumer-side filter selection.
pub const REFERENCE_FILTER_KEY: &str = "reference.filter";
/// Routing tag carried on provider URLs and invocation attachments.
pub const TAG_KEY: &str = "tag";
/// Enables the access log filter when truthy.
pub const ACCESSLOG_KEY: &str = "accesslog";
/// Provider weight consumed by load balancers and override rules.
pub const WEIGHT_KEY: &str = "weight";

/// Splice marker in user-specified activation lists.
pub const DEFAULT_KEY: &str = "default";
/// Prefix that removes an entry from an activation list.
pub const REMOVE_VALUE_PREFIX: &str = "-";
/// Wildcard matching any group / interface.
pub const ANY_VALUE: &str = "*";

// ============================================================================
// Defaults
// ============================================================================

/// Default registry backend when a `registry://` URL names none.
pub const DEFAULT_REGISTRY: &str = "memory";
/// Default cluster policy.
pub const DEFAULT_CLUSTER: &str = "failover";
/// Default load balancer.
pub const DEFAULT_LOADBALANCE: &str = "random";
/// Default `retries` value for failover (total attempts = this + 1).
pub const DEFAULT_RETRIES: u64 = 2;
/// Default fork count for the forking cluster.
pub const DEFAULT_FORKS: u64 = 2;
/// Default port advertised by the registry protocol.
pub const REGISTRY_PROTOCOL_PORT: u16 = 9090;
/// Grace period before a replaced or unexported local exporter is destroyed.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

/// Manifest type path of the registry management service; referring it yields
/// the registry itself wrapped as an invoker.
pub const REGISTRY_SERVICE_TYPE: &str = "banyan.registry.RegistryService";
