//! Process-wide, type-indexed extension registry.
//!
//! # Responsibilities
//! - Discover capability implementations from manifests (embedded + the
//!   three well-known directories under configured roots) and compose them:
//!   named lookup, wrapper chaining, adaptive per-call dispatch.
//! - Own every extension singleton: one lazily-constructed instance per
//!   `(capability, name)`, wrapper-composed exactly once.
//! - Hand constructors the registry handle so they can wire their
//!   dependencies explicitly (`loader::<dyn Dep>()?.adaptive()?`), replacing
//!   setter-scanning injection. The registry never injects into itself, so
//!   the meta-factory bootstrap exemption of the original design disappears.
//!
//! # Composition
//! The registry is an explicit long-lived handle created at startup and
//! passed by reference; there is no global instance. Dropping the last `Arc`
//! releases every loader and singleton.

mod error;
mod manifest;
mod point;

pub use error::ExtensionError;
pub use manifest::MANIFEST_PREFIXES;
pub use manifest::ManifestEntry;
pub use manifest::parse_manifest;
pub use point::Activation;
pub use point::Constructor;
pub use point::ExtensionPoint;
pub use point::ExtensionProvider;
pub use point::ProviderKind;
pub use point::WrapperConstructor;
pub use point::derived_url_key;
pub use point::resolve_adaptive_name;

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use snafu::ensure;
use tracing::debug;

use crate::constants::DEFAULT_KEY;
use crate::constants::REMOVE_VALUE_PREFIX;
use crate::url::Url;

use error::CreationFailedSnafu;
use error::DuplicateAdaptiveSnafu;
use error::DuplicateExtensionSnafu;
use error::NoAdaptiveMethodSnafu;
use error::NoSuchExtensionSnafu;
use error::NotAnExtensionPointSnafu;
use error::UnknownProviderSnafu;
use point::simple_type_name;

/// Type-indexed directory of [`ExtensionLoader`]s.
pub struct ExtensionRegistry {
    loaders: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    manifest_roots: Vec<PathBuf>,
}

impl ExtensionRegistry {
    /// A registry that only sees embedded manifests.
    pub fn new() -> Arc<Self> {
        Self::with_manifest_roots(Vec::new())
    }

    /// A registry that additionally scans `roots` for manifest files under
    /// the [`MANIFEST_PREFIXES`] directories.
    pub fn with_manifest_roots(roots: Vec<PathBuf>) -> Arc<Self> {
        Arc::new(Self { loaders: DashMap::new(), manifest_roots: roots })
    }

    /// The per-capability loader, built and memoized on first use.
    pub fn loader<T: ExtensionPoint + ?Sized>(
        self: &Arc<Self>,
    ) -> Result<Arc<ExtensionLoader<T>>, ExtensionError> {
        let id = TypeId::of::<T>();
        if let Some(loader) = self.loaders.get(&id) {
            return Ok(downcast_loader(loader.value()));
        }
        // Built outside the map entry so manifest parsing never runs under a
        // shard lock.
        let built: Arc<dyn Any + Send + Sync> = Arc::new(ExtensionLoader::<T>::build(self)?);
        let entry = self.loaders.entry(id).or_insert(built);
        Ok(downcast_loader(entry.value()))
    }
}

fn downcast_loader<T: ExtensionPoint + ?Sized>(
    any: &Arc<dyn Any + Send + Sync>,
) -> Arc<ExtensionLoader<T>> {
    any.clone()
        .downcast::<ExtensionLoader<T>>()
        .expect("loader map is keyed by TypeId")
}

struct NamedExtension<T: ?Sized> {
    provider_path: String,
    construct: Constructor<T>,
    activate: Option<Activation>,
}

/// Per-capability registry: named singletons, wrapper chain, adaptive
/// instance, activation matching.
pub struct ExtensionLoader<T: ExtensionPoint + ?Sized> {
    registry: Weak<ExtensionRegistry>,
    default_name: Option<&'static str>,
    named: HashMap<String, NamedExtension<T>>,
    /// Activatable names presorted by the activation comparator
    /// (declared order, then provider path).
    activation_order: Vec<String>,
    wrappers: Vec<WrapperConstructor<T>>,
    declared_adaptive: Option<Constructor<T>>,
    instances: Mutex<HashMap<String, Arc<OnceCell<Arc<T>>>>>,
    adaptive: OnceCell<Arc<T>>,
}

impl<T: ExtensionPoint + ?Sized> std::fmt::Debug for ExtensionLoader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionLoader").finish_non_exhaustive()
    }
}

impl<T: ExtensionPoint + ?Sized> ExtensionLoader<T> {
    fn build(registry: &Arc<ExtensionRegistry>) -> Result<Self, ExtensionError> {
        let mut providers: HashMap<&'static str, ExtensionProvider<T>> = HashMap::new();
        for provider in T::providers() {
            providers.insert(provider.type_path, provider);
        }

        let mut sources: Vec<(String, String)> = Vec::new();
        let embedded = T::embedded_manifest();
        if !embedded.trim().is_empty() {
            sources.push(("<embedded>".to_string(), embedded.to_string()));
        }
        for (path, text) in manifest::discover(&registry.manifest_roots, T::TYPE_PATH)? {
            sources.push((path.display().to_string(), text));
        }
        ensure!(
            !sources.is_empty(),
            NotAnExtensionPointSnafu { type_path: T::TYPE_PATH.to_string() }
        );

        let mut named: HashMap<String, NamedExtension<T>> = HashMap::new();
        let mut wrappers: Vec<WrapperConstructor<T>> = Vec::new();
        let mut wrapper_paths: HashSet<String> = HashSet::new();
        let mut declared_adaptive: Option<(String, Constructor<T>)> = None;

        for (source, text) in &sources {
            for entry in manifest::parse_manifest(text) {
                let provider = providers.get(entry.provider_path.as_str()).ok_or_else(|| {
                    UnknownProviderSnafu {
                        type_path: T::TYPE_PATH.to_string(),
                        provider_path: entry.provider_path.clone(),
                    }
                    .build()
                })?;
                match &provider.kind {
                    ProviderKind::Adaptive { construct } => match &declared_adaptive {
                        None => declared_adaptive = Some((entry.provider_path.clone(), *construct)),
                        Some((path, _)) if *path == entry.provider_path => {}
                        Some(_) => {
                            return DuplicateAdaptiveSnafu {
                                type_path: T::TYPE_PATH.to_string(),
                            }
                            .fail();
                        }
                    },
                    ProviderKind::Wrapper { construct } => {
                        if wrapper_paths.insert(entry.provider_path.clone()) {
                            wrappers.push(*construct);
                        }
                    }
                    ProviderKind::Named { construct, activate } => {
                        let name = match &entry.name {
                            Some(name) => name.clone(),
                            None => derive_name(&entry.provider_path, T::TYPE_PATH),
                        };
                        match named.get(&name) {
                            Some(existing) if existing.provider_path != entry.provider_path => {
                                return DuplicateExtensionSnafu {
                                    type_path: T::TYPE_PATH.to_string(),
                                    name,
                                    existing: existing.provider_path.clone(),
                                    conflicting: entry.provider_path.clone(),
                                }
                                .fail();
                            }
                            Some(_) => {}
                            None => {
                                named.insert(
                                    name,
                                    NamedExtension {
                                        provider_path: entry.provider_path.clone(),
                                        construct: *construct,
                                        activate: *activate,
                                    },
                                );
                            }
                        }
                    }
                }
            }
            debug!(capability = T::TYPE_PATH, source = source.as_str(), "loaded extension manifest");
        }

        let mut activation_order: Vec<(i32, String, String)> = named
            .iter()
            .filter_map(|(name, ext)| {
                ext.activate
                    .as_ref()
                    .map(|a| (a.order, ext.provider_path.clone(), name.clone()))
            })
            .collect();
        activation_order.sort();

        Ok(Self {
            registry: Arc::downgrade(registry),
            default_name: T::DEFAULT_NAME,
            named,
            activation_order: activation_order.into_iter().map(|(_, _, name)| name).collect(),
            wrappers,
            declared_adaptive: declared_adaptive.map(|(_, c)| c),
            instances: Mutex::new(HashMap::new()),
            adaptive: OnceCell::new(),
        })
    }

    /// The capability's default extension name, if declared.
    pub fn default_name(&self) -> Option<&'static str> {
        self.default_name
    }

    /// All declared extension names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.named.keys().cloned().collect();
        names.sort();
        names
    }

    /// Is `name` declared for this capability?
    pub fn has(&self, name: &str) -> bool {
        self.named.contains_key(name)
    }

    /// The named singleton, constructed (and wrapper-composed) on first
    /// call. `"true"` and the default name alias the default extension.
    ///
    /// A provider constructor must not request its own name from the same
    /// loader; the per-slot cell makes that self-wait, as the original's
    /// per-holder lock did.
    pub fn get(&self, name: &str) -> Result<Arc<T>, ExtensionError> {
        let resolved = if name == "true" {
            self.default_name.ok_or_else(|| {
                NoSuchExtensionSnafu {
                    type_path: T::TYPE_PATH.to_string(),
                    name: name.to_string(),
                }
                .build()
            })?
        } else {
            name
        };
        let holder = {
            let mut instances = self.instances.lock();
            instances
                .entry(resolved.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        holder.get_or_try_init(|| self.create(resolved)).cloned()
    }

    /// The default extension; fails when the capability declares none.
    pub fn default_extension(&self) -> Result<Arc<T>, ExtensionError> {
        self.get("true")
    }

    /// The adaptive singleton: the declared adaptive implementation when one
    /// is registered, otherwise the capability's synthesized dispatcher.
    pub fn adaptive(&self) -> Result<Arc<T>, ExtensionError> {
        self.adaptive
            .get_or_try_init(|| {
                let registry = self.registry()?;
                if let Some(construct) = self.declared_adaptive {
                    return construct(&registry);
                }
                match T::synthesize_adaptive(&registry)? {
                    Some(adaptive) => Ok(adaptive),
                    None => NoAdaptiveMethodSnafu { type_path: T::TYPE_PATH.to_string() }.fail(),
                }
            })
            .cloned()
    }

    /// Ordered activation: the auto-activated block (descriptor matches URL
    /// and group) spliced with the user-specified names from the URL
    /// parameter `key`. `default` marks the splice point; `-name` removes an
    /// entry; `-default` drops the whole auto block.
    pub fn activated(
        &self,
        url: &Url,
        key: &str,
        group: &str,
    ) -> Result<Vec<Arc<T>>, ExtensionError> {
        let spec = url.param(key).unwrap_or("");
        let names: Vec<String> = spec
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let removed: HashSet<&str> = names
            .iter()
            .filter_map(|n| n.strip_prefix(REMOVE_VALUE_PREFIX))
            .collect();

        let mut result = Vec::new();
        if !removed.contains(DEFAULT_KEY) {
            for name in &self.activation_order {
                if names.iter().any(|n| n == name) || removed.contains(name.as_str()) {
                    continue;
                }
                let activate = self
                    .named
                    .get(name)
                    .and_then(|e| e.activate.as_ref())
                    .expect("activation_order only holds activatable names");
                if activate.matches_group(group) && activate.matches_url(url) {
                    result.push(self.get(name)?);
                }
            }
        }

        let mut user = Vec::new();
        for name in &names {
            if name.starts_with(REMOVE_VALUE_PREFIX) || removed.contains(name.as_str()) {
                continue;
            }
            if name == DEFAULT_KEY {
                if !user.is_empty() {
                    let mut spliced = std::mem::take(&mut user);
                    spliced.append(&mut result);
                    result = spliced;
                }
            } else {
                user.push(self.get(name)?);
            }
        }
        result.append(&mut user);
        Ok(result)
    }

    fn create(&self, name: &str) -> Result<Arc<T>, ExtensionError> {
        let ext = self.named.get(name).ok_or_else(|| {
            NoSuchExtensionSnafu {
                type_path: T::TYPE_PATH.to_string(),
                name: name.to_string(),
            }
            .build()
        })?;
        let registry = self.registry()?;
        let mut instance = (ext.construct)(&registry)?;
        for wrap in &self.wrappers {
            instance = wrap(instance, &registry)?;
        }
        debug!(
            capability = T::TYPE_PATH,
            name,
            wrappers = self.wrappers.len(),
            "constructed extension singleton"
        );
        Ok(instance)
    }

    fn registry(&self) -> Result<Arc<ExtensionRegistry>, ExtensionError> {
        self.registry.upgrade().ok_or_else(|| {
            CreationFailedSnafu {
                type_path: T::TYPE_PATH.to_string(),
                name: String::new(),
                message: "extension registry dropped".to_string(),
            }
            .build()
        })
    }
}

/// Derive an extension name from a bare provider path: the provider's simple
/// name with the capability's simple name stripped off the end, lowercased.
fn derive_name(provider_path: &str, type_path: &str) -> String {
    let simple = simple_type_name(provider_path);
    let suffix = simple_type_name(type_path);
    let stripped = simple.strip_suffix(suffix).filter(|s| !s.is_empty()).unwrap_or(simple);
    stripped.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    // ---- test capability: Speaker (default + wrappers + adaptive) --------

    trait Speaker: Send + Sync {
        fn say(&self, url: &Url, who: &str) -> Result<String, ExtensionError>;
        /// Adaptive but with no URL anywhere in the signature.
        fn blind(&self) -> Result<String, ExtensionError>;
        /// Not adaptive; must be rejected by the synthetic adaptive.
        fn tone(&self) -> Result<&'static str, ExtensionError>;
    }

    impl std::fmt::Debug for dyn Speaker {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("dyn Speaker").finish()
        }
    }

    struct Plain;
    impl Speaker for Plain {
        fn say(&self, _url: &Url, who: &str) -> Result<String, ExtensionError> {
            Ok(format!("hello {who}"))
        }
        fn blind(&self) -> Result<String, ExtensionError> {
            Ok("plain".to_string())
        }
        fn tone(&self) -> Result<&'static str, ExtensionError> {
            Ok("plain")
        }
    }

    struct Shout;
    impl Speaker for Shout {
        fn say(&self, _url: &Url, who: &str) -> Result<String, ExtensionError> {
            Ok(format!("HELLO {}", who.to_uppercase()))
        }
        fn blind(&self) -> Result<String, ExtensionError> {
            Ok("shout".to_string())
        }
        fn tone(&self) -> Result<&'static str, ExtensionError> {
            Ok("shout")
        }
    }

    struct Bracket(Arc<dyn Speaker>);
    impl Speaker for Bracket {
        fn say(&self, url: &Url, who: &str) -> Result<String, ExtensionError> {
            Ok(format!("[{}]", self.0.say(url, who)?))
        }
        fn blind(&self) -> Result<String, ExtensionError> {
            self.0.blind()
        }
        fn tone(&self) -> Result<&'static str, ExtensionError> {
            self.0.tone()
        }
    }

    struct Dash(Arc<dyn Speaker>);
    impl Speaker for Dash {
        fn say(&self, url: &Url, who: &str) -> Result<String, ExtensionError> {
            Ok(format!("-{}-", self.0.say(url, who)?))
        }
        fn blind(&self) -> Result<String, ExtensionError> {
            self.0.blind()
        }
        fn tone(&self) -> Result<&'static str, ExtensionError> {
            self.0.tone()
        }
    }

    struct AdaptiveSpeaker {
        registry: Weak<ExtensionRegistry>,
    }
    impl Speaker for AdaptiveSpeaker {
        fn say(&self, url: &Url, who: &str) -> Result<String, ExtensionError> {
            let name = resolve_adaptive_name(
                <dyn Speaker as ExtensionPoint>::TYPE_PATH,
                <dyn Speaker as ExtensionPoint>::DEFAULT_NAME,
                "say",
                &["speaker", "speaker.backup"],
                url,
            )?;
            let registry = self.registry.upgrade().expect("registry alive");
            registry.loader::<dyn Speaker>()?.get(&name)?.say(url, who)
        }
        fn blind(&self) -> Result<String, ExtensionError> {
            // Adaptive, but the call carries no URL to resolve against.
            error::AdaptiveUrlMissingSnafu {
                type_path: <dyn Speaker as ExtensionPoint>::TYPE_PATH.to_string(),
                method: "blind".to_string(),
            }
            .fail()
        }
        fn tone(&self) -> Result<&'static str, ExtensionError> {
            error::NonAdaptiveMethodSnafu {
                type_path: <dyn Speaker as ExtensionPoint>::TYPE_PATH.to_string(),
                method: "tone".to_string(),
            }
            .fail()
        }
    }

    fn make_plain(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn Speaker>, ExtensionError> {
        Ok(Arc::new(Plain))
    }
    fn make_shout(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn Speaker>, ExtensionError> {
        Ok(Arc::new(Shout))
    }
    fn wrap_bracket(
        inner: Arc<dyn Speaker>,
        _: &Arc<ExtensionRegistry>,
    ) -> Result<Arc<dyn Speaker>, ExtensionError> {
        Ok(Arc::new(Bracket(inner)))
    }
    fn wrap_dash(
        inner: Arc<dyn Speaker>,
        _: &Arc<ExtensionRegistry>,
    ) -> Result<Arc<dyn Speaker>, ExtensionError> {
        Ok(Arc::new(Dash(inner)))
    }

    impl ExtensionPoint for dyn Speaker {
        const TYPE_PATH: &'static str = "banyan.test.Speaker";
        const DEFAULT_NAME: Option<&'static str> = Some("plain");

        fn providers() -> Vec<ExtensionProvider<Self>> {
            vec![
                ExtensionProvider::named("banyan.test.PlainSpeaker", make_plain),
                ExtensionProvider::named("banyan.test.ShoutSpeaker", make_shout),
                ExtensionProvider::wrapper("banyan.test.BracketSpeakerWrapper", wrap_bracket),
                ExtensionProvider::wrapper("banyan.test.DashSpeakerWrapper", wrap_dash),
            ]
        }

        fn embedded_manifest() -> &'static str {
            "plain = banyan.test.PlainSpeaker\n\
             shout = banyan.test.ShoutSpeaker\n\
             banyan.test.BracketSpeakerWrapper\n\
             banyan.test.DashSpeakerWrapper\n"
        }

        fn synthesize_adaptive(
            registry: &Arc<ExtensionRegistry>,
        ) -> Result<Option<Arc<Self>>, ExtensionError> {
            Ok(Some(Arc::new(AdaptiveSpeaker { registry: Arc::downgrade(registry) })))
        }
    }

    // ---- test capability: Chooser (no default, no adaptive methods) ------

    trait Chooser: Send + Sync {
        fn choose(&self) -> &'static str;
    }

    impl std::fmt::Debug for dyn Chooser {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("dyn Chooser").finish()
        }
    }
    struct Left;
    impl Chooser for Left {
        fn choose(&self) -> &'static str {
            "left"
        }
    }
    fn make_left(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn Chooser>, ExtensionError> {
        Ok(Arc::new(Left))
    }
    impl ExtensionPoint for dyn Chooser {
        const TYPE_PATH: &'static str = "banyan.test.Chooser";
        const DEFAULT_NAME: Option<&'static str> = None;
        fn providers() -> Vec<ExtensionProvider<Self>> {
            vec![ExtensionProvider::named("banyan.test.LeftChooser", make_left)]
        }
        fn embedded_manifest() -> &'static str {
            "left = banyan.test.LeftChooser\n"
        }
    }

    // ---- test capability: Wired (constructor-wired dependency) -----------

    trait Wired: Send + Sync {
        fn relay(&self, url: &Url, who: &str) -> Result<String, ExtensionError>;
    }
    struct Relay {
        speaker: Arc<dyn Speaker>,
    }
    impl Wired for Relay {
        fn relay(&self, url: &Url, who: &str) -> Result<String, ExtensionError> {
            self.speaker.say(url, who)
        }
    }
    fn make_relay(registry: &Arc<ExtensionRegistry>) -> Result<Arc<dyn Wired>, ExtensionError> {
        // Dependencies are wired with the dependency's adaptive handle.
        let speaker = registry.loader::<dyn Speaker>()?.adaptive()?;
        Ok(Arc::new(Relay { speaker }))
    }
    impl ExtensionPoint for dyn Wired {
        const TYPE_PATH: &'static str = "banyan.test.Wired";
        const DEFAULT_NAME: Option<&'static str> = Some("relay");
        fn providers() -> Vec<ExtensionProvider<Self>> {
            vec![ExtensionProvider::named("banyan.test.RelayWired", make_relay)]
        }
        fn embedded_manifest() -> &'static str {
            "relay = banyan.test.RelayWired\n"
        }
    }

    // ---- test capability: Hook (activation) ------------------------------

    trait Hook: Send + Sync {
        fn id(&self) -> &'static str;
    }
    macro_rules! hook_impl {
        ($ty:ident, $ctor:ident, $id:literal) => {
            struct $ty;
            impl Hook for $ty {
                fn id(&self) -> &'static str {
                    $id
                }
            }
            fn $ctor(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn Hook>, ExtensionError> {
                Ok(Arc::new($ty))
            }
        };
    }
    hook_impl!(TraceHook, make_trace, "trace");
    hook_impl!(AuditHook, make_audit, "audit");
    hook_impl!(EchoHook, make_echo, "echo");
    hook_impl!(SpareHook, make_spare, "spare");

    impl ExtensionPoint for dyn Hook {
        const TYPE_PATH: &'static str = "banyan.test.Hook";
        const DEFAULT_NAME: Option<&'static str> = None;
        fn providers() -> Vec<ExtensionProvider<Self>> {
            vec![
                ExtensionProvider::activated(
                    "banyan.test.TraceHook",
                    make_trace,
                    Activation { groups: &["provider"], values: &[], order: 1 },
                ),
                ExtensionProvider::activated(
                    "banyan.test.AuditHook",
                    make_audit,
                    Activation { groups: &["provider"], values: &["audit"], order: 2 },
                ),
                ExtensionProvider::activated(
                    "banyan.test.EchoHook",
                    make_echo,
                    Activation { groups: &["consumer"], values: &[], order: 0 },
                ),
                ExtensionProvider::named("banyan.test.SpareHook", make_spare),
            ]
        }
        fn embedded_manifest() -> &'static str {
            "trace = banyan.test.TraceHook\n\
             audit = banyan.test.AuditHook\n\
             echo = banyan.test.EchoHook\n\
             spare = banyan.test.SpareHook\n"
        }
    }

    // ---- test capability: Ghost (declared nowhere) -----------------------

    trait Ghost: Send + Sync {}
    impl ExtensionPoint for dyn Ghost {
        const TYPE_PATH: &'static str = "banyan.test.Ghost";
        const DEFAULT_NAME: Option<&'static str> = None;
        fn providers() -> Vec<ExtensionProvider<Self>> {
            Vec::new()
        }
    }

    // ---- test capability: Clash (duplicate name) -------------------------

    trait Clash: Send + Sync {}
    struct ClashA;
    impl Clash for ClashA {}
    struct ClashB;
    impl Clash for ClashB {}
    fn make_clash_a(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn Clash>, ExtensionError> {
        Ok(Arc::new(ClashA))
    }
    fn make_clash_b(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn Clash>, ExtensionError> {
        Ok(Arc::new(ClashB))
    }
    impl ExtensionPoint for dyn Clash {
        const TYPE_PATH: &'static str = "banyan.test.Clash";
        const DEFAULT_NAME: Option<&'static str> = None;
        fn providers() -> Vec<ExtensionProvider<Self>> {
            vec![
                ExtensionProvider::named("banyan.test.AClash", make_clash_a),
                ExtensionProvider::named("banyan.test.BClash", make_clash_b),
            ]
        }
        fn embedded_manifest() -> &'static str {
            "same = banyan.test.AClash\nsame = banyan.test.BClash\n"
        }
    }

    // ----------------------------------------------------------------------

    #[test]
    fn test_get_returns_singleton() {
        let registry = ExtensionRegistry::new();
        let loader = registry.loader::<dyn Speaker>().unwrap();
        let a = loader.get("plain").unwrap();
        let b = loader.get("plain").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_true_and_default_alias_default_extension() {
        let registry = ExtensionRegistry::new();
        let loader = registry.loader::<dyn Speaker>().unwrap();
        let by_true = loader.get("true").unwrap();
        let by_name = loader.get("plain").unwrap();
        let by_default = loader.default_extension().unwrap();
        assert!(Arc::ptr_eq(&by_true, &by_name));
        assert!(Arc::ptr_eq(&by_true, &by_default));
    }

    #[test]
    fn test_no_such_extension() {
        let registry = ExtensionRegistry::new();
        let loader = registry.loader::<dyn Speaker>().unwrap();
        let err = loader.get("whisper").unwrap_err();
        assert!(matches!(err, ExtensionError::NoSuchExtension { .. }));
    }

    #[test]
    fn test_wrapper_composition_applied_exactly_once() {
        let registry = ExtensionRegistry::new();
        let loader = registry.loader::<dyn Speaker>().unwrap();
        let speaker = loader.get("plain").unwrap();
        let said = speaker.say(&url("x://h:1/p"), "bob").unwrap();
        // Both wrappers traverse, each exactly once, in manifest order
        // (outermost last-registered).
        assert_eq!(said, "-[hello bob]-");
        // The cached singleton is the wrapped instance; a second get does
        // not re-wrap.
        let again = loader.get("plain").unwrap().say(&url("x://h:1/p"), "bob").unwrap();
        assert_eq!(again, said);
    }

    #[test]
    fn test_adaptive_routes_by_declared_keys() {
        let registry = ExtensionRegistry::new();
        let loader = registry.loader::<dyn Speaker>().unwrap();
        let adaptive = loader.adaptive().unwrap();

        // First key unset, second set: the second wins.
        let u = url("x://h:1/p?speaker.backup=shout");
        assert_eq!(adaptive.say(&u, "bob").unwrap(), "-[HELLO BOB]-");

        // Both unset: the capability default.
        let u = url("x://h:1/p");
        assert_eq!(adaptive.say(&u, "bob").unwrap(), "-[hello bob]-");
    }

    #[test]
    fn test_adaptive_is_cached() {
        let registry = ExtensionRegistry::new();
        let loader = registry.loader::<dyn Speaker>().unwrap();
        let a = loader.adaptive().unwrap();
        let b = loader.adaptive().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_adaptive_method_without_url_fails() {
        let registry = ExtensionRegistry::new();
        let adaptive = registry.loader::<dyn Speaker>().unwrap().adaptive().unwrap();
        let err = adaptive.blind().unwrap_err();
        assert!(matches!(err, ExtensionError::AdaptiveUrlMissing { .. }));
    }

    #[test]
    fn test_non_adaptive_method_rejected_on_adaptive_instance() {
        let registry = ExtensionRegistry::new();
        let adaptive = registry.loader::<dyn Speaker>().unwrap().adaptive().unwrap();
        let err = adaptive.tone().unwrap_err();
        assert!(matches!(err, ExtensionError::NonAdaptiveMethod { .. }));
    }

    #[test]
    fn test_adaptive_without_adaptive_methods_fails() {
        let registry = ExtensionRegistry::new();
        let err = registry.loader::<dyn Chooser>().unwrap().adaptive().unwrap_err();
        assert!(matches!(err, ExtensionError::NoAdaptiveMethod { .. }));
    }

    #[test]
    fn test_constructor_wiring_uses_dependency_adaptive() {
        let registry = ExtensionRegistry::new();
        let wired = registry.loader::<dyn Wired>().unwrap().get("relay").unwrap();
        // The injected handle is the Speaker adaptive: URL routing works.
        let u = url("x://h:1/p?speaker=shout");
        assert_eq!(wired.relay(&u, "ann").unwrap(), "-[HELLO ANN]-");
        let u = url("x://h:1/p");
        assert_eq!(wired.relay(&u, "ann").unwrap(), "-[hello ann]-");
    }

    #[test]
    fn test_not_an_extension_point() {
        let registry = ExtensionRegistry::new();
        let err = registry.loader::<dyn Ghost>().unwrap_err();
        assert!(matches!(err, ExtensionError::NotAnExtensionPoint { .. }));
    }

    #[test]
    fn test_duplicate_extension_name_rejected() {
        let registry = ExtensionRegistry::new();
        let err = registry.loader::<dyn Clash>().unwrap_err();
        assert!(matches!(err, ExtensionError::DuplicateExtension { .. }));
    }

    #[test]
    fn test_activated_auto_block_matches_group_and_url() {
        let registry = ExtensionRegistry::new();
        let loader = registry.loader::<dyn Hook>().unwrap();

        // Group provider, no audit param: only trace activates.
        let u = url("x://h:1/p");
        let ids: Vec<_> =
            loader.activated(&u, "hooks", "provider").unwrap().iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec!["trace"]);

        // audit param present: audit activates after trace (order).
        let u = url("x://h:1/p?audit=true");
        let ids: Vec<_> =
            loader.activated(&u, "hooks", "provider").unwrap().iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec!["trace", "audit"]);

        // Consumer group activates echo only.
        let ids: Vec<_> =
            loader.activated(&u, "hooks", "consumer").unwrap().iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec!["echo"]);
    }

    #[test]
    fn test_activated_user_names_append_and_splice() {
        let registry = ExtensionRegistry::new();
        let loader = registry.loader::<dyn Hook>().unwrap();

        // User names append after the auto block by default.
        let u = url("x://h:1/p?hooks=spare");
        let ids: Vec<_> =
            loader.activated(&u, "hooks", "provider").unwrap().iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec!["trace", "spare"]);

        // `default` splices names before the auto block.
        let u = url("x://h:1/p?hooks=spare,default");
        let ids: Vec<_> =
            loader.activated(&u, "hooks", "provider").unwrap().iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec!["spare", "trace"]);
    }

    #[test]
    fn test_activated_removal_markers() {
        let registry = ExtensionRegistry::new();
        let loader = registry.loader::<dyn Hook>().unwrap();

        let u = url("x://h:1/p?hooks=-trace,spare");
        let ids: Vec<_> =
            loader.activated(&u, "hooks", "provider").unwrap().iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec!["spare"]);

        // `-default` drops the whole auto block.
        let u = url("x://h:1/p?hooks=-default,spare");
        let ids: Vec<_> =
            loader.activated(&u, "hooks", "provider").unwrap().iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec!["spare"]);
    }

    #[test]
    fn test_manifest_roots_extend_embedded_entries() {
        // A manifest on disk can name a compiled-in provider the embedded
        // manifest does not mention.
        trait DiskThing: Send + Sync {
            fn id(&self) -> &'static str;
        }
        struct OnDisk;
        impl DiskThing for OnDisk {
            fn id(&self) -> &'static str {
                "disk"
            }
        }
        fn make_on_disk(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn DiskThing>, ExtensionError> {
            Ok(Arc::new(OnDisk))
        }
        impl ExtensionPoint for dyn DiskThing {
            const TYPE_PATH: &'static str = "banyan.test.DiskThing";
            const DEFAULT_NAME: Option<&'static str> = None;
            fn providers() -> Vec<ExtensionProvider<Self>> {
                vec![ExtensionProvider::named("banyan.test.OnDiskThing", make_on_disk)]
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let services = dir.path().join("services");
        std::fs::create_dir_all(&services).unwrap();
        std::fs::write(services.join("banyan.test.DiskThing"), "ondisk = banyan.test.OnDiskThing\n")
            .unwrap();

        let registry = ExtensionRegistry::with_manifest_roots(vec![dir.path().to_path_buf()]);
        let loader = registry.loader::<dyn DiskThing>().unwrap();
        assert_eq!(loader.get("ondisk").unwrap().id(), "disk");

        // Without the root the capability is not declared at all.
        let bare = ExtensionRegistry::new();
        assert!(matches!(
            bare.loader::<dyn DiskThing>().unwrap_err(),
            ExtensionError::NotAnExtensionPoint { .. }
        ));
    }

    #[test]
    fn test_bare_manifest_entry_derives_name() {
        assert_eq!(derive_name("banyan.test.BracketSpeakerWrapper", "banyan.test.Wrapper"), "bracketspeaker");
        assert_eq!(derive_name("banyan.cluster.FailoverCluster", "banyan.cluster.Cluster"), "failover");
        assert_eq!(derive_name("banyan.cluster.Cluster", "banyan.cluster.Cluster"), "cluster");
    }
}
