//! Core of a service-oriented RPC framework.
//!
//! Two subsystems carry the weight: a pluggable, self-adaptive
//! [`extension`] registry that resolves implementations at call time from
//! URL parameters, and a [`registry`] integration layer that composes a
//! registry-aware protocol with the [`cluster`] directory layer to export
//! and refer services through a hierarchy of invokers with dynamic
//! reconfiguration.
//!
//! # Layers
//! - [`url`]: the immutable endpoint descriptor threaded through every call
//! - [`extension`]: manifests, named/wrapper/adaptive composition, activation
//! - [`dispatch`]: per-type method and property dispatch tables
//! - [`rpc`]: invocations, results, invokers, exporters, filters, proxies
//! - [`cluster`]: directories, routers, load balancing, fault tolerance
//! - [`registry`]: registration contracts and the registry protocol
//! - [`config`]: push-updated dynamic configuration
//!
//! # Lifecycle
//! Everything hangs off an explicit [`extension::ExtensionRegistry`] handle
//! created at startup; there are no process-wide singletons. Dropping the
//! handle (after destroying exported services) releases every extension.
//!
//! ```no_run
//! use banyan::extension::ExtensionRegistry;
//! use banyan::rpc::Protocol;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ExtensionRegistry::new();
//! let protocol = registry.loader::<dyn Protocol>()?.adaptive()?;
//! // protocol.export(...) / protocol.refer(...)
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod extension;
pub mod registry;
pub mod rpc;
pub mod url;

pub use url::Url;
