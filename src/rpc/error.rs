//! RPC failure taxonomy.
//!
//! Cluster policies classify these kinds: only [`RpcError::Timeout`] and
//! [`RpcError::Network`] are retryable; everything else bubbles to the
//! caller unchanged.

use snafu::Snafu;

use crate::dispatch::DispatchError;
use crate::extension::ExtensionError;
use crate::registry::RegistryError;
use crate::url::UrlError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RpcError {
    /// The call did not complete within its deadline.
    #[snafu(display("invocation of {method:?} timed out after {elapsed_ms}ms"))]
    Timeout { method: String, elapsed_ms: u64 },

    /// The transport could not reach (or lost) the provider.
    #[snafu(display("network failure calling {target}: {message}"))]
    Network { target: String, message: String },

    /// The provider ran the method and it failed; never retried.
    #[snafu(display("provider-side failure in {method:?}: {message}"))]
    ServerSide { method: String, message: String },

    /// Every provider was withdrawn or access was denied.
    #[snafu(display("service {service} is forbidden: no providers available"))]
    Forbidden { service: String },

    /// An argument or return value could not cross the call boundary.
    #[snafu(display("serialization failure: {message}"))]
    Serialization { message: String },

    /// A registry export URL carries no nested `export` parameter.
    #[snafu(display("registry URL {url} carries no export parameter"))]
    ExportMissing { url: String },

    /// The directory produced no invoker that is currently available.
    #[snafu(display("no available invoker for {service} among {total} known"))]
    NoAvailableInvoker { service: String, total: usize },

    /// The invoker was destroyed before or during the call.
    #[snafu(display("invoker for {service} is destroyed"))]
    Destroyed { service: String },

    /// Registering with the registry backend failed.
    #[snafu(display("registration with the registry failed"))]
    Registration { source: RegistryError },

    /// Subscribing to the registry backend failed.
    #[snafu(display("registry subscription failed"))]
    Subscription { source: RegistryError },

    /// Extension resolution failed while assembling the call path.
    #[snafu(context(false), display("extension failure: {source}"))]
    Extension { source: ExtensionError },

    /// The method dispatcher rejected the call.
    #[snafu(context(false), display("dispatch failure: {source}"))]
    Dispatch { source: DispatchError },

    /// A nested or constructed URL failed to parse.
    #[snafu(context(false), display("invalid URL: {source}"))]
    InvalidUrl { source: UrlError },
}

impl RpcError {
    /// Retryable kinds may be attempted on a different replica.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Timeout { .. } | RpcError::Network { .. })
    }

    /// Application-level failures raised by the provider itself; mock
    /// fallback never masks these.
    pub fn is_application(&self) -> bool {
        matches!(self, RpcError::ServerSide { .. })
    }
}
