//! The call-site abstraction: invocations, results, invokers, exporters.
//!
//! An [`Invoker`] is anything callable with an [`Invocation`] yielding an
//! [`RpcResult`]; an [`Exporter`] is a locally-live endpoint that can be
//! torn down. Every layer above — filters, clusters, the registry protocol —
//! composes these two traits.

pub(crate) mod error;
pub mod filter;
pub mod local;
pub mod protocol;
pub mod proxy;

pub use error::RpcError;
pub use filter::Filter;
pub use local::LocalProtocol;
pub use protocol::Protocol;
pub use proxy::ProxyFactory;
pub use proxy::ServiceModel;
pub use proxy::ServiceProxy;

use std::any::Any;
use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::url::Url;

/// A boxed argument or return value.
pub type Value = crate::dispatch::Value;

/// One call: method, exact parameter types, arguments, attachments.
///
/// Arguments are read by reference so a cluster policy can replay the same
/// invocation against another replica.
pub struct Invocation {
    method: String,
    param_types: Vec<TypeId>,
    args: Vec<Value>,
    attachments: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            param_types: Vec::new(),
            args: Vec::new(),
            attachments: BTreeMap::new(),
        }
    }

    /// Append an argument; its parameter type is recorded from `A`.
    pub fn with_arg<A: Any + Send + Sync>(mut self, arg: A) -> Self {
        self.param_types.push(TypeId::of::<A>());
        self.args.push(Box::new(arg));
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn param_types(&self) -> &[TypeId] {
        &self.param_types
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }

    pub fn attachments(&self) -> &BTreeMap<String, String> {
        &self.attachments
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("method", &self.method)
            .field("args", &self.args.len())
            .field("attachments", &self.attachments)
            .finish()
    }
}

/// Outcome of one call: a value or an exception, plus attachments.
pub struct RpcResult {
    outcome: Result<Option<Value>, RpcError>,
    attachments: BTreeMap<String, String>,
}

impl RpcResult {
    /// A successful result carrying `value` (`None` for unit returns).
    pub fn ok(value: Option<Value>) -> Self {
        Self { outcome: Ok(value), attachments: BTreeMap::new() }
    }

    /// A successful result carrying a typed value.
    pub fn from_value<T: Any + Send + Sync>(value: T) -> Self {
        Self::ok(Some(Box::new(value)))
    }

    /// A result carrying the provider-side exception.
    pub fn exception(error: RpcError) -> Self {
        Self { outcome: Err(error), attachments: BTreeMap::new() }
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    pub fn set_attachment(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attachments.insert(key.into(), value.into());
    }

    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&Value> {
        self.outcome.as_ref().ok().and_then(|v| v.as_ref())
    }

    /// Borrow the value downcast to `T`.
    pub fn value_as<T: Any>(&self) -> Option<&T> {
        self.value().and_then(|v| v.downcast_ref::<T>())
    }

    pub fn error(&self) -> Option<&RpcError> {
        self.outcome.as_ref().err()
    }

    /// Surface the outcome the way the caller sees it: value or error.
    pub fn into_value(self) -> Result<Option<Value>, RpcError> {
        self.outcome
    }
}

impl std::fmt::Debug for RpcResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcResult")
            .field("ok", &self.outcome.is_ok())
            .field("attachments", &self.attachments)
            .finish()
    }
}

/// Something callable with an [`Invocation`].
///
/// Once destroyed, `is_available` is false and `invoke` fails; `destroy` is
/// idempotent.
pub trait Invoker: Send + Sync {
    /// The URL this invoker advertises.
    fn url(&self) -> &Url;

    /// Service interface name.
    fn service(&self) -> &str;

    /// Readiness without blocking.
    fn is_available(&self) -> bool;

    fn invoke(&self, invocation: &Invocation) -> Result<RpcResult, RpcError>;

    fn destroy(&self);
}

impl std::fmt::Debug for dyn Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Invoker").field("url", self.url()).field("service", &self.service()).finish()
    }
}

/// A locally-live endpoint handle; `unexport` is idempotent and detaches
/// the invoker from every side channel before destroying it.
pub trait Exporter: Send + Sync {
    fn invoker(&self) -> Arc<dyn Invoker>;
    fn unexport(&self);
}

/// An invoker that delegates calls but advertises a different URL. Local
/// export and reexport run the provider URL through this so the transport
/// sees the configured URL, not the registry one.
///
/// The delegate does not own the wrapped invoker: destroying it retires the
/// delegate only, because the same origin invoker backs every re-export of
/// a service. The registry protocol destroys the origin itself once the
/// final unexport's grace period elapses.
pub struct InvokerDelegate {
    inner: Arc<dyn Invoker>,
    url: Url,
    retired: std::sync::atomic::AtomicBool,
}

impl InvokerDelegate {
    pub fn new(inner: Arc<dyn Invoker>, url: Url) -> Self {
        Self { inner, url, retired: std::sync::atomic::AtomicBool::new(false) }
    }

    pub fn inner(&self) -> &Arc<dyn Invoker> {
        &self.inner
    }
}

impl Invoker for InvokerDelegate {
    fn url(&self) -> &Url {
        &self.url
    }

    fn service(&self) -> &str {
        self.inner.service()
    }

    fn is_available(&self) -> bool {
        !self.retired.load(std::sync::atomic::Ordering::SeqCst) && self.inner.is_available()
    }

    fn invoke(&self, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        if self.retired.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RpcError::Destroyed { service: self.service().to_string() });
        }
        self.inner.invoke(invocation)
    }

    fn destroy(&self) {
        self.retired.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_records_param_types() {
        let inv = Invocation::new("hello").with_arg("x".to_string()).with_arg(3u64);
        assert_eq!(inv.method(), "hello");
        assert_eq!(inv.param_types(), &[TypeId::of::<String>(), TypeId::of::<u64>()]);
        assert_eq!(inv.args().len(), 2);
        assert_eq!(inv.args()[0].downcast_ref::<String>().unwrap(), "x");
    }

    #[test]
    fn test_result_value_access() {
        let result = RpcResult::from_value("out".to_string()).with_attachment("k", "v");
        assert!(result.is_ok());
        assert_eq!(result.value_as::<String>().unwrap(), "out");
        assert_eq!(result.attachment("k"), Some("v"));

        let err = RpcResult::exception(RpcError::Forbidden { service: "s".into() });
        assert!(!err.is_ok());
        assert!(matches!(err.error(), Some(RpcError::Forbidden { .. })));
        assert!(err.into_value().is_err());
    }
}
