//! Mock wrapper: every cluster invoker gets a mock escape hatch.
//!
//! `MockClusterWrapper` is a wrapper extension on `Cluster`, so any policy
//! fetched by name comes back wrapped. The resulting invoker consults the
//! consumer URL's `mock` parameter: `force:…` short-circuits to the mock
//! without dispatching, any other truthy value falls back to the mock when
//! the real call fails with a non-application error.
//!
//! Mock directives: `return <literal>` yields the literal as a string value
//! (`return null` yields no value), `throw[:message]` raises a provider-side
//! failure, a bare `true`/`fail`/`force` behaves like `return null`.

use std::sync::Arc;

use tracing::warn;

use crate::cluster::Cluster;
use crate::cluster::Directory;
use crate::constants::MOCK_KEY;
use crate::extension::ExtensionError;
use crate::extension::ExtensionRegistry;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::RpcError;
use crate::rpc::RpcResult;
use crate::url::Url;

pub(crate) fn provide_mock_wrapper(
    inner: Arc<dyn Cluster>,
    _: &Arc<ExtensionRegistry>,
) -> Result<Arc<dyn Cluster>, ExtensionError> {
    Ok(Arc::new(MockClusterWrapper { inner }))
}

/// Wraps every cluster policy with mock handling.
pub struct MockClusterWrapper {
    inner: Arc<dyn Cluster>,
}

impl MockClusterWrapper {
    pub fn new(inner: Arc<dyn Cluster>) -> Self {
        Self { inner }
    }
}

impl Cluster for MockClusterWrapper {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Invoker>, RpcError> {
        let inner = self.inner.join(directory.clone())?;
        Ok(Arc::new(MockClusterInvoker { directory, inner }))
    }
}

struct MockClusterInvoker {
    directory: Arc<dyn Directory>,
    inner: Arc<dyn Invoker>,
}

impl MockClusterInvoker {
    fn mock_invoke(&self, directive: &str, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        MockInvoker { url: self.directory.url().clone(), directive: directive.to_string() }
            .invoke(invocation)
    }
}

impl Invoker for MockClusterInvoker {
    fn url(&self) -> &Url {
        self.directory.url()
    }

    fn service(&self) -> &str {
        self.inner.service()
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn invoke(&self, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        let mock = self.directory.url().param_or(MOCK_KEY, "").trim().to_string();
        if mock.is_empty() || mock == "false" {
            return self.inner.invoke(invocation);
        }
        if let Some(directive) = mock.strip_prefix("force") {
            // Short-circuit before any dispatch.
            return self.mock_invoke(directive.trim_start_matches(':').trim(), invocation);
        }
        let directive = mock.strip_prefix("fail").map(|d| d.trim_start_matches(':').trim());
        match self.inner.invoke(invocation) {
            Ok(result) => Ok(result),
            Err(error) if !error.is_application() => {
                warn!(
                    service = self.service(),
                    method = invocation.method(),
                    error = %error,
                    "falling back to mock"
                );
                self.mock_invoke(directive.unwrap_or(mock.as_str()), invocation)
            }
            Err(error) => Err(error),
        }
    }

    fn destroy(&self) {
        self.inner.destroy();
    }
}

/// Interprets a mock directive as an invoker.
struct MockInvoker {
    url: Url,
    directive: String,
}

impl Invoker for MockInvoker {
    fn url(&self) -> &Url {
        &self.url
    }

    fn service(&self) -> &str {
        self.url.service_interface()
    }

    fn is_available(&self) -> bool {
        true
    }

    fn invoke(&self, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        let directive = self.directive.trim();
        if let Some(value) = directive.strip_prefix("return") {
            let value = value.trim();
            if value.is_empty() || value == "null" || value == "empty" {
                return Ok(RpcResult::ok(None));
            }
            return Ok(RpcResult::from_value(value.to_string()));
        }
        if let Some(message) = directive.strip_prefix("throw") {
            let message = message.trim_start_matches(':').trim();
            return Err(RpcError::ServerSide {
                method: invocation.method().to_string(),
                message: if message.is_empty() { "mocked failure".to_string() } else { message.to_string() },
            });
        }
        // Bare truthy directives behave like `return null`.
        Ok(RpcResult::ok(None))
    }

    fn destroy(&self) {}
}
