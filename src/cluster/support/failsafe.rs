//! Failsafe: failures are logged and swallowed, returning an empty result.

use std::sync::Arc;
use std::sync::Weak;

use tracing::warn;

use crate::cluster::Cluster;
use crate::cluster::Directory;
use crate::cluster::list_invokers;
use crate::cluster::loadbalance_for;
use crate::cluster::select_invoker;
use crate::cluster::support::ClusterInvokerCore;
use crate::extension::ExtensionError;
use crate::extension::ExtensionRegistry;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::RpcError;
use crate::rpc::RpcResult;
use crate::url::Url;

pub(crate) fn provide_failsafe(
    registry: &Arc<ExtensionRegistry>,
) -> Result<Arc<dyn Cluster>, ExtensionError> {
    Ok(Arc::new(FailsafeCluster { registry: Arc::downgrade(registry) }))
}

pub struct FailsafeCluster {
    registry: Weak<ExtensionRegistry>,
}

impl Cluster for FailsafeCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Invoker>, RpcError> {
        Ok(Arc::new(FailsafeClusterInvoker {
            core: ClusterInvokerCore::new(directory),
            registry: self.registry.clone(),
        }))
    }
}

struct FailsafeClusterInvoker {
    core: ClusterInvokerCore,
    registry: Weak<ExtensionRegistry>,
}

impl Invoker for FailsafeClusterInvoker {
    fn url(&self) -> &Url {
        self.core.url()
    }

    fn service(&self) -> &str {
        self.core.service()
    }

    fn is_available(&self) -> bool {
        self.core.is_available()
    }

    fn invoke(&self, invocation: &Invocation) -> Result<RpcResult, RpcError> {
        self.core.check_destroyed()?;
        let attempt = || -> Result<RpcResult, RpcError> {
            let directory = self.core.directory();
            let invokers = list_invokers(directory, invocation)?;
            let loadbalance = loadbalance_for(&self.registry, directory)?;
            let invoker = select_invoker(&loadbalance, &invokers, directory, invocation, &[])?;
            invoker.invoke(invocation)
        };
        match attempt() {
            Ok(result) => Ok(result),
            Err(error) => {
                warn!(
                    service = self.core.service(),
                    method = invocation.method(),
                    error = %error,
                    "failsafe swallowed failure"
                );
                Ok(RpcResult::ok(None))
            }
        }
    }

    fn destroy(&self) {
        self.core.destroy();
    }
}
