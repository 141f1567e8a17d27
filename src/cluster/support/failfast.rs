//! Failfast: one attempt, failures surface immediately.

use std::sync::Arc;
use std::sync::Weak;

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

pub(crate) fn provide_failfast(
    registry: &Arc<ExtensionRegistry>,
) -> Result<Arc<dyn Cluster>, ExtensionError> {
    Ok(Arc::new(FailfastCluster { registry: Arc::downgrade(registry) }))
}

pub struct FailfastCluster {
    registry: Weak<ExtensionRegistry>,
}

impl Cluster for FailfastCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Invoker>, RpcError> {
        Ok(Arc::new(FailfastClusterInvoker {
            core: ClusterInvokerCore::new(directory),
            registry: self.registry.clone(),
        }))
    }
}

struct FailfastClusterInvoker {
    core: ClusterInvokerCore,
    registry: Weak<ExtensionRegistry>,
}

impl Invoker for FailfastClusterInvoker {
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
        let directory = self.core.directory();
        let invokers = list_invokers(directory, invocation)?;
        let loadbalance = loadbalance_for(&self.registry, directory)?;
        let invoker = select_invoker(&loadbalance, &invokers, directory, invocation, &[])?;
        invoker.invoke(invocation)
    }

    fn destroy(&self) {
        self.core.destroy();
    }
}
