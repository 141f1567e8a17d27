//! Broadcast: call every replica; any failure fails the call after all ran.

use std::sync::Arc;

use tracing::warn;

use crate::cluster::Cluster;
use crate::cluster::Directory;
use crate::cluster::list_invokers;
use crate::cluster::support::ClusterInvokerCore;
use crate::extension::ExtensionError;
use crate::extension::ExtensionRegistry;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::RpcError;
use crate::rpc::RpcResult;
use crate::url::Url;

pub(crate) fn provide_broadcast(
    _: &Arc<ExtensionRegistry>,
) -> Result<Arc<dyn Cluster>, ExtensionError> {
    Ok(Arc::new(BroadcastCluster))
}

pub struct BroadcastCluster;

impl Cluster for BroadcastCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Invoker>, RpcError> {
        Ok(Arc::new(BroadcastClusterInvoker { core: ClusterInvokerCore::new(directory) }))
    }
}

struct BroadcastClusterInvoker {
    core: ClusterInvokerCore,
}

impl Invoker for BroadcastClusterInvoker {
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
        let invokers = list_invokers(self.core.directory(), invocation)?;
        let mut last_error = None;
        let mut last_result = None;
        for invoker in invokers {
            match invoker.invoke(invocation) {
                Ok(result) => last_result = Some(result),
                Err(error) => {
                    warn!(
                        service = self.core.service(),
                        provider = %invoker.url().address(),
                        error = %error,
                        "broadcast leg failed"
                    );
                    last_error = Some(error);
                }
            }
        }
        match last_error {
            Some(error) => Err(error),
            None => Ok(last_result.unwrap_or_else(|| RpcResult::ok(None))),
        }
    }

    fn destroy(&self) {
        self.core.destroy();
    }
}
