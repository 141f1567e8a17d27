//! Failover: retry retryable failures on a different replica.

use std::sync::Arc;
use std::sync::Weak;

use tracing::warn;

use crate::cluster::Cluster;
use crate::cluster::Directory;
use crate::cluster::list_invokers;
use crate::cluster::loadbalance_for;
use crate::cluster::select_invoker;
use crate::cluster::support::ClusterInvokerCore;
use crate::constants::DEFAULT_RETRIES;
use crate::constants::RETRIES_KEY;
use crate::extension::ExtensionError;
use crate::extension::ExtensionRegistry;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::RpcError;
use crate::rpc::RpcResult;
use crate::url::Url;

pub(crate) fn provide_failover(
    registry: &Arc<ExtensionRegistry>,
) -> Result<Arc<dyn Cluster>, ExtensionError> {
    Ok(Arc::new(FailoverCluster { registry: Arc::downgrade(registry) }))
}

/// The default cluster policy.
pub struct FailoverCluster {
    registry: Weak<ExtensionRegistry>,
}

impl Cluster for FailoverCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Invoker>, RpcError> {
        Ok(Arc::new(FailoverClusterInvoker {
            core: ClusterInvokerCore::new(directory),
            registry: self.registry.clone(),
        }))
    }
}

struct FailoverClusterInvoker {
    core: ClusterInvokerCore,
    registry: Weak<ExtensionRegistry>,
}

impl Invoker for FailoverClusterInvoker {
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
        let mut invokers = list_invokers(directory, invocation)?;
        let loadbalance = loadbalance_for(&self.registry, directory)?;

        let attempts = self.core.url().u64_param(RETRIES_KEY, DEFAULT_RETRIES) + 1;
        let mut selected: Vec<Arc<dyn Invoker>> = Vec::new();
        let mut last_error: Option<RpcError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                // The set may have changed while the previous attempt ran.
                self.core.check_destroyed()?;
                invokers = list_invokers(directory, invocation)?;
            }
            let invoker =
                select_invoker(&loadbalance, &invokers, directory, invocation, &selected)?;
            selected.push(invoker.clone());
            match invoker.invoke(invocation) {
                Ok(result) => {
                    if attempt > 0 {
                        warn!(
                            service = self.core.service(),
                            method = invocation.method(),
                            attempt,
                            "call succeeded after failover"
                        );
                    }
                    return Ok(result);
                }
                Err(error) if error.is_retryable() => {
                    warn!(
                        service = self.core.service(),
                        method = invocation.method(),
                        provider = %invoker.url().address(),
                        error = %error,
                        "retryable failure, failing over"
                    );
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| RpcError::NoAvailableInvoker {
            service: self.core.service().to_string(),
            total: selected.len(),
        }))
    }

    fn destroy(&self) {
        self.core.destroy();
    }
}
