//! Forking: race several replicas, first success wins.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::mpsc;

use crate::cluster::Cluster;
use crate::cluster::Directory;
use crate::cluster::list_invokers;
use crate::cluster::loadbalance_for;
use crate::cluster::select_invoker;
use crate::cluster::support::ClusterInvokerCore;
use crate::constants::DEFAULT_FORKS;
use crate::constants::FORKS_KEY;
use crate::extension::ExtensionError;
use crate::extension::ExtensionRegistry;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::RpcError;
use crate::rpc::RpcResult;
use crate::url::Url;

pub(crate) fn provide_forking(
    registry: &Arc<ExtensionRegistry>,
) -> Result<Arc<dyn Cluster>, ExtensionError> {
    Ok(Arc::new(ForkingCluster { registry: Arc::downgrade(registry) }))
}

pub struct ForkingCluster {
    registry: Weak<ExtensionRegistry>,
}

impl Cluster for ForkingCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Invoker>, RpcError> {
        Ok(Arc::new(ForkingClusterInvoker {
            core: ClusterInvokerCore::new(directory),
            registry: self.registry.clone(),
        }))
    }
}

struct ForkingClusterInvoker {
    core: ClusterInvokerCore,
    registry: Weak<ExtensionRegistry>,
}

impl Invoker for ForkingClusterInvoker {
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
        let forks = self.core.url().u64_param(FORKS_KEY, DEFAULT_FORKS).max(1) as usize;

        let mut targets: Vec<Arc<dyn Invoker>> = Vec::new();
        if forks >= invokers.len() {
            targets = invokers;
        } else {
            let loadbalance = loadbalance_for(&self.registry, directory)?;
            while targets.len() < forks {
                let picked =
                    select_invoker(&loadbalance, &invokers, directory, invocation, &targets)?;
                targets.push(picked);
            }
        }

        let (sender, receiver) = mpsc::channel::<Result<RpcResult, RpcError>>();
        let expected = targets.len();
        std::thread::scope(|scope| {
            for target in &targets {
                let sender = sender.clone();
                scope.spawn(move || {
                    let _ = sender.send(target.invoke(invocation));
                });
            }
            let mut last_error = None;
            for _ in 0..expected {
                match receiver.recv() {
                    Ok(Ok(result)) => return Ok(result),
                    Ok(Err(error)) => last_error = Some(error),
                    Err(_) => break,
                }
            }
            Err(last_error.unwrap_or_else(|| RpcError::NoAvailableInvoker {
                service: self.core.service().to_string(),
                total: expected,
            }))
        })
    }

    fn destroy(&self) {
        self.core.destroy();
    }
}
