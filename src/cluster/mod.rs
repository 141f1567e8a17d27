//! Cluster layer: one invoker fronting a dynamic replica set.
//!
//! A [`Cluster`] policy joins a [`Directory`](directory::Directory) into a
//! single consumer-side invoker. Policies are extensions; `failover` is the
//! default and every cluster invoker is mock-wrapped by the
//! [`support::MockClusterWrapper`] wrapper extension.

pub mod configurator;
pub mod directory;
pub mod loadbalance;
pub mod router;
pub mod support;

pub use configurator::Configurator;
pub use directory::Directory;
pub use directory::StaticDirectory;
pub use loadbalance::LoadBalance;
pub use router::Router;
pub use router::RouterChain;

use std::sync::Arc;
use std::sync::Weak;

use crate::constants::CLUSTER_KEY;
use crate::constants::DEFAULT_LOADBALANCE;
use crate::constants::LOADBALANCE_KEY;
use crate::extension::ExtensionError;
use crate::extension::ExtensionPoint;
use crate::extension::ExtensionProvider;
use crate::extension::ExtensionRegistry;
use crate::extension::resolve_adaptive_name;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::RpcError;
use crate::rpc::error::NoAvailableInvokerSnafu;

/// Joins a directory of replicas into one invoker.
pub trait Cluster: Send + Sync {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Invoker>, RpcError>;
}

impl ExtensionPoint for dyn Cluster {
    const TYPE_PATH: &'static str = "banyan.cluster.Cluster";
    const DEFAULT_NAME: Option<&'static str> = Some(crate::constants::DEFAULT_CLUSTER);

    fn providers() -> Vec<ExtensionProvider<Self>> {
        vec![
            ExtensionProvider::named("banyan.cluster.support.FailoverCluster", support::provide_failover),
            ExtensionProvider::named("banyan.cluster.support.FailfastCluster", support::provide_failfast),
            ExtensionProvider::named("banyan.cluster.support.FailsafeCluster", support::provide_failsafe),
            ExtensionProvider::named("banyan.cluster.support.ForkingCluster", support::provide_forking),
            ExtensionProvider::named("banyan.cluster.support.BroadcastCluster", support::provide_broadcast),
            ExtensionProvider::named("banyan.cluster.support.MergeableCluster", support::provide_mergeable),
            ExtensionProvider::wrapper(
                "banyan.cluster.support.MockClusterWrapper",
                support::provide_mock_wrapper,
            ),
        ]
    }

    fn embedded_manifest() -> &'static str {
        "failover = banyan.cluster.support.FailoverCluster\n\
         failfast = banyan.cluster.support.FailfastCluster\n\
         failsafe = banyan.cluster.support.FailsafeCluster\n\
         forking = banyan.cluster.support.ForkingCluster\n\
         broadcast = banyan.cluster.support.BroadcastCluster\n\
         mergeable = banyan.cluster.support.MergeableCluster\n\
         mock = banyan.cluster.support.MockClusterWrapper\n"
    }

    fn synthesize_adaptive(
        registry: &Arc<ExtensionRegistry>,
    ) -> Result<Option<Arc<Self>>, ExtensionError> {
        Ok(Some(Arc::new(AdaptiveCluster { registry: Arc::downgrade(registry) })))
    }
}

/// Synthetic adaptive cluster: the URL comes from the directory argument.
struct AdaptiveCluster {
    registry: Weak<ExtensionRegistry>,
}

impl Cluster for AdaptiveCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Invoker>, RpcError> {
        let name = resolve_adaptive_name(
            <dyn Cluster as ExtensionPoint>::TYPE_PATH,
            <dyn Cluster as ExtensionPoint>::DEFAULT_NAME,
            "join",
            &[CLUSTER_KEY],
            directory.url(),
        )?;
        let registry = self.registry.upgrade().ok_or_else(|| RpcError::Network {
            target: directory.url().address(),
            message: "extension registry dropped".to_string(),
        })?;
        let cluster = registry.loader::<dyn Cluster>()?.get(&name)?;
        cluster.join(directory)
    }
}

/// Resolve the directory's configured load balancer.
pub(crate) fn loadbalance_for(
    registry: &Weak<ExtensionRegistry>,
    directory: &Arc<dyn Directory>,
) -> Result<Arc<dyn LoadBalance>, RpcError> {
    let name = directory.url().param_or(LOADBALANCE_KEY, DEFAULT_LOADBALANCE).to_string();
    let registry = registry.upgrade().ok_or_else(|| RpcError::Network {
        target: directory.url().address(),
        message: "extension registry dropped".to_string(),
    })?;
    Ok(registry.loader::<dyn LoadBalance>()?.get(&name)?)
}

/// List the directory, rejecting an empty replica set.
pub(crate) fn list_invokers(
    directory: &Arc<dyn Directory>,
    invocation: &Invocation,
) -> Result<Vec<Arc<dyn Invoker>>, RpcError> {
    let invokers = directory.list(invocation)?;
    if invokers.is_empty() {
        return NoAvailableInvokerSnafu { service: directory.service().to_string(), total: 0usize }
            .fail();
    }
    Ok(invokers)
}

/// Pick an invoker, preferring available replicas not yet tried in this
/// call. Falls back to any available replica before giving up.
pub(crate) fn select_invoker(
    loadbalance: &Arc<dyn LoadBalance>,
    invokers: &[Arc<dyn Invoker>],
    directory: &Arc<dyn Directory>,
    invocation: &Invocation,
    selected: &[Arc<dyn Invoker>],
) -> Result<Arc<dyn Invoker>, RpcError> {
    let untried: Vec<Arc<dyn Invoker>> = invokers
        .iter()
        .filter(|i| i.is_available() && !selected.iter().any(|s| Arc::ptr_eq(s, i)))
        .cloned()
        .collect();
    if !untried.is_empty() {
        return loadbalance.select(&untried, directory.url(), invocation);
    }
    let available: Vec<Arc<dyn Invoker>> =
        invokers.iter().filter(|i| i.is_available()).cloned().collect();
    if !available.is_empty() {
        return loadbalance.select(&available, directory.url(), invocation);
    }
    NoAvailableInvokerSnafu { service: directory.service().to_string(), total: invokers.len() }
        .fail()
}
