//! Cluster policies and the mock wrapper.

mod broadcast;
mod failfast;
mod failover;
mod failsafe;
mod forking;
mod mergeable;
mod mock;

pub use broadcast::BroadcastCluster;
pub use failfast::FailfastCluster;
pub use failover::FailoverCluster;
pub use failsafe::FailsafeCluster;
pub use forking::ForkingCluster;
pub use mergeable::MergeableCluster;
pub use mock::MockClusterWrapper;

pub(crate) use broadcast::provide_broadcast;
pub(crate) use failfast::provide_failfast;
pub(crate) use failover::provide_failover;
pub(crate) use failsafe::provide_failsafe;
pub(crate) use forking::provide_forking;
pub(crate) use mergeable::provide_mergeable;
pub(crate) use mock::provide_mock_wrapper;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::cluster::Directory;
use crate::rpc::RpcError;
use crate::url::Url;

/// State every cluster invoker shares: the directory and the destroy flag.
pub(crate) struct ClusterInvokerCore {
    directory: Arc<dyn Directory>,
    destroyed: AtomicBool,
}

impl ClusterInvokerCore {
    pub(crate) fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory, destroyed: AtomicBool::new(false) }
    }

    pub(crate) fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub(crate) fn url(&self) -> &Url {
        self.directory.url()
    }

    pub(crate) fn service(&self) -> &str {
        self.directory.service()
    }

    pub(crate) fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && self.directory.is_available()
    }

    pub(crate) fn check_destroyed(&self) -> Result<(), RpcError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RpcError::Destroyed { service: self.directory.service().to_string() });
        }
        Ok(())
    }

    pub(crate) fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.directory.destroy();
        }
    }
}
