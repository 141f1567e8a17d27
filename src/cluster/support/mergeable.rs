//! Mergeable: call one replica per group and collect the values.
//!
//! Selected by the registry protocol when a consumer refers multiple groups
//! (`group=a,b` or `group=*`). The merged result is the `Vec` of the
//! per-group values in invocation order; legs that fail are logged and
//! skipped, and the call fails only when every leg failed.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::warn;

use crate::cluster::Cluster;
use crate::cluster::Directory;
use crate::cluster::list_invokers;
use crate::cluster::support::ClusterInvokerCore;
use crate::constants::GROUP_KEY;
use crate::extension::ExtensionError;
use crate::extension::ExtensionRegistry;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::RpcError;
use crate::rpc::RpcResult;
use crate::rpc::Value;
use crate::url::Url;

pub(crate) fn provide_mergeable(
    _: &Arc<ExtensionRegistry>,
) -> Result<Arc<dyn Cluster>, ExtensionError> {
    Ok(Arc::new(MergeableCluster))
}

pub struct MergeableCluster;

impl Cluster for MergeableCluster {
    fn join(&self, directory: Arc<dyn Directory>) -> Result<Arc<dyn Invoker>, RpcError> {
        Ok(Arc::new(MergeableClusterInvoker { core: ClusterInvokerCore::new(directory) }))
    }
}

struct MergeableClusterInvoker {
    core: ClusterInvokerCore,
}

impl Invoker for MergeableClusterInvoker {
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

        // One leg per distinct group; the first invoker of each group wins.
        let mut seen_groups = BTreeSet::new();
        let mut legs = Vec::new();
        for invoker in invokers {
            let group = invoker.url().param_or(GROUP_KEY, "").to_string();
            if seen_groups.insert(group) {
                legs.push(invoker);
            }
        }

        let mut values: Vec<Value> = Vec::new();
        let mut last_error = None;
        let mut successes = 0usize;
        for leg in &legs {
            match leg.invoke(invocation) {
                Ok(result) => {
                    successes += 1;
                    if let Ok(Some(value)) = result.into_value() {
                        values.push(value);
                    }
                }
                Err(error) => {
                    warn!(
                        service = self.core.service(),
                        provider = %leg.url().address(),
                        error = %error,
                        "mergeable leg failed"
                    );
                    last_error = Some(error);
                }
            }
        }
        if successes == 0 {
            if let Some(error) = last_error {
                return Err(error);
            }
        }
        Ok(RpcResult::from_value(values))
    }

    fn destroy(&self) {
        self.core.destroy();
    }
}
