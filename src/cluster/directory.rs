//! Directories: dynamic sets of sibling invokers for one service.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::RpcError;
use crate::url::Url;

/// Produces the current, router-filtered replica set for a service.
pub trait Directory: Send + Sync {
    /// The consumer URL this directory was built from.
    fn url(&self) -> &Url;

    /// Service interface name.
    fn service(&self) -> &str;

    /// The invokers a call may currently go to.
    fn list(&self, invocation: &Invocation) -> Result<Vec<Arc<dyn Invoker>>, RpcError>;

    fn is_available(&self) -> bool;

    fn destroy(&self);
}

/// A fixed invoker set; used when the caller already holds the replicas.
pub struct StaticDirectory {
    url: Url,
    service: String,
    invokers: Vec<Arc<dyn Invoker>>,
    destroyed: AtomicBool,
}

impl StaticDirectory {
    pub fn new(url: Url, invokers: Vec<Arc<dyn Invoker>>) -> Self {
        let service = url.service_interface().to_string();
        Self { url, service, invokers, destroyed: AtomicBool::new(false) }
    }
}

impl Directory for StaticDirectory {
    fn url(&self) -> &Url {
        &self.url
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn list(&self, _invocation: &Invocation) -> Result<Vec<Arc<dyn Invoker>>, RpcError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RpcError::Destroyed { service: self.service.clone() });
        }
        Ok(self.invokers.clone())
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst) && self.invokers.iter().any(|i| i.is_available())
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for invoker in &self.invokers {
            invoker.destroy();
        }
    }
}
