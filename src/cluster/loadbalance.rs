//! Load balancing capability.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use rand::Rng;

use crate::constants::LOADBALANCE_KEY;
use crate::constants::WEIGHT_KEY;
use crate::extension::ExtensionError;
use crate::extension::ExtensionPoint;
use crate::extension::ExtensionProvider;
use crate::extension::ExtensionRegistry;
use crate::extension::resolve_adaptive_name;
use crate::rpc::Invocation;
use crate::rpc::Invoker;
use crate::rpc::RpcError;
use crate::rpc::error::NoAvailableInvokerSnafu;
use crate::url::Url;

/// Default provider weight when a URL names none.
const DEFAULT_WEIGHT: u64 = 100;

/// Picks one invoker out of a non-empty candidate set.
pub trait LoadBalance: Send + Sync {
    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        url: &Url,
        invocation: &Invocation,
    ) -> Result<Arc<dyn Invoker>, RpcError>;
}

impl ExtensionPoint for dyn LoadBalance {
    const TYPE_PATH: &'static str = "banyan.cluster.LoadBalance";
    const DEFAULT_NAME: Option<&'static str> = Some(crate::constants::DEFAULT_LOADBALANCE);

    fn providers() -> Vec<ExtensionProvider<Self>> {
        vec![
            ExtensionProvider::named("banyan.cluster.RandomLoadBalance", provide_random),
            ExtensionProvider::named("banyan.cluster.RoundRobinLoadBalance", provide_roundrobin),
        ]
    }

    fn embedded_manifest() -> &'static str {
        "random = banyan.cluster.RandomLoadBalance\n\
         roundrobin = banyan.cluster.RoundRobinLoadBalance\n"
    }

    fn synthesize_adaptive(
        registry: &Arc<ExtensionRegistry>,
    ) -> Result<Option<Arc<Self>>, ExtensionError> {
        Ok(Some(Arc::new(AdaptiveLoadBalance { registry: Arc::downgrade(registry) })))
    }
}

fn provide_random(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn LoadBalance>, ExtensionError> {
    Ok(Arc::new(RandomLoadBalance))
}

fn provide_roundrobin(_: &Arc<ExtensionRegistry>) -> Result<Arc<dyn LoadBalance>, ExtensionError> {
    Ok(Arc::new(RoundRobinLoadBalance::new()))
}

fn ensure_candidates(
    invokers: &[Arc<dyn Invoker>],
    url: &Url,
) -> Result<(), RpcError> {
    if invokers.is_empty() {
        return NoAvailableInvokerSnafu {
            service: url.service_interface().to_string(),
            total: 0usize,
        }
        .fail();
    }
    Ok(())
}

fn weight_of(invoker: &Arc<dyn Invoker>) -> u64 {
    invoker.url().u64_param(WEIGHT_KEY, DEFAULT_WEIGHT)
}

/// Weighted random selection (the default policy).
pub struct RandomLoadBalance;

impl LoadBalance for RandomLoadBalance {
    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        url: &Url,
        _invocation: &Invocation,
    ) -> Result<Arc<dyn Invoker>, RpcError> {
        ensure_candidates(invokers, url)?;
        let weights: Vec<u64> = invokers.iter().map(weight_of).collect();
        let total: u64 = weights.iter().sum();
        let uniform = total == 0 || weights.iter().all(|w| *w == weights[0]);
        let mut rng = rand::rng();
        if uniform {
            return Ok(invokers[rng.random_range(0..invokers.len())].clone());
        }
        let mut offset = rng.random_range(0..total);
        for (invoker, weight) in invokers.iter().zip(weights) {
            if offset < weight {
                return Ok(invoker.clone());
            }
            offset -= weight;
        }
        Ok(invokers[invokers.len() - 1].clone())
    }
}

/// Weighted round-robin; per-service-method rotation state.
pub struct RoundRobinLoadBalance {
    sequences: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl RoundRobinLoadBalance {
    pub fn new() -> Self {
        Self { sequences: Mutex::new(HashMap::new()) }
    }
}

impl Default for RoundRobinLoadBalance {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalance for RoundRobinLoadBalance {
    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        url: &Url,
        invocation: &Invocation,
    ) -> Result<Arc<dyn Invoker>, RpcError> {
        ensure_candidates(invokers, url)?;
        let key = format!("{}.{}", url.service_key(), invocation.method());
        let counter = {
            let mut sequences = self.sequences.lock();
            sequences.entry(key).or_insert_with(|| Arc::new(AtomicUsize::new(0))).clone()
        };
        let index = counter.fetch_add(1, Ordering::Relaxed) % invokers.len();
        Ok(invokers[index].clone())
    }
}

struct AdaptiveLoadBalance {
    registry: Weak<ExtensionRegistry>,
}

impl LoadBalance for AdaptiveLoadBalance {
    fn select(
        &self,
        invokers: &[Arc<dyn Invoker>],
        url: &Url,
        invocation: &Invocation,
    ) -> Result<Arc<dyn Invoker>, RpcError> {
        let name = resolve_adaptive_name(
            <dyn LoadBalance as ExtensionPoint>::TYPE_PATH,
            <dyn LoadBalance as ExtensionPoint>::DEFAULT_NAME,
            "select",
            &[LOADBALANCE_KEY],
            url,
        )?;
        let registry = self.registry.upgrade().ok_or_else(|| RpcError::Network {
            target: url.address(),
            message: "extension registry dropped".to_string(),
        })?;
        let balancer = registry.loader::<dyn LoadBalance>()?.get(&name)?;
        balancer.select(invokers, url, invocation)
    }
}
