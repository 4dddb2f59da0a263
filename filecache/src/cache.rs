//! The pool, policy, and metrics shared by every file of a cache.

use crate::{metrics::Metrics, policy::Policy, pool::Pool, Error};
use prometheus_client::registry::Registry;
use std::{num::NonZeroUsize, sync::Arc};

/// Configuration for a [Cache].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Number of [crate::LINE_SIZE] slots in the pool.
    pub slots: NonZeroUsize,

    /// Number of touches that may queue up before a reader applies them itself.
    pub touch_backlog: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slots: NonZeroUsize::new(512).unwrap(),
            touch_backlog: NonZeroUsize::new(1024).unwrap(),
        }
    }
}

/// A handle to the shared state of a cache. Cloning is cheap and every clone refers to the same
/// pool and policy.
#[derive(Clone)]
pub struct Cache {
    pool: Arc<Pool>,
    policy: Arc<Policy>,
    metrics: Metrics,
}

impl Cache {
    /// Allocate a pool of `cfg.slots` slots, registering metrics with `registry`.
    pub fn new(cfg: Config, registry: &mut Registry) -> Self {
        let metrics = Metrics::new(registry);
        let policy = Policy::new(cfg.slots, cfg.touch_backlog, metrics.clone());
        Self {
            pool: Arc::new(Pool::new(cfg.slots)),
            policy: Arc::new(policy),
            metrics,
        }
    }

    /// Assemble a cache from parts created elsewhere.
    ///
    /// Returns [Error::SlotMismatch] if `policy` does not manage exactly the slots of `pool`.
    pub fn from_parts(pool: Arc<Pool>, policy: Arc<Policy>, metrics: Metrics) -> Result<Self, Error> {
        if pool.slots() != policy.capacity() {
            return Err(Error::SlotMismatch {
                pool: pool.slots(),
                policy: policy.capacity(),
            });
        }
        Ok(Self {
            pool,
            policy,
            metrics,
        })
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}
