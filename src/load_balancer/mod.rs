// src/load_balancer/mod.rs
mod random;
mod round_robin;
mod weighted;

pub use random::RandomBalancer;
pub use round_robin::RoundRobinBalancer;
pub use weighted::{WeightedRandomBalancer, WeightedRoundRobinBalancer};

use crate::config::Algorithm;
use crate::proxy::Backend;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// A selection policy picks one backend out of the live healthy subset.
///
/// Policies are stateless apart from the rotation cursor, which the pool
/// shares between both round-robin variants.
pub trait SelectionPolicy: Send + Sync {
    /// `healthy` is the healthy subset in configured order; `weighted` is the
    /// expanded sequence consumed by the weighted policies (healthy entries
    /// only, each repeated `weight` times).
    fn select(&self, healthy: &[Arc<Backend>], weighted: &[Arc<Backend>]) -> Option<Arc<Backend>>;

    fn name(&self) -> &'static str;
}

pub fn create_policy(algorithm: Algorithm, cursor: Arc<AtomicUsize>) -> Box<dyn SelectionPolicy> {
    match algorithm {
        Algorithm::RoundRobin => Box::new(RoundRobinBalancer::new(cursor)),
        Algorithm::Random => Box::new(RandomBalancer::new()),
        Algorithm::WeightedRoundRobin => Box::new(WeightedRoundRobinBalancer::new(cursor)),
        Algorithm::WeightedRandom => Box::new(WeightedRandomBalancer::new(cursor)),
    }
}
