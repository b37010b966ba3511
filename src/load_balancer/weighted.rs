// src/load_balancer/weighted.rs
use crate::load_balancer::SelectionPolicy;
use crate::proxy::Backend;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

// Both weighted policies consume the expanded sequence; when it is empty
// while healthy backends remain (a transient state between a flip and the
// next rebuild), they degrade to plain round-robin for that call only.

fn round_robin_fallback(
    policy: &'static str,
    cursor: &AtomicUsize,
    healthy: &[Arc<Backend>],
) -> Option<Arc<Backend>> {
    warn!(
        policy,
        "weighted sequence empty with healthy backends present, falling back to round-robin"
    );
    let index = cursor.fetch_add(1, Ordering::SeqCst) % healthy.len();
    Some(healthy[index].clone())
}

pub struct WeightedRoundRobinBalancer {
    cursor: Arc<AtomicUsize>,
}

impl WeightedRoundRobinBalancer {
    pub fn new(cursor: Arc<AtomicUsize>) -> Self {
        Self { cursor }
    }
}

impl SelectionPolicy for WeightedRoundRobinBalancer {
    fn select(&self, healthy: &[Arc<Backend>], weighted: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if healthy.is_empty() {
            return None;
        }
        if weighted.is_empty() {
            return round_robin_fallback(self.name(), &self.cursor, healthy);
        }

        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % weighted.len();
        Some(weighted[index].clone())
    }

    fn name(&self) -> &'static str {
        "WEIGHTED_ROUND_ROBIN"
    }
}

pub struct WeightedRandomBalancer {
    cursor: Arc<AtomicUsize>,
}

impl WeightedRandomBalancer {
    pub fn new(cursor: Arc<AtomicUsize>) -> Self {
        Self { cursor }
    }
}

impl SelectionPolicy for WeightedRandomBalancer {
    fn select(&self, healthy: &[Arc<Backend>], weighted: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if healthy.is_empty() {
            return None;
        }
        if weighted.is_empty() {
            return round_robin_fallback(self.name(), &self.cursor, healthy);
        }

        let index = rand::thread_rng().gen_range(0..weighted.len());
        Some(weighted[index].clone())
    }

    fn name(&self) -> &'static str {
        "WEIGHTED_RANDOM"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(host: &str, port: u16, weight: u32) -> Arc<Backend> {
        Arc::new(Backend::new(host.to_string(), port, weight))
    }

    fn expand(backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
        let mut sequence = Vec::new();
        for b in backends {
            for _ in 0..b.weight {
                sequence.push(b.clone());
            }
        }
        sequence
    }

    #[test]
    fn wrr_walks_expanded_sequence_in_order() {
        let pool = vec![backend("a", 1, 2), backend("b", 2, 1)];
        let weighted = expand(&pool);
        let balancer = WeightedRoundRobinBalancer::new(Arc::new(AtomicUsize::new(0)));

        let picked: Vec<String> = (0..6)
            .map(|_| balancer.select(&pool, &weighted).unwrap().id.clone())
            .collect();
        assert_eq!(picked, ["a:1", "a:1", "b:2", "a:1", "a:1", "b:2"]);
    }

    #[test]
    fn wrr_falls_back_to_round_robin_on_empty_weighted_sequence() {
        let pool = vec![backend("a", 1, 2), backend("b", 2, 1)];
        let balancer = WeightedRoundRobinBalancer::new(Arc::new(AtomicUsize::new(0)));

        let picked: Vec<String> = (0..4)
            .map(|_| balancer.select(&pool, &[]).unwrap().id.clone())
            .collect();
        assert_eq!(picked, ["a:1", "b:2", "a:1", "b:2"]);
    }

    #[test]
    fn weighted_random_picks_only_from_weighted_sequence() {
        let pool = vec![backend("a", 1, 3), backend("b", 2, 1)];
        let weighted = expand(&pool[..1]);
        let balancer = WeightedRandomBalancer::new(Arc::new(AtomicUsize::new(0)));

        for _ in 0..30 {
            let picked = balancer.select(&pool, &weighted).unwrap();
            assert_eq!(picked.id, "a:1");
        }
    }

    #[test]
    fn weighted_random_falls_back_on_empty_weighted_sequence() {
        let pool = vec![backend("a", 1, 1)];
        let balancer = WeightedRandomBalancer::new(Arc::new(AtomicUsize::new(0)));
        assert_eq!(balancer.select(&pool, &[]).unwrap().id, "a:1");
    }

    #[test]
    fn both_yield_none_without_healthy_backends() {
        let cursor = Arc::new(AtomicUsize::new(0));
        assert!(WeightedRoundRobinBalancer::new(cursor.clone()).select(&[], &[]).is_none());
        assert!(WeightedRandomBalancer::new(cursor).select(&[], &[]).is_none());
    }
}
