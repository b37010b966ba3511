// src/load_balancer/random.rs
use crate::load_balancer::SelectionPolicy;
use crate::proxy::Backend;
use rand::Rng;
use std::sync::Arc;

pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for RandomBalancer {
    fn select(&self, healthy: &[Arc<Backend>], _weighted: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if healthy.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..healthy.len());
        Some(healthy[index].clone())
    }

    fn name(&self) -> &'static str {
        "RANDOM"
    }
}
