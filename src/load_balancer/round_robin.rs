// src/load_balancer/round_robin.rs
use crate::load_balancer::SelectionPolicy;
use crate::proxy::Backend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct RoundRobinBalancer {
    cursor: Arc<AtomicUsize>,
}

impl RoundRobinBalancer {
    pub fn new(cursor: Arc<AtomicUsize>) -> Self {
        Self { cursor }
    }
}

impl SelectionPolicy for RoundRobinBalancer {
    fn select(&self, healthy: &[Arc<Backend>], _weighted: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if healthy.is_empty() {
            return None;
        }

        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % healthy.len();
        Some(healthy[index].clone())
    }

    fn name(&self) -> &'static str {
        "ROUND_ROBIN"
    }
}
