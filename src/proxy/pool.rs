// src/proxy/pool.rs
use super::backend::{Backend, BackendSnapshot};
use crate::config::{Algorithm, ServerEntry};
use crate::load_balancer::{create_policy, SelectionPolicy};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// The shared mutable state of one worker: the ordered backend list, the id
/// index, the rotation cursor and the expanded weighted sequence.
///
/// `pick`, `release` and the health transitions are synchronous and
/// non-blocking; the request path never awaits the pool. The ordered list is
/// only written by `replace_servers`, the weighted sequence is swapped
/// atomically, and per-backend state is atomic.
pub struct ServerPool {
    backends: RwLock<Vec<Arc<Backend>>>,
    by_id: DashMap<String, Arc<Backend>>,
    weighted: ArcSwap<Vec<Arc<Backend>>>,
    cursor: Arc<AtomicUsize>,
    algorithm: Algorithm,
    policy: Box<dyn SelectionPolicy>,
}

impl ServerPool {
    pub fn new(entries: &[ServerEntry], algorithm: Algorithm) -> Self {
        let backends: Vec<Arc<Backend>> = entries
            .iter()
            .map(|e| Arc::new(Backend::new(e.host.clone(), e.port, e.weight)))
            .collect();

        let by_id = DashMap::new();
        for backend in &backends {
            by_id.insert(backend.id.clone(), backend.clone());
        }

        let cursor = Arc::new(AtomicUsize::new(0));
        let pool = Self {
            backends: RwLock::new(backends),
            by_id,
            weighted: ArcSwap::from_pointee(Vec::new()),
            cursor: cursor.clone(),
            algorithm,
            policy: create_policy(algorithm, cursor),
        };
        pool.rebuild_weighted();

        info!(
            servers = pool.len(),
            algorithm = %algorithm,
            "server pool initialized"
        );
        pool
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn len(&self) -> usize {
        self.read_backends().len()
    }

    fn read_backends(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Backend>>> {
        self.backends.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Selects a healthy backend and increments its in-flight counter before
    /// returning it. A healthy sticky target always wins over the policy;
    /// otherwise the policy runs over the healthy subset, with `healthy[0]`
    /// as a last-resort guard.
    pub fn pick(&self, sticky_id: Option<&str>) -> Option<Arc<Backend>> {
        let healthy: Vec<Arc<Backend>> = self
            .read_backends()
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect();
        if healthy.is_empty() {
            return None;
        }

        let sticky = sticky_id
            .and_then(|id| self.get_by_id(id))
            .filter(|b| b.is_healthy());

        let chosen = match sticky {
            Some(backend) => backend,
            None => {
                let weighted = self.weighted.load();
                match self.policy.select(&healthy, &weighted) {
                    Some(backend) => backend,
                    None => {
                        warn!(
                            policy = self.policy.name(),
                            "policy returned no backend despite healthy servers, using first healthy"
                        );
                        healthy[0].clone()
                    }
                }
            }
        };

        chosen.acquire();
        Some(chosen)
    }

    /// Decrements the in-flight counter for `id`. No-op when the id is
    /// unknown (e.g. the backend was dropped by a reconfiguration while the
    /// request was still streaming) or the counter is already zero.
    pub fn release(&self, id: &str) {
        if let Some(backend) = self.get_by_id(id) {
            backend.release();
        }
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<Backend>> {
        self.by_id.get(id).map(|b| b.clone())
    }

    pub fn all_backends(&self) -> Vec<Arc<Backend>> {
        self.read_backends().clone()
    }

    /// Marks `id` unhealthy. Logs and rebuilds the weighted sequence only
    /// when the flag actually flips.
    pub fn mark_unhealthy(&self, id: &str, reason: &str) {
        if let Some(backend) = self.get_by_id(id) {
            if backend.set_healthy(false) {
                warn!(backend = %id, %reason, "backend marked unhealthy");
                self.rebuild_weighted();
            }
        }
    }

    /// Marks `id` healthy again, logging the recovery on an actual flip.
    pub fn mark_healthy(&self, id: &str, reason: &str) {
        if let Some(backend) = self.get_by_id(id) {
            if backend.set_healthy(true) {
                info!(backend = %id, %reason, "backend recovered");
                self.rebuild_weighted();
            }
        }
    }

    /// Rebuilds the expanded weighted sequence: healthy backends only, in
    /// configured order, each repeated `weight` times.
    pub fn rebuild_weighted(&self) {
        let backends = self.read_backends();
        let mut sequence = Vec::new();
        for backend in backends.iter().filter(|b| b.is_healthy()) {
            for _ in 0..backend.weight {
                sequence.push(backend.clone());
            }
        }
        self.weighted.store(Arc::new(sequence));
    }

    /// Swaps the backend set in place. Backends whose id survives keep their
    /// health flag and in-flight count; new ids start healthy with a zero
    /// counter; absent ids are dropped. Resets the rotation cursor and
    /// rebuilds the weighted sequence.
    pub fn replace_servers(&self, entries: &[ServerEntry]) {
        let mut backends = self.backends.write().unwrap_or_else(|e| e.into_inner());

        let mut next = Vec::with_capacity(entries.len());
        let mut retained = 0usize;
        for entry in entries {
            let id = entry.id();
            let backend = match self.by_id.get(&id) {
                Some(previous) => {
                    retained += 1;
                    Backend::retained(
                        entry.host.clone(),
                        entry.port,
                        entry.weight,
                        previous.is_healthy(),
                        previous.active_connections(),
                    )
                }
                None => Backend::new(entry.host.clone(), entry.port, entry.weight),
            };
            next.push(Arc::new(backend));
        }

        *backends = next;
        self.by_id.clear();
        for backend in backends.iter() {
            self.by_id.insert(backend.id.clone(), backend.clone());
        }
        self.cursor.store(0, Ordering::SeqCst);

        let total = backends.len();
        drop(backends);
        self.rebuild_weighted();

        info!(servers = total, retained, "backend set replaced");
    }

    /// Serializable view of the whole pool for the metrics endpoint.
    pub fn snapshot(&self) -> PoolSnapshot {
        let servers: Vec<BackendSnapshot> =
            self.read_backends().iter().map(|b| b.snapshot()).collect();
        let healthy = servers.iter().filter(|s| s.healthy).count();

        PoolSnapshot {
            total_servers: servers.len(),
            healthy_servers: healthy,
            unhealthy_servers: servers.len() - healthy,
            load_balancing_algorithm: self.algorithm,
            servers,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub unhealthy_servers: usize,
    pub load_balancing_algorithm: Algorithm,
    pub servers: Vec<BackendSnapshot>,
}
