// src/proxy/backend.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

/// One upstream server. Health and the in-flight counter are atomics so the
/// request path never takes a lock; the record itself is only swapped out by
/// `ServerPool::replace_servers`.
#[derive(Debug)]
pub struct Backend {
    /// Stable identity `"host:port"`, also used as the sticky-cookie value.
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Positive weight; consumed only by the weighted policies.
    pub weight: u32,

    healthy: AtomicBool,
    active_connections: AtomicUsize,
    last_probe: RwLock<Option<DateTime<Utc>>>,
}

impl Backend {
    pub fn new(host: String, port: u16, weight: u32) -> Self {
        Self::retained(host, port, weight, true, 0)
    }

    /// Constructor used by reconfiguration to carry health and in-flight
    /// count over from a surviving backend.
    pub fn retained(
        host: String,
        port: u16,
        weight: u32,
        healthy: bool,
        active_connections: usize,
    ) -> Self {
        Self {
            id: format!("{}:{}", host, port),
            host,
            port,
            weight: weight.max(1),
            healthy: AtomicBool::new(healthy),
            active_connections: AtomicUsize::new(active_connections),
            last_probe: RwLock::new(None),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Flips the health flag, returning true when the value actually changed.
    pub(crate) fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::SeqCst) != healthy
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// One increment per successful pick.
    pub(crate) fn acquire(&self) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    /// Guarded decrement: clamps at zero, so a stray double-release can never
    /// underflow the counter.
    pub(crate) fn release(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub(crate) fn record_probe(&self) {
        let mut last = self.last_probe.write().unwrap_or_else(|e| e.into_inner());
        *last = Some(Utc::now());
    }

    pub fn last_probe(&self) -> Option<DateTime<Utc>> {
        *self.last_probe.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            id: self.id.clone(),
            healthy: self.is_healthy(),
            weight: self.weight,
            active_connections: self.active_connections(),
            last_probe: self.last_probe(),
        }
    }
}

/// Serializable view of one backend for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSnapshot {
    pub id: String,
    pub healthy: bool,
    pub weight: u32,
    pub active_connections: usize,
    pub last_probe: Option<DateTime<Utc>>,
}
