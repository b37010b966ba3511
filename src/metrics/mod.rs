// src/metrics/mod.rs
mod server;

pub use server::start_metrics_server;

use crate::proxy::{PoolSnapshot, ServerPool};
use serde::Serialize;
use std::time::Instant;

/// Point-in-time view served by the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub worker_pid: u32,
    pub requests_handled: u64,
    pub server_pool: PoolSnapshot,
    pub uptime_seconds: u64,
    /// Resident set size in bytes; 0 where the platform offers no cheap read.
    pub memory_usage: u64,
}

impl MetricsSnapshot {
    pub fn collect(pool: &ServerPool, requests_handled: u64, started_at: Instant) -> Self {
        Self {
            worker_pid: std::process::id(),
            requests_handled,
            server_pool: pool.snapshot(),
            uptime_seconds: started_at.elapsed().as_secs(),
            memory_usage: rss_bytes(),
        }
    }
}

#[cfg(target_os = "linux")]
fn rss_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| {
            statm
                .split_whitespace()
                .nth(1)
                .and_then(|pages| pages.parse::<u64>().ok())
        })
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn rss_bytes() -> u64 {
    0
}
