// src/health/checker.rs
use crate::config::HealthCheckConfig;
use crate::proxy::{Backend, ServerPool};
use futures::future::join_all;
use reqwest::Method;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

/// Periodic active prober. One sweep issues one probe per backend
/// concurrently, awaits all outcomes, applies health flips through the pool,
/// then rebuilds the weighted sequence when the policy consumes it.
pub struct HealthChecker {
    config: HealthCheckConfig,
    pool: Arc<ServerPool>,
    client: reqwest::Client,
    method: Method,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig, pool: Arc<ServerPool>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .expect("failed to create probe HTTP client");

        let method = Method::from_bytes(config.method.as_bytes()).unwrap_or_else(|_| {
            warn!(method = %config.method, "invalid health-check method, using GET");
            Method::GET
        });

        Self {
            config,
            pool,
            client,
            method,
            task: Mutex::new(None),
        }
    }

    /// Starts the periodic sweep, firing the first one immediately. Calling
    /// `start` while running restarts the timer. No-op when disabled.
    pub fn start(self: Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
        }
        if !self.config.enabled {
            return;
        }

        info!(interval = ?self.config.interval(), "health checker started");
        let checker = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(checker.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                checker.sweep().await;
            }
        }));
    }

    /// Cancels the timer without waiting for in-flight probes.
    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
            info!("health checker stopped");
        }
    }

    /// One full sweep over every configured backend.
    pub async fn sweep(&self) {
        let backends = self.pool.all_backends();
        let outcomes = join_all(backends.iter().map(|b| self.probe(b))).await;

        let mut healthy = 0usize;
        for (backend, outcome) in backends.iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    healthy += 1;
                    self.pool.mark_healthy(&backend.id, "probe succeeded");
                }
                Err(reason) => self.pool.mark_unhealthy(&backend.id, &reason),
            }
        }

        // Post-sweep hook: flips already rebuilt eagerly, but a sweep must
        // leave the weighted sequence consistent even without one.
        if self.pool.algorithm().is_weighted() {
            self.pool.rebuild_weighted();
        }

        debug!(healthy, total = backends.len(), "health sweep complete");
    }

    async fn probe(&self, backend: &Arc<Backend>) -> Result<(), String> {
        backend.record_probe();

        let url = Url::parse(&format!("http://{}", backend.id))
            .and_then(|base| base.join(&self.config.path))
            .map_err(|e| format!("invalid probe url: {}", e))?;

        let response = timeout(
            self.config.timeout(),
            self.client.request(self.method.clone(), url).send(),
        )
        .await
        .map_err(|_| "probe timed out".to_string())?
        .map_err(|e| format!("probe failed: {}", e))?;

        let status = response.status().as_u16();
        if status != self.config.expect_status {
            return Err(format!(
                "unexpected status {} (expected {})",
                status, self.config.expect_status
            ));
        }

        if let Some(needle) = &self.config.expect_body_substring {
            let body = response
                .text()
                .await
                .map_err(|e| format!("failed to read probe body: {}", e))?;
            if !body.contains(needle) {
                return Err(format!("probe body does not contain {:?}", needle));
            }
        }

        Ok(())
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}
