// src/main.rs
use anyhow::{bail, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod config;
mod health;
mod load_balancer;
mod metrics;
mod proxy;
mod server;

use crate::{
    config::Config,
    proxy::{Proxy, ServerPool},
    server::ServerBuilder,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("backhaul=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("loading configuration from: {}", config_path);
    let config = config::load_config(&config_path)?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if config.num_workers > 0 {
        runtime.worker_threads(config.num_workers);
    }

    runtime.build()?.block_on(run(config, config_path))
}

async fn run(config: Config, config_path: String) -> Result<()> {
    let config = Arc::new(config);

    let pool = Arc::new(ServerPool::new(
        &config.servers,
        config.load_balancing_algorithm,
    ));
    let proxy = Arc::new(Proxy::new(config.clone(), pool));

    proxy.start_health_checker();

    if config.metrics.enabled {
        metrics::start_metrics_server(config.metrics.clone(), proxy.clone()).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let active_connections = Arc::new(AtomicUsize::new(0));

    if let Some(port) = config.port {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = ServerBuilder::new(
            addr,
            proxy.clone(),
            shutdown_rx.clone(),
            active_connections.clone(),
        )
        .bind()
        .await?;
        tokio::spawn(listener.run());
    }

    if let Some(acceptor) = tls_acceptor(&config)? {
        let addr: SocketAddr = ([0, 0, 0, 0], config.https_port).into();
        let listener = ServerBuilder::new(
            addr,
            proxy.clone(),
            shutdown_rx.clone(),
            active_connections.clone(),
        )
        .with_tls(acceptor)
        .bind()
        .await?;
        tokio::spawn(listener.run());
    }

    #[cfg(unix)]
    spawn_reload_handler(&config, config_path, proxy.clone())?;
    #[cfg(not(unix))]
    let _ = config_path;

    shutdown_signal().await;

    info!("shutting down");
    proxy.stop_health_checker();
    let _ = shutdown_tx.send(true);

    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while active_connections.load(Ordering::SeqCst) > 0 {
        if Instant::now() >= deadline {
            error!(
                remaining = active_connections.load(Ordering::SeqCst),
                "drain timed out, forcing exit"
            );
            std::process::exit(1);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("graceful shutdown complete");
    Ok(())
}

/// Resolves the HTTPS acceptor. Bad or missing TLS material is fatal only
/// when HTTPS is the sole listener; otherwise HTTPS is dropped with a
/// warning and the HTTP listener carries on.
fn tls_acceptor(config: &Config) -> Result<Option<tokio_rustls::TlsAcceptor>> {
    if !config.enable_https {
        return Ok(None);
    }

    let (cert, key) = match (&config.ssl_cert_path, &config.ssl_key_path) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            if config.port.is_some() {
                warn!("HTTPS enabled but sslKeyPath/sslCertPath missing; continuing HTTP-only");
                return Ok(None);
            }
            bail!("HTTPS is the only listener but sslKeyPath/sslCertPath are not set");
        }
    };

    match server::listener::load_tls_acceptor(cert, key) {
        Ok(acceptor) => Ok(Some(acceptor)),
        Err(err) => {
            if config.port.is_some() {
                warn!(error = %err, "failed to load TLS material; continuing HTTP-only");
                Ok(None)
            } else {
                Err(err)
            }
        }
    }
}

#[cfg(unix)]
fn spawn_reload_handler(config: &Arc<Config>, config_path: String, proxy: Arc<Proxy>) -> Result<()> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let kind = match config.dynamic_config_reload_signal.as_str() {
        "SIGHUP" => SignalKind::hangup(),
        "SIGUSR1" => SignalKind::user_defined1(),
        "SIGUSR2" => SignalKind::user_defined2(),
        other => {
            warn!(signal = %other, "unknown reload signal, using SIGHUP");
            SignalKind::hangup()
        }
    };

    let mut stream = unix_signal(kind)?;
    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            info!("reload signal received, re-reading {}", config_path);
            match config::load_config(&config_path) {
                Ok(new_config) => proxy.replace_servers(&new_config.servers),
                Err(err) => error!(error = %err, "reload failed, keeping current backend set"),
            }
        }
    });

    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
