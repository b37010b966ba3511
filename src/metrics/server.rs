// src/metrics/server.rs
use crate::config::MetricsConfig;
use crate::proxy::Proxy;
use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Spawns the metrics listener. `GET <endpoint>` returns the JSON snapshot;
/// everything else is a 404.
pub async fn start_metrics_server(config: MetricsConfig, proxy: Arc<Proxy>) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let endpoint = Arc::new(config.endpoint);
    let service_endpoint = endpoint.clone();

    let make_service = make_service_fn(move |_| {
        let proxy = proxy.clone();
        let endpoint = service_endpoint.clone();

        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let proxy = proxy.clone();
                let endpoint = endpoint.clone();

                async move {
                    if req.method() == hyper::Method::GET && req.uri().path() == endpoint.as_str() {
                        let snapshot = proxy.metrics_snapshot();
                        let body = serde_json::to_vec(&snapshot)
                            .unwrap_or_else(|_| b"{}".to_vec());
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header(header::CONTENT_TYPE, "application/json")
                                .body(Body::from(body))
                                .unwrap(),
                        )
                    } else {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Body::from("Not Found"))
                                .unwrap(),
                        )
                    }
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_service);

    info!("metrics server listening on http://{}{}", addr, endpoint);

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("metrics server error: {}", e);
        }
    });

    Ok(())
}
