// src/proxy/proxy.rs
use crate::config::{Config, StickySessionConfig};
use crate::health::HealthChecker;
use crate::metrics::MetricsSnapshot;
use crate::proxy::{Backend, ServerPool};
use cookie::Cookie;
use futures::StreamExt;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{header, Body, Client, Request, Response, StatusCode, Uri};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{info_span, Instrument};
use uuid::Uuid;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

// Hop-by-hop headers are meaningful per connection and must not be relayed.
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Listener scheme, reported upstream via `X-Forwarded-Proto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no healthy backends available")]
    NoHealthyBackend,

    #[error("failed to connect to backend {backend}: {source}")]
    ConnectFailed {
        backend: String,
        #[source]
        source: hyper::Error,
    },

    #[error("request to backend {backend} timed out")]
    UpstreamTimeout { backend: String },

    #[error("backend {backend} request failed: {source}")]
    Upstream {
        backend: String,
        #[source]
        source: hyper::Error,
    },

    #[error("invalid upstream uri: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),
}

impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let (status, message) = match err {
            ProxyError::NoHealthyBackend => {
                (StatusCode::SERVICE_UNAVAILABLE, "No healthy backends available")
            }
            _ => (StatusCode::BAD_GATEWAY, "Bad gateway"),
        };

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Body::from(message))
            .unwrap()
    }
}

/// Decrements the picked backend's in-flight counter exactly once, whether
/// the response finished, the client aborted, or the upstream failed. The
/// guard travels into the response body stream and fires on drop.
struct ReleaseGuard {
    pool: Arc<ServerPool>,
    id: String,
}

impl ReleaseGuard {
    fn new(pool: Arc<ServerPool>, id: String) -> Self {
        Self { pool, id }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.pool.release(&self.id);
    }
}

/// Request-lifecycle adapter: sticky-cookie extraction, backend selection,
/// header rewriting, upstream forwarding and the fault signals fed back into
/// the pool.
pub struct Proxy {
    config: Arc<Config>,
    pool: Arc<ServerPool>,
    client: Client<HttpConnector>,
    checker: Arc<HealthChecker>,
    requests_handled: AtomicU64,
    started_at: Instant,
}

impl Proxy {
    pub fn new(config: Arc<Config>, pool: Arc<ServerPool>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.proxy_connect_timeout()));
        let client = Client::builder().build(connector);

        let checker = Arc::new(HealthChecker::new(config.health_check.clone(), pool.clone()));

        Self {
            config,
            pool,
            client,
            checker,
            requests_handled: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn start_health_checker(&self) {
        self.checker.clone().start();
    }

    pub fn stop_health_checker(&self) {
        self.checker.stop();
    }

    /// Swaps the backend set, preserving health for surviving ids. The
    /// prober is stopped for the swap and restarted afterwards when enabled.
    pub fn replace_servers(&self, entries: &[crate::config::ServerEntry]) {
        self.checker.stop();
        self.pool.replace_servers(entries);
        self.checker.clone().start();
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot::collect(
            &self.pool,
            self.requests_handled.load(Ordering::Relaxed),
            self.started_at,
        )
    }

    pub async fn handle(&self, req: Request<Body>, peer: SocketAddr, scheme: Scheme) -> Response<Body> {
        self.requests_handled.fetch_add(1, Ordering::Relaxed);

        let request_id = Uuid::new_v4();
        let span = info_span!(
            "request",
            id = %request_id,
            method = %req.method(),
            path = %req.uri().path(),
            %peer,
        );
        self.handle_inner(req, peer, scheme).instrument(span).await
    }

    async fn handle_inner(
        &self,
        req: Request<Body>,
        peer: SocketAddr,
        scheme: Scheme,
    ) -> Response<Body> {
        let sticky = &self.config.sticky_session;
        let sticky_id = if sticky.enabled {
            extract_sticky_cookie(req.headers(), &sticky.cookie_name)
        } else {
            None
        };

        let target = match self.pool.pick(sticky_id.as_deref()) {
            Some(backend) => backend,
            None => {
                tracing::warn!("no healthy backends available");
                return ProxyError::NoHealthyBackend.into();
            }
        };
        tracing::debug!(backend = %target.id, "backend selected");

        let needs_cookie = sticky.enabled && sticky_id.as_deref() != Some(target.id.as_str());
        let guard = ReleaseGuard::new(self.pool.clone(), target.id.clone());

        match self.forward(req, &target, peer, scheme).await {
            Ok(mut response) => {
                if needs_cookie {
                    if let Some(value) = build_sticky_cookie(sticky, &target.id) {
                        response.headers_mut().append(header::SET_COOKIE, value);
                    }
                }
                attach_release_guard(response, guard, self.pool.clone(), target.id.clone())
            }
            Err(err) => {
                tracing::warn!(backend = %target.id, error = %err, "upstream request failed");
                self.pool.mark_unhealthy(&target.id, &err.to_string());
                drop(guard);
                err.into()
            }
        }
    }

    async fn forward(
        &self,
        req: Request<Body>,
        target: &Backend,
        peer: SocketAddr,
        scheme: Scheme,
    ) -> Result<Response<Body>, ProxyError> {
        let (parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("http://{}{}", target.id, path_and_query).parse()?;

        let mut headers = parts.headers;
        for name in HOP_BY_HOP {
            headers.remove(name);
        }
        let original_host = headers.get(header::HOST).cloned();
        append_forwarded_for(&mut headers, peer);
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }

        let mut upstream = Request::new(body);
        *upstream.method_mut() = parts.method;
        *upstream.uri_mut() = uri;
        *upstream.headers_mut() = headers;

        match timeout(self.config.proxy_timeout(), self.client.request(upstream)).await {
            Err(_) => Err(ProxyError::UpstreamTimeout {
                backend: target.id.clone(),
            }),
            Ok(Err(source)) if source.is_connect() => Err(ProxyError::ConnectFailed {
                backend: target.id.clone(),
                source,
            }),
            Ok(Err(source)) => Err(ProxyError::Upstream {
                backend: target.id.clone(),
                source,
            }),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

/// Moves the release guard into the response body so it drops exactly once,
/// after the body finished streaming or the client went away. An error
/// mid-body truncates the stream and marks the backend unhealthy; the status
/// line is already on the wire at that point.
fn attach_release_guard(
    response: Response<Body>,
    guard: ReleaseGuard,
    pool: Arc<ServerPool>,
    backend_id: String,
) -> Response<Body> {
    let (parts, body) = response.into_parts();
    let stream = body.map(move |chunk| {
        let _held = &guard;
        if let Err(err) = &chunk {
            pool.mark_unhealthy(&backend_id, &format!("error mid-response: {}", err));
        }
        chunk
    });
    Response::from_parts(parts, Body::wrap_stream(stream))
}

fn extract_sticky_cookie(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    Cookie::split_parse(raw)
        .flatten()
        .find(|c| c.name() == cookie_name)
        .map(|c| c.value().to_string())
}

fn build_sticky_cookie(config: &StickySessionConfig, backend_id: &str) -> Option<HeaderValue> {
    let options = &config.cookie_options;
    let mut cookie = Cookie::new(config.cookie_name.clone(), backend_id.to_string());
    cookie.set_http_only(options.http_only);
    cookie.set_path(options.path.clone());
    cookie.set_max_age(cookie::time::Duration::seconds(options.max_age as i64));
    if options.secure {
        cookie.set_secure(true);
    }
    HeaderValue::from_str(&cookie.to_string()).ok()
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let client_ip = peer.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
