// tests/proxy_tests.rs
use backhaul::config::Config;
use backhaul::proxy::{Proxy, Scheme, ServerPool};
use hyper::{header, Body, Request, StatusCode};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

const PEER: &str = "10.1.2.3:55555";

fn test_config(servers: serde_json::Value, sticky: bool) -> Arc<Config> {
    let config: Config = serde_json::from_value(json!({
        "servers": servers,
        "loadBalancingAlgorithm": "ROUND_ROBIN",
        "stickySession": { "enabled": sticky },
        "healthCheck": { "enabled": false },
        "proxyTimeoutMs": 1000,
        "proxyConnectTimeoutMs": 500,
    }))
    .unwrap();
    Arc::new(config)
}

fn build_proxy(config: Arc<Config>) -> (Arc<Proxy>, Arc<ServerPool>) {
    let pool = Arc::new(ServerPool::new(
        &config.servers,
        config.load_balancing_algorithm,
    ));
    (Arc::new(Proxy::new(config, pool.clone())), pool)
}

fn server_json(server: &mockito::ServerGuard) -> serde_json::Value {
    let (host, port) = server
        .host_with_port()
        .rsplit_once(':')
        .map(|(h, p)| (h.to_string(), p.parse::<u16>().unwrap()))
        .unwrap();
    json!({ "host": host, "port": port })
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn request(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn peer() -> SocketAddr {
    PEER.parse().unwrap()
}

#[tokio::test]
async fn responds_503_when_no_backend_is_healthy() {
    let config = test_config(json!([{ "host": "127.0.0.1", "port": 1 }]), false);
    let (proxy, pool) = build_proxy(config);
    pool.mark_unhealthy("127.0.0.1:1", "test");

    let response = proxy.handle(request("/"), peer(), Scheme::Http).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"No healthy backends available");
}

#[tokio::test]
async fn connection_refused_marks_backend_unhealthy_and_returns_502() {
    let port = closed_port();
    let config = test_config(json!([{ "host": "127.0.0.1", "port": port }]), false);
    let (proxy, pool) = build_proxy(config);
    let id = format!("127.0.0.1:{}", port);

    let response = proxy.handle(request("/"), peer(), Scheme::Http).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let backend = pool.get_by_id(&id).unwrap();
    assert!(!backend.is_healthy());
    assert_eq!(backend.active_connections(), 0);
}

#[tokio::test]
async fn failed_backend_is_skipped_on_the_next_request() {
    let mut healthy_server = mockito::Server::new_async().await;
    let _m = healthy_server
        .mock("GET", "/")
        .with_status(200)
        .with_body("from-a")
        .create_async()
        .await;

    let port = closed_port();
    let config = test_config(
        json!([server_json(&healthy_server), { "host": "127.0.0.1", "port": port }]),
        true,
    );
    let (proxy, pool) = build_proxy(config);
    let dead_id = format!("127.0.0.1:{}", port);

    // The sticky cookie steers the first request into the dead backend.
    let steered = Request::builder()
        .uri("/")
        .header(header::COOKIE, format!("lb_sticky_session={}", dead_id))
        .body(Body::empty())
        .unwrap();
    let response = proxy.handle(steered, peer(), Scheme::Http).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(!pool.get_by_id(&dead_id).unwrap().is_healthy());
    assert_eq!(pool.get_by_id(&dead_id).unwrap().active_connections(), 0);

    // Same cookie again: the policy takes over and re-pins the session.
    let retried = Request::builder()
        .uri("/")
        .header(header::COOKIE, format!("lb_sticky_session={}", dead_id))
        .body(Body::empty())
        .unwrap();
    let response = proxy.handle(retried, peer(), Scheme::Http).await;
    assert_eq!(response.status(), StatusCode::OK);

    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(set_cookie.starts_with("lb_sticky_session="));
    assert!(!set_cookie.contains(&dead_id));

    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"from-a");
}

#[tokio::test]
async fn sticky_cookie_overrides_rotation_and_is_not_reemitted() {
    let mut server_a = mockito::Server::new_async().await;
    let _a = server_a
        .mock("GET", "/")
        .with_status(200)
        .with_body("from-a")
        .create_async()
        .await;

    let mut server_b = mockito::Server::new_async().await;
    let _b = server_b
        .mock("GET", "/")
        .with_status(200)
        .with_body("from-b")
        .create_async()
        .await;

    let config = test_config(
        json!([server_json(&server_a), server_json(&server_b)]),
        true,
    );
    let (proxy, _pool) = build_proxy(config);
    let b_id = server_b.host_with_port();

    // Round-robin would pick A first; the cookie pins B.
    let pinned = Request::builder()
        .uri("/")
        .header(header::COOKIE, format!("lb_sticky_session={}", b_id))
        .body(Body::empty())
        .unwrap();
    let response = proxy.handle(pinned, peer(), Scheme::Http).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Cookie already matches the target, so no Set-Cookie is emitted.
    assert!(response.headers().get(header::SET_COOKIE).is_none());

    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"from-b");
}

#[tokio::test]
async fn first_visit_receives_sticky_cookie_for_chosen_backend() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/")
        .with_status(200)
        .create_async()
        .await;

    let config = test_config(json!([server_json(&server)]), true);
    let (proxy, _pool) = build_proxy(config);

    let response = proxy.handle(request("/"), peer(), Scheme::Http).await;
    assert_eq!(response.status(), StatusCode::OK);

    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(set_cookie.starts_with(&format!("lb_sticky_session={}", server.host_with_port())));
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("Path=/"));
    assert!(set_cookie.contains("Max-Age=3600"));
}

#[tokio::test]
async fn forwarded_headers_reach_the_backend() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/api")
        .match_header("x-forwarded-for", "203.0.113.7, 10.1.2.3")
        .match_header("x-forwarded-proto", "https")
        .match_header("x-forwarded-host", "example.com")
        .with_status(200)
        .create_async()
        .await;

    let config = test_config(json!([server_json(&server)]), false);
    let (proxy, _pool) = build_proxy(config);

    let req = Request::builder()
        .uri("/api")
        .header(header::HOST, "example.com")
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::empty())
        .unwrap();

    // A 200 means every matcher above was satisfied; mockito answers
    // unmatched requests with 501.
    let response = proxy.handle(req, peer(), Scheme::Https).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unresponsive_backend_times_out_with_502() {
    // A listener that accepts but never answers.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = test_config(json!([{ "host": "127.0.0.1", "port": port }]), false);
    let (proxy, pool) = build_proxy(config);
    let id = format!("127.0.0.1:{}", port);

    let response = proxy.handle(request("/"), peer(), Scheme::Http).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(!pool.get_by_id(&id).unwrap().is_healthy());
    assert_eq!(pool.get_by_id(&id).unwrap().active_connections(), 0);
}

#[tokio::test]
async fn in_flight_counters_drain_to_zero_after_responses_complete() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/")
        .with_status(200)
        .with_body("payload")
        .expect_at_least(3)
        .create_async()
        .await;

    let config = test_config(json!([server_json(&server)]), false);
    let (proxy, pool) = build_proxy(config);

    for _ in 0..3 {
        let response = proxy.handle(request("/"), peer(), Scheme::Http).await;
        assert_eq!(response.status(), StatusCode::OK);
        hyper::body::to_bytes(response.into_body()).await.unwrap();
    }

    let total: usize = pool
        .all_backends()
        .iter()
        .map(|b| b.active_connections())
        .sum();
    assert_eq!(total, 0);
}
