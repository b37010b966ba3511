// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::Service;

use crate::proxy::{Proxy, Scheme};

/// Per-connection service: carries the peer address and listener scheme the
/// proxy needs for the forwarded headers.
#[derive(Clone)]
pub struct RequestHandler {
    proxy: Arc<Proxy>,
    peer: SocketAddr,
    scheme: Scheme,
}

impl RequestHandler {
    pub fn new(proxy: Arc<Proxy>, peer: SocketAddr, scheme: Scheme) -> Self {
        Self { proxy, peer, scheme }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let proxy = self.proxy.clone();
        let peer = self.peer;
        let scheme = self.scheme;
        Box::pin(async move { Ok(proxy.handle(req, peer, scheme).await) })
    }
}
