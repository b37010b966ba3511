// src/server/builder.rs
use crate::proxy::{Proxy, Scheme};
use crate::server::handler::RequestHandler;
use crate::server::listener::bind_tcp;
use anyhow::Result;
use hyper::server::conn::Http;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Builder for one listening socket. Binding is separated from the accept
/// loop so startup failures surface before any task is spawned.
pub struct ServerBuilder {
    addr: SocketAddr,
    proxy: Arc<Proxy>,
    tls: Option<TlsAcceptor>,
    shutdown: watch::Receiver<bool>,
    active_connections: Arc<AtomicUsize>,
}

impl ServerBuilder {
    pub fn new(
        addr: SocketAddr,
        proxy: Arc<Proxy>,
        shutdown: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            addr,
            proxy,
            tls: None,
            shutdown,
            active_connections,
        }
    }

    /// Terminate TLS on this listener.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub async fn bind(self) -> Result<BoundListener> {
        let listener = bind_tcp(self.addr).await?;
        let scheme = if self.tls.is_some() {
            Scheme::Https
        } else {
            Scheme::Http
        };
        info!("{} listener bound on {}", scheme, self.addr);

        Ok(BoundListener {
            listener,
            addr: self.addr,
            proxy: self.proxy,
            scheme,
            tls: self.tls,
            shutdown: self.shutdown,
            active_connections: self.active_connections,
        })
    }
}

pub struct BoundListener {
    listener: TcpListener,
    addr: SocketAddr,
    proxy: Arc<Proxy>,
    scheme: Scheme,
    tls: Option<TlsAcceptor>,
    shutdown: watch::Receiver<bool>,
    active_connections: Arc<AtomicUsize>,
}

impl BoundListener {
    /// Accepts connections until the shutdown signal flips, spawning one
    /// task per connection. Open connections are tracked so shutdown can
    /// wait for them to drain.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(%err, "accept failed");
                            continue;
                        }
                    };

                    let handler = RequestHandler::new(self.proxy.clone(), peer, self.scheme);
                    let tls = self.tls.clone();
                    let active = self.active_connections.clone();
                    active.fetch_add(1, Ordering::SeqCst);

                    tokio::spawn(async move {
                        match tls {
                            None => {
                                if let Err(err) = Http::new().serve_connection(stream, handler).await {
                                    debug!(%peer, %err, "connection error");
                                }
                            }
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    if let Err(err) =
                                        Http::new().serve_connection(tls_stream, handler).await
                                    {
                                        debug!(%peer, %err, "connection error");
                                    }
                                }
                                Err(err) => warn!(%peer, %err, "TLS handshake failed"),
                            },
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }

        info!("{} listener on {} stopped accepting", self.scheme, self.addr);
    }
}
