// src/proxy/mod.rs
mod backend;
mod pool;
mod proxy;

pub use backend::{Backend, BackendSnapshot};
pub use pool::{PoolSnapshot, ServerPool};
pub use proxy::{Proxy, ProxyError, Scheme};
