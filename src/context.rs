//! State shared by the lifecycle controller and the tunnel orchestrator.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};

/// Lowest port the SOCKS bypass may bind.
pub const BYPASS_PORT_BASE: u16 = 10000;

/// Width of the bypass port range.
pub const BYPASS_PORT_SPAN: u16 = 1000;

/// Owned context handed to both the controller and the orchestrator.
#[derive(Debug, Default)]
pub struct SharedContext {
    bypass_endpoint: OnceLock<SocketAddr>,
}

impl SharedContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build a context with a fixed bypass endpoint.
    pub fn with_bypass_endpoint(endpoint: SocketAddr) -> Arc<Self> {
        let ctx = Self::default();
        let _ = ctx.bypass_endpoint.set(endpoint);
        Arc::new(ctx)
    }

    /// Loopback endpoint for the SOCKS bypass proxy.
    ///
    /// The port is drawn at random on first use and stays fixed for the
    /// lifetime of this context, so the proxy configuration stays valid
    /// across tunnel restarts.
    pub fn bypass_endpoint(&self) -> SocketAddr {
        *self.bypass_endpoint.get_or_init(|| {
            let port = BYPASS_PORT_BASE + rand::random::<u16>() % BYPASS_PORT_SPAN;
            SocketAddr::from((Ipv4Addr::LOCALHOST, port))
        })
    }
}
