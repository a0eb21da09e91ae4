//! The external proxy process.
//!
//! [`ProxyProcess`] is the seam the lifecycle controller drives;
//! [`TorDaemon`] is the real implementation on top of the `torctl` client.

pub mod daemon;
pub mod registry;
pub mod torrc;

pub use daemon::TorDaemon;
pub use registry::{
    ClientCookieRecord, ConfigRegistry, HiddenServiceRecord, HiddenServiceRegistry,
    PublishedOnion,
};
pub use torrc::{build_torrc, TorPaths};

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Control over one proxy process.
#[async_trait]
pub trait ProxyProcess: Send + Sync {
    /// Generate and persist the configuration for the next launch.
    async fn write_config(&self, bypass: Option<SocketAddr>) -> Result<()>;

    /// Launch the process and attach to its control channel.
    ///
    /// Returns the raw async-event stream; it ends when the control
    /// connection is lost.
    async fn start(&self) -> Result<mpsc::Receiver<String>>;

    /// Terminate the process. Safe to call when nothing is running.
    async fn stop(&self) -> Result<()>;

    /// Set the proxy's network-disable flag.
    async fn disable_network(&self, disabled: bool) -> Result<()>;

    /// Ask for fresh circuits.
    async fn request_new_identity(&self) -> Result<()>;

    /// Re-read the configuration (`SIGNAL HUP`).
    async fn reload_config(&self) -> Result<()>;

    /// Restrict exit relays. An empty list clears the restriction.
    async fn set_exit_nodes(&self, nodes: &[String]) -> Result<()>;

    /// Whether the process handle is still live.
    fn is_running(&self) -> bool;

    /// Local SOCKS port the proxy listens on.
    fn socks_port(&self) -> u16;
}
