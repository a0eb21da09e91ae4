//! Connectivity monitor: puts the proxy to sleep while the host has no
//! default route and wakes it when one comes back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SharedConfig;
use crate::lifecycle::{LifecycleController, ProxyStatus};
use crate::notify::Notifier;

const PROC_ROUTE: &str = "/proc/net/route";

/// `RTF_UP` in the route flags column.
const RTF_UP: u32 = 0x0001;

pub trait ConnectivityProbe: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Reads the kernel IPv4 routing table.
#[derive(Debug, Clone)]
pub struct RouteTableProbe {
    path: PathBuf,
}

impl Default for RouteTableProbe {
    fn default() -> Self {
        Self {
            path: PathBuf::from(PROC_ROUTE),
        }
    }
}

impl RouteTableProbe {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConnectivityProbe for RouteTableProbe {
    fn is_connected(&self) -> bool {
        match std::fs::read_to_string(&self.path) {
            Ok(table) => has_default_route(&table),
            Err(e) => {
                // Without a routing table to read, assume the network is up.
                debug!("Cannot read {}: {e}", self.path.display());
                true
            }
        }
    }
}

/// Whether a `/proc/net/route` listing has an up default route that isn't
/// on a loopback or tunnel interface.
pub fn has_default_route(table: &str) -> bool {
    table.lines().skip(1).any(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [iface, destination, _gateway, flags, ..] = fields.as_slice() else {
            return false;
        };
        let up = u32::from_str_radix(flags, 16).is_ok_and(|f| f & RTF_UP != 0);
        *destination == "00000000" && up && *iface != "lo" && !iface.starts_with("olink")
    })
}

/// Edge detector over successive probe results.
#[derive(Debug, Default)]
pub struct NetworkWatch {
    last: Option<bool>,
}

impl NetworkWatch {
    /// Returns the new state when it differs from the previous observation.
    /// The first observation only records the baseline.
    pub fn observe(&mut self, connected: bool) -> Option<bool> {
        let previous = self.last.replace(connected);
        match previous {
            Some(previous) if previous != connected => Some(connected),
            _ => None,
        }
    }
}

/// Spawn the polling loop. Cancel `token` to stop it.
pub fn spawn_monitor(
    controller: Arc<LifecycleController>,
    probe: Arc<dyn ConnectivityProbe>,
    config: SharedConfig,
    notifier: Arc<dyn Notifier>,
    token: CancellationToken,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(config.read().network.poll_interval_secs.max(1));
    tokio::spawn(async move {
        let mut watch = NetworkWatch::default();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("connectivity monitor cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    let Some(connected) = watch.observe(probe.is_connected()) else {
                        continue;
                    };
                    let enabled = config.read().network.disable_on_connectivity_loss;
                    if !enabled || controller.status() == ProxyStatus::Off {
                        continue;
                    }
                    if connected {
                        notifier.notice("Network connectivity is back, waking up");
                    } else {
                        notifier.notice("No network connectivity, putting proxy to sleep");
                    }
                    if let Err(e) = controller.set_network_enabled(connected).await {
                        warn!("{e:#}");
                    }
                }
            }
        }
    })
}
