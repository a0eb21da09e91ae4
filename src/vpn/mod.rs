//! VPN tunnel: a virtual interface bridged into the local SOCKS endpoint.
//!
//! [`TunnelOrchestrator`] owns one session at a time. The platform pieces it
//! drives sit behind traits so the orchestrator runs the same against the
//! Linux implementations here or against in-memory fakes:
//!
//! - [`TunProvider`]: creates the interface (`LinuxTunProvider` on Linux)
//! - [`PacketBridge`]: moves packets to SOCKS (`Tun2SocksProcess`)
//! - [`DnsRelay`]: answers tunnel DNS through the proxy (`PdnsdRelay`)
//! - [`PackageRegistry`]: installed apps for per-app routing

pub mod apps;
pub mod bridge;
pub mod bypass;
pub mod dns;
pub mod interface;
#[cfg(target_os = "linux")]
pub mod linux_tun;
pub mod orchestrator;

pub use apps::{
    enumerate_apps, plan_app_routing, AppRoutingEntry, AppRoutingPlan, ConfigPackageRegistry,
    InstalledApp, PackageRegistry,
};
pub use bridge::{BridgeParams, PacketBridge, Tun2SocksProcess};
pub use bypass::SocksBypass;
pub use dns::{DnsRelay, PdnsdRelay};
pub use interface::{InterfaceHandle, InterfaceSpec, TunDevice, TunProvider};
#[cfg(target_os = "linux")]
pub use linux_tun::LinuxTunProvider;
pub use orchestrator::{TunnelDeps, TunnelOrchestrator, TunnelStatus};
