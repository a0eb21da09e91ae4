//! Virtual interface builder contract.

use std::net::{IpAddr, Ipv4Addr};

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

/// Address of this side of the tunnel (the interface address).
pub const VIRTUAL_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 200, 1);

/// Address the bridging engine presents on the virtual network.
pub const VIRTUAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 200, 2);

pub const VIRTUAL_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Placeholder resolver; the bridging engine intercepts queries to it.
pub const PLACEHOLDER_DNS: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);

/// Everything needed to bring up a virtual interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSpec {
    pub mtu: u16,
    pub session: String,
    pub addresses: Vec<(IpAddr, u8)>,
    pub routes: Vec<(IpAddr, u8)>,
    pub dns_servers: Vec<IpAddr>,
    pub allowed_applications: Vec<String>,
    pub disallowed_applications: Vec<String>,
}

impl InterfaceSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn set_session(mut self, session: impl Into<String>) -> Self {
        self.session = session.into();
        self
    }

    pub fn add_address(mut self, addr: impl Into<IpAddr>, prefix: u8) -> Self {
        self.addresses.push((addr.into(), prefix));
        self
    }

    pub fn add_route(mut self, addr: impl Into<IpAddr>, prefix: u8) -> Self {
        self.routes.push((addr.into(), prefix));
        self
    }

    pub fn add_dns_server(mut self, addr: impl Into<IpAddr>) -> Self {
        self.dns_servers.push(addr.into());
        self
    }

    pub fn add_allowed_application(mut self, package_id: impl Into<String>) -> Self {
        self.allowed_applications.push(package_id.into());
        self
    }

    pub fn add_disallowed_application(mut self, package_id: impl Into<String>) -> Self {
        self.disallowed_applications.push(package_id.into());
        self
    }

    /// Standard tunnel layout: gateway address, placeholder DNS with its own
    /// host route, and a default route capturing all other traffic.
    pub fn tunnel(mtu: u16, session: &str) -> Self {
        Self::new()
            .set_mtu(mtu)
            .add_address(VIRTUAL_GATEWAY, 32)
            .set_session(session)
            .add_dns_server(PLACEHOLDER_DNS)
            .add_route(PLACEHOLDER_DNS, 32)
            .add_route(Ipv4Addr::UNSPECIFIED, 0)
    }
}

/// An established OS-level virtual interface.
pub trait TunDevice: Send {
    /// Kernel interface name.
    fn name(&self) -> &str;

    /// File descriptor the bridging engine reads packets from, if any.
    fn raw_fd(&self) -> Option<i32>;

    /// Release the interface and any routing state installed for it.
    fn close(&mut self) -> Result<()>;
}

/// Owning handle to a [`TunDevice`]. Closing is idempotent and also happens
/// on drop.
pub struct InterfaceHandle {
    device: Box<dyn TunDevice>,
    closed: bool,
}

impl InterfaceHandle {
    pub fn new(device: Box<dyn TunDevice>) -> Self {
        Self {
            device,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn raw_fd(&self) -> Option<i32> {
        if self.closed {
            None
        } else {
            self.device.raw_fd()
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.device.close()
    }
}

impl std::fmt::Debug for InterfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceHandle")
            .field("name", &self.device.name())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for InterfaceHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close interface {}: {e:#}", self.device.name());
        }
    }
}

/// Platform primitive that turns an [`InterfaceSpec`] into a live interface.
#[async_trait]
pub trait TunProvider: Send + Sync {
    /// Whether allow/deny lists of applications are honoured.
    fn supports_per_app_routing(&self) -> bool;

    async fn establish(&self, spec: &InterfaceSpec) -> Result<InterfaceHandle>;
}
