//! Bridging engine: moves packets between the virtual interface and the
//! local SOCKS endpoint.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Child;
use tracing::{debug, warn};

/// Parameters for one bridging-engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeParams {
    /// Interface file descriptor (inherited by the engine).
    pub tun_fd: i32,
    pub mtu: u16,
    pub virtual_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub socks_server: SocketAddr,
    pub dns_gateway: SocketAddr,
    pub udp_relay: bool,
}

impl BridgeParams {
    /// Command-line arguments in badvpn-tun2socks form.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--tunfd".to_string(),
            self.tun_fd.to_string(),
            "--tunmtu".to_string(),
            self.mtu.to_string(),
            "--netif-ipaddr".to_string(),
            self.virtual_ip.to_string(),
            "--netif-netmask".to_string(),
            self.netmask.to_string(),
            "--socks-server-addr".to_string(),
            self.socks_server.to_string(),
            "--dnsgw".to_string(),
            self.dns_gateway.to_string(),
            "--loglevel".to_string(),
            "warning".to_string(),
        ];
        if self.udp_relay {
            args.push("--enable-udprelay".to_string());
        }
        args
    }
}

#[async_trait]
pub trait PacketBridge: Send + Sync {
    async fn start(&self, params: &BridgeParams) -> Result<()>;

    /// Stop the engine and wait for it to release the interface.
    /// Safe to call when not running.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// External `tun2socks` process.
pub struct Tun2SocksProcess {
    binary: String,
    child: tokio::sync::Mutex<Option<Child>>,
    running: std::sync::atomic::AtomicBool,
}

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Startup settle time before checking the engine is still alive.
const STARTUP_SETTLE: Duration = Duration::from_millis(300);

impl Tun2SocksProcess {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            child: tokio::sync::Mutex::new(None),
            running: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        which::which(shellexpand::tilde(&self.binary).as_ref())
            .with_context(|| format!("'{}' binary not found in PATH", self.binary))
    }
}

/// Let `fd` survive exec into the engine process.
#[cfg(unix)]
fn clear_cloexec(fd: i32) -> Result<()> {
    // SAFETY: fcntl on a caller-provided descriptor; errors are reported via errno.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error()).context("F_GETFD failed");
    }
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error()).context("F_SETFD failed");
    }
    Ok(())
}

#[cfg(not(unix))]
fn clear_cloexec(_fd: i32) -> Result<()> {
    bail!("passing interface descriptors is only supported on unix")
}

#[async_trait]
impl PacketBridge for Tun2SocksProcess {
    async fn start(&self, params: &BridgeParams) -> Result<()> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            bail!("bridging engine already running");
        }
        let binary = self.resolve_binary()?;
        clear_cloexec(params.tun_fd)?;

        let mut child = tokio::process::Command::new(&binary)
            .args(params.to_args())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", binary.display()))?;

        tokio::time::sleep(STARTUP_SETTLE).await;
        if let Some(status) = child.try_wait().context("failed to poll bridging engine")? {
            bail!("bridging engine exited during startup with {status}");
        }

        debug!(pid = child.id(), "Bridging engine started");
        *guard = Some(child);
        self.running.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
        let Some(mut child) = guard.take() else {
            return Ok(());
        };
        child.start_kill().ok();
        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!("Bridging engine exited with {status}"),
            Ok(Err(e)) => warn!("Failed to reap bridging engine: {e}"),
            Err(_) => bail!("bridging engine did not exit in {}s", STOP_TIMEOUT.as_secs()),
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }
}
