//! Tor daemon adapter.
//!
//! Spawns the `tor` binary with a generated torrc, attaches to its control
//! port (address published via `ControlPortWriteToFile`), authenticates with
//! the cookie file and subscribes to the events the lifecycle consumes.
//!
//! # Lifecycle
//! ```text
//! TorDaemon::write_config(bypass)
//!   → builds torrc from config + registry, writes <data_dir>/torrc
//!
//! TorDaemon::start()
//!   → spawns `tor -f <torrc>`
//!   → waits for the control-port file
//!   → AUTHENTICATE <cookie>, TAKEOWNERSHIP, SETEVENTS ...
//!   → returns the async-event stream
//!
//! TorDaemon::stop()
//!   → SIGNAL SHUTDOWN, closes the control connection, reaps the child
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use torctl::{ControlClient, Signal, TcpTransport};
use tracing::{debug, info, warn};

use crate::config::SharedConfig;

use super::registry::HiddenServiceRegistry;
use super::torrc::{build_torrc, TorPaths};
use super::ProxyProcess;

/// Events subscribed on the control channel.
pub const SUBSCRIBED_EVENTS: &[&str] = &[
    "BW",
    "CIRC",
    "STREAM",
    "ORCONN",
    "NOTICE",
    "WARN",
    "ERR",
    "STATUS_CLIENT",
];

/// How long to wait for tor to publish its control port.
const CONTROL_PORT_WAIT: Duration = Duration::from_secs(30);

const CONTROL_PORT_POLL: Duration = Duration::from_millis(100);

/// Grace period for the process to exit after SHUTDOWN.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningTor {
    child: Child,
    client: Arc<ControlClient>,
}

pub struct TorDaemon {
    config: SharedConfig,
    registry: Arc<dyn HiddenServiceRegistry>,
    running: Mutex<Option<RunningTor>>,
}

impl TorDaemon {
    pub fn new(config: SharedConfig, registry: Arc<dyn HiddenServiceRegistry>) -> Self {
        Self {
            config,
            registry,
            running: Mutex::new(None),
        }
    }

    pub fn paths(&self) -> TorPaths {
        TorPaths::new(self.config.read().tor.data_dir_path())
    }

    /// The torrc text `write_config` would produce.
    pub fn render_config(&self, bypass: Option<SocketAddr>) -> String {
        let tor = self.config.read().tor.clone();
        build_torrc(&tor, &self.paths(), self.registry.as_ref(), bypass)
    }

    fn client(&self) -> Result<Arc<ControlClient>> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.client.clone())
            .context("tor is not running")
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        let binary = self.config.read().tor.binary.clone();
        let expanded = shellexpand::tilde(&binary).into_owned();
        which::which(&expanded).with_context(|| {
            format!("'{binary}' binary not found. Install tor or set [tor].binary accordingly.")
        })
    }

    async fn wait_for_control_port(child: &mut Child, paths: &TorPaths) -> Result<SocketAddr> {
        let deadline = tokio::time::Instant::now() + CONTROL_PORT_WAIT;
        loop {
            if let Ok(content) = tokio::fs::read_to_string(&paths.control_port_file).await {
                if let Some(addr) = parse_control_port_file(&content) {
                    return Ok(addr);
                }
            }
            if let Some(status) = child.try_wait().context("failed to poll tor process")? {
                bail!("tor exited during startup with {status}");
            }
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "tor did not publish a control port in {}s",
                    CONTROL_PORT_WAIT.as_secs()
                );
            }
            tokio::time::sleep(CONTROL_PORT_POLL).await;
        }
    }

    async fn attach(addr: SocketAddr, paths: &TorPaths) -> Result<ControlClient> {
        let transport = TcpTransport::connect(addr).await?;
        let client = ControlClient::new(Box::new(transport));
        client
            .authenticate_cookie(&paths.cookie_file)
            .await
            .context("control port authentication failed")?;
        client.take_ownership().await?;
        client.set_events(SUBSCRIBED_EVENTS).await?;
        Ok(client)
    }
}

/// Parse the `PORT=host:port` line tor writes to `ControlPortWriteToFile`.
pub fn parse_control_port_file(content: &str) -> Option<SocketAddr> {
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix("PORT="))
        .and_then(|addr| addr.parse().ok())
}

#[async_trait]
impl ProxyProcess for TorDaemon {
    async fn write_config(&self, bypass: Option<SocketAddr>) -> Result<()> {
        let paths = self.paths();
        let torrc = self.render_config(bypass);
        tokio::fs::create_dir_all(&paths.data_dir)
            .await
            .with_context(|| format!("failed to create {}", paths.data_dir.display()))?;
        tokio::fs::write(&paths.torrc, torrc)
            .await
            .with_context(|| format!("failed to write {}", paths.torrc.display()))?;
        debug!("Wrote {}", paths.torrc.display());
        Ok(())
    }

    async fn start(&self) -> Result<mpsc::Receiver<String>> {
        if self.is_running() {
            bail!("tor is already running");
        }
        let binary = self.resolve_binary()?;
        let paths = self.paths();
        // A stale file from a previous run would point at a dead port.
        let _ = tokio::fs::remove_file(&paths.control_port_file).await;

        let mut child = tokio::process::Command::new(&binary)
            .arg("-f")
            .arg(&paths.torrc)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn tor binary: {}", binary.display()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "onionlink::tor", "{line}");
                }
            });
        }

        let addr = match Self::wait_for_control_port(&mut child, &paths).await {
            Ok(addr) => addr,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };
        let client = match Self::attach(addr, &paths).await {
            Ok(client) => client,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };
        let events = client
            .take_events()
            .context("control event stream already taken")?;

        info!(pid = child.id(), "tor started, control port {addr}");
        *self.running.lock() = Some(RunningTor {
            child,
            client: Arc::new(client),
        });
        Ok(events)
    }

    async fn stop(&self) -> Result<()> {
        let Some(RunningTor { mut child, client }) = self.running.lock().take() else {
            return Ok(());
        };

        if let Err(e) = client.signal(Signal::Shutdown).await {
            debug!("SIGNAL SHUTDOWN not acknowledged: {e:#}");
        }
        client.close().await;

        match tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!("tor exited with {status}"),
            Ok(Err(e)) => warn!("Failed to reap tor: {e}"),
            Err(_) => {
                warn!("tor did not exit in {}s, killing", EXIT_TIMEOUT.as_secs());
                child.kill().await.context("failed to kill tor")?;
            }
        }
        Ok(())
    }

    async fn disable_network(&self, disabled: bool) -> Result<()> {
        let value = if disabled { "1" } else { "0" };
        self.client()?
            .set_conf(&[("DisableNetwork", value)])
            .await
    }

    async fn request_new_identity(&self) -> Result<()> {
        self.client()?.signal(Signal::NewNym).await
    }

    async fn reload_config(&self) -> Result<()> {
        self.client()?.signal(Signal::Reload).await
    }

    async fn set_exit_nodes(&self, nodes: &[String]) -> Result<()> {
        let client = self.client()?;
        if nodes.is_empty() {
            client.set_conf(&[("ExitNodes", ""), ("StrictNodes", "0")]).await
        } else {
            let joined = nodes.join(",");
            client
                .set_conf(&[("ExitNodes", joined.as_str()), ("StrictNodes", "1")])
                .await
        }
    }

    fn is_running(&self) -> bool {
        match self.running.lock().as_mut() {
            Some(running) => running.child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    fn socks_port(&self) -> u16 {
        self.config.read().tor.socks_port
    }
}

impl Drop for TorDaemon {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().as_mut() {
            let _ = running.child.start_kill();
        }
    }
}
