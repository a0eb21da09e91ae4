//! Tunnel orchestrator
//!
//! Owns the virtual interface, the DNS relay, the optional SOCKS bypass and
//! the bridging engine for one tunnel session. All session mutation happens
//! on a single worker task fed by a bounded command queue: `start` only
//! enqueues, and a `start` that arrives while a session exists (or while a
//! setup is still queued) takes the restart path.
//!
//! # Restart
//! ```text
//! mark restarting → stop bridging engine → grace period
//!   → bypass (no per-app routing) → DNS relay → interface spec
//!   → per-app allow/deny lists → establish new interface
//!   → swap handles, close old → start bridging engine → clear restarting
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::SharedConfig;
use crate::context::SharedContext;
use crate::error::TunnelError;
use crate::notify::Notifier;

use super::apps::{enumerate_apps, plan_app_routing, PackageRegistry};
use super::bridge::{BridgeParams, PacketBridge};
use super::bypass::SocksBypass;
use super::dns::DnsRelay;
use super::interface::{InterfaceHandle, InterfaceSpec, TunProvider, VIRTUAL_IP, VIRTUAL_NETMASK};

/// Pending commands beyond which `start`/`stop` callers wait for room.
const COMMAND_QUEUE_DEPTH: usize = 8;

/// Collaborators the orchestrator drives.
pub struct TunnelDeps {
    pub tun: Arc<dyn TunProvider>,
    pub bridge: Arc<dyn PacketBridge>,
    pub dns: Arc<dyn DnsRelay>,
    pub packages: Arc<dyn PackageRegistry>,
    pub notifier: Arc<dyn Notifier>,
}

/// Observable session state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub active: bool,
    pub restarting: bool,
    pub per_app_routing: bool,
    pub bypass: Option<SocketAddr>,
    pub interface: Option<String>,
}

enum TunnelCommand {
    Start {
        socks_port: u16,
        per_app_routing: bool,
        done: Option<oneshot::Sender<Result<(), TunnelError>>>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

struct TunnelSession {
    interface: InterfaceHandle,
    per_app_routing: bool,
    restarting: bool,
}

pub struct TunnelOrchestrator {
    commands: mpsc::Sender<TunnelCommand>,
    status: Arc<Mutex<TunnelStatus>>,
    uses_bypass: bool,
}

impl TunnelOrchestrator {
    /// Spawn the worker task. Must be called inside a tokio runtime.
    pub fn new(config: SharedConfig, context: Arc<SharedContext>, deps: TunnelDeps) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let status = Arc::new(Mutex::new(TunnelStatus::default()));
        let uses_bypass = !deps.tun.supports_per_app_routing() || config.read().vpn.socks_bypass;
        let worker = Worker {
            config,
            context,
            deps,
            bypass: SocksBypass::new(),
            session: None,
            dns_running: false,
            status: status.clone(),
        };
        tokio::spawn(worker.run(rx));
        Self {
            commands: tx,
            status,
            uses_bypass,
        }
    }

    /// Queue a tunnel (re)start and return without waiting for setup.
    pub async fn start(&self, socks_port: u16, per_app_routing: bool) -> Result<(), TunnelError> {
        self.send(TunnelCommand::Start {
            socks_port,
            per_app_routing,
            done: None,
        })
        .await
    }

    /// Queue a (re)start and wait for its outcome.
    pub async fn start_and_wait(
        &self,
        socks_port: u16,
        per_app_routing: bool,
    ) -> Result<(), TunnelError> {
        let (done, rx) = oneshot::channel();
        self.send(TunnelCommand::Start {
            socks_port,
            per_app_routing,
            done: Some(done),
        })
        .await?;
        rx.await.map_err(|_| unavailable())?
    }

    /// Tear the session down and wait until it is gone. Teardown failures
    /// are reported to the notifier, never returned.
    pub async fn stop(&self) -> Result<(), TunnelError> {
        let (done, rx) = oneshot::channel();
        self.send(TunnelCommand::Stop { done }).await?;
        rx.await.map_err(|_| unavailable())
    }

    pub fn status(&self) -> TunnelStatus {
        self.status.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.status.lock().active
    }

    /// Whether sessions run the SOCKS bypass (and the proxy should use it).
    pub fn uses_bypass(&self) -> bool {
        self.uses_bypass
    }

    async fn send(&self, command: TunnelCommand) -> Result<(), TunnelError> {
        self.commands.send(command).await.map_err(|_| unavailable())
    }
}

fn unavailable() -> TunnelError {
    TunnelError::Unavailable {
        component: "tunnel worker",
    }
}

struct Worker {
    config: SharedConfig,
    context: Arc<SharedContext>,
    deps: TunnelDeps,
    bypass: SocksBypass,
    session: Option<TunnelSession>,
    /// Set once the relay started; a setup can fail before any session exists.
    dns_running: bool,
    status: Arc<Mutex<TunnelStatus>>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<TunnelCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                TunnelCommand::Start {
                    socks_port,
                    per_app_routing,
                    done,
                } => {
                    let result = self.start(socks_port, per_app_routing).await;
                    if let Some(done) = done {
                        let _ = done.send(result);
                    }
                }
                TunnelCommand::Stop { done } => {
                    self.teardown().await;
                    let _ = done.send(());
                }
            }
        }
        // Queue closed: the owner is gone.
        self.teardown().await;
    }

    fn publish(&self) {
        let mut status = self.status.lock();
        *status = match &self.session {
            Some(session) => TunnelStatus {
                active: !session.interface.is_closed(),
                restarting: session.restarting,
                per_app_routing: session.per_app_routing,
                bypass: self.bypass.local_addr(),
                interface: Some(session.interface.name().to_string()),
            },
            None => TunnelStatus {
                bypass: self.bypass.local_addr(),
                ..TunnelStatus::default()
            },
        };
    }

    async fn start(&mut self, socks_port: u16, per_app_requested: bool) -> Result<(), TunnelError> {
        if let Some(session) = self.session.as_mut() {
            session.restarting = true;
            self.publish();
            info!("Tunnel restart: stopping bridging engine");
            if let Err(e) = self.deps.bridge.stop().await {
                warn!("Bridging engine stop failed: {e:#}");
            }
            let grace = Duration::from_millis(self.config.read().vpn.restart_grace_ms);
            tokio::time::sleep(grace).await;
        }

        match self.build(socks_port, per_app_requested).await {
            Ok(()) => {
                self.publish();
                Ok(())
            }
            Err(e) => {
                let err = TunnelError::tunnel_setup(format!("{e:#}"));
                self.deps.notifier.error(&err.to_string());
                self.teardown().await;
                Err(err)
            }
        }
    }

    async fn build(&mut self, socks_port: u16, per_app_requested: bool) -> Result<()> {
        let (vpn, tor_dns_port) = {
            let config = self.config.read();
            (config.vpn.clone(), config.tor.dns_port)
        };
        let platform_per_app = self.deps.tun.supports_per_app_routing();
        let per_app_routing = per_app_requested && platform_per_app;

        if !platform_per_app || vpn.socks_bypass {
            let endpoint = self.context.bypass_endpoint();
            self.bypass
                .start(endpoint)
                .await
                .context("SOCKS bypass failed to start")?;
        }

        let upstream = SocketAddr::from((Ipv4Addr::LOCALHOST, tor_dns_port));
        self.deps
            .dns
            .start(upstream)
            .await
            .context("DNS relay failed to start")?;
        self.dns_running = true;

        let mut spec = InterfaceSpec::tunnel(vpn.mtu, &vpn.session_name);
        if per_app_routing {
            let entries = enumerate_apps(self.deps.packages.as_ref(), &vpn.torified_apps)
                .context("failed to enumerate installed applications")?;
            let plan = plan_app_routing(&entries, &vpn.own_package);
            for package in plan.allowed {
                spec = spec.add_allowed_application(package);
            }
            for package in plan.disallowed {
                spec = spec.add_disallowed_application(package);
            }
        }

        let interface = self
            .deps
            .tun
            .establish(&spec)
            .await
            .context("failed to establish virtual interface")?;
        let tun_fd = interface
            .raw_fd()
            .context("virtual interface has no file descriptor")?;
        info!("Virtual interface {} established", interface.name());

        // Replace first, close the old handle only once the new one exists.
        let previous = match self.session.as_mut() {
            Some(session) => {
                session.per_app_routing = per_app_routing;
                Some(std::mem::replace(&mut session.interface, interface))
            }
            None => {
                self.session = Some(TunnelSession {
                    interface,
                    per_app_routing,
                    restarting: false,
                });
                None
            }
        };
        if let Some(mut old) = previous {
            debug!("Closing previous interface {}", old.name());
            if let Err(e) = old.close() {
                warn!("Failed to close previous interface: {e:#}");
            }
        }
        self.publish();

        let params = BridgeParams {
            tun_fd,
            mtu: vpn.mtu,
            virtual_ip: VIRTUAL_IP,
            netmask: VIRTUAL_NETMASK,
            socks_server: SocketAddr::from((Ipv4Addr::LOCALHOST, socks_port)),
            dns_gateway: self.deps.dns.listen_addr(),
            udp_relay: true,
        };
        self.deps
            .bridge
            .start(&params)
            .await
            .context("bridging engine failed to start")?;

        if let Some(session) = self.session.as_mut() {
            session.restarting = false;
        }
        Ok(())
    }

    /// Stop everything; every step runs even if an earlier one fails.
    async fn teardown(&mut self) {
        if self.session.is_none() && !self.bypass.is_running() && !self.dns_running {
            return;
        }

        if let Err(e) = self.deps.bridge.stop().await {
            warn!("Bridging engine stop failed: {e:#}");
        }
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.interface.close() {
                warn!("Failed to close interface: {e:#}");
            }
        }
        self.bypass.stop().await;
        self.dns_running = false;
        if let Err(e) = self.deps.dns.stop().await {
            self.deps.notifier.notice(&format!("DNS relay cleanup: {e}"));
        }
        self.publish();
        info!("Tunnel stopped");
    }
}
