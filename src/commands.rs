//! Control-surface commands and the worker pool that runs them.
//!
//! Requests enter a bounded queue; up to [`WORKERS`] run at once, each to
//! completion. Replies go back on a per-request oneshot.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{Config, SharedConfig};
use crate::events::{BandwidthSample, Circuit};
use crate::lifecycle::{LifecycleController, ProxyStatus, StatusSnapshot};
use crate::vpn::TunnelStatus;

/// Commands allowed to run concurrently.
pub const WORKERS: usize = 3;

/// Requests waiting for a worker before `submit` applies backpressure.
const QUEUE_DEPTH: usize = 32;

const LOCAL_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Status,
    ReloadConfig,
    NewIdentity,
    EnableVpn,
    DisableVpn,
    /// Empty clears the restriction.
    SetExitNodes(Vec<String>),
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let Some(name) = words.next() else {
            bail!("empty command");
        };
        let rest: Vec<&str> = words.collect();

        let command = match name.to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "status" => Self::Status,
            "reload-config" | "reload" => Self::ReloadConfig,
            "new-identity" | "newnym" => Self::NewIdentity,
            "enable-vpn" => Self::EnableVpn,
            "disable-vpn" => Self::DisableVpn,
            "set-exit-nodes" => {
                let nodes = rest
                    .iter()
                    .flat_map(|part| part.split(','))
                    .map(str::trim)
                    .filter(|node| !node.is_empty())
                    .map(str::to_string)
                    .collect();
                return Ok(Self::SetExitNodes(nodes));
            }
            other => bail!("unknown command '{other}'"),
        };
        if !rest.is_empty() {
            bail!("'{name}' takes no arguments");
        }
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
            Self::Status => f.write_str("status"),
            Self::ReloadConfig => f.write_str("reload-config"),
            Self::NewIdentity => f.write_str("new-identity"),
            Self::EnableVpn => f.write_str("enable-vpn"),
            Self::DisableVpn => f.write_str("disable-vpn"),
            Self::SetExitNodes(nodes) => write!(f, "set-exit-nodes {}", nodes.join(",")),
        }
    }
}

/// Reply to `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReply {
    pub status: ProxyStatus,
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub socks_port: u16,
    pub http_tunnel_port: u16,
    pub dns_port: u16,
    pub trans_port: u16,
    pub socks_url: String,
    pub http_url: String,
    pub bandwidth: Option<BandwidthSample>,
    pub circuits: Vec<Circuit>,
    pub vpn: Option<TunnelStatus>,
}

impl StatusReply {
    pub fn from_snapshot(snapshot: StatusSnapshot) -> Self {
        Self {
            status: snapshot.status,
            timestamp: Utc::now(),
            host: LOCAL_HOST.to_string(),
            socks_port: snapshot.socks_port,
            http_tunnel_port: snapshot.http_tunnel_port,
            dns_port: snapshot.dns_port,
            trans_port: snapshot.trans_port,
            socks_url: format!("socks5://{LOCAL_HOST}:{}", snapshot.socks_port),
            http_url: format!("http://{LOCAL_HOST}:{}", snapshot.http_tunnel_port),
            bandwidth: snapshot.bandwidth,
            circuits: snapshot.circuits,
            vpn: snapshot.tunnel,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum CommandReply {
    Ok { command: String },
    Status(Box<StatusReply>),
    Error { command: String, message: String },
}

impl CommandReply {
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Error { .. })
    }
}

struct Request {
    command: Command,
    reply: Option<oneshot::Sender<CommandReply>>,
}

/// Runs commands against the controller on a small worker pool.
pub struct CommandDispatcher {
    requests: mpsc::Sender<Request>,
    pump: JoinHandle<()>,
}

impl CommandDispatcher {
    /// `config_path` is re-read by `reload-config`; without one the live
    /// configuration is re-applied as is.
    pub fn spawn(
        controller: Arc<LifecycleController>,
        config: SharedConfig,
        config_path: Option<PathBuf>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Request>(QUEUE_DEPTH);
        let handler = Arc::new(Handler {
            controller,
            config,
            config_path,
        });
        let permits = Arc::new(Semaphore::new(WORKERS));

        let pump = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let reply = handler.run(&request.command).await;
                    if let Some(tx) = request.reply {
                        let _ = tx.send(reply);
                    }
                    drop(permit);
                });
            }
            debug!("Command queue closed");
        });

        Self { requests: tx, pump }
    }

    /// Queue a command without waiting for its outcome.
    pub async fn submit(&self, command: Command) -> Result<()> {
        self.requests
            .send(Request {
                command,
                reply: None,
            })
            .await
            .map_err(|_| anyhow::anyhow!("command dispatcher is shut down"))
    }

    /// Queue a command; the reply arrives on the returned receiver.
    pub async fn enqueue(&self, command: Command) -> Result<oneshot::Receiver<CommandReply>> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request {
                command,
                reply: Some(tx),
            })
            .await
            .map_err(|_| anyhow::anyhow!("command dispatcher is shut down"))?;
        Ok(rx)
    }

    /// Queue a command and wait for its reply.
    pub async fn call(&self, command: Command) -> Result<CommandReply> {
        Ok(self.enqueue(command).await?.await?)
    }

    /// Stop accepting commands; queued ones still run.
    pub async fn shutdown(self) {
        drop(self.requests);
        if let Err(e) = self.pump.await {
            warn!("Command pump ended abnormally: {e}");
        }
    }
}

struct Handler {
    controller: Arc<LifecycleController>,
    config: SharedConfig,
    config_path: Option<PathBuf>,
}

impl Handler {
    async fn run(&self, command: &Command) -> CommandReply {
        debug!("Running command: {command}");
        let result: Result<()> = match command {
            Command::Status => {
                let reply = StatusReply::from_snapshot(self.controller.snapshot());
                return CommandReply::Status(Box::new(reply));
            }
            Command::Start => self.controller.start().await.map_err(Into::into),
            Command::Stop => {
                self.controller.stop().await;
                Ok(())
            }
            Command::ReloadConfig => self.reload().await,
            Command::NewIdentity => self.controller.request_new_identity().await,
            Command::EnableVpn => self.controller.enable_vpn().await.map_err(Into::into),
            Command::DisableVpn => self.controller.disable_vpn().await.map_err(Into::into),
            Command::SetExitNodes(nodes) => self.controller.set_exit_nodes(nodes.clone()).await,
        };

        match result {
            Ok(()) => CommandReply::Ok {
                command: command.to_string(),
            },
            Err(e) => {
                warn!("Command '{command}' failed: {e:#}");
                CommandReply::Error {
                    command: command.to_string(),
                    message: format!("{e:#}"),
                }
            }
        }
    }

    async fn reload(&self) -> Result<()> {
        if let Some(path) = &self.config_path {
            let fresh = Config::load_or_default(path)?;
            *self.config.write() = fresh;
        }
        self.controller.reload_config().await
    }
}
