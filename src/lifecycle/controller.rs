//! Lifecycle controller
//!
//! Drives the proxy process through the [`ProxyStatus`] state machine,
//! feeds its control channel into a [`ControlEventProcessor`], and starts
//! the tunnel once the proxy becomes usable.
//!
//! `start` and `stop` serialize on one async mutex held for the whole
//! transition. `stop` cancels a pending `start` before queueing for that
//! mutex, so a start stuck waiting on bootstrap never blocks teardown.
//! Control events run on the reader task and only touch the status through
//! the Starting→On edge.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ProxyStatus;
use crate::config::SharedConfig;
use crate::context::SharedContext;
use crate::error::TunnelError;
use crate::events::{
    BandwidthSample, Circuit, CircuitStatus, CircuitTable, ControlEventProcessor, NormalizedEvent,
};
use crate::notify::{Notification, Notifier};
use crate::tor::registry::read_published_onion;
use crate::tor::{HiddenServiceRegistry, ProxyProcess};
use crate::vpn::{TunnelOrchestrator, TunnelStatus};

#[derive(Debug, Default)]
struct ProxyState {
    status: ProxyStatus,
    bandwidth: Option<BandwidthSample>,
}

/// Point-in-time view for status replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: ProxyStatus,
    pub bandwidth: Option<BandwidthSample>,
    pub circuits: Vec<Circuit>,
    pub socks_port: u16,
    pub http_tunnel_port: u16,
    pub dns_port: u16,
    pub trans_port: u16,
    pub tunnel: Option<TunnelStatus>,
}

pub struct LifecycleController {
    proxy: Arc<dyn ProxyProcess>,
    tunnel: Option<Arc<TunnelOrchestrator>>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<dyn HiddenServiceRegistry>,
    config: SharedConfig,
    context: Arc<SharedContext>,
    /// Status and the aggregate bandwidth sample, mutated together.
    state: Mutex<ProxyState>,
    status_tx: watch::Sender<ProxyStatus>,
    transition: tokio::sync::Mutex<()>,
    circuits: CircuitTable,
    /// Cancelled (and replaced) by every `stop`.
    stop_requested: Mutex<CancellationToken>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleController {
    pub fn new(
        config: SharedConfig,
        context: Arc<SharedContext>,
        proxy: Arc<dyn ProxyProcess>,
        registry: Arc<dyn HiddenServiceRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ProxyStatus::Off);
        Self {
            proxy,
            tunnel: None,
            notifier,
            registry,
            config,
            context,
            state: Mutex::new(ProxyState::default()),
            status_tx,
            transition: tokio::sync::Mutex::new(()),
            circuits: CircuitTable::new(),
            stop_requested: Mutex::new(CancellationToken::new()),
            reader: Mutex::new(None),
        }
    }

    /// Attach the tunnel started once the proxy is on (when VPN mode is enabled).
    pub fn with_tunnel(mut self, tunnel: Arc<TunnelOrchestrator>) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    pub fn status(&self) -> ProxyStatus {
        self.state.lock().status
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ProxyStatus> {
        self.status_tx.subscribe()
    }

    pub fn bandwidth(&self) -> Option<BandwidthSample> {
        self.state.lock().bandwidth
    }

    /// Snapshot of the built-circuit table.
    pub fn circuits(&self) -> Vec<Circuit> {
        self.circuits.snapshot()
    }

    pub fn tunnel(&self) -> Option<&Arc<TunnelOrchestrator>> {
        self.tunnel.as_ref()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (status, bandwidth) = {
            let state = self.state.lock();
            (state.status, state.bandwidth)
        };
        let config = self.config.read();
        StatusSnapshot {
            status,
            bandwidth,
            circuits: self.circuits.snapshot(),
            socks_port: self.proxy.socks_port(),
            http_tunnel_port: config.tor.http_tunnel_port,
            dns_port: config.tor.dns_port,
            trans_port: config.tor.trans_port,
            tunnel: self.tunnel.as_ref().map(|t| t.status()),
        }
    }

    /// Bring the proxy up and wait until it is usable.
    ///
    /// Ignored while stopping. When already on with a live process this only
    /// re-enables the network. Any failure leaves the status at `Off`.
    pub async fn start(self: &Arc<Self>) -> Result<(), TunnelError> {
        if self.status() == ProxyStatus::Stopping {
            info!("Ignoring start request while stopping");
            return Ok(());
        }

        let cancel = self.stop_requested.lock().clone();
        let _guard = tokio::select! {
            guard = self.transition.lock() => guard,
            () = cancel.cancelled() => return Err(TunnelError::StartCancelled),
        };

        match self.status() {
            ProxyStatus::Off => {}
            ProxyStatus::On if self.proxy.is_running() => {
                info!("Proxy already on, re-enabling network");
                if let Err(e) = self.proxy.disable_network(false).await {
                    warn!("Failed to re-enable proxy network: {e:#}");
                }
                return Ok(());
            }
            ProxyStatus::Stopping => {
                info!("Ignoring start request while stopping");
                return Ok(());
            }
            status => {
                debug!("Clearing stale {status} run before starting");
                self.shutdown_locked().await;
            }
        }
        if cancel.is_cancelled() {
            return Err(TunnelError::StartCancelled);
        }

        if let Err(e) = self.proxy.write_config(self.bypass_for_proxy()).await {
            let err = TunnelError::config_write(format!("{e:#}"));
            self.notifier.notice(&err.to_string());
            return Err(err);
        }

        self.reset_run_state();
        self.set_status(ProxyStatus::Starting);
        self.notifier.notice("Starting Tor");

        let events = tokio::select! {
            started = self.proxy.start() => match started {
                Ok(events) => events,
                Err(e) => return Err(self.fail_start(TunnelError::launch(format!("{e:#}"))).await),
            },
            () = cancel.cancelled() => {
                self.shutdown_locked().await;
                return Err(TunnelError::StartCancelled);
            }
        };
        let (closed_tx, closed_rx) = oneshot::channel();
        self.spawn_reader(events, closed_tx);

        // The proxy launches with its network disabled.
        if let Err(e) = self.proxy.disable_network(false).await {
            warn!("Failed to enable proxy network: {e:#}");
        }

        let timeout = Duration::from_secs(self.config.read().tor.bootstrap_timeout_secs);
        let mut status_rx = self.status_tx.subscribe();
        let outcome = tokio::select! {
            ready = tokio::time::timeout(
                timeout,
                status_rx.wait_for(|status| *status != ProxyStatus::Starting),
            ) => match ready {
                Ok(Ok(status)) if *status == ProxyStatus::On => Ok(()),
                Ok(_) => Err(TunnelError::launch("proxy left the starting state unexpectedly")),
                Err(_) => Err(TunnelError::launch(format!(
                    "no readiness signal within {}s",
                    timeout.as_secs()
                ))),
            },
            _ = closed_rx => Err(TunnelError::launch("control channel closed during bootstrap")),
            () = cancel.cancelled() => Err(TunnelError::StartCancelled),
        };

        match outcome {
            Ok(()) => {
                self.after_ready().await;
                Ok(())
            }
            Err(TunnelError::StartCancelled) => {
                info!("Start cancelled by stop request");
                self.shutdown_locked().await;
                Err(TunnelError::StartCancelled)
            }
            Err(err) => Err(self.fail_start(err).await),
        }
    }

    /// Bring everything down. Idempotent; cleanup failures are reported to
    /// the notifier and never keep the status away from `Off`.
    pub async fn stop(&self) {
        {
            let mut token = self.stop_requested.lock();
            token.cancel();
            *token = CancellationToken::new();
        }
        let _guard = self.transition.lock().await;
        self.shutdown_locked().await;
    }

    /// Toggle the proxy's network. Ignored while off.
    pub async fn set_network_enabled(&self, enabled: bool) -> Result<()> {
        if self.status() == ProxyStatus::Off {
            debug!("Ignoring network change while off");
            return Ok(());
        }
        self.proxy
            .disable_network(!enabled)
            .await
            .context("failed to toggle proxy network")
    }

    /// Ask for fresh circuits. A no-op when no proxy is running.
    pub async fn request_new_identity(&self) -> Result<()> {
        if !self.proxy.is_running() {
            debug!("No running proxy, skipping new identity");
            return Ok(());
        }
        self.proxy
            .request_new_identity()
            .await
            .context("failed to request a new identity")?;
        self.notifier.notice("New identity requested");
        Ok(())
    }

    /// Regenerate the proxy configuration from the live config and have a
    /// running proxy re-read it.
    pub async fn reload_config(&self) -> Result<()> {
        if !self.proxy.is_running() {
            debug!("No running proxy, configuration applies on next start");
            return Ok(());
        }
        self.proxy
            .write_config(self.bypass_for_proxy())
            .await
            .map_err(|e| TunnelError::config_write(format!("{e:#}")))?;
        self.proxy.reload_config().await?;
        self.notifier.notice("Configuration reloaded");
        Ok(())
    }

    /// Restrict exit relays. An empty list clears the restriction.
    pub async fn set_exit_nodes(&self, nodes: Vec<String>) -> Result<()> {
        self.config.write().tor.exit_nodes = nodes.clone();
        if self.proxy.is_running() {
            self.proxy.set_exit_nodes(&nodes).await?;
        }
        let message = if nodes.is_empty() {
            "Exit node restriction cleared".to_string()
        } else {
            format!("Exit nodes set to {}", nodes.join(","))
        };
        self.notifier.notice(&message);
        Ok(())
    }

    /// Turn VPN mode on, starting the tunnel right away if the proxy is on.
    pub async fn enable_vpn(&self) -> Result<(), TunnelError> {
        let tunnel = self.tunnel.clone().ok_or(TunnelError::Unavailable {
            component: "tunnel orchestrator",
        })?;
        self.config.write().vpn.enabled = true;
        if self.status() != ProxyStatus::On {
            return Ok(());
        }
        if tunnel.uses_bypass() {
            // The proxy has to route its own traffic through the bypass.
            if let Err(e) = self.reload_config().await {
                self.notifier.notice(&format!("Could not apply bypass: {e:#}"));
            }
        }
        self.start_tunnel(&tunnel).await;
        Ok(())
    }

    /// Turn VPN mode off and tear the tunnel down.
    pub async fn disable_vpn(&self) -> Result<(), TunnelError> {
        self.config.write().vpn.enabled = false;
        let Some(tunnel) = self.tunnel.clone() else {
            return Ok(());
        };
        tunnel.stop().await?;
        if tunnel.uses_bypass() {
            if let Err(e) = self.reload_config().await {
                self.notifier.notice(&format!("Could not drop bypass: {e:#}"));
            }
        }
        Ok(())
    }

    /// Apply one parsed control event.
    pub fn on_control_event(&self, event: &NormalizedEvent) {
        if let NormalizedEvent::Bandwidth(sample) = event {
            {
                let mut state = self.state.lock();
                if let Some(previous) = state.bandwidth {
                    if previous.read == sample.read && previous.written == sample.written {
                        return;
                    }
                }
                state.bandwidth = Some(*sample);
            }
            self.notifier.notify(Notification::Bandwidth(*sample));
            return;
        }

        if event.signals_ready() {
            self.mark_ready();
        }
        self.forward(event);
    }

    fn forward(&self, event: &NormalizedEvent) {
        let debug_logging = self.config.read().notifications.debug_logging;
        match event {
            NormalizedEvent::CircuitStatus(circuit) => {
                if debug_logging {
                    self.notifier.debug(&circuit.to_string());
                } else if matches!(circuit.status, CircuitStatus::Built | CircuitStatus::Closed) {
                    self.notifier.notice(&circuit.to_string());
                }
            }
            NormalizedEvent::OrConnStatus { .. } => self.notifier.debug(&event.to_string()),
            NormalizedEvent::StreamStatus { .. }
            | NormalizedEvent::LogMessage { .. }
            | NormalizedEvent::Unrecognized { .. } => self.notifier.notice(&event.to_string()),
            NormalizedEvent::Bandwidth(_) => {}
        }
    }

    /// The single Starting→On edge. Stale signals after a stop are dropped.
    fn mark_ready(&self) {
        let changed = {
            let mut state = self.state.lock();
            if state.status == ProxyStatus::Starting {
                state.status = ProxyStatus::On;
                self.status_tx.send_replace(ProxyStatus::On);
                true
            } else {
                false
            }
        };
        if changed {
            info!("Proxy is ready");
            self.notifier.notify(Notification::Status(ProxyStatus::On));
        }
    }

    fn set_status(&self, status: ProxyStatus) {
        {
            let mut state = self.state.lock();
            if state.status == status {
                return;
            }
            state.status = status;
            self.status_tx.send_replace(status);
        }
        debug!("Proxy status: {status}");
        self.notifier.notify(Notification::Status(status));
    }

    fn reset_run_state(&self) {
        self.state.lock().bandwidth = None;
        self.circuits.clear();
    }

    fn bypass_for_proxy(&self) -> Option<std::net::SocketAddr> {
        let vpn_enabled = self.config.read().vpn.enabled;
        match &self.tunnel {
            Some(tunnel) if vpn_enabled && tunnel.uses_bypass() => {
                Some(self.context.bypass_endpoint())
            }
            _ => None,
        }
    }

    fn spawn_reader(self: &Arc<Self>, mut events: mpsc::Receiver<String>, closed: oneshot::Sender<()>) {
        let tracking = self.config.read().notifications.expanded;
        let mut processor = ControlEventProcessor::new(self.circuits.clone(), tracking);
        let me: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            while let Some(line) = events.recv().await {
                let Some(controller) = me.upgrade() else {
                    return;
                };
                if let Some(event) = processor.process_line(&line) {
                    controller.on_control_event(&event);
                }
            }
            // A pending start takes the closure as a launch failure.
            if closed.send(()).is_ok() {
                return;
            }
            let Some(controller) = me.upgrade() else {
                return;
            };
            if controller.status().is_live() {
                warn!("Control channel closed while proxy was {}", controller.status());
                controller.notifier.notice("Tor exited unexpectedly, shutting down");
                tokio::spawn(async move { controller.stop().await });
            }
        });

        if let Some(previous) = self.reader.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn after_ready(&self) {
        self.notifier.notice("Tor is on");
        self.announce_onions();
        if self.config.read().vpn.enabled {
            if let Some(tunnel) = self.tunnel.clone() {
                self.start_tunnel(&tunnel).await;
            }
        }
    }

    async fn start_tunnel(&self, tunnel: &TunnelOrchestrator) {
        let per_app = self.config.read().vpn.per_app_routing;
        if let Err(e) = tunnel.start(self.proxy.socks_port(), per_app).await {
            self.notifier.error(&e.to_string());
        }
    }

    fn announce_onions(&self) {
        let data_dir = self.config.read().tor.data_dir_path();
        for record in self.registry.hidden_services() {
            match read_published_onion(&data_dir, &record) {
                Ok(Some(onion)) => {
                    let mut message = format!(
                        "Hidden service '{}' on port {}: {}",
                        record.name, onion.local_port, onion.hostname
                    );
                    if let Some(cookie) = onion.cookie {
                        message.push_str(&format!(" (auth cookie {cookie})"));
                    }
                    self.notifier.notice(&message);
                }
                Ok(None) => debug!("Hidden service '{}' not published yet", record.name),
                Err(e) => warn!("Hidden service '{}': {e:#}", record.name),
            }
        }
    }

    async fn fail_start(&self, err: TunnelError) -> TunnelError {
        self.notifier.error(&err.to_string());
        self.release_run().await;
        self.set_status(ProxyStatus::Off);
        err
    }

    /// Caller holds the transition lock.
    async fn shutdown_locked(&self) {
        match self.status() {
            ProxyStatus::Off => {
                let idle = self.reader.lock().is_none() && !self.proxy.is_running();
                if idle {
                    debug!("Proxy already off");
                    return;
                }
                self.release_run().await;
            }
            ProxyStatus::Starting => {
                self.notifier.notice("Tor is shutting down");
                self.release_run().await;
                self.set_status(ProxyStatus::Off);
            }
            ProxyStatus::On | ProxyStatus::Stopping => {
                self.set_status(ProxyStatus::Stopping);
                self.notifier.notice("Tor is shutting down");
                self.release_run().await;
                self.set_status(ProxyStatus::Off);
            }
        }
    }

    /// Tear down everything a run owns. Every step runs regardless of
    /// earlier failures.
    async fn release_run(&self) {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
        if let Err(e) = self.proxy.stop().await {
            self.notifier.notice(&format!("Tor stop failed: {e:#}"));
        }
        if let Some(tunnel) = &self.tunnel {
            if let Err(e) = tunnel.stop().await {
                self.notifier.notice(&format!("Tunnel teardown failed: {e}"));
            }
        }
        self.reset_run_state();
    }
}
