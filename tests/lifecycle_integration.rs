//! Lifecycle controller integration tests.
//!
//! Validates: the Off → Starting → On → Stopping → Off walk, launch and
//! config-write failures, the bootstrap timeout, stop racing a pending
//! start, crash detection, event-driven bandwidth and circuit state, the
//! tunnel hand-off in VPN mode, and the command surface on top.

mod common;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, FakeBridge, FakeDns, FakePackages, FakeProxy, FakeTun, Log, Recorder};
use onionlink::config::{Config, HiddenServiceConfig};
use onionlink::context::SharedContext;
use onionlink::error::TunnelError;
use onionlink::events::{Circuit, CircuitStatus, NormalizedEvent};
use onionlink::notify::Notification;
use onionlink::tor::{ConfigRegistry, ProxyProcess};
use onionlink::vpn::{TunnelDeps, TunnelOrchestrator};
use onionlink::{Command, CommandDispatcher, CommandReply, LifecycleController, ProxyStatus};

struct Harness {
    log: Log,
    proxy: Arc<FakeProxy>,
    notifier: Arc<Recorder>,
    controller: Arc<LifecycleController>,
}

fn controller_with(
    proxy: Arc<FakeProxy>,
    log: Log,
    config: Config,
    tunnel: Option<(Arc<FakeTun>, Arc<SharedContext>)>,
) -> Harness {
    let config = config.into_shared();
    let notifier = Recorder::new(log.clone());
    let context = tunnel
        .as_ref()
        .map(|(_, ctx)| ctx.clone())
        .unwrap_or_else(SharedContext::new);

    let mut controller = LifecycleController::new(
        config.clone(),
        context.clone(),
        proxy.clone(),
        Arc::new(ConfigRegistry::new(config.clone())),
        notifier.clone(),
    );
    if let Some((tun, _)) = tunnel {
        let orchestrator = TunnelOrchestrator::new(
            config,
            context,
            TunnelDeps {
                tun,
                bridge: FakeBridge::new(log.clone()),
                dns: FakeDns::new(log.clone()),
                packages: FakePackages::standard(),
                notifier: notifier.clone(),
            },
        );
        controller = controller.with_tunnel(Arc::new(orchestrator));
    }

    Harness {
        log,
        proxy,
        notifier,
        controller: Arc::new(controller),
    }
}

fn harness(config: Config) -> Harness {
    let log = Log::default();
    controller_with(FakeProxy::bootstrapping(log.clone()), log, config, None)
}

fn silent_harness(config: Config) -> Harness {
    let log = Log::default();
    controller_with(FakeProxy::new(log.clone()), log, config, None)
}

#[tokio::test]
async fn start_and_stop_walk_the_state_machine() {
    let h = harness(Config::default());
    h.controller.start().await.unwrap();
    assert_eq!(h.controller.status(), ProxyStatus::On);
    assert!(h.proxy.is_running());

    h.controller.stop().await;
    assert_eq!(h.controller.status(), ProxyStatus::Off);

    let statuses: Vec<String> = h
        .log
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("status:"))
        .collect();
    assert_eq!(
        statuses,
        vec!["status:STARTING", "status:ON", "status:STOPPING", "status:OFF"]
    );
}

#[tokio::test]
async fn start_writes_config_before_launch_and_enables_network() {
    let h = harness(Config::default());
    h.controller.start().await.unwrap();

    let write = h.log.position("proxy-write-config").unwrap();
    let starting = h.log.position("status:STARTING").unwrap();
    let launch = h.log.position("proxy-start").unwrap();
    let network = h.log.position("proxy-disable-network:false").unwrap();
    assert!(write < starting && starting < launch && launch < network);
}

#[tokio::test]
async fn first_built_circuit_signals_readiness() {
    let log = Log::default();
    let proxy = FakeProxy::new(log.clone());
    proxy
        .script
        .lock()
        .push("650 CIRC 1 BUILT $AAAA=NodeA,$BBBB~NodeB PURPOSE=GENERAL".into());
    let mut config = Config::default();
    config.notifications.expanded = true;
    let h = controller_with(proxy, log, config, None);

    h.controller.start().await.unwrap();
    assert_eq!(h.controller.status(), ProxyStatus::On);

    let circuits = h.controller.circuits();
    assert_eq!(circuits.len(), 1);
    assert_eq!(circuits[0].path[0].id, "AAAA");
    assert_eq!(circuits[0].path[0].display_name, "NodeA");
    assert_eq!(circuits[0].path[1].id, "BBBB");
    assert_eq!(circuits[0].path[1].display_name, "NodeB");

    h.proxy.emit("650 CIRC 1 CLOSED $AAAA=NodeA,$BBBB~NodeB").await;
    let controller = h.controller.clone();
    assert!(eventually(|| controller.circuits().is_empty()).await);
}

#[tokio::test]
async fn launch_failure_returns_to_off_with_error() {
    let h = silent_harness(Config::default());
    h.proxy.fail_start.store(true, Ordering::SeqCst);

    let err = h.controller.start().await.unwrap_err();
    assert!(matches!(err, TunnelError::LaunchFailure { .. }));
    assert_eq!(h.controller.status(), ProxyStatus::Off);
    assert_eq!(h.notifier.errors().len(), 1);
    assert!(h.log.position("status:STOPPING").is_none());
}

#[tokio::test]
async fn config_write_failure_aborts_before_launch() {
    let h = silent_harness(Config::default());
    h.proxy.fail_write.store(true, Ordering::SeqCst);

    let err = h.controller.start().await.unwrap_err();
    assert!(matches!(err, TunnelError::ConfigWriteFailure { .. }));
    assert_eq!(h.controller.status(), ProxyStatus::Off);
    assert!(h.log.position("proxy-start").is_none());
    assert!(h.log.position("status:STARTING").is_none());
    assert!(h.notifier.errors().is_empty());
    assert_eq!(h.notifier.notices().len(), 1);
}

#[tokio::test]
async fn missing_readiness_signal_times_out() {
    let mut config = Config::default();
    config.tor.bootstrap_timeout_secs = 1;
    let h = silent_harness(config);

    let err = h.controller.start().await.unwrap_err();
    assert!(matches!(err, TunnelError::LaunchFailure { .. }));
    assert!(err.to_string().contains("no readiness signal"));
    assert_eq!(h.controller.status(), ProxyStatus::Off);
    assert!(!h.proxy.is_running());
}

#[tokio::test]
async fn control_channel_closing_during_bootstrap_fails_the_start() {
    let h = silent_harness(Config::default());
    let controller = h.controller.clone();
    let start = tokio::spawn(async move { controller.start().await });

    let mut status = h.controller.subscribe_status();
    status
        .wait_for(|s| *s == ProxyStatus::Starting)
        .await
        .unwrap();
    let log = h.log.clone();
    assert!(eventually(|| log.position("proxy-start").is_some()).await);
    h.proxy.crash();

    let err = start.await.unwrap().unwrap_err();
    assert!(matches!(err, TunnelError::LaunchFailure { .. }));
    assert_eq!(h.controller.status(), ProxyStatus::Off);
}

#[tokio::test]
async fn stop_cancels_a_pending_start() {
    let h = silent_harness(Config::default());
    let controller = h.controller.clone();
    let start = tokio::spawn(async move { controller.start().await });

    let mut status = h.controller.subscribe_status();
    status
        .wait_for(|s| *s == ProxyStatus::Starting)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), h.controller.stop())
        .await
        .expect("stop must not wait for bootstrap");
    let result = start.await.unwrap();
    assert!(matches!(result, Err(TunnelError::StartCancelled)));
    assert_eq!(h.controller.status(), ProxyStatus::Off);
    assert!(!h.proxy.is_running());
    // Starting goes straight to Off.
    assert!(h.log.position("status:STOPPING").is_none());
}

#[tokio::test]
async fn stop_twice_has_no_extra_side_effects() {
    let h = harness(Config::default());
    h.controller.start().await.unwrap();
    h.controller.stop().await;

    let log_len = h.log.len();
    let seen = h.notifier.seen.lock().len();
    h.controller.stop().await;
    assert_eq!(h.log.len(), log_len);
    assert_eq!(h.notifier.seen.lock().len(), seen);
    assert_eq!(h.controller.status(), ProxyStatus::Off);
}

#[tokio::test]
async fn start_while_on_only_reenables_network() {
    let h = harness(Config::default());
    h.controller.start().await.unwrap();
    h.controller.start().await.unwrap();

    assert_eq!(h.controller.status(), ProxyStatus::On);
    assert_eq!(h.log.count("proxy-start"), 1);
    assert_eq!(h.log.count("proxy-disable-network:false"), 2);
}

#[tokio::test]
async fn crash_while_on_brings_status_back_to_off() {
    let h = harness(Config::default());
    h.controller.start().await.unwrap();

    h.proxy.crash();
    let controller = h.controller.clone();
    assert!(eventually(|| controller.status() == ProxyStatus::Off).await);
    assert!(h
        .notifier
        .notices()
        .iter()
        .any(|n| n.contains("exited unexpectedly")));
}

#[tokio::test]
async fn stale_ready_signal_after_stop_is_ignored() {
    let h = harness(Config::default());
    h.controller.start().await.unwrap();
    h.controller.stop().await;

    h.controller
        .on_control_event(&NormalizedEvent::CircuitStatus(Circuit {
            id: "9".into(),
            status: CircuitStatus::Built,
            path: Vec::new(),
        }));
    assert_eq!(h.controller.status(), ProxyStatus::Off);
}

#[tokio::test]
async fn bandwidth_events_are_deduplicated_and_totalled() {
    let h = harness(Config::default());
    h.controller.start().await.unwrap();

    h.proxy.emit("650 BW 10 20").await;
    h.proxy.emit("650 BW 10 20").await;
    h.proxy.emit("650 BW 30 40").await;

    let controller = h.controller.clone();
    assert!(eventually(|| controller.bandwidth().map(|b| b.read) == Some(30)).await);
    let sample = h.controller.bandwidth().unwrap();
    assert_eq!(sample.total_read, 40);
    assert_eq!(sample.total_written, 60);

    let bandwidth_events = h
        .notifier
        .seen
        .lock()
        .iter()
        .filter(|n| matches!(n, Notification::Bandwidth(_)))
        .count();
    assert_eq!(bandwidth_events, 2);

    h.controller.stop().await;
    assert_eq!(h.controller.bandwidth(), None);
}

#[tokio::test]
async fn network_toggle_only_applies_while_running() {
    let h = harness(Config::default());
    h.controller.set_network_enabled(false).await.unwrap();
    assert_eq!(h.log.count("proxy-disable-network"), 0);

    h.controller.start().await.unwrap();
    h.controller.set_network_enabled(false).await.unwrap();
    h.controller.set_network_enabled(false).await.unwrap();
    assert_eq!(h.log.count("proxy-disable-network:true"), 2);
}

#[tokio::test]
async fn new_identity_is_a_no_op_without_a_process() {
    let h = harness(Config::default());
    h.controller.request_new_identity().await.unwrap();
    assert_eq!(h.log.count("proxy-newnym"), 0);

    h.controller.start().await.unwrap();
    h.controller.request_new_identity().await.unwrap();
    assert_eq!(h.log.count("proxy-newnym"), 1);
}

#[tokio::test]
async fn published_onions_are_announced_once_on() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = Config::default();
    config.tor.data_dir = dir.path().display().to_string();
    config.hidden_services.push(HiddenServiceConfig {
        name: "web".into(),
        local_port: 8080,
        onion_port: 80,
        domain: None,
        auth_cookie: false,
        auth_cookie_value: None,
        enabled: true,
    });
    let hs_dir = dir.path().join("hidden_services").join("hs8080");
    std::fs::create_dir_all(&hs_dir).unwrap();
    std::fs::write(hs_dir.join("hostname"), "abcdefghijklmnop.onion\n").unwrap();

    let h = harness(config);
    h.controller.start().await.unwrap();
    assert!(h
        .notifier
        .notices()
        .iter()
        .any(|n| n.contains("abcdefghijklmnop.onion")));
}

fn vpn_harness(per_app_platform: bool) -> (Harness, Arc<FakeTun>, Arc<SharedContext>) {
    let log = Log::default();
    let mut config = Config::default();
    config.vpn.enabled = true;
    config.vpn.restart_grace_ms = 0;
    let tun = FakeTun::new(log.clone(), per_app_platform);
    let context = SharedContext::with_bypass_endpoint(SocketAddr::from(([127, 0, 0, 1], 0)));
    let h = controller_with(
        FakeProxy::bootstrapping(log.clone()),
        log,
        config,
        Some((tun.clone(), context.clone())),
    );
    (h, tun, context)
}

#[tokio::test]
async fn vpn_mode_starts_tunnel_after_on_and_tears_it_down_before_off() {
    let (h, tun, _) = vpn_harness(true);
    h.controller.start().await.unwrap();

    let live = tun.live.clone();
    assert!(eventually(|| live.load(Ordering::SeqCst) == 1).await);
    let on = h.log.position("status:ON").unwrap();
    let establish = h.log.position("establish:0").unwrap();
    assert!(on < establish);
    assert_eq!(*h.proxy.bypass.lock(), None);

    h.controller.stop().await;
    assert_eq!(tun.live.load(Ordering::SeqCst), 0);
    let closed = h.log.position("close:0").unwrap();
    let off = h.log.position("status:OFF").unwrap();
    assert!(closed < off);
}

#[tokio::test]
async fn proxy_is_pointed_at_bypass_without_per_app_routing() {
    let (h, _, context) = vpn_harness(false);
    h.controller.start().await.unwrap();
    assert_eq!(*h.proxy.bypass.lock(), Some(context.bypass_endpoint()));
    h.controller.stop().await;
}

#[tokio::test]
async fn disable_and_enable_vpn_while_on() {
    let (h, tun, _) = vpn_harness(true);
    h.controller.start().await.unwrap();
    let live = tun.live.clone();
    assert!(eventually(|| live.load(Ordering::SeqCst) == 1).await);

    h.controller.disable_vpn().await.unwrap();
    assert_eq!(tun.live.load(Ordering::SeqCst), 0);
    assert_eq!(h.controller.status(), ProxyStatus::On);

    h.controller.enable_vpn().await.unwrap();
    let live = tun.live.clone();
    assert!(eventually(|| live.load(Ordering::SeqCst) == 1).await);
    h.controller.stop().await;
}

#[tokio::test]
async fn enable_vpn_without_tunnel_is_unavailable() {
    let h = harness(Config::default());
    let err = h.controller.enable_vpn().await.unwrap_err();
    assert!(matches!(err, TunnelError::Unavailable { .. }));
}

#[tokio::test]
async fn dispatcher_runs_commands_and_reports_status() {
    let h = harness(Config::default());
    let config = Config::default().into_shared();
    let dispatcher = CommandDispatcher::spawn(h.controller.clone(), config, None);

    let reply = dispatcher.call(Command::Start).await.unwrap();
    assert!(reply.is_ok());

    let CommandReply::Status(status) = dispatcher.call(Command::Status).await.unwrap() else {
        panic!("expected a status reply");
    };
    assert_eq!(status.status, ProxyStatus::On);
    assert_eq!(status.socks_url, "socks5://127.0.0.1:9150");

    let reply = dispatcher
        .call(Command::SetExitNodes(vec!["{de}".into()]))
        .await
        .unwrap();
    assert!(reply.is_ok());
    assert_eq!(h.log.count("proxy-exit-nodes:{de}"), 1);

    let reply = dispatcher.call(Command::EnableVpn).await.unwrap();
    assert!(!reply.is_ok());

    dispatcher.call(Command::Stop).await.unwrap();
    assert_eq!(h.controller.status(), ProxyStatus::Off);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn concurrent_start_and_stop_settle_in_a_terminal_state() {
    let h = harness(Config::default());
    let mut tasks = Vec::new();
    for i in 0..6 {
        let controller = h.controller.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let _ = controller.start().await;
            } else {
                controller.stop().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    let status = h.controller.status();
    assert!(matches!(status, ProxyStatus::Off | ProxyStatus::On));
    assert_eq!(
        status == ProxyStatus::On,
        h.proxy.is_running(),
        "status {status} disagrees with the process"
    );
}
