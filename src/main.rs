use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use onionlink::config::{default_config_path, Config, SharedConfig};
use onionlink::connectivity::{spawn_monitor, RouteTableProbe};
use onionlink::notify::{FanoutNotifier, Notifier, TracingNotifier};
use onionlink::tor::{ConfigRegistry, TorDaemon};
use onionlink::{Command, CommandDispatcher, LifecycleController, SharedContext, TunnelOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "onionlink", version, about = "Tor supervisor with a VPN tunnel")]
struct Cli {
    /// Config file (default: ~/.onionlink/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervisor, reading commands from stdin (one per line)
    Daemon {
        /// Enable VPN mode regardless of the config file
        #[arg(long)]
        vpn: bool,

        /// Don't start Tor until a `start` command arrives
        #[arg(long)]
        no_start: bool,
    },
    /// Print the generated torrc
    Torrc,
    /// Parse a command and print its canonical form
    Command {
        #[arg(required = true, num_args = 1..)]
        words: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("onionlink=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config_path = cli.config.or_else(default_config_path);
    let config = match &config_path {
        Some(path) => Config::load_or_default(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Daemon { vpn, no_start } => {
            let mut config = config;
            config.vpn.enabled |= vpn;
            run_daemon(config.into_shared(), config_path, !no_start).await
        }
        Commands::Torrc => {
            let config = config.into_shared();
            let daemon = TorDaemon::new(config.clone(), Arc::new(ConfigRegistry::new(config)));
            print!("{}", daemon.render_config(None));
            Ok(())
        }
        Commands::Command { words } => {
            let command: Command = words.join(" ").parse()?;
            println!("{command}");
            Ok(())
        }
    }
}

async fn run_daemon(config: SharedConfig, config_path: Option<PathBuf>, autostart: bool) -> Result<()> {
    let context = SharedContext::new();
    let registry = Arc::new(ConfigRegistry::new(config.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(FanoutNotifier::new(vec![Box::new(TracingNotifier)]));
    let proxy = Arc::new(TorDaemon::new(config.clone(), registry.clone()));

    let mut controller = LifecycleController::new(
        config.clone(),
        context.clone(),
        proxy,
        registry,
        notifier.clone(),
    );
    if let Some(tunnel) = build_tunnel(&config, &context, &notifier) {
        controller = controller.with_tunnel(Arc::new(tunnel));
    }
    let controller = Arc::new(controller);

    let token = CancellationToken::new();
    let monitor = spawn_monitor(
        controller.clone(),
        Arc::new(RouteTableProbe::default()),
        config.clone(),
        notifier.clone(),
        token.clone(),
    );
    let dispatcher = CommandDispatcher::spawn(controller.clone(), config, config_path);
    if autostart {
        dispatcher.submit(Command::Start).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(command) => {
                        let reply = dispatcher.enqueue(command).await?;
                        tokio::spawn(async move {
                            let Ok(reply) = reply.await else {
                                return;
                            };
                            match serde_json::to_string(&reply) {
                                Ok(json) => println!("{json}"),
                                Err(e) => warn!("Failed to encode reply: {e}"),
                            }
                        });
                    }
                    Err(e) => warn!("{e:#}"),
                }
            }
        }
    }

    token.cancel();
    let _ = monitor.await;
    dispatcher.shutdown().await;
    controller.stop().await;
    Ok(())
}

#[cfg(target_os = "linux")]
fn build_tunnel(
    config: &SharedConfig,
    context: &Arc<SharedContext>,
    notifier: &Arc<dyn Notifier>,
) -> Option<TunnelOrchestrator> {
    use onionlink::supervisor::ProcessSupervisor;
    use onionlink::vpn::{
        ConfigPackageRegistry, LinuxTunProvider, PdnsdRelay, Tun2SocksProcess, TunnelDeps,
    };

    let (vpn, dns, data_dir) = {
        let config = config.read();
        (config.vpn.clone(), config.dns.clone(), config.tor.data_dir_path())
    };
    let packages = Arc::new(ConfigPackageRegistry::new(config.clone()));
    let deps = TunnelDeps {
        tun: Arc::new(LinuxTunProvider::new(vpn.interface_name, packages.clone())),
        bridge: Arc::new(Tun2SocksProcess::new(vpn.tun2socks_binary)),
        dns: Arc::new(PdnsdRelay::new(
            dns.binary,
            dns.listen,
            data_dir.join("pdnsd"),
            Arc::new(ProcessSupervisor::default()),
        )),
        packages,
        notifier: notifier.clone(),
    };
    Some(TunnelOrchestrator::new(config.clone(), context.clone(), deps))
}

#[cfg(not(target_os = "linux"))]
fn build_tunnel(
    _config: &SharedConfig,
    _context: &Arc<SharedContext>,
    _notifier: &Arc<dyn Notifier>,
) -> Option<TunnelOrchestrator> {
    warn!("VPN mode is only available on Linux");
    None
}
