// meshrelay: relay server and bridge CLI
//
// `meshrelay relay` rebroadcasts envelopes among every connected peer;
// `meshrelay bridge` forwards locally produced envelopes to one upstream.

mod config;
mod console;
mod node;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use config::Config;
use meshrelay_core::{
    Bridge, BridgeConfig, Envelope, LinkConfig, LinkRegistry, PeerKey, RelayServer,
    RelayServerConfig,
};
use node::Node;
use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "meshrelay")]
#[command(about = "Store-and-forward envelope relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: <config dir>/meshrelay/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server
    Relay(RelayArgs),
    /// Run a bridge to one upstream relay
    Bridge(BridgeArgs),
    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct RelayArgs {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Peers to keep connected (`host[:port]`, comma-separated or repeated; port defaults to the listen port)
    #[arg(long)]
    forward_to: Vec<String>,

    /// Publish a synthetic message every second
    #[arg(long)]
    send_message: bool,

    /// Drop envelopes whose id was seen among the last N
    #[arg(long)]
    dedup: Option<NonZeroUsize>,
}

#[derive(Args)]
struct BridgeArgs {
    /// Upstream relay (`host[:port]`, default 127.0.0.1:7777)
    #[arg(long)]
    forward_to: Option<String>,

    /// Application id used in generated message ids
    #[arg(long)]
    app_id: Option<u16>,

    /// Publish a synthetic message every second
    #[arg(long)]
    send_message: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config
    Show,
    /// Print the config file location
    Path,
    /// Write a default config file if none exists
    Init,
}

fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "meshrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            Ok(None)
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = Config::resolve_path(cli.config.as_deref())?;

    if let Commands::Config { action } = &cli.command {
        return cmd_config(action, &config_path);
    }

    let config = Config::load_from(&config_path)?;
    let log_dir = cli
        .log_file
        .clone()
        .or_else(|| config.log_dir.as_ref().map(PathBuf::from));
    let _guard = init_logging(log_dir.as_deref())?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start Tokio runtime")?;
    let result = runtime.block_on(async move {
        match cli.command {
            Commands::Relay(args) => cmd_relay(args, config).await,
            Commands::Bridge(args) => cmd_bridge(args, config).await,
            Commands::Config { .. } => Ok(()),
        }
    });
    // a pending stdin read would otherwise block runtime drop
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn cmd_relay(args: RelayArgs, mut config: Config) -> Result<()> {
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if !args.forward_to.is_empty() {
        config.forward_to = args.forward_to;
    }
    if let Some(capacity) = args.dedup {
        config.dedup_capacity = Some(capacity.get());
    }

    let server_config = RelayServerConfig {
        listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port)),
        peers: config.forward_peers()?,
        reconnect: config.relay_reconnect(),
        dedup_capacity: config.dedup_capacity.and_then(NonZeroUsize::new),
        ..Default::default()
    };
    let registry = Arc::new(LinkRegistry::with_config(config.link_config()));
    let server = RelayServer::new(server_config, registry)?;
    let addr = server.start().await.context("Failed to start relay server")?;

    println!("{} Relay listening on {}", "✓".green(), addr.to_string().bright_cyan());
    for peer in &server.config().peers {
        println!("  {} forwarding to {}", "→".bright_green(), peer);
    }

    let node = Arc::new(Node::relay(server, format!("relay-{}", addr.port())));
    run_node(node, args.send_message).await
}

async fn cmd_bridge(args: BridgeArgs, mut config: Config) -> Result<()> {
    if let Some(upstream) = args.forward_to {
        config.upstream = Some(upstream);
    }
    if let Some(app_id) = args.app_id {
        config.application_id = app_id;
    }

    let upstream = config.upstream_peer()?;

    let bridge_config = BridgeConfig {
        reconnect: config.bridge_reconnect(),
        ..BridgeConfig::for_application(upstream, config.application_id)
    };
    let link_config = LinkConfig {
        audit_group: Some(node::FILE_GROUP.to_string()),
        ..config.link_config()
    };
    let registry = Arc::new(LinkRegistry::with_config(link_config));
    let bridge = Bridge::new(bridge_config, registry)?.with_handler(Arc::new(
        |envelope: Envelope, from: &PeerKey| {
            info!(
                id = %envelope.id(),
                group = %envelope.group(),
                bytes = envelope.payload().len(),
                from = %from,
                "Received envelope"
            );
        },
    ));
    bridge.start()?;

    println!(
        "{} Bridge {} forwarding to {}",
        "✓".green(),
        bridge.node_id().bright_cyan(),
        bridge.config().upstream
    );

    run_node(Arc::new(Node::Bridge(bridge)), args.send_message).await
}

/// Run the console (and optional generator) until quit or Ctrl-C
async fn run_node(node: Arc<Node>, send_message: bool) -> Result<()> {
    let generator =
        send_message.then(|| node::spawn_generator(Arc::clone(&node), Duration::from_secs(1)));

    println!("Type {} for commands.", "help".bright_green());
    let ended = tokio::select! {
        exit = console::run(Arc::clone(&node)) => exit?,
        _ = tokio::signal::ctrl_c() => console::ConsoleExit::Quit,
    };
    if ended == console::ConsoleExit::Eof {
        info!("stdin closed; running until Ctrl-C");
        tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    }

    println!("Shutting down...");
    if let Some(generator) = generator {
        generator.abort();
    }
    node.shutdown().await;
    Ok(())
}

fn cmd_config(action: &ConfigAction, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Path => {
            println!("{}", path.display());
        }

        ConfigAction::Show => {
            let config = Config::load_from(path)?;
            println!("{} ({})", "Configuration".bold(), path.display().to_string().dimmed());
            println!();
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Init => {
            if path.exists() {
                println!("{} Config already exists at {}", "✓".green(), path.display());
            } else {
                Config::default().save_to(path)?;
                println!("{} Wrote default config to {}", "✓".green(), path.display());
            }
        }
    }

    Ok(())
}
