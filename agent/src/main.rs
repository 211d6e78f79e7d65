//! Portgate agent entry point.

use anyhow::Result;
use clap::{ArgAction, Parser};
use portgate::config::{self, SessionConfig, TunnelDescriptor, DEFAULT_RELAY_HOST};
use portgate::supervisor::Supervisor;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "portgate", version)]
#[command(about = "Expose local services through a portgate relay", long_about = None)]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Tunnel route: <name>|<local-target> or <name>|<label>|<local-target>
    #[arg(short = 'f', long = "forward", value_name = "SPEC")]
    forward: Vec<String>,

    /// Relay API key
    #[arg(short = 'k', long = "key", value_name = "KEY")]
    key: String,

    /// Relay hostname
    #[arg(short = 'h', long = "host", value_name = "HOST", default_value = DEFAULT_RELAY_HOST)]
    host: String,

    /// Connect over ws:// instead of wss://
    #[arg(short = 'n', long = "non-secure")]
    non_secure: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long = "log", value_name = "LEVEL", default_value = "info")]
    log: String,

    /// Shorthand for --log debug, accepted for compatibility
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Print help
    #[arg(long = "help", action = ArgAction::Help)]
    help: Option<bool>,

    /// Print version
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        cli.log.parse().unwrap_or(tracing::Level::INFO)
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut tunnels = Vec::new();
    for spec in &cli.forward {
        match TunnelDescriptor::parse(spec) {
            Ok(tunnel) => tunnels.push(tunnel),
            Err(err) => warn!("skipping forward spec '{spec}': {err:#}"),
        }
    }
    if tunnels.is_empty() {
        error!("no valid tunnel routes configured");
        std::process::exit(1);
    }

    let config = SessionConfig {
        api_key: cli.key,
        hostname: cli.host,
        secure: !cli.non_secure,
        user_agent: format!("portgate/{}", env!("CARGO_PKG_VERSION")),
        client_id: config::generate_client_id(),
        tunnels,
    };

    println!();
    for tunnel in &config.tunnels {
        println!(
            "  ✓ {} ({}) → {}  [https://{}.{}]",
            tunnel.remote_name, tunnel.label, tunnel.local_target, tunnel.remote_name, config.hostname
        );
    }
    println!("\nPress Ctrl+C to stop the agent\n");

    let (supervisor, mut status) = Supervisor::new(config);

    tokio::spawn(async move {
        info!("status: {}", *status.borrow());
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!("status: {current}");
        }
    });

    tokio::select! {
        _ = supervisor.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down...");
        }
    }

    Ok(())
}
