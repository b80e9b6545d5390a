//! OpenDT Daemon - Main Entry Point
//!
//! Shadow-mode digital twin service: replays the workload stream through the
//! external simulator per closed window and, when enabled, calibrates the
//! power model against measured power.

mod config;
mod http;
mod service;

use std::path::PathBuf;

use clap::Parser;

use config::DaemonConfig;

#[derive(Parser, Debug)]
#[command(name = "opendt-daemon")]
#[command(about = "OpenDT Daemon - Streaming datacenter digital twin")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for the HTTP status surface (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// NATS server URL (overrides the config file)
    #[arg(long)]
    nats_url: Option<String>,

    /// Use the in-process message plane instead of NATS
    #[arg(long, default_value_t = false)]
    memory_plane: bool,

    /// Root output directory (overrides the config file)
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("opendt=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if let Some(url) = args.nats_url {
        config.plane.url = url;
    }
    if args.memory_plane {
        config.plane.mode = "memory".to_string();
    }
    if let Some(output_dir) = args.output_dir {
        config.sim.output_dir = output_dir;
    }

    tracing::info!(
        "🚀 OpenDT daemon starting (window width {}m, calibration {})",
        config.engine.window_width_minutes,
        if config.calibration.enabled { "on" } else { "off" }
    );

    service::run(config).await
}
