//! Agentgate server
//!
//! Binds the WebSocket control plane and serves until interrupted.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use agentgate::config::{load_config_from_path, AuthMode};
use agentgate::gateway::{server, Gateway};
use agentgate::{Config, Result};

#[derive(Parser, Debug)]
#[command(name = "agentgate", version, about = "WebSocket control plane for chat-agent platforms")]
struct Args {
    /// Path to a config file (defaults to the standard config location)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,

    /// Override the session store path
    #[arg(long)]
    sessions: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agentgate=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let mut config = load_config_from_path(path)?;
            agentgate::config::apply_env_overrides(&mut config);
            config
        }
        None => Config::from_env()?,
    };
    if let Some(bind) = args.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    if let Some(sessions) = args.sessions {
        config.sessions.store_path = Some(sessions);
    }

    info!("Starting agentgate v{}", agentgate::VERSION);
    if config.auth.mode == AuthMode::None && config.gateway.bind != "127.0.0.1" {
        tracing::warn!(
            bind = %config.gateway.bind,
            "no authentication configured on a non-loopback bind"
        );
    }

    let gateway = Gateway::new(config).await?;
    server::serve(gateway).await?;

    info!("Gateway shutdown complete");
    Ok(())
}
