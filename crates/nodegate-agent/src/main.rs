//! # nodegate-agent
//!
//! nodegate relay binary: loads settings, wires the server crate together,
//! and runs until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nodegate_server::auth::StaticCredentials;
use nodegate_server::config::ServerConfig;
use nodegate_server::server::GatewayServer;
use nodegate_settings::GatewaySettings;

/// nodegate control-plane relay.
#[derive(Parser, Debug)]
#[command(name = "nodegate", version, about = "Control-plane relay for worker nodes")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings; 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.nodegate/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Upstream master URL (overrides settings).
    #[arg(long)]
    upstream_url: Option<String>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

/// Load settings and apply command-line overrides.
fn resolve_settings(cli: &Cli) -> Result<GatewaySettings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(nodegate_settings::settings_path);
    let mut settings = nodegate_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;

    if let Some(host) = &cli.host {
        settings.server.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(url) = &cli.upstream_url {
        settings.upstream.url = Some(url.trim().to_owned()).filter(|u| !u.is_empty());
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.json_logs {
        nodegate_core::logging::init_json_subscriber(&cli.log_level);
    } else {
        nodegate_core::logging::init_subscriber(&cli.log_level);
    }

    let settings = resolve_settings(&cli)?;
    let config = ServerConfig::from_settings(&settings);
    let authenticator = Arc::new(StaticCredentials::new(
        config.node_secrets.clone(),
        config.require_credentials,
    ));
    if config.admin_token.is_none() {
        tracing::warn!("no admin token configured, controller connections disabled");
    }

    let mut server =
        GatewayServer::new(config, authenticator).context("Failed to build gateway")?;
    match nodegate_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => tracing::warn!(error = %e, "metrics recorder not installed"),
    }

    let addr = server.listen().await.context("Failed to bind listener")?;
    tracing::info!("nodegate v{} listening on ws://{addr}/ws", nodegate_core::constants::VERSION);

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
