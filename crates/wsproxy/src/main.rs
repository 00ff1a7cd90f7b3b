//! # wsproxy
//!
//! Bridge binary: loads settings, starts the WebSocket listener and runs
//! until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use wsproxy_core::logging::{LogFormat, init_subscriber};
use wsproxy_server::{ProxyServer, ServerConfig};
use wsproxy_settings::{ProxyMode, ProxySettings};

/// WebSocket-to-TCP/TLS line bridge.
#[derive(Parser, Debug)]
#[command(name = "wsproxy", version, about = "WebSocket-to-TCP/TLS line bridge")]
struct Cli {
    /// Settings file (default `~/.wsproxy/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Proxy mode: `passthrough` or `protocol-aware`.
    #[arg(long)]
    mode: Option<ProxyMode>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format: `compact` or `json`.
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    /// Apply flags over loaded settings; flags win.
    fn apply(&self, settings: &mut ProxySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(mode) = self.mode {
            settings.server.mode = mode;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

/// Settings from `--config` (must load) or the default path (falls back to
/// defaults, reported once logging is up).
fn load(cli: &Cli) -> Result<(ProxySettings, Option<String>)> {
    match &cli.config {
        Some(path) => {
            let settings = wsproxy_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?;
            Ok((settings, None))
        }
        None => match wsproxy_settings::load_settings() {
            Ok(settings) => Ok((settings, None)),
            Err(e) => Ok((ProxySettings::default(), Some(e.to_string()))),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut settings, load_error) = load(&cli)?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    init_subscriber(&settings.logging.level, settings.logging.format);
    if let Some(e) = load_error {
        warn!(
            path = %wsproxy_settings::settings_path().display(),
            error = %e,
            "ignoring unreadable settings file, using defaults"
        );
    }

    let mut server = ProxyServer::new(ServerConfig::from_settings(&settings))
        .context("Failed to build backend TLS configuration")?;
    match wsproxy_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => warn!(error = %e, "metrics disabled"),
    }

    let (addr, handle) = server
        .listen()
        .await
        .with_context(|| {
            format!(
                "Failed to bind {}:{}",
                settings.server.host, settings.server.port
            )
        })?;
    info!(%addr, mode = %settings.server.mode, "wsproxy ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutdown requested");
    server.shutdown().graceful_shutdown(vec![handle], None).await;
    Ok(())
}
