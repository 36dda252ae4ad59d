use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use ha_allowgate::Allowlist;
use ha_allowgate::AppState;
use ha_allowgate::Cli;
use ha_allowgate::Mode;
use ha_allowgate::ProxyError;
use ha_allowgate::SharedAllowlist;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let ha_url = url::Url::parse(&cli.ha_url)
        .map_err(ProxyError::InvalidUrl)
        .with_context(|| format!("invalid --ha-url: {}", cli.ha_url))?;

    tracing::info!(host = %cli.host, port = cli.port, "starting ha-allowgate");
    tracing::info!(mode = cli.mode.as_str(), "operating mode");
    tracing::info!(ha_url = %cli.ha_url, "home assistant url");
    tracing::info!(config_path = %cli.config_path.display(), "whitelist config path");

    let mut allowlist = Allowlist::new(Some(cli.config_path.clone()));
    allowlist.load().context("failed to load whitelist config")?;
    tracing::info!(
        endpoints = allowlist.endpoints.len(),
        entities = allowlist.entities.len(),
        devices = allowlist.devices.len(),
        areas = allowlist.areas.len(),
        "loaded whitelist"
    );

    let shared = SharedAllowlist::new(cli.mode, allowlist);
    let state = Arc::new(AppState::new(cli.mode, ha_url, shared).context("failed to build proxy state")?);

    match cli.mode {
        Mode::Learn => tracing::info!("starting in LEARN mode - tracking accessed endpoints/entities"),
        Mode::Limit => tracing::info!("starting in LIMIT mode - enforcing whitelist restrictions"),
    }

    ha_allowgate::run(&cli.host, cli.port, state).await
}
