//! Command-line and environment configuration surface.

use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;

/// Operating mode for the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Observe live traffic and extend the allowlist with anything seen.
    Learn,
    /// Reject or silently filter everything not already on the allowlist.
    Limit,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Learn => "learn",
            Mode::Limit => "limit",
        }
    }
}

/// Home Assistant API Limiter: MITM proxy for limiting API access.
#[derive(Debug, Parser)]
#[command(name = "ha-allowgate", version, about)]
pub struct Cli {
    /// Home Assistant URL.
    #[arg(long, env = "HA_URL", default_value = "http://localhost:8123")]
    pub ha_url: String,

    /// Operating mode.
    #[arg(long, env = "MODE", value_enum, default_value = "limit")]
    pub mode: Mode,

    /// Path to whitelist config.
    #[arg(long = "config", env = "CONFIG_PATH", default_value = "./config.yaml")]
    pub config_path: PathBuf,

    /// Listen port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Listen host.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,
}
