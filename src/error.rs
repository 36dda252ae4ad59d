//! Crate-wide error taxonomy.
//!
//! `PolicyDeny` and `MalformedInput` from the design are not represented
//! here as `Error` types: a policy denial is a normal return value
//! (`CheckResult`, or a WS error frame), and malformed input is handled
//! inline wherever a JSON parse can fail. Only failures that actually
//! need to propagate as `Result::Err` get a variant.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum AllowlistError {
    #[error("failed to read whitelist config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse whitelist config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to write whitelist config at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize whitelist config: {0}")]
    Serialize(#[source] serde_yaml::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),
    #[error("upstream websocket handshake failed: {0}")]
    WsHandshake(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("invalid upstream url: {0}")]
    InvalidUrl(#[source] url::ParseError),
}
