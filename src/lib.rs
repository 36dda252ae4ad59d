#![deny(clippy::print_stdout, clippy::print_stderr)]

mod allowlist;
mod cli;
mod error;
mod http_gate;
mod learner;
mod normalizer;
mod policy_tables;
mod proxy;
mod state;
mod ws_filter;

pub use allowlist::Allowlist;
pub use cli::Cli;
pub use cli::Mode;
pub use error::AllowlistError;
pub use error::ProxyError;
pub use http_gate::CheckResult;
pub use http_gate::HttpGate;
pub use learner::Learner;
pub use normalizer::normalize_endpoint;
pub use proxy::AppState;
pub use proxy::build_router;
pub use proxy::run;
pub use state::SharedAllowlist;
pub use ws_filter::WsFilter;
