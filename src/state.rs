//! Process-wide shared state. In learn mode the allowlist is mutated
//! from every worker task behind a single lock; in limit mode it is an
//! immutable `Arc` snapshot that never takes a lock on the read path.
//! Grounded on the teacher's `runtime.rs` `NetworkProxyState`, which
//! holds its policy state behind a similar single-writer lock.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::allowlist::Allowlist;
use crate::cli::Mode;
use crate::learner::Learner;

/// Shared handle to the allowlist, shaped differently per mode so each
/// mode pays only for the synchronization it needs.
pub enum SharedAllowlist {
    /// Read-only after startup; cloning the `Arc` is the only
    /// synchronization limit mode ever does.
    Limit(Arc<Allowlist>),
    /// Mutated by the learner on every request/frame; serialized
    /// through one lock, matching spec §5's single-lock requirement.
    Learn(Arc<Mutex<Learner>>),
}

impl SharedAllowlist {
    pub fn new(mode: Mode, allowlist: Allowlist) -> Self {
        match mode {
            Mode::Limit => Self::Limit(Arc::new(allowlist)),
            Mode::Learn => Self::Learn(Arc::new(Mutex::new(Learner::new(allowlist)))),
        }
    }

    /// Run `f` with read-only access to the current allowlist.
    pub fn with_read<R>(&self, f: impl FnOnce(&Allowlist) -> R) -> R {
        match self {
            Self::Limit(allowlist) => f(allowlist),
            Self::Learn(learner) => f(learner.lock().allowlist()),
        }
    }

    /// In learn mode, record an HTTP request and persist on the
    /// configured interval. No-op in limit mode.
    pub fn learn_from_request(&self, path: &str, query: Option<&str>) {
        if let Self::Learn(learner) = self {
            let mut learner = learner.lock();
            learner.learn_from_request(path, query);
            if let Err(err) = learner.maybe_save() {
                tracing::error!(%err, "failed to persist whitelist");
            }
        }
    }

    /// In learn mode, record a response body. No-op in limit mode.
    pub fn learn_from_response(&self, content_type: &str, body: &[u8]) {
        if let Self::Learn(learner) = self {
            learner.lock().learn_from_response(content_type, body);
        }
    }

    /// In learn mode, record a WebSocket frame. No-op in limit mode.
    pub fn learn_from_websocket_message(&self, message: &str) {
        if let Self::Learn(learner) = self {
            learner.lock().learn_from_websocket_message(message);
        }
    }

    /// Unconditional save on shutdown, per spec §4.4. No-op in limit
    /// mode, which never mutates the allowlist.
    pub fn save_on_shutdown(&self) {
        if let Self::Learn(learner) = self {
            if let Err(err) = learner.lock().save() {
                tracing::error!(%err, "failed to persist whitelist on shutdown");
            }
        }
    }
}
