//! HTTP Gate (C3): the `Limiter` from the reference implementation.
//! Decides allow/deny for an incoming HTTP request from its path,
//! method, and query string.

use std::sync::LazyLock;

use regex::Regex;
use url::form_urlencoded;

use crate::allowlist::Allowlist;

/// Result of a whitelist check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
    pub reason: String,
}

impl CheckResult {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

static STATE_PATH: LazyLock<Regex> = LazyLock::new(|| must_compile(r"^/api/states/([a-z_]+\.[a-z0-9_]+)$"));
static CAMERA_PATH: LazyLock<Regex> =
    LazyLock::new(|| must_compile(r"^/api/camera_proxy/([a-z_]+\.[a-z0-9_]+)$"));

fn must_compile(pattern: &str) -> Regex {
    #[allow(clippy::expect_used)]
    Regex::new(pattern).expect("http_gate pattern must compile")
}

fn entity_from_path(path: &str) -> Option<String> {
    STATE_PATH
        .captures(path)
        .or_else(|| CAMERA_PATH.captures(path))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn entities_from_query(path: &str, query: &str) -> Vec<String> {
    let mut entities = Vec::new();
    if path.starts_with("/api/history/period/") {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if key == "filter_entity_id" {
                entities.extend(value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string));
            }
        }
    } else if path.starts_with("/api/logbook/") {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if key == "entity" {
                entities.push(value.into_owned());
            }
        }
    }
    entities
}

/// Enforces whitelist restrictions on incoming HTTP requests.
pub struct HttpGate<'a> {
    allowlist: &'a Allowlist,
}

impl<'a> HttpGate<'a> {
    pub fn new(allowlist: &'a Allowlist) -> Self {
        Self { allowlist }
    }

    /// `method` is accepted for diagnostics only; it never gates.
    pub fn check_request(&self, path: &str, _method: &str, query: &str) -> CheckResult {
        if path == "/health" {
            return CheckResult::allow("Health check endpoint");
        }

        if !self.allowlist.is_endpoint_allowed(path) {
            tracing::warn!(path, "blocked endpoint");
            return CheckResult::deny(format!("Endpoint not in whitelist: {path}"));
        }

        if let Some(entity_id) = entity_from_path(path) {
            if !self.allowlist.is_entity_allowed(&entity_id) {
                tracing::warn!(entity_id, "blocked entity");
                return CheckResult::deny(format!("Entity not in whitelist: {entity_id}"));
            }
        }

        for entity_id in entities_from_query(path, query) {
            if !self.allowlist.is_entity_allowed(&entity_id) {
                tracing::warn!(entity_id, "blocked entity in query");
                return CheckResult::deny(format!("Entity not in whitelist: {entity_id}"));
            }
        }

        CheckResult::allow("Allowed by whitelist")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn fixture() -> Allowlist {
        let mut wl = Allowlist::default();
        wl.endpoints = vec![
            "/api/states".to_string(),
            "/api/states/{entity_id}".to_string(),
            "/api/services/{domain}/{service}".to_string(),
            "/api/history/period/*".to_string(),
            "/static/*".to_string(),
        ];
        wl.entities = vec![
            "light.living_room".to_string(),
            "light.kitchen".to_string(),
            "sensor.temperature".to_string(),
            "sensor.weather_*".to_string(),
        ];
        wl.compile_endpoint_patterns();
        wl
    }

    #[test]
    fn health_is_always_allowed() {
        let wl = fixture();
        let gate = HttpGate::new(&wl);
        assert!(gate.check_request("/health", "GET", "").allowed);
    }

    #[test]
    fn unknown_endpoint_is_denied_with_path_in_reason() {
        let wl = fixture();
        let gate = HttpGate::new(&wl);
        let result = gate.check_request("/api/unknown", "GET", "");
        assert!(!result.allowed);
        assert!(result.reason.contains("/api/unknown"));
    }

    #[test]
    fn parameterized_and_wildcard_endpoints_allowed() {
        let wl = fixture();
        let gate = HttpGate::new(&wl);
        assert!(gate.check_request("/api/states/sensor.temperature", "GET", "").allowed);
        assert!(gate.check_request("/api/services/light/turn_on", "POST", "").allowed);
        assert!(gate.check_request("/static/css/style.css", "GET", "").allowed);
        assert!(gate.check_request("/api/history/period/2024-01-01", "GET", "").allowed);
    }

    #[test]
    fn blocked_entity_in_query_denies_with_entity_named() {
        let wl = fixture();
        let gate = HttpGate::new(&wl);
        let result = gate.check_request(
            "/api/history/period/2024-01-01",
            "GET",
            "filter_entity_id=light.living_room,light.bedroom",
        );
        assert!(!result.allowed);
        assert!(result.reason.contains("light.bedroom"));
    }

    #[test]
    fn wildcard_entity_in_query_allowed() {
        let wl = fixture();
        let gate = HttpGate::new(&wl);
        let result = gate.check_request(
            "/api/history/period/2024-01-01",
            "GET",
            "filter_entity_id=sensor.weather_temperature",
        );
        assert!(result.allowed);
    }

    #[test]
    fn logbook_entity_param_is_checked() {
        let mut wl = fixture();
        wl.endpoints.push("/api/logbook/*".to_string());
        wl.compile_endpoint_patterns();
        let gate = HttpGate::new(&wl);
        let result = gate.check_request("/api/logbook/2024-01-01", "GET", "entity=light.bedroom");
        assert!(!result.allowed);
        assert!(result.reason.contains("light.bedroom"));
    }
}
