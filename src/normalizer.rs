//! Endpoint Normalizer (C2): collapses concrete request paths into
//! parameterized templates so learning converges on a stable set of
//! endpoints rather than growing one entry per concrete ID.

use std::sync::LazyLock;

use regex::Regex;

static STATES_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| must_compile(r"^/api/states/[a-z_]+\.[a-z0-9_]+$"));
static SERVICE_CALL: LazyLock<Regex> =
    LazyLock::new(|| must_compile(r"^/api/services/([a-z_]+)/([a-z_]+)$"));
static CAMERA_PROXY: LazyLock<Regex> =
    LazyLock::new(|| must_compile(r"^/api/camera_proxy/[a-z_]+\.[a-z0-9_]+$"));
static HISTORY_PERIOD: LazyLock<Regex> =
    LazyLock::new(|| must_compile(r"^/api/history/period/\d{4}-\d{2}-\d{2}"));
static LOGBOOK: LazyLock<Regex> = LazyLock::new(|| must_compile(r"^/api/logbook/\d{4}-\d{2}-\d{2}"));

fn must_compile(pattern: &str) -> Regex {
    #[allow(clippy::expect_used)]
    Regex::new(pattern).expect("normalizer pattern must compile")
}

/// First match wins; anything not recognized is returned unchanged.
/// Idempotent: `normalize(normalize(p)) == normalize(p)`, since every
/// template this produces fails every one of the recognizer patterns.
pub fn normalize_endpoint(path: &str) -> String {
    if STATES_ENTITY.is_match(path) {
        return "/api/states/{entity_id}".to_string();
    }
    if SERVICE_CALL.is_match(path) {
        return "/api/services/{domain}/{service}".to_string();
    }
    if CAMERA_PROXY.is_match(path) {
        return "/api/camera_proxy/{entity_id}".to_string();
    }
    if HISTORY_PERIOD.is_match(path) {
        return "/api/history/period/{timestamp}".to_string();
    }
    if LOGBOOK.is_match(path) {
        return "/api/logbook/{timestamp}".to_string();
    }
    path.to_string()
}

/// Extract the entity ID from a `/api/states/{id}` or
/// `/api/camera_proxy/{id}` path, if it matches either shape.
pub fn extract_entity_from_path(path: &str) -> Option<String> {
    #[allow(clippy::expect_used)]
    static STATES_CAPTURE: LazyLock<Regex> =
        LazyLock::new(|| must_compile(r"^/api/states/([a-z_]+\.[a-z0-9_]+)$"));
    #[allow(clippy::expect_used)]
    static CAMERA_CAPTURE: LazyLock<Regex> =
        LazyLock::new(|| must_compile(r"^/api/camera_proxy/([a-z_]+\.[a-z0-9_]+)$"));

    STATES_CAPTURE
        .captures(path)
        .or_else(|| CAMERA_CAPTURE.captures(path))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normalizes_known_shapes() {
        assert_eq!(
            normalize_endpoint("/api/states/sensor.temperature"),
            "/api/states/{entity_id}"
        );
        assert_eq!(
            normalize_endpoint("/api/services/light/turn_on"),
            "/api/services/{domain}/{service}"
        );
        assert_eq!(
            normalize_endpoint("/api/camera_proxy/camera.front_door"),
            "/api/camera_proxy/{entity_id}"
        );
        assert_eq!(
            normalize_endpoint("/api/history/period/2024-01-01T00:00:00"),
            "/api/history/period/{timestamp}"
        );
        assert_eq!(
            normalize_endpoint("/api/logbook/2024-01-01T00:00:00"),
            "/api/logbook/{timestamp}"
        );
    }

    #[test]
    fn unrecognized_path_is_unchanged() {
        assert_eq!(normalize_endpoint("/api/custom/endpoint"), "/api/custom/endpoint");
    }

    #[test]
    fn normalizer_is_idempotent() {
        for path in [
            "/api/states/sensor.temperature",
            "/api/custom/endpoint",
            "/api/history/period/2024-01-01",
        ] {
            let once = normalize_endpoint(path);
            let twice = normalize_endpoint(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn extracts_entity_from_states_and_camera_paths() {
        assert_eq!(
            extract_entity_from_path("/api/states/sensor.temperature"),
            Some("sensor.temperature".to_string())
        );
        assert_eq!(
            extract_entity_from_path("/api/camera_proxy/camera.front_door"),
            Some("camera.front_door".to_string())
        );
        assert_eq!(extract_entity_from_path("/api/config"), None);
    }
}
