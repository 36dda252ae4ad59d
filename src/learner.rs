//! Learner (C4): in learn mode, ingests request paths, response
//! bodies, and WebSocket frames, extracts identifiers, and extends the
//! allowlist. Persistence is paced by a request counter.

use std::collections::HashSet;

use serde_json::Value;

use crate::allowlist::Allowlist;
use crate::normalizer;

const DEFAULT_SAVE_INTERVAL: u32 = 10;

pub struct Learner {
    allowlist: Allowlist,
    request_count: u32,
    save_interval: u32,
}

/// Identifiers discovered while walking a JSON document.
#[derive(Default)]
struct Discovered {
    entities: HashSet<String>,
    devices: HashSet<String>,
    areas: HashSet<String>,
}

impl Learner {
    pub fn new(allowlist: Allowlist) -> Self {
        Self {
            allowlist,
            request_count: 0,
            save_interval: DEFAULT_SAVE_INTERVAL,
        }
    }

    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    pub fn into_allowlist(self) -> Allowlist {
        self.allowlist
    }

    /// Learn from an incoming request path. `query` is accepted only
    /// for debug-level logging of the full request line, matching the
    /// reference implementation, which never derives identifiers from
    /// the query string on the request side (only the response side
    /// and, separately, the HTTP gate's own query inspection do that).
    pub fn learn_from_request(&mut self, path: &str, query: Option<&str>) {
        if let Some(query) = query {
            tracing::debug!(path, query, "request");
        }

        let normalized = normalizer::normalize_endpoint(path);
        if self.allowlist.add_endpoint(&normalized) {
            tracing::info!(endpoint = %normalized, "learned new endpoint");
        }

        if let Some(entity_id) = normalizer::extract_entity_from_path(path) {
            if self.allowlist.add_entity(&entity_id) {
                tracing::info!(entity_id, "learned new entity from path");
            }
        }
    }

    /// Learn entity/device/area IDs from a JSON response body, given
    /// its `content-type` header value. Non-JSON bodies and invalid
    /// JSON are silently ignored, matching the reference implementation.
    pub fn learn_from_response(&mut self, content_type: &str, body: &[u8]) {
        if !content_type.contains("application/json") {
            return;
        }
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return;
        };
        self.learn_from_value(&value, "response");
    }

    /// Learn entity/device/area IDs from a raw WebSocket frame.
    pub fn learn_from_websocket_message(&mut self, message: &str) {
        let Ok(value) = serde_json::from_str::<Value>(message) else {
            return;
        };
        self.learn_from_value(&value, "WebSocket");
    }

    fn learn_from_value(&mut self, value: &Value, source: &str) {
        let discovered = extract_ids(value);
        for entity_id in discovered.entities {
            if self.allowlist.add_entity(&entity_id) {
                tracing::info!(entity_id, source, "learned new entity");
            }
        }
        for device_id in discovered.devices {
            if self.allowlist.add_device(&device_id) {
                tracing::info!(device_id, source, "learned new device");
            }
        }
        for area_id in discovered.areas {
            if self.allowlist.add_area(&area_id) {
                tracing::info!(area_id, source, "learned new area");
            }
        }
    }

    /// Increment the request counter; save and reset once it reaches
    /// the configured interval.
    pub fn maybe_save(&mut self) -> Result<(), crate::error::AllowlistError> {
        self.request_count += 1;
        if self.request_count >= self.save_interval {
            self.save()?;
            self.request_count = 0;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<(), crate::error::AllowlistError> {
        tracing::info!(
            endpoints = self.allowlist.endpoints.len(),
            entities = self.allowlist.entities.len(),
            devices = self.allowlist.devices.len(),
            areas = self.allowlist.areas.len(),
            "saving whitelist"
        );
        self.allowlist.save()
    }
}

/// Iterative worklist walk (not recursion) so a hostile, deeply nested
/// document cannot blow the stack. Visits every node once.
fn extract_ids(root: &Value) -> Discovered {
    let mut out = Discovered::default();
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        match node {
            Value::Object(map) => {
                if let Some(v) = map.get("entity_id") {
                    collect_dotted_strings(v, &mut out.entities);
                }
                if let Some(v) = map.get("device_id") {
                    collect_nonempty_strings(v, &mut out.devices);
                }
                if let Some(v) = map.get("area_id") {
                    collect_nonempty_strings(v, &mut out.areas);
                }
                stack.extend(map.values());
            }
            Value::Array(items) => stack.extend(items.iter()),
            _ => {}
        }
    }

    out
}

fn collect_dotted_strings(value: &Value, into: &mut HashSet<String>) {
    match value {
        Value::String(s) if s.contains('.') => {
            into.insert(s.clone());
        }
        Value::Array(items) => {
            for item in items {
                if let Value::String(s) = item {
                    if s.contains('.') {
                        into.insert(s.clone());
                    }
                }
            }
        }
        _ => {}
    }
}

fn collect_nonempty_strings(value: &Value, into: &mut HashSet<String>) {
    match value {
        Value::String(s) if !s.is_empty() => {
            into.insert(s.clone());
        }
        Value::Array(items) => {
            for item in items {
                if let Value::String(s) = item {
                    if !s.is_empty() {
                        into.insert(s.clone());
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn learner() -> Learner {
        Learner::new(Allowlist::default())
    }

    #[test]
    fn learns_new_endpoint_from_request() {
        let mut l = learner();
        l.learn_from_request("/api/config", None);
        assert!(l.allowlist().endpoints.contains(&"/api/config".to_string()));
    }

    #[test]
    fn learns_entity_from_states_path() {
        let mut l = learner();
        l.learn_from_request("/api/states/sensor.temperature", None);
        assert!(l.allowlist().entities.contains(&"sensor.temperature".to_string()));
    }

    #[test]
    fn repeated_concrete_paths_normalize_to_one_endpoint() {
        let mut l = learner();
        l.learn_from_request("/api/states/sensor.test1", None);
        l.learn_from_request("/api/states/sensor.test2", None);
        let count = l
            .allowlist()
            .endpoints
            .iter()
            .filter(|e| e.as_str() == "/api/states/{entity_id}")
            .count();
        assert_eq!(count, 1);
        assert!(l.allowlist().entities.contains(&"sensor.test1".to_string()));
        assert!(l.allowlist().entities.contains(&"sensor.test2".to_string()));
    }

    #[test]
    fn extracts_entity_device_area_from_nested_json() {
        let value: Value = serde_json::json!({
            "result": {
                "entity_id": "sensor.test",
                "device_id": "device123",
                "area_id": "kitchen",
            }
        });
        let discovered = extract_ids(&value);
        assert!(discovered.entities.contains("sensor.test"));
        assert!(discovered.devices.contains("device123"));
        assert!(discovered.areas.contains("kitchen"));
    }

    #[test]
    fn skips_entity_id_without_domain_separator() {
        let value: Value = serde_json::json!({"entity_id": "invalid_no_domain"});
        let discovered = extract_ids(&value);
        assert!(discovered.entities.is_empty());
    }

    #[test]
    fn extracts_from_list_of_objects() {
        let value: Value = serde_json::json!([{"entity_id": "light.one"}, {"entity_id": "light.two"}]);
        let discovered = extract_ids(&value);
        assert!(discovered.entities.contains("light.one"));
        assert!(discovered.entities.contains("light.two"));
    }

    #[test]
    fn learn_from_response_ignores_non_json_content_type() {
        let mut l = learner();
        l.learn_from_response("text/html", b"{\"entity_id\": \"light.x\"}");
        assert!(l.allowlist().entities.is_empty());
    }

    #[test]
    fn learn_from_response_ignores_invalid_json() {
        let mut l = learner();
        l.learn_from_response("application/json", b"not json");
        assert!(l.allowlist().entities.is_empty());
    }

    #[test]
    fn learn_from_websocket_message_extracts_event_payload() {
        let mut l = learner();
        let message = serde_json::json!({
            "type": "event",
            "event": {"entity_id": "sensor.ws_entity", "device_id": "ws_device", "area_id": "ws_area"}
        })
        .to_string();
        l.learn_from_websocket_message(&message);
        assert!(l.allowlist().entities.contains(&"sensor.ws_entity".to_string()));
        assert!(l.allowlist().devices.contains(&"ws_device".to_string()));
        assert!(l.allowlist().areas.contains(&"ws_area".to_string()));
    }

    #[test]
    fn maybe_save_triggers_at_interval() {
        let mut l = learner();
        l.save_interval = 3;
        l.maybe_save().unwrap_or_else(|e| panic!("save: {e}"));
        assert_eq!(l.request_count, 1);
        l.maybe_save().unwrap_or_else(|e| panic!("save: {e}"));
        assert_eq!(l.request_count, 2);
        l.maybe_save().unwrap_or_else(|e| panic!("save: {e}"));
        assert_eq!(l.request_count, 0);
    }
}
