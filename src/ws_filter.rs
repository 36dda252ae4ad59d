//! WebSocket Filter (C5), the hardest component: a stateful
//! per-connection mediator enforcing policy on both directions of the
//! JSON WebSocket stream. Grounded on
//! `original_source/ha_api_limiter/ws_filter.py`.

use std::collections::HashMap;
use std::collections::HashSet;

use serde_json::Value;
use serde_json::json;

use crate::allowlist::Allowlist;
use crate::policy_tables;

/// Per-connection correlation state. Created on WebSocket accept,
/// mutated by every frame in either direction, discarded when the
/// connection closes. Never shared across connections, so it needs no
/// locking.
#[derive(Default)]
pub struct WsFilter {
    /// Outstanding "list" requests whose response must be filtered,
    /// keyed by message id, recording which kind of list it is.
    pending_requests: HashMap<i64, String>,
    /// Ids of active `subscribe_entities` streams. Never popped: the
    /// subscription is long-lived for the life of the connection.
    entity_subscriptions: HashSet<i64>,
}

impl WsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter a message from client to upstream. Returns `(allowed,
    /// error_frame)`. When `allowed` is false, `error_frame` is the
    /// JSON text to send back to the client in place of forwarding.
    pub fn filter_client_message(&mut self, allowlist: &Allowlist, raw: &str) -> (bool, Option<String>) {
        let Ok(data) = serde_json::from_str::<Value>(raw) else {
            // Malformed messages pass through untouched; the upstream
            // will reject them.
            return (true, None);
        };
        let Some(obj) = data.as_object() else {
            return (true, None);
        };

        let msg_type = obj.get("type").and_then(Value::as_str);
        let msg_id = obj.get("id").and_then(Value::as_i64);

        if let Some(msg_type) = msg_type {
            if is_type_blocked(allowlist, msg_type) {
                tracing::warn!(msg_type, "blocked dangerous message type");
                return (
                    false,
                    Some(error_response(msg_id, &format!("Message type not allowed: {msg_type}"))),
                );
            }
        }

        if msg_type == Some("subscribe_events") {
            match obj.get("event_type").and_then(Value::as_str) {
                None => {
                    tracing::warn!("blocked subscribe_events without event_type");
                    return (
                        false,
                        Some(error_response(msg_id, "subscribe_events requires event_type parameter")),
                    );
                }
                Some(event_type) => {
                    if !is_event_type_allowed(allowlist, event_type) {
                        tracing::warn!(event_type, "blocked subscribe_events for event_type");
                        return (
                            false,
                            Some(error_response(msg_id, &format!("Event type not allowed: {event_type}"))),
                        );
                    }
                }
            }
        }

        if let (Some(msg_type), Some(id)) = (msg_type, msg_id) {
            if policy_tables::ENTITY_LIST_TYPES.contains(&msg_type)
                || policy_tables::DEVICE_LIST_TYPES.contains(&msg_type)
                || policy_tables::AREA_LIST_TYPES.contains(&msg_type)
                || policy_tables::FLOOR_LIST_TYPES.contains(&msg_type)
            {
                tracing::info!(id, msg_type, "tracking request for response filtering");
                self.pending_requests.insert(id, msg_type.to_string());
            }
            if policy_tables::ENTITY_SUBSCRIPTION_TYPES.contains(&msg_type) {
                tracing::info!(id, msg_type, "tracking entity subscription");
                self.entity_subscriptions.insert(id);
            }
        }

        if msg_type != Some("call_service") {
            return (true, None);
        }

        let domain = obj.get("domain").and_then(Value::as_str).unwrap_or("");
        let service = obj.get("service").and_then(Value::as_str).unwrap_or("");

        if is_service_blocked(allowlist, domain, service) {
            tracing::warn!(domain, service, "blocked dangerous service");
            return (
                false,
                Some(error_response(msg_id, &format!("Service not allowed: {domain}.{service}"))),
            );
        }

        let (entities, devices, areas) = extract_ids_from_target(obj);

        if let Some(entity_id) = entities.iter().find(|e| !allowlist.is_entity_allowed(e)) {
            tracing::warn!(domain, service, entity_id, "blocked call_service for entity");
            return (
                false,
                Some(error_response(msg_id, &format!("Entity not in whitelist: {entity_id}"))),
            );
        }
        if let Some(device_id) = devices.iter().find(|d| !allowlist.is_device_allowed(d)) {
            tracing::warn!(domain, service, device_id, "blocked call_service for device");
            return (
                false,
                Some(error_response(msg_id, &format!("Device not in whitelist: {device_id}"))),
            );
        }
        if let Some(area_id) = areas.iter().find(|a| !allowlist.is_area_allowed(a)) {
            tracing::warn!(domain, service, area_id, "blocked call_service for area");
            return (
                false,
                Some(error_response(msg_id, &format!("Area not in whitelist: {area_id}"))),
            );
        }

        if policy_tables::is_entity_controlled_domain(domain)
            && entities.is_empty()
            && devices.is_empty()
            && areas.is_empty()
        {
            tracing::warn!(domain, service, "blocked call_service with no explicit targets");
            return (
                false,
                Some(error_response(msg_id, &format!("Service {domain}.{service} requires explicit targets"))),
            );
        }

        (true, None)
    }

    /// Filter a message from upstream to client. Returns the text to
    /// forward, or `None` to drop it.
    pub fn filter_server_message(&mut self, allowlist: &Allowlist, raw: &str) -> Option<String> {
        let Ok(data) = serde_json::from_str::<Value>(raw) else {
            return Some(raw.to_string());
        };

        if let Value::Array(items) = &data {
            let mut filtered = Vec::with_capacity(items.len());
            let mut modified = false;
            for item in items {
                match self.filter_single_message(allowlist, item) {
                    None => modified = true,
                    Some(result) => {
                        if &result != item {
                            modified = true;
                        }
                        filtered.push(result);
                    }
                }
            }
            if filtered.is_empty() {
                return None;
            }
            if !modified {
                return Some(raw.to_string());
            }
            return Some(Value::Array(filtered).to_string());
        }

        match self.filter_single_message(allowlist, &data) {
            None => None,
            Some(result) => {
                if result == data {
                    Some(raw.to_string())
                } else {
                    Some(result.to_string())
                }
            }
        }
    }

    fn filter_single_message(&mut self, allowlist: &Allowlist, data: &Value) -> Option<Value> {
        let Some(obj) = data.as_object() else {
            return Some(data.clone());
        };

        let msg_type = obj.get("type").and_then(Value::as_str);
        let msg_id = obj.get("id").and_then(Value::as_i64);

        if msg_type == Some("result") {
            if let Some(id) = msg_id {
                if let Some(request_type) = self.pending_requests.remove(&id) {
                    if let Some(Value::Array(result)) = obj.get("result") {
                        let filtered = filter_list_result(allowlist, &request_type, result);
                        let mut out = obj.clone();
                        out.insert("result".to_string(), Value::Array(filtered));
                        return Some(Value::Object(out));
                    }
                    return Some(data.clone());
                }
            }
            return Some(data.clone());
        }

        if msg_type != Some("event") {
            return Some(data.clone());
        }

        let event = obj.get("event").cloned().unwrap_or(Value::Null);

        if let Some(id) = msg_id {
            if self.entity_subscriptions.contains(&id) {
                let has_delta_keys = event
                    .as_object()
                    .map(|e| e.contains_key("a") || e.contains_key("c") || e.contains_key("r"))
                    .unwrap_or(false);
                if has_delta_keys {
                    return match filter_subscribe_entities_event(allowlist, &event) {
                        None => None,
                        Some(filtered_event) => {
                            let mut out = obj.clone();
                            out.insert("event".to_string(), filtered_event);
                            Some(Value::Object(out))
                        }
                    };
                }
                return Some(data.clone());
            }
        }

        let event_type = event.get("event_type").and_then(Value::as_str);
        if event_type != Some("state_changed") {
            return Some(data.clone());
        }

        let entity_id = event.get("data").and_then(|d| d.get("entity_id")).and_then(Value::as_str);
        match entity_id {
            None => Some(data.clone()),
            Some(entity_id) => {
                if allowlist.is_entity_allowed(entity_id) {
                    Some(data.clone())
                } else {
                    tracing::debug!(entity_id, "filtered state_changed event");
                    None
                }
            }
        }
    }
}

fn error_response(msg_id: Option<i64>, message: &str) -> String {
    json!({
        "id": msg_id,
        "type": "result",
        "success": false,
        "error": {"code": "not_allowed", "message": message},
    })
    .to_string()
}

fn is_type_blocked(allowlist: &Allowlist, msg_type: &str) -> bool {
    if allowlist.allowed_ws_types.iter().any(|t| t == msg_type) {
        return false;
    }
    if policy_tables::BUILTIN_ALLOWED.contains(&msg_type) {
        return false;
    }
    if policy_tables::BUILTIN_BLOCKED_TYPES.contains(&msg_type) {
        return true;
    }
    policy_tables::matches_blocked_pattern(msg_type)
}

fn is_event_type_allowed(allowlist: &Allowlist, event_type: &str) -> bool {
    policy_tables::BUILTIN_ALLOWED_EVENTS.contains(&event_type)
        || allowlist.allowed_event_types.iter().any(|e| e == event_type)
}

fn is_service_blocked(allowlist: &Allowlist, domain: &str, service: &str) -> bool {
    let exact = format!("{domain}.{service}");
    if allowlist.allowed_services.iter().any(|s| s == &exact) {
        return false;
    }
    let wildcard = format!("{domain}.*");
    if allowlist.allowed_services.iter().any(|s| s == &wildcard) {
        return false;
    }
    policy_tables::is_builtin_blocked_service(domain, service)
}

/// Pull `entity_id`/`device_id`/`area_id` out of both `service_data`
/// and `target`, each of which may hold a string or a list of strings.
fn extract_ids_from_target(obj: &serde_json::Map<String, Value>) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut entities = Vec::new();
    let mut devices = Vec::new();
    let mut areas = Vec::new();

    for field in ["service_data", "target"] {
        let Some(container) = obj.get(field).and_then(Value::as_object) else {
            continue;
        };
        collect_strings(container.get("entity_id"), &mut entities);
        collect_strings(container.get("device_id"), &mut devices);
        collect_strings(container.get("area_id"), &mut areas);
    }

    (entities, devices, areas)
}

fn collect_strings(value: Option<&Value>, into: &mut Vec<String>) {
    match value {
        Some(Value::String(s)) => into.push(s.clone()),
        Some(Value::Array(items)) => {
            for item in items {
                if let Value::String(s) = item {
                    into.push(s.clone());
                }
            }
        }
        _ => {}
    }
}

fn filter_list_result(allowlist: &Allowlist, request_type: &str, result: &[Value]) -> Vec<Value> {
    if policy_tables::DEVICE_LIST_TYPES.contains(&request_type) {
        filter_items_by_key(result, "id", |id| allowlist.is_device_allowed(id))
    } else if policy_tables::AREA_LIST_TYPES.contains(&request_type) {
        filter_items_by_key(result, "area_id", |id| allowlist.is_area_allowed(id))
    } else if policy_tables::FLOOR_LIST_TYPES.contains(&request_type) {
        if allowlist.areas.is_empty() { Vec::new() } else { result.to_vec() }
    } else {
        filter_items_by_key(result, "entity_id", |id| allowlist.is_entity_allowed(id))
    }
}

fn filter_items_by_key(items: &[Value], key: &str, allowed: impl Fn(&str) -> bool) -> Vec<Value> {
    items
        .iter()
        .filter(|item| {
            item.as_object()
                .and_then(|o| o.get(key))
                .and_then(Value::as_str)
                .map(|id| !id.is_empty() && allowed(id))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Delta event shape: `a` (additions, entity_id -> state), `c`
/// (changes), `r` (removals, list of entity_id). Drops empty
/// sub-containers; drops the whole event if everything ends up empty.
fn filter_subscribe_entities_event(allowlist: &Allowlist, event: &Value) -> Option<Value> {
    let mut out = serde_json::Map::new();

    if let Some(Value::Object(additions)) = event.get("a") {
        let filtered: serde_json::Map<String, Value> = additions
            .iter()
            .filter(|(eid, _)| allowlist.is_entity_allowed(eid))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !filtered.is_empty() {
            out.insert("a".to_string(), Value::Object(filtered));
        }
    }

    if let Some(Value::Object(changes)) = event.get("c") {
        let filtered: serde_json::Map<String, Value> = changes
            .iter()
            .filter(|(eid, _)| allowlist.is_entity_allowed(eid))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !filtered.is_empty() {
            out.insert("c".to_string(), Value::Object(filtered));
        }
    }

    if let Some(Value::Array(removals)) = event.get("r") {
        let filtered: Vec<Value> = removals
            .iter()
            .filter(|v| v.as_str().map(|eid| allowlist.is_entity_allowed(eid)).unwrap_or(false))
            .cloned()
            .collect();
        if !filtered.is_empty() {
            out.insert("r".to_string(), Value::Array(filtered));
        }
    }

    if out.is_empty() { None } else { Some(Value::Object(out)) }
}
