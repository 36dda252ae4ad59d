//! Built-in WebSocket policy tables, reproduced verbatim from the
//! reference implementation's `BLOCKED_MESSAGE_TYPES`,
//! `BLOCKED_MESSAGE_PATTERNS`, `ALLOWED_MESSAGE_TYPES`,
//! `ALLOWED_EVENT_TYPES`, `BLOCKED_SERVICES`, and
//! `ENTITY_CONTROLLED_DOMAINS`. Do not add or remove entries without a
//! change to the policy itself.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Message types that return entity lists that need filtering.
pub const ENTITY_LIST_TYPES: &[&str] = &[
    "get_states",
    "config/entity_registry/list",
    "config/entity_registry/list_for_display",
];

/// Message types that return device lists that need filtering.
pub const DEVICE_LIST_TYPES: &[&str] = &["config/device_registry/list"];

/// Message types that return area lists that need filtering.
pub const AREA_LIST_TYPES: &[&str] = &["config/area_registry/list"];

/// Message types that return floor lists that need filtering.
pub const FLOOR_LIST_TYPES: &[&str] = &["config/floor_registry/list"];

/// Subscription types that send entity data in events.
pub const ENTITY_SUBSCRIPTION_TYPES: &[&str] = &["subscribe_entities"];

/// Message types that are completely blocked regardless of override.
pub const BUILTIN_BLOCKED_TYPES: &[&str] = &[
    "render_template",
    "fire_event",
    "execute_script",
    "subscribe_trigger",
    "intent/handle",
];

/// Message types explicitly allowed, overriding the blocked patterns.
pub const BUILTIN_ALLOWED: &[&str] = &["auth/current_user", "lovelace/config", "lovelace/resources"];

/// Event types allowed for `subscribe_events` without an override.
pub const BUILTIN_ALLOWED_EVENTS: &[&str] = &[
    "state_changed",
    "component_loaded",
    "service_registered",
    "service_removed",
    "themes_updated",
    "panels_updated",
    "lovelace_updated",
    "core_config_updated",
    "entity_registry_updated",
    "device_registry_updated",
    "area_registry_updated",
    "floor_registry_updated",
    "label_registry_updated",
    "repairs_issue_registry_updated",
];

/// Domains whose services require at least one explicit entity, device,
/// or area target, to prevent an implicit domain-wide fan-out.
pub const ENTITY_CONTROLLED_DOMAINS: &[&str] = &[
    "light",
    "switch",
    "cover",
    "fan",
    "climate",
    "media_player",
    "vacuum",
    "lock",
    "alarm_control_panel",
    "camera",
    "humidifier",
    "water_heater",
    "remote",
    "button",
    "number",
    "select",
    "siren",
    "text",
    "valve",
    "lawn_mower",
    "update",
];

/// `(domain, service)` pairs that are always blocked; `"*"` as the
/// service matches any service in that domain.
pub const BUILTIN_BLOCKED_SERVICES: &[(&str, &str)] = &[
    ("homeassistant", "restart"),
    ("homeassistant", "stop"),
    ("homeassistant", "reload_all"),
    ("homeassistant", "reload_core_config"),
    ("homeassistant", "reload_config_entry"),
    ("homeassistant", "set_location"),
    ("automation", "trigger"),
    ("automation", "reload"),
    ("automation", "turn_on"),
    ("automation", "turn_off"),
    ("automation", "toggle"),
    ("script", "reload"),
    ("script", "turn_on"),
    ("script", "turn_off"),
    ("script", "toggle"),
    ("scene", "reload"),
    ("scene", "apply"),
    ("scene", "create"),
    ("input_boolean", "reload"),
    ("input_number", "reload"),
    ("input_select", "reload"),
    ("input_text", "reload"),
    ("input_datetime", "reload"),
    ("input_button", "reload"),
    ("shell_command", "*"),
    ("python_script", "*"),
    ("pyscript", "*"),
    ("rest_command", "*"),
    ("notify", "*"),
    ("persistent_notification", "create"),
    ("system_log", "clear"),
    ("recorder", "purge"),
    ("recorder", "purge_entities"),
    ("recorder", "disable"),
    ("recorder", "enable"),
    ("logger", "set_level"),
    ("logger", "set_default_level"),
];
// Note: system_log.write is intentionally not blocked; the frontend
// uses it for client-side error reporting.

/// Prefix-matched blocked message-type patterns, except `auth/sign_path`
/// which is an exact match. The asymmetry is intentional, see
/// `ws_filter.rs`.
static BUILTIN_BLOCKED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^config/automation/",
        r"^config/script/",
        r"^config/scene/",
        r"^config_entries/",
        r"^hassio/",
        r"^backup/",
        r"^auth/sign_path$",
        r"^auth/refresh_token",
        r"^auth/delete_refresh_token",
    ]
    .iter()
    .map(|p| {
        #[allow(clippy::expect_used)]
        Regex::new(p).expect("builtin pattern must compile")
    })
    .collect()
});

pub fn matches_blocked_pattern(message_type: &str) -> bool {
    BUILTIN_BLOCKED_PATTERNS.iter().any(|re| re.is_match(message_type))
}

static ENTITY_CONTROLLED_DOMAINS_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| ENTITY_CONTROLLED_DOMAINS.iter().copied().collect());

pub fn is_entity_controlled_domain(domain: &str) -> bool {
    ENTITY_CONTROLLED_DOMAINS_SET.contains(domain)
}

pub fn is_builtin_blocked_service(domain: &str, service: &str) -> bool {
    BUILTIN_BLOCKED_SERVICES
        .iter()
        .any(|&(d, s)| d == domain && (s == service || s == "*"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_path_is_exact_not_prefix() {
        assert!(matches_blocked_pattern("auth/sign_path"));
        assert!(!matches_blocked_pattern("auth/sign_path/extra"));
    }

    #[test]
    fn refresh_token_is_prefix() {
        assert!(matches_blocked_pattern("auth/refresh_token"));
        assert!(matches_blocked_pattern("auth/refresh_token/revoke"));
    }

    #[test]
    fn wildcard_service_blocks_any_service_in_domain() {
        assert!(is_builtin_blocked_service("notify", "mobile_app"));
        assert!(is_builtin_blocked_service("shell_command", "anything"));
        assert!(!is_builtin_blocked_service("light", "turn_on"));
    }

    #[test]
    fn system_log_write_is_not_blocked() {
        assert!(!is_builtin_blocked_service("system_log", "write"));
        assert!(is_builtin_blocked_service("system_log", "clear"));
    }
}
