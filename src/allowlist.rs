//! The allowlist/taxonomy model (C1): endpoint path templates, entity,
//! device, and area identifiers, plus the three WebSocket policy
//! override lists. Grounded on `original_source/ha_api_limiter/config.py`'s
//! `WhitelistConfig`.

use std::path::Path;
use std::path::PathBuf;

use globset::Glob;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_yaml::Value;

use crate::error::AllowlistError;

/// The four learner-managed collections plus the three WebSocket
/// policy override lists, as they appear on disk.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct AllowlistDocument {
    #[serde(default)]
    endpoints: Vec<String>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    devices: Vec<String>,
    #[serde(default)]
    areas: Vec<String>,
    #[serde(default)]
    allowed_ws_types: Vec<String>,
    #[serde(default)]
    allowed_event_types: Vec<String>,
    #[serde(default)]
    allowed_services: Vec<String>,
}

/// Collections persisted automatically by the learner; override lists
/// are user-curated only and are never touched by `save`.
const LEARNED_KEYS: [&str; 4] = ["endpoints", "entities", "devices", "areas"];

#[derive(Debug, Default)]
pub struct Allowlist {
    config_path: Option<PathBuf>,
    pub endpoints: Vec<String>,
    pub entities: Vec<String>,
    pub devices: Vec<String>,
    pub areas: Vec<String>,
    pub allowed_ws_types: Vec<String>,
    pub allowed_event_types: Vec<String>,
    pub allowed_services: Vec<String>,
    endpoint_patterns: Vec<Regex>,
}

impl Allowlist {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self {
            config_path,
            ..Default::default()
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Load the whitelist from `config_path`, if set and present. A
    /// missing file leaves every collection empty, matching the
    /// reference implementation's silent no-op.
    pub fn load(&mut self) -> Result<(), AllowlistError> {
        let Some(path) = self.config_path.clone() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let text = std::fs::read_to_string(&path).map_err(|source| AllowlistError::Read {
            path: path.clone(),
            source,
        })?;
        let doc: AllowlistDocument =
            serde_yaml::from_str(&text).map_err(|source| AllowlistError::Parse { path, source })?;
        self.endpoints = doc.endpoints;
        self.entities = doc.entities;
        self.devices = doc.devices;
        self.areas = doc.areas;
        self.allowed_ws_types = doc.allowed_ws_types;
        self.allowed_event_types = doc.allowed_event_types;
        self.allowed_services = doc.allowed_services;
        self.compile_endpoint_patterns();
        Ok(())
    }

    /// Persist the four learner-managed collections, merging new,
    /// sorted, deduplicated entries into the existing on-disk document
    /// (or creating one). See `SPEC_FULL.md` §10.3 for why this is a
    /// simplified (non-comment-preserving) merge.
    pub fn save(&self) -> Result<(), AllowlistError> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| AllowlistError::Write {
                path: path.clone(),
                source,
            })?;
        }

        let mut root: Value = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| AllowlistError::Read {
                path: path.clone(),
                source,
            })?;
            serde_yaml::from_str(&text).map_err(|source| AllowlistError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            Value::Mapping(Default::default())
        };
        if !root.is_mapping() {
            root = Value::Mapping(Default::default());
        }
        let Value::Mapping(map) = &mut root else {
            unreachable!("root was just normalized to a mapping")
        };

        for key in LEARNED_KEYS {
            let items: &[String] = match key {
                "endpoints" => &self.endpoints,
                "entities" => &self.entities,
                "devices" => &self.devices,
                "areas" => &self.areas,
                _ => unreachable!(),
            };
            append_items(map, key, items);
        }

        let serialized = serde_yaml::to_string(&root).map_err(AllowlistError::Serialize)?;
        std::fs::write(path, serialized).map_err(|source| AllowlistError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Compile `endpoints` to anchored regexes. Must run after every
    /// mutation of `endpoints`, never during request evaluation.
    pub fn compile_endpoint_patterns(&mut self) {
        self.endpoint_patterns = self.endpoints.iter().map(|e| compile_endpoint_pattern(e)).collect();
    }

    pub fn is_endpoint_allowed(&self, path: &str) -> bool {
        self.endpoint_patterns.iter().any(|re| re.is_match(path))
    }

    pub fn is_entity_allowed(&self, id: &str) -> bool {
        glob_any(&self.entities, id)
    }

    pub fn is_device_allowed(&self, id: &str) -> bool {
        glob_any(&self.devices, id)
    }

    pub fn is_area_allowed(&self, id: &str) -> bool {
        glob_any(&self.areas, id)
    }

    /// Append `template` if it is neither literally present nor
    /// already subsumed by an existing pattern. Returns whether it was
    /// added.
    pub fn add_endpoint(&mut self, template: &str) -> bool {
        if self.endpoints.iter().any(|e| e == template) || self.is_endpoint_allowed(template) {
            return false;
        }
        self.endpoints.push(template.to_string());
        self.compile_endpoint_patterns();
        true
    }

    pub fn add_entity(&mut self, id: &str) -> bool {
        if self.entities.iter().any(|e| e == id) || self.is_entity_allowed(id) {
            return false;
        }
        self.entities.push(id.to_string());
        true
    }

    pub fn add_device(&mut self, id: &str) -> bool {
        if self.devices.iter().any(|d| d == id) || self.is_device_allowed(id) {
            return false;
        }
        self.devices.push(id.to_string());
        true
    }

    pub fn add_area(&mut self, id: &str) -> bool {
        if self.areas.iter().any(|a| a == id) || self.is_area_allowed(id) {
            return false;
        }
        self.areas.push(id.to_string());
        true
    }
}

fn glob_any(patterns: &[String], candidate: &str) -> bool {
    patterns.iter().any(|pattern| {
        Glob::new(pattern)
            .map(|g| g.compile_matcher().is_match(candidate))
            .unwrap_or(false)
    })
}

/// Translate `{name}` placeholders to `[^/]+` and `*` to `.*`, escaping
/// every other character, then anchor at both ends.
///
/// Order matters: placeholders are replaced with a reserved marker
/// *before* escaping (so the braces are never themselves escaped), the
/// result is escaped, the marker is substituted back to `[^/]+`, and
/// only then is the now-escaped `\*` turned into `.*`.
fn compile_endpoint_pattern(template: &str) -> Regex {
    const MARKER: &str = "__PARAM__";
    let placeholder = Regex::new(r"\{[^}]+\}").unwrap_or_else(|_| unreachable_regex());
    let marked = placeholder.replace_all(template, MARKER);
    let escaped = regex::escape(&marked);
    let with_param = escaped.replace(MARKER, "[^/]+");
    let with_wildcard = with_param.replace(r"\*", ".*");
    let anchored = format!("^{with_wildcard}$");
    Regex::new(&anchored).unwrap_or_else(|_| unreachable_regex())
}

fn unreachable_regex() -> Regex {
    #[allow(clippy::expect_used)]
    Regex::new("$^").expect("static fallback pattern must compile")
}

fn append_items(map: &mut serde_yaml::Mapping, key: &str, items: &[String]) {
    let key_value = Value::String(key.to_string());
    let existing: Vec<String> = map
        .get(&key_value)
        .and_then(Value::as_sequence)
        .map(|seq| seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let mut new_items: Vec<&String> = items.iter().filter(|item| !existing.contains(item)).collect();
    if new_items.is_empty() {
        if !map.contains_key(&key_value) {
            map.insert(key_value, Value::Sequence(vec![]));
        }
        return;
    }
    new_items.sort();

    let mut merged = existing;
    merged.extend(new_items.into_iter().cloned());
    let sequence = merged.into_iter().map(Value::String).collect();
    map.insert(key_value, Value::Sequence(sequence));
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn compiles_param_and_wildcard_templates() {
        let re = compile_endpoint_pattern("/api/states/{entity_id}");
        assert!(re.is_match("/api/states/light.kitchen"));
        assert!(!re.is_match("/api/states/light.kitchen/extra"));

        let re = compile_endpoint_pattern("/static/*");
        assert!(re.is_match("/static/css/style.css"));
    }

    #[test]
    fn braces_are_not_escaped_before_substitution() {
        // A template with literal dots next to the placeholder must not
        // have its `{}` survive as literal characters in the pattern.
        let re = compile_endpoint_pattern("/api/services/{domain}/{service}");
        assert!(re.is_match("/api/services/light/turn_on"));
    }

    #[test]
    fn add_endpoint_is_idempotent() {
        let mut wl = Allowlist::default();
        assert!(wl.add_endpoint("/api/states"));
        assert!(!wl.add_endpoint("/api/states"));
        assert_eq!(wl.endpoints, vec!["/api/states".to_string()]);
    }

    #[test]
    fn add_endpoint_covered_by_existing_pattern_is_noop() {
        let mut wl = Allowlist::default();
        wl.endpoints = vec!["/api/*".to_string()];
        wl.compile_endpoint_patterns();
        assert!(!wl.add_endpoint("/api/states"));
    }

    #[test]
    fn add_entity_covered_by_wildcard_is_noop() {
        let mut wl = Allowlist::default();
        wl.entities = vec!["light.*".to_string()];
        assert!(!wl.add_entity("light.bedroom"));
    }

    #[test]
    fn entity_matching_is_case_sensitive() {
        let mut wl = Allowlist::default();
        wl.entities = vec!["Light.Kitchen".to_string()];
        assert!(!wl.is_entity_allowed("light.kitchen"));
        assert!(wl.is_entity_allowed("Light.Kitchen"));
    }

    #[test]
    fn is_endpoint_allowed_matches_parameterized_template() {
        let mut wl = Allowlist::default();
        wl.endpoints = vec![
            "/api/states".to_string(),
            "/api/services/{domain}/{service}".to_string(),
        ];
        wl.compile_endpoint_patterns();
        assert!(wl.is_endpoint_allowed("/api/states"));
        assert!(wl.is_endpoint_allowed("/api/services/light/turn_on"));
        assert!(!wl.is_endpoint_allowed("/api/config"));
    }

    #[test]
    fn save_then_load_round_trips_and_merges() {
        let dir = tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "endpoints:\n  - /api/states\nentities: []\ndevices: []\nareas: []\n",
        )
        .unwrap_or_else(|e| panic!("write: {e}"));

        let mut wl = Allowlist::new(Some(path.clone()));
        wl.load().unwrap_or_else(|e| panic!("load: {e}"));
        wl.add_endpoint("/api/config");
        wl.save().unwrap_or_else(|e| panic!("save: {e}"));

        let mut reloaded = Allowlist::new(Some(path));
        reloaded.load().unwrap_or_else(|e| panic!("reload: {e}"));
        assert!(reloaded.endpoints.contains(&"/api/states".to_string()));
        assert!(reloaded.endpoints.contains(&"/api/config".to_string()));
    }

    #[test]
    fn save_never_touches_override_lists() {
        let dir = tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let path = dir.path().join("config.yaml");
        let mut wl = Allowlist::new(Some(path.clone()));
        wl.allowed_ws_types = vec!["render_template".to_string()];
        wl.save().unwrap_or_else(|e| panic!("save: {e}"));

        let text = std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read: {e}"));
        assert!(!text.contains("render_template"));
    }
}
