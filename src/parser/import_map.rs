//! Import-map declaration parsing.

use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Debug, Default, Deserialize)]
struct ImportMap {
    #[serde(default)]
    imports: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    scopes: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

/// Extract every mapped target from an import-map body.
///
/// Malformed JSON yields an empty list. Non-string targets are skipped.
pub fn import_map_targets(body: &str) -> Vec<String> {
    let map: ImportMap = match serde_json::from_str(body) {
        Ok(map) => map,
        Err(e) => {
            trace!("Skipping malformed import map: {}", e);
            return Vec::new();
        }
    };

    let mut targets = Vec::new();
    let scoped = map.scopes.values().flat_map(|entries| entries.values());
    for value in map.imports.values().chain(scoped) {
        if let Some(target) = value.as_str() {
            if !targets.iter().any(|t| t == target) {
                targets.push(target.to_string());
            }
        }
    }
    targets
}
