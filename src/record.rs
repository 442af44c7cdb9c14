//! Knowledge record data model.
//!
//! A [`Record`] is the authoritative, versioned knowledge document for one
//! entity key. Its serde shape matches the persisted snapshot layout exactly
//! (camelCase field names on disk). The `data` section map preserves
//! insertion order via serde_json's `preserve_order` feature.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What kind of update produced a new record version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    /// Complete re-synthesis of the document through the pipeline.
    Full,
    Incremental,
    Manual,
    Scheduled,
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateType::Full => "full",
            UpdateType::Incremental => "incremental",
            UpdateType::Manual => "manual",
            UpdateType::Scheduled => "scheduled",
        };
        f.write_str(s)
    }
}

/// One entry in a record's append-only update history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEvent {
    /// ISO-8601 timestamp of the update.
    pub timestamp: String,
    #[serde(rename = "updateType")]
    pub update_type: UpdateType,
    /// Human-readable summaries of what changed, one per touched section.
    #[serde(default)]
    pub changes: Vec<String>,
}

/// Provenance of the synthesized content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Model identifier that generated the document.
    #[serde(default)]
    pub source: String,
    /// Approximate token counts (length / 4 estimate).
    #[serde(rename = "inputTokens", default)]
    pub input_tokens: u64,
    #[serde(rename = "outputTokens", default)]
    pub output_tokens: u64,
    #[serde(rename = "modelParameters", default)]
    pub model_parameters: Value,
}

/// The authoritative knowledge document for one entity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    /// Semantic version string, bumped only on a successfully validated update.
    pub version: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "lastUpdated")]
    pub last_updated: String,
    /// Ordered section name → structured content. Replaced whole on update,
    /// never partially overwritten.
    pub data: Map<String, Value>,
    #[serde(rename = "updateHistory", default)]
    pub update_history: Vec<UpdateEvent>,
    #[serde(default)]
    pub metadata: RecordMetadata,
}

impl Record {
    /// Section names in document order.
    pub fn section_names(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }
}

/// Current time as an ISO-8601 / RFC 3339 UTC string.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Bump a `major.minor.patch` version string for the given update type.
///
/// Full re-synthesis bumps the minor component; everything else bumps the
/// patch. A malformed version restarts at `1.0.0`.
pub fn bump_version(version: &str, update_type: UpdateType) -> String {
    let mut parts = version.split('.').map(|p| p.parse::<u64>());
    let parsed = (parts.next(), parts.next(), parts.next());
    let (major, minor, patch) = match parsed {
        (Some(Ok(ma)), Some(Ok(mi)), Some(Ok(pa))) => (ma, mi, pa),
        _ => return "1.0.0".to_string(),
    };
    match update_type {
        UpdateType::Full => format!("{major}.{}.0", minor + 1),
        _ => format!("{major}.{minor}.{}", patch + 1),
    }
}

/// Merge `delta` sections into a copy of `base`, returning the merged map and
/// a change summary (one line per touched section).
///
/// Rules: array + array appends values not already present; object + object
/// shallow-merges keys; any other combination replaces the section.
pub fn merge_sections(base: &Map<String, Value>, delta: &Map<String, Value>) -> (Map<String, Value>, Vec<String>) {
    let mut merged = base.clone();
    let mut changes = Vec::with_capacity(delta.len());

    for (section, incoming) in delta {
        match merged.get_mut(section) {
            None => {
                merged.insert(section.clone(), incoming.clone());
                changes.push(format!("added section '{section}'"));
            }
            Some(existing) => {
                match (existing, incoming) {
                    (Value::Array(current), Value::Array(new_items)) => {
                        let before = current.len();
                        for item in new_items {
                            if !current.contains(item) {
                                current.push(item.clone());
                            }
                        }
                        changes.push(format!(
                            "appended {} item(s) to section '{section}'",
                            current.len() - before
                        ));
                    }
                    (Value::Object(current), Value::Object(new_fields)) => {
                        for (k, v) in new_fields {
                            current.insert(k.clone(), v.clone());
                        }
                        changes.push(format!("merged {} field(s) into section '{section}'", new_fields.len()));
                    }
                    (slot, _) => {
                        *slot = incoming.clone();
                        changes.push(format!("replaced section '{section}'"));
                    }
                }
            }
        }
    }

    (merged, changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn bump_patch_for_incremental() {
        assert_eq!(bump_version("1.0.0", UpdateType::Incremental), "1.0.1");
        assert_eq!(bump_version("2.3.9", UpdateType::Scheduled), "2.3.10");
    }

    #[test]
    fn bump_minor_for_full() {
        assert_eq!(bump_version("1.0.4", UpdateType::Full), "1.1.0");
    }

    #[test]
    fn malformed_version_restarts() {
        assert_eq!(bump_version("not-a-version", UpdateType::Manual), "1.0.0");
        assert_eq!(bump_version("1.2", UpdateType::Manual), "1.0.0");
    }

    #[test]
    fn merge_appends_arrays_without_duplicates() {
        let base = obj(json!({"skills": ["Go"]}));
        let delta = obj(json!({"skills": ["Rust", "Go"]}));
        let (merged, changes) = merge_sections(&base, &delta);
        assert_eq!(merged["skills"], json!(["Go", "Rust"]));
        assert_eq!(changes.len(), 1);
        assert!(changes[0].contains("skills"));
    }

    #[test]
    fn merge_shallow_merges_objects() {
        let base = obj(json!({"userProfile": {"name": "A", "role": "dev"}}));
        let delta = obj(json!({"userProfile": {"role": "lead"}}));
        let (merged, _) = merge_sections(&base, &delta);
        assert_eq!(merged["userProfile"], json!({"name": "A", "role": "lead"}));
    }

    #[test]
    fn merge_adds_and_replaces() {
        let base = obj(json!({"summary": "old"}));
        let delta = obj(json!({"summary": "new", "goals": ["ship"]}));
        let (merged, changes) = merge_sections(&base, &delta);
        assert_eq!(merged["summary"], json!("new"));
        assert_eq!(merged["goals"], json!(["ship"]));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn merge_leaves_base_untouched() {
        let base = obj(json!({"skills": ["Go"]}));
        let delta = obj(json!({"skills": ["Rust"]}));
        let _ = merge_sections(&base, &delta);
        assert_eq!(base["skills"], json!(["Go"]));
    }

    #[test]
    fn snapshot_shape_round_trips() {
        let raw = r#"{
            "key": "u1",
            "version": "1.0.0",
            "createdAt": "2026-01-01T00:00:00Z",
            "lastUpdated": "2026-01-02T00:00:00Z",
            "data": {"userProfile": {"name": "A"}, "skills": ["Go"]},
            "updateHistory": [
                {"timestamp": "2026-01-02T00:00:00Z", "updateType": "incremental", "changes": ["x"]}
            ],
            "metadata": {"source": "m", "inputTokens": 10, "outputTokens": 20, "modelParameters": {"temperature": 0.2}}
        }"#;
        let record: Record = serde_json::from_str(raw).unwrap();
        assert_eq!(record.section_names(), vec!["userProfile", "skills"]);
        assert_eq!(record.update_history.len(), 1);
        assert_eq!(record.update_history[0].update_type, UpdateType::Incremental);

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["createdAt"], json!("2026-01-01T00:00:00Z"));
        assert_eq!(back["updateHistory"][0]["updateType"], json!("incremental"));
        assert_eq!(back["metadata"]["inputTokens"], json!(10));
    }
}
