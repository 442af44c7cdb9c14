//! Delta sources — new material for a key since its last update.
//!
//! `DeltaSource` is an enum over concrete backends, matching the generator
//! abstraction: a new upstream (HTTP API, database, message queue) is a new
//! variant plus a `fetch_delta` arm.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::KbError;

/// Caps applied before a delta reaches prompt or merge code.
const MAX_ITEMS_PER_COLLECTION: usize = 5;
const MAX_ITEM_CHARS: usize = 500;

/// New source material gathered since a record's `lastUpdated` timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaPayload {
    #[serde(default)]
    pub journal_entries: Vec<Value>,
    #[serde(default)]
    pub new_skills: Vec<Value>,
    #[serde(default)]
    pub completed_goals: Vec<Value>,
    #[serde(default)]
    pub profile_changes: Map<String, Value>,
    #[serde(default)]
    pub research: Vec<Value>,
}

impl DeltaPayload {
    /// True when no tracked sub-collection has new content. Empty deltas are
    /// skipped as no-ops by the caller — the idempotence guarantee.
    pub fn is_empty(&self) -> bool {
        self.journal_entries.is_empty()
            && self.new_skills.is_empty()
            && self.completed_goals.is_empty()
            && self.profile_changes.is_empty()
            && self.research.is_empty()
    }

    /// Apply the per-collection and per-item size caps.
    pub fn truncated(mut self) -> Self {
        for list in [
            &mut self.journal_entries,
            &mut self.new_skills,
            &mut self.completed_goals,
            &mut self.research,
        ] {
            list.truncate(MAX_ITEMS_PER_COLLECTION);
            for item in list.iter_mut() {
                truncate_strings(item);
            }
        }
        self
    }

    /// Section-map view of the delta, ready for merging into a record's
    /// `data`. Empty sub-collections produce no section.
    pub fn into_sections(self) -> Map<String, Value> {
        let mut sections = Map::new();
        if !self.journal_entries.is_empty() {
            sections.insert("recentJournalEntries".into(), Value::Array(self.journal_entries));
        }
        if !self.new_skills.is_empty() {
            sections.insert("skills".into(), Value::Array(self.new_skills));
        }
        if !self.completed_goals.is_empty() {
            sections.insert("completedGoals".into(), Value::Array(self.completed_goals));
        }
        if !self.profile_changes.is_empty() {
            sections.insert("userProfile".into(), Value::Object(self.profile_changes));
        }
        if !self.research.is_empty() {
            sections.insert("marketInsights".into(), Value::Array(self.research));
        }
        sections
    }
}

fn truncate_strings(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.chars().count() > MAX_ITEM_CHARS {
                *s = s.chars().take(MAX_ITEM_CHARS).collect();
            }
        }
        Value::Object(map) => {
            for v in map.values_mut() {
                truncate_strings(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                truncate_strings(v);
            }
        }
        _ => {}
    }
}

/// All available delta backends.
#[derive(Debug, Clone)]
pub enum DeltaSource {
    /// In-memory queue of payloads per key — tests and single-box setups
    /// where another process stages the material.
    Static(StaticDeltaSource),
}

impl DeltaSource {
    /// Fetch whatever is new for `key` since the `since` timestamp. An empty
    /// payload means nothing changed.
    pub async fn fetch_delta(&self, key: &str, since: &str) -> Result<DeltaPayload, KbError> {
        match self {
            DeltaSource::Static(s) => Ok(s.take(key, since)),
        }
    }
}

/// Shared in-memory staging area. Clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct StaticDeltaSource {
    staged: Arc<Mutex<HashMap<String, Vec<DeltaPayload>>>>,
}

impl StaticDeltaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a payload for the next fetch of `key`.
    pub fn stage(&self, key: &str, payload: DeltaPayload) {
        self.staged
            .lock()
            .expect("delta staging lock poisoned")
            .entry(key.to_string())
            .or_default()
            .push(payload);
    }

    /// Pop the oldest staged payload for `key`, or an empty delta. The
    /// `since` timestamp is unused here — staging is explicit, so everything
    /// staged is by definition newer than the last update.
    fn take(&self, key: &str, _since: &str) -> DeltaPayload {
        let mut staged = self.staged.lock().expect("delta staging lock poisoned");
        match staged.get_mut(key) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => DeltaPayload::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_delta_is_empty() {
        assert!(DeltaPayload::default().is_empty());
    }

    #[test]
    fn any_collection_makes_it_non_empty() {
        let delta = DeltaPayload { new_skills: vec![json!("Rust")], ..Default::default() };
        assert!(!delta.is_empty());
    }

    #[test]
    fn truncation_caps_items_and_strings() {
        let delta = DeltaPayload {
            journal_entries: (0..10).map(|i| json!({"content": "x".repeat(600), "n": i})).collect(),
            ..Default::default()
        };
        let t = delta.truncated();
        assert_eq!(t.journal_entries.len(), 5);
        let content = t.journal_entries[0]["content"].as_str().unwrap();
        assert_eq!(content.chars().count(), 500);
    }

    #[test]
    fn into_sections_skips_empty_collections() {
        let delta = DeltaPayload {
            new_skills: vec![json!("Rust")],
            profile_changes: json!({"role": "lead"}).as_object().unwrap().clone(),
            ..Default::default()
        };
        let sections = delta.into_sections();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections["skills"], json!(["Rust"]));
        assert_eq!(sections["userProfile"], json!({"role": "lead"}));
    }

    #[tokio::test]
    async fn static_source_pops_in_order_then_empty() {
        let staging = StaticDeltaSource::new();
        let source = DeltaSource::Static(staging.clone());

        staging.stage("u1", DeltaPayload { new_skills: vec![json!("a")], ..Default::default() });
        staging.stage("u1", DeltaPayload { new_skills: vec![json!("b")], ..Default::default() });

        let first = source.fetch_delta("u1", "2026-01-01T00:00:00Z").await.unwrap();
        assert_eq!(first.new_skills, vec![json!("a")]);
        let second = source.fetch_delta("u1", "2026-01-01T00:00:00Z").await.unwrap();
        assert_eq!(second.new_skills, vec![json!("b")]);
        let third = source.fetch_delta("u1", "2026-01-01T00:00:00Z").await.unwrap();
        assert!(third.is_empty());

        // Unknown keys just yield empty deltas.
        assert!(source.fetch_delta("ghost", "").await.unwrap().is_empty());
    }
}
