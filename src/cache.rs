//! Process-wide record registry with two-tier entries.
//!
//! Metadata for every tracked key stays resident; full document data is
//! materialized on first access that needs it and never demoted back within
//! a process lifetime. The store is the only broadly shared mutable resource
//! in the service, so every operation goes through one lock-guarded map and
//! never touches disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::record::Record;

/// One resident cache entry — cheap metadata or the full document.
#[derive(Debug, Clone)]
pub enum CacheEntry {
    /// Loaded in bulk at startup; `sections` lists section names so that
    /// structure reads never force a full load.
    MetadataOnly {
        key: String,
        version: String,
        last_updated: String,
        sections: Vec<String>,
        path: PathBuf,
    },
    /// Materialized document, including data and history.
    Full(Record),
}

impl CacheEntry {
    pub fn key(&self) -> &str {
        match self {
            CacheEntry::MetadataOnly { key, .. } => key,
            CacheEntry::Full(r) => &r.key,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            CacheEntry::MetadataOnly { version, .. } => version,
            CacheEntry::Full(r) => &r.version,
        }
    }

    pub fn last_updated(&self) -> &str {
        match self {
            CacheEntry::MetadataOnly { last_updated, .. } => last_updated,
            CacheEntry::Full(r) => &r.last_updated,
        }
    }

    /// Section names without materializing anything.
    pub fn section_names(&self) -> Vec<String> {
        match self {
            CacheEntry::MetadataOnly { sections, .. } => sections.clone(),
            CacheEntry::Full(r) => r.section_names(),
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, CacheEntry::Full(_))
    }
}

/// Concurrency-safe registry mapping entity key → cache entry.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the entry for `key`, if tracked.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().expect("cache lock poisoned").get(key).cloned()
    }

    pub fn put(&self, entry: CacheEntry) {
        let key = entry.key().to_string();
        self.entries.write().expect("cache lock poisoned").insert(key, entry);
    }

    /// Transition `key` to a `Full` entry (MetadataOnly → Full, or refresh of
    /// an existing Full entry). The whole document is swapped atomically.
    pub fn promote(&self, record: Record) {
        let key = record.key.clone();
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(key, CacheEntry::Full(record));
    }

    /// All tracked keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().expect("cache lock poisoned").keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many entries hold a materialized full document.
    pub fn resident_full_count(&self) -> usize {
        self.entries
            .read()
            .expect("cache lock poisoned")
            .values()
            .filter(|e| e.is_full())
            .count()
    }

    pub fn clear(&self) {
        self.entries.write().expect("cache lock poisoned").clear();
    }
}
