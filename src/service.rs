//! Service facade — the public contract over cache, persistence,
//! coordination, and synthesis.
//!
//! Per-key state machine: `Absent → Building → Ready`, then
//! `Ready → Updating → Ready`. Building additionally consumes a global
//! admission slot. A failed synthesis returns the key to its prior stable
//! state — the last good snapshot is never destroyed.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheStore};
use crate::config::Config;
use crate::coordinator::{KeyGuard, UpdateCoordinator};
use crate::error::KbError;
use crate::fetcher::DeltaPayload;
use crate::generator::Generator;
use crate::persist::PersistenceAdapter;
use crate::pipeline::SynthesisPipeline;
use crate::record::{Record, UpdateEvent, UpdateType, bump_version, merge_sections, now_iso};
use crate::retriever::Retriever;

/// Fixed reply when answer synthesis is switched off by config.
const ASK_UNAVAILABLE: &str =
    "Knowledge base question answering is currently unavailable. Please try again later.";

/// Counters reported by [`KnowledgeBaseService::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub tracked_keys: usize,
    pub resident_full: usize,
    pub in_flight: usize,
    pub build_slots_in_use: usize,
    pub max_concurrent_builds: usize,
}

/// The knowledge record lifecycle manager.
///
/// Cheap to clone — all state is behind `Arc`s, so request handlers and the
/// refresh scheduler share one instance.
#[derive(Clone)]
pub struct KnowledgeBaseService {
    cache: Arc<CacheStore>,
    persist: Arc<PersistenceAdapter>,
    coordinator: Arc<UpdateCoordinator>,
    pipeline: Arc<SynthesisPipeline>,
    retriever: Arc<Retriever>,
    shutdown: CancellationToken,
    ask_enabled: bool,
    bootstrap_cap: usize,
}

impl KnowledgeBaseService {
    pub fn new(cfg: &Config, generator: Generator) -> Result<Self, KbError> {
        let persist = PersistenceAdapter::new(&cfg.data_dir, cfg.limits.max_snapshot_bytes)?;
        let pipeline = SynthesisPipeline::new(
            generator,
            cfg.generator.model.clone(),
            cfg.generator.temperature,
            cfg.limits.max_generation_attempts,
            Duration::from_millis(cfg.limits.retry_base_delay_ms),
            cfg.limits.max_input_chars,
            cfg.limits.history_fan_in,
        );

        Ok(Self {
            cache: Arc::new(CacheStore::new()),
            persist: Arc::new(persist),
            coordinator: Arc::new(UpdateCoordinator::new(cfg.limits.max_concurrent_builds)),
            pipeline: Arc::new(pipeline),
            retriever: Arc::new(Retriever::sections()),
            shutdown: CancellationToken::new(),
            ask_enabled: cfg.ask_enabled,
            bootstrap_cap: cfg.limits.max_resident_full,
        })
    }

    /// Register existing snapshots as metadata-only entries. Never performs
    /// synthesis. Returns how many keys were registered.
    pub async fn initialize(&self) -> Result<usize, KbError> {
        let metas = self.persist.list().await?;
        let total = metas.len();

        let mut loaded = 0;
        for meta in metas.into_iter().take(self.bootstrap_cap) {
            self.cache.put(CacheEntry::MetadataOnly {
                key: meta.key,
                version: meta.version,
                last_updated: meta.last_updated,
                sections: meta.sections,
                path: meta.path,
            });
            loaded += 1;
        }

        if total > loaded {
            info!(
                total,
                loaded,
                "bootstrap cap reached; remaining snapshots load on demand"
            );
        }
        info!(loaded, "knowledge records registered (metadata only)");
        Ok(loaded)
    }

    /// First-time synthesis for `key`. Consumes a global build slot and the
    /// per-key lock; both fail fast when contended.
    pub async fn build(&self, key: &str, seed: Map<String, Value>) -> Result<Record, KbError> {
        let _slot = self.coordinator.acquire_build_slot()?;
        let guard = self.coordinator.begin(key)?;
        self.build_locked(key, &seed, &guard).await
    }

    async fn build_locked(
        &self,
        key: &str,
        seed: &Map<String, Value>,
        _guard: &KeyGuard,
    ) -> Result<Record, KbError> {
        let record = self.pipeline.build(key, seed).await?;
        self.persist.write(&record).await?;
        self.cache.promote(record.clone());
        info!(key, version = %record.version, sections = record.data.len(), "knowledge record built");
        Ok(record)
    }

    /// Merge `delta` into the record for `key` and persist a new version.
    ///
    /// Absent keys degenerate to a first build seeded with the delta. An
    /// empty delta is a version-preserving no-op. `UpdateType::Full`
    /// re-synthesizes the whole document through the pipeline; other types
    /// apply a deterministic structural merge.
    pub async fn update(
        &self,
        key: &str,
        delta: Map<String, Value>,
        update_type: UpdateType,
    ) -> Result<Record, KbError> {
        let guard = self.coordinator.begin(key)?;

        let current = match self.load_full(key).await {
            Ok(record) => record,
            Err(KbError::NotFound(_)) => {
                info!(key, "no existing record; treating update as first build");
                let _slot = self.coordinator.acquire_build_slot()?;
                return self.build_locked(key, &delta, &guard).await;
            }
            Err(e) => return Err(e),
        };

        if delta.is_empty() {
            debug!(key, version = %current.version, "empty delta, skipping update");
            return Ok(current);
        }

        let (merged, changes) = merge_sections(&current.data, &delta);
        let new_data = match update_type {
            UpdateType::Full => self.pipeline.regenerate(&current, &merged).await?,
            _ => merged,
        };

        let mut next = current;
        next.version = bump_version(&next.version, update_type);
        next.last_updated = now_iso();
        next.data = new_data;
        next.update_history.push(UpdateEvent {
            timestamp: next.last_updated.clone(),
            update_type,
            changes,
        });

        self.persist.write(&next).await?;
        self.cache.promote(next.clone());
        info!(key, version = %next.version, %update_type, "knowledge record updated");
        Ok(next)
    }

    /// Scheduler entry point: truncate the payload, project it onto
    /// sections, and run a regular update.
    pub async fn apply_delta(
        &self,
        key: &str,
        payload: DeltaPayload,
        update_type: UpdateType,
    ) -> Result<Record, KbError> {
        let sections = payload.truncated().into_sections();
        self.update(key, sections, update_type).await
    }

    /// Section names for `key` — served from resident metadata, never
    /// materializes the full document.
    pub fn read_structure(&self, key: &str) -> Result<Vec<String>, KbError> {
        self.cache
            .get(key)
            .map(|entry| entry.section_names())
            .ok_or_else(|| KbError::NotFound(key.to_string()))
    }

    /// Full contents, or one section of them. Forces full materialization;
    /// on-demand loads bypass the bootstrap size filter.
    pub async fn read_contents(&self, key: &str, section: Option<&str>) -> Result<Value, KbError> {
        let record = self.load_full(key).await?;
        match section {
            Some(name) => Ok(record
                .data
                .get(name)
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()))),
            None => Ok(Value::Object(record.data)),
        }
    }

    /// Retrieval-augmented answer over the record for `key`.
    pub async fn ask(&self, key: &str, question: &str) -> Result<String, KbError> {
        if !self.ask_enabled {
            // Degraded mode is an explicit config choice, never the default.
            let _ = self.load_full(key).await?;
            return Ok(ASK_UNAVAILABLE.to_string());
        }

        let record = self.load_full(key).await?;
        let snippets = self.retriever.search(&record, question, 5);
        debug!(key, snippets = snippets.len(), "answering question");
        self.pipeline.answer(question, &snippets).await
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            tracked_keys: self.cache.len(),
            resident_full: self.cache.resident_full_count(),
            in_flight: self.coordinator.in_flight_count(),
            build_slots_in_use: self.coordinator.build_slots_in_use(),
            max_concurrent_builds: self.coordinator.max_builds(),
        }
    }

    /// Stop future scheduler triggers and drop resident state. Does not
    /// interrupt an in-flight generation call.
    pub fn shutdown(&self) {
        info!("knowledge base service shutting down");
        self.shutdown.cancel();
        self.cache.clear();
    }

    // ── scheduler support ────────────────────────────────────────────────

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn tracked_keys(&self) -> Vec<String> {
        let mut keys = self.cache.keys();
        keys.sort();
        keys
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.coordinator.is_in_flight(key)
    }

    /// `lastUpdated` for `key` from resident metadata, if tracked.
    pub fn last_updated(&self, key: &str) -> Option<String> {
        self.cache.get(key).map(|e| e.last_updated().to_string())
    }

    pub fn cache(&self) -> Arc<CacheStore> {
        Arc::clone(&self.cache)
    }

    /// Full record for `key`, from cache or disk, materializing into the
    /// cache as a side effect.
    async fn load_full(&self, key: &str) -> Result<Record, KbError> {
        if let Some(CacheEntry::Full(record)) = self.cache.get(key) {
            return Ok(record);
        }
        let record = self.persist.read(key).await?;
        debug!(key, version = %record.version, "materialized full record");
        self.cache.promote(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::ScriptedGenerator;
    use serde_json::json;
    use tempfile::TempDir;

    fn service_with(generator: ScriptedGenerator) -> (TempDir, KnowledgeBaseService) {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::test_default(tmp.path());
        let svc = KnowledgeBaseService::new(&cfg, Generator::Scripted(generator)).unwrap();
        (tmp, svc)
    }

    #[tokio::test]
    async fn build_then_structure_and_status() {
        let g = ScriptedGenerator::new();
        g.push_reply(r#"{"userProfile": {}, "skills": ["Go"]}"#);
        let (_tmp, svc) = service_with(g);

        svc.build("u1", Map::new()).await.unwrap();
        assert_eq!(svc.read_structure("u1").unwrap(), vec!["userProfile", "skills"]);

        let status = svc.status();
        assert_eq!(status.tracked_keys, 1);
        assert_eq!(status.resident_full, 1);
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.build_slots_in_use, 0);
    }

    #[tokio::test]
    async fn update_on_absent_key_builds() {
        let g = ScriptedGenerator::new();
        g.push_reply(r#"{"summary": "fresh"}"#);
        let (_tmp, svc) = service_with(g);

        let record = svc
            .update("newcomer", json!({"x": 1}).as_object().unwrap().clone(), UpdateType::Incremental)
            .await
            .unwrap();
        assert_eq!(record.version, "1.0.0");
        assert!(record.update_history.is_empty());
    }

    #[tokio::test]
    async fn failed_build_leaves_key_absent() {
        let g = ScriptedGenerator::new();
        for _ in 0..3 {
            g.push_reply("not json");
        }
        let (_tmp, svc) = service_with(g);

        assert!(matches!(
            svc.build("u1", Map::new()).await,
            Err(KbError::GenerationParse { .. })
        ));
        assert!(svc.read_structure("u1").is_err());
        let status = svc.status();
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.build_slots_in_use, 0);
    }

    #[tokio::test]
    async fn shutdown_clears_residents() {
        let g = ScriptedGenerator::new();
        g.push_reply(r#"{"a": 1}"#);
        let (_tmp, svc) = service_with(g);

        svc.build("u1", Map::new()).await.unwrap();
        svc.shutdown();
        assert_eq!(svc.status().tracked_keys, 0);
        assert!(svc.shutdown_token().is_cancelled());
    }
}
