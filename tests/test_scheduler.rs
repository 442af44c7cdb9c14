//! Integration tests for the batch refresh scheduler.
//!
//! All delays are zeroed through the test config, so whole runs execute in
//! milliseconds. Deltas come from the static staging source.

use std::time::Duration;

use serde_json::{Map, json};
use tempfile::TempDir;

use dossier::config::Config;
use dossier::fetcher::{DeltaPayload, DeltaSource, StaticDeltaSource};
use dossier::generator::{Generator, ScriptedGenerator};
use dossier::monitor::MemoryMonitor;
use dossier::scheduler::RefreshScheduler;
use dossier::service::KnowledgeBaseService;

struct Fixture {
    _tmp: TempDir,
    service: KnowledgeBaseService,
    staging: StaticDeltaSource,
    scheduler: RefreshScheduler,
}

/// Build `key_count` records, restart the service so everything is
/// metadata-only, and wire a scheduler with the given memory monitor.
async fn fixture(key_count: usize, monitor_cap: Option<usize>) -> Fixture {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = Config::test_default(tmp.path());

    let g = ScriptedGenerator::new();
    for _ in 0..key_count {
        g.push_reply(r#"{"userProfile": {}, "skills": []}"#);
    }
    let seed_svc = KnowledgeBaseService::new(&cfg, Generator::Scripted(g)).expect("service");
    for i in 1..=key_count {
        seed_svc.build(&format!("k{i}"), Map::new()).await.expect("seed build");
    }

    // Fresh instance: cold cache, metadata-only entries.
    let service = KnowledgeBaseService::new(&cfg, Generator::Scripted(ScriptedGenerator::new()))
        .expect("service");
    assert_eq!(service.initialize().await.expect("initialize"), key_count);
    assert_eq!(service.status().resident_full, 0);

    let monitor = match monitor_cap {
        Some(cap) => MemoryMonitor::resident_proxy(service.cache(), cap),
        None => MemoryMonitor::fixed(u64::MAX / (1024 * 1024)).0,
    };

    let staging = StaticDeltaSource::new();
    let scheduler = RefreshScheduler::new(
        service.clone(),
        DeltaSource::Static(staging.clone()),
        monitor,
        &cfg.scheduler,
    );
    Fixture { _tmp: tmp, service, staging, scheduler }
}

fn skills_delta(skill: &str) -> DeltaPayload {
    DeltaPayload { new_skills: vec![json!(skill)], ..Default::default() }
}

#[tokio::test]
async fn refresh_updates_every_key_with_a_delta() {
    let fx = fixture(3, None).await;
    for key in ["k1", "k2", "k3"] {
        fx.staging.stage(key, skills_delta("Rust"));
    }

    let outcome = fx.scheduler.run_refresh().await;
    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.updated, 3);
    assert_eq!(outcome.failed, 0);
    assert!(!outcome.aborted_on_memory);

    // Scheduled updates carry the right provenance and bump the patch level.
    let record = fx.service.read_contents("k1", None).await.unwrap();
    assert_eq!(record["skills"], json!(["Rust"]));
    let structure = fx.service.read_structure("k1").unwrap();
    assert!(structure.contains(&"skills".to_string()));
}

#[tokio::test]
async fn keys_without_deltas_are_skipped_untouched() {
    let fx = fixture(2, None).await;
    fx.staging.stage("k2", skills_delta("Go"));
    let before = fx.service.last_updated("k1").unwrap();

    let outcome = fx.scheduler.run_refresh().await;
    assert_eq!(outcome.processed, 2);
    assert_eq!(outcome.updated, 1);
    assert_eq!(outcome.skipped_no_delta, 1);

    assert_eq!(fx.service.last_updated("k1").unwrap(), before);
}

#[tokio::test]
async fn memory_ceiling_aborts_the_remainder_cleanly() {
    // Five metadata-only keys, proxy monitor capped at three resident full
    // records. Each applied update materializes one record, so the run must
    // stop before the fourth key.
    let fx = fixture(5, Some(3)).await;
    let keys = fx.service.tracked_keys();
    let before: Vec<String> =
        keys.iter().map(|k| fx.service.last_updated(k).unwrap()).collect();
    for key in &keys {
        fx.staging.stage(key, skills_delta("Rust"));
    }

    let outcome = fx.scheduler.run_refresh().await;
    assert!(outcome.aborted_on_memory);
    assert_eq!(outcome.updated, 3);
    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.failed, 0);
    assert_eq!(fx.service.status().resident_full, 3);

    // Keys walk in sorted order, so exactly the first three were refreshed;
    // the deferred two are untouched, nothing half-applied.
    for (i, key) in keys.iter().enumerate() {
        let now = fx.service.last_updated(key).unwrap();
        if i < 3 {
            assert_ne!(now, before[i], "{key} should have been refreshed");
        } else {
            assert_eq!(now, before[i], "{key} should have been deferred");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_keys_are_skipped_not_queued() {
    let tmp = TempDir::new().unwrap();
    let cfg = Config::test_default(tmp.path());

    let g = ScriptedGenerator::new().with_delay(Duration::from_millis(400));
    g.push_reply(r#"{"skills": ["Go"]}"#);
    let service = KnowledgeBaseService::new(&cfg, Generator::Scripted(g)).unwrap();

    let staging = StaticDeltaSource::new();
    staging.stage("busy", skills_delta("Rust"));
    let scheduler = RefreshScheduler::new(
        service.clone(),
        DeltaSource::Static(staging.clone()),
        MemoryMonitor::fixed(u64::MAX / (1024 * 1024)).0,
        &cfg.scheduler,
    );

    // Start a slow interactive build and give it time to take the key lock.
    let builder = {
        let service = service.clone();
        tokio::spawn(async move { service.build("busy", Map::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(service.is_in_flight("busy"));

    let outcome = scheduler.run_batch(vec!["busy".to_string()]).await;
    assert_eq!(outcome.skipped_in_flight, 1);
    assert_eq!(outcome.processed, 0);

    builder.await.unwrap().unwrap();

    // The staged delta survived the skip and applies on the next run.
    let outcome = scheduler.run_batch(vec!["busy".to_string()]).await;
    assert_eq!(outcome.updated, 1);
    let record = service.read_contents("busy", None).await.unwrap();
    assert_eq!(record["skills"], json!(["Go", "Rust"]));
}

#[tokio::test]
async fn shutdown_stops_a_running_batch() {
    let fx = fixture(2, None).await;
    fx.staging.stage("k1", skills_delta("Rust"));
    fx.staging.stage("k2", skills_delta("Rust"));

    fx.service.shutdown();
    let outcome = fx.scheduler.run_batch(vec!["k1".into(), "k2".into()]).await;
    assert_eq!(outcome.processed, 0);
    assert_eq!(outcome.updated, 0);
}

#[tokio::test]
async fn empty_key_set_is_a_clean_no_op() {
    let fx = fixture(0, None).await;
    let outcome = fx.scheduler.run_refresh().await;
    assert_eq!(outcome, Default::default());
}
