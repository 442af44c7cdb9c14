//! Batch refresh scheduler — memory-pressure-aware background updates.
//!
//! Walks all tracked keys in small sequential batches, consulting a memory
//! monitor between keys. Throughput is deliberately traded for a predictable
//! peak-memory footprint: no parallelism inside a run, fixed pauses after
//! each key and between batches so working buffers are long dropped before
//! the next key starts.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{SchedulerConfig, TriggerConfig};
use crate::fetcher::DeltaSource;
use crate::monitor::MemoryMonitor;
use crate::record::UpdateType;
use crate::service::KnowledgeBaseService;

/// What one batch run did. Aborting on memory pressure is a
/// partial-failure-by-design outcome, not an error: processed keys keep
/// their updates and the rest wait for the next run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Keys that reached the update step (whether or not a delta existed).
    pub processed: usize,
    pub updated: usize,
    pub skipped_in_flight: usize,
    pub skipped_no_delta: usize,
    pub failed: usize,
    pub aborted_on_memory: bool,
}

/// Time- and on-demand-triggered driver for bulk refreshes.
pub struct RefreshScheduler {
    service: KnowledgeBaseService,
    source: DeltaSource,
    monitor: MemoryMonitor,
    batch_size: usize,
    inter_key_delay: Duration,
    inter_batch_delay: Duration,
    shutdown: CancellationToken,
}

impl RefreshScheduler {
    pub fn new(
        service: KnowledgeBaseService,
        source: DeltaSource,
        monitor: MemoryMonitor,
        cfg: &SchedulerConfig,
    ) -> Self {
        let shutdown = service.shutdown_token();
        Self {
            service,
            source,
            monitor,
            batch_size: cfg.batch_size.max(1),
            inter_key_delay: Duration::from_millis(cfg.inter_key_delay_ms),
            inter_batch_delay: Duration::from_millis(cfg.inter_batch_delay_ms),
            shutdown,
        }
    }

    /// Spawn the timer loop as a background task. The task ends when the
    /// service's shutdown token fires.
    pub fn spawn(self, trigger: TriggerConfig) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(trigger))
    }

    /// Timer loop: sleep until the next trigger instant, refresh everything,
    /// repeat. No polling.
    pub async fn run(self, trigger: TriggerConfig) {
        info!(?trigger, "refresh scheduler running");
        loop {
            let wait = until_next_fire(&trigger, Utc::now());
            debug!(wait_secs = wait.as_secs(), "scheduler sleeping until next trigger");

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("refresh scheduler shutting down");
                    break;
                }

                _ = tokio::time::sleep(wait) => {
                    let outcome = self.run_refresh().await;
                    info!(
                        processed = outcome.processed,
                        updated = outcome.updated,
                        skipped_in_flight = outcome.skipped_in_flight,
                        skipped_no_delta = outcome.skipped_no_delta,
                        failed = outcome.failed,
                        aborted_on_memory = outcome.aborted_on_memory,
                        "scheduled refresh complete"
                    );
                }
            }
        }
    }

    /// Refresh every tracked key. The candidate set is recomputed from
    /// scratch each run, so keys deferred by an earlier abort need no
    /// persisted marker.
    pub async fn run_refresh(&self) -> BatchOutcome {
        let keys = self.service.tracked_keys();
        if keys.is_empty() {
            debug!("no knowledge records to refresh");
            return BatchOutcome::default();
        }
        info!(keys = keys.len(), batch_size = self.batch_size, "refreshing knowledge records");
        self.run_batch(keys).await
    }

    /// Process `keys` in fixed-size batches, strictly sequentially. Never
    /// returns an error: per-key failures are logged and counted, and memory
    /// pressure aborts the remainder silently.
    pub async fn run_batch(&self, keys: Vec<String>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let total_batches = keys.len().div_ceil(self.batch_size);

        for (batch_index, batch) in keys.chunks(self.batch_size).enumerate() {
            for key in batch {
                if self.shutdown.is_cancelled() {
                    return outcome;
                }

                // An interactive update racing the scheduler wins; duplicate
                // work is skipped, not queued.
                if self.service.is_in_flight(key) {
                    debug!(key, "already in flight, skipping");
                    outcome.skipped_in_flight += 1;
                    continue;
                }

                if self.monitor.over_ceiling() {
                    warn!(
                        key,
                        reading = self.monitor.reading_mb(),
                        "memory ceiling exceeded; deferring remaining keys to the next run"
                    );
                    outcome.aborted_on_memory = true;
                    return outcome;
                }

                let since = self
                    .service
                    .last_updated(key)
                    .unwrap_or_else(|| fallback_since(Utc::now()));

                outcome.processed += 1;
                match self.source.fetch_delta(key, &since).await {
                    Ok(delta) if delta.is_empty() => {
                        debug!(key, "no new material, skipping update");
                        outcome.skipped_no_delta += 1;
                    }
                    Ok(delta) => {
                        match self.service.apply_delta(key, delta, UpdateType::Scheduled).await {
                            Ok(record) => {
                                debug!(key, version = %record.version, "scheduled update applied");
                                outcome.updated += 1;
                            }
                            Err(e) => {
                                warn!(key, error = %e, "scheduled update failed");
                                outcome.failed += 1;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(key, error = %e, "delta fetch failed");
                        outcome.failed += 1;
                    }
                }
                // Per-key working data is out of scope here; pause so the
                // allocator settles before the next key.
                sleep_unless_zero(self.inter_key_delay).await;
            }

            if batch_index + 1 < total_batches {
                debug!(
                    batch = batch_index + 1,
                    total_batches, "batch complete, pausing before the next"
                );
                sleep_unless_zero(self.inter_batch_delay).await;
            }
        }

        outcome
    }
}

async fn sleep_unless_zero(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Time from `now` until the trigger next fires.
fn until_next_fire(trigger: &TriggerConfig, now: DateTime<Utc>) -> Duration {
    match trigger {
        TriggerConfig::Interval { every_secs } => Duration::from_secs(*every_secs),
        TriggerConfig::DailyAt { hour, minute, utc_offset_minutes } => {
            let fire = next_daily(now, *hour, *minute, *utc_offset_minutes);
            (fire - now).to_std().unwrap_or(Duration::ZERO)
        }
    }
}

/// Next occurrence of `hour:minute` wall-clock time in the given fixed UTC
/// offset, strictly after `now`.
fn next_daily(now: DateTime<Utc>, hour: u32, minute: u32, utc_offset_minutes: i32) -> DateTime<Utc> {
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
    let local_now = now.with_timezone(&offset);

    let today = local_now
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .expect("trigger time validated at config load");

    let candidate = offset
        .from_local_datetime(&today)
        .single()
        .expect("fixed offsets have no ambiguous local times")
        .with_timezone(&Utc);

    if candidate > now {
        candidate
    } else {
        candidate + chrono::Duration::days(1)
    }
}

/// When a key has no recorded `lastUpdated`, look one week back.
fn fallback_since(now: DateTime<Utc>) -> String {
    (now - chrono::Duration::days(7)).to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
