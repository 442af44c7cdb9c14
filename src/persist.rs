//! Snapshot persistence — one JSON file per entity key.
//!
//! Writes go through a temp file plus rename so a crash mid-write cannot
//! corrupt the previous snapshot. Bulk enumeration applies a size filter and
//! skips malformed files with a logged error; a single bad snapshot must
//! never prevent the service from starting.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::KbError;
use crate::record::Record;

/// Cheap per-snapshot summary returned by [`PersistenceAdapter::list`].
#[derive(Debug, Clone)]
pub struct SnapshotMeta {
    pub key: String,
    pub version: String,
    pub last_updated: String,
    pub sections: Vec<String>,
    pub path: PathBuf,
}

/// Reads and writes versioned snapshot files under `{data_dir}/records/`.
#[derive(Debug)]
pub struct PersistenceAdapter {
    records_dir: PathBuf,
    max_snapshot_bytes: u64,
}

impl PersistenceAdapter {
    /// Create or open the snapshot directory.
    pub fn new(data_dir: &Path, max_snapshot_bytes: u64) -> Result<Self, KbError> {
        let records_dir = data_dir.join("records");
        std::fs::create_dir_all(&records_dir).map_err(|e| {
            KbError::Persistence(format!("cannot create {}: {e}", records_dir.display()))
        })?;
        Ok(Self { records_dir, max_snapshot_bytes })
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.records_dir.join(format!("{key}.json"))
    }

    /// Serialize the full record to its snapshot location, replacing any
    /// prior snapshot. Write-to-temp-then-rename keeps the last good
    /// snapshot intact if the process dies mid-write.
    pub async fn write(&self, record: &Record) -> Result<(), KbError> {
        validate_key(&record.key)?;

        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| KbError::Persistence(format!("cannot serialize '{}': {e}", record.key)))?;

        let path = self.path_for(&record.key);
        let tmp = self.records_dir.join(format!("{}.json.tmp", record.key));

        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| KbError::Persistence(format!("cannot write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| KbError::Persistence(format!("cannot rename {}: {e}", tmp.display())))?;

        debug!(key = %record.key, version = %record.version, bytes = body.len(), "snapshot written");
        Ok(())
    }

    /// Read one snapshot, regardless of its size. On-demand reads bypass the
    /// bulk enumeration size filter.
    pub async fn read(&self, key: &str) -> Result<Record, KbError> {
        validate_key(key)?;
        let path = self.path_for(key);

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KbError::NotFound(key.to_string()));
            }
            Err(e) => {
                return Err(KbError::Persistence(format!("cannot read {}: {e}", path.display())));
            }
        };

        serde_json::from_slice(&raw)
            .map_err(|e| KbError::Persistence(format!("cannot parse {}: {e}", path.display())))
    }

    /// Enumerate all snapshots as metadata summaries.
    ///
    /// Files over the configured size threshold are skipped and logged so an
    /// abnormally large document cannot balloon memory during bootstrap; they
    /// remain independently readable via [`read`](Self::read). Malformed
    /// files are skipped and logged rather than aborting the sweep.
    pub async fn list(&self) -> Result<Vec<SnapshotMeta>, KbError> {
        let mut dir = tokio::fs::read_dir(&self.records_dir).await.map_err(|e| {
            KbError::Persistence(format!("cannot read {}: {e}", self.records_dir.display()))
        })?;

        let mut metas = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| KbError::Persistence(format!("directory walk failed: {e}")))?
        {
            let path = entry.path();
            let Some(key) = snapshot_key(&path) else { continue };

            let size = match entry.metadata().await {
                Ok(m) => m.len(),
                Err(e) => {
                    warn!(key, error = %e, "cannot stat snapshot, skipping");
                    continue;
                }
            };
            if size > self.max_snapshot_bytes {
                warn!(
                    key,
                    size_bytes = size,
                    limit_bytes = self.max_snapshot_bytes,
                    "skipping oversized snapshot during bulk load"
                );
                continue;
            }

            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(key, error = %e, "cannot read snapshot, skipping");
                    continue;
                }
            };
            // The record is parsed whole here but only the summary leaves this
            // scope; the full data buffer is dropped before the next file.
            let record: Record = match serde_json::from_slice(&raw) {
                Ok(r) => r,
                Err(e) => {
                    warn!(key, error = %e, "malformed snapshot, skipping");
                    continue;
                }
            };

            metas.push(SnapshotMeta {
                key: record.key,
                version: record.version,
                last_updated: record.last_updated,
                sections: record.data.keys().cloned().collect(),
                path,
            });
        }

        // Deterministic order for bootstrap truncation.
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }
}

/// Entity keys become file names; reject anything that could escape the
/// snapshot directory.
fn validate_key(key: &str) -> Result<(), KbError> {
    let ok = !key.is_empty()
        && key.len() <= 128
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(KbError::Persistence(format!("invalid entity key: '{key}'")))
    }
}

fn snapshot_key(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != "json" {
        return None;
    }
    Some(path.file_stem()?.to_str()?.to_string())
}
