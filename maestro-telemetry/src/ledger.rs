//! Append-only JSONL ledger: write path, rotation, retention, reads.

use std::path::{Path, PathBuf};
use std::sync::Once;

use chrono::{NaiveDate, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use maestro_types::TelemetryError;

use crate::entry::TelemetryEntry;

/// Active ledger file name.
const ACTIVE_FILE: &str = "usage.jsonl";

/// Ledger tuning knobs.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Master switch; disabled means `record` is a no-op and reads see
    /// an empty ledger.
    pub enabled: bool,
    /// Directory holding `usage.jsonl` and rotated files.
    pub dir: PathBuf,
    /// Size threshold that triggers rotation.
    pub max_file_bytes: u64,
    /// Rotated files older than this many days are deleted at the next
    /// rotation.
    pub retention_days: u32,
}

impl LedgerConfig {
    /// Config rooted at `<data_dir>/telemetry` with the defaults:
    /// 10 MB rotation threshold, 90 day retention.
    #[must_use]
    pub fn under_data_dir(data_dir: &Path) -> Self {
        Self {
            enabled: true,
            dir: data_dir.join("telemetry"),
            max_file_bytes: 10 * 1024 * 1024,
            retention_days: 90,
        }
    }
}

/// The usage ledger.
///
/// One process-level mutex serializes every write, which is also what
/// makes line ordering reflect real-time arrival and keeps lines atomic
/// on platforms without atomic shared-file append.
pub struct UsageLedger {
    config: LedgerConfig,
    write_lock: Mutex<()>,
    write_failed: Once,
}

impl UsageLedger {
    /// Create a ledger. Directories are created lazily on first write.
    #[must_use]
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            write_lock: Mutex::new(()),
            write_failed: Once::new(),
        }
    }

    /// The ledger configuration.
    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Record one entry. Infallible by contract: the first failure is
    /// logged, every failure is swallowed.
    pub async fn record(&self, entry: &TelemetryEntry) {
        if !self.config.enabled {
            return;
        }
        if let Err(error) = self.write_entry(entry).await {
            self.write_failed.call_once(|| {
                tracing::warn!(%error, "telemetry write failed; further failures are silent");
            });
        }
    }

    async fn write_entry(&self, entry: &TelemetryEntry) -> Result<(), TelemetryError> {
        let _guard = self.write_lock.lock().await;

        tokio::fs::create_dir_all(&self.config.dir).await?;
        restrict_dir_permissions(&self.config.dir).await?;

        let active = self.config.dir.join(ACTIVE_FILE);
        if let Ok(metadata) = tokio::fs::metadata(&active).await
            && metadata.len() >= self.config.max_file_bytes
        {
            self.rotate(&active).await?;
            self.enforce_retention().await?;
        }

        let mut line = serde_json::to_string(entry)
            .map_err(|e| TelemetryError::Serialization(e.to_string()))?;
        line.push('\n');

        let newly_created = tokio::fs::metadata(&active).await.is_err();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        if newly_created {
            restrict_file_permissions(&active).await?;
        }
        Ok(())
    }

    /// Rename the active file to `usage.<YYYY-MM-DD>.jsonl`, suffixing
    /// `-N` on collision.
    async fn rotate(&self, active: &Path) -> Result<(), TelemetryError> {
        let date = Utc::now().format("%Y-%m-%d");
        let mut target = self.config.dir.join(format!("usage.{date}.jsonl"));
        let mut n = 1;
        while tokio::fs::metadata(&target).await.is_ok() {
            target = self.config.dir.join(format!("usage.{date}-{n}.jsonl"));
            n += 1;
        }
        tracing::debug!(to = %target.display(), "rotating telemetry ledger");
        tokio::fs::rename(active, &target).await?;
        Ok(())
    }

    /// Delete rotated files whose embedded date is past the retention
    /// cutoff. Whole files only; lines are never touched.
    async fn enforce_retention(&self) -> Result<(), TelemetryError> {
        let cutoff = Utc::now().date_naive() - chrono::Days::new(u64::from(self.config.retention_days));
        let mut dir = tokio::fs::read_dir(&self.config.dir).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = rotated_file_date(name) else {
                continue;
            };
            if date < cutoff {
                tracing::debug!(file = name, "deleting expired telemetry file");
                let _ = tokio::fs::remove_file(dirent.path()).await;
            }
        }
        Ok(())
    }

    /// The most recent `n` entries, newest first, across the active and
    /// rotated files.
    ///
    /// # Errors
    ///
    /// I/O failures reading the ledger directory. Malformed lines are
    /// skipped, not fatal.
    pub async fn recent(&self, n: usize) -> Result<Vec<TelemetryEntry>, TelemetryError> {
        let mut entries = self.read_all().await?;
        entries.reverse();
        entries.truncate(n);
        Ok(entries)
    }

    /// Every entry in the ledger, oldest first.
    pub(crate) async fn read_all(&self) -> Result<Vec<TelemetryEntry>, TelemetryError> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }
        let mut files = self.ledger_files().await?;
        // Chronological order: rotated files by (date, collision index),
        // then the active file.
        let active = self.config.dir.join(ACTIVE_FILE);
        files.retain(|p| *p != active);
        files.sort_by_key(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            rotation_sort_key(name)
        });
        files.push(active);
        let mut entries = Vec::new();
        for path in files {
            let Ok(contents) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TelemetryEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(error) => {
                        tracing::debug!(%error, "skipping malformed telemetry line");
                    }
                }
            }
        }
        Ok(entries)
    }

    /// All ledger files currently on disk.
    async fn ledger_files(&self) -> Result<Vec<PathBuf>, TelemetryError> {
        let mut files = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.config.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(dirent) = dir.next_entry().await? {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == ACTIVE_FILE || rotated_file_date(name).is_some() {
                files.push(dirent.path());
            }
        }
        Ok(files)
    }

    /// Delete every ledger file. Irreversible; requires `confirm`.
    ///
    /// # Errors
    ///
    /// [`TelemetryError::ResetNotConfirmed`] without the flag; I/O
    /// errors otherwise.
    pub async fn reset(&self, confirm: bool) -> Result<(), TelemetryError> {
        if !confirm {
            return Err(TelemetryError::ResetNotConfirmed);
        }
        let _guard = self.write_lock.lock().await;
        for path in self.ledger_files().await? {
            tokio::fs::remove_file(&path).await?;
        }
        tracing::info!("telemetry ledger reset");
        Ok(())
    }
}

/// Parse the date out of a rotated file name (`usage.2026-01-08.jsonl`
/// or `usage.2026-01-08-2.jsonl`).
fn rotated_file_date(name: &str) -> Option<NaiveDate> {
    let rest = name.strip_prefix("usage.")?.strip_suffix(".jsonl")?;
    let date_part = rest.get(0..10)?;
    // Reject the active file and anything not date-shaped.
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Sort key for rotated files: date, then collision index (the bare
/// dated file rotated before its `-N` successors).
fn rotation_sort_key(name: &str) -> (NaiveDate, u32) {
    let date = rotated_file_date(name).unwrap_or(NaiveDate::MIN);
    let index = name
        .strip_prefix("usage.")
        .and_then(|rest| rest.strip_suffix(".jsonl"))
        .and_then(|rest| rest.get(11..))
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or(0);
    (date, index)
}

#[cfg(unix)]
async fn restrict_dir_permissions(dir: &Path) -> Result<(), TelemetryError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_dir_permissions(_dir: &Path) -> Result<(), TelemetryError> {
    Ok(())
}

#[cfg(unix)]
async fn restrict_file_permissions(file: &Path) -> Result<(), TelemetryError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(file, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_file_permissions(_file: &Path) -> Result<(), TelemetryError> {
    Ok(())
}
