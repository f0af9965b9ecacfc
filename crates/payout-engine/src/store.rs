//! On-disk snapshot store
//!
//! One JSON file per entity and month: `<root>/<entity>/<YYYY-MM>.json`.
//! Writes are create-only. The file is written to a temporary name first and
//! then hard-linked into place, so a concurrent or repeated backfill can never
//! replace a month that already exists.
//!
//! Next to the months sits `live.json`, the mutable working set of the latest
//! warm sync. It is not a month and never shows up in `list_months`.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::month::YearMonth;
use crate::snapshot::{LiveWindow, MonthlySnapshot};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Result of a create-only write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    AlreadyExists,
}

/// Snapshot counts for one entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityStats {
    pub entity_id: String,
    pub months: usize,
    pub oldest: Option<YearMonth>,
    pub newest: Option<YearMonth>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entity_dir(&self, entity_id: &str) -> PathBuf {
        self.root.join(entity_id)
    }

    pub fn path_for(&self, entity_id: &str, month: YearMonth) -> PathBuf {
        self.entity_dir(entity_id).join(format!("{}.json", month))
    }

    pub fn exists(&self, entity_id: &str, month: YearMonth) -> bool {
        self.path_for(entity_id, month).exists()
    }

    /// Months with a snapshot, ascending
    pub fn list_months(&self, entity_id: &str) -> Result<Vec<YearMonth>> {
        let dir = self.entity_dir(entity_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
        };

        let mut months = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(month) = stem.parse::<YearMonth>() {
                months.push(month);
            }
        }
        months.sort();
        Ok(months)
    }

    /// Read a snapshot. `Ok(None)` when absent; corrupt content is an error.
    pub fn load(&self, entity_id: &str, month: YearMonth) -> Result<Option<MonthlySnapshot>> {
        let path = self.path_for(entity_id, month);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };

        let snapshot: MonthlySnapshot =
            serde_json::from_slice(&bytes).with_context(|| format!("Corrupt snapshot {}", path.display()))?;
        if snapshot.entity_id != entity_id || snapshot.year_month != month {
            bail!(
                "Snapshot {} belongs to {}/{}",
                path.display(),
                snapshot.entity_id,
                snapshot.year_month
            );
        }
        Ok(Some(snapshot))
    }

    /// Create-only write; an existing month is left untouched
    pub fn write(&self, snapshot: &MonthlySnapshot) -> Result<WriteOutcome> {
        let target = self.path_for(&snapshot.entity_id, snapshot.year_month);
        if target.exists() {
            return Ok(WriteOutcome::AlreadyExists);
        }

        let tmp = self.write_temp(&snapshot.entity_id, &snapshot.year_month.to_string(), snapshot)?;
        let linked = fs::hard_link(&tmp, &target);
        let _ = fs::remove_file(&tmp);

        match linked {
            Ok(()) => {
                debug!(path = %target.display(), "Wrote snapshot");
                Ok(WriteOutcome::Created)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(WriteOutcome::AlreadyExists),
            Err(e) => Err(e).with_context(|| format!("Failed to link snapshot into {}", target.display())),
        }
    }

    /// Overwrite a month. Only the explicit rebuild path calls this.
    pub fn replace(&self, snapshot: &MonthlySnapshot) -> Result<()> {
        let target = self.path_for(&snapshot.entity_id, snapshot.year_month);
        let tmp = self.write_temp(&snapshot.entity_id, &snapshot.year_month.to_string(), snapshot)?;
        fs::rename(&tmp, &target).with_context(|| format!("Failed to replace {}", target.display()))?;
        debug!(path = %target.display(), "Replaced snapshot");
        Ok(())
    }

    pub fn live_path(&self, entity_id: &str) -> PathBuf {
        self.entity_dir(entity_id).join("live.json")
    }

    /// Replace the entity's live window
    pub fn write_live(&self, live: &LiveWindow) -> Result<()> {
        let target = self.live_path(&live.entity_id);
        let tmp = self.write_temp(&live.entity_id, "live", live)?;
        fs::rename(&tmp, &target).with_context(|| format!("Failed to replace {}", target.display()))?;
        debug!(path = %target.display(), payouts = live.payouts.len(), "Wrote live window");
        Ok(())
    }

    /// `Ok(None)` until the first successful sync
    pub fn load_live(&self, entity_id: &str) -> Result<Option<LiveWindow>> {
        let path = self.live_path(entity_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };

        let live: LiveWindow =
            serde_json::from_slice(&bytes).with_context(|| format!("Corrupt live window {}", path.display()))?;
        if live.entity_id != entity_id {
            bail!("Live window {} belongs to {}", path.display(), live.entity_id);
        }
        Ok(Some(live))
    }

    fn write_temp<T: Serialize>(&self, entity_id: &str, stem: &str, value: &T) -> Result<PathBuf> {
        let dir = self.entity_dir(entity_id);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let tmp = dir.join(format!(
            ".{}.json.{}-{}.tmp",
            stem,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let json = serde_json::to_vec_pretty(value).with_context(|| format!("Failed to serialize {}", stem))?;

        let mut file = fs::File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(tmp)
    }

    /// Entity ids with a snapshot directory
    pub fn entities(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", self.root.display())),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn stats(&self) -> Result<Vec<EntityStats>> {
        self.entities()?
            .into_iter()
            .map(|entity_id| {
                let months = self.list_months(&entity_id)?;
                Ok(EntityStats {
                    months: months.len(),
                    oldest: months.first().copied(),
                    newest: months.last().copied(),
                    entity_id,
                })
            })
            .collect()
    }
}
