//! Pre-restore safety snapshots.
//!
//! Before a restore overwrites anything, the files about to be replaced are
//! copied into `<root>/pre-restore-<timestamp>/` using the same
//! `home/...`/`root/...` layout as a mirror backup, so a snapshot can itself
//! be passed to `restore` to undo the restore.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::PreRestoreBackup;
use crate::errors::{BackupError, Result};
use crate::paths::PathResolver;
use crate::retention;
use crate::sync;

pub const SNAPSHOT_PREFIX: &str = "pre-restore-";
pub const METADATA_FILE: &str = "snapshot.json";
const ID_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Metadata stored next to each snapshot's files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    pub size_bytes: u64,
    /// Original locations of the captured files.
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    max_count: usize,
    enabled: bool,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, max_count: usize, enabled: bool) -> Self {
        SnapshotStore {
            root: root.into(),
            max_count,
            enabled,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Copy every existing target into a fresh snapshot directory.
    ///
    /// Returns `Ok(None)` when none of the targets exist. Any copy failure
    /// removes the half-written snapshot and is returned.
    pub fn create(&self, targets: &[PathBuf], resolver: &PathResolver) -> Result<Option<Snapshot>> {
        let existing: Vec<&PathBuf> = targets.iter().filter(|t| t.is_file()).collect();
        if existing.is_empty() {
            debug!("nothing to snapshot before restore");
            return Ok(None);
        }

        fs::create_dir_all(&self.root).map_err(|e| BackupError::io("create directory", &self.root, e))?;
        let base = format!("{}{}", SNAPSHOT_PREFIX, Local::now().format(ID_FORMAT));
        let dir = retention::claim_unique_dir(&self.root, &base)?;

        match self.fill(&dir, &existing, resolver) {
            Ok(snapshot) => {
                info!(snapshot = %dir.display(), files = snapshot.file_count, "pre-restore snapshot taken");
                if let Err(err) = retention::rotate(&self.root, &format!("{}*", SNAPSHOT_PREFIX), self.max_count) {
                    warn!(error = %err, "could not rotate old snapshots");
                }
                Ok(Some(snapshot))
            }
            Err(err) => {
                let _ = fs::remove_dir_all(&dir);
                Err(err)
            }
        }
    }

    fn fill(&self, dir: &Path, targets: &[&PathBuf], resolver: &PathResolver) -> Result<Snapshot> {
        let mut size_bytes = 0u64;
        let mut files = Vec::with_capacity(targets.len());

        for target in targets {
            let dest = dir.join(resolver.layout_relative(target));
            sync::copy_file(target, &dest, true, false)?;
            size_bytes += fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
            files.push(target.to_path_buf());
        }

        let snapshot = Snapshot {
            id: dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            created_at: Utc::now(),
            file_count: files.len(),
            size_bytes,
            files,
        };

        let metadata_path = dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| BackupError::io("serialize", &metadata_path, io::Error::new(io::ErrorKind::Other, e)))?;
        fs::write(&metadata_path, json).map_err(|e| BackupError::io("write", &metadata_path, e))?;

        Ok(snapshot)
    }

    /// All snapshots with readable metadata, newest first.
    pub fn list(&self) -> anyhow::Result<Vec<Snapshot>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let metadata_path = entry.path().join(METADATA_FILE);
            if !metadata_path.exists() {
                continue;
            }
            let content = fs::read_to_string(&metadata_path)
                .with_context(|| format!("Failed to read {}", metadata_path.display()))?;
            match serde_json::from_str::<Snapshot>(&content) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(path = %metadata_path.display(), error = %e, "ignoring unreadable snapshot metadata"),
            }
        }

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(snapshots)
    }
}

impl PreRestoreBackup for SnapshotStore {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn snapshot(&self, targets: &[PathBuf], resolver: &PathResolver) -> Result<Option<PathBuf>> {
        Ok(self
            .create(targets, resolver)?
            .map(|snapshot| self.path_of(&snapshot.id)))
    }
}
