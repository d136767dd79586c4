//! Run sequencing for mirror backups, archive backups and restores.
//!
//! The orchestrator walks the configured entries in order, hands each path to
//! the copy or archive primitives and folds every outcome into one
//! [`OperationResult`]. Progress and per-item events go to an [`Observer`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::ArchiveBuilder;
use crate::cfg::{DotfileEntry, Options};
use crate::errors::{BackupError, Result};
use crate::paths::PathResolver;
use crate::report::{OperationResult, PathPair};
use crate::restore::RestoreResolver;
use crate::retention;
use crate::sync::{self, CopyOutcome, CopyStatus};
use crate::verify::{BackupType, VerificationEngine, VerificationReport};

pub use crate::sync::{BROKEN_SYMLINK, UNCHANGED};

pub const UNRESOLVABLE: &str = "cannot determine original location";
pub const SHADOWED: &str = "shadowed by another backup of the same file";

/// Run callbacks. Every method defaults to doing nothing.
pub trait Observer {
    fn progress(&self, _percent: u8) {}
    fn item_processed(&self, _source: &Path, _destination: &Path) {}
    fn item_skipped(&self, _source: &Path, _reason: &str) {}
    fn error(&self, _context: &str, _message: &str) {}
}

pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Safety copy of files a restore is about to overwrite.
pub trait PreRestoreBackup {
    fn is_enabled(&self) -> bool {
        true
    }

    /// Snapshot every existing path in `targets`. Returns where the snapshot
    /// was written, or `None` if there was nothing to save.
    fn snapshot(&self, targets: &[PathBuf], resolver: &PathResolver) -> Result<Option<PathBuf>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Finished,
    Aborted,
}

#[derive(Debug)]
pub struct ArchiveOutcome {
    pub result: OperationResult,
    pub archive: Option<PathBuf>,
    pub rotated: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct RestoreOutcome {
    pub result: OperationResult,
    pub snapshot: Option<PathBuf>,
}

/// Percent-complete tracker that reports 100 exactly once.
struct Progress {
    total: usize,
    done: usize,
    finished: bool,
}

impl Progress {
    fn new(total: usize) -> Self {
        Progress {
            total,
            done: 0,
            finished: false,
        }
    }

    fn step(&mut self, observer: &dyn Observer) {
        self.done += 1;
        let percent = if self.total == 0 {
            100
        } else {
            (self.done.min(self.total) * 100 / self.total) as u8
        };
        if percent == 100 {
            self.finish(observer);
        } else {
            observer.progress(percent);
        }
    }

    fn finish(&mut self, observer: &dyn Observer) {
        if !self.finished {
            self.finished = true;
            observer.progress(100);
        }
    }
}

pub struct Orchestrator {
    entries: Vec<DotfileEntry>,
    options: Options,
    resolver: PathResolver,
    observer: Box<dyn Observer>,
    pre_restore: Option<Box<dyn PreRestoreBackup>>,
    state: RunState,
}

impl Orchestrator {
    pub fn new(entries: Vec<DotfileEntry>, options: Options, resolver: PathResolver) -> Self {
        Orchestrator {
            entries,
            options,
            resolver,
            observer: Box::new(NoopObserver),
            pre_restore: None,
            state: RunState::Idle,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_pre_restore(mut self, backup: Box<dyn PreRestoreBackup>) -> Self {
        self.pre_restore = Some(backup);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// `<mirror_dir>/[hostname/][date/]` for this run.
    pub fn mirror_root(&self) -> PathBuf {
        let base = self.resolver.expand(&self.options.mirror_dir);
        self.resolver
            .run_root(&base, self.options.hostname_subdir, self.options.date_subdir)
    }

    /// Archive directory. Never split by date.
    pub fn archive_root(&self) -> PathBuf {
        let base = self.resolver.expand(&self.options.archive_dir);
        self.resolver.run_root(&base, self.options.hostname_subdir, false)
    }

    /// Existing expanded paths of every enabled entry, grouped per entry.
    /// Entries with no existing path are left out.
    fn existing_paths(&self) -> Vec<(&DotfileEntry, Vec<PathBuf>)> {
        self.entries
            .iter()
            .filter(|entry| entry.enabled)
            .filter_map(|entry| {
                let paths: Vec<PathBuf> = entry
                    .paths
                    .iter()
                    .map(|p| self.resolver.expand(p))
                    .filter(|p| {
                        let exists = p.exists();
                        if !exists {
                            debug!(path = %p.display(), "not present, ignoring");
                        }
                        exists
                    })
                    .collect();
                if paths.is_empty() {
                    None
                } else {
                    Some((entry, paths))
                }
            })
            .collect()
    }

    pub fn execute_mirror_backup(&mut self) -> OperationResult {
        self.state = RunState::Running;
        let mut result = OperationResult::new();
        let base = self.resolver.expand(&self.options.mirror_dir);
        let eligible = self.existing_paths();
        let mut progress = Progress::new(eligible.len());

        info!(entries = eligible.len(), destination = %base.display(), "mirror backup started");

        for (entry, paths) in &eligible {
            debug!(application = %entry.application, "mirroring");
            for path in paths {
                let dest = self.resolver.assemble_destination(
                    &base,
                    path,
                    self.options.hostname_subdir,
                    self.options.date_subdir,
                );
                if path.is_dir() {
                    match sync::copy_directory(path, &dest, true) {
                        Ok(outcomes) => {
                            result.total_items += outcomes.len();
                            for outcome in outcomes {
                                self.record_copy(&mut result, outcome);
                            }
                        }
                        Err(err) => {
                            result.total_items += 1;
                            self.record_error(&mut result, path, &err);
                        }
                    }
                } else {
                    result.total_items += 1;
                    match sync::copy_file(path, &dest, true, true) {
                        Ok(outcome) => self.record_copy(&mut result, outcome),
                        Err(err) => self.record_error(&mut result, path, &err),
                    }
                }
            }
            progress.step(self.observer.as_ref());
        }

        progress.finish(self.observer.as_ref());
        let status = result.finalize();
        info!(
            status = status.as_str(),
            copied = result.completed.len(),
            unchanged = result.skipped.len(),
            failed = result.failed.len(),
            "mirror backup finished"
        );
        self.state = RunState::Finished;
        result
    }

    pub fn execute_archive_backup(&mut self) -> ArchiveOutcome {
        self.state = RunState::Running;
        let mut result = OperationResult::new();
        let mut archive = None;
        let mut rotated = Vec::new();

        let sources: Vec<PathBuf> = self
            .existing_paths()
            .into_iter()
            .flat_map(|(_, paths)| paths)
            .collect();

        if sources.is_empty() {
            info!("nothing to archive");
            self.observer.progress(100);
            result.finalize();
            self.state = RunState::Finished;
            return ArchiveOutcome { result, archive, rotated };
        }

        let dest_dir = self.archive_root();
        let builder = ArchiveBuilder::new(self.options.archive_format, self.options.compression_level);
        info!(sources = sources.len(), destination = %dest_dir.display(), format = %builder.format(), "archive backup started");

        match builder.build(&sources, &dest_dir, &self.resolver) {
            Ok(report) => {
                result.total_items = report.added.len() + report.failed.len() + report.broken_links.len();
                for link in &report.broken_links {
                    self.observer.item_skipped(link, BROKEN_SYMLINK);
                    result.record_skipped(link, None, BROKEN_SYMLINK);
                }
                for (source, member) in &report.added {
                    let dest = report
                        .path
                        .as_ref()
                        .map(|archive| archive.join(member))
                        .unwrap_or_else(|| member.clone());
                    self.observer.item_processed(source, &dest);
                    result.record_completed(PathPair::new(source, dest));
                }
                for (path, err) in &report.failed {
                    self.record_error(&mut result, path, err);
                }
                archive = report.path;
            }
            Err(err) => {
                result.total_items += 1;
                self.record_error(&mut result, &dest_dir, &err);
            }
        }

        if archive.is_some() && self.options.rotate_archives {
            match retention::rotate(
                &dest_dir,
                &self.options.archive_format.rotation_pattern(),
                self.options.max_archives,
            ) {
                Ok(deleted) => rotated = deleted,
                Err(err) => {
                    warn!(error = %err, "archive rotation failed");
                    result.record_warning(format!("archive rotation failed: {}", err));
                }
            }
        }

        self.observer.progress(100);
        let status = result.finalize();
        info!(status = status.as_str(), archive = ?archive, rotated = rotated.len(), "archive backup finished");
        self.state = RunState::Finished;
        ArchiveOutcome { result, archive, rotated }
    }

    /// Restore every file under `backup_root` to where it came from.
    ///
    /// Aborts before writing anything when the backup root is missing or the
    /// pre-restore snapshot fails. Files are always copied, even when the
    /// destination already looks identical.
    pub fn execute_restore(&mut self, backup_root: &Path) -> Result<RestoreOutcome> {
        self.state = RunState::Running;
        let resolver = RestoreResolver::new(self.resolver.home());

        let discovery = match resolver.discover(backup_root) {
            Ok(discovery) => discovery,
            Err(err) => {
                self.observer.error("restore", &err.to_string());
                self.state = RunState::Aborted;
                return Err(err);
            }
        };

        let mut result = OperationResult::new();
        result.total_items = discovery.items.len() + discovery.unreadable.len();
        for (path, err) in &discovery.unreadable {
            self.record_error(&mut result, path, err);
        }

        let mut pairs: Vec<PathPair> = Vec::new();
        let mut by_destination: HashMap<PathBuf, usize> = HashMap::new();
        for item in discovery.items {
            match item.original {
                Some(original) => match by_destination.get(&original).copied() {
                    // Later in walk order wins: newer dates sort after older ones.
                    Some(index) => {
                        let shadowed = std::mem::replace(&mut pairs[index].source, item.backup);
                        warn!(
                            shadowed = %shadowed.display(),
                            used = %pairs[index].source.display(),
                            "two backups restore to the same file"
                        );
                        self.observer.item_skipped(&shadowed, SHADOWED);
                        result.record_warning(format!(
                            "{}: {}, using {}",
                            shadowed.display(),
                            SHADOWED,
                            pairs[index].source.display()
                        ));
                        result.record_skipped(shadowed, None, SHADOWED);
                    }
                    None => {
                        by_destination.insert(original.clone(), pairs.len());
                        pairs.push(PathPair::new(item.backup, original));
                    }
                },
                None => {
                    warn!(path = %item.backup.display(), "{}", UNRESOLVABLE);
                    self.observer.item_skipped(&item.backup, UNRESOLVABLE);
                    result.record_warning(format!("{}: {}", item.backup.display(), UNRESOLVABLE));
                    result.record_skipped(item.backup, None, UNRESOLVABLE);
                }
            }
        }

        let mut snapshot = None;
        if let Some(pre_restore) = self.pre_restore.as_ref().filter(|p| p.is_enabled()) {
            let targets: Vec<PathBuf> = pairs.iter().map(|p| p.destination.clone()).collect();
            match pre_restore.snapshot(&targets, &self.resolver) {
                Ok(path) => snapshot = path,
                Err(err) => {
                    let err = BackupError::PreRestoreFailed { source: Box::new(err) };
                    warn!(error = %err, "aborting restore");
                    self.observer.error("pre-restore backup", &err.to_string());
                    self.state = RunState::Aborted;
                    return Err(err);
                }
            }
        }

        info!(files = pairs.len(), source = %backup_root.display(), "restore started");
        let mut progress = Progress::new(pairs.len());
        for pair in &pairs {
            match sync::copy_file(&pair.source, &pair.destination, true, false) {
                Ok(outcome) => self.record_copy(&mut result, outcome),
                Err(err) => self.record_error(&mut result, &pair.source, &err),
            }
            progress.step(self.observer.as_ref());
        }
        progress.finish(self.observer.as_ref());

        let status = result.finalize();
        info!(status = status.as_str(), restored = result.completed.len(), "restore finished");
        self.state = RunState::Finished;
        Ok(RestoreOutcome { result, snapshot })
    }

    /// Every (source file, mirror destination) pair the current
    /// configuration maps to. Directories are expanded to their files.
    pub fn mirror_pairs(&self) -> Vec<PathPair> {
        let base = self.resolver.expand(&self.options.mirror_dir);
        let mut pairs = Vec::new();
        for (_, paths) in self.existing_paths() {
            for path in paths {
                let dest = self.resolver.assemble_destination(
                    &base,
                    &path,
                    self.options.hostname_subdir,
                    self.options.date_subdir,
                );
                if path.is_dir() {
                    for entry in WalkDir::new(&path)
                        .follow_links(true)
                        .sort_by_file_name()
                        .into_iter()
                        .filter_map(|e| e.ok())
                        .filter(|e| e.file_type().is_file())
                    {
                        let rel = entry.path().strip_prefix(&path).unwrap_or(entry.path());
                        pairs.push(PathPair::new(entry.path(), dest.join(rel)));
                    }
                } else {
                    pairs.push(PathPair::new(path, dest));
                }
            }
        }
        pairs
    }

    /// Check a finished mirror run's destinations against their sources.
    pub fn verify_mirror(&self, result: &OperationResult, hash: bool) -> VerificationReport {
        VerificationEngine::new(hash).verify_backup(&self.mirror_root(), &result.verifiable_pairs(), BackupType::Mirror)
    }

    fn record_copy(&self, result: &mut OperationResult, outcome: CopyOutcome) {
        match (outcome.status, outcome.destination, outcome.error) {
            (CopyStatus::Success, Some(dest), _) => {
                self.observer.item_processed(&outcome.source, &dest);
                result.record_completed(PathPair::new(outcome.source, dest));
            }
            (CopyStatus::Skipped, dest, _) => {
                let reason = outcome.skip_reason.unwrap_or(UNCHANGED);
                self.observer.item_skipped(&outcome.source, reason);
                result.record_skipped(outcome.source, dest, reason);
            }
            (_, _, Some(err)) => {
                self.observer.error(&outcome.source.display().to_string(), &err.to_string());
                result.record_failed(outcome.source, &err);
            }
            (status, _, None) => {
                warn!(path = %outcome.source.display(), ?status, "copy outcome without destination or error");
            }
        }
    }

    fn record_error(&self, result: &mut OperationResult, path: &Path, err: &BackupError) {
        self.observer.error(&path.display().to_string(), &err.to_string());
        result.record_failed(path, err);
    }
}
