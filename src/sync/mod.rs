//! File and directory copy primitives.
//!
//! Copies go through a temporary file next to the destination that is only
//! renamed into place once all bytes are written and synced, so an interrupted
//! copy never leaves a truncated file under the real name.

pub mod change;

use std::fs::{self, File, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::{BackupError, Result};

pub const UNCHANGED: &str = "unchanged";
pub const BROKEN_SYMLINK: &str = "broken symlink";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    Success,
    Skipped,
    Failed,
}

/// What happened to one file.
#[derive(Debug)]
pub struct CopyOutcome {
    pub source: PathBuf,
    /// Absent when the copy failed.
    pub destination: Option<PathBuf>,
    pub status: CopyStatus,
    pub error: Option<BackupError>,
    /// Why a skipped file was left alone.
    pub skip_reason: Option<&'static str>,
}

impl CopyOutcome {
    fn copied(source: &Path, dest: &Path) -> Self {
        CopyOutcome {
            source: source.to_path_buf(),
            destination: Some(dest.to_path_buf()),
            status: CopyStatus::Success,
            error: None,
            skip_reason: None,
        }
    }

    fn unchanged(source: &Path, dest: &Path) -> Self {
        CopyOutcome {
            source: source.to_path_buf(),
            destination: Some(dest.to_path_buf()),
            status: CopyStatus::Skipped,
            error: None,
            skip_reason: Some(UNCHANGED),
        }
    }

    fn broken_symlink(link: &Path) -> Self {
        CopyOutcome {
            source: link.to_path_buf(),
            destination: None,
            status: CopyStatus::Skipped,
            error: None,
            skip_reason: Some(BROKEN_SYMLINK),
        }
    }

    fn failed(source: &Path, error: BackupError) -> Self {
        CopyOutcome {
            source: source.to_path_buf(),
            destination: None,
            status: CopyStatus::Failed,
            error: Some(error),
            skip_reason: None,
        }
    }

    /// Success also covers files skipped as unchanged.
    pub fn is_success(&self) -> bool {
        self.status != CopyStatus::Failed
    }

    pub fn is_skipped(&self) -> bool {
        self.status == CopyStatus::Skipped
    }
}

/// Copy one file, preserving permissions and mtime.
///
/// An unreadable source fails before anything is written. With
/// `skip_if_identical`, a destination that matches by size and mtime is left
/// untouched and reported as skipped.
pub fn copy_file(
    source: &Path,
    dest: &Path,
    create_parent_dirs: bool,
    skip_if_identical: bool,
) -> Result<CopyOutcome> {
    let mut reader = File::open(source).map_err(|e| BackupError::io("read", source, e))?;
    let metadata = reader
        .metadata()
        .map_err(|e| BackupError::io("read metadata of", source, e))?;

    if metadata.is_dir() {
        return Err(BackupError::io(
            "copy",
            source,
            io::Error::new(io::ErrorKind::InvalidInput, "source is a directory"),
        ));
    }

    if skip_if_identical && change::files_are_identical(source, dest) {
        debug!(source = %source.display(), "unchanged, skipping");
        return Ok(CopyOutcome::unchanged(source, dest));
    }

    if create_parent_dirs {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BackupError::io("create directory", parent, e))?;
        }
    }

    write_atomically(&mut reader, &metadata, dest).map_err(|e| BackupError::io("write", dest, e))?;
    debug!(source = %source.display(), dest = %dest.display(), "copied");

    Ok(CopyOutcome::copied(source, dest))
}

/// Copy every file below `source` into the same relative place below `dest`.
///
/// Returns one outcome per file visited. Failures on individual files or
/// unreadable subdirectories are recorded and the walk moves on; only a root
/// that cannot be listed at all is an error. Symlinks whose target is gone
/// are skipped, not failed.
pub fn copy_directory(source: &Path, dest: &Path, skip_if_identical: bool) -> Result<Vec<CopyOutcome>> {
    let mut outcomes = Vec::new();

    for entry in WalkDir::new(source).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => return Err(BackupError::walk(source, err)),
            Err(err) => {
                if let Some(link) = dangling_symlink(&err) {
                    debug!(path = %link.display(), "skipping broken symlink");
                    outcomes.push(CopyOutcome::broken_symlink(&link));
                    continue;
                }
                let error = BackupError::walk(source, err);
                let path = error.path().unwrap_or(source).to_path_buf();
                warn!(path = %path.display(), error = %error, "skipping unreadable entry");
                outcomes.push(CopyOutcome::failed(&path, error));
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let dest_file = dest.join(rel);
        let outcome = match copy_file(entry.path(), &dest_file, true, skip_if_identical) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(path = %entry.path().display(), error = %error, "copy failed");
                CopyOutcome::failed(entry.path(), error)
            }
        };
        outcomes.push(outcome);
    }

    Ok(outcomes)
}

/// The link path when a followed walk failed because a symlink points
/// nowhere.
pub fn dangling_symlink(err: &walkdir::Error) -> Option<PathBuf> {
    if err.io_error().map(io::Error::kind) != Some(io::ErrorKind::NotFound) {
        return None;
    }
    let path = err.path()?;
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Some(path.to_path_buf()),
        _ => None,
    }
}

fn write_atomically(reader: &mut File, metadata: &Metadata, dest: &Path) -> io::Result<()> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".dotkeep-")
        .suffix(".partial")
        .tempfile_in(parent)?;

    io::copy(reader, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;

    let mtime = FileTime::from_last_modification_time(metadata);
    filetime::set_file_mtime(tmp.path(), mtime)?;
    fs::set_permissions(tmp.path(), metadata.permissions())?;

    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use tempfile::TempDir;

    fn set_mtime(path: &Path, secs: i64) {
        filetime::set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[cfg(unix)]
    fn running_as_root() -> bool {
        nix::unistd::geteuid().is_root()
    }

    #[test]
    fn test_copy_creates_parents_and_preserves_mtime() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.txt");
        let dest = tmp.path().join("a/b/c/dest.txt");
        fs::write(&src, "hello").unwrap();
        set_mtime(&src, 1_600_000_000);

        let outcome = copy_file(&src, &dest, true, false).unwrap();

        assert_eq!(outcome.status, CopyStatus::Success);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "hello");
        let mtime = FileTime::from_last_modification_time(&fs::metadata(&dest).unwrap());
        assert_eq!(mtime.unix_seconds(), 1_600_000_000);
    }

    #[test]
    fn test_skip_identical_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.txt");
        let dest = tmp.path().join("dest.txt");
        fs::write(&src, "abcd").unwrap();
        // Same size and mtime but different bytes: a write would be visible.
        fs::write(&dest, "wxyz").unwrap();
        set_mtime(&src, 1_650_000_000);
        set_mtime(&dest, 1_650_000_000);

        let outcome = copy_file(&src, &dest, true, true).unwrap();

        assert!(outcome.is_skipped());
        assert!(outcome.is_success());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "wxyz");
    }

    #[test]
    fn test_changed_mtime_triggers_copy() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.txt");
        let dest = tmp.path().join("dest.txt");
        fs::write(&src, "abcd").unwrap();
        fs::write(&dest, "wxyz").unwrap();
        set_mtime(&src, 1_650_000_100);
        set_mtime(&dest, 1_650_000_000);

        let outcome = copy_file(&src, &dest, true, true).unwrap();

        assert_eq!(outcome.status, CopyStatus::Success);
        assert_eq!(fs::read(&dest).unwrap(), fs::read(&src).unwrap());
    }

    #[test]
    fn test_changed_size_triggers_copy() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.txt");
        let dest = tmp.path().join("dest.txt");
        fs::write(&src, "a longer line").unwrap();
        fs::write(&dest, "short").unwrap();
        set_mtime(&src, 1_650_000_000);
        set_mtime(&dest, 1_650_000_000);

        copy_file(&src, &dest, true, true).unwrap();

        assert_eq!(fs::read_to_string(&dest).unwrap(), "a longer line");
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.txt");
        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(&src, "x").unwrap();

        copy_file(&src, &out.join("dest.txt"), false, false).unwrap();

        let names: Vec<_> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["dest.txt".to_string()]);
    }

    #[test]
    fn test_missing_parent_without_create_fails() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.txt");
        fs::write(&src, "x").unwrap();

        let err = copy_file(&src, &tmp.path().join("no/such/dir/f"), false, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_source_is_permission_error() {
        use std::os::unix::fs::PermissionsExt;
        if running_as_root() {
            return;
        }

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("secret");
        let dest = tmp.path().join("dest");
        fs::write(&src, "x").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o000)).unwrap();

        let err = copy_file(&src, &dest, true, false).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Permission);
        assert!(!dest.exists());
        fs::set_permissions(&src, fs::Permissions::from_mode(0o644)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_preserves_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("script.sh");
        let dest = tmp.path().join("copy.sh");
        fs::write(&src, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o750)).unwrap();

        copy_file(&src, &dest, true, false).unwrap();

        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
    }

    #[test]
    fn test_copy_directory_walks_files_only() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("nvim");
        fs::create_dir_all(src.join("lua/plugins")).unwrap();
        fs::create_dir_all(src.join("empty")).unwrap();
        fs::write(src.join("init.lua"), "require('plugins')").unwrap();
        fs::write(src.join("lua/plugins/init.lua"), "return {}").unwrap();

        let dest = tmp.path().join("backup/nvim");
        let outcomes = copy_directory(&src, &dest, true).unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.status == CopyStatus::Success));
        assert_eq!(
            fs::read_to_string(dest.join("lua/plugins/init.lua")).unwrap(),
            "return {}"
        );

        // Second pass finds everything unchanged.
        let again = copy_directory(&src, &dest, true).unwrap();
        assert!(again.iter().all(|o| o.is_skipped()));
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_directory_continues_past_unreadable_file() {
        use std::os::unix::fs::PermissionsExt;
        if running_as_root() {
            return;
        }

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("conf");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.conf"), "a").unwrap();
        fs::write(src.join("b.conf"), "b").unwrap();
        fs::write(src.join("c.conf"), "c").unwrap();
        fs::set_permissions(src.join("b.conf"), fs::Permissions::from_mode(0o000)).unwrap();

        let dest = tmp.path().join("out");
        let outcomes = copy_directory(&src, &dest, false).unwrap();

        assert_eq!(outcomes.len(), 3);
        let failed: Vec<_> = outcomes.iter().filter(|o| !o.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].destination.is_none());
        assert_eq!(failed[0].error.as_ref().unwrap().kind(), ErrorKind::Permission);
        assert!(dest.join("a.conf").exists());
        assert!(dest.join("c.conf").exists());

        fs::set_permissions(src.join("b.conf"), fs::Permissions::from_mode(0o644)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_directory_reports_symlink_loop() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("looped");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("file"), "data").unwrap();
        std::os::unix::fs::symlink(&src, src.join("sub/back")).unwrap();

        let outcomes = copy_directory(&src, &tmp.path().join("out"), false).unwrap();

        assert!(outcomes
            .iter()
            .any(|o| o.error.as_ref().map(|e| e.kind()) == Some(ErrorKind::SymlinkLoop)));
        assert!(tmp.path().join("out/file").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_directory_skips_broken_symlink() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("conf");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.conf"), "a").unwrap();
        std::os::unix::fs::symlink(src.join("gone"), src.join("stale-link")).unwrap();

        let outcomes = copy_directory(&src, &tmp.path().join("out"), false).unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.is_success()));
        let stale = outcomes.iter().find(|o| o.source.ends_with("stale-link")).unwrap();
        assert_eq!(stale.status, CopyStatus::Skipped);
        assert_eq!(stale.skip_reason, Some(BROKEN_SYMLINK));
        assert!(stale.error.is_none());
        assert!(tmp.path().join("out/a.conf").exists());
        assert!(!tmp.path().join("out/stale-link").exists());
    }

    #[test]
    fn test_copy_directory_missing_root_is_error() {
        let tmp = TempDir::new().unwrap();
        let err = copy_directory(&tmp.path().join("missing"), &tmp.path().join("out"), true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
