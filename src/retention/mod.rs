//! Keep-N-most-recent rotation.
//!
//! [`rotate`] is shared by archive retention, pre-restore snapshots and the
//! config file's own backups. It knows nothing about file names beyond the
//! glob pattern the caller passes in.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Local;
use glob::Pattern;
use tracing::{debug, warn};

use crate::errors::{BackupError, Result};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Delete the oldest entries in `directory` whose name matches `pattern`
/// until at most `max_count` remain. Returns the deleted paths, oldest first.
pub fn rotate(directory: &Path, pattern: &str, max_count: usize) -> Result<Vec<PathBuf>> {
    let matcher = Pattern::new(pattern).map_err(|e| {
        BackupError::io(
            "compile rotation pattern for",
            directory,
            io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
        )
    })?;

    let mut artifacts = list_matching(directory, &matcher)?;
    if artifacts.len() <= max_count {
        return Ok(Vec::new());
    }

    artifacts.sort_by(compare_age);
    let excess = artifacts.len() - max_count;

    let mut deleted = Vec::with_capacity(excess);
    for (path, _) in artifacts.into_iter().take(excess) {
        let removal = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removal.map_err(|e| BackupError::io("delete old backup", &path, e))?;
        debug!(path = %path.display(), "rotated out");
        deleted.push(path);
    }

    Ok(deleted)
}

fn list_matching(directory: &Path, matcher: &Pattern) -> Result<Vec<(PathBuf, SystemTime)>> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackupError::io("list", directory, e)),
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BackupError::io("list", directory, e))?;
        let name = entry.file_name();
        if !matcher.matches(&name.to_string_lossy()) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .map_err(|e| BackupError::io("read metadata of", entry.path(), e))?;
        artifacts.push((entry.path(), modified));
    }
    Ok(artifacts)
}

/// Oldest first. Equal mtimes fall back to the name with its same-second
/// counter taken out, then the counter itself, so `x.20240101-120000.tar.gz`
/// sorts before `x.20240101-120000.001.tar.gz`.
fn compare_age(a: &(PathBuf, SystemTime), b: &(PathBuf, SystemTime)) -> Ordering {
    a.1.cmp(&b.1)
        .then_with(|| split_counter(&a.0).cmp(&split_counter(&b.0)))
        .then_with(|| a.0.cmp(&b.0))
}

/// `base.001.tar.gz` → (`base.tar.gz`, 1); names without a counter get 0.
/// The counter is the last dot-separated segment of three or more digits
/// after the first.
fn split_counter(path: &Path) -> (String, u32) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let segments: Vec<&str> = name.split('.').collect();
    let counter = segments
        .iter()
        .enumerate()
        .skip(1)
        .rev()
        .find(|(_, s)| s.len() >= 3 && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|(i, s)| s.parse::<u32>().ok().map(|n| (i, n)));

    match counter {
        Some((index, n)) => {
            let rest: Vec<&str> = segments
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, s)| *s)
                .collect();
            (rest.join("."), n)
        }
        None => (name, 0),
    }
}

/// Directory holding rotating backups of `source`: `.<file name>.backups`
/// next to it.
pub fn backup_dir_for(source: &Path) -> Option<PathBuf> {
    let name = source.file_name()?.to_string_lossy();
    let parent = source.parent().unwrap_or_else(|| Path::new("."));
    Some(parent.join(format!(".{}.backups", name)))
}

/// Copy `source` to `<stem>.<timestamp>[.<n>]<suffix>` in its backups
/// directory and rotate that directory down to `max_count`.
///
/// Never fails the caller: problems are logged and `None` is returned. A
/// missing source also returns `None`.
pub fn create_rotating_backup(source: &Path, max_count: usize) -> Option<PathBuf> {
    if !source.is_file() {
        return None;
    }

    match try_create_rotating_backup(source, max_count) {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(source = %source.display(), error = %err, "could not back up file, continuing");
            None
        }
    }
}

fn try_create_rotating_backup(source: &Path, max_count: usize) -> Result<PathBuf> {
    let backup_dir = backup_dir_for(source).ok_or_else(|| {
        BackupError::io(
            "back up",
            source,
            io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
        )
    })?;
    fs::create_dir_all(&backup_dir).map_err(|e| BackupError::io("create directory", &backup_dir, e))?;

    let (stem, suffix) = split_name(source);
    let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
    let dest = claim_unique(&backup_dir, &format!("{}.{}", stem, timestamp), &suffix)?;

    if let Err(err) = copy_onto_claimed(source, &backup_dir, &dest) {
        let _ = fs::remove_file(&dest);
        return Err(err);
    }

    let pattern = format!("{}.*{}", Pattern::escape(&stem), Pattern::escape(&suffix));
    rotate(&backup_dir, &pattern, max_count)?;

    Ok(dest)
}

/// Write `source` to a temp file in `dir` and rename it over the empty
/// placeholder at `dest`. The mtime is left at now: it records when the
/// backup was taken, which is what rotation orders by.
fn copy_onto_claimed(source: &Path, dir: &Path, dest: &Path) -> Result<()> {
    let mut reader = fs::File::open(source).map_err(|e| BackupError::io("read", source, e))?;
    let permissions = reader
        .metadata()
        .map_err(|e| BackupError::io("read metadata of", source, e))?
        .permissions();

    let mut tmp = tempfile::Builder::new()
        .prefix(".dotkeep-")
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(|e| BackupError::io("create temporary file in", dir, e))?;
    io::copy(&mut reader, tmp.as_file_mut()).map_err(|e| BackupError::io("write backup", dest, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| BackupError::io("write backup", dest, e))?;
    fs::set_permissions(tmp.path(), permissions).map_err(|e| BackupError::io("write backup", dest, e))?;

    tmp.persist(dest)
        .map_err(|e| BackupError::io("write backup", dest, e.error))?;
    Ok(())
}

/// Create an empty file at `<dir>/<base><suffix>`, or `<base>.001<suffix>`,
/// `<base>.002<suffix>`… if taken. Creation is exclusive so two writers in
/// the same second never share a name.
pub fn claim_unique(dir: &Path, base: &str, suffix: &str) -> Result<PathBuf> {
    claim(dir, base, suffix, |path| {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map(|_| ())
    })
}

/// Directory flavour of [`claim_unique`].
pub fn claim_unique_dir(dir: &Path, base: &str) -> Result<PathBuf> {
    claim(dir, base, "", |path| fs::create_dir(path))
}

fn claim(
    dir: &Path,
    base: &str,
    suffix: &str,
    create: impl Fn(&Path) -> io::Result<()>,
) -> Result<PathBuf> {
    let mut candidate = dir.join(format!("{}{}", base, suffix));
    let mut n = 0u32;
    loop {
        match create(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                n += 1;
                candidate = dir.join(format!("{}.{:03}{}", base, n, suffix));
            }
            Err(e) => return Err(BackupError::io("create", &candidate, e)),
        }
    }
}

/// `config.toml` → (`config`, `.toml`); `.bashrc` → (`.bashrc`, ``).
fn split_name(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, suffix)
}
