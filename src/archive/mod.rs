//! Compressed point-in-time archives of the configured dotfiles.
//!
//! Members are stored under the same `home/...` and `root/...` layout a
//! mirror backup uses, so an extracted archive can be fed straight to
//! restore.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{BackupError, Result};
use crate::paths::PathResolver;
use crate::retention;
use crate::sync;

pub const ARCHIVE_PREFIX: &str = "dotfiles-";
pub const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[default]
    #[serde(rename = "tar.gz")]
    TarGz,
    #[serde(rename = "tar.zst")]
    TarZst,
    #[serde(rename = "tar")]
    Tar,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarZst => "tar.zst",
            ArchiveFormat::Tar => "tar",
        }
    }

    /// Glob matching every archive this format produces.
    pub fn rotation_pattern(self) -> String {
        format!("{}*.{}", ARCHIVE_PREFIX, self.extension())
    }

    fn clamp_level(self, level: u32) -> u32 {
        match self {
            ArchiveFormat::TarGz => level.min(9),
            ArchiveFormat::TarZst => level.clamp(1, 22),
            ArchiveFormat::Tar => 0,
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ArchiveFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tar.gz" | "tgz" | "gz" => Ok(ArchiveFormat::TarGz),
            "tar.zst" | "zst" | "zstd" => Ok(ArchiveFormat::TarZst),
            "tar" => Ok(ArchiveFormat::Tar),
            other => Err(format!("unknown archive format '{}'", other)),
        }
    }
}

/// What went into one archive.
#[derive(Debug, Default)]
pub struct ArchiveReport {
    /// Final archive path. `None` when nothing could be added.
    pub path: Option<PathBuf>,
    /// (source file, member name) for every file stored.
    pub added: Vec<(PathBuf, PathBuf)>,
    pub failed: Vec<(PathBuf, BackupError)>,
    /// Symlinks below a source directory whose target is gone.
    pub broken_links: Vec<PathBuf>,
    pub bytes: u64,
}

pub struct ArchiveBuilder {
    format: ArchiveFormat,
    level: u32,
}

impl ArchiveBuilder {
    pub fn new(format: ArchiveFormat, level: u32) -> Self {
        ArchiveBuilder {
            format,
            level: format.clamp_level(level),
        }
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Pack `sources` into a new archive in `dest_dir`.
    ///
    /// Files that cannot be opened are recorded in the report and left out.
    /// Errors writing the archive itself are returned and leave no file
    /// behind under the archive name.
    ///
    /// A read error partway through a file that did open is also fatal for
    /// the whole archive: its header and some bytes are already in the tar
    /// stream, so the member cannot be dropped.
    pub fn build(&self, sources: &[PathBuf], dest_dir: &Path, resolver: &PathResolver) -> Result<ArchiveReport> {
        std::fs::create_dir_all(dest_dir).map_err(|e| BackupError::io("create directory", dest_dir, e))?;

        let base = format!("{}{}", ARCHIVE_PREFIX, Local::now().format(ARCHIVE_TIMESTAMP_FORMAT));
        let suffix = format!(".{}", self.format.extension());
        let reserved = retention::claim_unique(dest_dir, &base, &suffix)?;

        match self.write_archive(sources, dest_dir, &reserved, resolver) {
            Ok(report) => {
                if report.path.is_none() {
                    let _ = std::fs::remove_file(&reserved);
                }
                Ok(report)
            }
            Err(err) => {
                let _ = std::fs::remove_file(&reserved);
                Err(err)
            }
        }
    }

    fn write_archive(
        &self,
        sources: &[PathBuf],
        dest_dir: &Path,
        target: &Path,
        resolver: &PathResolver,
    ) -> Result<ArchiveReport> {
        let tmp = tempfile::Builder::new()
            .prefix(".dotkeep-")
            .suffix(".partial")
            .tempfile_in(dest_dir)
            .map_err(|e| BackupError::io("create temporary archive in", dest_dir, e))?;
        let file = tmp
            .as_file()
            .try_clone()
            .map_err(|e| BackupError::io("open", tmp.path(), e))?;
        let writer = BufWriter::new(file);

        let mut report = ArchiveReport::default();
        let written = match self.format {
            ArchiveFormat::TarGz => {
                let encoder = GzEncoder::new(writer, Compression::new(self.level));
                append_sources(encoder, sources, resolver, &mut report)
                    .and_then(|encoder| encoder.finish())
                    .and_then(finish_writer)
            }
            ArchiveFormat::TarZst => zstd::Encoder::new(writer, self.level as i32)
                .and_then(|encoder| append_sources(encoder, sources, resolver, &mut report))
                .and_then(|encoder| encoder.finish())
                .and_then(finish_writer),
            ArchiveFormat::Tar => append_sources(writer, sources, resolver, &mut report).and_then(finish_writer),
        };
        written.map_err(|e| BackupError::io("write archive", tmp.path(), e))?;

        if report.added.is_empty() {
            warn!(dir = %dest_dir.display(), "no files could be archived");
            return Ok(report);
        }

        tmp.persist(target)
            .map_err(|e| BackupError::io("finalize archive", target, e.error))?;
        info!(
            archive = %target.display(),
            files = report.added.len(),
            failed = report.failed.len(),
            "archive written"
        );
        report.path = Some(target.to_path_buf());
        Ok(report)
    }
}

fn finish_writer(mut writer: BufWriter<File>) -> io::Result<()> {
    writer.flush()?;
    writer.get_ref().sync_all()
}

/// Stream every source into a tar on top of `writer` and hand the writer back
/// once the tar trailer is written.
fn append_sources<W: Write>(
    writer: W,
    sources: &[PathBuf],
    resolver: &PathResolver,
    report: &mut ArchiveReport,
) -> io::Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(true);

    for source in sources {
        if source.is_dir() {
            for entry in WalkDir::new(source).follow_links(true).sort_by_file_name() {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        append_one(&mut builder, entry.path(), resolver, report)?;
                    }
                    Ok(_) => {}
                    Err(err) => match sync::dangling_symlink(&err) {
                        Some(link) => {
                            debug!(path = %link.display(), "skipping broken symlink");
                            report.broken_links.push(link);
                        }
                        None => {
                            let error = BackupError::walk(source, err);
                            let path = error.path().unwrap_or(source).to_path_buf();
                            warn!(path = %path.display(), error = %error, "skipping unreadable entry");
                            report.failed.push((path, error));
                        }
                    },
                }
            }
        } else {
            append_one(&mut builder, source, resolver, report)?;
        }
    }

    builder.into_inner()
}

fn append_one<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    resolver: &PathResolver,
    report: &mut ArchiveReport,
) -> io::Result<()> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            let error = BackupError::io("read", path, e);
            warn!(path = %path.display(), error = %error, "leaving file out of archive");
            report.failed.push((path.to_path_buf(), error));
            return Ok(());
        }
    };

    let member = resolver.layout_relative(path);
    builder.append_file(&member, &mut file)?;
    report.bytes += file.metadata().map(|m| m.len()).unwrap_or(0);
    debug!(source = %path.display(), member = %member.display(), "archived");
    report.added.push((path.to_path_buf(), member));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;

    fn resolver(home: &Path) -> PathResolver {
        PathResolver::new(home, "testhost", NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
    }

    fn read_members<R: Read>(reader: R) -> BTreeMap<String, String> {
        let mut archive = tar::Archive::new(reader);
        let mut members = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().replace('\\', "/");
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            members.insert(name, content);
        }
        members
    }

    fn sample_home(tmp: &TempDir) -> PathBuf {
        let home = tmp.path().join("home");
        fs::create_dir_all(home.join(".config/nvim")).unwrap();
        fs::write(home.join(".bashrc"), "export A=1").unwrap();
        fs::write(home.join(".config/nvim/init.lua"), "set number").unwrap();
        home
    }

    #[test]
    fn test_tar_gz_members_use_layout_names() {
        let tmp = TempDir::new().unwrap();
        let home = sample_home(&tmp);
        let out = tmp.path().join("archives");

        let sources = vec![home.join(".bashrc"), home.join(".config/nvim")];
        let report = ArchiveBuilder::new(ArchiveFormat::TarGz, 6)
            .build(&sources, &out, &resolver(&home))
            .unwrap();

        let path = report.path.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("dotfiles-"));
        assert!(name.ends_with(".tar.gz"));

        let members = read_members(GzDecoder::new(File::open(&path).unwrap()));
        assert_eq!(members.get("home/.bashrc").map(String::as_str), Some("export A=1"));
        assert_eq!(
            members.get("home/.config/nvim/init.lua").map(String::as_str),
            Some("set number")
        );
        assert_eq!(report.added.len(), 2);
    }

    #[test]
    fn test_tar_zst_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let home = sample_home(&tmp);
        let out = tmp.path().join("archives");

        let report = ArchiveBuilder::new(ArchiveFormat::TarZst, 3)
            .build(&[home.join(".bashrc")], &out, &resolver(&home))
            .unwrap();

        let path = report.path.unwrap();
        let decoder = zstd::Decoder::new(File::open(&path).unwrap()).unwrap();
        let members = read_members(decoder);
        assert_eq!(members.len(), 1);
        assert!(members.contains_key("home/.bashrc"));
    }

    #[test]
    fn test_same_second_archives_do_not_collide() {
        let tmp = TempDir::new().unwrap();
        let home = sample_home(&tmp);
        let out = tmp.path().join("archives");
        let builder = ArchiveBuilder::new(ArchiveFormat::Tar, 0);
        let sources = vec![home.join(".bashrc")];

        let first = builder.build(&sources, &out, &resolver(&home)).unwrap().path.unwrap();
        let second = builder.build(&sources, &out, &resolver(&home)).unwrap().path.unwrap();

        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }

    #[test]
    fn test_no_partial_files_left() {
        let tmp = TempDir::new().unwrap();
        let home = sample_home(&tmp);
        let out = tmp.path().join("archives");

        ArchiveBuilder::new(ArchiveFormat::TarGz, 9)
            .build(&[home.join(".bashrc")], &out, &resolver(&home))
            .unwrap();

        let names: Vec<String> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!names[0].ends_with(".partial"));
    }

    #[test]
    fn test_nothing_archivable_leaves_no_archive() {
        let tmp = TempDir::new().unwrap();
        let home = sample_home(&tmp);
        let out = tmp.path().join("archives");

        let report = ArchiveBuilder::new(ArchiveFormat::TarGz, 9)
            .build(&[home.join("missing")], &out, &resolver(&home))
            .unwrap();

        assert!(report.path.is_none());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_broken_symlink_is_left_out_not_failed() {
        let tmp = TempDir::new().unwrap();
        let home = sample_home(&tmp);
        std::os::unix::fs::symlink(home.join("nowhere"), home.join(".config/nvim/stale")).unwrap();
        let out = tmp.path().join("archives");

        let report = ArchiveBuilder::new(ArchiveFormat::Tar, 0)
            .build(&[home.join(".config/nvim")], &out, &resolver(&home))
            .unwrap();

        assert!(report.failed.is_empty());
        assert_eq!(report.broken_links, vec![home.join(".config/nvim/stale")]);
        let members = read_members(File::open(report.path.unwrap()).unwrap());
        assert_eq!(members.keys().collect::<Vec<_>>(), vec!["home/.config/nvim/init.lua"]);
    }

    #[test]
    fn test_format_parsing_and_levels() {
        assert_eq!("tar.zst".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarZst);
        assert!("zip".parse::<ArchiveFormat>().is_err());
        assert_eq!(ArchiveBuilder::new(ArchiveFormat::TarGz, 40).level(), 9);
        assert_eq!(ArchiveBuilder::new(ArchiveFormat::TarZst, 0).level(), 1);
        assert_eq!(ArchiveFormat::TarGz.rotation_pattern(), "dotfiles-*.tar.gz");
    }
}
