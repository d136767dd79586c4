//! Mapping backup trees back to the paths they came from.

use std::path::{Component, Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::errors::{BackupError, Result};
use crate::paths::{HOME_MARKER, ROOT_MARKER};

/// How many leading components may precede the `home`/`root` marker:
/// optional hostname and date directories.
const MAX_MARKER_DEPTH: usize = 3;

#[derive(Debug, Clone)]
pub struct RestoreItem {
    pub backup: PathBuf,
    /// `None` when the file is not under a `home` or `root` directory.
    pub original: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct Discovery {
    pub items: Vec<RestoreItem>,
    /// Entries below the backup root that could not be read.
    pub unreadable: Vec<(PathBuf, BackupError)>,
}

/// Reconstructs original locations from the `[hostname/][date/]{home|root}/`
/// layout.
#[derive(Debug, Clone)]
pub struct RestoreResolver {
    home: PathBuf,
}

impl RestoreResolver {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        RestoreResolver { home: home.into() }
    }

    /// Every file under `backup_root`, in file-name order, with its original
    /// location when one can be worked out.
    pub fn discover(&self, backup_root: &Path) -> Result<Discovery> {
        if !backup_root.exists() {
            return Err(BackupError::SourceMissing {
                path: backup_root.to_path_buf(),
            });
        }

        let mut discovery = Discovery::default();
        for entry in WalkDir::new(backup_root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => return Err(BackupError::walk(backup_root, err)),
                Err(err) => {
                    let error = BackupError::walk(backup_root, err);
                    let path = error.path().unwrap_or(backup_root).to_path_buf();
                    warn!(path = %path.display(), error = %error, "unreadable entry in backup");
                    discovery.unreadable.push((path, error));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = entry.path().strip_prefix(backup_root).unwrap_or(entry.path());
            discovery.items.push(RestoreItem {
                backup: entry.path().to_path_buf(),
                original: self.original_location(rel),
            });
        }

        Ok(discovery)
    }

    /// Original path for a file at `relative` below a backup root.
    ///
    /// The first `home` or `root` component within the leading few segments
    /// decides the mapping. Files directly inside a marker directory with
    /// nothing after it, or outside any marker, resolve to `None`.
    pub fn original_location(&self, relative: &Path) -> Option<PathBuf> {
        let components: Vec<Component> = relative.components().collect();
        let marker = components
            .iter()
            .take(MAX_MARKER_DEPTH)
            .position(|c| matches!(c, Component::Normal(name) if *name == HOME_MARKER || *name == ROOT_MARKER))?;

        let rest: PathBuf = components[marker + 1..].iter().collect();
        if rest.as_os_str().is_empty() {
            return None;
        }

        match components[marker] {
            Component::Normal(name) if name == HOME_MARKER => Some(self.home.join(rest)),
            _ => Some(under_filesystem_root(&rest)),
        }
    }
}

/// The layout stores drive letters as a plain leading component
/// (`root/C/Users/...`).
#[cfg(windows)]
fn under_filesystem_root(rest: &Path) -> PathBuf {
    let mut parts = rest.components();
    match parts.next() {
        Some(drive) => {
            PathBuf::from(format!("{}:\\", drive.as_os_str().to_string_lossy())).join(parts.as_path())
        }
        None => rest.to_path_buf(),
    }
}

#[cfg(not(windows))]
fn under_filesystem_root(rest: &Path) -> PathBuf {
    Path::new("/").join(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_home_marker_maps_to_home() {
        let r = RestoreResolver::new("/home/alice");
        assert_eq!(
            r.original_location(Path::new("laptop/2024-01-02/home/.config/git/config")),
            Some(PathBuf::from("/home/alice/.config/git/config"))
        );
        assert_eq!(
            r.original_location(Path::new("home/.bashrc")),
            Some(PathBuf::from("/home/alice/.bashrc"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_root_marker_maps_to_absolute() {
        let r = RestoreResolver::new("/home/alice");
        assert_eq!(
            r.original_location(Path::new("laptop/root/etc/hosts")),
            Some(PathBuf::from("/etc/hosts"))
        );
    }

    #[test]
    fn test_unresolvable_paths() {
        let r = RestoreResolver::new("/home/alice");
        assert_eq!(r.original_location(Path::new("notes.txt")), None);
        assert_eq!(r.original_location(Path::new("laptop/stray/file")), None);
        assert_eq!(r.original_location(Path::new("a/b/c/home/deep")), None);
    }

    #[test]
    fn test_first_marker_wins() {
        let r = RestoreResolver::new("/home/alice");
        assert_eq!(
            r.original_location(Path::new("home/projects/root/x")),
            Some(PathBuf::from("/home/alice/projects/root/x"))
        );
    }

    #[test]
    fn test_discover_walks_files_in_order() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("host/home/.config")).unwrap();
        fs::write(root.join("host/home/.zshrc"), "z").unwrap();
        fs::write(root.join("host/home/.config/starship.toml"), "s").unwrap();
        fs::write(root.join("README"), "r").unwrap();

        let discovery = RestoreResolver::new("/home/alice").discover(root).unwrap();

        let originals: Vec<Option<PathBuf>> = discovery.items.iter().map(|i| i.original.clone()).collect();
        assert_eq!(
            originals,
            vec![
                None,
                Some(PathBuf::from("/home/alice/.config/starship.toml")),
                Some(PathBuf::from("/home/alice/.zshrc")),
            ]
        );
    }

    #[test]
    fn test_discover_missing_root() {
        let tmp = TempDir::new().unwrap();
        let err = RestoreResolver::new("/home/alice")
            .discover(&tmp.path().join("nope"))
            .unwrap_err();
        assert!(matches!(err, BackupError::SourceMissing { .. }));
    }
}
