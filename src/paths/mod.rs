//! Destination path assembly.
//!
//! Backups are laid out as `<base>/[hostname/][date/]{home|root}/<relative>`.
//! Files under the home directory are stored relative to it below `home`;
//! everything else keeps its absolute components below `root`. The restore
//! side reads the same layout back, so the segment order is fixed.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use std::path::{Component, Path, PathBuf};

pub const HOME_MARKER: &str = "home";
pub const ROOT_MARKER: &str = "root";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Resolves source paths into their place in a backup tree.
///
/// The date is captured once when the resolver is built so every item of a
/// run lands under the same date directory.
#[derive(Debug, Clone)]
pub struct PathResolver {
    home: PathBuf,
    hostname: String,
    date: String,
}

impl PathResolver {
    pub fn new(home: impl Into<PathBuf>, hostname: impl Into<String>, date: NaiveDate) -> Self {
        PathResolver {
            home: home.into(),
            hostname: hostname.into(),
            date: date.format(DATE_FORMAT).to_string(),
        }
    }

    /// Resolver for the current user, machine and day.
    pub fn detect() -> Result<Self> {
        let home = dirs::home_dir().context("Failed to find home directory")?;
        Ok(Self::new(home, current_hostname(), Local::now().date_naive()))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    /// Expand a leading `~` to the home directory. Other paths are returned
    /// unchanged; the filesystem is not touched.
    pub fn expand(&self, path: &str) -> PathBuf {
        let home = self.home.to_string_lossy().into_owned();
        let expanded = shellexpand::tilde_with_context(path, || Some(home));
        PathBuf::from(expanded.as_ref())
    }

    /// `home/<relative>` for files below home, `root/<absolute components>`
    /// for everything else.
    pub fn layout_relative(&self, source: &Path) -> PathBuf {
        match source.strip_prefix(&self.home) {
            Ok(rel) => Path::new(HOME_MARKER).join(rel),
            Err(_) => Path::new(ROOT_MARKER).join(strip_root(source)),
        }
    }

    pub fn assemble_destination(
        &self,
        base: &Path,
        source: &Path,
        hostname_subdir: bool,
        date_subdir: bool,
    ) -> PathBuf {
        self.run_root(base, hostname_subdir, date_subdir)
            .join(self.layout_relative(source))
    }

    /// `<base>/[hostname/][date/]`, the directory one run writes into.
    pub fn run_root(&self, base: &Path, hostname_subdir: bool, date_subdir: bool) -> PathBuf {
        let mut dest = base.to_path_buf();
        if hostname_subdir {
            dest.push(&self.hostname);
        }
        if date_subdir {
            dest.push(&self.date);
        }
        dest
    }
}

pub fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Absolute path components without the root or drive prefix separator.
fn strip_root(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => {
                let drive = prefix.as_os_str().to_string_lossy();
                out.push(drive.trim_end_matches(':'));
            }
            Component::RootDir | Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
