use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::archive::ArchiveFormat;
use crate::retention;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub options: Options,

    #[serde(default)]
    pub dotfiles: Vec<DotfileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DotfileEntry {
    #[serde(default)]
    pub category: String,

    pub application: String,

    #[serde(default)]
    pub description: String,

    /// Files or directories, `~` allowed. Missing paths are ignored at
    /// backup time.
    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Options {
    #[serde(default = "default_true")]
    pub mirror: bool,

    #[serde(default)]
    pub archive: bool,

    #[serde(default = "default_true")]
    pub hostname_subdir: bool,

    #[serde(default)]
    pub date_subdir: bool,

    #[serde(default = "default_mirror_dir")]
    pub mirror_dir: String,

    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,

    #[serde(default)]
    pub archive_format: ArchiveFormat,

    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    #[serde(default = "default_true")]
    pub rotate_archives: bool,

    #[serde(default = "default_max_archives")]
    pub max_archives: usize,

    #[serde(default = "default_true")]
    pub pre_restore_backup: bool,

    #[serde(default = "default_max_restore_backups")]
    pub max_restore_backups: usize,

    #[serde(default = "default_restore_backup_dir")]
    pub restore_backup_dir: String,

    #[serde(default = "default_max_config_backups")]
    pub max_config_backups: usize,

    #[serde(default)]
    pub verify_after_backup: bool,

    #[serde(default)]
    pub verify_hash: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            mirror: true,
            archive: false,
            hostname_subdir: true,
            date_subdir: false,
            mirror_dir: default_mirror_dir(),
            archive_dir: default_archive_dir(),
            archive_format: ArchiveFormat::default(),
            compression_level: default_compression_level(),
            rotate_archives: true,
            max_archives: default_max_archives(),
            pre_restore_backup: true,
            max_restore_backups: default_max_restore_backups(),
            restore_backup_dir: default_restore_backup_dir(),
            max_config_backups: default_max_config_backups(),
            verify_after_backup: false,
            verify_hash: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            options: Options::default(),
            dotfiles: default_dotfiles(),
        }
    }
}

impl Config {
    pub fn enabled_entries(&self) -> impl Iterator<Item = &DotfileEntry> {
        self.dotfiles.iter().filter(|entry| entry.enabled)
    }

    /// Application names that appear in more than one entry, in first-seen
    /// order. Entries are never merged; callers report these as warnings.
    pub fn duplicate_applications(&self) -> Vec<String> {
        let mut seen: BTreeMap<String, usize> = BTreeMap::new();
        let mut order = Vec::new();
        for entry in &self.dotfiles {
            let key = entry.application.trim().to_lowercase();
            let count = seen.entry(key).or_insert(0);
            *count += 1;
            if *count == 2 {
                order.push(entry.application.clone());
            }
        }
        order
    }
}

fn default_true() -> bool {
    true
}

fn default_mirror_dir() -> String {
    "~/dotfiles-backup/mirror".to_string()
}

fn default_archive_dir() -> String {
    "~/dotfiles-backup/archives".to_string()
}

fn default_restore_backup_dir() -> String {
    "~/.dotkeep/pre-restore".to_string()
}

fn default_compression_level() -> u32 {
    9
}

fn default_max_archives() -> usize {
    5
}

fn default_max_restore_backups() -> usize {
    5
}

fn default_max_config_backups() -> usize {
    10
}

fn entry(category: &str, application: &str, description: &str, paths: &[&str]) -> DotfileEntry {
    DotfileEntry {
        category: category.to_string(),
        application: application.to_string(),
        description: description.to_string(),
        paths: paths.iter().map(|p| p.to_string()).collect(),
        enabled: true,
    }
}

fn default_dotfiles() -> Vec<DotfileEntry> {
    vec![
        entry("Shell", "Bash", "Bash shell configuration", &["~/.bashrc", "~/.bash_profile", "~/.profile"]),
        entry("Shell", "Zsh", "Zsh shell configuration", &["~/.zshrc", "~/.zprofile"]),
        entry("Version Control", "Git", "Git configuration", &["~/.gitconfig", "~/.gitignore_global"]),
        entry("Editor", "Vim", "Vim configuration", &["~/.vimrc"]),
        entry("Editor", "Neovim", "Neovim configuration", &["~/.config/nvim"]),
        entry("Terminal", "Tmux", "Tmux configuration", &["~/.tmux.conf"]),
        entry("Shell", "Starship", "Starship prompt", &["~/.config/starship.toml"]),
    ]
}

/// `~/.dotkeep/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Failed to find home directory")?
        .join(".dotkeep")
        .join("config.toml"))
}

pub fn init(config_path: &Path, force: bool) -> Result<Config> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let config = Config::default();
    save(config_path, &config)?;
    Ok(config)
}

pub fn load(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        anyhow::bail!(
            "Config not found at {}. Run 'dotkeep init' first.",
            config_path.display()
        );
    }

    let contents = fs::read_to_string(config_path).context("Failed to read config file")?;
    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}

/// Write `config`, first keeping a rotating copy of whatever was there.
/// A failed copy is logged and the save still goes ahead.
pub fn save(config_path: &Path, config: &Config) -> Result<()> {
    let parent = match config_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).context("Failed to create config directory")?;

    if config_path.exists() {
        retention::create_rotating_backup(config_path, config.options.max_config_backups);
    }

    let toml_string = toml::to_string_pretty(config).context("Failed to serialize config")?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).context("Failed to create temporary config file")?;
    tmp.write_all(toml_string.as_bytes())
        .context("Failed to write config file")?;
    tmp.as_file().sync_all().context("Failed to write config file")?;
    tmp.persist(config_path)
        .with_context(|| format!("Failed to write config file {}", config_path.display()))?;
    Ok(())
}

pub fn edit(config_path: &Path) -> Result<()> {
    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    Command::new(editor)
        .arg(config_path)
        .status()
        .context("Failed to open editor")?;

    load(config_path).context("Config is no longer valid after editing")?;
    Ok(())
}
