use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use dotkeep::cfg::{self, Config};
use dotkeep::engine::{Observer, Orchestrator};
use dotkeep::paths::PathResolver;
use dotkeep::report::RunStatus;
use dotkeep::snapshots::SnapshotStore;
use dotkeep::ui;
use dotkeep::verify::{BackupType, VerificationEngine};

/// Dotkeep - back up and restore your dotfiles
#[derive(Parser)]
#[command(name = "dotkeep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file (defaults to ~/.dotkeep/config.toml)
    #[arg(long, global = true, env = "DOTKEEP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration
    Init {
        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Back up enabled dotfiles to the mirror and/or an archive
    Backup {
        /// Only update the mirror
        #[arg(long, conflicts_with = "archive_only")]
        mirror_only: bool,

        /// Only create an archive
        #[arg(long)]
        archive_only: bool,

        /// Verify the mirror afterwards
        #[arg(long)]
        verify: bool,

        /// Compare SHA-256 digests when verifying
        #[arg(long)]
        hash: bool,
    },

    /// Restore files from a backup tree
    Restore {
        /// Mirror directory or extracted archive to restore from
        backup_root: PathBuf,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Skip the pre-restore safety snapshot
        #[arg(long)]
        no_safety_backup: bool,
    },

    /// Check the mirror against the live files
    Verify {
        /// Compare SHA-256 digests as well as sizes
        #[arg(long)]
        hash: bool,

        /// Write a JSON report to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// List configured dotfile entries
    List,

    /// List pre-restore snapshots
    Snapshots,

    /// Edit or view configuration
    Config {
        /// Open config in editor
        #[arg(long)]
        edit: bool,

        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("dotkeep=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .without_time()
        .with_target(false)
        .try_init();
}

fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose);
    ui::init();

    if let Err(e) = run(cli) {
        ui::error(&format!("Error: {:#}", e));
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => cfg::default_config_path()?,
    };

    match cli.command {
        Commands::Init { force } => cmd_init(&config_path, force),
        Commands::Backup {
            mirror_only,
            archive_only,
            verify,
            hash,
        } => cmd_backup(&config_path, mirror_only, archive_only, verify, hash, cli.verbose),
        Commands::Restore {
            backup_root,
            yes,
            no_safety_backup,
        } => cmd_restore(&config_path, &backup_root, yes, no_safety_backup, cli.verbose),
        Commands::Verify { hash, report } => cmd_verify(&config_path, hash, report.as_deref()),
        Commands::List => cmd_list(&config_path),
        Commands::Snapshots => cmd_snapshots(&config_path),
        Commands::Config { edit, show } => cmd_config(&config_path, edit, show),
    }
}

fn load_config(config_path: &Path) -> Result<Config> {
    let config = cfg::load(config_path)?;
    for name in config.duplicate_applications() {
        ui::warn(&format!(
            "Application '{}' is configured more than once; each entry is backed up separately",
            name
        ));
    }
    Ok(config)
}

fn observer(verbose: bool, message: &str) -> Box<dyn Observer> {
    if verbose {
        Box::new(ui::ProgressObserver::hidden())
    } else {
        Box::new(ui::ProgressObserver::new(message))
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    ui::info("Initializing dotkeep...");
    let config = cfg::init(config_path, force)?;
    ui::success(&format!("Wrote {}", config_path.display()));
    ui::info(&format!("{} dotfile entries configured", config.dotfiles.len()));
    ui::hint("Edit the config with 'dotkeep config --edit', then run 'dotkeep backup'");
    Ok(())
}

fn cmd_backup(
    config_path: &Path,
    mirror_only: bool,
    archive_only: bool,
    verify: bool,
    hash: bool,
    verbose: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let options = config.options.clone();
    let resolver = PathResolver::detect()?;

    let run_mirror = !archive_only && (mirror_only || options.mirror);
    let run_archive = !mirror_only && (archive_only || options.archive);
    if !run_mirror && !run_archive {
        ui::warn("Neither mirror nor archive backups are enabled");
        ui::hint("Set options.mirror or options.archive in the config, or pass --mirror-only / --archive-only");
        return Ok(());
    }

    let mut failed = false;

    if run_mirror {
        ui::section("Mirror backup");
        let mut orchestrator = Orchestrator::new(config.dotfiles.clone(), options.clone(), resolver.clone())
            .with_observer(observer(verbose, "mirroring"));
        let result = orchestrator.execute_mirror_backup();
        ui::print_result("Mirror backup", &result);
        ui::info(&format!("Mirror: {}", orchestrator.mirror_root().display()));
        failed |= result.status() == Some(RunStatus::Failed);

        if verify || options.verify_after_backup {
            let report = orchestrator.verify_mirror(&result, hash || options.verify_hash);
            ui::print_verification(&report);
            failed |= !report.all_ok();
        }
    }

    if run_archive {
        ui::section("Archive backup");
        let mut orchestrator = Orchestrator::new(config.dotfiles.clone(), options.clone(), resolver)
            .with_observer(observer(verbose, "archiving"));
        let outcome = orchestrator.execute_archive_backup();
        ui::print_result("Archive backup", &outcome.result);
        match &outcome.archive {
            Some(path) => ui::success(&format!("Archive: {}", path.display())),
            None => ui::info("No archive written"),
        }
        for path in &outcome.rotated {
            println!("  {} {}", "rotated out".dimmed(), path.display());
        }
        failed |= outcome.result.status() == Some(RunStatus::Failed);
    }

    if failed {
        anyhow::bail!("backup did not complete successfully");
    }
    Ok(())
}

fn cmd_restore(
    config_path: &Path,
    backup_root: &Path,
    yes: bool,
    no_safety_backup: bool,
    verbose: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let options = &config.options;
    let resolver = PathResolver::detect()?;

    if !yes {
        let confirm = ui::prompt_confirm(
            &format!(
                "Restore files from {}? Existing files will be overwritten.",
                backup_root.display()
            ),
            false,
        );
        if !confirm {
            ui::info("Restore cancelled");
            return Ok(());
        }
    }

    let store = SnapshotStore::new(
        resolver.expand(&options.restore_backup_dir),
        options.max_restore_backups,
        options.pre_restore_backup && !no_safety_backup,
    );

    let mut orchestrator = Orchestrator::new(config.dotfiles.clone(), options.clone(), resolver)
        .with_observer(observer(verbose, "restoring"))
        .with_pre_restore(Box::new(store));

    let outcome = orchestrator
        .execute_restore(backup_root)
        .with_context(|| format!("Failed to restore from {}", backup_root.display()))?;

    if let Some(snapshot) = &outcome.snapshot {
        ui::info(&format!("Previous files saved to {}", snapshot.display()));
    }
    ui::print_result("Restore", &outcome.result);

    if outcome.result.status() == Some(RunStatus::Failed) {
        anyhow::bail!("restore did not complete successfully");
    }
    Ok(())
}

fn cmd_verify(config_path: &Path, hash: bool, report_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let resolver = PathResolver::detect()?;
    let orchestrator = Orchestrator::new(config.dotfiles.clone(), config.options.clone(), resolver);

    let pairs = orchestrator.mirror_pairs();
    let engine = VerificationEngine::new(hash || config.options.verify_hash);
    let report = engine.verify_backup(&orchestrator.mirror_root(), &pairs, BackupType::Mirror);

    ui::print_verification(&report);
    if let Some(path) = report_path {
        report.save(path)?;
        ui::info(&format!("Report written to {}", path.display()));
    }

    if !report.all_ok() {
        anyhow::bail!("{} of {} files failed verification", report.total - report.ok, report.total);
    }
    Ok(())
}

fn cmd_list(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let resolver = PathResolver::detect()?;

    let rows = config
        .dotfiles
        .iter()
        .map(|entry| {
            let present = entry
                .paths
                .iter()
                .filter(|p| resolver.expand(p).exists())
                .count();
            vec![
                entry.application.clone(),
                entry.category.clone(),
                if entry.enabled { "yes".to_string() } else { "no".to_string() },
                format!("{}/{}", present, entry.paths.len()),
            ]
        })
        .collect();

    ui::print_table(&["Application", "Category", "Enabled", "Present"], rows);
    Ok(())
}

fn cmd_snapshots(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let resolver = PathResolver::detect()?;
    let store = SnapshotStore::new(
        resolver.expand(&config.options.restore_backup_dir),
        config.options.max_restore_backups,
        config.options.pre_restore_backup,
    );

    let snapshots = store.list()?;
    if snapshots.is_empty() {
        ui::info("No snapshots found");
        return Ok(());
    }

    let rows = snapshots
        .iter()
        .map(|snap| {
            vec![
                snap.id.clone(),
                snap.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                snap.file_count.to_string(),
                ui::format_bytes(snap.size_bytes),
            ]
        })
        .collect();
    ui::print_table(&["Snapshot", "Created", "Files", "Size"], rows);
    ui::hint(&format!(
        "Undo a restore with 'dotkeep restore {}'",
        store.path_of(&snapshots[0].id).display()
    ));
    Ok(())
}

fn cmd_config(config_path: &Path, edit: bool, show: bool) -> Result<()> {
    if edit {
        cfg::edit(config_path)?;
        ui::success("Configuration edited");
    } else if show {
        let config = cfg::load(config_path)?;
        println!("{}", toml::to_string_pretty(&config)?);
    } else {
        ui::hint("Use --edit to modify or --show to view the configuration");
    }

    Ok(())
}
