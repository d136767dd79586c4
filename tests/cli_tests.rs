use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn dotkeep(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("dotkeep").unwrap();
    cmd.env("HOME", home).env_remove("DOTKEEP_CONFIG").env_remove("RUST_LOG");
    cmd
}

/// Temp home with a couple of dotfiles and a config that mirrors them into
/// `<tmp>/backup` without a hostname directory.
fn setup() -> (TempDir, std::path::PathBuf) {
    let tmp = TempDir::new().unwrap();
    let home = tmp.path().join("home");
    fs::create_dir_all(home.join(".config/git")).unwrap();
    fs::write(home.join(".bashrc"), "export EDITOR=vim\n").unwrap();
    fs::write(home.join(".config/git/config"), "[user]\n\tname = test\n").unwrap();

    let config = format!(
        r#"
[options]
mirror = true
archive = false
hostname_subdir = false
mirror_dir = "{mirror}"
archive_dir = "{archives}"
restore_backup_dir = "{snapshots}"

[[dotfiles]]
category = "Shell"
application = "Bash"
paths = ["~/.bashrc", "~/.bash_profile"]

[[dotfiles]]
category = "Version Control"
application = "Git"
paths = ["~/.config/git"]
"#,
        mirror = tmp.path().join("backup").display(),
        archives = tmp.path().join("archives").display(),
        snapshots = tmp.path().join("snapshots").display(),
    );
    let config_path = tmp.path().join("config.toml");
    fs::write(&config_path, config).unwrap();
    (tmp, home)
}

#[test]
fn test_help_command() {
    let mut cmd = Command::cargo_bin("dotkeep").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("back up and restore your dotfiles"));
}

#[test]
fn test_version_command() {
    let mut cmd = Command::cargo_bin("dotkeep").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("dotkeep"));
}

#[test]
fn test_init_command() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");

    dotkeep(temp_dir.path())
        .arg("init")
        .arg("--config")
        .arg(&config_path)
        .assert()
        .success();

    let content = fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("[options]"));
    assert!(content.contains("[[dotfiles]]"));
    assert!(content.contains("archive_format = \"tar.gz\""));
}

#[test]
fn test_init_fails_when_config_exists() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "test").unwrap();

    dotkeep(temp_dir.path())
        .arg("init")
        .arg("--config")
        .arg(&config_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_init_force_keeps_backup_of_old_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "old = true\n").unwrap();

    dotkeep(temp_dir.path())
        .args(["init", "--force", "--config"])
        .arg(&config_path)
        .assert()
        .success();

    let backups: Vec<_> = fs::read_dir(temp_dir.path().join(".config.toml.backups"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(fs::read_to_string(&backups[0]).unwrap(), "old = true\n");
}

#[test]
fn test_backup_without_config_fails() {
    let temp_dir = TempDir::new().unwrap();

    dotkeep(temp_dir.path())
        .arg("backup")
        .arg("--config")
        .arg(temp_dir.path().join("missing.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("dotkeep init"));
}

#[cfg(unix)]
#[test]
fn test_mirror_backup_and_verify() {
    let (tmp, home) = setup();
    let config_path = tmp.path().join("config.toml");

    dotkeep(&home)
        .args(["backup", "--mirror-only", "--verify", "--hash", "--config"])
        .arg(&config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Mirror backup completed"));

    let mirror = tmp.path().join("backup/home");
    assert_eq!(
        fs::read_to_string(mirror.join(".bashrc")).unwrap(),
        "export EDITOR=vim\n"
    );
    assert!(mirror.join(".config/git/config").exists());

    let report = tmp.path().join("verify.json");
    dotkeep(&home)
        .args(["verify", "--report"])
        .arg(&report)
        .arg("--config")
        .arg(&config_path)
        .assert()
        .success();
    let json = fs::read_to_string(&report).unwrap();
    assert!(json.contains("\"backup_type\": \"mirror\""));
}

#[cfg(unix)]
#[test]
fn test_verify_detects_changed_file() {
    let (tmp, home) = setup();
    let config_path = tmp.path().join("config.toml");

    dotkeep(&home)
        .args(["backup", "--config"])
        .arg(&config_path)
        .assert()
        .success();
    fs::write(home.join(".bashrc"), "export EDITOR=nvim\nalias g=git\n").unwrap();

    dotkeep(&home)
        .args(["verify", "--config"])
        .arg(&config_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed verification"));
}

#[cfg(unix)]
#[test]
fn test_restore_round_trip_with_snapshot() {
    let (tmp, home) = setup();
    let config_path = tmp.path().join("config.toml");

    dotkeep(&home)
        .args(["backup", "--config"])
        .arg(&config_path)
        .assert()
        .success();
    fs::write(home.join(".bashrc"), "clobbered").unwrap();

    dotkeep(&home)
        .args(["restore", "--yes", "--config"])
        .arg(&config_path)
        .arg(tmp.path().join("backup"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Restore completed"));

    assert_eq!(
        fs::read_to_string(home.join(".bashrc")).unwrap(),
        "export EDITOR=vim\n"
    );

    let snapshots: Vec<_> = fs::read_dir(tmp.path().join("snapshots")).unwrap().collect();
    assert_eq!(snapshots.len(), 1);

    dotkeep(&home)
        .args(["snapshots", "--config"])
        .arg(&config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("pre-restore-"));
}

#[cfg(unix)]
#[test]
fn test_restore_missing_backup_root_fails() {
    let (tmp, home) = setup();
    let config_path = tmp.path().join("config.toml");

    dotkeep(&home)
        .args(["restore", "--yes", "--config"])
        .arg(&config_path)
        .arg(tmp.path().join("nope"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[cfg(unix)]
#[test]
fn test_archive_only_backup() {
    let (tmp, home) = setup();
    let config_path = tmp.path().join("config.toml");

    dotkeep(&home)
        .args(["backup", "--archive-only", "--config"])
        .arg(&config_path)
        .assert()
        .success();

    let archives: Vec<String> = fs::read_dir(tmp.path().join("archives"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(archives.len(), 1);
    assert!(archives[0].starts_with("dotfiles-") && archives[0].ends_with(".tar.gz"));
    assert!(!tmp.path().join("backup").exists());
}

#[cfg(unix)]
#[test]
fn test_list_warns_about_duplicates() {
    let (tmp, home) = setup();
    let config_path = tmp.path().join("config.toml");
    let mut config = fs::read_to_string(&config_path).unwrap();
    config.push_str("\n[[dotfiles]]\napplication = \"Git\"\npaths = [\"~/.gitconfig\"]\n");
    fs::write(&config_path, config).unwrap();

    dotkeep(&home)
        .args(["list", "--config"])
        .arg(&config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Bash"))
        .stdout(predicate::str::contains("configured more than once"));
}

#[test]
fn test_mirror_only_conflicts_with_archive_only() {
    let temp_dir = TempDir::new().unwrap();

    dotkeep(temp_dir.path())
        .args(["backup", "--mirror-only", "--archive-only"])
        .assert()
        .failure();
}
