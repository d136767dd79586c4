//! Post-run integrity verification.
//!
//! Re-reads each backed up file independently of the copy that produced it.
//! Sizes are always compared; SHA-256 digests only when hashing is enabled.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::report::PathPair;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Ok,
    SizeMismatch,
    HashMismatch,
    Missing,
}

impl VerifyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerifyStatus::Ok => "ok",
            VerifyStatus::SizeMismatch => "size_mismatch",
            VerifyStatus::HashMismatch => "hash_mismatch",
            VerifyStatus::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Mirror,
    Archive,
    Restore,
}

/// Result of comparing one source with its backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCheck {
    pub size_match: bool,
    /// `None` unless hashing is enabled.
    pub hash_match: Option<bool>,
    pub expected_size: Option<u64>,
    pub actual_size: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub source_path: PathBuf,
    pub backup_path: PathBuf,
    pub status: VerifyStatus,
    pub expected_size: Option<u64>,
    pub actual_size: Option<u64>,
    pub size_match: bool,
    pub hash_match: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub backup_root: PathBuf,
    pub backup_type: BackupType,
    pub verified_at: DateTime<Utc>,
    pub hash_enabled: bool,
    pub total: usize,
    pub ok: usize,
    pub size_mismatches: usize,
    pub hash_mismatches: usize,
    pub missing: usize,
    pub bytes_checked: u64,
    pub records: Vec<VerificationRecord>,
}

impl VerificationReport {
    pub fn all_ok(&self) -> bool {
        self.ok == self.total
    }

    pub fn failures(&self) -> impl Iterator<Item = &VerificationRecord> {
        self.records.iter().filter(|r| r.status != VerifyStatus::Ok)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} of {} files verified ({}), {} size mismatches, {} hash mismatches, {} missing",
            self.ok,
            self.total,
            humansize::format_size(self.bytes_checked, humansize::BINARY),
            self.size_mismatches,
            self.hash_mismatches,
            self.missing
        )
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize verification report")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write verification report to {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerificationEngine {
    hash: bool,
}

impl VerificationEngine {
    pub fn new(hash: bool) -> Self {
        VerificationEngine { hash }
    }

    pub fn hashing(&self) -> bool {
        self.hash
    }

    pub fn verify_file(&self, source: &Path, backup: &Path) -> FileCheck {
        let backup_size = match fs::metadata(backup) {
            Ok(meta) => meta.len(),
            Err(e) => {
                return FileCheck::failed(format!(
                    "backup file {} is missing or unreadable: {}",
                    backup.display(),
                    e
                ))
            }
        };

        let source_size = match fs::metadata(source) {
            Ok(meta) => meta.len(),
            Err(_) => {
                let mut check = FileCheck::failed("source no longer exists".to_string());
                check.actual_size = Some(backup_size);
                return check;
            }
        };

        let size_match = source_size == backup_size;
        let mut check = FileCheck {
            size_match,
            hash_match: None,
            expected_size: Some(source_size),
            actual_size: Some(backup_size),
            error: None,
        };

        if self.hash {
            match (hash_file(source), hash_file(backup)) {
                (Ok(a), Ok(b)) => check.hash_match = Some(a == b),
                (Err(e), _) => check.error = Some(format!("failed to hash {}: {}", source.display(), e)),
                (_, Err(e)) => check.error = Some(format!("failed to hash {}: {}", backup.display(), e)),
            }
        }

        check
    }

    /// Verify every pair. Individual I/O problems become `missing` records;
    /// nothing here returns an error.
    pub fn verify_backup(&self, root: &Path, pairs: &[PathPair], backup_type: BackupType) -> VerificationReport {
        let mut report = VerificationReport {
            backup_root: root.to_path_buf(),
            backup_type,
            verified_at: Utc::now(),
            hash_enabled: self.hash,
            total: pairs.len(),
            ok: 0,
            size_mismatches: 0,
            hash_mismatches: 0,
            missing: 0,
            bytes_checked: 0,
            records: Vec::with_capacity(pairs.len()),
        };

        for pair in pairs {
            let check = self.verify_file(&pair.source, &pair.destination);
            let status = check.status();
            match status {
                VerifyStatus::Ok => report.ok += 1,
                VerifyStatus::SizeMismatch => report.size_mismatches += 1,
                VerifyStatus::HashMismatch => report.hash_mismatches += 1,
                VerifyStatus::Missing => report.missing += 1,
            }
            report.bytes_checked += check.actual_size.unwrap_or(0);
            report.records.push(VerificationRecord {
                source_path: pair.source.clone(),
                backup_path: pair.destination.clone(),
                status,
                expected_size: check.expected_size,
                actual_size: check.actual_size,
                size_match: check.size_match,
                hash_match: check.hash_match,
                error: check.error,
            });
        }

        report
    }
}

impl FileCheck {
    fn failed(error: String) -> Self {
        FileCheck {
            size_match: false,
            hash_match: None,
            expected_size: None,
            actual_size: None,
            error: Some(error),
        }
    }

    pub fn status(&self) -> VerifyStatus {
        if self.expected_size.is_none() || self.actual_size.is_none() || self.error.is_some() {
            VerifyStatus::Missing
        } else if !self.size_match {
            VerifyStatus::SizeMismatch
        } else if self.hash_match == Some(false) {
            VerifyStatus::HashMismatch
        } else {
            VerifyStatus::Ok
        }
    }
}

/// Streamed SHA-256 of a file, hex encoded.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}
