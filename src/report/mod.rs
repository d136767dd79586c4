//! Run outcome accounting.
//!
//! An [`OperationResult`] is created empty when a run starts, filled in item by
//! item, and finalized once at the end. Finalizing derives the overall status
//! and the list of items worth retrying.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::errors::{BackupError, ErrorKind};

/// A unit of work: copy `source` to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPair {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl PathPair {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        PathPair {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItem {
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
}

impl FailedItem {
    pub fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedItem {
    pub path: PathBuf,
    pub destination: Option<PathBuf>,
    pub reason: String,
}

/// Aggregate outcome of one mirror, archive or restore run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationResult {
    pub total_items: usize,
    pub completed: Vec<PathPair>,
    pub failed: Vec<FailedItem>,
    pub skipped: Vec<SkippedItem>,
    pub warnings: Vec<String>,
    pub can_retry: Vec<PathBuf>,
    status: Option<RunStatus>,
}

impl OperationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completed(&mut self, pair: PathPair) {
        self.completed.push(pair);
    }

    pub fn record_skipped(
        &mut self,
        path: impl Into<PathBuf>,
        destination: Option<PathBuf>,
        reason: impl Into<String>,
    ) {
        self.skipped.push(SkippedItem {
            path: path.into(),
            destination,
            reason: reason.into(),
        });
    }

    pub fn record_failed(&mut self, path: impl Into<PathBuf>, error: &BackupError) {
        self.failed.push(FailedItem {
            path: path.into(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    pub fn record_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Derive the overall status and the retry list.
    ///
    /// Safe to call more than once; each call recomputes from the recorded
    /// items, so repeated calls agree.
    pub fn finalize(&mut self) -> RunStatus {
        let status = if self.failed.is_empty() {
            RunStatus::Success
        } else if self.completed.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };

        self.can_retry = self
            .failed
            .iter()
            .filter(|item| item.retryable())
            .map(|item| item.path.clone())
            .collect();
        self.status = Some(status);
        status
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_some()
    }

    /// Status as of the last `finalize` call.
    pub fn status(&self) -> Option<RunStatus> {
        self.status
    }

    /// Pairs whose destination holds the source content after the run:
    /// everything copied plus everything skipped as unchanged.
    pub fn verifiable_pairs(&self) -> Vec<PathPair> {
        let mut pairs = self.completed.clone();
        pairs.extend(self.skipped.iter().filter_map(|item| {
            item.destination
                .as_ref()
                .map(|dest| PathPair::new(&item.path, dest))
        }));
        pairs
    }

    pub fn format_summary(&self) -> String {
        let mut out = String::new();
        let status = self.status.map(RunStatus::as_str).unwrap_or("pending");

        let _ = writeln!(out, "Status: {}", status);
        let _ = writeln!(
            out,
            "Total: {}  Completed: {}  Skipped: {}  Failed: {}",
            self.total_items,
            self.completed.len(),
            self.skipped.len(),
            self.failed.len()
        );

        if !self.failed.is_empty() {
            let _ = writeln!(out, "\nFailed items:");
            for item in &self.failed {
                let tag = if item.retryable() { " [retry]" } else { "" };
                let _ = writeln!(
                    out,
                    "  {} ({}){}: {}",
                    item.path.display(),
                    item.kind,
                    tag,
                    item.message
                );
            }
        }

        if !self.skipped.is_empty() {
            let _ = writeln!(out, "\nSkipped items:");
            for item in &self.skipped {
                let _ = writeln!(out, "  {}: {}", item.path.display(), item.reason);
            }
        }

        if !self.warnings.is_empty() {
            let _ = writeln!(out, "\nWarnings:");
            for warning in &self.warnings {
                let _ = writeln!(out, "  {}", warning);
            }
        }

        if !self.can_retry.is_empty() {
            let _ = writeln!(
                out,
                "\n{} items may succeed if retried",
                self.can_retry.len()
            );
        }

        out
    }
}
