use colored::*;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

use crate::engine::Observer;
use crate::report::{OperationResult, RunStatus};
use crate::verify::VerificationReport;

pub fn init() {
    // Enable colored output on Windows
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();
}

pub fn info(message: &str) {
    println!("{} {}", style("ℹ").blue(), message);
}

pub fn success(message: &str) {
    println!("{} {}", style("✓").green(), message.green());
}

pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red(), message.red());
}

pub fn warn(message: &str) {
    println!("{} {}", style("⚠").yellow(), message.yellow());
}

pub fn hint(message: &str) {
    println!("{} {}", style("💡").cyan(), message.dimmed());
}

pub fn section(title: &str) {
    println!("\n{}", title.bold().underline());
}

pub fn prompt_confirm(message: &str, default: bool) -> bool {
    dialoguer::Confirm::new()
        .with_prompt(message)
        .default(default)
        .interact()
        .unwrap_or(default)
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths = headers.iter().map(|h| h.len()).collect::<Vec<_>>();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }

    for (i, header) in headers.iter().enumerate() {
        print!("{:width$} ", header.bold(), width = widths[i]);
    }
    println!();

    for width in &widths {
        print!("{} ", "-".repeat(*width).dimmed());
    }
    println!();

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                print!("{:width$} ", cell, width = widths[i]);
            }
        }
        println!();
    }
}

pub fn format_bytes(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Print a finished run the way the CLI shows it: a colored status line,
/// then the summary body.
pub fn print_result(title: &str, result: &OperationResult) {
    match result.status() {
        Some(RunStatus::Success) => success(&format!("{} completed", title)),
        Some(RunStatus::Partial) => warn(&format!("{} partially completed", title)),
        Some(RunStatus::Failed) => error(&format!("{} failed", title)),
        None => info(&format!("{} not finalized", title)),
    }
    for line in result.format_summary().lines() {
        println!("  {}", line);
    }
}

pub fn print_verification(report: &VerificationReport) {
    if report.all_ok() {
        success(&report.summary());
        return;
    }
    warn(&report.summary());
    for record in report.failures() {
        let detail = record
            .error
            .clone()
            .unwrap_or_else(|| record.status.as_str().to_string());
        println!("  {} {}", record.source_path.display(), detail.dimmed());
    }
}

/// Progress bar driven by engine callbacks.
pub struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    pub fn new(message: &str) -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        ProgressObserver { bar }
    }

    /// For `--verbose` runs and non-terminals: no bar, events only go to the log.
    pub fn hidden() -> Self {
        ProgressObserver {
            bar: ProgressBar::hidden(),
        }
    }
}

impl Observer for ProgressObserver {
    fn progress(&self, percent: u8) {
        self.bar.set_position(u64::from(percent));
        if percent >= 100 {
            self.bar.finish_and_clear();
        }
    }

    fn item_processed(&self, source: &Path, _destination: &Path) {
        if let Some(name) = source.file_name() {
            self.bar.set_message(name.to_string_lossy().into_owned());
        }
    }

    fn error(&self, context: &str, message: &str) {
        self.bar.suspend(|| error(&format!("{}: {}", context, message)));
    }
}

impl Drop for ProgressObserver {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}
