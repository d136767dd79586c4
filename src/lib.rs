//! Dotkeep - dotfiles backup and restore.
//!
//! This library provides:
//! - Mirror backups that only copy what changed
//! - Compressed, rotated archive backups
//! - Restores with a safety snapshot of everything about to be overwritten
//! - Post-run verification by size and optional SHA-256
//! - Classified, retry-aware error reporting

pub mod archive;
pub mod cfg;
pub mod engine;
pub mod errors;
pub mod paths;
pub mod report;
pub mod restore;
pub mod retention;
pub mod snapshots;
pub mod sync;
pub mod ui;
pub mod verify;
