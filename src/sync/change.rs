//! Size + mtime heuristic used to skip redundant copies.
//!
//! Content is never hashed here; that is left to verification after a run.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Modification times closer than this count as equal. Covers filesystems
/// that store coarse timestamps.
pub const MTIME_TOLERANCE: Duration = Duration::from_secs(1);

/// True when `dest` already looks like a copy of `source`.
///
/// Any metadata error counts as "different" so the caller falls back to
/// copying.
pub fn files_are_identical(source: &Path, dest: &Path) -> bool {
    let (src_meta, dest_meta) = match (fs::metadata(source), fs::metadata(dest)) {
        (Ok(s), Ok(d)) => (s, d),
        _ => return false,
    };

    if !dest_meta.is_file() || src_meta.len() != dest_meta.len() {
        return false;
    }

    match (src_meta.modified(), dest_meta.modified()) {
        (Ok(src_time), Ok(dest_time)) => within_tolerance(src_time, dest_time),
        _ => false,
    }
}

fn within_tolerance(a: SystemTime, b: SystemTime) -> bool {
    let delta = a
        .duration_since(b)
        .or_else(|_| b.duration_since(a))
        .unwrap_or(Duration::MAX);
    delta < MTIME_TOLERANCE
}
