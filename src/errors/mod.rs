//! Error taxonomy for the backup engine.
//!
//! Every filesystem failure is classified into one [`ErrorKind`] from a closed
//! set. The kind decides whether a failed item is worth retrying and is carried
//! alongside the path and a human-readable message in [`BackupError`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackupError>;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Permission,
    NotFound,
    AlreadyExists,
    InvalidPath,
    DiskFull,
    ReadOnly,
    Busy,
    Locked,
    TempFailure,
    Timeout,
    SymlinkLoop,
    IoError,
    TooManyFiles,
    Unknown,
}

impl ErrorKind {
    /// Transient conditions that may clear up on a later attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Permission
                | ErrorKind::Locked
                | ErrorKind::Busy
                | ErrorKind::Timeout
                | ErrorKind::TempFailure
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Permission => "permission",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::InvalidPath => "invalid_path",
            ErrorKind::DiskFull => "disk_full",
            ErrorKind::ReadOnly => "read_only",
            ErrorKind::Busy => "busy",
            ErrorKind::Locked => "locked",
            ErrorKind::TempFailure => "temp_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SymlinkLoop => "symlink_loop",
            ErrorKind::IoError => "io_error",
            ErrorKind::TooManyFiles => "too_many_files",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Short human explanation used in summaries.
    pub fn describe(self) -> &'static str {
        match self {
            ErrorKind::Permission => "permission denied",
            ErrorKind::NotFound => "file or directory not found",
            ErrorKind::AlreadyExists => "destination already exists",
            ErrorKind::InvalidPath => "invalid path",
            ErrorKind::DiskFull => "no space left on device",
            ErrorKind::ReadOnly => "read-only file system",
            ErrorKind::Busy => "resource busy",
            ErrorKind::Locked => "file is locked by another process",
            ErrorKind::TempFailure => "temporary failure",
            ErrorKind::Timeout => "operation timed out",
            ErrorKind::SymlinkLoop => "too many levels of symbolic links",
            ErrorKind::IoError => "input/output error",
            ErrorKind::TooManyFiles => "too many open files",
            ErrorKind::Unknown => "unknown error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the backup engine.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("failed to {operation} {}: {}", path.display(), kind.describe())]
    Io {
        kind: ErrorKind,
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk {}: {}", path.display(), kind.describe())]
    Walk {
        kind: ErrorKind,
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("source {} does not exist", path.display())]
    SourceMissing { path: PathBuf },

    #[error("pre-restore backup failed, restore aborted: {source}")]
    PreRestoreFailed {
        #[source]
        source: Box<BackupError>,
    },
}

impl BackupError {
    /// Wrap an io error, classifying it on the way.
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        BackupError::Io {
            kind: categorize(&source),
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn walk(root: &Path, source: walkdir::Error) -> Self {
        let path = source
            .path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        BackupError::Walk {
            kind: categorize_walk(&source),
            path,
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::Io { kind, .. } | BackupError::Walk { kind, .. } => *kind,
            BackupError::SourceMissing { .. } => ErrorKind::NotFound,
            BackupError::PreRestoreFailed { source } => source.kind(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            BackupError::Io { path, .. }
            | BackupError::Walk { path, .. }
            | BackupError::SourceMissing { path } => Some(path),
            BackupError::PreRestoreFailed { source } => source.path(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[cfg(unix)]
mod os_codes {
    use super::ErrorKind;
    use nix::errno::Errno;

    pub(super) static TABLE: &[(Errno, ErrorKind)] = &[
        (Errno::EACCES, ErrorKind::Permission),
        (Errno::EPERM, ErrorKind::Permission),
        (Errno::ENOENT, ErrorKind::NotFound),
        (Errno::EEXIST, ErrorKind::AlreadyExists),
        (Errno::ENOTEMPTY, ErrorKind::AlreadyExists),
        (Errno::EINVAL, ErrorKind::InvalidPath),
        (Errno::ENAMETOOLONG, ErrorKind::InvalidPath),
        (Errno::ENOTDIR, ErrorKind::InvalidPath),
        (Errno::EISDIR, ErrorKind::InvalidPath),
        (Errno::EXDEV, ErrorKind::InvalidPath),
        (Errno::ENOSPC, ErrorKind::DiskFull),
        (Errno::EDQUOT, ErrorKind::DiskFull),
        (Errno::EFBIG, ErrorKind::DiskFull),
        (Errno::EROFS, ErrorKind::ReadOnly),
        (Errno::EBUSY, ErrorKind::Busy),
        (Errno::ETXTBSY, ErrorKind::Busy),
        (Errno::ENOLCK, ErrorKind::Locked),
        (Errno::EDEADLK, ErrorKind::Locked),
        (Errno::EAGAIN, ErrorKind::TempFailure),
        (Errno::EINTR, ErrorKind::TempFailure),
        (Errno::ETIMEDOUT, ErrorKind::Timeout),
        (Errno::ELOOP, ErrorKind::SymlinkLoop),
        (Errno::EIO, ErrorKind::IoError),
        (Errno::EMFILE, ErrorKind::TooManyFiles),
        (Errno::ENFILE, ErrorKind::TooManyFiles),
    ];

    pub(super) fn lookup(code: i32) -> Option<ErrorKind> {
        TABLE
            .iter()
            .find(|(errno, _)| *errno as i32 == code)
            .map(|(_, kind)| *kind)
    }
}

#[cfg(windows)]
mod os_codes {
    use super::ErrorKind;

    // Win32 system error codes.
    pub(super) static TABLE: &[(i32, ErrorKind)] = &[
        (5, ErrorKind::Permission),     // ERROR_ACCESS_DENIED
        (2, ErrorKind::NotFound),       // ERROR_FILE_NOT_FOUND
        (3, ErrorKind::NotFound),       // ERROR_PATH_NOT_FOUND
        (80, ErrorKind::AlreadyExists), // ERROR_FILE_EXISTS
        (183, ErrorKind::AlreadyExists), // ERROR_ALREADY_EXISTS
        (123, ErrorKind::InvalidPath),  // ERROR_INVALID_NAME
        (206, ErrorKind::InvalidPath),  // ERROR_FILENAME_EXCED_RANGE
        (112, ErrorKind::DiskFull),     // ERROR_DISK_FULL
        (39, ErrorKind::DiskFull),      // ERROR_HANDLE_DISK_FULL
        (19, ErrorKind::ReadOnly),      // ERROR_WRITE_PROTECT
        (170, ErrorKind::Busy),         // ERROR_BUSY
        (32, ErrorKind::Locked),        // ERROR_SHARING_VIOLATION
        (33, ErrorKind::Locked),        // ERROR_LOCK_VIOLATION
        (1460, ErrorKind::Timeout),     // ERROR_TIMEOUT
        (1921, ErrorKind::SymlinkLoop), // ERROR_CANT_RESOLVE_FILENAME
        (1117, ErrorKind::IoError),     // ERROR_IO_DEVICE
        (4, ErrorKind::TooManyFiles),   // ERROR_TOO_MANY_OPEN_FILES
    ];

    pub(super) fn lookup(code: i32) -> Option<ErrorKind> {
        TABLE
            .iter()
            .find(|(known, _)| *known == code)
            .map(|(_, kind)| *kind)
    }
}

#[cfg(not(any(unix, windows)))]
mod os_codes {
    use super::ErrorKind;

    pub(super) fn lookup(_code: i32) -> Option<ErrorKind> {
        None
    }
}

/// Map an io error to its [`ErrorKind`].
///
/// The OS error code is consulted first, then the portable `io::ErrorKind`,
/// then the message text for errors that carry neither.
pub fn categorize(err: &io::Error) -> ErrorKind {
    if let Some(kind) = err.raw_os_error().and_then(os_codes::lookup) {
        return kind;
    }

    let by_kind = match err.kind() {
        io::ErrorKind::PermissionDenied => Some(ErrorKind::Permission),
        io::ErrorKind::NotFound => Some(ErrorKind::NotFound),
        io::ErrorKind::AlreadyExists => Some(ErrorKind::AlreadyExists),
        io::ErrorKind::InvalidInput => Some(ErrorKind::InvalidPath),
        io::ErrorKind::TimedOut => Some(ErrorKind::Timeout),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Some(ErrorKind::TempFailure),
        io::ErrorKind::WriteZero | io::ErrorKind::UnexpectedEof => Some(ErrorKind::IoError),
        _ => None,
    };
    if let Some(kind) = by_kind {
        return kind;
    }

    if let Some(kind) = categorize_message(&err.to_string()) {
        return kind;
    }

    if err.raw_os_error().is_some() {
        ErrorKind::IoError
    } else {
        ErrorKind::Unknown
    }
}

/// Classify a walkdir error. Loops are detected by walkdir itself and carry no
/// io error.
pub fn categorize_walk(err: &walkdir::Error) -> ErrorKind {
    if err.loop_ancestor().is_some() {
        return ErrorKind::SymlinkLoop;
    }
    err.io_error().map(categorize).unwrap_or(ErrorKind::Unknown)
}

static MESSAGE_PATTERNS: &[(&str, ErrorKind)] = &[
    ("permission denied", ErrorKind::Permission),
    ("access is denied", ErrorKind::Permission),
    ("operation not permitted", ErrorKind::Permission),
    ("no space left", ErrorKind::DiskFull),
    ("disk full", ErrorKind::DiskFull),
    ("quota exceeded", ErrorKind::DiskFull),
    ("read-only file system", ErrorKind::ReadOnly),
    ("too many levels of symbolic links", ErrorKind::SymlinkLoop),
    ("symlink loop", ErrorKind::SymlinkLoop),
    ("too many open files", ErrorKind::TooManyFiles),
    ("resource busy", ErrorKind::Busy),
    ("being used by another process", ErrorKind::Locked),
    ("locked", ErrorKind::Locked),
    ("timed out", ErrorKind::Timeout),
    ("temporarily unavailable", ErrorKind::TempFailure),
    ("already exists", ErrorKind::AlreadyExists),
    ("no such file", ErrorKind::NotFound),
    ("not found", ErrorKind::NotFound),
    ("file name too long", ErrorKind::InvalidPath),
    ("invalid", ErrorKind::InvalidPath),
    ("input/output error", ErrorKind::IoError),
];

fn categorize_message(message: &str) -> Option<ErrorKind> {
    let lower = message.to_lowercase();
    MESSAGE_PATTERNS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, kind)| *kind)
}
