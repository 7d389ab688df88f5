//! The error taxonomy used across the crate.
//!
//! Errors are grouped into three tiers, matching how callers are expected
//! to react to them rather than what failed mechanically:
//!
//! - [`FatalKind`] aborts the current call and any enclosing multi-item
//!   operation. A session that observes one of these must be closed with
//!   `abort = true`.
//! - [`ItemErrorKind`] is recoverable: the caller counts it, attaches it to
//!   the operation's statistics, and continues with the next item.
//! - [`ExternalKind`] wraps failures from outside the crate's control
//!   (I/O, permissions, "this path isn't even a famfs mount").

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Top-level error type returned by public entry points.
#[derive(Debug)]
pub enum FamfsError {
    /// Aborts the enclosing operation; the session must close with `abort = true`.
    Fatal(FatalKind),
    /// Recoverable: counted and reported, operation continues.
    PerItem(ItemErrorKind),
    /// A failure originating outside this crate's own invariants.
    External(ExternalKind),
}

#[derive(Debug)]
pub enum FatalKind {
    /// The bitmap has no run of free bits long enough for the request.
    NoSpace,
    /// `next_index > last_index`; the log cannot accept more entries.
    LogFull,
    /// `check_super` returned anything other than `Ok`.
    InvalidSuperblock(SuperblockProblem),
    /// Bad log magic or a header CRC mismatch.
    InvalidLogHeader,
    /// A client attempted a mutation reserved for the master.
    RoleMismatch,
    /// The on-media format version doesn't match this build.
    VersionMismatch { found: u64, expected: u64 },
    /// `.meta/.alloc.cfg` or a caller-supplied interleave configuration
    /// failed validation (bucket count, chunk size, bucket size floor).
    InterleaveConfig(String),
    /// `pcq_put` in `NoWait` mode found the queue full.
    QueueFull,
    /// `pcq_get` in `NoWait` mode found the queue empty.
    QueueEmpty,
    /// A PCQ bucket failed CRC/sequence validation even after the
    /// retries `get` allows; a coherence violation, not staleness.
    QueueCorrupt { bucket: u64 },
    /// A non-blocking `session_open` found the log already locked by
    /// another writer session.
    WouldBlock,
}

#[derive(Debug)]
pub enum SuperblockProblem {
    BadMagic,
    BadCrc,
    UnsupportedAllocUnit(u64),
}

#[derive(Debug)]
pub enum ItemErrorKind {
    /// `mkfile` target already exists with a different size than requested.
    FileExistsWrongSize { path: PathBuf, existing: u64, requested: u64 },
    /// A logged relpath was absolute or escaped the mount root.
    PathNotRelative(PathBuf),
    /// A file-map extent had offset 0, which aliases the superblock.
    ExtentOffsetZero,
    /// A log entry's CRC didn't validate, even after a retry.
    BadEntryCrc { index: u64 },
    /// `parse(emit(meta)) != meta`.
    YamlMismatch { path: PathBuf },
    /// A logged `MKDIR` relpath already exists but isn't a directory.
    NotADirectory(PathBuf),
}

#[derive(Debug)]
pub enum ExternalKind {
    Io(io::Error),
    PermissionDenied(PathBuf),
    /// The path resolved to a real mount, but not a famfs or FUSE-famfs one.
    NotFamfs(PathBuf),
    Yaml(serde_yaml::Error),
}

impl fmt::Display for FamfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FamfsError::Fatal(k) => write!(f, "fatal: {k}"),
            FamfsError::PerItem(k) => write!(f, "item error: {k}"),
            FamfsError::External(k) => write!(f, "external error: {k}"),
        }
    }
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalKind::NoSpace => write!(f, "no space"),
            FatalKind::LogFull => write!(f, "log full"),
            FatalKind::InvalidSuperblock(p) => write!(f, "invalid superblock ({p})"),
            FatalKind::InvalidLogHeader => write!(f, "invalid log header"),
            FatalKind::RoleMismatch => write!(f, "role mismatch (not master)"),
            FatalKind::VersionMismatch { found, expected } => {
                write!(f, "version mismatch (found {found}, expected {expected})")
            }
            FatalKind::InterleaveConfig(reason) => write!(f, "bad interleave config: {reason}"),
            FatalKind::QueueFull => write!(f, "pcq: queue full"),
            FatalKind::QueueEmpty => write!(f, "pcq: queue empty"),
            FatalKind::QueueCorrupt { bucket } => {
                write!(f, "pcq: bucket {bucket} failed validation after retries")
            }
            FatalKind::WouldBlock => write!(f, "session open would block (log already locked)"),
        }
    }
}

impl fmt::Display for SuperblockProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuperblockProblem::BadMagic => write!(f, "bad magic"),
            SuperblockProblem::BadCrc => write!(f, "bad crc"),
            SuperblockProblem::UnsupportedAllocUnit(u) => {
                write!(f, "unsupported alloc_unit {u}")
            }
        }
    }
}

impl fmt::Display for ItemErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemErrorKind::FileExistsWrongSize { path, existing, requested } => write!(
                f,
                "{} exists with size {existing}, requested {requested}",
                path.display()
            ),
            ItemErrorKind::PathNotRelative(p) => write!(f, "path not relative: {}", p.display()),
            ItemErrorKind::ExtentOffsetZero => write!(f, "extent offset 0 aliases superblock"),
            ItemErrorKind::BadEntryCrc { index } => write!(f, "bad entry crc at index {index}"),
            ItemErrorKind::YamlMismatch { path } => {
                write!(f, "shadow yaml round-trip mismatch: {}", path.display())
            }
            ItemErrorKind::NotADirectory(p) => {
                write!(f, "exists and is not a directory: {}", p.display())
            }
        }
    }
}

impl fmt::Display for ExternalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalKind::Io(e) => write!(f, "io error: {e}"),
            ExternalKind::PermissionDenied(p) => {
                write!(f, "permission denied: {}", p.display())
            }
            ExternalKind::NotFamfs(p) => write!(f, "not a famfs mount: {}", p.display()),
            ExternalKind::Yaml(e) => write!(f, "yaml error: {e}"),
        }
    }
}

impl std::error::Error for FamfsError {}

impl From<io::Error> for FamfsError {
    fn from(e: io::Error) -> Self {
        FamfsError::External(ExternalKind::Io(e))
    }
}

impl From<serde_yaml::Error> for FamfsError {
    fn from(e: serde_yaml::Error) -> Self {
        FamfsError::External(ExternalKind::Yaml(e))
    }
}

impl FamfsError {
    /// Fatal errors force the session closed with `abort = true`; everything
    /// else is safe to keep the session open and continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FamfsError::Fatal(_))
    }
}
