//! Log replay: turning the append-only log into filesystem state.
//!
//! Replay runs in two modes. [`Mode::Live`] is what a mounted client or
//! master runs continuously, applying newly-appended entries to real
//! inodes. [`Mode::Shadow`] is what `fsck` and `logplay --shadow` run:
//! entries are folded into an in-memory tree and emitted as shadow YAML
//! (see [`crate::shadow`]) instead of touching any real filesystem.
//! Replay is idempotent in both modes: re-replaying the same prefix of
//! the log never changes the resulting state.

use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, warn};

use crate::error::{FamfsError, ItemErrorKind};
use crate::log::Log;
use crate::mapping::{validate_for_abi, FileType, MapAbiVersion, MapRequest, MappingInstaller};
use crate::meta::{bytes_to_relpath, ExtType, FileFlags, LogEntryType, RawFileMeta, RawMkdirMeta};

/// Whether this host owns the log (may append) or only follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Client,
}

/// Live replay touches real files; shadow replay only updates an
/// in-memory tree, for tooling that never opens the DAX device itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Live,
    Shadow,
}

/// Aggregate replay statistics, returned to the caller after a pass over
/// the log. The basis for `fsck`'s summary. Fields beyond
/// `entries_processed`/`bad_entries`/`*_logged`/`bytes_logged` are only
/// populated by [`materialize`] (i.e. by [`replay`], not by bare
/// [`logplay`]): a dry-run shadow fold has nothing to create or find
/// pre-existing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub entries_processed: u64,
    pub bad_entries: u64,
    pub files_logged: u64,
    pub dirs_logged: u64,
    pub bytes_logged: u64,
    pub files_created: u64,
    pub files_existed: u64,
    pub dirs_created: u64,
    pub dirs_existed: u64,
    pub file_errs: u64,
    pub dir_errs: u64,
    pub yaml_errs: u64,
    pub yaml_checked: u64,
}

/// One node of the replayed tree, enough to drive both the shadow YAML
/// codec and live filesystem application.
#[derive(Debug, Clone)]
pub enum ReplayedNode {
    File(ReplayedFile),
    Dir(ReplayedDir),
}

#[derive(Debug, Clone)]
pub struct ReplayedFile {
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub flags: FileFlags,
    pub fmap: crate::meta::RawFmap,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayedDir {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// The replayed namespace: relpath -> node, in log order, so that a later
/// entry for the same relpath simply overwrites the earlier one. This is
/// what makes re-replay idempotent.
#[derive(Debug, Clone, Default)]
pub struct ReplayedTree {
    pub nodes: BTreeMap<String, ReplayedNode>,
}

impl ReplayedTree {
    pub fn file(&self, relpath: &str) -> Option<&ReplayedFile> {
        match self.nodes.get(relpath) {
            Some(ReplayedNode::File(f)) => Some(f),
            _ => None,
        }
    }

    pub fn dir(&self, relpath: &str) -> Option<&ReplayedDir> {
        match self.nodes.get(relpath) {
            Some(ReplayedNode::Dir(d)) => Some(d),
            _ => None,
        }
    }
}

/// Rejects an absolute relpath or one with a `..` path component. A
/// substring check on `".."` would also reject legitimate names like
/// `a..b`; only an actual parent-dir component escapes the mount root.
fn relpath_is_safe(relpath: &str) -> bool {
    if relpath.starts_with('/') {
        return false;
    }
    !Path::new(relpath).components().any(|c| c == std::path::Component::ParentDir)
}

/// Applies one validated file-meta entry to the tree. Split out of
/// [`replay`] so live callers (which additionally create a real inode)
/// and shadow callers share the exact same bookkeeping.
fn apply_file(tree: &mut ReplayedTree, meta: &RawFileMeta, stats: &mut Stats) -> Result<(), FamfsError> {
    let relpath = bytes_to_relpath(&meta.relpath);
    if !relpath_is_safe(&relpath) {
        return Err(FamfsError::PerItem(ItemErrorKind::PathNotRelative(relpath.into())));
    }
    if meta.fmap.simple_extents().iter().any(|e| e.offset == 0) {
        return Err(FamfsError::PerItem(ItemErrorKind::ExtentOffsetZero));
    }

    stats.files_logged += 1;
    stats.bytes_logged += meta.size;
    tree.nodes.insert(
        relpath,
        ReplayedNode::File(ReplayedFile {
            size: meta.size,
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            flags: meta.file_flags(),
            fmap: meta.fmap,
        }),
    );
    Ok(())
}

fn apply_mkdir(tree: &mut ReplayedTree, meta: &RawMkdirMeta, stats: &mut Stats) -> Result<(), FamfsError> {
    let relpath = bytes_to_relpath(&meta.relpath);
    if !relpath_is_safe(&relpath) {
        return Err(FamfsError::PerItem(ItemErrorKind::PathNotRelative(relpath.into())));
    }

    stats.dirs_logged += 1;
    tree.nodes.insert(
        relpath,
        ReplayedNode::Dir(ReplayedDir { mode: meta.mode, uid: meta.uid, gid: meta.gid }),
    );
    Ok(())
}

/// `logplay(log, mode)`: processes every valid entry from `0` through the
/// log's `next_index`, building a [`ReplayedTree`] and [`Stats`]. Per-item
/// errors are counted in `stats.bad_entries` and skipped; the pass never
/// aborts on one bad entry, matching the error-taxonomy split between
/// fatal and per-item failures.
pub fn logplay(log: &Log, _mode: Mode) -> (ReplayedTree, Stats) {
    let mut tree = ReplayedTree::default();
    let mut stats = Stats::default();
    let header = log.header();

    for i in 0..header.next_index {
        let entry = match log.entry_validated(i) {
            Ok(e) => e,
            Err(_) => {
                stats.bad_entries += 1;
                continue;
            }
        };
        stats.entries_processed += 1;

        let result = match entry.entry_type() {
            Some(LogEntryType::File) => match entry.file_meta() {
                Some(meta) => apply_file(&mut tree, &meta, &mut stats),
                None => Err(FamfsError::PerItem(ItemErrorKind::BadEntryCrc { index: i })),
            },
            Some(LogEntryType::Mkdir) => match entry.mkdir_meta() {
                Some(meta) => apply_mkdir(&mut tree, &meta, &mut stats),
                None => Err(FamfsError::PerItem(ItemErrorKind::BadEntryCrc { index: i })),
            },
            None => Err(FamfsError::PerItem(ItemErrorKind::BadEntryCrc { index: i })),
        };

        if let Err(e) = result {
            warn!("logplay: skipping entry {i}: {e}");
            stats.bad_entries += 1;
        }
    }

    debug!(
        "logplay: {} entries, {} files, {} dirs, {} bad",
        stats.entries_processed, stats.files_logged, stats.dirs_logged, stats.bad_entries
    );
    (tree, stats)
}

/// `replay(target_root, sb, log, role, mode, dry_run)`: folds the log
/// into a [`ReplayedTree`] ([`logplay`]), then — unless `dry_run` —
/// materializes every node under `target_root`: real inodes with
/// installed mappings in [`Mode::Live`], per-file YAML stubs in
/// [`Mode::Shadow`]. `installer` is ignored in shadow mode (shadow
/// targets never touch the mapping capability) and may be `None` in live
/// mode only for callers that already know every file pre-exists (tests
/// exercising the fold in isolation); a live replay that actually needs
/// to create a file with no installer is a per-item error, not a panic.
pub fn replay(
    log: &Log,
    target_root: &Path,
    role: Role,
    mode: Mode,
    installer: Option<&dyn MappingInstaller>,
    dry_run: bool,
) -> Result<(ReplayedTree, Stats), FamfsError> {
    let (tree, mut stats) = logplay(log, mode);
    if dry_run {
        return Ok((tree, stats));
    }

    if mode == Mode::Shadow {
        crate::shadow::write_meta_stub(&target_root.join(".meta/.superblock"), "superblock", crate::meta::LOG_OFFSET)?;
        crate::shadow::write_meta_stub(&target_root.join(".meta/.log"), "log", log.header().len)?;
    }

    // Shadow targets never install a mapping, so there's nothing to probe;
    // a live target probes once per replay pass rather than once per file.
    let map_abi_version = match (mode, installer) {
        (Mode::Live, Some(installer)) => Some(installer.probe()?),
        _ => None,
    };

    materialize(&tree, target_root, role, mode, installer, map_abi_version, &mut stats);
    Ok((tree, stats))
}

/// Materializes every node of an already-folded tree under `target_root`.
/// Idempotent: a relpath that already exists on disk is counted as
/// `*_existed` and left untouched, never recreated or overwritten, which
/// is what makes re-running [`replay`] against the same target a no-op.
///
/// Every per-node failure is a per-item error (counted in `stats`, logged,
/// and skipped) — materialize never aborts the pass, matching replay's
/// "record and advance" error policy.
pub fn materialize(
    tree: &ReplayedTree,
    target_root: &Path,
    role: Role,
    mode: Mode,
    installer: Option<&dyn MappingInstaller>,
    map_abi_version: Option<MapAbiVersion>,
    stats: &mut Stats,
) {
    // BTreeMap iteration over relpaths visits "a" before "a/b", so parent
    // directories are always materialized before their children even
    // without a separate directories-first pass.
    for (relpath, node) in &tree.nodes {
        let result = match node {
            ReplayedNode::Dir(d) => materialize_dir(target_root, relpath, d, stats),
            ReplayedNode::File(f) => {
                materialize_file(target_root, relpath, f, role, mode, installer, map_abi_version, stats)
            }
        };
        if let Err(e) = result {
            warn!("materialize: {relpath}: {e}");
        }
    }
}

fn materialize_dir(target_root: &Path, relpath: &str, d: &ReplayedDir, stats: &mut Stats) -> Result<(), FamfsError> {
    let path = target_root.join(relpath);
    match std::fs::symlink_metadata(&path) {
        Ok(m) if m.is_dir() => {
            stats.dirs_existed += 1;
            Ok(())
        }
        Ok(_) => {
            stats.dir_errs += 1;
            Err(FamfsError::PerItem(ItemErrorKind::NotADirectory(path)))
        }
        Err(_) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::create_dir(&path)?;
            apply_mode(&path, d.mode);
            stats.dirs_created += 1;
            Ok(())
        }
    }
}

fn materialize_file(
    target_root: &Path,
    relpath: &str,
    f: &ReplayedFile,
    role: Role,
    mode: Mode,
    installer: Option<&dyn MappingInstaller>,
    map_abi_version: Option<MapAbiVersion>,
    stats: &mut Stats,
) -> Result<(), FamfsError> {
    let path = target_root.join(relpath);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        stats.files_existed += 1;
        return Ok(());
    }

    match mode {
        Mode::Shadow => {
            let mut single = ReplayedTree::default();
            single.nodes.insert(relpath.to_string(), ReplayedNode::File(f.clone()));
            stats.yaml_checked += 1;
            if crate::shadow::check_round_trip(&single, &path).is_err() {
                stats.yaml_errs += 1;
            }
            let text = crate::shadow::emit(&single)?;
            std::fs::write(&path, text)?;
        }
        Mode::Live => {
            // Clients never receive write permission on a materialized
            // file, unless the file was logged with ALL_HOSTS_RW: the
            // master's logged mode is authoritative there, but every
            // other host otherwise masks the write bits off.
            let effective_mode = match role {
                Role::Client if !f.flags.contains(FileFlags::ALL_HOSTS_RW) => f.mode & !0o222,
                Role::Client | Role::Master => f.mode,
            };
            let file = std::fs::File::create(&path)?;
            file.set_len(f.size)?;
            apply_mode(&path, effective_mode);
            drop(file);

            if let Some(installer) = installer {
                let req = if f.fmap.ext_type() == ExtType::Interleave {
                    MapRequest::V2Interleaved {
                        file_type: FileType::Reg,
                        file_size: f.size,
                        chunk_size: f.fmap.chunk_size,
                        strips: f.fmap.strips().iter().copied().collect(),
                    }
                } else {
                    MapRequest::V2Simple {
                        file_type: FileType::Reg,
                        file_size: f.size,
                        extents: f.fmap.simple_extents().iter().copied().collect(),
                    }
                };
                if let Some(version) = map_abi_version {
                    if let Err(e) = validate_for_abi(version, &req) {
                        stats.file_errs += 1;
                        return Err(e);
                    }
                }
                if let Err(e) = installer.install(&path, &req) {
                    std::fs::remove_file(&path).ok();
                    stats.file_errs += 1;
                    return Err(e);
                }
            }
        }
    }
    stats.files_created += 1;
    Ok(())
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        warn!("materialize: failed to set mode on {}: {e}", path.display());
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) {}

/// Masks off entries a client is not permitted to append, per the
/// master/client role split: a client may still replay the whole log (it
/// needs the complete namespace), but [`crate::log::Log::append_file`]
/// and [`crate::log::Log::append_mkdir`] are gated on `Role::Master` by
/// the session layer before ever reaching the log.
pub fn require_master(role: Role) -> Result<(), FamfsError> {
    match role {
        Role::Master => Ok(()),
        Role::Client => Err(FamfsError::Fatal(crate::error::FatalKind::RoleMismatch)),
    }
}
