//! Path and mount resolution.
//!
//! Ascends a path to find the famfs mount point, resolves the
//! `.meta/.superblock` and `.meta/.log` files beneath it, and classifies
//! a path as a famfs (V1), FUSE-famfs, or unrelated mount via `statfs`.

use std::fs::File;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use log::trace;
use nix::fcntl::{flock, FlockArg};
use nix::sys::statfs::statfs;

use crate::error::{ExternalKind, FamfsError, FatalKind};

pub const SB_FILE_RELPATH: &str = ".meta/.superblock";
pub const LOG_FILE_RELPATH: &str = ".meta/.log";
pub const CFG_FILE_RELPATH: &str = ".meta/.alloc.cfg";

/// `FAMFS_SUPER_MAGIC`, deprecated but still emitted by older v1 kernel
/// modules; `statfs.f_type` comparisons accept it alongside the current one.
pub const FAMFS_SUPER_MAGIC: i64 = 0x87b2_82ff_u32 as i64;
/// Current v1 statfs magic.
pub const FAMFS_STATFS_MAGIC_V1: i64 = 0x6661_6d31; // "fam1"
/// famfs's own FUSE statfs magic, once the FUSE server reports it.
pub const FAMFS_STATFS_MAGIC: i64 = 0x6661_6d66; // "famf"
/// Standard Linux `FUSE_SUPER_MAGIC`, accepted until the FUSE server
/// reports famfs's own magic.
pub const FUSE_SUPER_MAGIC: i64 = 0x6573_5546;

/// `enum famfs_type`, modeled on `famfs_lib.c`'s `file_is_famfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamfsType {
    NotFamfs,
    V1,
    Fuse,
}

pub fn classify_fs_type(path: &Path) -> io::Result<FamfsType> {
    let target = if path.exists() {
        path.to_path_buf()
    } else {
        path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
    };
    let fs = statfs(&target)?;
    let magic = fs.filesystem_type().0;
    Ok(match magic {
        m if m == FAMFS_SUPER_MAGIC || m == FAMFS_STATFS_MAGIC_V1 => FamfsType::V1,
        m if m == FUSE_SUPER_MAGIC || m == FAMFS_STATFS_MAGIC => FamfsType::Fuse,
        _ => FamfsType::NotFamfs,
    })
}

/// `find_mount_point(path)`: ascend until `st_dev` changes.
pub fn find_mount_point(path: &Path) -> io::Result<PathBuf> {
    let mut current = canonicalize_lossy(path)?;
    let dev = std::fs::metadata(&current)?.dev();

    loop {
        let Some(parent) = current.parent() else {
            return Ok(current);
        };
        if parent == current {
            return Ok(current);
        }
        let parent_dev = std::fs::metadata(parent)?.dev();
        if parent_dev != dev {
            return Ok(current);
        }
        current = parent.to_path_buf();
    }
}

/// Ascends through `dirname` until an existing path is found, the way
/// `open_relpath` does before it starts looking for `relpath` underneath.
fn canonicalize_lossy(path: &Path) -> io::Result<PathBuf> {
    let mut cur = path.to_path_buf();
    loop {
        match cur.canonicalize() {
            Ok(p) => return Ok(p),
            Err(_) => {
                let Some(parent) = cur.parent() else {
                    return Err(io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"));
                };
                if parent == cur {
                    return Err(io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"));
                }
                cur = parent.to_path_buf();
            }
        }
    }
}

/// `famfs_path_is_mount_pt(path)`: parses `/proc/mounts`, matching `path`
/// against each famfs/FUSE-famfs entry's mount point.
pub fn famfs_path_is_mount_pt(path: &Path) -> io::Result<Option<MountEntry>> {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let contents = std::fs::read_to_string("/proc/mounts")?;
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let (Some(device), Some(mount_point), Some(fstype), Some(opts)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if fstype != "famfs" && fstype != "fuse.famfs" {
            continue;
        }
        let mp = PathBuf::from(unescape_mtab(mount_point));
        let Ok(canon_mp) = mp.canonicalize() else { continue };
        if canon_mp != target {
            continue;
        }
        let shadow = opts.split(',').find_map(|o| o.strip_prefix("shadow=")).map(PathBuf::from);
        return Ok(Some(MountEntry {
            backing_dev: device.to_string(),
            mount_point: canon_mp,
            shadow_path: shadow,
        }));
    }
    Ok(None)
}

fn unescape_mtab(field: &str) -> String {
    field.replace("\\040", " ").replace("\\011", "\t").replace("\\012", "\n")
}

#[derive(Debug, Clone)]
pub struct MountEntry {
    pub backing_dev: String,
    pub mount_point: PathBuf,
    pub shadow_path: Option<PathBuf>,
}

/// Whether, and how, [`open_relpath`] should `flock` the file it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Don't lock at all (read-only inspection tooling).
    None,
    /// Block until the lock is available, the way a normal session open does.
    Blocking,
    /// `LOCK_NB`: fail immediately with [`FatalKind::WouldBlock`] instead of
    /// waiting for a concurrent writer session to release the log.
    NonBlocking,
}

/// `open_relpath(path, relpath, want_read_only, lock_opt)`: ascend from
/// `path` to find the nearest existing ancestor, then ascend again
/// looking for `{ancestor}/{relpath}`, until found or the root is
/// reached.
pub fn open_relpath(
    path: &Path,
    relpath: &str,
    want_read_only: bool,
    lock: LockMode,
) -> Result<(File, PathBuf), FamfsError> {
    let mut rpath = canonicalize_lossy(path)?;

    loop {
        let candidate = rpath.join(relpath);
        if let Ok(meta) = std::fs::symlink_metadata(&candidate) {
            if meta.file_type().is_file() || meta.file_type().is_char_device() {
                let file = File::options()
                    .read(true)
                    .write(!want_read_only)
                    .open(&candidate)?;
                match lock {
                    LockMode::None => {}
                    LockMode::Blocking => {
                        let arg = if want_read_only {
                            FlockArg::LockShared
                        } else {
                            FlockArg::LockExclusive
                        };
                        flock(&file, arg)
                            .map_err(|e| FamfsError::External(ExternalKind::Io(e.into())))?;
                    }
                    LockMode::NonBlocking => {
                        let arg = if want_read_only {
                            FlockArg::LockSharedNonblock
                        } else {
                            FlockArg::LockExclusiveNonblock
                        };
                        flock(&file, arg).map_err(|e| match e {
                            nix::errno::Errno::EWOULDBLOCK | nix::errno::Errno::EAGAIN => {
                                FamfsError::Fatal(FatalKind::WouldBlock)
                            }
                            other => FamfsError::External(ExternalKind::Io(other.into())),
                        })?;
                    }
                }
                trace!("open_relpath: found {} under {}", relpath, rpath.display());
                return Ok((file, rpath));
            }
        }
        let Some(parent) = rpath.parent() else {
            return Err(FamfsError::External(ExternalKind::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{relpath} not found above {}", path.display()),
            ))));
        };
        if parent == rpath {
            return Err(FamfsError::External(ExternalKind::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{relpath} not found above {}", path.display()),
            ))));
        }
        rpath = parent.to_path_buf();
    }
}
