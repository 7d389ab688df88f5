//! The file-create pipeline: `mkfile` and the `cp` built atop it.
//!
//! Every step before the log append in [`mkfile`] is safely retryable:
//! only the append is the commit point. A caller that crashes between
//! allocating and appending leaves an orphaned stub file and some bitmap
//! bits that the next `Bitmap::build` simply won't see (since it derives
//! state from the log, not from stub files on disk), not a corrupt
//! filesystem.

use std::io::Read;
use std::path::Path;

use log::{debug, info};

use crate::bitmap::InterleaveParams;
use crate::cache::flush_range;
use crate::error::{FamfsError, ItemErrorKind};
use crate::mapping::{validate_for_abi, FileType, MapRequest, MappingInstaller};
use crate::meta::{relpath_to_bytes, round_up, ExtType, RawFileMeta, RawFmap};
use crate::replay::Role;
use crate::session::LockedLogSession;

/// Optional interleaved-allocation request a caller may attach to
/// `mkfile`; absent, the session falls back to contiguous allocation.
#[derive(Debug, Clone, Copy)]
pub struct InterleaveRequest {
    pub params: InterleaveParams,
    pub relaxed_bucket_floor: bool,
}

pub struct MkfileRequest<'a> {
    pub relpath: &'a str,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub flags: crate::meta::FileFlags,
    pub interleave: Option<InterleaveRequest>,
}

pub struct MkfileOutcome {
    pub relpath: String,
    pub size: u64,
    pub fmap: RawFmap,
    pub pre_existing: bool,
}

/// `mkfile(session, fullpath, mode, uid, gid, size, interleave?)`.
pub fn mkfile(
    session: &mut LockedLogSession,
    installer: &dyn MappingInstaller,
    req: MkfileRequest,
) -> Result<MkfileOutcome, FamfsError> {
    crate::replay::require_master(session.role())?;

    let dest = session.mount_root().join(req.relpath);
    if let Ok(existing) = std::fs::metadata(&dest) {
        if existing.len() == req.size {
            info!("mkfile: {} already exists at the requested size, treating as no-op", dest.display());
            let (tree, _) = crate::replay::logplay(session.log(), crate::replay::Mode::Shadow);
            let fmap = tree.file(req.relpath).map(|f| f.fmap).unwrap_or_else(|| {
                RawFmap::simple(&[crate::meta::RawSimpleExtent::new(0, crate::meta::LOG_OFFSET, 0)])
            });
            return Ok(MkfileOutcome { relpath: req.relpath.to_string(), size: req.size, fmap, pre_existing: true });
        }
        return Err(FamfsError::PerItem(ItemErrorKind::FileExistsWrongSize {
            path: dest,
            existing: existing.len(),
            requested: req.size,
        }));
    }

    let alloc_unit = session.bitmap().map(|b| b.alloc_unit()).unwrap_or(crate::meta::ALLOC_UNIT_4K);
    let bitmap = session
        .bitmap_mut()
        .expect("mkfile requires a session opened with build_bitmap(true)");

    let fmap = match req.interleave {
        Some(ireq) => {
            let alloc = bitmap.alloc_interleaved(ireq.params, req.size, ireq.relaxed_bucket_floor, pseudo_rand_below)?;
            RawFmap::interleaved(alloc.chunk_size, &alloc.strips)
        }
        None => {
            let offset = bitmap.alloc_contiguous_session(req.size)?;
            RawFmap::simple(&[crate::meta::RawSimpleExtent::new(0, offset, round_up(req.size, alloc_unit))])
        }
    };

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::File::create(&dest)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(req.mode))?;
    }

    let map_request = if fmap.ext_type() == ExtType::Interleave {
        MapRequest::V2Interleaved {
            file_type: FileType::Reg,
            file_size: req.size,
            chunk_size: fmap.chunk_size,
            strips: fmap.strips().iter().copied().collect(),
        }
    } else {
        MapRequest::V2Simple {
            file_type: FileType::Reg,
            file_size: req.size,
            extents: fmap.simple_extents().iter().copied().collect(),
        }
    };
    if let Err(e) = validate_for_abi(session.map_abi_version(), &map_request) {
        std::fs::remove_file(&dest).ok();
        return Err(e);
    }
    if let Err(e) = installer.install(&dest, &map_request) {
        std::fs::remove_file(&dest).ok();
        return Err(e);
    }

    let meta = RawFileMeta {
        size: req.size,
        flags: req.flags.bits(),
        uid: req.uid,
        gid: req.gid,
        mode: req.mode,
        relpath: relpath_to_bytes(req.relpath),
        fmap,
    };
    session.log_mut().append_file(&meta)?;
    session.log().warn_if_near_full();

    debug!("mkfile: created {} ({} bytes)", dest.display(), req.size);
    Ok(MkfileOutcome { relpath: req.relpath.to_string(), size: req.size, fmap, pre_existing: false })
}

fn pseudo_rand_below(n: u64) -> u64 {
    n.saturating_sub(1)
}

/// `cp(src, dst, ...)`: `mkfile` at `dst`'s size, then a chunked copy from
/// `src` into the destination's mapped region, with a final flush.
pub fn cp(
    session: &mut LockedLogSession,
    installer: &dyn MappingInstaller,
    src: &Path,
    dst_relpath: &str,
    mode: u32,
    uid: u32,
    gid: u32,
) -> Result<MkfileOutcome, FamfsError> {
    let size = std::fs::metadata(src)?.len();
    let outcome = mkfile(
        session,
        installer,
        MkfileRequest { relpath: dst_relpath, mode, uid, gid, size, flags: crate::meta::FileFlags::empty(), interleave: None },
    )?;
    if outcome.pre_existing {
        return Ok(outcome);
    }

    let dest_path = session.mount_root().join(dst_relpath);
    let mut src_file = std::fs::File::open(src)?;
    let dst_file = std::fs::OpenOptions::new().read(true).write(true).open(&dest_path)?;

    if size > 0 {
        // mirrors famfs_copy_file_data: pread straight into the
        // destination's mapped region, chunk by chunk, rather than
        // read-then-write through a scratch buffer.
        let mut dst_map = unsafe { memmap2::MmapOptions::new().map_mut(&dst_file)? };
        const CHUNK: usize = 1 << 20;
        let mut offset = 0usize;
        while offset < dst_map.len() {
            let end = (offset + CHUNK).min(dst_map.len());
            src_file.read_exact(&mut dst_map[offset..end])?;
            offset = end;
        }
        dst_map.flush()?;
        flush_range(&dst_map[..], session.config().cache_mode);
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use std::io::{Seek, SeekFrom, Write as _};

    struct NullInstaller;
    impl MappingInstaller for NullInstaller {
        fn probe(&self) -> Result<crate::mapping::MapAbiVersion, FamfsError> {
            Ok(crate::mapping::MapAbiVersion::V2)
        }
        fn install(&self, _path: &Path, _req: &MapRequest) -> Result<(), FamfsError> {
            Ok(())
        }
        fn read_back(&self, _path: &Path) -> Result<MapRequest, FamfsError> {
            unimplemented!("not needed for these tests")
        }
    }

    fn make_famfs_instance(dir: &Path, system_uuid: uuid::Uuid) {
        use crate::meta::{Superblock, ALLOC_UNIT_2M, LOG_OFFSET, MIN_LOG_LEN};
        use uuid::Uuid;
        use zerocopy::IntoBytes;

        std::fs::create_dir_all(dir.join(".meta")).unwrap();
        let devsize = 1u64 << 32;
        let sb = Superblock::new(MIN_LOG_LEN, ALLOC_UNIT_2M, Uuid::nil(), Uuid::nil(), system_uuid, devsize, "dax0.0");
        let mut sb_file = std::fs::File::create(dir.join(".meta/.superblock")).unwrap();
        sb_file.write_all(sb.as_bytes()).unwrap();
        sb_file.seek(SeekFrom::Start(LOG_OFFSET - 1)).unwrap();
        sb_file.write_all(&[0]).unwrap();

        let log = crate::log::Log::new_in_memory(MIN_LOG_LEN, 1023);
        let mut log_file = std::fs::File::create(dir.join(".meta/.log")).unwrap();
        log_file.write_all(log.header().as_bytes()).unwrap();
        log_file.seek(SeekFrom::Start(MIN_LOG_LEN - 1)).unwrap();
        log_file.write_all(&[0]).unwrap();
    }

    #[test]
    fn mkfile_creates_stub_and_appends_log_entry() {
        let dir = tempfile::tempdir().unwrap();
        let system_uuid = uuid::Uuid::new_v4();
        make_famfs_instance(dir.path(), system_uuid);
        let installer = NullInstaller;
        let mut session = LockedLogSession::open(
            dir.path(),
            SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
            &installer,
        )
        .unwrap();

        let outcome = mkfile(
            &mut session,
            &installer,
            MkfileRequest { relpath: "a", mode: 0o644, uid: 0, gid: 0, size: 1 << 20, flags: crate::meta::FileFlags::empty(), interleave: None },
        )
        .unwrap();

        assert_eq!(outcome.size, 1 << 20);
        assert!(!outcome.pre_existing);
        assert!(dir.path().join("a").exists());
        assert_eq!(session.log().header().next_index, 1);
    }

    #[test]
    fn mkfile_is_idempotent_for_matching_size() {
        let dir = tempfile::tempdir().unwrap();
        let system_uuid = uuid::Uuid::new_v4();
        make_famfs_instance(dir.path(), system_uuid);
        let installer = NullInstaller;
        let mut session = LockedLogSession::open(
            dir.path(),
            SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
            &installer,
        )
        .unwrap();

        let req = || MkfileRequest { relpath: "a", mode: 0o644, uid: 0, gid: 0, size: 1 << 20, flags: crate::meta::FileFlags::empty(), interleave: None };
        mkfile(&mut session, &installer, req()).unwrap();
        let second = mkfile(&mut session, &installer, req()).unwrap();
        assert!(second.pre_existing);
        assert_eq!(session.log().header().next_index, 1);
    }

    struct RecordingInstaller {
        abi: crate::mapping::MapAbiVersion,
        last: std::sync::Mutex<Option<MapRequest>>,
    }

    impl RecordingInstaller {
        fn new(abi: crate::mapping::MapAbiVersion) -> Self {
            RecordingInstaller { abi, last: std::sync::Mutex::new(None) }
        }
    }

    impl MappingInstaller for RecordingInstaller {
        fn probe(&self) -> Result<crate::mapping::MapAbiVersion, FamfsError> {
            Ok(self.abi)
        }
        fn install(&self, _path: &Path, req: &MapRequest) -> Result<(), FamfsError> {
            *self.last.lock().unwrap() = Some(req.clone());
            Ok(())
        }
        fn read_back(&self, _path: &Path) -> Result<MapRequest, FamfsError> {
            unimplemented!("not needed for these tests")
        }
    }

    #[test]
    fn mkfile_installs_an_interleaved_request_for_a_striped_file() {
        let dir = tempfile::tempdir().unwrap();
        let system_uuid = uuid::Uuid::new_v4();
        make_famfs_instance(dir.path(), system_uuid);
        let installer = RecordingInstaller::new(crate::mapping::MapAbiVersion::V2);
        let mut session = LockedLogSession::open(
            dir.path(),
            SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
            &installer,
        )
        .unwrap();

        let params = crate::bitmap::InterleaveParams { nbuckets: 4, nstrips: 2, chunk_size: 1 << 21 };
        mkfile(
            &mut session,
            &installer,
            MkfileRequest {
                relpath: "striped",
                mode: 0o644,
                uid: 0,
                gid: 0,
                size: 16 << 20,
                flags: crate::meta::FileFlags::empty(),
                interleave: Some(InterleaveRequest { params, relaxed_bucket_floor: true }),
            },
        )
        .unwrap();

        match installer.last.lock().unwrap().as_ref().unwrap() {
            MapRequest::V2Interleaved { chunk_size, strips, .. } => {
                assert_eq!(*chunk_size, 1 << 21);
                assert_eq!(strips.len(), 2);
            }
            other => panic!("expected V2Interleaved, got {other:?}"),
        }
    }

    #[test]
    fn mkfile_rejects_interleaved_request_against_a_v1_backend() {
        let dir = tempfile::tempdir().unwrap();
        let system_uuid = uuid::Uuid::new_v4();
        make_famfs_instance(dir.path(), system_uuid);
        let installer = RecordingInstaller::new(crate::mapping::MapAbiVersion::V1);
        let mut session = LockedLogSession::open(
            dir.path(),
            SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
            &installer,
        )
        .unwrap();

        let params = crate::bitmap::InterleaveParams { nbuckets: 4, nstrips: 2, chunk_size: 1 << 21 };
        let err = mkfile(
            &mut session,
            &installer,
            MkfileRequest {
                relpath: "striped",
                mode: 0o644,
                uid: 0,
                gid: 0,
                size: 16 << 20,
                flags: crate::meta::FileFlags::empty(),
                interleave: Some(InterleaveRequest { params, relaxed_bucket_floor: true }),
            },
        )
        .unwrap_err();

        assert!(matches!(err, FamfsError::External(_)));
        assert!(installer.last.lock().unwrap().is_none(), "install must not be reached");
        assert!(!dir.path().join("striped").exists(), "the orphaned stub is cleaned up on rejection");
    }

    #[test]
    fn cp_copies_bytes_through_the_destination_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let system_uuid = uuid::Uuid::new_v4();
        make_famfs_instance(dir.path(), system_uuid);
        let installer = RecordingInstaller::new(crate::mapping::MapAbiVersion::V2);
        let mut session = LockedLogSession::open(
            dir.path(),
            SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
            &installer,
        )
        .unwrap();

        let src_dir = tempfile::tempdir().unwrap();
        let src_path = src_dir.path().join("payload");
        let payload: Vec<u8> = (0..(3 << 20)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src_path, &payload).unwrap();

        let outcome = cp(&mut session, &installer, &src_path, "payload", 0o644, 0, 0).unwrap();
        assert_eq!(outcome.size, payload.len() as u64);

        let copied = std::fs::read(dir.path().join("payload")).unwrap();
        assert_eq!(copied, payload);
    }
}
