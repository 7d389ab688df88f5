//! The locked-log session: exclusive access to a famfs instance for the
//! duration of a multi-item operation.
//!
//! At most one writer session may hold a famfs instance's log open at a
//! time; readers share a shared-mode lock. `SessionConfig` mirrors the
//! builder pattern the rest of this codebase uses for runtime
//! configuration, rather than a constructor with a dozen positional
//! arguments.

use std::fs::File;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use memmap2::MmapOptions;
use uuid::Uuid;
use zerocopy::FromBytes;

use crate::bitmap::Bitmap;
use crate::cache::CacheMode;
use crate::error::{FamfsError, FatalKind};
use crate::log::Log;
use crate::mapping::{MapAbiVersion, MappingInstaller};
use crate::meta::Superblock;
use crate::path::{open_relpath, CFG_FILE_RELPATH, LOG_FILE_RELPATH, SB_FILE_RELPATH};

/// Maximum bucket-floor relaxation and cache-flush suppression are test
/// hooks only; a session built without `test_mode(true)` never sets them.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub read_only: bool,
    pub relaxed_interleave_floor: bool,
    pub cache_mode: CacheMode,
    pub build_bitmap: bool,
    pub system_uuid_override: Option<Uuid>,
    pub nonblocking: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            read_only: false,
            relaxed_interleave_floor: false,
            cache_mode: CacheMode::Real,
            build_bitmap: true,
            system_uuid_override: None,
            nonblocking: false,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Test-only: relaxes the interleaved allocator's 1 GiB bucket floor.
    pub fn test_mode(mut self, enabled: bool) -> Self {
        self.relaxed_interleave_floor = enabled;
        self.cache_mode = if enabled { CacheMode::TestNoFlush } else { CacheMode::Real };
        self
    }

    /// Skip the O(log) bitmap rebuild for callers that only need the
    /// superblock and raw log access (e.g. `fsck`'s log dump).
    pub fn build_bitmap(mut self, build: bool) -> Self {
        self.build_bitmap = build;
        self
    }

    /// Bypasses [`crate::system::system_uuid`]'s `/opt/famfs` read,
    /// letting tests pin a host identity without touching real system
    /// state.
    pub fn system_uuid_override(mut self, uuid: Uuid) -> Self {
        self.system_uuid_override = Some(uuid);
        self
    }

    /// `session_open`'s non-blocking variant: fail fast with
    /// [`FatalKind::WouldBlock`] instead of waiting for a concurrent
    /// writer session to release the log's flock.
    pub fn nonblocking(mut self, enabled: bool) -> Self {
        self.nonblocking = enabled;
        self
    }
}

/// A session holding the log's flock for its entire lifetime. Dropping it
/// without calling [`LockedLogSession::close`] releases the lock but
/// leaves the in-progress operation's outcome implicit, the way an
/// aborted C process leaves an flock released by kernel cleanup; callers
/// that care about `abort` semantics should always call `close`
/// explicitly.
pub struct LockedLogSession {
    mount_root: PathBuf,
    _sb_file: File,
    _log_file: File,
    superblock: Superblock,
    log: Log,
    bitmap: Option<Bitmap>,
    config: SessionConfig,
    system_uuid: Uuid,
    map_abi_version: MapAbiVersion,
    alloc_config: Option<crate::bitmap::AllocConfig>,
}

impl LockedLogSession {
    /// `session_open(path, config, installer)`: ascend to the mount root,
    /// open and lock `.meta/.superblock` and `.meta/.log`, validate the
    /// superblock, map the log, optionally build the bitmap, probe the
    /// mapping-install backend's ABI version, and parse `.meta/.alloc.cfg`
    /// if present.
    pub fn open(path: &Path, config: SessionConfig, installer: &dyn MappingInstaller) -> Result<Self, FamfsError> {
        let (sb_file, mount_root) = open_relpath(path, SB_FILE_RELPATH, true, crate::path::LockMode::None)?;
        let sb_map = unsafe { MmapOptions::new().map(&sb_file)? };
        let superblock = Superblock::read_from_bytes(&sb_map[..core::mem::size_of::<Superblock>()])
            .map_err(|_| FamfsError::Fatal(FatalKind::InvalidSuperblock(crate::error::SuperblockProblem::BadMagic)))?;
        superblock.check_ok()?;

        let lock_mode = if config.nonblocking {
            crate::path::LockMode::NonBlocking
        } else {
            crate::path::LockMode::Blocking
        };
        let (log_file, _) = open_relpath(&mount_root, LOG_FILE_RELPATH, config.read_only, lock_mode)?;
        let log_map = unsafe { MmapOptions::new().map_mut(&log_file)? };
        let log = Log::from_mapping(log_map, config.cache_mode)?;

        let system_uuid = match config.system_uuid_override {
            Some(uuid) => uuid,
            None => crate::system::system_uuid()?,
        };

        // A writable session exists to serialize allocation + log-append,
        // which only the master may ever do; a client opening read-write
        // is refused outright rather than discovering the mismatch on its
        // first append. Read-only sessions (inspection, fsck, replay
        // tooling) are open to either role.
        if !config.read_only && !superblock.is_master(system_uuid) {
            return Err(FamfsError::Fatal(FatalKind::RoleMismatch));
        }

        let bitmap = if config.build_bitmap {
            Some(Bitmap::build(&log, superblock.alloc_unit, superblock.primary_daxdev.size))
        } else {
            None
        };

        let map_abi_version = installer.probe()?;

        let alloc_config = match std::fs::read_to_string(mount_root.join(CFG_FILE_RELPATH)) {
            Ok(text) => Some(crate::bitmap::AllocConfig::parse(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        info!(
            "session_open: mount={} read_only={} role={} map_abi={:?}",
            mount_root.display(),
            config.read_only,
            if superblock.is_master(system_uuid) { "master" } else { "client" },
            map_abi_version,
        );

        Ok(LockedLogSession {
            mount_root,
            _sb_file: sb_file,
            _log_file: log_file,
            superblock,
            log,
            bitmap,
            map_abi_version,
            alloc_config,
            config,
            system_uuid,
        })
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn is_master(&self) -> bool {
        self.superblock.is_master(self.system_uuid)
    }

    pub fn role(&self) -> crate::replay::Role {
        if self.is_master() {
            crate::replay::Role::Master
        } else {
            crate::replay::Role::Client
        }
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut Log {
        &mut self.log
    }

    pub fn bitmap(&self) -> Option<&Bitmap> {
        self.bitmap.as_ref()
    }

    pub fn bitmap_mut(&mut self) -> Option<&mut Bitmap> {
        self.bitmap.as_mut()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The mapping-install ABI this session's backend speaks, probed once
    /// at [`Self::open`]. Every `install` call should be checked against
    /// it via [`crate::mapping::validate_for_abi`] before being issued.
    pub fn map_abi_version(&self) -> MapAbiVersion {
        self.map_abi_version
    }

    /// The parsed `.meta/.alloc.cfg`, if the instance carries one.
    pub fn alloc_config(&self) -> Option<&crate::bitmap::AllocConfig> {
        self.alloc_config.as_ref()
    }

    /// `session_close(session, abort)`. `abort` only affects logging and
    /// the returned bool; the flock is released by the file descriptors'
    /// `Drop` regardless of how this method returns.
    pub fn close(self, abort: bool) -> bool {
        if abort {
            warn!("session_close: aborting session at {}", self.mount_root.display());
        } else {
            debug!("session_close: closing session at {}", self.mount_root.display());
        }
        !abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ALLOC_UNIT_2M, FAMFS_VERSION, LOG_OFFSET, MIN_LOG_LEN};
    use std::io::{Seek, SeekFrom, Write};
    use zerocopy::IntoBytes;

    fn make_famfs_instance(dir: &Path, system_uuid: Uuid) {
        std::fs::create_dir_all(dir.join(".meta")).unwrap();

        let devsize = 1u64 << 32;
        let sb = Superblock::new(MIN_LOG_LEN, ALLOC_UNIT_2M, Uuid::nil(), Uuid::nil(), system_uuid, devsize, "dax0.0");
        assert_eq!(sb.version, FAMFS_VERSION);
        let mut sb_file = std::fs::File::create(dir.join(".meta/.superblock")).unwrap();
        sb_file.write_all(sb.as_bytes()).unwrap();
        sb_file.seek(SeekFrom::Start(LOG_OFFSET - 1)).unwrap();
        sb_file.write_all(&[0]).unwrap();

        let log = Log::new_in_memory(MIN_LOG_LEN, 1023);
        let mut log_file = std::fs::File::create(dir.join(".meta/.log")).unwrap();
        log_file.write_all(&log.header().as_bytes()).unwrap();
        log_file.seek(SeekFrom::Start(MIN_LOG_LEN - 1)).unwrap();
        log_file.write_all(&[0]).unwrap();
    }

    struct StubInstaller(MapAbiVersion);
    impl MappingInstaller for StubInstaller {
        fn probe(&self) -> Result<MapAbiVersion, FamfsError> {
            Ok(self.0)
        }
        fn install(&self, _path: &Path, _req: &crate::mapping::MapRequest) -> Result<(), FamfsError> {
            Ok(())
        }
        fn read_back(&self, _path: &Path) -> Result<crate::mapping::MapRequest, FamfsError> {
            unimplemented!("not needed for these tests")
        }
    }

    #[test]
    fn session_open_reads_superblock_and_builds_bitmap() {
        let dir = tempfile::tempdir().unwrap();
        let system_uuid = Uuid::new_v4();
        make_famfs_instance(dir.path(), system_uuid);

        let session = LockedLogSession::open(
            dir.path(),
            SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
            &StubInstaller(MapAbiVersion::V2),
        )
        .unwrap();
        assert!(session.bitmap().is_some());
        assert!(session.is_master());
        assert_eq!(session.map_abi_version(), MapAbiVersion::V2);
        assert!(session.alloc_config().is_none());
        assert!(session.close(false));
    }

    #[test]
    fn session_open_without_bitmap_build_skips_it() {
        let dir = tempfile::tempdir().unwrap();
        let system_uuid = Uuid::new_v4();
        make_famfs_instance(dir.path(), system_uuid);

        let session = LockedLogSession::open(
            dir.path(),
            SessionConfig::new().test_mode(true).build_bitmap(false).system_uuid_override(system_uuid),
            &StubInstaller(MapAbiVersion::V2),
        )
        .unwrap();
        assert!(session.bitmap().is_none());
    }

    #[test]
    fn session_open_parses_alloc_cfg_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let system_uuid = Uuid::new_v4();
        make_famfs_instance(dir.path(), system_uuid);
        std::fs::write(
            dir.path().join(crate::path::CFG_FILE_RELPATH),
            "interleaved_alloc:\n  nbuckets: 4\n  nstrips: 2\n  chunk_size: 2M\n",
        )
        .unwrap();

        let session = LockedLogSession::open(
            dir.path(),
            SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
            &StubInstaller(MapAbiVersion::V2),
        )
        .unwrap();
        let cfg = session.alloc_config().unwrap();
        assert_eq!(cfg.interleaved_alloc.nbuckets, 4);
        assert_eq!(cfg.interleaved_alloc.chunk_size, 2 << 20);
    }

    #[test]
    fn nonblocking_open_fails_fast_against_a_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let system_uuid = Uuid::new_v4();
        make_famfs_instance(dir.path(), system_uuid);

        let held = LockedLogSession::open(
            dir.path(),
            SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
            &StubInstaller(MapAbiVersion::V2),
        )
        .unwrap();

        let err = LockedLogSession::open(
            dir.path(),
            SessionConfig::new().test_mode(true).system_uuid_override(system_uuid).nonblocking(true),
            &StubInstaller(MapAbiVersion::V2),
        )
        .unwrap_err();
        assert!(matches!(err, FamfsError::Fatal(FatalKind::WouldBlock)));
        assert!(held.close(false));
    }
}
