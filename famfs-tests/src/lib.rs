//! Scenario-test support for famfs: a fake DAX device (a plain regular
//! file, since the on-media format code only ever sees a byte slice) and
//! a mapping-install stub that just records what it was asked to do.
//!
//! This mirrors `fuser-tests`'s role in its own workspace: a separate
//! member holding test-only infrastructure that the library crate itself
//! shouldn't carry as a dependency.

use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use famfs::error::FamfsError;
use famfs::mapping::{MapAbiVersion, MapRequest, MappingInstaller};
use famfs::meta::{Superblock, ALLOC_UNIT_2M, LOG_OFFSET, MIN_LOG_LEN};
use uuid::Uuid;
use zerocopy::IntoBytes;

/// Formats a fresh famfs instance (superblock + empty log) rooted at
/// `dir`, the way `mkfs` would against a real DAX device, but backed by
/// plain files.
pub fn mkfs(dir: &Path, devsize: u64, system_uuid: Uuid) -> Superblock {
    std::fs::create_dir_all(dir.join(".meta")).unwrap();

    let sb = Superblock::new(MIN_LOG_LEN, ALLOC_UNIT_2M, Uuid::nil(), Uuid::nil(), system_uuid, devsize, "dax0.0");
    let mut sb_file = std::fs::File::create(dir.join(".meta/.superblock")).unwrap();
    sb_file.write_all(sb.as_bytes()).unwrap();
    sb_file.seek(SeekFrom::Start(LOG_OFFSET - 1)).unwrap();
    sb_file.write_all(&[0]).unwrap();

    let log = famfs::log::Log::new_in_memory(MIN_LOG_LEN, 16_383);
    let mut log_file = std::fs::File::create(dir.join(".meta/.log")).unwrap();
    log_file.write_all(log.header().as_bytes()).unwrap();
    log_file.seek(SeekFrom::Start(MIN_LOG_LEN - 1)).unwrap();
    log_file.write_all(&[0]).unwrap();

    sb
}

/// Records every install request it was handed, for scenario tests that
/// assert on what the pipeline asked the kernel/FUSE side to do.
#[derive(Default)]
pub struct RecordingMappingInstaller {
    pub installs: Mutex<Vec<(PathBuf, MapRequest)>>,
}

impl MappingInstaller for RecordingMappingInstaller {
    fn probe(&self) -> Result<MapAbiVersion, FamfsError> {
        Ok(MapAbiVersion::V2)
    }

    fn install(&self, path: &Path, request: &MapRequest) -> Result<(), FamfsError> {
        self.installs.lock().unwrap().push((path.to_path_buf(), request.clone()));
        Ok(())
    }

    fn read_back(&self, path: &Path) -> Result<MapRequest, FamfsError> {
        self.installs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(p, _)| p == path)
            .map(|(_, r)| r.clone())
            .ok_or_else(|| {
                FamfsError::External(famfs::error::ExternalKind::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no mapping recorded for path",
                )))
            })
    }
}
