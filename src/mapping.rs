//! The external mapping-install capability: enforcing a file's
//! extents as an actual DAX-memory mapping is the kernel module's or
//! FUSE server's job, not this crate's. The crate only needs a trait
//! boundary it can call through and a fake it can swap in for tests.
//!
//! Two historical ioctl shapes exist (`MAP_CREATE` and `MAP_CREATE_V2`);
//! rather than pick one at compile time behind a cargo feature the way a
//! `FAMFS_KABI_VERSION` macro would, the session probes once at open time
//! and holds the answer for its lifetime.

use smallvec::SmallVec;

use crate::error::{ExternalKind, FamfsError};
use crate::meta::{RawSimpleExtent, MAX_SIMPLE_EXTENTS};

/// Extent lists never exceed [`MAX_SIMPLE_EXTENTS`] (the on-media fmap's own
/// fixed capacity), so the common case never spills to the heap.
pub type ExtentList = SmallVec<[RawSimpleExtent; MAX_SIMPLE_EXTENTS]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Superblock,
    Log,
    Reg,
}

/// The kernel mapping ABI a given backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAbiVersion {
    V1,
    V2,
}

/// `MAP_CREATE` / `MAP_CREATE_V2`'s payload shape, tagged by the ABI
/// version actually in use so a V1 backend can reject an interleaved
/// request outright instead of silently truncating it.
#[derive(Debug, Clone)]
pub enum MapRequest {
    V1 {
        file_type: FileType,
        file_size: u64,
        extents: ExtentList,
    },
    V2Simple {
        file_type: FileType,
        file_size: u64,
        extents: ExtentList,
    },
    V2Interleaved {
        file_type: FileType,
        file_size: u64,
        chunk_size: u64,
        strips: ExtentList,
    },
}

/// Given a file descriptor (identified here by path, since the real
/// descriptor belongs to whatever opened the stub file), installs or
/// reads back a mapping. Implementations are external collaborators:
/// the real one issues `ioctl`s against a kernel or FUSE character
/// device, while the test crate's recording implementation stands in
/// for it.
pub trait MappingInstaller: Send + Sync {
    /// Detects which ABI this backend speaks. Called once per session
    /// open; the session holds the result.
    fn probe(&self) -> Result<MapAbiVersion, FamfsError>;

    /// `MAP_CREATE[_V2]`: installs `request` against the file at `path`.
    fn install(&self, path: &std::path::Path, request: &MapRequest) -> Result<(), FamfsError>;

    /// `MAP_GET`/`MAP_GETEXT`: reads back the mapping previously
    /// installed for `path`, for diagnostic/fsck use.
    fn read_back(&self, path: &std::path::Path) -> Result<MapRequest, FamfsError>;
}

/// Rejects any request a V1 backend cannot express, the way a real V1
/// kernel module would reject an `INTERLEAVE` ioctl outright.
pub fn validate_for_abi(version: MapAbiVersion, request: &MapRequest) -> Result<(), FamfsError> {
    match (version, request) {
        (MapAbiVersion::V1, MapRequest::V2Interleaved { .. }) => {
            Err(FamfsError::External(ExternalKind::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "interleaved mappings require MAP_CREATE_V2",
            ))))
        }
        _ => Ok(()),
    }
}
