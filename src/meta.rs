//! On-media format: superblock, log header, and log entries.
//!
//! Every type in this module is `#[repr(C)]` with `zerocopy` derives so it
//! can be read directly out of (or written directly into) a DAX mapping
//! with no intermediate copy beyond what `zerocopy`'s bounds-checked
//! accessors already do. Nothing here assumes a particular host's
//! endianness beyond "whatever this build runs on": famfs doesn't
//! support mixed-endian clusters.

use crc32fast::Hasher;
use uuid::Uuid;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{FamfsError, FatalKind, SuperblockProblem};

/// famfs magic, derived from `0x09211963` (a founding date) packed
/// against the ASCII tag `"FAMF"`.
pub const FAMFS_MAGIC: u64 = 0x09211963_46414d46;
/// On-media format version this build produces and expects.
pub const FAMFS_VERSION: u64 = 47;
/// Fixed offset of the log, and size of the superblock region.
pub const LOG_OFFSET: u64 = 0x0020_0000; // 2 MiB
/// Minimum log length.
pub const MIN_LOG_LEN: u64 = 0x0080_0000; // 8 MiB
pub const ALLOC_UNIT_4K: u64 = 4096;
pub const ALLOC_UNIT_2M: u64 = 0x0020_0000;

pub const MAX_PATHLEN: usize = 80;
pub const MAX_DEVNAME: usize = 64;
pub const MAX_SIMPLE_EXTENTS: usize = 8;

pub const FAMFS_LOG_MAGIC: u64 = 0x0000_badc_afef_00d_u64;

bitflags::bitflags! {
    /// `ts_sb_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SbFlags: u32 {
        /// This device holds the primary superblock of its famfs instance.
        const PRIMARY_SB = 1 << 0;
    }
}

bitflags::bitflags! {
    /// `fm_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileFlags: u32 {
        /// Every host, including the master, materializes this file read-only.
        const ALL_HOSTS_RO = 1 << 0;
        /// Every host materializes this file with its logged mode verbatim;
        /// the usual client write-bit mask is skipped for it.
        const ALL_HOSTS_RW = 1 << 1;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RawDaxDev {
    pub size: u64,
    pub name: [u8; MAX_DEVNAME],
}

/// The 2 MiB region at offset 0 of the primary DAX device.
///
/// Field order here follows the on-media layout for readability; the CRC is
/// computed over an explicit canonical byte sequence (see
/// [`Superblock::canonical_bytes`]) that does *not* match this
/// declaration order, so changing this struct's field order is safe and
/// changing `canonical_bytes` is not.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct Superblock {
    pub magic: u64,
    pub version: u64,
    pub log_offset: u64,
    pub log_len: u64,
    pub alloc_unit: u64,
    pub fs_uuid: [u8; 16],
    pub dev_uuid: [u8; 16],
    pub system_uuid: [u8; 16],
    pub omf_major: u32,
    pub omf_minor: u32,
    pub sb_flags: u32,
    pub primary_daxdev: RawDaxDev,
    pub crc: u64,
}

pub enum SuperblockCheck {
    Ok,
    WrongVersion,
    Invalid(SuperblockProblem),
}

impl Superblock {
    /// The exact byte sequence covered by `crc`: `magic, version,
    /// log_offset, log_len, alloc_unit, omf_major, omf_minor, fs_uuid,
    /// dev_uuid, system_uuid`. Any divergence from this order invalidates
    /// every existing filesystem.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 * 5 + 4 * 2 + 16 * 3);
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.log_offset.to_le_bytes());
        buf.extend_from_slice(&self.log_len.to_le_bytes());
        buf.extend_from_slice(&self.alloc_unit.to_le_bytes());
        buf.extend_from_slice(&self.omf_major.to_le_bytes());
        buf.extend_from_slice(&self.omf_minor.to_le_bytes());
        buf.extend_from_slice(&self.fs_uuid);
        buf.extend_from_slice(&self.dev_uuid);
        buf.extend_from_slice(&self.system_uuid);
        buf
    }

    pub fn canonical_crc(&self) -> u64 {
        crc32(&self.canonical_bytes()) as u64
    }

    pub fn new(
        log_len: u64,
        alloc_unit: u64,
        fs_uuid: Uuid,
        dev_uuid: Uuid,
        system_uuid: Uuid,
        daxdev_size: u64,
        daxdev_name: &str,
    ) -> Self {
        let mut name = [0u8; MAX_DEVNAME];
        let bytes = daxdev_name.as_bytes();
        let n = bytes.len().min(MAX_DEVNAME);
        name[..n].copy_from_slice(&bytes[..n]);

        let mut sb = Superblock {
            magic: FAMFS_MAGIC,
            version: FAMFS_VERSION,
            log_offset: LOG_OFFSET,
            log_len,
            alloc_unit,
            fs_uuid: *fs_uuid.as_bytes(),
            dev_uuid: *dev_uuid.as_bytes(),
            system_uuid: *system_uuid.as_bytes(),
            omf_major: 1,
            omf_minor: 0,
            sb_flags: 1, // FAMFS_PRIMARY_SB
            primary_daxdev: RawDaxDev { size: daxdev_size, name },
            crc: 0,
        };
        sb.crc = sb.canonical_crc();
        sb
    }

    /// `check_super(sb)`: distinguishes "no filesystem" from "wrong
    /// version" from "ok".
    pub fn check(&self) -> SuperblockCheck {
        if self.magic != FAMFS_MAGIC {
            return SuperblockCheck::Invalid(SuperblockProblem::BadMagic);
        }
        if self.version != FAMFS_VERSION {
            return SuperblockCheck::WrongVersion;
        }
        if self.alloc_unit != ALLOC_UNIT_4K && self.alloc_unit != ALLOC_UNIT_2M {
            return SuperblockCheck::Invalid(SuperblockProblem::UnsupportedAllocUnit(
                self.alloc_unit,
            ));
        }
        if self.crc != self.canonical_crc() {
            return SuperblockCheck::Invalid(SuperblockProblem::BadCrc);
        }
        SuperblockCheck::Ok
    }

    pub fn check_ok(&self) -> Result<(), FamfsError> {
        match self.check() {
            SuperblockCheck::Ok => Ok(()),
            SuperblockCheck::WrongVersion => Err(FamfsError::Fatal(FatalKind::VersionMismatch {
                found: self.version,
                expected: FAMFS_VERSION,
            })),
            SuperblockCheck::Invalid(p) => Err(FamfsError::Fatal(FatalKind::InvalidSuperblock(p))),
        }
    }

    pub fn is_master(&self, local_system_uuid: Uuid) -> bool {
        self.system_uuid == *local_system_uuid.as_bytes()
    }

    pub fn flags(&self) -> SbFlags {
        SbFlags::from_bits_truncate(self.sb_flags)
    }
}

/// The fixed header at the start of the log region. The entries array
/// that follows it is addressed separately (see [`crate::log`]) rather
/// than embedded as a flexible array member, per the design notes: a
/// movable Rust value should never contain a trailing VLA.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct LogHeader {
    pub magic: u64,
    pub len: u64,
    pub last_index: u64,
    pub header_crc: u64,
    pub next_seqnum: u64,
    pub next_index: u64,
}

impl LogHeader {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&self.len.to_le_bytes());
        buf.extend_from_slice(&self.last_index.to_le_bytes());
        buf
    }

    pub fn canonical_crc(&self) -> u64 {
        crc32(&self.canonical_bytes()) as u64
    }

    pub fn new(len: u64, last_index: u64) -> Self {
        let mut h = LogHeader {
            magic: FAMFS_LOG_MAGIC,
            len,
            last_index,
            header_crc: 0,
            next_seqnum: 0,
            next_index: 0,
        };
        h.header_crc = h.canonical_crc();
        h
    }

    pub fn check(&self) -> Result<(), FamfsError> {
        if self.magic != FAMFS_LOG_MAGIC || self.header_crc != self.canonical_crc() {
            return Err(FamfsError::Fatal(FatalKind::InvalidLogHeader));
        }
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.next_index > self.last_index
    }

    pub fn slots_available(&self) -> u64 {
        self.last_index.saturating_sub(self.next_index).saturating_add(1)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable, PartialEq, Eq)]
pub struct RawSimpleExtent {
    pub devindex: u64,
    pub offset: u64,
    pub length: u64,
}

impl RawSimpleExtent {
    pub fn new(devindex: u64, offset: u64, length: u64) -> Self {
        RawSimpleExtent { devindex, offset, length }
    }
}

/// `fmap_ext_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExtType {
    Simple = 0,
    Interleave = 1,
}

/// The file map as it's actually stored. Both extent kinds are triples of
/// `(devindex, offset, length)`, so a single fixed array backs both;
/// `ext_type` and `chunk_size` disambiguate how to read it back, rather
/// than a C union discriminated at the byte level.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RawFmap {
    pub ext_type: u32,
    pub nextents: u32,
    pub chunk_size: u64,
    pub extents: [RawSimpleExtent; MAX_SIMPLE_EXTENTS],
}

impl RawFmap {
    pub fn simple(extents: &[RawSimpleExtent]) -> Self {
        assert!(!extents.is_empty() && extents.len() <= MAX_SIMPLE_EXTENTS);
        let mut arr = [RawSimpleExtent::new(0, 0, 0); MAX_SIMPLE_EXTENTS];
        arr[..extents.len()].copy_from_slice(extents);
        RawFmap {
            ext_type: ExtType::Simple as u32,
            nextents: extents.len() as u32,
            chunk_size: 0,
            extents: arr,
        }
    }

    pub fn interleaved(chunk_size: u64, strips: &[RawSimpleExtent]) -> Self {
        assert!(!strips.is_empty() && strips.len() <= MAX_SIMPLE_EXTENTS);
        let mut arr = [RawSimpleExtent::new(0, 0, 0); MAX_SIMPLE_EXTENTS];
        arr[..strips.len()].copy_from_slice(strips);
        RawFmap {
            ext_type: ExtType::Interleave as u32,
            nextents: strips.len() as u32,
            chunk_size,
            extents: arr,
        }
    }

    pub fn ext_type(&self) -> ExtType {
        if self.ext_type == ExtType::Interleave as u32 {
            ExtType::Interleave
        } else {
            ExtType::Simple
        }
    }

    pub fn simple_extents(&self) -> &[RawSimpleExtent] {
        &self.extents[..self.nextents as usize]
    }

    pub fn strips(&self) -> &[RawSimpleExtent] {
        &self.extents[..self.nextents as usize]
    }

    /// Total logical bytes this map can address: sum of simple extent
    /// lengths, or `nstrips * strip_len` for an interleaved map (the
    /// strip length is each strip's own `length`, not `chunk_size`).
    pub fn mapped_len(&self) -> u64 {
        self.simple_extents().iter().map(|e| e.length).sum()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RawFileMeta {
    pub size: u64,
    pub flags: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub relpath: [u8; MAX_PATHLEN],
    pub fmap: RawFmap,
}

impl RawFileMeta {
    pub fn file_flags(&self) -> FileFlags {
        FileFlags::from_bits_truncate(self.flags)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RawMkdirMeta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub relpath: [u8; MAX_PATHLEN],
}

pub const FILE_META_SIZE: usize = core::mem::size_of::<RawFileMeta>();
pub const MKDIR_META_SIZE: usize = core::mem::size_of::<RawMkdirMeta>();
/// The entry payload area is sized to the larger of the two variants
/// (always `RawFileMeta`, in this layout), the same way a C union's
/// `sizeof` is the size of its largest member.
pub const ENTRY_PAYLOAD_SIZE: usize = FILE_META_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogEntryType {
    File = 0,
    Mkdir = 1,
}

/// A single, fixed-size slot in the log's entries array.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RawLogEntry {
    pub seqnum: u64,
    pub entry_type: u32,
    pub _pad: u32,
    pub payload: [u8; ENTRY_PAYLOAD_SIZE],
    pub entry_crc: u64,
}

impl RawLogEntry {
    pub fn canonical_bytes(&self) -> &[u8] {
        // Every field except the trailing CRC, in declaration order; since
        // `RawLogEntry` is `repr(C)` with `entry_crc` declared last, this
        // is simply a prefix slice of the struct's own bytes.
        let all = self.as_bytes();
        &all[..all.len() - 8]
    }

    pub fn canonical_crc(&self) -> u64 {
        crc32(self.canonical_bytes()) as u64
    }

    /// `validate(entry, i)`: `seqnum == i && crc matches`.
    pub fn validate(&self, index: u64) -> bool {
        self.seqnum == index && self.entry_crc == self.canonical_crc()
    }

    pub fn entry_type(&self) -> Option<LogEntryType> {
        match self.entry_type {
            0 => Some(LogEntryType::File),
            1 => Some(LogEntryType::Mkdir),
            _ => None,
        }
    }

    pub fn file_meta(&self) -> Option<RawFileMeta> {
        if self.entry_type().is_some_and(|t| t == LogEntryType::File) {
            RawFileMeta::read_from_bytes(&self.payload[..FILE_META_SIZE]).ok()
        } else {
            None
        }
    }

    pub fn mkdir_meta(&self) -> Option<RawMkdirMeta> {
        if self.entry_type().is_some_and(|t| t == LogEntryType::Mkdir) {
            RawMkdirMeta::read_from_bytes(&self.payload[..MKDIR_META_SIZE]).ok()
        } else {
            None
        }
    }

    pub fn new_file(seqnum: u64, meta: &RawFileMeta) -> Self {
        let mut payload = [0u8; ENTRY_PAYLOAD_SIZE];
        payload.copy_from_slice(meta.as_bytes());
        let mut e = RawLogEntry {
            seqnum,
            entry_type: LogEntryType::File as u32,
            _pad: 0,
            payload,
            entry_crc: 0,
        };
        e.entry_crc = e.canonical_crc();
        e
    }

    pub fn new_mkdir(seqnum: u64, meta: &RawMkdirMeta) -> Self {
        let mut payload = [0u8; ENTRY_PAYLOAD_SIZE];
        payload[..MKDIR_META_SIZE].copy_from_slice(meta.as_bytes());
        let mut e = RawLogEntry {
            seqnum,
            entry_type: LogEntryType::Mkdir as u32,
            _pad: 0,
            payload,
            entry_crc: 0,
        };
        e.entry_crc = e.canonical_crc();
        e
    }
}

pub fn relpath_to_bytes(path: &str) -> [u8; MAX_PATHLEN] {
    let mut buf = [0u8; MAX_PATHLEN];
    let bytes = path.as_bytes();
    let n = bytes.len().min(MAX_PATHLEN);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

pub fn bytes_to_relpath(buf: &[u8; MAX_PATHLEN]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub fn round_up(value: u64, unit: u64) -> u64 {
    (value + unit - 1) / unit * unit
}

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuids() -> (Uuid, Uuid, Uuid) {
        (Uuid::nil(), Uuid::nil(), Uuid::nil())
    }

    #[test]
    fn superblock_round_trips_crc() {
        let (fs, dev, sys) = uuids();
        let sb = Superblock::new(MIN_LOG_LEN, ALLOC_UNIT_2M, fs, dev, sys, 1 << 32, "dax0.0");
        assert!(matches!(sb.check(), SuperblockCheck::Ok));
    }

    #[test]
    fn superblock_bad_crc_is_invalid() {
        let (fs, dev, sys) = uuids();
        let mut sb = Superblock::new(MIN_LOG_LEN, ALLOC_UNIT_2M, fs, dev, sys, 1 << 32, "dax0.0");
        sb.crc ^= 1;
        assert!(matches!(
            sb.check(),
            SuperblockCheck::Invalid(SuperblockProblem::BadCrc)
        ));
    }

    #[test]
    fn superblock_wrong_version_is_distinguished() {
        let (fs, dev, sys) = uuids();
        let mut sb = Superblock::new(MIN_LOG_LEN, ALLOC_UNIT_2M, fs, dev, sys, 1 << 32, "dax0.0");
        sb.version += 1;
        assert!(matches!(sb.check(), SuperblockCheck::WrongVersion));
    }

    #[test]
    fn log_header_round_trips() {
        let h = LogHeader::new(MIN_LOG_LEN, 1023);
        h.check().unwrap();
    }

    #[test]
    fn log_entry_validate_catches_corruption() {
        let meta = RawFileMeta {
            size: 4096,
            flags: 0,
            uid: 0,
            gid: 0,
            mode: 0o644,
            relpath: relpath_to_bytes("a"),
            fmap: RawFmap::simple(&[RawSimpleExtent::new(0, LOG_OFFSET + MIN_LOG_LEN, 4096)]),
        };
        let mut entry = RawLogEntry::new_file(3, &meta);
        assert!(entry.validate(3));
        entry.payload[0] ^= 0xff;
        assert!(!entry.validate(3));
    }

    #[test]
    fn fmap_simple_round_trip() {
        let extents = [
            RawSimpleExtent::new(0, LOG_OFFSET + MIN_LOG_LEN, ALLOC_UNIT_2M),
            RawSimpleExtent::new(0, LOG_OFFSET + MIN_LOG_LEN + ALLOC_UNIT_2M, ALLOC_UNIT_2M),
        ];
        let fmap = RawFmap::simple(&extents);
        assert_eq!(fmap.ext_type(), ExtType::Simple);
        assert_eq!(fmap.simple_extents(), &extents);
    }
}
