//! The metadata log: header plus entries array, and the append path.
//!
//! The log is exposed as a header value plus an independent view over the
//! entries slice, never as a single Rust value with an embedded flexible
//! array member. [`Log`] owns the backing bytes
//! (either a plain `Vec<u8>` for tests, or a live `memmap2::MmapMut` for a
//! real session) behind [`LogBacking`], and every accessor goes through a
//! bounds-checked slice, never a raw pointer.

use std::ops::{Deref, DerefMut};

use log::{debug, warn};
use memmap2::MmapMut;
use zerocopy::{FromBytes, IntoBytes};

use crate::cache::{flush_range, invalidate_range, CacheMode};
use crate::error::{FamfsError, FatalKind, ItemErrorKind};
use crate::meta::{
    LogHeader, RawFileMeta, RawLogEntry, RawMkdirMeta, ENTRY_PAYLOAD_SIZE,
};

const HEADER_SIZE: usize = core::mem::size_of::<LogHeader>();
pub const ENTRY_SIZE: usize = core::mem::size_of::<RawLogEntry>();

/// Where the log's bytes actually live.
pub enum LogBacking {
    Owned(Vec<u8>),
    Mapped(MmapMut),
}

impl Deref for LogBacking {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match self {
            LogBacking::Owned(v) => v,
            LogBacking::Mapped(m) => m,
        }
    }
}

impl DerefMut for LogBacking {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            LogBacking::Owned(v) => v,
            LogBacking::Mapped(m) => m,
        }
    }
}

/// The log region: header at offset 0, entries starting at
/// [`HEADER_SIZE`], through `last_index`.
pub struct Log {
    backing: LogBacking,
    cache_mode: CacheMode,
}

fn entry_offset(index: u64) -> usize {
    HEADER_SIZE + index as usize * ENTRY_SIZE
}

impl Log {
    /// Formats a fresh, empty log of `len` bytes in a heap buffer, used
    /// by `mkfs` and by tests that don't need a real mapping.
    pub fn new_in_memory(len: u64, last_index: u64) -> Self {
        let mut backing = vec![0u8; len as usize];
        let header = LogHeader::new(len, last_index);
        backing[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        Log { backing: LogBacking::Owned(backing), cache_mode: CacheMode::Real }
    }

    /// Wraps an already-mmapped log region (opened and mapped by
    /// [`crate::session::LockedLogSession`]).
    pub fn from_mapping(mapping: MmapMut, cache_mode: CacheMode) -> Result<Self, FamfsError> {
        invalidate_range(&mapping[..HEADER_SIZE], cache_mode);
        let log = Log { backing: LogBacking::Mapped(mapping), cache_mode };
        log.header().check()?;
        Ok(log)
    }

    pub fn header(&self) -> LogHeader {
        LogHeader::read_from_bytes(&self.backing[..HEADER_SIZE])
            .expect("header region is exactly sizeof(LogHeader)")
    }

    fn write_header(&mut self, header: &LogHeader) {
        self.backing[..HEADER_SIZE].copy_from_slice(header.as_bytes());
    }

    /// Reads entry `index`. Returns `None` if `index` is out of the
    /// log's allocated range.
    pub fn entry(&self, index: u64) -> Option<RawLogEntry> {
        let header = self.header();
        if index > header.last_index {
            return None;
        }
        let off = entry_offset(index);
        if off + ENTRY_SIZE > self.backing.len() {
            return None;
        }
        RawLogEntry::read_from_bytes(&self.backing[off..off + ENTRY_SIZE]).ok()
    }

    /// Entry `index`, validated with exactly one retry after invalidating
    /// the entry's cache region: the client-side defense against
    /// observing an advanced cursor before the corresponding entry flush
    /// has propagated.
    pub fn entry_validated(&self, index: u64) -> Result<RawLogEntry, FamfsError> {
        let off = entry_offset(index);
        let end = (off + ENTRY_SIZE).min(self.backing.len());
        for attempt in 0..2 {
            if attempt > 0 {
                invalidate_range(&self.backing[off..end], self.cache_mode);
            }
            if let Some(entry) = self.entry(index) {
                if entry.validate(index) {
                    return Ok(entry);
                }
            }
        }
        Err(FamfsError::PerItem(ItemErrorKind::BadEntryCrc { index }))
    }

    fn flush_all(&self) {
        flush_range(&self.backing[..], self.cache_mode);
    }

    /// `append(log, entry)`. Not re-entrant: callers must hold the
    /// session's exclusive lock.
    fn append(&mut self, build: impl FnOnce(u64) -> RawLogEntry) -> Result<u64, FamfsError> {
        let mut header = self.header();
        if header.is_full() {
            return Err(FamfsError::Fatal(FatalKind::LogFull));
        }
        let seqnum = header.next_seqnum;
        let entry = build(seqnum);
        debug_assert_eq!(entry.seqnum, seqnum);

        let off = entry_offset(header.next_index);
        self.backing[off..off + ENTRY_SIZE].copy_from_slice(entry.as_bytes());

        header.next_seqnum += 1;
        header.next_index += 1;
        self.write_header(&header);

        // The whole log is flushed, not just the new entry: a reader may
        // then observe either the fully-coherent new entry with an
        // advanced cursor, or no change at all, but never a torn write.
        self.flush_all();
        debug!("log append: seqnum={seqnum} next_index={}", header.next_index);
        Ok(seqnum)
    }

    pub fn append_file(&mut self, meta: &RawFileMeta) -> Result<u64, FamfsError> {
        self.append(|seqnum| RawLogEntry::new_file(seqnum, meta))
    }

    pub fn append_mkdir(&mut self, meta: &RawMkdirMeta) -> Result<u64, FamfsError> {
        self.append(|seqnum| RawLogEntry::new_mkdir(seqnum, meta))
    }

    pub fn warn_if_near_full(&self) {
        let header = self.header();
        if header.slots_available() < 16 {
            warn!(
                "log nearly full: {} slot(s) remaining of {}",
                header.slots_available(),
                header.last_index + 1
            );
        }
    }
}

const _: () = assert!(ENTRY_PAYLOAD_SIZE > 0);
