//! The two-phase bitmap allocator.
//!
//! Phase one, [`Bitmap::build`], replays a log to derive which
//! `alloc_unit`-sized regions of the device are already spoken for. Phase
//! two, [`Bitmap::alloc_contiguous`] / [`Bitmap::alloc_interleaved`], finds
//! free regions for new files. The bitmap itself is never persisted: it's
//! rebuilt by every session, from the log, which is the persisted source
//! of truth.

use log::{trace, warn};
use serde::{Deserialize, Deserializer};

use crate::error::{FamfsError, FatalKind};
use crate::meta::{round_up, RawSimpleExtent};

/// `build_bitmap`'s aggregate stats, and the `fsck`-style report built
/// from them.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitmapStats {
    pub collisions: u64,
    pub sum_of_file_sizes: u64,
    pub allocated_bytes: u64,
}

impl BitmapStats {
    pub fn space_amplification(&self) -> f64 {
        if self.sum_of_file_sizes == 0 {
            1.0
        } else {
            self.allocated_bytes as f64 / self.sum_of_file_sizes as f64
        }
    }
}

/// A human-meaningful bitmap report.
#[derive(Debug, Clone, Copy)]
pub struct BitmapReport {
    pub capacity_bytes: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
    pub collisions: u64,
    pub space_amp: f64,
}

/// A bit-per-`alloc_unit` allocation map over a device of a known size.
#[derive(Debug, Clone)]
pub struct Bitmap {
    bits: Vec<u8>,
    nbits: u64,
    alloc_unit: u64,
    devsize: u64,
    stats: BitmapStats,
    /// Next bit to consider for a session-scoped contiguous allocation.
    /// Persists across `alloc_contiguous_session` calls so repeated
    /// allocations in one session are O(total-bits) rather than
    /// O(bits^2); reset to 0 before every interleaved allocation.
    cursor: u64,
}

fn bit_bytes(nbits: u64) -> usize {
    ((nbits + 7) / 8) as usize
}

impl Bitmap {
    fn set(&mut self, bit: u64) -> bool {
        let byte = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        let was_set = self.bits[byte] & mask != 0;
        self.bits[byte] |= mask;
        was_set
    }

    fn clear(&mut self, bit: u64) -> bool {
        let byte = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        let was_set = self.bits[byte] & mask != 0;
        self.bits[byte] &= !mask;
        was_set
    }

    fn test(&self, bit: u64) -> bool {
        let byte = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);
        self.bits[byte] & mask != 0
    }

    fn set_range(&mut self, start_bit: u64, nbits: u64, alloc_sum: &mut u64) -> u64 {
        let mut collisions = 0;
        for bit in start_bit..start_bit + nbits {
            if self.set(bit) {
                collisions += 1;
            } else {
                *alloc_sum += self.alloc_unit;
            }
        }
        collisions
    }

    fn clear_range(&mut self, start_bit: u64, nbits: u64) {
        for bit in start_bit..start_bit + nbits {
            let was_set = self.clear(bit);
            assert!(was_set, "free_contiguous: bit {bit} was already clear");
        }
    }

    fn range_is_clear(&self, start_bit: u64, nbits: u64) -> bool {
        (start_bit..start_bit + nbits).all(|b| !self.test(b))
    }

    /// `build_bitmap(log, alloc_unit, devsize)`.
    pub fn build(log: &crate::log::Log, alloc_unit: u64, devsize: u64) -> Self {
        assert!(alloc_unit > 0 && alloc_unit.is_power_of_two());

        let nbits = (devsize + alloc_unit - 1) / alloc_unit;
        let mut bitmap = Bitmap {
            bits: vec![0u8; bit_bytes(nbits)],
            nbits,
            alloc_unit,
            devsize,
            stats: BitmapStats::default(),
            cursor: 0,
        };

        let mut alloc_sum = 0u64;
        // The superblock and log region is never referenced by the log
        // itself, so it's pre-marked by hand.
        let sb_log_len = crate::meta::LOG_OFFSET + log.header().len;
        bitmap.set_range(0, (sb_log_len + alloc_unit - 1) / alloc_unit, &mut alloc_sum);

        let mut fsize_sum = 0u64;
        let mut collisions = 0u64;

        for i in 0..log.header().next_index {
            let Some(entry) = log.entry(i) else { continue };
            if !entry.validate(i) {
                continue;
            }
            let Some(meta) = entry.file_meta() else { continue };
            fsize_sum += meta.size;

            // Simple and interleaved file maps share the same
            // (devindex, offset, length) backing array; every entry in it
            // is a region to mark allocated regardless of ext_type.
            for ext in meta.fmap.simple_extents() {
                collisions += bitmap.mark_extent(*ext, &mut alloc_sum);
            }
        }

        bitmap.stats = BitmapStats {
            collisions,
            sum_of_file_sizes: fsize_sum,
            allocated_bytes: alloc_sum,
        };
        bitmap
    }

    fn mark_extent(&mut self, ext: RawSimpleExtent, alloc_sum: &mut u64) -> u64 {
        assert_eq!(ext.offset % self.alloc_unit, 0, "unaligned extent offset");
        let start = ext.offset / self.alloc_unit;
        let nbits = (ext.length + self.alloc_unit - 1) / self.alloc_unit;
        let collisions = self.set_range(start, nbits, alloc_sum);
        if collisions > 0 {
            warn!(
                "bitmap: {collisions} collision(s) marking extent offset={} len={}",
                ext.offset, ext.length
            );
        }
        collisions
    }

    pub fn stats(&self) -> BitmapStats {
        self.stats
    }

    pub fn report(&self) -> BitmapReport {
        let allocated = (0..self.nbits).filter(|&b| self.test(b)).count() as u64 * self.alloc_unit;
        BitmapReport {
            capacity_bytes: self.devsize,
            allocated_bytes: allocated,
            free_bytes: self.devsize.saturating_sub(allocated),
            collisions: self.stats.collisions,
            space_amp: self.stats.space_amplification(),
        }
    }

    pub fn nbits(&self) -> u64 {
        self.nbits
    }

    /// `alloc_contiguous(bitmap, size, start, range_size)`. `range_size`
    /// of `0` means "search to the end of the device".
    pub fn alloc_contiguous(
        &mut self,
        size: u64,
        start_bit: u64,
        range_size_bits: u64,
    ) -> Result<u64, FamfsError> {
        let required = (size + self.alloc_unit - 1) / self.alloc_unit;
        let limit = if range_size_bits == 0 {
            self.nbits
        } else {
            (start_bit + range_size_bits).min(self.nbits)
        };

        if required == 0 || start_bit + required > limit {
            return Err(FamfsError::Fatal(FatalKind::NoSpace));
        }

        let mut i = start_bit;
        while i + required <= limit {
            if self.range_is_clear(i, required) {
                let mut alloc_sum = 0;
                self.set_range(i, required, &mut alloc_sum);
                let offset = i * self.alloc_unit;
                if offset == 0 {
                    // Never hand out offset 0; it belongs to the superblock
                    // and is pre-marked allocated, so this should be
                    // unreachable in practice. Guard it anyway.
                    self.clear_range(i, required);
                    return Err(FamfsError::Fatal(FatalKind::NoSpace));
                }
                trace!("alloc_contiguous: offset={offset} len={size} bits=[{i},{})", i + required);
                return Ok(offset);
            }
            i += 1;
        }
        Err(FamfsError::Fatal(FatalKind::NoSpace))
    }

    /// The session's persisted allocation cursor: the next bit position a
    /// session-scoped contiguous allocation will begin scanning from.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Reset the session's allocation cursor to 0. Called before every
    /// interleaved allocation, per the session cursor's reset rule.
    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    /// `alloc_contiguous`, scanning forward from the session's persisted
    /// cursor rather than a caller-supplied start, and advancing the
    /// cursor to `i + required` on success so later calls in the same
    /// session never rescan already-occupied prefix bits.
    pub fn alloc_contiguous_session(&mut self, size: u64) -> Result<u64, FamfsError> {
        let required = (size + self.alloc_unit - 1) / self.alloc_unit;
        let offset = self.alloc_contiguous(size, self.cursor, 0)?;
        self.cursor = offset / self.alloc_unit + required;
        Ok(offset)
    }

    /// `free_contiguous(bitmap, offset, len)`.
    pub fn free_contiguous(&mut self, offset: u64, len: u64) {
        assert_eq!(offset % self.alloc_unit, 0);
        let start = offset / self.alloc_unit;
        let nbits = (len + self.alloc_unit - 1) / self.alloc_unit;
        self.clear_range(start, nbits);
    }

    pub fn alloc_unit(&self) -> u64 {
        self.alloc_unit
    }
}

/// Parameters for interleaved (striped) allocation, as carried by
/// `.meta/.alloc.cfg` or supplied directly to `mkfile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct InterleaveParams {
    pub nbuckets: u64,
    pub nstrips: u64,
    #[serde(deserialize_with = "deserialize_chunk_size")]
    pub chunk_size: u64,
}

/// The parsed shape of `.meta/.alloc.cfg`: currently just the default
/// interleaved-allocation policy applied when a caller doesn't supply its
/// own [`InterleaveParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AllocConfig {
    pub interleaved_alloc: InterleaveParams,
}

impl AllocConfig {
    pub fn parse(text: &str) -> Result<Self, FamfsError> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Accepts either a bare integer or a `famfs_lib`-style size string (a
/// decimal integer plus an optional `k`/`K`, `m`/`M`, `g`/`G` 1024-based
/// multiplier suffix) for `chunk_size`.
fn deserialize_chunk_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u64),
        Str(String),
    }
    match Repr::deserialize(deserializer)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) => parse_size_suffix(&s).map_err(serde::de::Error::custom),
    }
}

/// `k`/`K` -> 1024, `m`/`M` -> 1024^2, `g`/`G` -> 1024^3, matching
/// `get_multiplier` in the original CLI tooling this config format is
/// drawn from.
fn parse_size_suffix(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, mult) = match s.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&s[..s.len() - 1], 1024u64),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&s[..s.len() - 1], 1024 * 1024),
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1u64),
    };
    digits.trim().parse::<u64>().map(|n| n * mult).map_err(|e| format!("invalid chunk_size {s:?}: {e}"))
}

pub const FAMFS_MAX_NBUCKETS: u64 = 64;
/// Minimum bucket size, relaxable via `test_mode` in [`crate::session::SessionConfig`].
pub const MIN_BUCKET_SIZE: u64 = 1 << 30; // 1 GiB

impl InterleaveParams {
    pub fn validate(&self, devsize: u64, relaxed: bool) -> Result<(), FamfsError> {
        if !self.chunk_size.is_power_of_two() || self.chunk_size % crate::meta::ALLOC_UNIT_4K != 0
        {
            return Err(FamfsError::Fatal(FatalKind::InterleaveConfig(
                "chunk_size must be a power of two and a multiple of alloc_unit".into(),
            )));
        }
        if self.nstrips == 0 || self.nstrips > self.nbuckets {
            return Err(FamfsError::Fatal(FatalKind::InterleaveConfig(
                "nstrips must be nonzero and <= nbuckets".into(),
            )));
        }
        if self.nbuckets == 0 || self.nbuckets > FAMFS_MAX_NBUCKETS {
            return Err(FamfsError::Fatal(FatalKind::InterleaveConfig(format!(
                "nbuckets must be in [1, {FAMFS_MAX_NBUCKETS}]"
            ))));
        }
        let bucket_size = devsize / self.nbuckets;
        if !relaxed && bucket_size < MIN_BUCKET_SIZE {
            return Err(FamfsError::Fatal(FatalKind::InterleaveConfig(format!(
                "bucket size {bucket_size} is below the 1 GiB floor"
            ))));
        }
        Ok(())
    }

    fn bucket_range(&self, devsize: u64, bucket: u64) -> (u64, u64) {
        let bucket_size = devsize / self.nbuckets;
        (bucket * bucket_size, bucket_size)
    }
}

/// Result of a successful interleaved allocation: one `INTERLEAVE` extent
/// worth of strips, plus the derived stripe geometry.
pub struct InterleavedAlloc {
    pub chunk_size: u64,
    pub strips: Vec<RawSimpleExtent>,
    pub nstripes: u64,
}

/// Fisher-Yates shuffle over `0..n`, driven by a caller-supplied RNG
/// closure so tests can seed it deterministically.
fn shuffled_indices(n: u64, mut rand_below: impl FnMut(u64) -> u64) -> Vec<u64> {
    let mut v: Vec<u64> = (0..n).collect();
    for i in (1..v.len()).rev() {
        let j = rand_below((i + 1) as u64) as usize;
        v.swap(i, j);
    }
    v
}

impl Bitmap {
    /// `alloc_interleaved(params, size)`. Degrades to contiguous when
    /// `size < chunk_size`.
    pub fn alloc_interleaved(
        &mut self,
        params: InterleaveParams,
        size: u64,
        relaxed_bucket_floor: bool,
        rand_below: impl FnMut(u64) -> u64,
    ) -> Result<InterleavedAlloc, FamfsError> {
        params.validate(self.devsize, relaxed_bucket_floor)?;
        self.reset_cursor();

        if size < params.chunk_size {
            let offset = self.alloc_contiguous(size, 0, 0)?;
            return Ok(InterleavedAlloc {
                chunk_size: params.chunk_size,
                strips: vec![RawSimpleExtent::new(0, offset, round_up(size, self.alloc_unit))],
                nstripes: 1,
            });
        }

        let stripe_size = params.nstrips * params.chunk_size;
        let nstripes = (size + stripe_size - 1) / stripe_size;
        let strip_size = nstripes * params.chunk_size;

        let order = shuffled_indices(params.nbuckets, rand_below);
        let mut strips = Vec::with_capacity(params.nstrips as usize);

        for bucket in order {
            if strips.len() as u64 == params.nstrips {
                break;
            }
            let (bucket_start, bucket_len) = params.bucket_range(self.devsize, bucket);
            let start_bit = bucket_start / self.alloc_unit;
            let range_bits = bucket_len / self.alloc_unit;
            if let Ok(offset) = self.alloc_contiguous(strip_size, start_bit, range_bits) {
                strips.push(RawSimpleExtent::new(0, offset, strip_size));
            }
        }

        if strips.len() as u64 != params.nstrips {
            for s in &strips {
                self.free_contiguous(s.offset, s.length);
            }
            return Err(FamfsError::Fatal(FatalKind::NoSpace));
        }

        Ok(InterleavedAlloc { chunk_size: params.chunk_size, strips, nstripes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Log;
    use crate::meta::{relpath_to_bytes, RawFileMeta, RawFmap, LOG_OFFSET, MIN_LOG_LEN};

    fn empty_log(last_index: u64) -> Log {
        Log::new_in_memory(MIN_LOG_LEN, last_index)
    }

    #[test]
    fn build_is_pure_and_collision_free_for_clean_log() {
        let mut log = empty_log(15);
        let meta = RawFileMeta {
            size: 1 << 21,
            flags: 0,
            uid: 0,
            gid: 0,
            mode: 0o644,
            relpath: relpath_to_bytes("a"),
            fmap: RawFmap::simple(&[RawSimpleExtent::new(0, LOG_OFFSET + MIN_LOG_LEN, 1 << 21)]),
        };
        log.append_file(&meta).unwrap();

        let devsize = 1u64 << 32;
        let b1 = Bitmap::build(&log, crate::meta::ALLOC_UNIT_2M, devsize);
        let b2 = Bitmap::build(&log, crate::meta::ALLOC_UNIT_2M, devsize);
        assert_eq!(b1.stats().collisions, 0);
        assert_eq!(b2.stats().collisions, 0);
        assert_eq!(b1.bits, b2.bits);
    }

    #[test]
    fn contiguous_alloc_never_returns_zero_and_advances_forward() {
        let log = empty_log(15);
        let devsize = 1u64 << 32;
        let mut bm = Bitmap::build(&log, crate::meta::ALLOC_UNIT_2M, devsize);
        let a = bm.alloc_contiguous(1 << 21, 0, 0).unwrap();
        assert_ne!(a, 0);
        assert_eq!(a % crate::meta::ALLOC_UNIT_2M, 0);
        let b = bm.alloc_contiguous(1 << 21, 0, 0).unwrap();
        assert!(b > a);
    }

    #[test]
    fn session_cursor_persists_and_skips_already_occupied_prefix() {
        let log = empty_log(15);
        let devsize = 1u64 << 32;
        let mut bm = Bitmap::build(&log, crate::meta::ALLOC_UNIT_2M, devsize);
        let a = bm.alloc_contiguous_session(1 << 21).unwrap();
        let cursor_after_a = bm.cursor();
        let b = bm.alloc_contiguous_session(1 << 21).unwrap();
        assert!(b > a);
        assert_eq!(cursor_after_a, a / crate::meta::ALLOC_UNIT_2M + 1);
        assert_eq!(bm.cursor(), cursor_after_a + 1);

        bm.reset_cursor();
        assert_eq!(bm.cursor(), 0);
    }

    #[test]
    fn free_then_realloc_reuses_space() {
        let log = empty_log(15);
        let devsize = 1u64 << 32;
        let mut bm = Bitmap::build(&log, crate::meta::ALLOC_UNIT_2M, devsize);
        let a = bm.alloc_contiguous(1 << 21, 0, 0).unwrap();
        bm.free_contiguous(a, 1 << 21);
        let b = bm.alloc_contiguous(1 << 21, 0, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn interleaved_alloc_degrades_to_contiguous_for_small_files() {
        let log = empty_log(15);
        let devsize = 1u64 << 32;
        let mut bm = Bitmap::build(&log, crate::meta::ALLOC_UNIT_2M, devsize);
        let params = InterleaveParams { nbuckets: 4, nstrips: 2, chunk_size: 1 << 21 };
        let alloc = bm.alloc_interleaved(params, 1 << 20, true, |n| n.saturating_sub(1)).unwrap();
        assert_eq!(alloc.strips.len(), 1);
    }

    #[test]
    fn interleaved_alloc_picks_nstrips_buckets() {
        let log = empty_log(15);
        let devsize = 1u64 << 32; // 4 GiB
        let mut bm = Bitmap::build(&log, crate::meta::ALLOC_UNIT_2M, devsize);
        let params = InterleaveParams { nbuckets: 4, nstrips: 2, chunk_size: 1 << 21 };
        let alloc = bm
            .alloc_interleaved(params, 16 << 20, true, |n| n.saturating_sub(1))
            .unwrap();
        assert_eq!(alloc.strips.len(), 2);
        assert_eq!(alloc.nstripes, 4);
        assert_eq!(alloc.strips[0].length, 4 * (1 << 21));
    }

    #[test]
    fn alloc_config_parses_plain_and_suffixed_chunk_size() {
        let cfg = AllocConfig::parse("interleaved_alloc:\n  nbuckets: 4\n  nstrips: 2\n  chunk_size: 2097152\n").unwrap();
        assert_eq!(cfg.interleaved_alloc.chunk_size, 1 << 21);

        let cfg = AllocConfig::parse("interleaved_alloc:\n  nbuckets: 4\n  nstrips: 2\n  chunk_size: 2M\n").unwrap();
        assert_eq!(cfg.interleaved_alloc.chunk_size, 2 << 20);

        let cfg = AllocConfig::parse("interleaved_alloc:\n  nbuckets: 64\n  nstrips: 1\n  chunk_size: 1G\n").unwrap();
        assert_eq!(cfg.interleaved_alloc.chunk_size, 1 << 30);
    }

    #[test]
    fn alloc_config_rejects_garbage_chunk_size() {
        let err = AllocConfig::parse("interleaved_alloc:\n  nbuckets: 4\n  nstrips: 2\n  chunk_size: banana\n");
        assert!(err.is_err());
    }
}
