//! Cache-flush discipline.
//!
//! famfs assumes DAX memory is not necessarily cache-coherent across
//! hosts: every write to media is followed by a flush of exactly the
//! written range, and every read that might have been written by another
//! host is preceded by an invalidation of exactly the read range, with a
//! full fence bracketing the sequence. On x86_64 this is `clflush` (the
//! only flush instruction stable Rust exposes a safe-to-call intrinsic
//! for) plus `sfence`; elsewhere, a full atomic fence stands in.
//!
//! A single [`CacheMode`] value threads through the session and replay
//! paths instead of a process-wide static, so the "disable flushing to
//! reproduce weak-coherence bugs" test-mode flag is explicit state, not
//! a global.

const CACHE_LINE: usize = 64;

/// Whether cache flush/invalidate calls actually touch hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Real,
    /// Disables all flush/invalidate calls, so tests can reproduce bugs
    /// that only manifest under weak cache coherence.
    TestNoFlush,
}

/// Flush every cache line backing `bytes` from the CPU cache, with a
/// store fence on either side.
pub fn flush_range(bytes: &[u8], mode: CacheMode) {
    if mode == CacheMode::TestNoFlush || bytes.is_empty() {
        return;
    }
    barrier();
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: `_mm_clflush` requires a valid pointer; every line
        // touched falls within `bytes`, which the caller guarantees is a
        // live slice of the mapping for its entire length.
        unsafe {
            let base = bytes.as_ptr();
            let mut off = 0usize;
            while off < bytes.len() {
                std::arch::x86_64::_mm_clflush(base.add(off));
                off += CACHE_LINE;
            }
        }
    }
    barrier();
}

/// Invalidate the CPU cache for `bytes` before a read that may observe a
/// remote host's write. `clflush` both writes back and invalidates, so on
/// x86_64 this reuses the same primitive as [`flush_range`]; there is no
/// safe "drop without writeback" instruction to reach for instead.
pub fn invalidate_range(bytes: &[u8], mode: CacheMode) {
    flush_range(bytes, mode)
}

fn barrier() {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
