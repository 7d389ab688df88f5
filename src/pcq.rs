//! The producer/consumer queue primitive: two famfs files
//! exercising the crate's own cache-coherence discipline as the
//! canonical demonstration of it, rather than merely documenting it.
//!
//! A PCQ has exactly one producer and one consumer. Both sides see the
//! same backing bytes (in a real deployment, two mmapped famfs files; in
//! tests, two `Vec<u8>` buffers), so the types here work directly on byte
//! slices and never assume a particular backing.

use std::thread::yield_now;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::cache::{flush_range, invalidate_range, CacheMode};
use crate::error::{FamfsError, FatalKind};
use crate::meta::crc32;

pub const PCQ_MAGIC: u64 = 0x0050_4351_7175_6575; // "equeuePCQ" truncated to 8 bytes, matching a POSIX-magic-style tag
pub const PCQ_CONSUMER_MAGIC: u64 = 0x0043_4f4e_53554d45; // "CONSUME"
/// Bytes of padding between index and seq counters to keep them off the
/// same cache line.
const PAD: usize = 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ProducerHeader {
    pub magic: u64,
    pub nbuckets: u64,
    pub bucket_size: u64,
    pub bucket_array_offset: u64,
    pub producer_index: u64,
    _pad1: [u8; PAD],
    pub next_seq: u64,
    _pad2: [u8; PAD],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct ConsumerHeader {
    pub consumer_magic: u64,
    pub consumer_index: u64,
    _pad1: [u8; PAD],
    pub next_seq: u64,
    _pad2: [u8; PAD],
}

const PRODUCER_HEADER_SIZE: usize = core::mem::size_of::<ProducerHeader>();
const CONSUMER_HEADER_SIZE: usize = core::mem::size_of::<ConsumerHeader>();

impl ProducerHeader {
    pub fn new(nbuckets: u64, bucket_size: u64) -> Self {
        ProducerHeader {
            magic: PCQ_MAGIC,
            nbuckets,
            bucket_size,
            bucket_array_offset: PRODUCER_HEADER_SIZE as u64,
            producer_index: 0,
            _pad1: [0; PAD],
            next_seq: 0,
            _pad2: [0; PAD],
        }
    }
}

impl ConsumerHeader {
    pub fn new() -> Self {
        ConsumerHeader {
            consumer_magic: PCQ_CONSUMER_MAGIC,
            consumer_index: 0,
            _pad1: [0; PAD],
            next_seq: 0,
            _pad2: [0; PAD],
        }
    }
}

impl Default for ConsumerHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a blocked `put`/`get` yields cooperatively and retries, or
/// fails immediately with [`FatalKind`]'s would-block case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Wait,
    NoWait,
}

/// Owns both files' backing bytes and the bucket geometry. Exactly one
/// producer handle and one consumer handle are expected to exist per
/// queue; that invariant is enforced by callers via file-permission
/// gating, not by this type.
pub struct Pcq {
    producer_bytes: Vec<u8>,
    consumer_bytes: Vec<u8>,
    cache_mode: CacheMode,
}

fn bucket_offset(bucket_array_offset: u64, bucket_size: u64, index: u64) -> usize {
    (bucket_array_offset + index * bucket_size) as usize
}

impl Pcq {
    pub fn create(nbuckets: u64, bucket_size: u64, cache_mode: CacheMode) -> Result<Self, FamfsError> {
        if !bucket_size.is_power_of_two() {
            return Err(FamfsError::Fatal(FatalKind::InterleaveConfig(
                "pcq bucket_size must be a power of two".into(),
            )));
        }
        let producer_header = ProducerHeader::new(nbuckets, bucket_size);
        let producer_len = PRODUCER_HEADER_SIZE + (nbuckets * bucket_size) as usize;
        let mut producer_bytes = vec![0u8; producer_len];
        producer_bytes[..PRODUCER_HEADER_SIZE].copy_from_slice(producer_header.as_bytes());

        let consumer_bytes = ConsumerHeader::new().as_bytes().to_vec();

        Ok(Pcq { producer_bytes, consumer_bytes, cache_mode })
    }

    fn producer_header(&self) -> ProducerHeader {
        ProducerHeader::read_from_bytes(&self.producer_bytes[..PRODUCER_HEADER_SIZE]).unwrap()
    }

    fn write_producer_header(&mut self, h: &ProducerHeader) {
        self.producer_bytes[..PRODUCER_HEADER_SIZE].copy_from_slice(h.as_bytes());
    }

    fn consumer_header(&self) -> ConsumerHeader {
        ConsumerHeader::read_from_bytes(&self.consumer_bytes[..CONSUMER_HEADER_SIZE]).unwrap()
    }

    fn write_consumer_header(&mut self, h: &ConsumerHeader) {
        self.consumer_bytes[..CONSUMER_HEADER_SIZE].copy_from_slice(h.as_bytes());
    }

    /// Pending-message count, purely derived from the producer/consumer
    /// index pair.
    pub fn depth(&self) -> u64 {
        let p = self.producer_header();
        let c = self.consumer_header();
        let nbuckets = p.nbuckets;
        (p.producer_index + nbuckets - c.consumer_index) % nbuckets
    }

    /// `put(payload)`. Blocks (if `wait == Wait`) while the queue
    /// is full, invalidating the consumer-index cache line before each
    /// re-check.
    pub fn put(&mut self, payload: &[u8], wait: WaitMode) -> Result<u64, FamfsError> {
        loop {
            let producer = self.producer_header();
            let next_index = (producer.producer_index + 1) % producer.nbuckets;

            invalidate_range(&self.consumer_bytes[..CONSUMER_HEADER_SIZE], self.cache_mode);
            let consumer = self.consumer_header();

            if next_index == consumer.consumer_index {
                match wait {
                    WaitMode::NoWait => return Err(FamfsError::Fatal(FatalKind::QueueFull)),
                    WaitMode::Wait => {
                        yield_now();
                        continue;
                    }
                }
            }

            let seq = producer.next_seq;
            let bucket_size = producer.bucket_size as usize;
            assert!(payload.len() + 12 <= bucket_size, "payload too large for bucket");

            let mut buf = vec![0u8; bucket_size];
            buf[..payload.len()].copy_from_slice(payload);
            buf[bucket_size - 12..bucket_size - 4].copy_from_slice(&seq.to_le_bytes());
            let crc = crc32(&buf[..bucket_size - 4]);
            buf[bucket_size - 4..].copy_from_slice(&crc.to_le_bytes());

            let off = bucket_offset(producer.bucket_array_offset, producer.bucket_size, producer.producer_index);
            self.producer_bytes[off..off + bucket_size].copy_from_slice(&buf);
            flush_range(&self.producer_bytes[off..off + bucket_size], self.cache_mode);

            let mut new_header = producer;
            new_header.producer_index = next_index;
            new_header.next_seq = seq + 1;
            self.write_producer_header(&new_header);
            flush_range(&self.producer_bytes[..PRODUCER_HEADER_SIZE], self.cache_mode);

            return Ok(seq);
        }
    }

    /// `get()`. Returns the payload (without the trailing
    /// seq+crc), the message's sequence number, and retries up to twice
    /// on a CRC mismatch before treating it as a fatal coherence
    /// violation.
    pub fn get(&mut self, wait: WaitMode) -> Result<(Vec<u8>, u64), FamfsError> {
        loop {
            let consumer = self.consumer_header();

            invalidate_range(&self.producer_bytes[..PRODUCER_HEADER_SIZE], self.cache_mode);
            let producer = self.producer_header();

            if consumer.consumer_index == producer.producer_index {
                match wait {
                    WaitMode::NoWait => return Err(FamfsError::Fatal(FatalKind::QueueEmpty)),
                    WaitMode::Wait => {
                        yield_now();
                        continue;
                    }
                }
            }

            let bucket_size = producer.bucket_size as usize;
            let off = bucket_offset(producer.bucket_array_offset, producer.bucket_size, consumer.consumer_index);

            let mut validated = None;
            for attempt in 0..3 {
                if attempt > 0 {
                    invalidate_range(&self.producer_bytes[off..off + bucket_size], self.cache_mode);
                }
                let buf = &self.producer_bytes[off..off + bucket_size];
                let crc_stored = u32::from_le_bytes(buf[bucket_size - 4..].try_into().unwrap());
                let crc_computed = crc32(&buf[..bucket_size - 4]);
                let seq = u64::from_le_bytes(buf[bucket_size - 12..bucket_size - 4].try_into().unwrap());
                if crc_stored == crc_computed && seq == consumer.next_seq {
                    validated = Some((buf[..bucket_size - 12].to_vec(), seq));
                    break;
                }
            }

            let (payload, seq) = match validated {
                Some(v) => v,
                None => {
                    // Three strikes with a propagated flush still missing is
                    // a genuine cache-coherence violation, not staleness.
                    return Err(FamfsError::Fatal(FatalKind::QueueCorrupt { bucket: consumer.consumer_index }));
                }
            };

            let mut new_header = consumer;
            new_header.consumer_index = (consumer.consumer_index + 1) % producer.nbuckets;
            new_header.next_seq = seq + 1;
            self.write_consumer_header(&new_header);
            flush_range(&self.consumer_bytes[..CONSUMER_HEADER_SIZE], self.cache_mode);

            return Ok((payload, seq));
        }
    }
}
