//! On-media metadata format, allocator, log replay, and shadow-fs codec
//! for the famfs shared fabric-attached-memory file system.
//!
//! This crate covers the core famfs userspace library: the superblock
//! and log on-media layout ([`meta`]), the two-phase bitmap allocator
//! ([`bitmap`]), the locked-log session ([`session`]), log replay
//! ([`replay`]), the shadow-fs YAML codec ([`shadow`]), the
//! file-create/copy pipeline ([`pipeline`]), and the producer/consumer
//! queue primitive ([`pcq`]). The kernel module or FUSE server that
//! actually enforces file-to-memory mappings is out of scope; it is
//! represented here only as the [`mapping::MappingInstaller`] trait
//! boundary.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod bitmap;
pub mod cache;
pub mod error;
pub mod log;
pub mod mapping;
pub mod meta;
pub mod mount_options;
pub mod path;
pub mod pcq;
pub mod pipeline;
pub mod replay;
pub mod session;
pub mod shadow;
pub mod system;

pub use error::FamfsError;
pub use session::{LockedLogSession, SessionConfig};
