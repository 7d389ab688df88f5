//! The shadow-fs YAML codec: a textual stand-in for a famfs file's
//! metadata, used by the FUSE-famfs variant to carry a file's mode,
//! ownership, and extent list out-of-band to the FUSE server. Shadow
//! directories are real directories on disk (`materialize_dir` creates
//! them directly); only files get a YAML document, one per file.
//!
//! `emit` and `parse` are a `serde`/`serde_yaml` derive pair rather than a
//! hand-rolled pull-parser state machine: the round-trip contract (`parse
//! (emit(tree)) == tree`) is what the rest of the system depends on, and
//! `serde_yaml` already gives that for free over a derived `Serialize` /
//! `Deserialize` pair. The wire shape itself (`file:`, `0<octal>` modes,
//! `0x<hex>` extent offsets) is fixed by the FUSE server that reads it,
//! not chosen for convenience here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{FamfsError, ItemErrorKind};
use crate::meta::{ExtType, FileFlags, RawSimpleExtent};
use crate::replay::{ReplayedFile, ReplayedNode, ReplayedTree};

/// `offset`/`length`/`chunk_size` serialize as `0x<hex>` strings, the way
/// `famfs_yaml.c` emits them, rather than as plain YAML integers.
mod hex_u64 {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{value:x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        let digits = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")).unwrap_or(&raw);
        u64::from_str_radix(digits, 16).map_err(D::Error::custom)
    }
}

/// `mode` serializes as a leading-zero octal string (`0644`), matching
/// the spec's on-disk textual form.
mod octal_mode {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0{value:o}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let raw = String::deserialize(d)?;
        let digits = raw.strip_prefix('0').unwrap_or(&raw);
        if digits.is_empty() {
            return Ok(0);
        }
        u32::from_str_radix(digits, 8).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShadowSimpleExt {
    pub devindex: u64,
    #[serde(with = "hex_u64")]
    pub offset: u64,
    #[serde(with = "hex_u64")]
    pub length: u64,
}

impl From<RawSimpleExtent> for ShadowSimpleExt {
    fn from(e: RawSimpleExtent) -> Self {
        ShadowSimpleExt { devindex: e.devindex, offset: e.offset, length: e.length }
    }
}

impl From<&ShadowSimpleExt> for RawSimpleExtent {
    fn from(e: &ShadowSimpleExt) -> Self {
        RawSimpleExtent::new(e.devindex, e.offset, e.length)
    }
}

/// One striping group: the strip count and chunk size shared by every
/// strip, plus the strips themselves (each a plain extent).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShadowStripedExt {
    pub nstrips: u64,
    #[serde(with = "hex_u64")]
    pub chunk_size: u64,
    pub simple_ext_list: Vec<ShadowSimpleExt>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShadowFileEntry {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub flags: u32,
    #[serde(with = "octal_mode")]
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nextents: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple_ext_list: Option<Vec<ShadowSimpleExt>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub striped_ext_list: Option<Vec<ShadowStripedExt>>,
}

/// The document this module reads and writes: one file per document,
/// under a top-level `file:` key (spec §4.F). Shadow directories never
/// pass through here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShadowYaml {
    pub file: ShadowFileEntry,
}

impl ShadowYaml {
    fn from_file(relpath: &str, f: &ReplayedFile) -> Self {
        let (simple_ext_list, striped_ext_list) = match f.fmap.ext_type() {
            ExtType::Simple => {
                let extents = f.fmap.simple_extents().iter().copied().map(Into::into).collect();
                (Some(extents), None)
            }
            ExtType::Interleave => {
                let strips: Vec<ShadowSimpleExt> =
                    f.fmap.strips().iter().copied().map(Into::into).collect();
                let group = ShadowStripedExt {
                    nstrips: strips.len() as u64,
                    chunk_size: f.fmap.chunk_size,
                    simple_ext_list: strips,
                };
                (None, Some(vec![group]))
            }
        };
        let nextents = match (&simple_ext_list, &striped_ext_list) {
            (Some(v), _) => v.len() as u64,
            (_, Some(v)) => v.iter().map(|g| g.simple_ext_list.len() as u64).sum(),
            _ => 0,
        };
        ShadowYaml {
            file: ShadowFileEntry {
                path: relpath.to_string(),
                size: f.size,
                flags: f.flags.bits(),
                mode: f.mode,
                uid: f.uid,
                gid: f.gid,
                nextents,
                simple_ext_list,
                striped_ext_list,
            },
        }
    }
}

/// Converts a single-file [`ReplayedTree`] (the only shape the shadow
/// codec ever sees in practice — one document per file) to its wire
/// form. Errors if `tree` doesn't hold exactly one file and nothing else.
fn single_file(tree: &ReplayedTree) -> Result<(&str, &ReplayedFile), FamfsError> {
    let mut iter = tree.nodes.iter();
    let (relpath, node) = iter.next().ok_or_else(|| {
        FamfsError::PerItem(ItemErrorKind::YamlMismatch { path: std::path::PathBuf::from("<empty>") })
    })?;
    if iter.next().is_some() {
        return Err(FamfsError::PerItem(ItemErrorKind::YamlMismatch {
            path: std::path::PathBuf::from(relpath),
        }));
    }
    match node {
        ReplayedNode::File(f) => Ok((relpath.as_str(), f)),
        ReplayedNode::Dir(_) => Err(FamfsError::PerItem(ItemErrorKind::YamlMismatch {
            path: std::path::PathBuf::from(relpath),
        })),
    }
}

impl From<&ShadowYaml> for ReplayedTree {
    fn from(yaml: &ShadowYaml) -> Self {
        let f = &yaml.file;
        let fmap = match (&f.simple_ext_list, &f.striped_ext_list) {
            (_, Some(groups)) if !groups.is_empty() => {
                let group = &groups[0];
                let strips: Vec<RawSimpleExtent> = group.simple_ext_list.iter().map(Into::into).collect();
                crate::meta::RawFmap::interleaved(group.chunk_size, &strips)
            }
            (Some(extents), _) => {
                let extents: Vec<RawSimpleExtent> = extents.iter().map(Into::into).collect();
                crate::meta::RawFmap::simple(&extents)
            }
            _ => crate::meta::RawFmap::simple(&[]),
        };
        let mut nodes = BTreeMap::new();
        nodes.insert(
            f.path.clone(),
            ReplayedNode::File(ReplayedFile {
                size: f.size,
                mode: f.mode,
                uid: f.uid,
                gid: f.gid,
                flags: FileFlags::from_bits_truncate(f.flags),
                fmap,
            }),
        );
        ReplayedTree { nodes }
    }
}

/// The `.meta/.superblock` / `.meta/.log` stubs created at the root of a
/// shadow tree: shadow mode never maps real DAX memory, so these carry
/// just enough to tell a reader what they stand in for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShadowMetaStub {
    pub kind: String,
    pub size: u64,
}

/// Writes one `.meta/*` stub as a YAML document at `path`, creating its
/// parent directory if needed.
pub fn write_meta_stub(path: &std::path::Path, kind: &str, size: u64) -> Result<(), FamfsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let stub = ShadowMetaStub { kind: kind.to_string(), size };
    std::fs::write(path, serde_yaml::to_string(&stub)?)?;
    Ok(())
}

/// `emit(tree)`: `tree` must hold exactly one file and nothing else,
/// matching the one-document-per-file shape [`crate::replay::materialize_file`]
/// writes under shadow mode.
pub fn emit(tree: &ReplayedTree) -> Result<String, FamfsError> {
    let (relpath, f) = single_file(tree)?;
    let yaml = ShadowYaml::from_file(relpath, f);
    Ok(serde_yaml::to_string(&yaml)?)
}

/// `parse(text)`.
pub fn parse(text: &str) -> Result<ReplayedTree, FamfsError> {
    let yaml: ShadowYaml = serde_yaml::from_str(text)?;
    Ok(ReplayedTree::from(&yaml))
}

/// Verifies the round-trip contract for one tree, producing
/// [`crate::error::ItemErrorKind::YamlMismatch`] on divergence. Used by
/// `fsck`'s self-check.
pub fn check_round_trip(tree: &ReplayedTree, path: &std::path::Path) -> Result<(), FamfsError> {
    let (relpath, f) = single_file(tree)?;
    let text = emit(tree)?;
    let reparsed = parse(&text)?;
    let original = ShadowYaml::from_file(relpath, f);
    let (reparsed_relpath, reparsed_file) = single_file(&reparsed)?;
    let round_tripped = ShadowYaml::from_file(reparsed_relpath, reparsed_file);
    if original != round_tripped {
        return Err(FamfsError::PerItem(crate::error::ItemErrorKind::YamlMismatch {
            path: path.to_path_buf(),
        }));
    }
    Ok(())
}
