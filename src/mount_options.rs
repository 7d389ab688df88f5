//! The FUSE-famfs mount-option string grammar: a comma-separated option
//! list generalized from the kernel FUSE vocabulary down to famfs's own:
//! `daxdev=`, `shadow=`, `fsname=`, `timeout=`, plus the two boolean
//! kernel options famfs still honors.

use std::collections::HashSet;
use std::io;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

/// One option recognized in a famfs FUSE mount string.
#[derive(Debug, Eq, PartialEq, Hash, Clone)]
pub enum MountOption {
    /// Path of the backing DAX device (or regular file, in test mode).
    DaxDev(String),
    /// Path to the shadow YAML file this mount serves from.
    Shadow(String),
    /// Set the filesystem's name in mtab.
    FsName(String),
    /// Cache timeout, in seconds, for attribute/entry caching.
    Timeout(u64),
    /// Allow all users to access files on this filesystem.
    AllowOther,
    /// Enable kernel-side permission checking.
    DefaultPermissions,
}

pub fn check_option_conflicts(options: &[MountOption]) -> Result<(), io::Error> {
    let mut options_set = HashSet::new();
    options_set.extend(options.iter().cloned());
    let conflicting: HashSet<MountOption> =
        options.iter().flat_map(conflicts_with).collect();
    let intersection: Vec<MountOption> = conflicting.intersection(&options_set).cloned().collect();
    if !intersection.is_empty() {
        Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("conflicting mount options found: {intersection:?}"),
        ))
    } else {
        Ok(())
    }
}

fn conflicts_with(option: &MountOption) -> Vec<MountOption> {
    match option {
        MountOption::DaxDev(_) => vec![],
        MountOption::Shadow(_) => vec![],
        MountOption::FsName(_) => vec![],
        MountOption::Timeout(_) => vec![],
        MountOption::AllowOther => vec![],
        MountOption::DefaultPermissions => vec![],
    }
}

pub fn option_to_string(option: &MountOption) -> String {
    match option {
        MountOption::DaxDev(path) => format!("daxdev={path}"),
        MountOption::Shadow(path) => format!("shadow={path}"),
        MountOption::FsName(name) => format!("fsname={name}"),
        MountOption::Timeout(secs) => format!("timeout={secs}"),
        MountOption::AllowOther => "allow_other".to_string(),
        MountOption::DefaultPermissions => "default_permissions".to_string(),
    }
}

/// Parses a comma-separated famfs mount-option string, e.g.
/// `daxdev=/dev/dax0.0,shadow=/var/famfs/shadow.yaml,allow_other`.
pub fn parse_options(s: &str) -> Result<Vec<MountOption>, io::Error> {
    let mut out = Vec::new();
    for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let opt = match token.split_once('=') {
            Some(("daxdev", v)) => MountOption::DaxDev(v.to_string()),
            Some(("shadow", v)) => MountOption::Shadow(v.to_string()),
            Some(("fsname", v)) => MountOption::FsName(v.to_string()),
            Some(("timeout", v)) => {
                let secs: u64 = v.parse().map_err(|_| {
                    io::Error::new(ErrorKind::InvalidInput, format!("bad timeout value: {v}"))
                })?;
                MountOption::Timeout(secs)
            }
            Some((key, _)) => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("unrecognized mount option key: {key}"),
                ))
            }
            None => match token {
                "allow_other" => MountOption::AllowOther,
                "default_permissions" => MountOption::DefaultPermissions,
                other => {
                    return Err(io::Error::new(
                        ErrorKind::InvalidInput,
                        format!("unrecognized mount option: {other}"),
                    ))
                }
            },
        };
        out.push(opt);
    }
    check_option_conflicts(&out)?;
    Ok(out)
}

/// A famfs FUSE mount's fully-parsed options, used to drive the mount
/// call itself.
#[derive(Debug, Clone)]
pub struct FuseMountConfig {
    pub daxdev: PathBuf,
    pub shadow: PathBuf,
    pub fsname: Option<String>,
    pub timeout: Duration,
    pub allow_other: bool,
    pub default_permissions: bool,
}

impl FuseMountConfig {
    pub fn from_option_string(s: &str) -> Result<Self, io::Error> {
        let options = parse_options(s)?;
        let mut daxdev = None;
        let mut shadow = None;
        let mut fsname = None;
        let mut timeout = Duration::from_secs(1);
        let mut allow_other = false;
        let mut default_permissions = false;

        for opt in options {
            match opt {
                MountOption::DaxDev(p) => daxdev = Some(PathBuf::from(p)),
                MountOption::Shadow(p) => shadow = Some(PathBuf::from(p)),
                MountOption::FsName(n) => fsname = Some(n),
                MountOption::Timeout(s) => timeout = Duration::from_secs(s),
                MountOption::AllowOther => allow_other = true,
                MountOption::DefaultPermissions => default_permissions = true,
            }
        }

        let daxdev = daxdev
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "daxdev= is required"))?;
        let shadow = shadow
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "shadow= is required"))?;

        Ok(FuseMountConfig { daxdev, shadow, fsname, timeout, allow_other, default_permissions })
    }
}
