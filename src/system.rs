//! System identity: an idempotent, host-local UUID used to decide
//! whether a session is running on the master host or a client.
//!
//! The first call on a host creates `/opt/famfs/system_uuid`; every
//! later call, on this host or a restored mount of the same root, reads
//! the same value back.

use std::io::Write;
use std::path::{Path, PathBuf};

use log::{info, warn};
use uuid::Uuid;

use crate::error::FamfsError;

const SYS_UUID_FILE: &str = "system_uuid";

/// `/opt/famfs` by default, except tests and CI sandboxes without root
/// rarely have that directory writable, so `FAMFS_SYSTEM_UUID_DIR`
/// redirects it, the way a test-only mock might redirect to `/tmp`.
fn sys_uuid_dir() -> PathBuf {
    std::env::var_os("FAMFS_SYSTEM_UUID_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/opt/famfs"))
}

/// Creates the UUID file under `dir` if it's missing, then reads and
/// parses it; a file present but unparsable is removed and regenerated
/// rather than failing a session open forever.
fn get_or_create_uuid_in(dir: &Path) -> Result<Uuid, FamfsError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(SYS_UUID_FILE);

    match std::fs::read_to_string(&path) {
        Ok(contents) => match Uuid::parse_str(contents.trim()) {
            Ok(uuid) => Ok(uuid),
            Err(_) => {
                warn!("system_uuid: {} did not parse, regenerating", path.display());
                std::fs::remove_file(&path).ok();
                write_new_uuid(&path)
            }
        },
        Err(_) => write_new_uuid(&path),
    }
}

fn write_new_uuid(path: &Path) -> Result<Uuid, FamfsError> {
    let uuid = Uuid::new_v4();
    let mut file = std::fs::File::create(path)?;
    file.write_all(uuid.to_string().as_bytes())?;
    info!("system_uuid: created {} with {uuid}", path.display());
    Ok(uuid)
}

/// `system_uuid()`: reads (creating if necessary) this host's identity
/// UUID from `/opt/famfs/system_uuid`.
pub fn system_uuid() -> Result<Uuid, FamfsError> {
    get_or_create_uuid_in(&sys_uuid_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_then_reuses_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let first = get_or_create_uuid_in(dir.path()).unwrap();
        let second = get_or_create_uuid_in(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn regenerates_on_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path().join(SYS_UUID_FILE), b"not-a-uuid").unwrap();
        let uuid = get_or_create_uuid_in(dir.path()).unwrap();
        assert_ne!(uuid, Uuid::nil());
    }
}
