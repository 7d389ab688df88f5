//! The six end-to-end scenarios from the testable-properties section:
//! `mkfs`+mount+`mkfile`, interleaved allocation, replay idempotence,
//! client write rejection, log CRC corruption detection, and a PCQ
//! single-node round-trip.

use std::io::{Seek, SeekFrom, Write};

use famfs::bitmap::InterleaveParams;
use famfs::meta::{LOG_OFFSET, MIN_LOG_LEN};
use famfs::pcq::{Pcq, WaitMode};
use famfs::pipeline::{mkfile, InterleaveRequest, MkfileRequest};
use famfs::session::{LockedLogSession, SessionConfig};
use uuid::Uuid;

use famfs_tests::{mkfs, RecordingMappingInstaller};

/// Installs an `env_logger` subscriber the first time it's called, so a
/// scenario test run with `RUST_LOG=debug` actually prints the crate's
/// `log::debug!`/`log::info!` lines; safe to call at the top of every test.
fn init_test_logging() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

#[test]
fn scenario_1_mkfs_mount_mkfile() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let system_uuid = Uuid::new_v4();
    mkfs(dir.path(), 1 << 32, system_uuid);

    let installer = RecordingMappingInstaller::default();
    let mut session = LockedLogSession::open(
        dir.path(),
        SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
        &installer,
    )
    .unwrap();

    let outcome = mkfile(
        &mut session,
        &installer,
        MkfileRequest { relpath: "f/a", mode: 0o644, uid: 0, gid: 0, size: 6 << 20, flags: famfs::meta::FileFlags::empty(), interleave: None },
    )
    .unwrap();

    assert_eq!(outcome.size, 6 << 20);
    let extents = outcome.fmap.simple_extents();
    assert_eq!(extents.len(), 1);
    assert_eq!(extents[0].offset, LOG_OFFSET + MIN_LOG_LEN);
    assert_eq!(extents[0].length, 6 << 20);
    assert_eq!(session.log().header().next_index, 1);
    assert_eq!(session.log().entry(0).unwrap().seqnum, 0);
}

#[test]
fn scenario_2_interleaved_allocation() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let system_uuid = Uuid::new_v4();
    mkfs(dir.path(), 1 << 32, system_uuid);

    let installer = RecordingMappingInstaller::default();
    let mut session = LockedLogSession::open(
        dir.path(),
        SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
        &installer,
    )
    .unwrap();

    let params = InterleaveParams { nbuckets: 4, nstrips: 2, chunk_size: 1 << 21 };
    let outcome = mkfile(
        &mut session,
        &installer,
        MkfileRequest {
            relpath: "f/b",
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 16 << 20,
            flags: famfs::meta::FileFlags::empty(),
            interleave: Some(InterleaveRequest { params, relaxed_bucket_floor: true }),
        },
    )
    .unwrap();

    assert_eq!(outcome.fmap.ext_type(), famfs::meta::ExtType::Interleave);
    let strips = outcome.fmap.strips();
    assert_eq!(strips.len(), 2);
    assert_eq!(strips[0].length, 8 << 20);
    assert_eq!(strips[1].length, 8 << 20);
}

#[test]
fn scenario_3_replay_idempotence() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let system_uuid = Uuid::new_v4();
    mkfs(dir.path(), 1 << 32, system_uuid);

    {
        let installer = RecordingMappingInstaller::default();
        let mut session = LockedLogSession::open(
            dir.path(),
            SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
            &installer,
        )
        .unwrap();
        mkfile(
            &mut session,
            &installer,
            MkfileRequest { relpath: "f/a", mode: 0o644, uid: 0, gid: 0, size: 6 << 20, flags: famfs::meta::FileFlags::empty(), interleave: None },
        )
        .unwrap();
    }

    let reopen_installer = RecordingMappingInstaller::default();
    let session = LockedLogSession::open(
        dir.path(),
        SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
        &reopen_installer,
    )
    .unwrap();

    // A client mounting the same instance materializes the log into a
    // separate target root (standing in for its own mount point).
    let client_root = tempfile::tempdir().unwrap();
    let installer = RecordingMappingInstaller::default();
    let (tree1, stats1) = famfs::replay::replay(
        session.log(),
        client_root.path(),
        famfs::replay::Role::Client,
        famfs::replay::Mode::Live,
        Some(&installer),
        false,
    )
    .unwrap();
    let (tree2, stats2) = famfs::replay::replay(
        session.log(),
        client_root.path(),
        famfs::replay::Role::Client,
        famfs::replay::Mode::Live,
        Some(&installer),
        false,
    )
    .unwrap();

    assert_eq!(stats1.bad_entries, 0);
    assert_eq!(stats1.files_created, 1);
    assert_eq!(stats1.files_existed, 0);
    // Second pass against the same target: nothing new, everything
    // reported as already having existed.
    assert_eq!(stats2.files_created, 0);
    assert_eq!(stats2.files_existed, stats2.files_logged);
    assert_eq!(tree1.nodes.len(), tree2.nodes.len());
    assert_eq!(tree1.file("f/a").unwrap().size, tree2.file("f/a").unwrap().size);
    assert!(client_root.path().join("f/a").exists());
}

#[test]
fn scenario_4_client_write_rejection() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let master_uuid = Uuid::new_v4();
    mkfs(dir.path(), 1 << 32, master_uuid);

    let client_uuid = Uuid::new_v4();
    assert_ne!(master_uuid, client_uuid);

    let installer = RecordingMappingInstaller::default();
    let mut session = LockedLogSession::open(
        dir.path(),
        SessionConfig::new().test_mode(true).system_uuid_override(master_uuid),
        &installer,
    )
    .unwrap();
    assert!(session.is_master(), "this test's session runs as the same host that formatted the fs");

    mkfile(
        &mut session,
        &installer,
        MkfileRequest { relpath: "f/a", mode: 0o644, uid: 0, gid: 0, size: 4096, flags: famfs::meta::FileFlags::empty(), interleave: None },
    )
    .unwrap();

    // A session whose system uuid differs from sb.system_uuid reports
    // Role::Client, and require_master then rejects any append attempt.
    assert!(famfs::replay::require_master(famfs::replay::Role::Client).is_err());
    assert!(famfs::replay::require_master(session.role()).is_ok());

    // A client host materializing the master's log gets every file's mode
    // bits with write access masked off, regardless of the logged mode.
    let client_root = tempfile::tempdir().unwrap();
    let client_installer = RecordingMappingInstaller::default();
    famfs::replay::replay(
        session.log(),
        client_root.path(),
        famfs::replay::Role::Client,
        famfs::replay::Mode::Live,
        Some(&client_installer),
        false,
    )
    .unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::metadata(client_root.path().join("f/a")).unwrap().permissions();
        assert_eq!(perms.mode() & 0o222, 0, "client materialization must exclude write bits");
    }

    // The master materializes the same log with the logged mode verbatim.
    let master_root = tempfile::tempdir().unwrap();
    let master_installer = RecordingMappingInstaller::default();
    famfs::replay::replay(
        session.log(),
        master_root.path(),
        famfs::replay::Role::Master,
        famfs::replay::Mode::Live,
        Some(&master_installer),
        false,
    )
    .unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::metadata(master_root.path().join("f/a")).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o644);
    }
}

#[test]
fn scenario_5_log_crc_corruption_detection() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let system_uuid = Uuid::new_v4();
    mkfs(dir.path(), 1 << 32, system_uuid);

    {
        let installer = RecordingMappingInstaller::default();
        let mut session = LockedLogSession::open(
            dir.path(),
            SessionConfig::new().test_mode(true).system_uuid_override(system_uuid),
            &installer,
        )
        .unwrap();
        for i in 0..5 {
            mkfile(
                &mut session,
                &installer,
                MkfileRequest {
                    relpath: &format!("f/{i}"),
                    mode: 0o644,
                    uid: 0,
                    gid: 0,
                    size: 1 << 20,
                    flags: famfs::meta::FileFlags::empty(),
                    interleave: None,
                },
            )
            .unwrap();
        }
    }

    // Flip one byte in the middle of log entry 3's payload.
    let entry_size = famfs::log::ENTRY_SIZE;
    let header_size = core::mem::size_of::<famfs::meta::LogHeader>();
    let offset = header_size + 3 * entry_size + entry_size / 2;
    let mut log_file =
        std::fs::OpenOptions::new().read(true).write(true).open(dir.path().join(".meta/.log")).unwrap();
    log_file.seek(SeekFrom::Start(offset as u64)).unwrap();
    let mut byte = [0u8; 1];
    std::io::Read::read_exact(&mut log_file, &mut byte).unwrap();
    log_file.seek(SeekFrom::Start(offset as u64)).unwrap();
    log_file.write_all(&[byte[0] ^ 0xff]).unwrap();
    drop(log_file);

    let reopen_installer = RecordingMappingInstaller::default();
    let session = LockedLogSession::open(
        dir.path(),
        SessionConfig::new().test_mode(true).build_bitmap(false).system_uuid_override(system_uuid),
        &reopen_installer,
    )
    .unwrap();
    let (tree, stats) = famfs::replay::logplay(session.log(), famfs::replay::Mode::Shadow);

    assert_eq!(stats.bad_entries, 1);
    for i in [0u32, 1, 2, 4] {
        assert!(tree.file(&format!("f/{i}")).is_some(), "entry {i} should still replay");
    }
    assert!(tree.file("f/3").is_none());
}

#[test]
fn scenario_6_pcq_single_node_round_trip() {
    init_test_logging();
    let mut q = Pcq::create(16, 64, famfs::cache::CacheMode::TestNoFlush).unwrap();
    let seed = 0x5eed_u64;

    for i in 0..1024u64 {
        let payload = (seed ^ i).to_le_bytes();
        let seq = q.put(&payload, WaitMode::NoWait).unwrap();
        assert_eq!(seq, i);
        let (received, recv_seq) = q.get(WaitMode::NoWait).unwrap();
        assert_eq!(recv_seq, i);
        assert_eq!(u64::from_le_bytes(received[..8].try_into().unwrap()), seed ^ i);
    }

    assert_eq!(q.depth(), 0);
}
