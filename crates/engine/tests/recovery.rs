//! Boot-time recovery over hand-built log states.
//!
//! Each test writes the exact log records a crashed engine would have left
//! behind, then boots a fresh engine over the same home directory and checks
//! the physical outcome.

use std::path::{Path, PathBuf};
use std::time::Duration;
use txfs_core::{EngineConfig, TransactionId, TxError};
use txfs_durability::{ChangeEvent, EventKind, GatheringLogWriter, LogRecord};
use txfs_engine::FileSystem;

fn setup(dir: &Path) -> (EngineConfig, PathBuf) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let home = dir.join("engine-home");
    let data = dir.join("data");
    std::fs::create_dir_all(&data).unwrap();
    (EngineConfig::for_testing(&home), data)
}

fn xid(n: u64) -> TransactionId {
    TransactionId::for_local_transaction(n)
}

#[test]
fn interrupted_commit_is_completed_on_boot() {
    let dir = tempfile::tempdir().unwrap();
    let (config, data) = setup(dir.path());
    let file = data.join("f.txt");
    let x = xid(7);

    {
        let writer = GatheringLogWriter::open(&config).unwrap();
        writer
            .submit(
                &x,
                &LogRecord::FileCreate {
                    xid: x.clone(),
                    path: file.clone(),
                },
                &[],
            )
            .unwrap();
        writer
            .submit(
                &x,
                &LogRecord::FileAppend {
                    xid: x.clone(),
                    path: file.clone(),
                    offset: 0,
                    length: 5,
                },
                b"hello",
            )
            .unwrap();
        writer
            .force_write(&LogRecord::CommitBegins { xid: x.clone() }, &[])
            .unwrap();
        // Crash: no CommitDone.
    }

    let fs = FileSystem::boot(config.clone()).unwrap();
    fs.wait_for_bootup(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(std::fs::read(&file).unwrap(), b"hello");
    // The resolved log was reclaimed.
    assert!(!config.log_file_path(0).exists());

    let session = fs.create_session_for_local_transaction().unwrap();
    assert_eq!(session.get_file_length(&file).unwrap(), 5);
    session.commit(true).unwrap();
}

#[test]
fn recovered_commit_matches_uninterrupted_commit() {
    let dir = tempfile::tempdir().unwrap();

    // Uninterrupted run.
    let (config_a, data_a) = setup(&dir.path().join("a"));
    let fs_a = FileSystem::boot(config_a).unwrap();
    let f_a = data_a.join("f");
    let g_a = data_a.join("g");
    let s = fs_a.create_session_for_local_transaction().unwrap();
    s.create_file(&f_a).unwrap();
    {
        let mut out = s.open_output_stream(&f_a, false).unwrap();
        out.write(b"payload").unwrap();
    }
    s.copy_file(&f_a, &g_a).unwrap();
    s.commit(true).unwrap();

    // The same chain, interrupted right after CommitBegins.
    let (config_b, data_b) = setup(&dir.path().join("b"));
    let f_b = data_b.join("f");
    let g_b = data_b.join("g");
    let x = xid(9);
    {
        let writer = GatheringLogWriter::open(&config_b).unwrap();
        writer
            .submit(
                &x,
                &LogRecord::FileCreate {
                    xid: x.clone(),
                    path: f_b.clone(),
                },
                &[],
            )
            .unwrap();
        writer
            .submit(
                &x,
                &LogRecord::FileAppend {
                    xid: x.clone(),
                    path: f_b.clone(),
                    offset: 0,
                    length: 7,
                },
                b"payload",
            )
            .unwrap();
        writer
            .submit(
                &x,
                &LogRecord::FileCopy {
                    xid: x.clone(),
                    src: f_b.clone(),
                    dst: g_b.clone(),
                },
                &[],
            )
            .unwrap();
        writer
            .force_write(&LogRecord::CommitBegins { xid: x.clone() }, &[])
            .unwrap();
    }
    let fs_b = FileSystem::boot(config_b).unwrap();
    fs_b.wait_for_bootup(Some(Duration::from_secs(2))).unwrap();

    assert_eq!(std::fs::read(&f_a).unwrap(), std::fs::read(&f_b).unwrap());
    assert_eq!(std::fs::read(&g_a).unwrap(), std::fs::read(&g_b).unwrap());
}

#[test]
fn in_place_mutation_is_rolled_back_on_boot() {
    let dir = tempfile::tempdir().unwrap();
    let (config, data) = setup(dir.path());
    let file = data.join("f");
    std::fs::write(&file, b"abc").unwrap();
    let x = xid(3);

    {
        let writer = GatheringLogWriter::open(&config).unwrap();
        writer
            .force_write(&LogRecord::UsesUndoLogs { xid: x.clone() }, &[])
            .unwrap();
        writer
            .force_write(
                &LogRecord::UndoFileAppend {
                    xid: x.clone(),
                    path: file.clone(),
                    prior_length: 3,
                },
                &[],
            )
            .unwrap();
    }
    // The in-place channel got as far as appending before the crash.
    let mut current = std::fs::read(&file).unwrap();
    current.extend_from_slice(b"XYZ");
    std::fs::write(&file, &current).unwrap();

    let fs = FileSystem::boot(config).unwrap();
    fs.wait_for_bootup(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(std::fs::read(&file).unwrap(), b"abc");
}

#[test]
fn prepared_transaction_holds_bootup_until_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let (config, data) = setup(dir.path());
    let file = data.join("f");
    let x = xid(11);

    {
        let writer = GatheringLogWriter::open(&config).unwrap();
        writer
            .submit(
                &x,
                &LogRecord::FileCreate {
                    xid: x.clone(),
                    path: file.clone(),
                },
                &[],
            )
            .unwrap();
        writer.flush_and_sync().unwrap();
        writer
            .force_write(&LogRecord::PrepareDone { xid: x.clone() }, &[])
            .unwrap();
    }

    let fs = FileSystem::boot(config).unwrap();
    let err = fs.create_session_for_local_transaction().unwrap_err();
    assert!(matches!(err, TxError::RecoveryInProgress));
    assert_eq!(fs.in_doubt_transactions(), vec![x.clone()]);

    fs.commit_recovered(&x).unwrap();
    assert!(file.exists());
    fs.wait_for_bootup(Some(Duration::from_secs(2))).unwrap();
    assert!(fs.create_session_for_local_transaction().is_ok());
}

#[test]
fn prepared_transaction_can_be_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let (config, data) = setup(dir.path());
    let file = data.join("f");
    let x = xid(12);

    {
        let writer = GatheringLogWriter::open(&config).unwrap();
        writer
            .submit(
                &x,
                &LogRecord::FileCreate {
                    xid: x.clone(),
                    path: file.clone(),
                },
                &[],
            )
            .unwrap();
        writer.flush_and_sync().unwrap();
        writer
            .force_write(&LogRecord::PrepareDone { xid: x.clone() }, &[])
            .unwrap();
    }

    let fs = FileSystem::boot(config).unwrap();
    fs.rollback_recovered(&x).unwrap();
    assert!(!file.exists());
    fs.wait_for_bootup(Some(Duration::from_secs(2))).unwrap();
}

#[test]
fn stale_logs_wait_for_in_doubt_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let (config, data) = setup(dir.path());
    let file = data.join("f");
    let (x1, x2) = (xid(21), xid(22));

    {
        // txlog_0: a transaction that never reached a durability point.
        let writer = GatheringLogWriter::open(&config).unwrap();
        writer
            .submit(
                &x1,
                &LogRecord::FileCreate {
                    xid: x1.clone(),
                    path: data.join("junk"),
                },
                &[],
            )
            .unwrap();
        writer.flush_and_sync().unwrap();
    }
    {
        // txlog_1: a prepared transaction.
        let writer = GatheringLogWriter::open(&config).unwrap();
        writer
            .submit(
                &x2,
                &LogRecord::FileCreate {
                    xid: x2.clone(),
                    path: file.clone(),
                },
                &[],
            )
            .unwrap();
        writer.flush_and_sync().unwrap();
        writer
            .force_write(&LogRecord::PrepareDone { xid: x2.clone() }, &[])
            .unwrap();
    }

    let fs = FileSystem::boot(config.clone()).unwrap();
    assert_eq!(fs.in_doubt_transactions(), vec![x2.clone()]);
    // No log is reclaimed while bootup is held open, not even one the scan
    // already discarded.
    assert!(config.log_file_path(0).exists());

    fs.commit_recovered(&x2).unwrap();
    fs.wait_for_bootup(Some(Duration::from_secs(2))).unwrap();
    assert!(file.exists());
    assert!(!config.log_file_path(0).exists());
    assert!(!config.log_file_path(1).exists());
}

#[test]
fn undelivered_events_of_committed_transactions_survive() {
    let dir = tempfile::tempdir().unwrap();
    let (config, data) = setup(dir.path());
    let file = data.join("f");
    let x = xid(5);
    let event = ChangeEvent {
        path: file.clone(),
        kind: EventKind::Created,
    };

    {
        let writer = GatheringLogWriter::open(&config).unwrap();
        writer
            .submit(
                &x,
                &LogRecord::FileCreate {
                    xid: x.clone(),
                    path: file.clone(),
                },
                &[],
            )
            .unwrap();
        writer
            .force_write(
                &LogRecord::EventEnqueue {
                    xid: x.clone(),
                    events: vec![event.clone()],
                },
                &[],
            )
            .unwrap();
        writer
            .force_write(&LogRecord::CommitBegins { xid: x.clone() }, &[])
            .unwrap();
    }

    let fs = FileSystem::boot(config).unwrap();
    fs.wait_for_bootup(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(fs.recovered_events(), vec![event]);
    // Drained once.
    assert!(fs.recovered_events().is_empty());
}
