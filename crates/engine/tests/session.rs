//! End-to-end session behavior over a real directory tree.

use std::path::{Path, PathBuf};
use std::time::Duration;
use txfs_core::{EngineConfig, TransactionId, TxError};
use txfs_engine::FileSystem;

fn engine(dir: &Path) -> (FileSystem, PathBuf) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let home = dir.join("engine-home");
    let data = dir.join("data");
    std::fs::create_dir_all(&data).unwrap();
    let fs = FileSystem::boot(EngineConfig::for_testing(&home)).unwrap();
    (fs, data)
}

fn read_all(session: &std::sync::Arc<txfs_engine::Session>, path: &Path) -> Vec<u8> {
    let mut stream = session.open_input_stream(path).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 16];
    loop {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[test]
fn create_write_commit_then_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let subdir = data.join("a");
    let file = subdir.join("b.txt");

    let s1 = fs.create_session_for_local_transaction().unwrap();
    s1.create_directory(&subdir).unwrap();
    s1.create_file(&file).unwrap();
    {
        let mut out = s1.open_output_stream(&file, false).unwrap();
        out.write(b"hello").unwrap();
    }
    assert_eq!(s1.get_file_length(&file).unwrap(), 5);
    // Nothing physical before commit.
    assert!(!file.exists());
    s1.commit(true).unwrap();
    assert_eq!(std::fs::read(&file).unwrap(), b"hello");

    let s2 = fs.create_session_for_local_transaction().unwrap();
    assert!(s2.file_exists(&file).unwrap());
    assert_eq!(s2.get_file_length(&file).unwrap(), 5);
    assert_eq!(read_all(&s2, &file), b"hello");
    s2.commit(true).unwrap();
}

#[test]
fn transaction_reads_its_own_writes_before_commit() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let file = data.join("draft.txt");

    let session = fs.create_session_for_local_transaction().unwrap();
    session.create_file(&file).unwrap();
    {
        let mut out = session.open_output_stream(&file, false).unwrap();
        out.write(b"first ").unwrap();
        out.write(b"second").unwrap();
    }
    assert_eq!(read_all(&session, &file), b"first second");

    let listed = session.list_files(&data).unwrap();
    assert!(listed.contains(&std::ffi::OsString::from("draft.txt")));
    session.rollback().unwrap();
}

#[test]
fn rollback_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let subdir = data.join("d");
    let file = subdir.join("f");

    let session = fs.create_session_for_local_transaction().unwrap();
    session.create_directory(&subdir).unwrap();
    session.create_file(&file).unwrap();
    {
        let mut out = session.open_output_stream(&file, false).unwrap();
        out.write(b"doomed").unwrap();
    }
    session.rollback().unwrap();
    assert!(!subdir.exists());

    let s2 = fs.create_session_for_local_transaction().unwrap();
    assert!(!s2.file_exists(&file).unwrap());
    assert!(!s2.file_exists_and_is_directory(&subdir).unwrap());
    s2.commit(true).unwrap();
}

#[test]
fn move_copy_truncate_compose() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let f1 = data.join("f1");
    let f2 = data.join("f2");
    let f3 = data.join("f3");

    let s1 = fs.create_session_for_local_transaction().unwrap();
    s1.create_file(&f1).unwrap();
    {
        let mut out = s1.open_output_stream(&f1, false).unwrap();
        out.write(b"abcdef").unwrap();
    }
    s1.commit(true).unwrap();

    let s2 = fs.create_session_for_local_transaction().unwrap();
    s2.move_file(&f1, &f2).unwrap();
    assert!(!s2.file_exists(&f1).unwrap());
    s2.copy_file(&f2, &f3).unwrap();
    s2.truncate_file(&f3, 3).unwrap();
    // The source of the copy keeps its full content.
    assert_eq!(s2.get_file_length(&f2).unwrap(), 6);
    assert_eq!(s2.get_file_length(&f3).unwrap(), 3);
    s2.commit(true).unwrap();

    assert!(!f1.exists());
    assert_eq!(std::fs::read(&f2).unwrap(), b"abcdef");
    assert_eq!(std::fs::read(&f3).unwrap(), b"abc");
}

#[test]
fn delete_requires_empty_directory() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let subdir = data.join("d");
    let file = subdir.join("f");

    let s1 = fs.create_session_for_local_transaction().unwrap();
    s1.create_directory(&subdir).unwrap();
    s1.create_file(&file).unwrap();
    s1.commit(true).unwrap();

    let s2 = fs.create_session_for_local_transaction().unwrap();
    let err = s2.delete_file(&subdir).unwrap_err();
    assert!(matches!(err, TxError::DirectoryNotEmpty { .. }));
    s2.delete_file(&file).unwrap();
    s2.delete_file(&subdir).unwrap();
    s2.commit(true).unwrap();
    assert!(!subdir.exists());
}

#[test]
fn heavy_write_via_shadow_promotes_on_commit() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let file = data.join("big.bin");

    let session = fs.create_session_for_local_transaction().unwrap();
    session.create_file(&file).unwrap();
    {
        let mut out = session.open_output_stream(&file, true).unwrap();
        out.write(b"heavy payload").unwrap();
    }
    // The channel serves the transaction's own reads.
    assert_eq!(read_all(&session, &file), b"heavy payload");
    assert!(!file.exists());
    session.commit(true).unwrap();

    assert_eq!(std::fs::read(&file).unwrap(), b"heavy payload");
    // The shadow was promoted, not copied.
    let backup = dir.path().join("engine-home/backup");
    assert_eq!(std::fs::read_dir(&backup).unwrap().count(), 0);
}

#[test]
fn heavy_write_rollback_removes_shadow() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let file = data.join("big.bin");

    let session = fs.create_session_for_local_transaction().unwrap();
    session.create_file(&file).unwrap();
    {
        let mut out = session.open_output_stream(&file, true).unwrap();
        out.write(b"never committed").unwrap();
    }
    session.rollback().unwrap();

    assert!(!file.exists());
    let backup = dir.path().join("engine-home/backup");
    assert_eq!(std::fs::read_dir(&backup).unwrap().count(), 0);
}

#[test]
fn in_place_heavy_write_is_undone_on_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let file = data.join("f");

    let s1 = fs.create_session_for_local_transaction().unwrap();
    s1.create_file(&file).unwrap();
    {
        let mut out = s1.open_output_stream(&file, false).unwrap();
        out.write(b"abcdef").unwrap();
    }
    s1.commit(true).unwrap();

    let s2 = fs.create_session_for_local_transaction().unwrap();
    {
        let mut out = s2.open_output_stream(&file, true).unwrap();
        out.write(b"XYZ").unwrap();
    }
    // In-place mode mutates the real file before commit.
    assert_eq!(std::fs::read(&file).unwrap(), b"abcdefXYZ");
    s2.rollback().unwrap();
    assert_eq!(std::fs::read(&file).unwrap(), b"abcdef");
}

#[test]
fn in_place_heavy_write_commits() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let file = data.join("f");

    let s1 = fs.create_session_for_local_transaction().unwrap();
    s1.create_file(&file).unwrap();
    {
        let mut out = s1.open_output_stream(&file, false).unwrap();
        out.write(b"abc").unwrap();
    }
    s1.commit(true).unwrap();

    let s2 = fs.create_session_for_local_transaction().unwrap();
    {
        let mut out = s2.open_output_stream(&file, true).unwrap();
        out.write(b"def").unwrap();
    }
    s2.truncate_file(&file, 4).unwrap();
    s2.commit(true).unwrap();
    assert_eq!(std::fs::read(&file).unwrap(), b"abcd");

    let s3 = fs.create_session_for_local_transaction().unwrap();
    assert_eq!(s3.get_file_length(&file).unwrap(), 4);
    s3.commit(true).unwrap();
}

#[test]
fn failed_operation_keeps_earlier_shared_hold() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let file = data.join("f");

    let s1 = fs.create_session_for_local_transaction().unwrap();
    s1.create_file(&file).unwrap();
    {
        let mut out = s1.open_output_stream(&file, false).unwrap();
        out.write(b"abcdef").unwrap();
    }
    s1.commit(true).unwrap();

    // The input stream takes a shared hold; the rejected truncation upgrades
    // it in place and must give back only the upgrade on failure.
    let sa = fs.create_session_for_local_transaction().unwrap();
    let stream = sa.open_input_stream(&file).unwrap();
    let err = sa.truncate_file(&file, 100).unwrap_err();
    assert!(matches!(err, TxError::Io(_)));

    let sb = fs.create_session_for_local_transaction().unwrap();
    sb.set_lock_wait_timeout(Duration::from_millis(80));
    let err = sb.delete_file(&file).unwrap_err();
    assert!(matches!(err, TxError::LockingTimedOut { .. }), "shared hold was lost");

    drop(stream);
    sa.rollback().unwrap();
    sb.delete_file(&file).unwrap();
    sb.commit(true).unwrap();
    assert!(!file.exists());
}

#[test]
fn append_after_copy_from_heavy_source_commits() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let src = data.join("src");
    let dst = data.join("dst");

    let session = fs.create_session_for_local_transaction().unwrap();
    session.create_file(&src).unwrap();
    {
        let mut out = session.open_output_stream(&src, true).unwrap();
        out.write(b"AAAA").unwrap();
    }
    session.copy_file(&src, &dst).unwrap();
    {
        let mut out = session.open_output_stream(&dst, false).unwrap();
        out.write(b"BBBB").unwrap();
    }
    assert_eq!(session.get_file_length(&dst).unwrap(), 8);
    session.commit(true).unwrap();

    assert_eq!(std::fs::read(&src).unwrap(), b"AAAA");
    assert_eq!(std::fs::read(&dst).unwrap(), b"AAAABBBB");
}

#[test]
fn duplicate_transaction_id_is_rejected_without_poisoning() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let xid = TransactionId::new(b"gtrid-7".to_vec(), b"bqual-7".to_vec(), 1);

    let s1 = fs.create_session_for_transaction(xid.clone()).unwrap();
    let err = fs.create_session_for_transaction(xid.clone()).unwrap_err();
    assert!(matches!(err, TxError::TransactionAlreadyAssociated { .. }));

    // The engine stays healthy and the first session stays usable.
    let s2 = fs.create_session_for_local_transaction().unwrap();
    assert!(!s2.file_exists(&data.join("nothing")).unwrap());
    s2.commit(true).unwrap();
    s1.rollback().unwrap();
    assert!(fs.create_session_for_transaction(xid).is_ok());
}

#[test]
fn contended_lock_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let file = data.join("hot");

    let s1 = fs.create_session_for_local_transaction().unwrap();
    s1.create_file(&file).unwrap();

    let s2 = fs.create_session_for_local_transaction().unwrap();
    s2.set_lock_wait_timeout(Duration::from_millis(50));
    let err = s2.file_exists(&file).unwrap_err();
    assert!(matches!(err, TxError::LockingTimedOut { .. }));

    s1.rollback().unwrap();
    // With the lock released the same check succeeds.
    assert!(!s2.file_exists(&file).unwrap());
    s2.commit(true).unwrap();
}

#[test]
fn two_phase_commit_goes_through_prepare() {
    let dir = tempfile::tempdir().unwrap();
    let (fs, data) = engine(dir.path());
    let file = data.join("xa.txt");

    let session = fs.create_session_for_local_transaction().unwrap();
    session.create_file(&file).unwrap();
    {
        let mut out = session.open_output_stream(&file, false).unwrap();
        out.write(b"xa").unwrap();
    }
    // One-phase commit is rejected after prepare, and vice versa.
    session.prepare().unwrap();
    let err = session.commit(true).unwrap_err();
    assert!(matches!(err, TxError::NoTransactionAssociated));
    session.commit(false).unwrap();
    assert_eq!(std::fs::read(&file).unwrap(), b"xa");
}
