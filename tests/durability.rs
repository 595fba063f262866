//! Committed effects survive an engine restart.

use txfs::{EngineConfig, FileSystem};

#[test]
fn committed_writes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let home = dir.path().join("engine-home");
    let data = dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    let file = data.join("note.txt");

    {
        let fs = FileSystem::boot(EngineConfig::for_testing(&home)).unwrap();
        let session = fs.create_session_for_local_transaction().unwrap();
        session.create_file(&file).unwrap();
        let mut out = session.open_output_stream(&file, false).unwrap();
        out.write(b"persisted").unwrap();
        out.close();
        session.commit(true).unwrap();
    }

    let fs = FileSystem::boot(EngineConfig::for_testing(&home)).unwrap();
    let session = fs.create_session_for_local_transaction().unwrap();
    let mut stream = session.open_input_stream(&file).unwrap();
    let mut buf = [0u8; 32];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"persisted");
    drop(stream);
    session.commit(true).unwrap();
}
