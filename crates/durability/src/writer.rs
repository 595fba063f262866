//! The gathering log writer.
//!
//! Ordinary operation records are queued per transaction and flushed in one
//! gathered write once cumulative queued bytes cross the configured
//! threshold, or when a transaction is about to prepare, commit or roll
//! back. Control records bypass the queue entirely: they are written and
//! fsynced before the call returns.
//!
//! Each flushed record's `(log_index, offset)` is written back into the
//! submitted [`Buffer`], which the owning session also holds in its position
//! chain. Under memory pressure the buffer's bytes are dropped right after
//! the write and re-read from the log file on demand.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use txfs_core::{Buffer, EngineConfig, OnDiskInfo, Result, TransactionId, TxError};

use crate::disk::DurableDirSession;
use crate::record::LogRecord;
use crate::usage::LogUsageTracker;

/// Location of a flushed record.
pub type LogPosition = OnDiskInfo;

/// A record buffer shared between the writer's queue and the owning
/// session's position chain.
pub type SharedBuffer = Arc<Mutex<Buffer>>;

struct WriterInner {
    file: File,
    current_index: u64,
    current_size: u64,
    queues: HashMap<TransactionId, Vec<SharedBuffer>>,
    queued_bytes: usize,
    retained_bytes: usize,
    retained_per_txn: HashMap<TransactionId, usize>,
    usage: LogUsageTracker,
    active_endpoints: HashSet<String>,
    disk: DurableDirSession,
}

/// Batching, rotating writer over the sequentially numbered log files.
pub struct GatheringLogWriter {
    inner: Mutex<WriterInner>,
    log_dir: PathBuf,
    max_log_file_size: u64,
    flush_threshold: usize,
    max_buffered_bytes: usize,
}

/// Highest `txlog_<n>` index present in `dir`, if any.
pub fn find_latest_log_index(dir: &Path) -> Result<Option<u64>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut latest = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(n) = name.strip_prefix("txlog_").and_then(|s| s.parse::<u64>().ok()) {
            latest = Some(latest.map_or(n, |l: u64| l.max(n)));
        }
    }
    Ok(latest)
}

impl GatheringLogWriter {
    /// Open the writer over `config`'s log directory, starting a fresh log
    /// file after any retained ones.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let log_dir = config.log_dir();
        fs::create_dir_all(&log_dir)?;
        let current_index = find_latest_log_index(&log_dir)?.map_or(0, |n| n + 1);
        let path = config.log_file_path(current_index);
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        info!(log_index = current_index, path = %path.display(), "opened transaction log");
        Ok(GatheringLogWriter {
            inner: Mutex::new(WriterInner {
                file,
                current_index,
                current_size: 0,
                queues: HashMap::new(),
                queued_bytes: 0,
                retained_bytes: 0,
                retained_per_txn: HashMap::new(),
                usage: LogUsageTracker::new(),
                active_endpoints: HashSet::new(),
                disk: DurableDirSession::new(config.sync_directory_changes),
            }),
            log_dir,
            max_log_file_size: config.max_log_file_size,
            flush_threshold: config.log_flush_threshold,
            max_buffered_bytes: config.max_buffered_bytes,
        })
    }

    fn log_path(&self, index: u64) -> PathBuf {
        self.log_dir.join(format!("txlog_{index}"))
    }

    /// Index of the live log file.
    pub fn current_log_index(&self) -> u64 {
        self.inner.lock().current_index
    }

    /// Path of the log file with the given index.
    pub fn path_of(&self, index: u64) -> PathBuf {
        self.log_path(index)
    }

    /// Queue an operation record for `xid`. Returns the shared buffer to be
    /// kept in the session's position chain. Triggers a batched flush when
    /// the queued volume crosses the threshold.
    pub fn submit(
        &self,
        xid: &TransactionId,
        record: &LogRecord,
        content: &[u8],
    ) -> Result<SharedBuffer> {
        let (bytes, header_len) = record.serialize(content);
        let mut buffer = Buffer::new(bytes, header_len, content.len() as u32);
        if let LogRecord::FileAppend { offset, .. } = record {
            buffer.set_content_position(*offset);
        }
        let shared = Arc::new(Mutex::new(buffer));

        let mut inner = self.inner.lock();
        let len = header_len as usize + content.len();
        inner
            .queues
            .entry(xid.clone())
            .or_default()
            .push(Arc::clone(&shared));
        inner.queued_bytes += len;
        if inner.queued_bytes >= self.flush_threshold {
            self.flush_locked(&mut inner)?;
        }
        Ok(shared)
    }

    /// Flush every queued record to the current log file.
    pub fn flush_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    /// Flush all queues and fsync; called before a transaction prepares,
    /// commits or rolls back so its chain is fully positioned.
    pub fn flush_and_sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)?;
        inner.file.sync_data().map_err(|e| {
            TxError::SystemFailure {
                reason: format!("log fsync failed: {e}"),
            }
        })
    }

    fn flush_locked(&self, inner: &mut WriterInner) -> Result<()> {
        if inner.queued_bytes == 0 {
            return Ok(());
        }
        let queues: Vec<(TransactionId, Vec<SharedBuffer>)> = inner.queues.drain().collect();
        inner.queued_bytes = 0;
        for (xid, buffers) in queues {
            for shared in buffers {
                let len = match shared.lock().bytes() {
                    Some(bytes) => bytes.len(),
                    None => continue,
                };
                let info = self.write_locked(inner, &xid, &shared, len)?;
                let mut buffer = shared.lock();
                if inner.retained_bytes + len > self.max_buffered_bytes {
                    buffer.make_on_disk(info);
                } else {
                    buffer.set_on_disk_info(info);
                    inner.retained_bytes += len;
                    *inner.retained_per_txn.entry(xid.clone()).or_insert(0) += len;
                }
            }
        }
        Ok(())
    }

    // Writes one buffer's bytes at the current tail, rotating first if the
    // write would overflow the file cap.
    fn write_locked(
        &self,
        inner: &mut WriterInner,
        xid: &TransactionId,
        shared: &SharedBuffer,
        len: usize,
    ) -> Result<OnDiskInfo> {
        self.rotate_if_needed(inner, len as u64)?;
        let offset = inner.current_size;
        {
            let buffer = shared.lock();
            let bytes = buffer.bytes().ok_or_else(|| TxError::SystemFailure {
                reason: "queued buffer lost its bytes before flush".to_string(),
            })?;
            inner.file.write_all(bytes).map_err(|e| TxError::SystemFailure {
                reason: format!("log write failed: {e}"),
            })?;
        }
        inner.current_size += len as u64;
        let info = OnDiskInfo {
            log_index: inner.current_index,
            offset,
        };
        inner.usage.track(xid, info.log_index);
        Ok(info)
    }

    fn rotate_if_needed(&self, inner: &mut WriterInner, incoming: u64) -> Result<()> {
        if inner.current_size == 0 || inner.current_size + incoming <= self.max_log_file_size {
            return Ok(());
        }
        inner.file.sync_data().map_err(|e| TxError::SystemFailure {
            reason: format!("log fsync before rotation failed: {e}"),
        })?;
        let next_index = inner.current_index + 1;
        let path = self.log_path(next_index);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| TxError::SystemFailure {
                reason: format!("log rotation failed: {e}"),
            })?;
        info!(log_index = next_index, "rotated transaction log");
        inner.file = file;
        inner.current_index = next_index;
        inner.current_size = 0;

        // Endpoint registrations must survive rotation; re-record them into
        // the fresh file.
        let endpoints: Vec<String> = inner.active_endpoints.iter().cloned().collect();
        for endpoint in endpoints {
            let record = LogRecord::EndpointActivates { endpoint };
            let (bytes, _) = record.serialize(&[]);
            inner.file.write_all(&bytes).map_err(|e| TxError::SystemFailure {
                reason: format!("log write failed: {e}"),
            })?;
            inner.current_size += bytes.len() as u64;
        }
        Ok(())
    }

    /// Write a control record synchronously: the owning transaction's queue
    /// is flushed first (preserving submission order), then the record is
    /// written and fsynced before returning.
    pub fn force_write(&self, record: &LogRecord, content: &[u8]) -> Result<OnDiskInfo> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)?;
        let (bytes, header_len) = record.serialize(content);
        let len = bytes.len();
        self.rotate_if_needed(&mut inner, len as u64)?;
        let offset = inner.current_size;
        inner.file.write_all(&bytes).map_err(|e| TxError::SystemFailure {
            reason: format!("log write failed: {e}"),
        })?;
        inner.current_size += len as u64;
        inner.file.sync_data().map_err(|e| TxError::SystemFailure {
            reason: format!("log fsync failed: {e}"),
        })?;
        let info = OnDiskInfo {
            log_index: inner.current_index,
            offset,
        };
        if let Some(xid) = record.xid() {
            inner.usage.track(xid, info.log_index);
        }
        debug!(op = record.op(), log_index = info.log_index, offset = info.offset, header_len, "control record forced");
        Ok(info)
    }

    /// Record an endpoint activation durably and remember it for re-recording
    /// on rotation.
    pub fn record_endpoint_activation(&self, endpoint: &str) -> Result<()> {
        self.force_write(
            &LogRecord::EndpointActivates {
                endpoint: endpoint.to_string(),
            },
            &[],
        )?;
        self.inner.lock().active_endpoints.insert(endpoint.to_string());
        Ok(())
    }

    /// Record an endpoint deactivation durably.
    pub fn record_endpoint_deactivation(&self, endpoint: &str) -> Result<()> {
        self.force_write(
            &LogRecord::EndpointDeactivates {
                endpoint: endpoint.to_string(),
            },
            &[],
        )?;
        self.inner.lock().active_endpoints.remove(endpoint);
        Ok(())
    }

    /// Drop a finished transaction's bookkeeping and durably delete any log
    /// file no open transaction references anymore.
    pub fn release_transaction(&self, xid: &TransactionId) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(buffers) = inner.queues.remove(xid) {
            let dropped: usize = buffers
                .iter()
                .map(|b| b.lock().bytes().map_or(0, |x| x.len()))
                .sum();
            inner.queued_bytes = inner.queued_bytes.saturating_sub(dropped);
        }
        if let Some(retained) = inner.retained_per_txn.remove(xid) {
            inner.retained_bytes = inner.retained_bytes.saturating_sub(retained);
        }
        let current = inner.current_index;
        let deletable = inner.usage.release_transaction(xid, current);
        for index in deletable {
            let path = self.log_path(index);
            info!(log_index = index, "deleting fully released transaction log");
            inner.disk.delete_file_durably(&path).map_err(|e| {
                TxError::SystemFailure {
                    reason: format!("log deletion failed: {e}"),
                }
            })?;
        }
        Ok(())
    }

    /// Mark that `xid` has records in `log_index`; used by recovery when
    /// rebuilding chains from disk.
    pub fn adopt_usage(&self, xid: &TransactionId, log_index: u64) {
        self.inner.lock().usage.track(xid, log_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RecordReader;

    fn xid(n: u64) -> TransactionId {
        TransactionId::for_local_transaction(n)
    }

    fn writer_in(dir: &Path) -> (GatheringLogWriter, EngineConfig) {
        let config = EngineConfig::for_testing(dir).with_log_flush_threshold(128);
        (GatheringLogWriter::open(&config).unwrap(), config)
    }

    #[test]
    fn queued_records_flush_with_positions() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, config) = writer_in(dir.path());
        let x = xid(1);

        let b1 = writer
            .submit(
                &x,
                &LogRecord::FileCreate {
                    xid: x.clone(),
                    path: PathBuf::from("/a"),
                },
                &[],
            )
            .unwrap();
        assert!(b1.lock().on_disk_info().is_none(), "still queued");

        writer.flush_and_sync().unwrap();
        let info = b1.lock().on_disk_info().unwrap();
        assert_eq!(info.log_index, writer.current_log_index());

        let parsed =
            RecordReader::read_at(&config.log_file_path(info.log_index), info.log_index, info.offset)
                .unwrap();
        assert!(matches!(parsed.record, LogRecord::FileCreate { .. }));
    }

    #[test]
    fn control_records_are_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, config) = writer_in(dir.path());
        let x = xid(1);
        let info = writer
            .force_write(&LogRecord::CommitBegins { xid: x }, &[])
            .unwrap();
        let parsed =
            RecordReader::read_at(&config.log_file_path(info.log_index), info.log_index, info.offset)
                .unwrap();
        assert!(matches!(parsed.record, LogRecord::CommitBegins { .. }));
    }

    #[test]
    fn order_is_preserved_across_queue_and_force() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, config) = writer_in(dir.path());
        let x = xid(1);
        writer
            .submit(
                &x,
                &LogRecord::FileCreate {
                    xid: x.clone(),
                    path: PathBuf::from("/a"),
                },
                &[],
            )
            .unwrap();
        writer
            .force_write(&LogRecord::CommitBegins { xid: x.clone() }, &[])
            .unwrap();

        let index = writer.current_log_index();
        let mut reader = RecordReader::open(&config.log_file_path(index), index).unwrap();
        let ops: Vec<u8> = std::iter::from_fn(|| reader.next_record().unwrap())
            .map(|p| p.record.op())
            .collect();
        assert_eq!(ops, vec![6, 12]); // create, then commit-begins
    }

    #[test]
    fn rotation_re_records_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::for_testing(dir.path()).with_max_log_file_size(200);
        let writer = GatheringLogWriter::open(&config).unwrap();
        writer.record_endpoint_activation("ep-1").unwrap();
        let first_index = writer.current_log_index();

        // Push enough control records to overflow the small cap.
        let x = xid(1);
        for _ in 0..10 {
            writer
                .force_write(&LogRecord::CommitBegins { xid: x.clone() }, &[])
                .unwrap();
        }
        let rotated = writer.current_log_index();
        assert!(rotated > first_index);

        let mut reader = RecordReader::open(&config.log_file_path(rotated), rotated).unwrap();
        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(
            first.record,
            LogRecord::EndpointActivates {
                endpoint: "ep-1".to_string()
            }
        );
    }

    #[test]
    fn released_logs_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::for_testing(dir.path()).with_max_log_file_size(150);
        let writer = GatheringLogWriter::open(&config).unwrap();
        let x = xid(1);
        let first_index = writer.current_log_index();
        for _ in 0..10 {
            writer
                .force_write(&LogRecord::CommitBegins { xid: x.clone() }, &[])
                .unwrap();
        }
        assert!(writer.current_log_index() > first_index);
        writer.release_transaction(&x).unwrap();
        assert!(!config.log_file_path(first_index).exists());
        assert!(config.log_file_path(writer.current_log_index()).exists());
    }
}
