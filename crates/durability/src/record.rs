//! The binary log record format.
//!
//! Wire layout, little-endian:
//!
//! ```text
//! +------------+-------------+-----------+------+-------------+--------+
//! | header_len | content_len | crc32     | op   | transaction | fields |
//! | u32        | u32         | u32       | u8   | id (varies) |        |
//! +------------+-------------+-----------+------+-------------+--------+
//! ```
//!
//! `header_len` counts everything above; `content_len` bytes of raw appended
//! file content follow the header for `FileAppend` and `UndoFileTruncate`.
//! The CRC covers the header from the op byte onward. Paths are
//! u16-length-prefixed UTF-8; offsets and lengths are u64; lists are a u32
//! count followed by the items. The format must stay stable across restarts
//! of the same engine instance; cross-implementation compatibility is not a
//! goal.

use byteorder::{ByteOrder, LittleEndian};
use std::path::{Path, PathBuf};
use txfs_core::{Result, TransactionId, TxError};

/// Fixed part of the header: lengths + CRC.
pub const FIXED_HEADER_LEN: usize = 4 + 4 + 4;

// Operation tags. Redo records are < OP_COMMIT_BEGINS; undo records are
// OP_UNDO_FILE_APPEND and OP_UNDO_FILE_TRUNCATE.
const OP_FILE_APPEND: u8 = 2;
const OP_FILE_MOVE: u8 = 3;
const OP_FILE_COPY: u8 = 4;
const OP_FILE_DELETE: u8 = 5;
const OP_FILE_CREATE: u8 = 6;
const OP_DIR_CREATE: u8 = 7;
const OP_FILE_TRUNCATE: u8 = 8;
const OP_FILE_SPECIAL_MOVE: u8 = 9;
const OP_EVENT_ENQUEUE: u8 = 10;
const OP_FILES_ALREADY_ON_DISK: u8 = 11;
const OP_COMMIT_BEGINS: u8 = 12;
const OP_COMMIT_DONE: u8 = 13;
const OP_ROLLBACK_DONE: u8 = 14;
const OP_PREPARE_DONE: u8 = 15;
const OP_UNDO_FILE_APPEND: u8 = 16;
const OP_UNDO_FILE_TRUNCATE: u8 = 17;
const OP_USES_UNDO_LOGS: u8 = 18;
const OP_EVENT_DEQUEUE: u8 = 19;
const OP_PREPARE_DONE_EVENT_DEQUEUE: u8 = 20;
const OP_CHECKPOINT: u8 = 21;
const OP_ENDPOINT_ACTIVATES: u8 = 22;
const OP_ENDPOINT_DEACTIVATES: u8 = 23;

/// What happened to a file, for change-event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// File or directory came into existence.
    Created,
    /// File or directory was removed.
    Deleted,
    /// File content changed.
    Modified,
}

impl EventKind {
    fn to_byte(self) -> u8 {
        match self {
            EventKind::Created => 1,
            EventKind::Deleted => 2,
            EventKind::Modified => 3,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(EventKind::Created),
            2 => Some(EventKind::Deleted),
            3 => Some(EventKind::Modified),
            _ => None,
        }
    }
}

/// A durable change event carried by enqueue/dequeue records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Affected path.
    pub path: PathBuf,
    /// What happened.
    pub kind: EventKind,
}

/// One write-ahead log record.
///
/// Every variant carries the owning transaction id except the two endpoint
/// registration variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Redo: append `length` bytes (following the header) at `offset`.
    FileAppend {
        xid: TransactionId,
        path: PathBuf,
        offset: u64,
        length: u64,
    },
    /// Redo: move a file or directory.
    FileMove {
        xid: TransactionId,
        src: PathBuf,
        dst: PathBuf,
    },
    /// Redo: copy a file.
    FileCopy {
        xid: TransactionId,
        src: PathBuf,
        dst: PathBuf,
    },
    /// Redo: delete a file or empty directory.
    FileDelete { xid: TransactionId, path: PathBuf },
    /// Redo: create an empty file.
    FileCreate { xid: TransactionId, path: PathBuf },
    /// Redo: create a directory.
    DirCreate { xid: TransactionId, path: PathBuf },
    /// Redo: truncate a file to `new_length`.
    FileTruncate {
        xid: TransactionId,
        path: PathBuf,
        new_length: u64,
    },
    /// Redo: physical placement move of a heavy-write file (shadow copy into
    /// the backup tree, or its promotion/deletion).
    FileSpecialMove {
        xid: TransactionId,
        src: PathBuf,
        dst: PathBuf,
    },
    /// Change events queued by a committing transaction.
    EventEnqueue {
        xid: TransactionId,
        events: Vec<ChangeEvent>,
    },
    /// A delivered change event being consumed.
    EventDequeue {
        xid: TransactionId,
        events: Vec<ChangeEvent>,
    },
    /// Files this transaction wrote directly in heavy-write mode; commit
    /// replay and recovery skip redo entries for them.
    FilesAlreadyOnDisk {
        xid: TransactionId,
        paths: Vec<PathBuf>,
    },
    /// Control: commit replay is starting.
    CommitBegins { xid: TransactionId },
    /// Control: commit replay finished.
    CommitDone { xid: TransactionId },
    /// Control: rollback finished.
    RollbackDone { xid: TransactionId },
    /// Control: prepare finished; the transaction is in doubt until the
    /// coordinator decides.
    PrepareDone { xid: TransactionId },
    /// Undo: the file had `prior_length` bytes before the first heavy-write
    /// append.
    UndoFileAppend {
        xid: TransactionId,
        path: PathBuf,
        prior_length: u64,
    },
    /// Undo: `length` saved bytes (following the header) were at `offset`
    /// before truncation.
    UndoFileTruncate {
        xid: TransactionId,
        path: PathBuf,
        offset: u64,
        length: u64,
    },
    /// The transaction wrote undo records; an incomplete one needs rollback
    /// during recovery.
    UsesUndoLogs { xid: TransactionId },
    /// Control: prepare finished for an event-dequeue-only transaction.
    PrepareDoneForEventDequeue { xid: TransactionId },
    /// Replay-ordering safeguard: the first `position` entries of the
    /// transaction's record chain are guaranteed durable.
    Checkpoint { xid: TransactionId, position: u64 },
    /// A message endpoint registered for change events. Re-recorded into
    /// each new log file on rotation so registrations survive it.
    EndpointActivates { endpoint: String },
    /// A message endpoint deregistered.
    EndpointDeactivates { endpoint: String },
}

fn put_path(out: &mut Vec<u8>, path: &Path) {
    let s = path.to_string_lossy();
    let bytes = s.as_bytes();
    let mut len = [0u8; 2];
    LittleEndian::write_u16(&mut len, bytes.len() as u16);
    out.extend_from_slice(&len);
    out.extend_from_slice(bytes);
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    let mut len = [0u8; 2];
    LittleEndian::write_u16(&mut len, s.len() as u16);
    out.extend_from_slice(&len);
    out.extend_from_slice(s.as_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    let mut b = [0u8; 8];
    LittleEndian::write_u64(&mut b, v);
    out.extend_from_slice(&b);
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return None;
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(LittleEndian::read_u32)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(LittleEndian::read_u64)
    }

    fn path(&mut self) -> Option<PathBuf> {
        let len = self.take(2).map(LittleEndian::read_u16)? as usize;
        let bytes = self.take(len)?;
        Some(PathBuf::from(String::from_utf8_lossy(bytes).into_owned()))
    }

    fn string(&mut self) -> Option<String> {
        let len = self.take(2).map(LittleEndian::read_u16)? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    fn xid(&mut self) -> Option<TransactionId> {
        let (xid, consumed) = TransactionId::decode(&self.bytes[self.pos..])?;
        self.pos += consumed;
        Some(xid)
    }
}

impl LogRecord {
    /// Operation tag byte.
    pub fn op(&self) -> u8 {
        match self {
            LogRecord::FileAppend { .. } => OP_FILE_APPEND,
            LogRecord::FileMove { .. } => OP_FILE_MOVE,
            LogRecord::FileCopy { .. } => OP_FILE_COPY,
            LogRecord::FileDelete { .. } => OP_FILE_DELETE,
            LogRecord::FileCreate { .. } => OP_FILE_CREATE,
            LogRecord::DirCreate { .. } => OP_DIR_CREATE,
            LogRecord::FileTruncate { .. } => OP_FILE_TRUNCATE,
            LogRecord::FileSpecialMove { .. } => OP_FILE_SPECIAL_MOVE,
            LogRecord::EventEnqueue { .. } => OP_EVENT_ENQUEUE,
            LogRecord::FilesAlreadyOnDisk { .. } => OP_FILES_ALREADY_ON_DISK,
            LogRecord::CommitBegins { .. } => OP_COMMIT_BEGINS,
            LogRecord::CommitDone { .. } => OP_COMMIT_DONE,
            LogRecord::RollbackDone { .. } => OP_ROLLBACK_DONE,
            LogRecord::PrepareDone { .. } => OP_PREPARE_DONE,
            LogRecord::UndoFileAppend { .. } => OP_UNDO_FILE_APPEND,
            LogRecord::UndoFileTruncate { .. } => OP_UNDO_FILE_TRUNCATE,
            LogRecord::UsesUndoLogs { .. } => OP_USES_UNDO_LOGS,
            LogRecord::EventDequeue { .. } => OP_EVENT_DEQUEUE,
            LogRecord::PrepareDoneForEventDequeue { .. } => OP_PREPARE_DONE_EVENT_DEQUEUE,
            LogRecord::Checkpoint { .. } => OP_CHECKPOINT,
            LogRecord::EndpointActivates { .. } => OP_ENDPOINT_ACTIVATES,
            LogRecord::EndpointDeactivates { .. } => OP_ENDPOINT_DEACTIVATES,
        }
    }

    /// True for records replayed forward at commit.
    pub fn is_redo(&self) -> bool {
        self.op() < OP_COMMIT_BEGINS
    }

    /// True for records replayed in reverse at rollback.
    pub fn is_undo(&self) -> bool {
        matches!(self.op(), OP_UNDO_FILE_APPEND | OP_UNDO_FILE_TRUNCATE)
    }

    /// Owning transaction id, absent only for endpoint registrations.
    pub fn xid(&self) -> Option<&TransactionId> {
        match self {
            LogRecord::FileAppend { xid, .. }
            | LogRecord::FileMove { xid, .. }
            | LogRecord::FileCopy { xid, .. }
            | LogRecord::FileDelete { xid, .. }
            | LogRecord::FileCreate { xid, .. }
            | LogRecord::DirCreate { xid, .. }
            | LogRecord::FileTruncate { xid, .. }
            | LogRecord::FileSpecialMove { xid, .. }
            | LogRecord::EventEnqueue { xid, .. }
            | LogRecord::EventDequeue { xid, .. }
            | LogRecord::FilesAlreadyOnDisk { xid, .. }
            | LogRecord::CommitBegins { xid }
            | LogRecord::CommitDone { xid }
            | LogRecord::RollbackDone { xid }
            | LogRecord::PrepareDone { xid }
            | LogRecord::UndoFileAppend { xid, .. }
            | LogRecord::UndoFileTruncate { xid, .. }
            | LogRecord::UsesUndoLogs { xid }
            | LogRecord::PrepareDoneForEventDequeue { xid }
            | LogRecord::Checkpoint { xid, .. } => Some(xid),
            LogRecord::EndpointActivates { .. } | LogRecord::EndpointDeactivates { .. } => None,
        }
    }

    /// Length of raw file content that follows the header on disk.
    pub fn content_len(&self) -> u64 {
        match self {
            LogRecord::FileAppend { length, .. } => *length,
            LogRecord::UndoFileTruncate { length, .. } => *length,
            _ => 0,
        }
    }

    /// Serialize, appending `content` (which must match [`content_len`])
    /// after the header. Returns the full bytes and the header length.
    ///
    /// [`content_len`]: LogRecord::content_len
    pub fn serialize(&self, content: &[u8]) -> (Vec<u8>, u32) {
        debug_assert_eq!(content.len() as u64, self.content_len());
        let mut body = Vec::with_capacity(64 + content.len());
        body.push(self.op());
        if let Some(xid) = self.xid() {
            xid.encode_into(&mut body);
        }
        match self {
            LogRecord::FileAppend {
                path, offset, length, ..
            } => {
                put_path(&mut body, path);
                put_u64(&mut body, *offset);
                put_u64(&mut body, *length);
            }
            LogRecord::FileMove { src, dst, .. }
            | LogRecord::FileCopy { src, dst, .. }
            | LogRecord::FileSpecialMove { src, dst, .. } => {
                put_path(&mut body, src);
                put_path(&mut body, dst);
            }
            LogRecord::FileDelete { path, .. }
            | LogRecord::FileCreate { path, .. }
            | LogRecord::DirCreate { path, .. } => {
                put_path(&mut body, path);
            }
            LogRecord::FileTruncate {
                path, new_length, ..
            } => {
                put_path(&mut body, path);
                put_u64(&mut body, *new_length);
            }
            LogRecord::EventEnqueue { events, .. } | LogRecord::EventDequeue { events, .. } => {
                put_u32(&mut body, events.len() as u32);
                for ev in events {
                    body.push(ev.kind.to_byte());
                    put_path(&mut body, &ev.path);
                }
            }
            LogRecord::FilesAlreadyOnDisk { paths, .. } => {
                put_u32(&mut body, paths.len() as u32);
                for p in paths {
                    put_path(&mut body, p);
                }
            }
            LogRecord::UndoFileAppend {
                path, prior_length, ..
            } => {
                put_path(&mut body, path);
                put_u64(&mut body, *prior_length);
            }
            LogRecord::UndoFileTruncate {
                path, offset, length, ..
            } => {
                put_path(&mut body, path);
                put_u64(&mut body, *offset);
                put_u64(&mut body, *length);
            }
            LogRecord::Checkpoint { position, .. } => {
                put_u64(&mut body, *position);
            }
            LogRecord::EndpointActivates { endpoint }
            | LogRecord::EndpointDeactivates { endpoint } => {
                put_str(&mut body, endpoint);
            }
            LogRecord::CommitBegins { .. }
            | LogRecord::CommitDone { .. }
            | LogRecord::RollbackDone { .. }
            | LogRecord::PrepareDone { .. }
            | LogRecord::UsesUndoLogs { .. }
            | LogRecord::PrepareDoneForEventDequeue { .. } => {}
        }

        let header_len = (FIXED_HEADER_LEN + body.len()) as u32;
        let crc = crc32fast::hash(&body);
        let mut out = Vec::with_capacity(header_len as usize + content.len());
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, header_len);
        out.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, content.len() as u32);
        out.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, crc);
        out.extend_from_slice(&word);
        out.extend_from_slice(&body);
        out.extend_from_slice(content);
        (out, header_len)
    }

    /// Decode one record header from `bytes`.
    ///
    /// Returns the record, its header length and its content length. The
    /// caller is responsible for skipping `content_len` bytes of appended
    /// content before the next record.
    pub fn decode(bytes: &[u8], log_index: u64, offset: u64) -> Result<(LogRecord, u32, u32)> {
        let corrupt = |detail: &str| TxError::CorruptLogRecord {
            log_index,
            offset,
            detail: detail.to_string(),
        };
        if bytes.len() < FIXED_HEADER_LEN {
            return Err(corrupt("short fixed header"));
        }
        let header_len = LittleEndian::read_u32(&bytes[0..4]) as usize;
        let content_len = LittleEndian::read_u32(&bytes[4..8]);
        let crc = LittleEndian::read_u32(&bytes[8..12]);
        if header_len < FIXED_HEADER_LEN + 1 || bytes.len() < header_len {
            return Err(corrupt("truncated header"));
        }
        let body = &bytes[FIXED_HEADER_LEN..header_len];
        if crc32fast::hash(body) != crc {
            return Err(corrupt("crc mismatch"));
        }

        let mut c = Cursor { bytes: body, pos: 0 };
        let op = c.u8().ok_or_else(|| corrupt("missing op"))?;
        let record = match op {
            OP_ENDPOINT_ACTIVATES | OP_ENDPOINT_DEACTIVATES => {
                let endpoint = c.string().ok_or_else(|| corrupt("bad endpoint"))?;
                if op == OP_ENDPOINT_ACTIVATES {
                    LogRecord::EndpointActivates { endpoint }
                } else {
                    LogRecord::EndpointDeactivates { endpoint }
                }
            }
            _ => {
                let xid = c.xid().ok_or_else(|| corrupt("bad transaction id"))?;
                match op {
                    OP_FILE_APPEND => LogRecord::FileAppend {
                        xid,
                        path: c.path().ok_or_else(|| corrupt("bad path"))?,
                        offset: c.u64().ok_or_else(|| corrupt("bad offset"))?,
                        length: c.u64().ok_or_else(|| corrupt("bad length"))?,
                    },
                    OP_FILE_MOVE | OP_FILE_COPY | OP_FILE_SPECIAL_MOVE => {
                        let src = c.path().ok_or_else(|| corrupt("bad src"))?;
                        let dst = c.path().ok_or_else(|| corrupt("bad dst"))?;
                        match op {
                            OP_FILE_MOVE => LogRecord::FileMove { xid, src, dst },
                            OP_FILE_COPY => LogRecord::FileCopy { xid, src, dst },
                            _ => LogRecord::FileSpecialMove { xid, src, dst },
                        }
                    }
                    OP_FILE_DELETE => LogRecord::FileDelete {
                        xid,
                        path: c.path().ok_or_else(|| corrupt("bad path"))?,
                    },
                    OP_FILE_CREATE => LogRecord::FileCreate {
                        xid,
                        path: c.path().ok_or_else(|| corrupt("bad path"))?,
                    },
                    OP_DIR_CREATE => LogRecord::DirCreate {
                        xid,
                        path: c.path().ok_or_else(|| corrupt("bad path"))?,
                    },
                    OP_FILE_TRUNCATE => LogRecord::FileTruncate {
                        xid,
                        path: c.path().ok_or_else(|| corrupt("bad path"))?,
                        new_length: c.u64().ok_or_else(|| corrupt("bad length"))?,
                    },
                    OP_EVENT_ENQUEUE | OP_EVENT_DEQUEUE => {
                        let count = c.u32().ok_or_else(|| corrupt("bad count"))?;
                        let mut events = Vec::with_capacity(count as usize);
                        for _ in 0..count {
                            let kind = c
                                .u8()
                                .and_then(EventKind::from_byte)
                                .ok_or_else(|| corrupt("bad event kind"))?;
                            let path = c.path().ok_or_else(|| corrupt("bad event path"))?;
                            events.push(ChangeEvent { path, kind });
                        }
                        if op == OP_EVENT_ENQUEUE {
                            LogRecord::EventEnqueue { xid, events }
                        } else {
                            LogRecord::EventDequeue { xid, events }
                        }
                    }
                    OP_FILES_ALREADY_ON_DISK => {
                        let count = c.u32().ok_or_else(|| corrupt("bad count"))?;
                        let mut paths = Vec::with_capacity(count as usize);
                        for _ in 0..count {
                            paths.push(c.path().ok_or_else(|| corrupt("bad path"))?);
                        }
                        LogRecord::FilesAlreadyOnDisk { xid, paths }
                    }
                    OP_COMMIT_BEGINS => LogRecord::CommitBegins { xid },
                    OP_COMMIT_DONE => LogRecord::CommitDone { xid },
                    OP_ROLLBACK_DONE => LogRecord::RollbackDone { xid },
                    OP_PREPARE_DONE => LogRecord::PrepareDone { xid },
                    OP_UNDO_FILE_APPEND => LogRecord::UndoFileAppend {
                        xid,
                        path: c.path().ok_or_else(|| corrupt("bad path"))?,
                        prior_length: c.u64().ok_or_else(|| corrupt("bad length"))?,
                    },
                    OP_UNDO_FILE_TRUNCATE => LogRecord::UndoFileTruncate {
                        xid,
                        path: c.path().ok_or_else(|| corrupt("bad path"))?,
                        offset: c.u64().ok_or_else(|| corrupt("bad offset"))?,
                        length: c.u64().ok_or_else(|| corrupt("bad length"))?,
                    },
                    OP_USES_UNDO_LOGS => LogRecord::UsesUndoLogs { xid },
                    OP_PREPARE_DONE_EVENT_DEQUEUE => {
                        LogRecord::PrepareDoneForEventDequeue { xid }
                    }
                    OP_CHECKPOINT => LogRecord::Checkpoint {
                        xid,
                        position: c.u64().ok_or_else(|| corrupt("bad position"))?,
                    },
                    _ => return Err(corrupt("unknown op tag")),
                }
            }
        };
        Ok((record, header_len as u32, content_len))
    }
}
