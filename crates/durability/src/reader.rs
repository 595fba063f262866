//! Sequential and random-access reading of transaction log files.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::warn;
use txfs_core::{Result, TxError};

use crate::record::{LogRecord, FIXED_HEADER_LEN};

/// A decoded record together with its location in the log file.
#[derive(Debug)]
pub struct ParsedRecord {
    /// Byte offset of the record header.
    pub offset: u64,
    /// Header length on disk.
    pub header_len: u32,
    /// Length of appended file content following the header.
    pub content_len: u32,
    /// The decoded record.
    pub record: LogRecord,
}

/// Forward scanner over one log file.
///
/// A partial record at the tail (an unflushed write cut off by a crash) ends
/// the scan; everything before it was either flushed or force-written.
pub struct RecordReader {
    file: File,
    path: PathBuf,
    log_index: u64,
    offset: u64,
    len: u64,
}

impl RecordReader {
    /// Open the log file at `path` for scanning.
    pub fn open(path: &Path, log_index: u64) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(RecordReader {
            file,
            path: path.to_path_buf(),
            log_index,
            offset: 0,
            len,
        })
    }

    /// Path of the log file being scanned.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next record, or `None` at end of the valid portion.
    pub fn next_record(&mut self) -> Result<Option<ParsedRecord>> {
        if self.offset + FIXED_HEADER_LEN as u64 > self.len {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(self.offset))?;
        let mut fixed = [0u8; FIXED_HEADER_LEN];
        self.file.read_exact(&mut fixed)?;
        let header_len = u32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]) as u64;
        let content_len = u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]) as u64;
        if header_len < FIXED_HEADER_LEN as u64 + 1
            || self.offset + header_len + content_len > self.len
        {
            warn!(
                log_index = self.log_index,
                offset = self.offset,
                "partial record at log tail, ending scan"
            );
            return Ok(None);
        }
        let mut header = vec![0u8; header_len as usize];
        header[..FIXED_HEADER_LEN].copy_from_slice(&fixed);
        self.file
            .read_exact(&mut header[FIXED_HEADER_LEN..])
            .map_err(TxError::Io)?;
        let (record, hl, cl) = LogRecord::decode(&header, self.log_index, self.offset)?;
        let parsed = ParsedRecord {
            offset: self.offset,
            header_len: hl,
            content_len: cl,
            record,
        };
        self.offset += header_len + content_len;
        Ok(Some(parsed))
    }

    /// Decode the record at a known offset in `path`.
    pub fn read_at(path: &Path, log_index: u64, offset: u64) -> Result<ParsedRecord> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut fixed = [0u8; FIXED_HEADER_LEN];
        file.read_exact(&mut fixed)?;
        let header_len = u32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]) as usize;
        if header_len < FIXED_HEADER_LEN + 1 {
            return Err(TxError::CorruptLogRecord {
                log_index,
                offset,
                detail: "bad header length".to_string(),
            });
        }
        let mut header = vec![0u8; header_len];
        header[..FIXED_HEADER_LEN].copy_from_slice(&fixed);
        file.read_exact(&mut header[FIXED_HEADER_LEN..])
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => TxError::CorruptLogRecord {
                    log_index,
                    offset,
                    detail: "truncated record".to_string(),
                },
                _ => TxError::Io(e),
            })?;
        let (record, hl, cl) = LogRecord::decode(&header, log_index, offset)?;
        Ok(ParsedRecord {
            offset,
            header_len: hl,
            content_len: cl,
            record,
        })
    }
}
