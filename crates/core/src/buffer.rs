//! Log-record payload buffers.
//!
//! A [`Buffer`] starts out holding the serialized record bytes in memory.
//! Once the record has been flushed, the writer may drop the bytes under
//! memory pressure ([`Buffer::make_on_disk`]); the content is then re-read
//! from the referenced log file on demand. Buffers are scope-bound: dropping
//! the last clone releases the memory, nothing is deferred to finalization.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

/// Where a flushed record lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnDiskInfo {
    /// Index of the log file holding the record.
    pub log_index: u64,
    /// Byte offset of the record header within that file.
    pub offset: u64,
}

/// A serialized log record, in memory or spilled to a log file.
#[derive(Debug, Clone)]
pub struct Buffer {
    bytes: Option<Arc<Vec<u8>>>,
    on_disk: Option<OnDiskInfo>,
    header_len: u32,
    content_len: u32,
    content_position: u64,
}

impl Buffer {
    /// Wrap freshly serialized record bytes.
    ///
    /// `header_len` is the length of the record header; any remaining bytes
    /// are appended file content of length `content_len`.
    pub fn new(bytes: Vec<u8>, header_len: u32, content_len: u32) -> Self {
        debug_assert_eq!(bytes.len(), header_len as usize + content_len as usize);
        Buffer {
            bytes: Some(Arc::new(bytes)),
            on_disk: None,
            header_len,
            content_len,
            content_position: 0,
        }
    }

    /// The in-memory record bytes, if not yet spilled.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref().map(|v| v.as_slice())
    }

    /// Length of the record header.
    pub fn header_len(&self) -> u32 {
        self.header_len
    }

    /// Length of the appended file content carried by this record.
    pub fn content_len(&self) -> u32 {
        self.content_len
    }

    /// File offset at which this record's content lands in the target file.
    pub fn content_position(&self) -> u64 {
        self.content_position
    }

    /// Record where the content lands in the target file.
    pub fn set_content_position(&mut self, position: u64) {
        self.content_position = position;
    }

    /// Where the flushed record lives, once known.
    pub fn on_disk_info(&self) -> Option<OnDiskInfo> {
        self.on_disk
    }

    /// Note the record's on-disk location without dropping the bytes.
    pub fn set_on_disk_info(&mut self, info: OnDiskInfo) {
        self.on_disk = Some(info);
    }

    /// Drop the in-memory bytes, keeping only the on-disk reference.
    ///
    /// No-op unless an on-disk location has been recorded.
    pub fn make_on_disk(&mut self, info: OnDiskInfo) {
        self.on_disk = Some(info);
        self.bytes = None;
    }

    /// A clone sharing the same bytes (or on-disk reference).
    pub fn read_only_clone(&self) -> Buffer {
        self.clone()
    }

    /// Read this record's file content starting at `from`, from memory or by
    /// re-reading the log file at `log_path`.
    pub fn content_from(&self, log_path: &Path, from: u32) -> io::Result<Vec<u8>> {
        let want = self.content_len.saturating_sub(from) as usize;
        if want == 0 {
            return Ok(Vec::new());
        }
        if let Some(bytes) = self.bytes.as_deref() {
            let start = self.header_len as usize + from as usize;
            return Ok(bytes[start..start + want].to_vec());
        }
        let info = self.on_disk.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "buffer has neither bytes nor location")
        })?;
        let mut file = File::open(log_path)?;
        file.seek(SeekFrom::Start(
            info.offset + self.header_len as u64 + from as u64,
        ))?;
        let mut out = vec![0u8; want];
        file.read_exact(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn content_served_from_memory() {
        let mut bytes = vec![0u8; 10];
        bytes.extend_from_slice(b"hello");
        let buf = Buffer::new(bytes, 10, 5);
        let content = buf.content_from(Path::new("/nonexistent"), 0).unwrap();
        assert_eq!(content, b"hello");
        let tail = buf.content_from(Path::new("/nonexistent"), 3).unwrap();
        assert_eq!(tail, b"lo");
    }

    #[test]
    fn content_reread_from_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("txlog_0");
        let mut f = File::create(&log).unwrap();
        f.write_all(b"xxxxHEADERhello world").unwrap();

        let mut buf = Buffer::new(
            {
                let mut v = b"HEADER".to_vec();
                v.extend_from_slice(b"hello world");
                v
            },
            6,
            11,
        );
        buf.make_on_disk(OnDiskInfo {
            log_index: 0,
            offset: 4,
        });
        assert!(buf.bytes().is_none());
        assert_eq!(buf.content_from(&log, 0).unwrap(), b"hello world");
        assert_eq!(buf.content_from(&log, 6).unwrap(), b"world");
    }
}
