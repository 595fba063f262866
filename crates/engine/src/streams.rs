//! Transactional file streams.
//!
//! A stream is a thin positioned cursor over the owning session's view of
//! one file. Input streams read through the copy-on-write view (unmodified
//! physical prefix, buffered segments, or the heavy-write channel); output
//! streams append at the virtual end of file. Dropping a stream closes it.

use std::path::PathBuf;
use std::sync::Arc;
use txfs_core::Result;

use crate::session::Session;

/// Read cursor over one file within a transaction.
pub struct TxInputStream {
    session: Arc<Session>,
    path: PathBuf,
    position: u64,
    closed: bool,
}

impl TxInputStream {
    pub(crate) fn new(session: Arc<Session>, path: PathBuf) -> Self {
        TxInputStream {
            session,
            path,
            position: 0,
            closed: false,
        }
    }

    /// Path this stream reads.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reposition the cursor; reads past end of file return zero bytes.
    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    /// Read up to `buf.len()` bytes at the cursor, advancing it. Returns the
    /// number of bytes read, zero at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.session.stream_read(&self.path, self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Close the stream, releasing the in-use mark on the file.
    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        if !self.closed {
            self.closed = true;
            self.session.stream_closed(&self.path, false);
        }
    }
}

impl Drop for TxInputStream {
    fn drop(&mut self) {
        self.close_inner();
    }
}

/// Append-only write cursor over one file within a transaction.
pub struct TxOutputStream {
    session: Arc<Session>,
    path: PathBuf,
    closed: bool,
}

impl TxOutputStream {
    pub(crate) fn new(session: Arc<Session>, path: PathBuf) -> Self {
        TxOutputStream {
            session,
            path,
            closed: false,
        }
    }

    /// Path this stream appends to.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append `bytes` at the virtual end of the file.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.session.stream_write(&self.path, bytes)
    }

    /// Close the stream, releasing the in-use mark on the file.
    pub fn close(mut self) {
        self.close_inner();
    }

    fn close_inner(&mut self) {
        if !self.closed {
            self.closed = true;
            self.session.stream_closed(&self.path, true);
        }
    }
}

impl Drop for TxOutputStream {
    fn drop(&mut self) {
        self.close_inner();
    }
}
