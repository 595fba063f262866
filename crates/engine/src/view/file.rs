//! Per-transaction view of one file's content.
//!
//! Mode A (default, redo-buffered): the view is an unmodified physical
//! prefix of `mapped_length` bytes followed by an ordered list of appended
//! segments whose bytes live in the transaction's queued log records.
//! Nothing physical changes before commit.
//!
//! Mode B (heavy write): the view is detached onto a private physical
//! channel (the real file in place, or a shadow copy in the backup tree when
//! in-place mutation would be unsafe). Buffered segments are flushed into
//! the channel once; subsequent mutations hit the channel directly, with the
//! session force-writing an undo record before the first in-place mutation.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use txfs_core::{Result, TxError};
use txfs_durability::writer::SharedBuffer;

/// A run of appended bytes backed by a queued `FileAppend` record.
#[derive(Debug, Clone)]
pub struct Segment {
    buffer: SharedBuffer,
    file_offset: u64,
    len: u64,
}

/// Copy-on-write view of one file.
#[derive(Debug)]
pub struct VirtualViewFile {
    logical_path: PathBuf,
    physical_source: Option<PathBuf>,
    mapped_length: u64,
    segments: Vec<Segment>,
    length: u64,
    heavy: bool,
    heavy_target: Option<PathBuf>,
    using_shadow: bool,
    channel: Option<File>,
    readers: usize,
    writers: usize,
    buffered_write_volume: u64,
}

impl VirtualViewFile {
    /// View of `logical_path`, reading its unmodified prefix from
    /// `physical_source` when the file exists outside this transaction.
    pub fn new(logical_path: PathBuf, physical_source: Option<PathBuf>) -> Result<Self> {
        let physical_len = match &physical_source {
            Some(p) if p.is_file() => std::fs::metadata(p)?.len(),
            _ => 0,
        };
        Ok(VirtualViewFile {
            logical_path,
            physical_source,
            mapped_length: physical_len,
            segments: Vec::new(),
            length: physical_len,
            heavy: false,
            heavy_target: None,
            using_shadow: false,
            channel: None,
            readers: 0,
            writers: 0,
            buffered_write_volume: 0,
        })
    }

    /// Current virtual length.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Path within the transaction.
    pub fn logical_path(&self) -> &Path {
        &self.logical_path
    }

    /// Rewrite the logical path after an ancestor rename.
    pub fn set_logical_path(&mut self, path: PathBuf) {
        self.logical_path = path;
    }

    /// Where the unmodified prefix physically lives.
    pub fn physical_source(&self) -> Option<&Path> {
        self.physical_source.as_deref()
    }

    /// Whether the view has been detached onto a private channel.
    pub fn is_heavy(&self) -> bool {
        self.heavy
    }

    /// The channel target once heavy.
    pub fn heavy_target(&self) -> Option<&Path> {
        self.heavy_target.as_deref()
    }

    /// Whether the channel is a backup-tree shadow rather than the real file.
    pub fn is_using_shadow(&self) -> bool {
        self.using_shadow
    }

    /// Cumulative bytes appended while buffered; drives the automatic switch
    /// to heavy-write mode.
    pub fn buffered_write_volume(&self) -> u64 {
        self.buffered_write_volume
    }

    /// Open input streams over this view.
    pub fn reader_count(&self) -> usize {
        self.readers
    }

    /// Open output streams over this view.
    pub fn writer_count(&self) -> usize {
        self.writers
    }

    /// Track stream open/close.
    pub fn add_reader(&mut self) {
        self.readers += 1;
    }

    /// Track stream close.
    pub fn remove_reader(&mut self) {
        self.readers = self.readers.saturating_sub(1);
    }

    /// Track stream open/close.
    pub fn add_writer(&mut self) {
        self.writers += 1;
    }

    /// Track stream close.
    pub fn remove_writer(&mut self) {
        self.writers = self.writers.saturating_sub(1);
    }

    /// Whether any stream is still open.
    pub fn in_use(&self) -> bool {
        self.readers > 0 || self.writers > 0
    }

    /// Append a buffered segment (mode A); `buffer` is the queued
    /// `FileAppend` record whose content starts at the current length.
    pub fn append_buffered(&mut self, buffer: SharedBuffer, len: u64) {
        self.segments.push(Segment {
            buffer,
            file_offset: self.length,
            len,
        });
        self.length += len;
        self.buffered_write_volume += len;
    }

    /// Truncate the buffered view (mode A): trims the mapped prefix and the
    /// segment list; a segment straddling the cut keeps a shortened length
    /// into the same shared bytes.
    pub fn truncate_buffered(&mut self, new_length: u64) {
        if new_length >= self.length {
            return;
        }
        if new_length <= self.mapped_length {
            self.mapped_length = new_length;
            self.segments.clear();
        } else {
            self.segments.retain_mut(|seg| {
                if seg.file_offset >= new_length {
                    false
                } else {
                    if seg.file_offset + seg.len > new_length {
                        seg.len = new_length - seg.file_offset;
                    }
                    true
                }
            });
        }
        self.length = new_length;
    }

    /// Read up to `buf.len()` bytes at `offset`; returns bytes read, zero at
    /// or past end. `log_path_for` resolves a log index to its file path for
    /// segments whose bytes were dropped from memory.
    pub fn read_at(
        &mut self,
        log_path_for: &dyn Fn(u64) -> PathBuf,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= self.length || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((self.length - offset) as usize);

        if self.heavy {
            let channel = self.channel.as_mut().ok_or_else(|| TxError::SystemFailure {
                reason: "heavy view lost its channel".to_string(),
            })?;
            channel.seek(SeekFrom::Start(offset))?;
            let mut read = 0;
            while read < want {
                let n = channel.read(&mut buf[read..want])?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            return Ok(read);
        }

        let mut filled = 0usize;
        let mut pos = offset;
        // Unmodified physical prefix.
        if pos < self.mapped_length {
            let take = ((self.mapped_length - pos) as usize).min(want);
            let source = self.physical_source.as_ref().ok_or_else(|| {
                TxError::SystemFailure {
                    reason: "mapped prefix without a physical source".to_string(),
                }
            })?;
            let mut f = File::open(source)?;
            f.seek(SeekFrom::Start(pos))?;
            f.read_exact(&mut buf[..take])?;
            filled += take;
            pos += take as u64;
        }
        // Appended segments.
        while filled < want {
            let Some(seg) = self
                .segments
                .iter()
                .find(|s| s.file_offset <= pos && pos < s.file_offset + s.len)
            else {
                break;
            };
            let within = pos - seg.file_offset;
            let take = ((seg.len - within) as usize).min(want - filled);
            let content = {
                let b = seg.buffer.lock();
                let log_path = b
                    .on_disk_info()
                    .map(|i| log_path_for(i.log_index))
                    .unwrap_or_default();
                b.content_from(&log_path, within as u32)?
            };
            buf[filled..filled + take].copy_from_slice(&content[..take]);
            filled += take;
            pos += take as u64;
        }
        Ok(filled)
    }

    /// Read an exact range, failing short of `len` only at end of file.
    pub fn read_range(
        &mut self,
        log_path_for: &dyn Fn(u64) -> PathBuf,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        let n = self.read_at(log_path_for, offset, &mut out)?;
        out.truncate(n);
        Ok(out)
    }

    /// Detach onto a private physical channel at `target`.
    ///
    /// The caller has already decided in-place versus shadow and logged the
    /// records that make the choice recoverable. The physical prefix is
    /// copied when `target` differs from the source; buffered segments are
    /// flushed into the channel once; the channel ends at the virtual
    /// length.
    pub fn detach_to_channel(
        &mut self,
        log_path_for: &dyn Fn(u64) -> PathBuf,
        target: &Path,
        shadow: bool,
    ) -> Result<()> {
        if self.heavy {
            return Ok(());
        }
        if shadow {
            if let Some(source) = &self.physical_source {
                if source.is_file() && source.as_path() != target {
                    std::fs::copy(source, target)?;
                }
            }
        }
        let mut channel = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(target)?;
        channel.set_len(self.mapped_length)?;
        for seg in std::mem::take(&mut self.segments) {
            let content = {
                let b = seg.buffer.lock();
                let log_path = b
                    .on_disk_info()
                    .map(|i| log_path_for(i.log_index))
                    .unwrap_or_default();
                b.content_from(&log_path, 0)?
            };
            channel.seek(SeekFrom::Start(seg.file_offset))?;
            channel.write_all(&content[..seg.len as usize])?;
        }
        channel.set_len(self.length)?;
        self.heavy = true;
        self.using_shadow = shadow;
        self.heavy_target = Some(target.to_path_buf());
        self.channel = Some(channel);
        Ok(())
    }

    /// Append directly to the channel (mode B).
    pub fn heavy_append(&mut self, bytes: &[u8]) -> Result<u64> {
        let channel = self.channel.as_mut().ok_or_else(|| TxError::SystemFailure {
            reason: "heavy append without a channel".to_string(),
        })?;
        let offset = self.length;
        channel.seek(SeekFrom::Start(offset))?;
        channel.write_all(bytes)?;
        self.length += bytes.len() as u64;
        Ok(offset)
    }

    /// Truncate the channel (mode B).
    pub fn heavy_truncate(&mut self, new_length: u64) -> Result<()> {
        let channel = self.channel.as_mut().ok_or_else(|| TxError::SystemFailure {
            reason: "heavy truncate without a channel".to_string(),
        })?;
        channel.set_len(new_length)?;
        self.length = new_length;
        Ok(())
    }

    /// Flush the channel's data to disk.
    pub fn sync_channel(&mut self) -> Result<()> {
        if let Some(channel) = &mut self.channel {
            channel.flush()?;
            channel.sync_data()?;
        }
        Ok(())
    }

    /// Duplicate this buffered view's content description for a copy target
    /// (mode A only): the target shares the segments' bytes but owns its own
    /// list, so later truncation of either side leaves the other intact.
    pub fn clone_for_copy(&self, new_logical: PathBuf) -> VirtualViewFile {
        VirtualViewFile {
            logical_path: new_logical,
            physical_source: self.physical_source.clone(),
            mapped_length: self.mapped_length,
            segments: self.segments.clone(),
            length: self.length,
            heavy: false,
            heavy_target: None,
            using_shadow: false,
            channel: None,
            readers: 0,
            writers: 0,
            buffered_write_volume: 0,
        }
    }
}
