//! Transaction sessions.
//!
//! Every write-affecting operation follows one pattern: acquire the needed
//! locks under strict two-phase locking, permission-check against the
//! transaction's own overlay, mutate the overlay, append a redo log record,
//! and note a candidate change event. On failure within one call only that
//! call's newly acquired locks are released; everything else is held until
//! transaction end.
//!
//! A per-session mutex serializes every public call against asynchronous
//! forced rollback (deadlock victimization or timeout), so mutation and
//! forced rollback never interleave; once committing has begun, forced
//! rollback is refused.
//!
//! ## Commit sequence
//!
//! ```text
//! 1. flush heavy-write channels, force dirtied directory metadata
//! 2. force FilesAlreadyOnDisk + EventEnqueue markers
//! 3. force CommitBegins            (crash after this → recovery commits)
//! 4. replay the record chain against the physical filesystem, with
//!    checkpoint safeguards around dependent copy/move/modify sequences
//! 5. force CommitDone              (transaction fully durable)
//! ```

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use txfs_core::{Result, RollbackCause, TransactionId, TxError};
use txfs_concurrency::HeldLock;
use txfs_durability::writer::SharedBuffer;
use txfs_durability::{ChangeEvent, DurableDirSession, EventKind, LogRecord};

use crate::filesystem::EngineShared;
use crate::recovery::{apply_redo_chain, apply_undo_chain, ReplayEntry};
use crate::streams::{TxInputStream, TxOutputStream};
use crate::view::TransactionView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Prepared,
    Committing,
    Completed,
}

pub(crate) struct SessionInner {
    state: TxState,
    rolled_back: Option<RollbackCause>,
    view: TransactionView,
    locks: HashMap<PathBuf, HeldLock>,
    chain: Vec<SharedBuffer>,
    events: Vec<ChangeEvent>,
    uses_undo: bool,
    wrote_undo_marker: bool,
    // Force-written undo records, kept in memory for caller rollback;
    // recovery rebuilds the same list from the logs.
    undo_entries: Vec<ReplayEntry>,
    heavy_files: Vec<PathBuf>,
    shadow_files: Vec<PathBuf>,
    disk: DurableDirSession,
    lock_wait_timeout: Duration,
}

/// One transaction's handle onto the engine.
pub struct Session {
    shared: Arc<EngineShared>,
    xid: TransactionId,
    created_at: Instant,
    // Outside `inner` so the timeout detector can read it while an
    // operation is blocked holding the session mutex.
    timeout: Mutex<Option<Duration>>,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("xid", &self.xid)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(shared: Arc<EngineShared>, xid: TransactionId) -> Self {
        let disk = DurableDirSession::new(shared.config.sync_directory_changes);
        let lock_wait_timeout = shared.config.lock_wait_timeout;
        let transaction_timeout = shared.config.transaction_timeout;
        Session {
            shared,
            xid,
            created_at: Instant::now(),
            timeout: Mutex::new(transaction_timeout),
            inner: Mutex::new(SessionInner {
                state: TxState::Active,
                rolled_back: None,
                view: TransactionView::new(),
                locks: HashMap::new(),
                chain: Vec::new(),
                events: Vec::new(),
                uses_undo: false,
                wrote_undo_marker: false,
                undo_entries: Vec::new(),
                heavy_files: Vec::new(),
                shadow_files: Vec::new(),
                disk,
                lock_wait_timeout,
            }),
        }
    }

    /// This session's transaction id.
    pub fn xid(&self) -> &TransactionId {
        &self.xid
    }

    /// When the transaction began.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Currently configured transaction lifetime.
    pub fn transaction_timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    /// Override the transaction lifetime for this session.
    pub fn set_transaction_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock() = timeout;
    }

    /// Currently configured lock wait timeout.
    pub fn lock_wait_timeout(&self) -> Duration {
        self.inner.lock().lock_wait_timeout
    }

    /// Override the lock wait timeout for this session.
    pub fn set_lock_wait_timeout(&self, timeout: Duration) {
        self.inner.lock().lock_wait_timeout = timeout;
    }

    fn guard(&self) -> Result<parking_lot::MutexGuard<'_, SessionInner>> {
        self.shared.check_operational()?;
        let inner = self.inner.lock();
        if let Some(cause) = inner.rolled_back {
            return Err(TxError::TransactionRolledBack { cause });
        }
        if inner.state != TxState::Active {
            return Err(TxError::NoTransactionAssociated);
        }
        Ok(inner)
    }

    // Acquire one lock for the current operation, skipping locks this
    // transaction already holds with sufficient strength. A forced-rollback
    // interrupt rolls the whole transaction back before the error returns.
    fn op_acquire(
        &self,
        inner: &mut SessionInner,
        new_locks: &mut Vec<HeldLock>,
        path: &Path,
        exclusive: bool,
    ) -> Result<()> {
        if let Some(held) = inner.locks.get(path) {
            if held.exclusive || !exclusive {
                return Ok(());
            }
        }
        if new_locks.iter().any(|h| h.path == path && (h.exclusive || !exclusive)) {
            return Ok(());
        }
        match self
            .shared
            .concurrency
            .acquire(&self.xid, path, exclusive, inner.lock_wait_timeout)
        {
            Ok(held) => {
                new_locks.push(held);
                Ok(())
            }
            Err(TxError::TransactionRolledBack { cause }) => {
                for held in new_locks.drain(..) {
                    self.shared.concurrency.undo_acquisition(&self.xid, &held);
                }
                self.rollback_internal(inner, Some(cause));
                Err(TxError::TransactionRolledBack { cause })
            }
            Err(e) => Err(e),
        }
    }

    // Keep or release this operation's new locks depending on its outcome.
    fn finish_op<T>(
        &self,
        inner: &mut SessionInner,
        new_locks: Vec<HeldLock>,
        result: Result<T>,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                for held in new_locks {
                    inner.locks.insert(held.path.clone(), held);
                }
                Ok(value)
            }
            Err(e) => {
                // Only this call's acquisitions go back; an in-place upgrade
                // reverts to the shared hold an earlier operation took.
                for held in new_locks {
                    self.shared.concurrency.undo_acquisition(&self.xid, &held);
                }
                Err(e)
            }
        }
    }

    fn submit_record(
        &self,
        inner: &mut SessionInner,
        record: &LogRecord,
        content: &[u8],
    ) -> Result<()> {
        let buffer = self.shared.writer.submit(&self.xid, record, content)?;
        inner.chain.push(buffer);
        Ok(())
    }

    fn note_event(&self, inner: &mut SessionInner, path: &Path, kind: EventKind) {
        inner.events.push(ChangeEvent {
            path: path.to_path_buf(),
            kind,
        });
    }

    // ---------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------

    /// Create an empty file at `path`.
    pub fn create_file(&self, path: &Path) -> Result<()> {
        self.create_entry(path, false)
    }

    /// Create a directory at `path`.
    pub fn create_directory(&self, path: &Path) -> Result<()> {
        self.create_entry(path, true)
    }

    fn create_entry(&self, path: &Path, directory: bool) -> Result<()> {
        let mut inner = self.guard()?;
        let parent = match path.parent() {
            Some(p) => p.to_path_buf(),
            None => {
                return Err(TxError::FileAlreadyExists {
                    path: path.to_path_buf(),
                })
            }
        };
        let mut new_locks = Vec::new();
        self.op_acquire(&mut inner, &mut new_locks, &parent, true)?;
        self.op_acquire(&mut inner, &mut new_locks, path, true)?;

        let result = (|| {
            if !inner.view.dir_exists(&parent)? {
                return Err(TxError::FileNotExists { path: parent.clone() });
            }
            if inner.view.file_exists(path)? || inner.view.dir_exists(path)? {
                return Err(TxError::FileAlreadyExists {
                    path: path.to_path_buf(),
                });
            }
            inner.view.dir_view(&parent).check_writable()?;
            if directory {
                inner.view.record_dir_created(path)?;
                self.submit_record(
                    &mut inner,
                    &LogRecord::DirCreate {
                        xid: self.xid.clone(),
                        path: path.to_path_buf(),
                    },
                    &[],
                )?;
            } else {
                inner.view.record_file_created(path)?;
                self.submit_record(
                    &mut inner,
                    &LogRecord::FileCreate {
                        xid: self.xid.clone(),
                        path: path.to_path_buf(),
                    },
                    &[],
                )?;
            }
            self.note_event(&mut inner, path, EventKind::Created);
            Ok(())
        })();
        self.finish_op(&mut inner, new_locks, result)
    }

    /// Delete the file or empty directory at `path`.
    pub fn delete_file(&self, path: &Path) -> Result<()> {
        let mut inner = self.guard()?;
        let parent = match path.parent() {
            Some(p) => p.to_path_buf(),
            None => {
                return Err(TxError::InsufficientPermission {
                    path: path.to_path_buf(),
                    needed: "a parent directory",
                })
            }
        };
        let mut new_locks = Vec::new();
        self.op_acquire(&mut inner, &mut new_locks, &parent, true)?;
        self.op_acquire(&mut inner, &mut new_locks, path, true)?;

        let result = (|| {
            if inner.view.dir_exists(path)? {
                if !inner.view.dir_view(path).is_empty()? {
                    return Err(TxError::DirectoryNotEmpty {
                        path: path.to_path_buf(),
                    });
                }
                inner.view.record_dir_deleted(path)?;
            } else if inner.view.file_exists(path)? {
                if inner.view.file_in_use(path) {
                    return Err(TxError::FileUnderUse {
                        path: path.to_path_buf(),
                    });
                }
                inner.view.record_file_deleted(path)?;
            } else {
                return Err(TxError::FileNotExists {
                    path: path.to_path_buf(),
                });
            }
            self.submit_record(
                &mut inner,
                &LogRecord::FileDelete {
                    xid: self.xid.clone(),
                    path: path.to_path_buf(),
                },
                &[],
            )?;
            self.note_event(&mut inner, path, EventKind::Deleted);
            Ok(())
        })();
        self.finish_op(&mut inner, new_locks, result)
    }

    /// Move a file or directory from `src` to `dst`.
    ///
    /// Directory moves pin the whole source subtree for the rest of the
    /// transaction, making the rename atomic with respect to concurrent
    /// lock acquisition beneath it.
    pub fn move_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut inner = self.guard()?;
        let (src_parent, dst_parent) = match (src.parent(), dst.parent()) {
            (Some(a), Some(b)) => (a.to_path_buf(), b.to_path_buf()),
            _ => {
                return Err(TxError::InsufficientPermission {
                    path: src.to_path_buf(),
                    needed: "a parent directory",
                })
            }
        };
        let mut new_locks = Vec::new();
        self.op_acquire(&mut inner, &mut new_locks, &src_parent, true)?;
        self.op_acquire(&mut inner, &mut new_locks, &dst_parent, true)?;
        self.op_acquire(&mut inner, &mut new_locks, src, true)?;
        self.op_acquire(&mut inner, &mut new_locks, dst, true)?;

        let result = (|| {
            if inner.view.file_exists(dst)? || inner.view.dir_exists(dst)? {
                return Err(TxError::FileAlreadyExists {
                    path: dst.to_path_buf(),
                });
            }
            if !inner.view.dir_exists(&dst_parent)? {
                return Err(TxError::FileNotExists { path: dst_parent.clone() });
            }
            if inner.view.dir_exists(src)? {
                self.shared.concurrency.pin_directory_for_rename(&self.xid, src)?;
                inner.view.record_dir_moved(src, dst)?;
            } else if inner.view.file_exists(src)? {
                if inner.view.file_in_use(src) {
                    return Err(TxError::FileUnderUse {
                        path: src.to_path_buf(),
                    });
                }
                inner.view.record_file_moved(src, dst)?;
            } else {
                return Err(TxError::FileNotExists {
                    path: src.to_path_buf(),
                });
            }
            self.submit_record(
                &mut inner,
                &LogRecord::FileMove {
                    xid: self.xid.clone(),
                    src: src.to_path_buf(),
                    dst: dst.to_path_buf(),
                },
                &[],
            )?;
            self.note_event(&mut inner, src, EventKind::Deleted);
            self.note_event(&mut inner, dst, EventKind::Created);
            Ok(())
        })();
        self.finish_op(&mut inner, new_locks, result)
    }

    /// Copy the file at `src` to a new file at `dst`.
    pub fn copy_file(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut inner = self.guard()?;
        let dst_parent = match dst.parent() {
            Some(p) => p.to_path_buf(),
            None => {
                return Err(TxError::InsufficientPermission {
                    path: dst.to_path_buf(),
                    needed: "a parent directory",
                })
            }
        };
        let mut new_locks = Vec::new();
        self.op_acquire(&mut inner, &mut new_locks, src, false)?;
        self.op_acquire(&mut inner, &mut new_locks, &dst_parent, true)?;
        self.op_acquire(&mut inner, &mut new_locks, dst, true)?;

        let result = (|| {
            if !inner.view.file_exists(src)? {
                return Err(TxError::FileNotExists {
                    path: src.to_path_buf(),
                });
            }
            if inner.view.file_exists(dst)? || inner.view.dir_exists(dst)? {
                return Err(TxError::FileAlreadyExists {
                    path: dst.to_path_buf(),
                });
            }
            if !inner.view.dir_exists(&dst_parent)? {
                return Err(TxError::FileNotExists { path: dst_parent.clone() });
            }
            inner.view.dir_view(&dst_parent).check_writable()?;

            let src_handle = inner.view.file_view(src)?;
            let heavy = src_handle.lock().is_heavy();
            if heavy {
                // Duplicate the already-physical content into a shadow and
                // log its promotion to the destination.
                let shadow = self.shared.next_shadow_path()?;
                {
                    let mut vvf = src_handle.lock();
                    vvf.sync_channel()?;
                    let target = vvf.heavy_target().map(|p| p.to_path_buf());
                    if let Some(target) = target {
                        std::fs::copy(&target, &shadow)?;
                    }
                }
                inner.shadow_files.push(shadow.clone());
                inner.disk.track_directory(&self.shared.config.backup_dir());
                let (parent, name) = (dst_parent.clone(), dst.file_name());
                if let Some(name) = name {
                    inner
                        .view
                        .dir_view(&parent)
                        .record_file_created(name, Some(shadow.clone()));
                }
                // The destination is not marked already-on-disk: its content
                // arrives at commit through this promotion record, and any
                // buffered append or truncate after the copy must replay on
                // top of it.
                self.submit_record(
                    &mut inner,
                    &LogRecord::FileSpecialMove {
                        xid: self.xid.clone(),
                        src: shadow,
                        dst: dst.to_path_buf(),
                    },
                    &[],
                )?;
            } else {
                let copy_view = src_handle.lock().clone_for_copy(dst.to_path_buf());
                let src_physical = inner.view.physical_location(src);
                let (parent, name) = (dst_parent.clone(), dst.file_name());
                if let Some(name) = name {
                    inner
                        .view
                        .dir_view(&parent)
                        .record_file_created(name, src_physical);
                }
                inner.view.install_file_view(dst, copy_view);
                self.submit_record(
                    &mut inner,
                    &LogRecord::FileCopy {
                        xid: self.xid.clone(),
                        src: src.to_path_buf(),
                        dst: dst.to_path_buf(),
                    },
                    &[],
                )?;
            }
            self.note_event(&mut inner, dst, EventKind::Created);
            Ok(())
        })();
        self.finish_op(&mut inner, new_locks, result)
    }

    /// Truncate the file at `path` to `new_length` bytes.
    pub fn truncate_file(&self, path: &Path, new_length: u64) -> Result<()> {
        let mut inner = self.guard()?;
        let mut new_locks = Vec::new();
        self.op_acquire(&mut inner, &mut new_locks, path, true)?;

        let result = (|| {
            if !inner.view.file_exists(path)? {
                return Err(TxError::FileNotExists {
                    path: path.to_path_buf(),
                });
            }
            let handle = inner.view.file_view(path)?;
            let current = handle.lock().length();
            if new_length > current {
                return Err(TxError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "truncation cannot grow a file",
                )));
            }
            let heavy = handle.lock().is_heavy();
            if heavy {
                let shadowed = handle.lock().is_using_shadow();
                if !shadowed {
                    // Save the bytes about to vanish before touching the
                    // real file; rollback re-writes them in reverse order.
                    let saved = {
                        let mut vvf = handle.lock();
                        let shared = self.shared.clone();
                        vvf.read_range(
                            &move |i| shared.log_path(i),
                            new_length,
                            (current - new_length) as usize,
                        )?
                    };
                    self.write_undo_marker_if_needed(&mut inner)?;
                    let target = handle
                        .lock()
                        .heavy_target()
                        .map(|p| p.to_path_buf())
                        .unwrap_or_else(|| path.to_path_buf());
                    let record = LogRecord::UndoFileTruncate {
                        xid: self.xid.clone(),
                        path: target,
                        offset: new_length,
                        length: saved.len() as u64,
                    };
                    self.shared.writer.force_write(&record, &saved)?;
                    inner.undo_entries.push(ReplayEntry {
                        record,
                        content: Some(saved),
                    });
                    inner.uses_undo = true;
                }
                handle.lock().heavy_truncate(new_length)?;
            } else {
                handle.lock().truncate_buffered(new_length);
            }
            self.submit_record(
                &mut inner,
                &LogRecord::FileTruncate {
                    xid: self.xid.clone(),
                    path: path.to_path_buf(),
                    new_length,
                },
                &[],
            )?;
            self.note_event(&mut inner, path, EventKind::Modified);
            Ok(())
        })();
        self.finish_op(&mut inner, new_locks, result)
    }

    /// Open an append-only output stream over the file at `path`.
    ///
    /// With `heavy_write` set the view is detached onto a private physical
    /// channel immediately; otherwise writes are buffered as redo segments
    /// until the configured volume threshold forces the switch.
    pub fn open_output_stream(
        self: &Arc<Self>,
        path: &Path,
        heavy_write: bool,
    ) -> Result<TxOutputStream> {
        let mut inner = self.guard()?;
        let mut new_locks = Vec::new();
        self.op_acquire(&mut inner, &mut new_locks, path, true)?;

        let result = (|| {
            if !inner.view.file_exists(path)? {
                return Err(TxError::FileNotExists {
                    path: path.to_path_buf(),
                });
            }
            let handle = inner.view.file_view(path)?;
            if heavy_write && !handle.lock().is_heavy() {
                self.switch_to_heavy(&mut inner, path)?;
            }
            handle.lock().add_writer();
            Ok(())
        })();
        self.finish_op(&mut inner, new_locks, result)?;
        Ok(TxOutputStream::new(Arc::clone(self), path.to_path_buf()))
    }

    /// Open an input stream over the file at `path`.
    pub fn open_input_stream(self: &Arc<Self>, path: &Path) -> Result<TxInputStream> {
        let mut inner = self.guard()?;
        let mut new_locks = Vec::new();
        self.op_acquire(&mut inner, &mut new_locks, path, false)?;

        let result = (|| {
            if !inner.view.file_exists(path)? {
                return Err(TxError::FileNotExists {
                    path: path.to_path_buf(),
                });
            }
            let handle = inner.view.file_view(path)?;
            handle.lock().add_reader();
            Ok(())
        })();
        self.finish_op(&mut inner, new_locks, result)?;
        Ok(TxInputStream::new(Arc::clone(self), path.to_path_buf()))
    }

    /// Does `path` exist (as file or directory) in this transaction's view?
    pub fn file_exists(&self, path: &Path) -> Result<bool> {
        let mut inner = self.guard()?;
        let mut new_locks = Vec::new();
        self.op_acquire(&mut inner, &mut new_locks, path, false)?;
        let result =
            (|| Ok(inner.view.file_exists(path)? || inner.view.dir_exists(path)?))();
        self.finish_op(&mut inner, new_locks, result)
    }

    /// Does `path` exist as a directory in this transaction's view?
    pub fn file_exists_and_is_directory(&self, path: &Path) -> Result<bool> {
        let mut inner = self.guard()?;
        let mut new_locks = Vec::new();
        self.op_acquire(&mut inner, &mut new_locks, path, false)?;
        let result = (|| inner.view.dir_exists(path))();
        self.finish_op(&mut inner, new_locks, result)
    }

    /// Visible children of the directory at `path`, sorted by name.
    pub fn list_files(&self, path: &Path) -> Result<Vec<std::ffi::OsString>> {
        let mut inner = self.guard()?;
        let mut new_locks = Vec::new();
        self.op_acquire(&mut inner, &mut new_locks, path, false)?;
        let result = (|| {
            if !inner.view.dir_exists(path)? {
                return Err(TxError::FileNotExists {
                    path: path.to_path_buf(),
                });
            }
            inner.view.list_dir(path)
        })();
        self.finish_op(&mut inner, new_locks, result)
    }

    /// Length of the file at `path` in this transaction's view.
    pub fn get_file_length(&self, path: &Path) -> Result<u64> {
        let mut inner = self.guard()?;
        let mut new_locks = Vec::new();
        self.op_acquire(&mut inner, &mut new_locks, path, false)?;
        let result = (|| {
            if !inner.view.file_exists(path)? {
                return Err(TxError::FileNotExists {
                    path: path.to_path_buf(),
                });
            }
            let handle = inner.view.file_view(path)?;
            let len = handle.lock().length();
            Ok(len)
        })();
        self.finish_op(&mut inner, new_locks, result)
    }

    // ---------------------------------------------------------------
    // Stream backends
    // ---------------------------------------------------------------

    pub(crate) fn stream_write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut inner = self.guard()?;
        let handle = inner
            .view
            .cached_file_view(path)
            .ok_or_else(|| TxError::FileNotExists {
                path: path.to_path_buf(),
            })?;
        let heavy = handle.lock().is_heavy();
        if heavy {
            handle.lock().heavy_append(bytes)?;
        } else {
            let offset = handle.lock().length();
            let record = LogRecord::FileAppend {
                xid: self.xid.clone(),
                path: path.to_path_buf(),
                offset,
                length: bytes.len() as u64,
            };
            let buffer = self.shared.writer.submit(&self.xid, &record, bytes)?;
            inner.chain.push(Arc::clone(&buffer));
            handle.lock().append_buffered(buffer, bytes.len() as u64);
            let volume = handle.lock().buffered_write_volume();
            if volume > self.shared.config.heavy_write_threshold {
                self.switch_to_heavy(&mut inner, path)?;
            }
        }
        self.note_event(&mut inner, path, EventKind::Modified);
        Ok(())
    }

    pub(crate) fn stream_read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.guard()?;
        let handle = inner
            .view
            .cached_file_view(path)
            .ok_or_else(|| TxError::FileNotExists {
                path: path.to_path_buf(),
            })?;
        drop(inner);
        let shared = self.shared.clone();
        let n = handle
            .lock()
            .read_at(&move |i| shared.log_path(i), offset, buf)?;
        Ok(n)
    }

    pub(crate) fn stream_closed(&self, path: &Path, was_writer: bool) {
        let inner = self.inner.lock();
        if let Some(handle) = inner.view.cached_file_view(path) {
            let mut vvf = handle.lock();
            if was_writer {
                vvf.remove_writer();
            } else {
                vvf.remove_reader();
            }
        }
    }

    // ---------------------------------------------------------------
    // Heavy-write switch
    // ---------------------------------------------------------------

    fn write_undo_marker_if_needed(&self, inner: &mut SessionInner) -> Result<()> {
        if inner.wrote_undo_marker {
            return Ok(());
        }
        self.shared
            .writer
            .force_write(&LogRecord::UsesUndoLogs { xid: self.xid.clone() }, &[])?;
        inner.wrote_undo_marker = true;
        Ok(())
    }

    // Detach `path`'s view onto a private channel. In place when the file
    // physically exists and nobody is reading it through this transaction,
    // under undo-record protection; otherwise onto a backup-tree shadow
    // whose promotion to the real location is logged as a redo record.
    fn switch_to_heavy(&self, inner: &mut SessionInner, path: &Path) -> Result<()> {
        let handle = inner.view.file_view(path)?;
        if handle.lock().is_heavy() {
            return Ok(());
        }
        let physical = inner
            .view
            .physical_location(path)
            .filter(|p| p.is_file());
        let reading = handle.lock().reader_count() > 0;
        let shared = self.shared.clone();
        let log_path_for = move |i| shared.log_path(i);

        match physical {
            Some(physical) if !reading => {
                let physical_len = std::fs::metadata(&physical)?.len();
                let mapped_visible = handle.lock().length().min(physical_len);
                self.write_undo_marker_if_needed(inner)?;
                // If the buffered view already shrank below the physical
                // length, save the bytes the detach is about to cut off.
                if mapped_visible < physical_len {
                    let mut saved = vec![0u8; (physical_len - mapped_visible) as usize];
                    use std::io::{Read, Seek, SeekFrom};
                    let mut f = std::fs::File::open(&physical)?;
                    f.seek(SeekFrom::Start(mapped_visible))?;
                    f.read_exact(&mut saved)?;
                    let record = LogRecord::UndoFileTruncate {
                        xid: self.xid.clone(),
                        path: physical.clone(),
                        offset: mapped_visible,
                        length: saved.len() as u64,
                    };
                    self.shared.writer.force_write(&record, &saved)?;
                    inner.undo_entries.push(ReplayEntry {
                        record,
                        content: Some(saved),
                    });
                }
                let record = LogRecord::UndoFileAppend {
                    xid: self.xid.clone(),
                    path: physical.clone(),
                    prior_length: physical_len,
                };
                self.shared.writer.force_write(&record, &[])?;
                inner.undo_entries.push(ReplayEntry {
                    record,
                    content: None,
                });
                inner.uses_undo = true;
                handle
                    .lock()
                    .detach_to_channel(&log_path_for, &physical, false)?;
                if !inner.heavy_files.contains(&path.to_path_buf()) {
                    inner.heavy_files.push(path.to_path_buf());
                }
                debug!(xid = %self.xid, path = %path.display(), "switched to in-place heavy write");
            }
            _ => {
                let shadow = self.shared.next_shadow_path()?;
                handle
                    .lock()
                    .detach_to_channel(&log_path_for, &shadow, true)?;
                inner.disk.track_directory(&self.shared.config.backup_dir());
                inner.shadow_files.push(shadow.clone());
                if !inner.heavy_files.contains(&path.to_path_buf()) {
                    inner.heavy_files.push(path.to_path_buf());
                }
                self.submit_record(
                    inner,
                    &LogRecord::FileSpecialMove {
                        xid: self.xid.clone(),
                        src: shadow,
                        dst: path.to_path_buf(),
                    },
                    &[],
                )?;
                debug!(xid = %self.xid, path = %path.display(), "switched to shadow heavy write");
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// First phase of two-phase commit: flush and fsync everything, then
    /// durably mark the transaction prepared. An engine crash afterwards
    /// leaves it in doubt for the coordinator.
    pub fn prepare(&self) -> Result<()> {
        let mut inner = self.guard()?;
        self.sync_heavy_channels(&inner)?;
        self.shared.writer.flush_and_sync()?;
        self.shared
            .writer
            .force_write(&LogRecord::PrepareDone { xid: self.xid.clone() }, &[])?;
        inner.state = TxState::Prepared;
        debug!(xid = %self.xid, "prepared");
        Ok(())
    }

    /// Commit the transaction. `one_phase` commits directly from the active
    /// state; otherwise the session must have prepared first.
    pub fn commit(&self, one_phase: bool) -> Result<()> {
        self.shared.check_operational()?;
        let mut inner = self.inner.lock();
        if let Some(cause) = inner.rolled_back {
            return Err(TxError::TransactionRolledBack { cause });
        }
        match (inner.state, one_phase) {
            (TxState::Active, true) | (TxState::Prepared, false) => {}
            _ => return Err(TxError::NoTransactionAssociated),
        }
        inner.state = TxState::Committing;

        // A transaction that never wrote takes the shortcut out.
        if inner.chain.is_empty() && !inner.uses_undo && inner.heavy_files.is_empty() {
            self.cleanup(&mut inner);
            debug!(xid = %self.xid, "read-only commit");
            return Ok(());
        }

        let outcome = self.commit_locked(&mut inner);
        match outcome {
            Ok(()) => {
                self.cleanup(&mut inner);
                info!(xid = %self.xid, "committed");
                Ok(())
            }
            Err(e) => {
                let failure = e.into_system_failure();
                self.shared.notify_failure(&failure.to_string());
                Err(failure)
            }
        }
    }

    fn sync_heavy_channels(&self, inner: &SessionInner) -> Result<()> {
        for handle in inner.view.all_file_views() {
            let mut vvf = handle.lock();
            if vvf.is_heavy() {
                vvf.sync_channel()?;
            }
        }
        Ok(())
    }

    fn commit_locked(&self, inner: &mut SessionInner) -> Result<()> {
        self.sync_heavy_channels(inner)?;
        inner.disk.force_to_disk().map_err(TxError::Io)?;

        if !inner.heavy_files.is_empty() {
            self.shared.writer.force_write(
                &LogRecord::FilesAlreadyOnDisk {
                    xid: self.xid.clone(),
                    paths: inner.heavy_files.clone(),
                },
                &[],
            )?;
        }
        if !inner.events.is_empty() {
            let mut seen = HashSet::new();
            let events: Vec<ChangeEvent> = inner
                .events
                .iter()
                .filter(|e| seen.insert((e.path.clone(), e.kind)))
                .cloned()
                .collect();
            self.shared.writer.force_write(
                &LogRecord::EventEnqueue {
                    xid: self.xid.clone(),
                    events,
                },
                &[],
            )?;
        }
        self.shared
            .writer
            .force_write(&LogRecord::CommitBegins { xid: self.xid.clone() }, &[])?;

        let entries = self.chain_entries(inner)?;
        let skip: HashSet<PathBuf> = inner.heavy_files.iter().cloned().collect();
        apply_redo_chain(
            &self.shared,
            &mut inner.disk,
            &self.xid,
            &entries,
            &skip,
            0,
        )?;

        inner.disk.force_to_disk().map_err(TxError::Io)?;
        self.shared
            .writer
            .force_write(&LogRecord::CommitDone { xid: self.xid.clone() }, &[])?;
        Ok(())
    }

    // Decode this transaction's position chain back into replayable records.
    fn chain_entries(&self, inner: &SessionInner) -> Result<Vec<ReplayEntry>> {
        let mut entries = Vec::with_capacity(inner.chain.len());
        for shared_buf in &inner.chain {
            let buffer = shared_buf.lock();
            let record = match buffer.bytes() {
                Some(bytes) => LogRecord::decode(bytes, 0, 0)?.0,
                None => {
                    let info = buffer.on_disk_info().ok_or_else(|| TxError::SystemFailure {
                        reason: "chain buffer has neither bytes nor location".to_string(),
                    })?;
                    txfs_durability::RecordReader::read_at(
                        &self.shared.log_path(info.log_index),
                        info.log_index,
                        info.offset,
                    )?
                    .record
                }
            };
            let content = if record.content_len() > 0 {
                let info = buffer.on_disk_info();
                let log_path = info
                    .map(|i| self.shared.log_path(i.log_index))
                    .unwrap_or_default();
                Some(buffer.content_from(&log_path, 0)?)
            } else {
                None
            };
            entries.push(ReplayEntry { record, content });
        }
        Ok(entries)
    }

    /// Roll the transaction back, discarding every buffered change and
    /// physically undoing heavy writes.
    pub fn rollback(&self) -> Result<()> {
        self.shared.check_operational()?;
        let mut inner = self.inner.lock();
        if let Some(cause) = inner.rolled_back {
            return Err(TxError::TransactionRolledBack { cause });
        }
        match inner.state {
            TxState::Active | TxState::Prepared => {}
            _ => return Err(TxError::NoTransactionAssociated),
        }
        self.rollback_internal(&mut inner, None);
        Ok(())
    }

    // Shared by caller rollback and forced rollback. Never leaves locks or
    // pins behind; failures while undoing poison the engine.
    fn rollback_internal(&self, inner: &mut SessionInner, cause: Option<RollbackCause>) {
        let had_log_traffic =
            !inner.chain.is_empty() || inner.uses_undo || !inner.heavy_files.is_empty();

        let result = (|| -> Result<()> {
            if inner.uses_undo {
                let undo = std::mem::take(&mut inner.undo_entries);
                apply_undo_chain(&undo)?;
            }
            for shadow in std::mem::take(&mut inner.shadow_files) {
                if shadow.exists() {
                    std::fs::remove_file(&shadow)?;
                }
            }
            if had_log_traffic {
                self.shared
                    .writer
                    .force_write(&LogRecord::RollbackDone { xid: self.xid.clone() }, &[])?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            warn!(xid = %self.xid, error = %e, "rollback failed, poisoning engine");
            self.shared.notify_failure(&e.to_string());
        }
        inner.rolled_back = cause;
        self.cleanup(inner);
        match cause {
            Some(cause) => info!(xid = %self.xid, %cause, "rolled back (forced)"),
            None => debug!(xid = %self.xid, "rolled back"),
        }
    }

    // Forced rollback from the timeout detector. Refused once committing
    // has begun; a session blocked mid-operation is handled through the
    // lock-wait interrupt instead.
    pub(crate) fn try_force_rollback(&self, cause: RollbackCause) -> bool {
        let Some(mut inner) = self.inner.try_lock() else {
            return false;
        };
        if inner.state != TxState::Active || inner.rolled_back.is_some() {
            return false;
        }
        self.rollback_internal(&mut inner, Some(cause));
        true
    }

    fn cleanup(&self, inner: &mut SessionInner) {
        for (_, held) in inner.locks.drain() {
            self.shared.concurrency.release(&self.xid, &held);
        }
        self.shared.concurrency.forget_transaction(&self.xid);
        if let Err(e) = self.shared.writer.release_transaction(&self.xid) {
            warn!(xid = %self.xid, error = %e, "log release failed");
        }
        inner.chain.clear();
        inner.events.clear();
        inner.state = TxState::Completed;
        self.shared.sessions.remove(&self.xid);
    }
}
