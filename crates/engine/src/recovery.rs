//! Crash recovery and commit replay.
//!
//! The redo replay here serves two callers: a live commit replaying its own
//! record chain, and boot-time recovery completing transactions the crash
//! interrupted. Both walk the same entry list with the same checkpoint
//! safeguards, so an interrupted commit resumed after a crash takes the
//! exact path the uninterrupted commit would have taken.
//!
//! Recovery scans every retained log file once, classifies each transaction
//! by its control records, then completes the unfinished ones:
//!
//! - `CommitDone`/`RollbackDone` seen: already resolved, nothing to do
//! - `CommitBegins` without `CommitDone`: replay the redo chain from the
//!   last checkpoint and force `CommitDone`
//! - `PrepareDone` without `CommitBegins`: in doubt; held for the
//!   coordinator's verdict, blocking bootup completion
//! - `UsesUndoLogs` without any outcome: physically mutated in place; apply
//!   the undo records in reverse and force `RollbackDone`
//! - redo records only: never reached a durability point, discarded

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use txfs_core::{Result, TransactionId};
use txfs_durability::{
    find_latest_log_index, ChangeEvent, DurableDirSession, LogRecord, RecordReader,
};

use crate::filesystem::EngineShared;

/// One replayable record plus its content bytes, if any.
#[derive(Debug, Clone)]
pub(crate) struct ReplayEntry {
    pub record: LogRecord,
    pub content: Option<Vec<u8>>,
}

/// A prepared transaction awaiting its coordinator's verdict.
#[derive(Debug)]
pub(crate) struct InDoubtTransaction {
    pub entries: Vec<ReplayEntry>,
    pub undo_entries: Vec<ReplayEntry>,
    pub files_on_disk: HashSet<PathBuf>,
    pub events: Vec<ChangeEvent>,
    pub checkpoint: Option<u64>,
    pub logs: HashSet<u64>,
}

/// What boot-time recovery found and did.
#[derive(Debug, Default)]
pub(crate) struct RecoveryReport {
    pub committed: Vec<TransactionId>,
    pub rolled_back: Vec<TransactionId>,
    pub in_doubt: Vec<TransactionId>,
}

// Per-transaction accumulator for the log scan.
#[derive(Debug, Default)]
struct ScannedTransaction {
    entries: Vec<ReplayEntry>,
    undo_entries: Vec<ReplayEntry>,
    files_on_disk: HashSet<PathBuf>,
    events: Vec<ChangeEvent>,
    dequeued: Vec<ChangeEvent>,
    checkpoint: Option<u64>,
    prepared: bool,
    commit_begun: bool,
    committed: bool,
    rolled_back: bool,
    uses_undo: bool,
    logs: HashSet<u64>,
}

fn read_content(log_path: &Path, offset: u64, header_len: u32, len: u64) -> Result<Vec<u8>> {
    let mut file = File::open(log_path)?;
    file.seek(SeekFrom::Start(offset + header_len as u64))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

// ---------------------------------------------------------------------
// Redo replay with checkpoint safeguards
// ---------------------------------------------------------------------

// Path whose content an entry would modify in place.
fn modified_path(record: &LogRecord) -> Option<&Path> {
    match record {
        LogRecord::FileAppend { path, .. }
        | LogRecord::FileTruncate { path, .. }
        | LogRecord::FileDelete { path, .. } => Some(path),
        _ => None,
    }
}

// Path an entry would bring into existence.
fn created_path(record: &LogRecord) -> Option<&Path> {
    match record {
        LogRecord::FileCreate { path, .. } | LogRecord::DirCreate { path, .. } => Some(path),
        LogRecord::FileMove { dst, .. }
        | LogRecord::FileCopy { dst, .. }
        | LogRecord::FileSpecialMove { dst, .. } => Some(dst),
        _ => None,
    }
}

/// Apply a transaction's redo chain to the physical filesystem, starting at
/// entry `start_at`. Append and truncate records for paths in `skip` are
/// passed over; their content already reached the disk through a
/// heavy-write channel.
///
/// Before an entry that would overwrite the source of an earlier copy, or
/// create the source or destination of an earlier move, the progress so far
/// is forced to disk and a `Checkpoint` record is written; a crash mid-replay
/// then resumes from the checkpoint without re-running operations whose
/// inputs the later entries have destroyed. Directory moves are bracketed by
/// checkpoints on both sides.
pub(crate) fn apply_redo_chain(
    shared: &EngineShared,
    disk: &mut DurableDirSession,
    xid: &TransactionId,
    entries: &[ReplayEntry],
    skip: &HashSet<PathBuf>,
    start_at: usize,
) -> Result<()> {
    let mut recent_copy_sources: HashSet<PathBuf> = HashSet::new();
    let mut recent_move_paths: HashSet<PathBuf> = HashSet::new();

    let checkpoint = |disk: &mut DurableDirSession,
                          position: usize,
                          copies: &mut HashSet<PathBuf>,
                          moves: &mut HashSet<PathBuf>|
     -> Result<()> {
        disk.force_to_disk()?;
        shared.writer.force_write(
            &LogRecord::Checkpoint {
                xid: xid.clone(),
                position: position as u64,
            },
            &[],
        )?;
        copies.clear();
        moves.clear();
        Ok(())
    };

    for (i, entry) in entries.iter().enumerate().skip(start_at) {
        if !entry.record.is_redo() {
            continue;
        }
        // Content records of heavy-write files already reached the disk
        // through the channel; structural records (create, delete, move,
        // promotion) still apply.
        let skipped = matches!(
            &entry.record,
            LogRecord::FileAppend { path, .. } | LogRecord::FileTruncate { path, .. }
                if skip.contains(path)
        );
        if skipped {
            continue;
        }

        let needs_checkpoint = modified_path(&entry.record)
            .map(|p| recent_copy_sources.contains(p))
            .unwrap_or(false)
            || created_path(&entry.record)
                .map(|p| recent_move_paths.contains(p))
                .unwrap_or(false);
        let dir_move = matches!(&entry.record, LogRecord::FileMove { src, .. } if src.is_dir());
        if needs_checkpoint || dir_move {
            checkpoint(disk, i, &mut recent_copy_sources, &mut recent_move_paths)?;
        }

        apply_one(disk, entry)?;

        match &entry.record {
            LogRecord::FileCopy { src, .. } => {
                recent_copy_sources.insert(src.clone());
            }
            LogRecord::FileMove { src, dst, .. } => {
                recent_move_paths.insert(src.clone());
                recent_move_paths.insert(dst.clone());
                if dir_move {
                    checkpoint(disk, i + 1, &mut recent_copy_sources, &mut recent_move_paths)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// Apply one redo entry. Each arm tolerates the state a re-run after a crash
// leaves behind: missing sources mean the entry already took effect.
fn apply_one(disk: &mut DurableDirSession, entry: &ReplayEntry) -> Result<()> {
    match &entry.record {
        LogRecord::DirCreate { path, .. } => {
            disk.create_directories_if_required(path)?;
        }
        LogRecord::FileCreate { path, .. } => {
            if !path.exists() {
                disk.create_file(path)?;
            }
        }
        LogRecord::FileDelete { path, .. } => {
            if path.exists() {
                disk.delete_file(path)?;
            }
        }
        LogRecord::FileMove { src, dst, .. } | LogRecord::FileSpecialMove { src, dst, .. } => {
            if src.exists() {
                disk.rename(src, dst)?;
            }
        }
        LogRecord::FileCopy { src, dst, .. } => {
            if src.exists() {
                if !dst.exists() {
                    disk.create_file(dst)?;
                }
                fs::copy(src, dst)?;
            }
        }
        LogRecord::FileTruncate { path, new_length, .. } => {
            if path.exists() {
                OpenOptions::new().write(true).open(path)?.set_len(*new_length)?;
            }
        }
        LogRecord::FileAppend { path, offset, .. } => {
            if !path.exists() {
                disk.create_file(path)?;
            }
            let content = entry.content.as_deref().unwrap_or(&[]);
            let mut file = OpenOptions::new().write(true).open(path)?;
            file.seek(SeekFrom::Start(*offset))?;
            file.write_all(content)?;
        }
        _ => {}
    }
    Ok(())
}

/// Apply a transaction's undo records in reverse order, restoring the
/// pre-transaction content of files it mutated in place.
pub(crate) fn apply_undo_chain(entries: &[ReplayEntry]) -> Result<()> {
    for entry in entries.iter().rev() {
        match &entry.record {
            LogRecord::UndoFileAppend { path, prior_length, .. } => {
                if path.exists() {
                    OpenOptions::new().write(true).open(path)?.set_len(*prior_length)?;
                }
            }
            LogRecord::UndoFileTruncate { path, offset, .. } => {
                let content = entry.content.as_deref().unwrap_or(&[]);
                let mut file = OpenOptions::new().write(true).create(true).open(path)?;
                file.seek(SeekFrom::Start(*offset))?;
                file.write_all(content)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Shadow sources referenced by a chain; these must survive until the owning
/// in-doubt transaction resolves.
pub(crate) fn shadow_sources(entries: &[ReplayEntry], backup_dir: &Path) -> Vec<PathBuf> {
    entries
        .iter()
        .filter_map(|e| match &e.record {
            LogRecord::FileSpecialMove { src, .. } if src.starts_with(backup_dir) => {
                Some(src.clone())
            }
            _ => None,
        })
        .collect()
}

/// Durably delete the stale logs the recovery scan set aside. Runs when
/// bootup completes, after every scanned transaction has been resolved.
pub(crate) fn reclaim_stale_logs(shared: &EngineShared) {
    let stale: Vec<u64> = std::mem::take(&mut *shared.stale_logs.lock());
    if stale.is_empty() {
        return;
    }
    let mut disk = DurableDirSession::new(shared.config.sync_directory_changes);
    for index in stale {
        let path = shared.config.log_file_path(index);
        if !path.is_file() {
            continue;
        }
        if let Err(e) = disk.delete_file_durably(&path) {
            warn!(log_index = index, error = %e, "stale log deletion failed");
        }
    }
}

// ---------------------------------------------------------------------
// Boot-time recovery
// ---------------------------------------------------------------------

/// Scan the retained logs and complete every transaction the crash left
/// unfinished. Called once during boot, before any session is admitted.
pub(crate) fn recover(shared: &EngineShared) -> Result<RecoveryReport> {
    let log_dir = shared.config.log_dir();
    let current = shared.writer.current_log_index();
    let old_logs: Vec<u64> = match find_latest_log_index(&log_dir)? {
        Some(latest) => (0..=latest)
            .filter(|i| *i != current && shared.config.log_file_path(*i).is_file())
            .collect(),
        None => Vec::new(),
    };
    if old_logs.is_empty() {
        return Ok(RecoveryReport::default());
    }
    info!(logs = old_logs.len(), "scanning retained transaction logs");

    let mut scanned: HashMap<TransactionId, ScannedTransaction> = HashMap::new();
    let mut active_endpoints: HashSet<String> = HashSet::new();

    for &index in &old_logs {
        let log_path = shared.config.log_file_path(index);
        let mut reader = RecordReader::open(&log_path, index)?;
        while let Some(parsed) = reader.next_record()? {
            match &parsed.record {
                LogRecord::EndpointActivates { endpoint } => {
                    active_endpoints.insert(endpoint.clone());
                    continue;
                }
                LogRecord::EndpointDeactivates { endpoint } => {
                    active_endpoints.remove(endpoint);
                    continue;
                }
                _ => {}
            }
            let Some(xid) = parsed.record.xid() else { continue };
            let txn = scanned.entry(xid.clone()).or_default();
            txn.logs.insert(index);

            match &parsed.record {
                LogRecord::EventEnqueue { events, .. } => {
                    txn.events.extend(events.iter().cloned());
                }
                LogRecord::EventDequeue { events, .. } => {
                    txn.dequeued.extend(events.iter().cloned());
                }
                LogRecord::FilesAlreadyOnDisk { paths, .. } => {
                    txn.files_on_disk.extend(paths.iter().cloned());
                }
                LogRecord::CommitBegins { .. } => txn.commit_begun = true,
                LogRecord::CommitDone { .. } => txn.committed = true,
                LogRecord::RollbackDone { .. } => txn.rolled_back = true,
                LogRecord::PrepareDone { .. }
                | LogRecord::PrepareDoneForEventDequeue { .. } => txn.prepared = true,
                LogRecord::UsesUndoLogs { .. } => txn.uses_undo = true,
                LogRecord::Checkpoint { position, .. } => {
                    txn.checkpoint = Some(txn.checkpoint.map_or(*position, |c| c.max(*position)));
                }
                record if record.is_undo() => {
                    let content = match record.content_len() {
                        0 => None,
                        len => Some(read_content(&log_path, parsed.offset, parsed.header_len, len)?),
                    };
                    txn.undo_entries.push(ReplayEntry {
                        record: parsed.record.clone(),
                        content,
                    });
                }
                record if record.is_redo() => {
                    let content = match record.content_len() {
                        0 => None,
                        len => Some(read_content(&log_path, parsed.offset, parsed.header_len, len)?),
                    };
                    txn.entries.push(ReplayEntry {
                        record: parsed.record.clone(),
                        content,
                    });
                }
                _ => {}
            }
        }
    }

    let mut report = RecoveryReport::default();
    let mut committed_enqueues: Vec<ChangeEvent> = Vec::new();
    let mut committed_dequeues: Vec<ChangeEvent> = Vec::new();
    let mut referenced_shadows: HashSet<PathBuf> = HashSet::new();
    let mut in_doubt_logs: HashSet<u64> = HashSet::new();
    let backup_dir = shared.config.backup_dir();
    let mut disk = DurableDirSession::new(shared.config.sync_directory_changes);

    for (xid, txn) in scanned {
        if txn.committed {
            committed_enqueues.extend(txn.events);
            committed_dequeues.extend(txn.dequeued);
            continue;
        }
        if txn.rolled_back {
            continue;
        }
        if txn.commit_begun {
            // Interrupted mid-commit; finish exactly what commit would have
            // done, resuming after the last checkpointed entry.
            let start_at = txn.checkpoint.unwrap_or(0) as usize;
            let skip = txn.files_on_disk.iter().cloned().collect();
            apply_redo_chain(shared, &mut disk, &xid, &txn.entries, &skip, start_at)?;
            disk.force_to_disk()?;
            shared
                .writer
                .force_write(&LogRecord::CommitDone { xid: xid.clone() }, &[])?;
            committed_enqueues.extend(txn.events);
            committed_dequeues.extend(txn.dequeued);
            info!(xid = %xid, "recovery completed an interrupted commit");
            report.committed.push(xid);
            continue;
        }
        if txn.prepared {
            for shadow in shadow_sources(&txn.entries, &backup_dir) {
                referenced_shadows.insert(shadow);
            }
            for &index in &txn.logs {
                shared.writer.adopt_usage(&xid, index);
                in_doubt_logs.insert(index);
            }
            info!(xid = %xid, "prepared transaction is in doubt");
            shared.in_doubt.lock().insert(
                xid.clone(),
                InDoubtTransaction {
                    entries: txn.entries,
                    undo_entries: txn.undo_entries,
                    files_on_disk: txn.files_on_disk,
                    events: txn.events,
                    checkpoint: txn.checkpoint,
                    logs: txn.logs,
                },
            );
            report.in_doubt.push(xid);
            continue;
        }
        if txn.uses_undo {
            apply_undo_chain(&txn.undo_entries)?;
            shared
                .writer
                .force_write(&LogRecord::RollbackDone { xid: xid.clone() }, &[])?;
            info!(xid = %xid, "recovery rolled back an in-place writer");
            report.rolled_back.push(xid);
        }
        // Redo-only transactions never reached a durability point; their
        // buffered changes evaporate with the old logs.
    }

    // Events enqueued by committed transactions but never dequeued by one
    // survive the crash.
    let mut recovered = committed_enqueues;
    for dequeued in committed_dequeues {
        if let Some(pos) = recovered.iter().position(|e| *e == dequeued) {
            recovered.remove(pos);
        }
    }
    if !recovered.is_empty() {
        info!(events = recovered.len(), "re-enqueued undelivered change events");
    }
    shared.recovered_events.lock().extend(recovered);

    // Shadows of resolved transactions are garbage now.
    if backup_dir.is_dir() {
        for dir_entry in fs::read_dir(&backup_dir)? {
            let path = dir_entry?.path();
            if path.is_file() && !referenced_shadows.contains(&path) {
                fs::remove_file(&path)?;
            }
        }
    }

    // Old logs not referenced by an in-doubt transaction are stale, but
    // they are reclaimed only once every in-doubt transaction has been
    // resolved and bootup completes.
    {
        let mut stale = shared.stale_logs.lock();
        stale.extend(old_logs.iter().filter(|i| !in_doubt_logs.contains(i)));
    }

    for endpoint in active_endpoints {
        shared.writer.record_endpoint_activation(&endpoint)?;
    }

    info!(
        committed = report.committed.len(),
        rolled_back = report.rolled_back.len(),
        in_doubt = report.in_doubt.len(),
        "recovery scan complete"
    );
    Ok(report)
}
