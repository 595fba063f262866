//! Directory-metadata durability.
//!
//! Filesystem metadata changes (create, delete, rename) become durable only
//! once the parent directory itself is synced. A [`DurableDirSession`]
//! tracks every directory it dirties and forces them all in one
//! [`force_to_disk`] call at the durability point; the `*_durably` variants
//! sync immediately instead.
//!
//! [`force_to_disk`]: DurableDirSession::force_to_disk

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Tracks dirtied directories and syncs them on demand.
///
/// With `sync_changes` off every sync degrades to a no-op; the tracking
/// bookkeeping still runs so behavior differs only in durability.
#[derive(Debug)]
pub struct DurableDirSession {
    directories_to_force: HashSet<PathBuf>,
    sync_changes: bool,
}

fn sync_directory(dir: &Path) -> io::Result<()> {
    // Opening a directory read-only and calling sync_all flushes its
    // metadata on POSIX systems.
    File::open(dir)?.sync_all()
}

impl DurableDirSession {
    /// New session; `sync_changes` mirrors the engine configuration.
    pub fn new(sync_changes: bool) -> Self {
        DurableDirSession {
            directories_to_force: HashSet::new(),
            sync_changes,
        }
    }

    /// Sync every tracked directory, then clear the tracking set.
    pub fn force_to_disk(&mut self) -> io::Result<()> {
        if self.sync_changes {
            for dir in &self.directories_to_force {
                if dir.is_dir() {
                    sync_directory(dir)?;
                }
            }
        }
        self.directories_to_force.clear();
        Ok(())
    }

    fn track_parent(&mut self, path: &Path) {
        if let Some(parent) = path.parent() {
            self.directories_to_force.insert(parent.to_path_buf());
        }
    }

    /// Mark a directory dirtied outside this session's own calls.
    pub fn track_directory(&mut self, dir: &Path) {
        self.directories_to_force.insert(dir.to_path_buf());
    }

    /// Rename `src` to `dst`, tracking both parents and rewriting tracked
    /// paths under `src` to their new location.
    pub fn rename(&mut self, src: &Path, dst: &Path) -> io::Result<()> {
        self.track_parent(src);
        self.track_parent(dst);
        if self.directories_to_force.remove(src) {
            self.directories_to_force.insert(dst.to_path_buf());
        }
        let moved: Vec<PathBuf> = self
            .directories_to_force
            .iter()
            .filter(|d| d.starts_with(src))
            .cloned()
            .collect();
        for old in moved {
            if let Ok(tail) = old.strip_prefix(src) {
                self.directories_to_force.remove(&old);
                self.directories_to_force.insert(dst.join(tail));
            }
        }
        fs::rename(src, dst)
    }

    /// Create an empty file.
    pub fn create_file(&mut self, path: &Path) -> io::Result<()> {
        self.track_parent(path);
        File::options().write(true).create_new(true).open(path)?;
        Ok(())
    }

    /// Create an empty file and sync its parent immediately.
    pub fn create_file_durably(&mut self, path: &Path) -> io::Result<()> {
        File::options().write(true).create_new(true).open(path)?;
        self.sync_parent_of(path)
    }

    /// Create a directory.
    pub fn create_directory(&mut self, path: &Path) -> io::Result<()> {
        self.track_parent(path);
        fs::create_dir(path)
    }

    /// Create a directory and sync its parent immediately.
    pub fn create_directory_durably(&mut self, path: &Path) -> io::Result<()> {
        fs::create_dir(path)?;
        self.sync_parent_of(path)
    }

    /// Create `path` and any missing ancestors.
    pub fn create_directories_if_required(&mut self, path: &Path) -> io::Result<()> {
        if path.is_dir() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            self.create_directories_if_required(parent)?;
        }
        self.create_directory(path)
    }

    /// Delete a file or empty directory.
    pub fn delete_file(&mut self, path: &Path) -> io::Result<()> {
        self.track_parent(path);
        self.directories_to_force.remove(path);
        if path.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        }
    }

    /// Delete a file and sync its parent immediately.
    pub fn delete_file_durably(&mut self, path: &Path) -> io::Result<()> {
        if path.is_dir() {
            fs::remove_dir(path)?;
        } else {
            fs::remove_file(path)?;
        }
        self.sync_parent_of(path)
    }

    /// Delete a directory and everything beneath it.
    pub fn delete_directory_recursively(&mut self, dir: &Path) -> io::Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let p = entry.path();
            if p.is_dir() {
                self.delete_directory_recursively(&p)?;
            } else {
                self.delete_file(&p)?;
            }
        }
        self.delete_file(dir)
    }

    fn sync_parent_of(&self, path: &Path) -> io::Result<()> {
        if !self.sync_changes {
            return Ok(());
        }
        match path.parent() {
            Some(parent) => sync_directory(parent),
            None => Ok(()),
        }
    }
}
