//! Per-transaction overlay over one physical directory.
//!
//! Overrides (created, deleted, moved-in) are layered on the physical
//! listing; a moved-in child remembers which physical location its content
//! still lives at. Existence and permission checks consult only this
//! transaction's overlay plus the physical fallback, never another
//! transaction's view.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use txfs_core::{Result, TxError};

/// Overlay for one directory.
#[derive(Debug)]
pub struct VirtualViewDirectory {
    logical_path: PathBuf,
    physical_path: Option<PathBuf>,
    created_files: HashMap<OsString, Option<PathBuf>>,
    created_dirs: HashMap<OsString, Option<PathBuf>>,
    deleted_files: HashSet<OsString>,
    deleted_dirs: HashSet<OsString>,
}

impl VirtualViewDirectory {
    /// Overlay for `logical_path`, backed by `physical_path` when the
    /// directory exists outside this transaction.
    pub fn new(logical_path: PathBuf, physical_path: Option<PathBuf>) -> Self {
        VirtualViewDirectory {
            logical_path,
            physical_path,
            created_files: HashMap::new(),
            created_dirs: HashMap::new(),
            deleted_files: HashSet::new(),
            deleted_dirs: HashSet::new(),
        }
    }

    /// This directory's path within the transaction.
    pub fn logical_path(&self) -> &Path {
        &self.logical_path
    }

    /// Rewrite the logical path after an ancestor rename.
    pub fn set_logical_path(&mut self, path: PathBuf) {
        self.logical_path = path;
    }

    /// Physical backing directory, if any.
    pub fn physical_path(&self) -> Option<&Path> {
        self.physical_path.as_deref()
    }

    fn physically_has(&self, name: &OsStr, want_dir: bool) -> bool {
        match &self.physical_path {
            Some(dir) => {
                let p = dir.join(name);
                if want_dir {
                    p.is_dir()
                } else {
                    p.is_file()
                }
            }
            None => false,
        }
    }

    /// Does `name` exist as a file in this view?
    pub fn file_exists(&self, name: &OsStr) -> bool {
        if self.created_files.contains_key(name) {
            return true;
        }
        if self.deleted_files.contains(name) {
            return false;
        }
        self.physically_has(name, false)
    }

    /// Does `name` exist as a directory in this view?
    pub fn dir_exists(&self, name: &OsStr) -> bool {
        if self.created_dirs.contains_key(name) {
            return true;
        }
        if self.deleted_dirs.contains(name) {
            return false;
        }
        self.physically_has(name, true)
    }

    /// Record creation of a file; `points_to` is the physical location its
    /// content lives at when it was moved in from elsewhere.
    pub fn record_file_created(&mut self, name: &OsStr, points_to: Option<PathBuf>) {
        self.deleted_files.remove(name);
        self.created_files.insert(name.to_os_string(), points_to);
    }

    /// Record creation of a subdirectory.
    pub fn record_dir_created(&mut self, name: &OsStr, points_to: Option<PathBuf>) {
        self.deleted_dirs.remove(name);
        self.created_dirs.insert(name.to_os_string(), points_to);
    }

    /// Record deletion of a file.
    pub fn record_file_deleted(&mut self, name: &OsStr) {
        self.created_files.remove(name);
        self.deleted_files.insert(name.to_os_string());
    }

    /// Record deletion of a subdirectory.
    pub fn record_dir_deleted(&mut self, name: &OsStr) {
        self.created_dirs.remove(name);
        self.deleted_dirs.insert(name.to_os_string());
    }

    /// Physical location a child's content still lives at: the moved-in
    /// source if recorded, otherwise this directory's own physical child.
    pub fn points_to_physical(&self, name: &OsStr) -> Option<PathBuf> {
        if let Some(points) = self.created_files.get(name) {
            return points.clone();
        }
        if let Some(points) = self.created_dirs.get(name) {
            return points.clone();
        }
        if self.deleted_files.contains(name) || self.deleted_dirs.contains(name) {
            return None;
        }
        self.physical_path.as_ref().map(|d| d.join(name))
    }

    /// Names visible in this view, sorted.
    pub fn list(&self) -> Result<Vec<OsString>> {
        let mut names = BTreeSet::new();
        if let Some(dir) = &self.physical_path {
            if dir.is_dir() {
                for entry in fs::read_dir(dir)? {
                    names.insert(entry?.file_name());
                }
            }
        }
        for name in self.deleted_files.iter().chain(self.deleted_dirs.iter()) {
            names.remove(name);
        }
        for name in self.created_files.keys().chain(self.created_dirs.keys()) {
            names.insert(name.clone());
        }
        Ok(names.into_iter().collect())
    }

    /// Whether the view has no visible children.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.list()?.is_empty())
    }

    /// Fail unless the physical backing (when present) permits writing new
    /// entries into this directory.
    pub fn check_writable(&self) -> Result<()> {
        if let Some(dir) = &self.physical_path {
            if dir.is_dir() && fs::metadata(dir)?.permissions().readonly() {
                return Err(TxError::InsufficientPermission {
                    path: self.logical_path.clone(),
                    needed: "write",
                });
            }
        }
        Ok(())
    }
}
