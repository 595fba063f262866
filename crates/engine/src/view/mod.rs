//! The per-transaction copy-on-write view of the filesystem.
//!
//! Directory and file views are created lazily at first touch of a path and
//! discarded at transaction end. All resolution goes through the
//! transaction's own overlays with physical fallback; a path that no
//! overlay mentions resolves to itself.

pub mod directory;
pub mod file;

pub use directory::VirtualViewDirectory;
pub use file::VirtualViewFile;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use txfs_core::{Result, TxError};

/// Shared handle to a file view; streams and the session both hold one.
pub type FileViewHandle = Arc<Mutex<VirtualViewFile>>;

fn parent_and_name(path: &Path) -> Result<(&Path, &OsStr)> {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(TxError::InsufficientPermission {
            path: path.to_path_buf(),
            needed: "a parent directory",
        }),
    }
}

/// All views owned by one transaction.
#[derive(Debug, Default)]
pub struct TransactionView {
    dirs: HashMap<PathBuf, VirtualViewDirectory>,
    files: HashMap<PathBuf, FileViewHandle>,
}

impl TransactionView {
    /// Empty view.
    pub fn new() -> Self {
        TransactionView::default()
    }

    /// Where `path`'s content physically lives according to this view:
    /// overlays on the way down may redirect (moved-in) or erase (deleted)
    /// it; with no overlay the path resolves to itself.
    pub fn physical_location(&self, path: &Path) -> Option<PathBuf> {
        let mut logical = PathBuf::from("/");
        let mut physical = PathBuf::from("/");
        let components: Vec<&OsStr> = path
            .components()
            .filter_map(|c| match c {
                std::path::Component::Normal(n) => Some(n),
                _ => None,
            })
            .collect();
        for name in components {
            match self.dirs.get(&logical) {
                Some(vvd) => {
                    physical = vvd.points_to_physical(name)?;
                }
                None => {
                    physical = physical.join(name);
                }
            }
            logical = logical.join(name);
        }
        Some(physical)
    }

    /// Directory view for `path`, created lazily.
    pub fn dir_view(&mut self, path: &Path) -> &mut VirtualViewDirectory {
        let physical = if self.dirs.contains_key(path) {
            None
        } else {
            self.physical_location(path).filter(|p| p.is_dir())
        };
        self.dirs
            .entry(path.to_path_buf())
            .or_insert_with(|| VirtualViewDirectory::new(path.to_path_buf(), physical))
    }

    /// File view for `path`, created lazily over its physical location.
    pub fn file_view(&mut self, path: &Path) -> Result<FileViewHandle> {
        if let Some(handle) = self.files.get(path) {
            return Ok(Arc::clone(handle));
        }
        let physical = self
            .physical_location(path)
            .filter(|p| p.is_file());
        let vvf = VirtualViewFile::new(path.to_path_buf(), physical)?;
        let handle = Arc::new(Mutex::new(vvf));
        self.files.insert(path.to_path_buf(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Cached file view, if one exists.
    pub fn cached_file_view(&self, path: &Path) -> Option<FileViewHandle> {
        self.files.get(path).map(Arc::clone)
    }

    /// Every cached file view.
    pub fn all_file_views(&self) -> impl Iterator<Item = &FileViewHandle> {
        self.files.values()
    }

    /// Does `path` exist as a file in this view?
    pub fn file_exists(&mut self, path: &Path) -> Result<bool> {
        let (parent, name) = parent_and_name(path)?;
        let (parent, name) = (parent.to_path_buf(), name.to_os_string());
        Ok(self.dir_view(&parent).file_exists(&name))
    }

    /// Does `path` exist as a directory in this view?
    pub fn dir_exists(&mut self, path: &Path) -> Result<bool> {
        if path.parent().is_none() {
            return Ok(true);
        }
        let (parent, name) = parent_and_name(path)?;
        let (parent, name) = (parent.to_path_buf(), name.to_os_string());
        Ok(self.dir_view(&parent).dir_exists(&name))
    }

    /// Record creation of a file.
    pub fn record_file_created(&mut self, path: &Path) -> Result<()> {
        let (parent, name) = parent_and_name(path)?;
        let (parent, name) = (parent.to_path_buf(), name.to_os_string());
        self.dir_view(&parent).record_file_created(&name, None);
        Ok(())
    }

    /// Record creation of a directory.
    pub fn record_dir_created(&mut self, path: &Path) -> Result<()> {
        let (parent, name) = parent_and_name(path)?;
        let (parent, name) = (parent.to_path_buf(), name.to_os_string());
        self.dir_view(&parent).record_dir_created(&name, None);
        Ok(())
    }

    /// Record deletion of a file; drops any cached content view.
    pub fn record_file_deleted(&mut self, path: &Path) -> Result<()> {
        let (parent, name) = parent_and_name(path)?;
        let (parent, name) = (parent.to_path_buf(), name.to_os_string());
        self.dir_view(&parent).record_file_deleted(&name);
        self.files.remove(path);
        Ok(())
    }

    /// Record deletion of a directory.
    pub fn record_dir_deleted(&mut self, path: &Path) -> Result<()> {
        let (parent, name) = parent_and_name(path)?;
        let (parent, name) = (parent.to_path_buf(), name.to_os_string());
        self.dir_view(&parent).record_dir_deleted(&name);
        self.dirs.remove(path);
        Ok(())
    }

    /// Record a file move: the destination keeps pointing at the source's
    /// physical content, and any cached content view follows the rename.
    pub fn record_file_moved(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let src_physical = self.physical_location(src);
        {
            let (parent, name) = parent_and_name(src)?;
            let (parent, name) = (parent.to_path_buf(), name.to_os_string());
            self.dir_view(&parent).record_file_deleted(&name);
        }
        {
            let (parent, name) = parent_and_name(dst)?;
            let (parent, name) = (parent.to_path_buf(), name.to_os_string());
            self.dir_view(&parent)
                .record_file_created(&name, src_physical);
        }
        if let Some(handle) = self.files.remove(src) {
            handle.lock().set_logical_path(dst.to_path_buf());
            self.files.insert(dst.to_path_buf(), handle);
        }
        Ok(())
    }

    /// Record a directory move, propagating the new logical path to every
    /// cached view beneath it.
    pub fn record_dir_moved(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let src_physical = self.physical_location(src);
        {
            let (parent, name) = parent_and_name(src)?;
            let (parent, name) = (parent.to_path_buf(), name.to_os_string());
            self.dir_view(&parent).record_dir_deleted(&name);
        }
        {
            let (parent, name) = parent_and_name(dst)?;
            let (parent, name) = (parent.to_path_buf(), name.to_os_string());
            self.dir_view(&parent)
                .record_dir_created(&name, src_physical);
        }

        let moved_dirs: Vec<PathBuf> = self
            .dirs
            .keys()
            .filter(|p| p.starts_with(src))
            .cloned()
            .collect();
        for old in moved_dirs {
            if let Some(mut vvd) = self.dirs.remove(&old) {
                let new = match old.strip_prefix(src) {
                    Ok(tail) if tail.as_os_str().is_empty() => dst.to_path_buf(),
                    Ok(tail) => dst.join(tail),
                    Err(_) => old.clone(),
                };
                vvd.set_logical_path(new.clone());
                self.dirs.insert(new, vvd);
            }
        }
        let moved_files: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|p| p.starts_with(src))
            .cloned()
            .collect();
        for old in moved_files {
            if let Some(handle) = self.files.remove(&old) {
                let new = match old.strip_prefix(src) {
                    Ok(tail) => dst.join(tail),
                    Err(_) => old.clone(),
                };
                handle.lock().set_logical_path(new.clone());
                self.files.insert(new, handle);
            }
        }
        Ok(())
    }

    /// Install a file view built elsewhere (copy targets).
    pub fn install_file_view(&mut self, path: &Path, view: VirtualViewFile) -> FileViewHandle {
        let handle = Arc::new(Mutex::new(view));
        self.files.insert(path.to_path_buf(), Arc::clone(&handle));
        handle
    }

    /// Whether any stream holds `path` open.
    pub fn file_in_use(&self, path: &Path) -> bool {
        self.files
            .get(path)
            .map(|h| h.lock().in_use())
            .unwrap_or(false)
    }

    /// Visible children of the directory at `path`, sorted.
    pub fn list_dir(&mut self, path: &Path) -> Result<Vec<std::ffi::OsString>> {
        self.dir_view(path).list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unvisited_paths_resolve_to_themselves() {
        let view = TransactionView::new();
        assert_eq!(
            view.physical_location(Path::new("/a/b/c")),
            Some(PathBuf::from("/a/b/c"))
        );
    }

    #[test]
    fn create_then_exists_then_delete() {
        let mut view = TransactionView::new();
        let p = Path::new("/d/f.txt");
        assert!(!view.file_exists(p).unwrap());
        view.record_file_created(p).unwrap();
        assert!(view.file_exists(p).unwrap());
        view.record_file_deleted(p).unwrap();
        assert!(!view.file_exists(p).unwrap());
    }

    #[test]
    fn file_move_redirects_physical_location() {
        let mut view = TransactionView::new();
        view.record_file_moved(Path::new("/a/src.txt"), Path::new("/b/dst.txt"))
            .unwrap();
        assert!(!view.file_exists(Path::new("/a/src.txt")).unwrap());
        assert!(view.file_exists(Path::new("/b/dst.txt")).unwrap());
        assert_eq!(
            view.physical_location(Path::new("/b/dst.txt")),
            Some(PathBuf::from("/a/src.txt"))
        );
    }

    #[test]
    fn dir_move_rewrites_cached_views() {
        let mut view = TransactionView::new();
        view.record_dir_created(Path::new("/old")).unwrap();
        view.record_file_created(Path::new("/old/f")).unwrap();
        let handle = view.file_view(Path::new("/old/f")).unwrap();

        view.record_dir_moved(Path::new("/old"), Path::new("/new")).unwrap();
        assert_eq!(handle.lock().logical_path(), Path::new("/new/f"));
        assert!(view.cached_file_view(Path::new("/new/f")).is_some());
        assert!(view.cached_file_view(Path::new("/old/f")).is_none());
        assert!(view.dir_exists(Path::new("/new")).unwrap());
        assert!(!view.dir_exists(Path::new("/old")).unwrap());
    }

    #[test]
    fn deleted_ancestor_erases_descendants() {
        let mut view = TransactionView::new();
        view.record_dir_deleted(Path::new("/gone")).unwrap();
        assert_eq!(view.physical_location(Path::new("/gone/child")), None);
    }
}
