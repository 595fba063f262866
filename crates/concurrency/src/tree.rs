//! The path-hierarchy lock tree.
//!
//! One node exists per filesystem path ever touched; nodes are created
//! lazily on first traversal and live for the process lifetime, held in an
//! arena indexed by [`NodeId`]. The tree is bounded by the number of
//! distinct paths touched, so no reclamation is performed.
//!
//! Lock ordering: the arena mutex is never acquired while holding any
//! node's lock-state mutex.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use txfs_core::TransactionId;

use crate::lock::ResourceLock;

/// Index of a node in the lock-tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

struct Node {
    name: OsString,
    parent: Option<NodeId>,
    children: HashMap<OsString, NodeId>,
    lock: Arc<ResourceLock>,
    pinned_by: Option<TransactionId>,
}

struct Arena {
    nodes: Vec<Node>,
}

impl Arena {
    fn root() -> Self {
        Arena {
            nodes: vec![Node {
                name: OsString::new(),
                parent: None,
                children: HashMap::new(),
                lock: Arc::new(ResourceLock::new()),
                pinned_by: None,
            }],
        }
    }

    fn child_of(&mut self, parent: NodeId, name: &OsStr, create: bool) -> Option<NodeId> {
        if let Some(&id) = self.nodes[parent.0].children.get(name) {
            return Some(id);
        }
        if !create {
            return None;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: name.to_os_string(),
            parent: Some(parent),
            children: HashMap::new(),
            lock: Arc::new(ResourceLock::new()),
            pinned_by: None,
        });
        self.nodes[parent.0].children.insert(name.to_os_string(), id);
        Some(id)
    }
}

fn components_of(path: &Path) -> impl Iterator<Item = &OsStr> {
    path.components().filter_map(|c| match c {
        Component::Normal(name) => Some(name),
        _ => None,
    })
}

/// Arena-backed lock tree mirroring the filesystem hierarchy.
pub struct LockTree {
    arena: Mutex<Arena>,
}

impl Default for LockTree {
    fn default() -> Self {
        LockTree::new()
    }
}

impl LockTree {
    /// Empty tree with only the root node.
    pub fn new() -> Self {
        LockTree {
            arena: Mutex::new(Arena::root()),
        }
    }

    /// Node for `path`, creating intermediate nodes on the way down.
    pub fn node_for(&self, path: &Path) -> NodeId {
        let mut arena = self.arena.lock();
        let mut current = NodeId(0);
        for name in components_of(path) {
            current = arena
                .child_of(current, name, true)
                .unwrap_or(current);
        }
        current
    }

    /// The lock owned by `node`.
    pub fn lock_of(&self, node: NodeId) -> Arc<ResourceLock> {
        let arena = self.arena.lock();
        Arc::clone(&arena.nodes[node.0].lock)
    }

    /// Reconstruct the absolute path of `node`.
    pub fn path_of(&self, node: NodeId) -> PathBuf {
        let arena = self.arena.lock();
        let mut names = Vec::new();
        let mut current = Some(node);
        while let Some(id) = current {
            let n = &arena.nodes[id.0];
            if n.parent.is_some() {
                names.push(n.name.clone());
            }
            current = n.parent;
        }
        let mut path = PathBuf::from("/");
        for name in names.iter().rev() {
            path.push(name);
        }
        path
    }

    /// True if `node` or any ancestor is pinned by a transaction other than
    /// `xid`.
    pub fn ancestor_pinned_by_other(&self, node: NodeId, xid: &TransactionId) -> bool {
        let arena = self.arena.lock();
        let mut current = Some(node);
        while let Some(id) = current {
            let n = &arena.nodes[id.0];
            if let Some(pin) = &n.pinned_by {
                if pin != xid {
                    return true;
                }
            }
            current = n.parent;
        }
        false
    }

    /// Pin the subtree rooted at `path` for a rename by `xid`.
    ///
    /// All-or-nothing: the walk first verifies no node on the root-to-leaf
    /// path is pinned by another transaction, then pins every node in the
    /// subtree, verifying each node's holder set is empty or exactly `{xid}`.
    /// Any conflict unwinds every pin taken so far. Returns the pinned node
    /// set for later release.
    pub fn pin_subtree(&self, path: &Path, xid: &TransactionId) -> Option<Vec<NodeId>> {
        let root = self.node_for(path);
        let mut arena = self.arena.lock();
        {
            let mut current = Some(root);
            while let Some(id) = current {
                let n = &arena.nodes[id.0];
                if let Some(pin) = &n.pinned_by {
                    if pin != xid {
                        return None;
                    }
                }
                current = n.parent;
            }
        }

        let mut pinned: Vec<NodeId> = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let lock = Arc::clone(&arena.nodes[id.0].lock);
            let grantable = {
                let state = lock.lock_state();
                state.holder_count() == 0
                    || (state.holder_count() == 1 && state.holders().contains(xid))
            };
            let already_mine = arena.nodes[id.0].pinned_by.as_ref() == Some(xid);
            if !grantable || (arena.nodes[id.0].pinned_by.is_some() && !already_mine) {
                for &p in &pinned {
                    let pv: &mut Option<TransactionId> = &mut arena.nodes[p.0].pinned_by;
                    *pv = None;
                }
                return None;
            }
            if !already_mine {
                arena.nodes[id.0].pinned_by = Some(xid.clone());
                pinned.push(id);
            }
            stack.extend(arena.nodes[id.0].children.values().copied());
        }
        Some(pinned)
    }

    /// Release pins previously taken by `xid`.
    pub fn release_pins(&self, nodes: &[NodeId], xid: &TransactionId) {
        let mut arena = self.arena.lock();
        for &id in nodes {
            if arena.nodes[id.0].pinned_by.as_ref() == Some(xid) {
                arena.nodes[id.0].pinned_by = None;
            }
        }
    }

    /// Number of nodes ever created, root included.
    pub fn node_count(&self) -> usize {
        self.arena.lock().nodes.len()
    }
}
