//! The virtual filesystem: a tree of file nodes mirroring a host
//! directory, with per-node blueprint and singleton-object caches.
//!
//! Nodes are arena slots behind [`FileId`] handles. The tree only
//! records structure and caches — reading source text and compiling it
//! is the engine's job, so loading never touches the compiler.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::VfsError;
use crate::heap::ObjRef;

/// Handle to a virtual file node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId(u32);

#[derive(Debug)]
struct FileNode {
    /// Sibling-unique name; empty only for the root. Never contains `/`.
    name: String,
    parent: Option<FileId>,
    children: Vec<FileId>,
    /// Cached compile result; cleared on recompile or delete.
    blueprint: Option<ObjRef>,
    /// Cached singleton instance; cleared on recompile or delete.
    object: Option<ObjRef>,
    /// Host path backing this node, if it is a regular file.
    real_path: Option<PathBuf>,
    is_dir: bool,
}

#[derive(Debug)]
pub struct Vfs {
    nodes: Vec<Option<FileNode>>,
    root: FileId,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        let root = FileNode {
            name: String::new(),
            parent: None,
            children: Vec::new(),
            blueprint: None,
            object: None,
            real_path: None,
            is_dir: true,
        };
        Self {
            nodes: vec![Some(root)],
            root: FileId(0),
        }
    }

    pub fn root(&self) -> FileId {
        self.root
    }

    fn node(&self, id: FileId) -> Option<&FileNode> {
        self.nodes.get(id.0 as usize)?.as_ref()
    }

    fn node_mut(&mut self, id: FileId) -> Option<&mut FileNode> {
        self.nodes.get_mut(id.0 as usize)?.as_mut()
    }

    // ── Structure ──

    pub fn add_child(
        &mut self,
        parent: FileId,
        name: &str,
        real_path: Option<PathBuf>,
        is_dir: bool,
    ) -> Result<FileId, VfsError> {
        if name.is_empty() || name.contains('/') {
            return Err(VfsError::InvalidName(name.to_string()));
        }
        let parent_node = self.node(parent).ok_or(VfsError::UnknownNode)?;
        if parent_node
            .children
            .iter()
            .any(|&c| self.node(c).map(|n| n.name.as_str()) == Some(name))
        {
            return Err(VfsError::DuplicateName(name.to_string()));
        }

        let node = FileNode {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            blueprint: None,
            object: None,
            real_path,
            is_dir,
        };
        self.nodes.push(Some(node));
        let id = FileId((self.nodes.len() - 1) as u32);
        if let Some(p) = self.node_mut(parent) {
            p.children.push(id);
        }
        Ok(id)
    }

    /// Remove a node and its whole subtree, dropping the cached
    /// blueprints and objects with it.
    pub fn delete(&mut self, id: FileId) {
        if id == self.root {
            return;
        }
        let Some(node) = self.nodes.get_mut(id.0 as usize).and_then(Option::take) else {
            return;
        };
        for child in node.children {
            self.delete_subtree(child);
        }
        if let Some(parent) = node.parent.and_then(|p| self.node_mut(p)) {
            parent.children.retain(|&c| c != id);
        }
    }

    fn delete_subtree(&mut self, id: FileId) {
        if let Some(node) = self.nodes.get_mut(id.0 as usize).and_then(Option::take) {
            for child in node.children {
                self.delete_subtree(child);
            }
        }
    }

    // ── Accessors ──

    pub fn name(&self, id: FileId) -> Option<&str> {
        self.node(id).map(|n| n.name.as_str())
    }

    pub fn parent(&self, id: FileId) -> Option<FileId> {
        self.node(id)?.parent
    }

    pub fn children(&self, id: FileId) -> &[FileId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn is_dir(&self, id: FileId) -> bool {
        self.node(id).map(|n| n.is_dir).unwrap_or(false)
    }

    pub fn real_path(&self, id: FileId) -> Option<&Path> {
        self.node(id)?.real_path.as_deref()
    }

    pub fn blueprint(&self, id: FileId) -> Option<ObjRef> {
        self.node(id)?.blueprint
    }

    pub fn set_blueprint(&mut self, id: FileId, blueprint: Option<ObjRef>) {
        if let Some(node) = self.node_mut(id) {
            node.blueprint = blueprint;
        }
    }

    pub fn object(&self, id: FileId) -> Option<ObjRef> {
        self.node(id)?.object
    }

    pub fn set_object(&mut self, id: FileId, object: Option<ObjRef>) {
        if let Some(node) = self.node_mut(id) {
            node.object = object;
        }
    }

    // ── Path resolution ──

    /// Resolve a `/`-delimited virtual path. A leading `/` anchors at the
    /// root, `.` and `..` resolve conventionally, and every other
    /// component must match a child name exactly. `None` on any miss;
    /// `..` above the root also misses.
    pub fn resolve(&self, from: FileId, path: &str) -> Option<FileId> {
        let (mut current, rest) = match path.strip_prefix('/') {
            Some(rest) => (self.root, rest),
            None => (from, path),
        };
        for component in rest.split('/') {
            current = self.resolve1(current, component)?;
        }
        Some(current)
    }

    fn resolve1(&self, at: FileId, component: &str) -> Option<FileId> {
        match component {
            "" | "." => Some(at),
            ".." => self.node(at)?.parent,
            name => self
                .children(at)
                .iter()
                .copied()
                .find(|&c| self.node(c).map(|n| n.name.as_str()) == Some(name)),
        }
    }

    /// Canonical virtual path of a node. The root is the empty string,
    /// so every other node renders as `/a/b/c`.
    pub fn path_of(&self, id: FileId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let Some(node) = self.node(node_id) else { break };
            if node.parent.is_some() {
                parts.push(node.name.clone());
            }
            current = node.parent;
        }
        parts.reverse();
        if parts.is_empty() {
            String::new()
        } else {
            format!("/{}", parts.join("/"))
        }
    }

    // ── Host loading ──

    /// Mirror a host directory tree under `parent`. Nothing is compiled;
    /// dot entries are skipped; entries are taken in name order so load
    /// results are deterministic. Returns the number of nodes created.
    pub fn load(&mut self, parent: FileId, real_path: &Path) -> Result<usize> {
        let mut entries: Vec<_> = std::fs::read_dir(real_path)
            .with_context(|| format!("reading directory {}", real_path.display()))?
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("reading directory {}", real_path.display()))?;
        entries.sort_by_key(|e| e.file_name());

        let mut count = 0;
        for entry in entries {
            let os_name = entry.file_name();
            let Some(name) = os_name.to_str() else {
                tracing::warn!("skipping non-UTF-8 entry in {}", real_path.display());
                continue;
            };
            if name == "." || name == ".." {
                continue;
            }
            let path = entry.path();
            let is_dir = path.is_dir();
            let child = match self.add_child(parent, name, Some(path.clone()), is_dir) {
                Ok(child) => child,
                Err(e) => {
                    tracing::warn!("skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            count += 1;
            if is_dir {
                count += self.load(child, &path)?;
            }
        }
        Ok(count)
    }

    /// Cached blueprints and objects, as GC roots.
    pub fn gc_roots(&self) -> Vec<ObjRef> {
        let mut roots = Vec::new();
        for node in self.nodes.iter().flatten() {
            roots.extend(node.blueprint);
            roots.extend(node.object);
        }
        roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds the `/lib/std/obj` shape used across the resolution tests.
    fn sample() -> (Vfs, FileId, FileId, FileId) {
        let mut vfs = Vfs::new();
        let lib = vfs.add_child(vfs.root(), "lib", None, true).unwrap();
        let std_ = vfs.add_child(lib, "std", None, true).unwrap();
        let obj = vfs.add_child(std_, "obj", None, false).unwrap();
        (vfs, lib, std_, obj)
    }

    #[test]
    fn resolves_anchored_and_relative_paths() {
        let (vfs, lib, std_, obj) = sample();
        assert_eq!(vfs.resolve(vfs.root(), "/lib/std/obj"), Some(obj));
        assert_eq!(vfs.resolve(lib, "std"), Some(std_));
        assert_eq!(vfs.resolve(std_, "../std/obj"), Some(obj));
        assert_eq!(vfs.resolve(obj, "."), Some(obj));
        assert_eq!(vfs.resolve(obj, ".."), Some(std_));
        assert_eq!(vfs.resolve(vfs.root(), "/nope"), None);
        assert_eq!(vfs.resolve(vfs.root(), ".."), None);
    }

    #[test]
    fn resolution_is_idempotent_through_path_of() {
        let (vfs, _, _, obj) = sample();
        let path = vfs.path_of(obj);
        assert_eq!(path, "/lib/std/obj");
        assert_eq!(vfs.resolve(vfs.root(), &path), Some(obj));
        // Resolving a canonical path and printing it round-trips.
        let again = vfs.resolve(vfs.root(), &path).unwrap();
        assert_eq!(vfs.path_of(again), path);
    }

    #[test]
    fn sibling_names_are_unique() {
        let mut vfs = Vfs::new();
        vfs.add_child(vfs.root(), "a", None, false).unwrap();
        assert!(matches!(
            vfs.add_child(vfs.root(), "a", None, false),
            Err(VfsError::DuplicateName(_))
        ));
        assert!(matches!(
            vfs.add_child(vfs.root(), "x/y", None, false),
            Err(VfsError::InvalidName(_))
        ));
        assert!(matches!(
            vfs.add_child(vfs.root(), "", None, false),
            Err(VfsError::InvalidName(_))
        ));
    }

    #[test]
    fn delete_removes_subtree_and_caches() {
        let (mut vfs, lib, std_, obj) = sample();
        vfs.delete(std_);
        assert_eq!(vfs.resolve(vfs.root(), "/lib/std"), None);
        assert!(vfs.name(obj).is_none());
        assert_eq!(vfs.children(lib).len(), 0);
        assert!(vfs.gc_roots().is_empty());
    }

    #[test]
    fn loads_host_tree_lazily() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("std")).unwrap();
        std::fs::write(dir.path().join("std/base.rv"), "int x;").unwrap();
        std::fs::write(dir.path().join("master.rv"), "void login() {}").unwrap();

        let mut vfs = Vfs::new();
        let count = vfs.load(vfs.root(), dir.path()).unwrap();
        assert_eq!(count, 3);

        let base = vfs.resolve(vfs.root(), "/std/base.rv").unwrap();
        assert!(!vfs.is_dir(base));
        assert!(vfs.real_path(base).is_some());
        // Nothing was compiled by loading.
        assert!(vfs.blueprint(base).is_none());
        assert!(vfs.object(base).is_none());
    }
}
