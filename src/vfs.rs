//! In-memory virtual file system.
//!
//! The tree owns its nodes outright: directories hold their children by
//! value and nothing points back up, so a node can never contain itself.
//! Every path handed to an operation is normalized first, which means the
//! operations are total over arbitrary input and report misses as
//! [`VfsError`] values.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalized absolute `/`-separated path.
pub type VfsPath = String;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VfsError {
    #[error("{0}: No such file or directory")]
    NotFound(VfsPath),

    #[error("{0}: File exists")]
    AlreadyExists(VfsPath),

    #[error("{0}: Not a directory")]
    NotADirectory(VfsPath),

    #[error("{0}: Is a directory")]
    IsADirectory(VfsPath),

    #[error("invalid file system tree: {0}")]
    InvalidTree(String),
}

pub type VfsResult<T> = std::result::Result<T, VfsError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VfsNode {
    File {
        content: String,
        size: usize,
        #[serde(rename = "modifiedAt")]
        modified_at: DateTime<Utc>,
    },
    Directory {
        /// Kept in insertion order; that order is what `ls` shows.
        children: IndexMap<String, VfsNode>,
    },
}

impl VfsNode {
    pub fn file(content: impl Into<String>) -> Self {
        let content = content.into();
        VfsNode::File {
            size: content.len(),
            content,
            modified_at: Utc::now(),
        }
    }

    pub fn directory() -> Self {
        VfsNode::Directory {
            children: IndexMap::new(),
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            VfsNode::File { .. } => EntryKind::File,
            VfsNode::Directory { .. } => EntryKind::Directory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Split a path into its non-empty segments without interpreting `.`/`..`.
fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Split a normalized path into `(parent, name)`. `None` for `/`.
fn split_parent(path: &str) -> Option<(VfsPath, String)> {
    let idx = path.rfind('/')?;
    let name = &path[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent.to_string(), name.to_string()))
}

/// Join a directory path and a child name.
pub fn join(dir: &str, name: &str) -> VfsPath {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// True when `path` is `base` or lies below it, compared segment-wise.
pub fn is_within(path: &str, base: &str) -> bool {
    if base == "/" {
        return path.starts_with('/');
    }
    path == base
        || (path.starts_with(base) && path.as_bytes().get(base.len()) == Some(&b'/'))
}

#[derive(Debug, Clone)]
pub struct VirtualFileSystem {
    root: VfsNode,
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFileSystem {
    /// An empty tree containing only `/`.
    pub fn new() -> Self {
        Self {
            root: VfsNode::directory(),
        }
    }

    /// The starter layout every new lab session gets.
    pub fn seeded(home: &str) -> Self {
        let mut vfs = Self::new();
        let home = Self::resolve(home, "/");
        // Writes below cannot miss: every parent is created first.
        let _ = vfs.mkdir_all(&home);
        let _ = vfs.write(
            &join(&home, "readme.txt"),
            "Welcome to your lab workspace.\nType 'help' to see the available commands.\n",
        );
        let examples = join(&home, "examples");
        let _ = vfs.mkdir(&examples);
        let _ = vfs.write(&join(&examples, "hello.py"), "print(\"Hello, world!\")\n");
        let _ = vfs.mkdir_all("/etc");
        let _ = vfs.write("/etc/passwd", "root:x:0:0:root:/root:/bin/sh\n");
        let _ = vfs.mkdir_all("/tmp");
        vfs
    }

    /// Build a file system from a serialized tree, validating it first.
    pub fn from_tree(tree: VfsNode) -> VfsResult<Self> {
        validate(&tree, "/")?;
        if !matches!(tree, VfsNode::Directory { .. }) {
            return Err(VfsError::InvalidTree("root must be a directory".into()));
        }
        Ok(Self { root: tree })
    }

    /// Normalize `path` against `cwd`.
    ///
    /// `.` segments are dropped and `..` pops the previous segment; a `..`
    /// at `/` stays at `/`.
    pub fn resolve(path: &str, cwd: &str) -> VfsPath {
        let mut stack: Vec<&str> = Vec::new();
        let base = if path.starts_with('/') { "" } else { cwd };
        for seg in segments(base).chain(segments(path)) {
            match seg {
                "." => {}
                ".." => {
                    stack.pop();
                }
                other => stack.push(other),
            }
        }
        if stack.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", stack.join("/"))
        }
    }

    fn node(&self, path: &str) -> Option<&VfsNode> {
        let path = Self::resolve(path, "/");
        let mut node = &self.root;
        for seg in segments(&path) {
            match node {
                VfsNode::Directory { children } => node = children.get(seg)?,
                VfsNode::File { .. } => return None,
            }
        }
        Some(node)
    }

    fn node_mut(&mut self, path: &str) -> Option<&mut VfsNode> {
        let mut node = &mut self.root;
        for seg in segments(path) {
            match node {
                VfsNode::Directory { children } => node = children.get_mut(seg)?,
                VfsNode::File { .. } => return None,
            }
        }
        Some(node)
    }

    /// The children map of `path`'s parent plus the final name.
    fn parent_dir_mut(
        &mut self,
        path: &str,
    ) -> VfsResult<(&mut IndexMap<String, VfsNode>, String)> {
        let path = Self::resolve(path, "/");
        let (parent, name) =
            split_parent(&path).ok_or_else(|| VfsError::AlreadyExists(path.clone()))?;
        match self.node_mut(&parent) {
            Some(VfsNode::Directory { children }) => Ok((children, name)),
            Some(VfsNode::File { .. }) => Err(VfsError::NotADirectory(parent)),
            None => Err(VfsError::NotFound(parent)),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.node(path), Some(VfsNode::Directory { .. }))
    }

    pub fn read(&self, path: &str) -> VfsResult<&str> {
        match self.node(path) {
            Some(VfsNode::File { content, .. }) => Ok(content.as_str()),
            Some(VfsNode::Directory { .. }) => {
                Err(VfsError::IsADirectory(Self::resolve(path, "/")))
            }
            None => Err(VfsError::NotFound(Self::resolve(path, "/"))),
        }
    }

    /// Create or overwrite a file. The parent directory must exist.
    pub fn write(&mut self, path: &str, content: &str) -> VfsResult<()> {
        let full = Self::resolve(path, "/");
        if full == "/" {
            return Err(VfsError::IsADirectory(full));
        }
        let (children, name) = self.parent_dir_mut(&full)?;
        if let Some(VfsNode::Directory { .. }) = children.get(&name) {
            return Err(VfsError::IsADirectory(full));
        }
        children.insert(name, VfsNode::file(content));
        Ok(())
    }

    /// Append to a file, creating it when absent.
    pub fn append(&mut self, path: &str, content: &str) -> VfsResult<()> {
        let existing = match self.read(path) {
            Ok(current) => current.to_string(),
            Err(VfsError::NotFound(_)) => String::new(),
            Err(e) => return Err(e),
        };
        self.write(path, &(existing + content))
    }

    pub fn list(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        match self.node(path) {
            Some(VfsNode::Directory { children }) => Ok(children
                .iter()
                .map(|(name, node)| DirEntry {
                    name: name.clone(),
                    kind: node.kind(),
                })
                .collect()),
            Some(VfsNode::File { .. }) => Err(VfsError::NotADirectory(Self::resolve(path, "/"))),
            None => Err(VfsError::NotFound(Self::resolve(path, "/"))),
        }
    }

    pub fn mkdir(&mut self, path: &str) -> VfsResult<()> {
        let full = Self::resolve(path, "/");
        let (children, name) = self.parent_dir_mut(&full)?;
        if children.contains_key(&name) {
            return Err(VfsError::AlreadyExists(full));
        }
        children.insert(name, VfsNode::directory());
        Ok(())
    }

    /// `mkdir -p`: create every missing directory along `path`.
    pub fn mkdir_all(&mut self, path: &str) -> VfsResult<()> {
        let full = Self::resolve(path, "/");
        let mut current = String::from("/");
        for seg in segments(&full) {
            current = join(&current, seg);
            match self.node(&current) {
                Some(VfsNode::Directory { .. }) => {}
                Some(VfsNode::File { .. }) => return Err(VfsError::NotADirectory(current)),
                None => self.mkdir(&current)?,
            }
        }
        Ok(())
    }

    /// Create an empty file, or refresh the timestamp of an existing one.
    pub fn touch(&mut self, path: &str) -> VfsResult<()> {
        let (children, name) = match self.parent_dir_mut(path) {
            Ok(found) => found,
            // `/` itself exists.
            Err(VfsError::AlreadyExists(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match children.get_mut(&name) {
            Some(VfsNode::File { modified_at, .. }) => *modified_at = Utc::now(),
            Some(VfsNode::Directory { .. }) => {}
            None => {
                children.insert(name, VfsNode::file(""));
            }
        }
        Ok(())
    }

    /// Every path in the tree, depth-first in insertion order.
    pub fn paths(&self) -> Vec<(VfsPath, EntryKind)> {
        fn walk(node: &VfsNode, path: &str, out: &mut Vec<(VfsPath, EntryKind)>) {
            out.push((path.to_string(), node.kind()));
            if let VfsNode::Directory { children } = node {
                for (name, child) in children {
                    walk(child, &join(path, name), out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.root, "/", &mut out);
        out
    }

    pub fn serialize(&self) -> VfsNode {
        self.root.clone()
    }

    /// Replace the whole tree. On error the current tree is kept.
    pub fn deserialize(&mut self, tree: VfsNode) -> VfsResult<()> {
        *self = Self::from_tree(tree)?;
        Ok(())
    }
}

fn validate(node: &VfsNode, path: &str) -> VfsResult<()> {
    if let VfsNode::Directory { children } = node {
        for (name, child) in children {
            if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                return Err(VfsError::InvalidTree(format!(
                    "bad entry name {:?} under {}",
                    name, path
                )));
            }
            validate(child, &join(path, name))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_handles_dots_and_relative_paths() {
        assert_eq!(VirtualFileSystem::resolve("docs", "/home/student"), "/home/student/docs");
        assert_eq!(VirtualFileSystem::resolve("./a/../b", "/home"), "/home/b");
        assert_eq!(VirtualFileSystem::resolve("/x//y/", "/home"), "/x/y");
        assert_eq!(VirtualFileSystem::resolve("", "/home/student"), "/home/student");
        assert_eq!(VirtualFileSystem::resolve("../../../..", "/home/student"), "/");
    }

    #[test]
    fn resolve_is_idempotent() {
        let cwd = "/home/student";
        for p in ["a/b/../c", "/etc/./passwd", "../..", ".", "x/y/z/../../q", "/"] {
            let once = VirtualFileSystem::resolve(p, cwd);
            assert_eq!(VirtualFileSystem::resolve(&once, cwd), once);
        }
    }

    #[test]
    fn is_within_is_segment_aware() {
        assert!(is_within("/home/student", "/home/student"));
        assert!(is_within("/home/student/a", "/home/student"));
        assert!(!is_within("/home/student2", "/home/student"));
        assert!(!is_within("/home", "/home/student"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn write_requires_existing_parent() {
        let mut vfs = VirtualFileSystem::new();
        assert_eq!(
            vfs.write("/missing/file.txt", "x"),
            Err(VfsError::NotFound("/missing".into()))
        );
        vfs.mkdir("/docs").unwrap();
        vfs.write("/docs/file.txt", "hello").unwrap();
        assert_eq!(vfs.read("/docs/file.txt").unwrap(), "hello");
    }

    #[test]
    fn write_onto_directory_is_rejected() {
        let mut vfs = VirtualFileSystem::new();
        vfs.mkdir("/docs").unwrap();
        assert_eq!(vfs.write("/docs", "x"), Err(VfsError::IsADirectory("/docs".into())));
        assert_eq!(vfs.read("/docs"), Err(VfsError::IsADirectory("/docs".into())));
    }

    #[test]
    fn mkdir_reports_existing_and_missing_parent() {
        let mut vfs = VirtualFileSystem::new();
        vfs.mkdir("/a").unwrap();
        assert_eq!(vfs.mkdir("/a"), Err(VfsError::AlreadyExists("/a".into())));
        assert_eq!(vfs.mkdir("/b/c"), Err(VfsError::NotFound("/b".into())));
    }

    #[test]
    fn touch_keeps_existing_content() {
        let mut vfs = VirtualFileSystem::new();
        vfs.write("/notes.txt", "keep me").unwrap();
        vfs.touch("/notes.txt").unwrap();
        assert_eq!(vfs.read("/notes.txt").unwrap(), "keep me");
        vfs.touch("/empty.txt").unwrap();
        assert_eq!(vfs.read("/empty.txt").unwrap(), "");
        assert_eq!(vfs.touch("/nope/x"), Err(VfsError::NotFound("/nope".into())));
    }

    #[test]
    fn list_preserves_insertion_order() {
        let mut vfs = VirtualFileSystem::new();
        vfs.write("/zeta", "").unwrap();
        vfs.mkdir("/alpha").unwrap();
        vfs.write("/mid", "").unwrap();
        let names: Vec<_> = vfs.list("/").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(vfs.list("/zeta"), Err(VfsError::NotADirectory("/zeta".into())));
    }

    #[test]
    fn append_creates_then_extends() {
        let mut vfs = VirtualFileSystem::new();
        vfs.append("/log", "one\n").unwrap();
        vfs.append("/log", "two\n").unwrap();
        assert_eq!(vfs.read("/log").unwrap(), "one\ntwo\n");
    }

    #[test]
    fn serialize_round_trip_preserves_paths_contents_and_order() {
        let mut vfs = VirtualFileSystem::seeded("/home/student");
        vfs.mkdir_all("/home/student/projects/deep/nested").unwrap();
        vfs.write("/home/student/projects/deep/nested/a.txt", "A").unwrap();
        vfs.write("/home/student/projects/b.txt", "B").unwrap();

        let json = serde_json::to_string(&vfs.serialize()).unwrap();
        let tree: VfsNode = serde_json::from_str(&json).unwrap();
        let mut restored = VirtualFileSystem::new();
        restored.deserialize(tree).unwrap();

        assert_eq!(restored.paths(), vfs.paths());
        for (path, kind) in vfs.paths() {
            if kind == EntryKind::File {
                assert_eq!(restored.read(&path).unwrap(), vfs.read(&path).unwrap());
            }
        }
    }

    #[test]
    fn deserialize_rejects_bad_trees_and_keeps_state() {
        let mut vfs = VirtualFileSystem::seeded("/home/student");
        let before = vfs.paths();
        assert!(vfs.deserialize(VfsNode::file("not a dir")).is_err());

        let mut children = IndexMap::new();
        children.insert("a/b".to_string(), VfsNode::file(""));
        assert!(vfs.deserialize(VfsNode::Directory { children }).is_err());
        assert_eq!(vfs.paths(), before);
    }

    #[test]
    fn seeded_layout_has_student_home() {
        let vfs = VirtualFileSystem::seeded("/home/student");
        let names: Vec<_> = vfs
            .list("/home/student")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["readme.txt", "examples"]);
        assert!(vfs.is_dir("/tmp"));
        assert!(vfs.exists("/etc/passwd"));
    }
}
