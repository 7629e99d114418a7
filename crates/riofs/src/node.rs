//! Synthetic tree primitives.
//!
//! The tree is a plain ordered hierarchy of directories and files. File
//! behavior lives behind the [`FileOps`] trait; nodes only carry naming and
//! structure. Node identity is the node itself (`Arc` pointer), not its
//! name: two files called `ctl` in different directories are distinct.

use {
    crate::error::{Error, Result},
    async_trait::async_trait,
    bitflags::bitflags,
    std::sync::{Arc, RwLock},
};

bitflags! {
    /// Open mode requested by the client.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        const READ  = 0x01;
        const WRITE = 0x02;
        const TRUNC = 0x10;
    }
}

impl OpenMode {
    pub fn rdwr() -> Self {
        OpenMode::READ | OpenMode::WRITE
    }
}

/// Behavior of a synthetic file.
///
/// `fid` is the server-assigned handle performing the operation; files that
/// keep per-handle scratch (streaming parsers, cached reads) key it by this
/// value and free it in [`FileOps::clunk`].
#[async_trait]
pub trait FileOps: Send + Sync {
    /// Read `count` bytes at `offset`. Reading past end-of-content returns
    /// an empty byte string (EOF).
    async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>>;

    /// Write `data` at `offset`. The default is a read-only file.
    async fn write(&self, _fid: u32, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(Error::Permission)
    }

    /// The fid was released. Free any per-fid scratch.
    async fn clunk(&self, _fid: u32) {}

    /// Advisory size for stat-like callers. Streaming files report 0.
    fn size_hint(&self) -> u64 {
        0
    }
}

/// A member of the tree.
#[derive(Clone)]
pub enum Node {
    Dir(Arc<Dir>),
    File(Arc<FileNode>),
}

impl Node {
    pub fn name(&self) -> String {
        match self {
            Node::Dir(d) => d.name.clone(),
            Node::File(f) => f.name.clone(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir(_))
    }

    /// Identity comparison. Equality is by node, never by name.
    pub fn same(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Dir(a), Node::Dir(b)) => Arc::ptr_eq(a, b),
            (Node::File(a), Node::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Follow `components` down from this node.
    pub fn walk(&self, components: &[&str]) -> Result<Node> {
        let mut cur = self.clone();
        for name in components {
            if name.is_empty() || *name == "." {
                continue;
            }
            cur = match &cur {
                Node::Dir(d) => d
                    .child(name)
                    .ok_or_else(|| crate::not_found!("{name}"))?,
                Node::File(_) => return Err(crate::not_found!("{name}")),
            };
        }
        Ok(cur)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Dir(d) => write!(f, "Dir({})", d.name),
            Node::File(n) => write!(f, "File({})", n.name),
        }
    }
}

/// A named file node binding a name to its [`FileOps`].
pub struct FileNode {
    pub name: String,
    pub ops: Arc<dyn FileOps>,
}

impl FileNode {
    pub fn new(name: impl Into<String>, ops: Arc<dyn FileOps>) -> Node {
        Node::File(Arc::new(FileNode {
            name: name.into(),
            ops,
        }))
    }
}

/// A directory. Children are kept in insertion order; listing returns them
/// in that order. The lock is held only to look up or mutate the child
/// list, never across an await.
pub struct Dir {
    pub name: String,
    children: RwLock<Vec<(String, Node)>>,
}

impl Dir {
    pub fn new(name: impl Into<String>) -> Arc<Dir> {
        Arc::new(Dir {
            name: name.into(),
            children: RwLock::new(Vec::new()),
        })
    }

    /// Insert a child, replacing any existing child with the same name.
    pub fn add(&self, node: Node) {
        let name = node.name();
        let mut children = self.children.write().unwrap();
        if let Some(slot) = children.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = node;
        } else {
            children.push((name, node));
        }
    }

    pub fn remove(&self, name: &str) -> Option<Node> {
        let mut children = self.children.write().unwrap();
        let idx = children.iter().position(|(n, _)| n == name)?;
        Some(children.remove(idx).1)
    }

    pub fn child(&self, name: &str) -> Option<Node> {
        let children = self.children.read().unwrap();
        children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node.clone())
    }

    pub fn child_names(&self) -> Vec<String> {
        let children = self.children.read().unwrap();
        children.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Directory read content: one entry per line, directories with a
    /// trailing slash, in insertion order.
    pub fn listing(&self) -> String {
        let children = self.children.read().unwrap();
        let mut out = String::new();
        for (name, node) in children.iter() {
            out.push_str(name);
            if node.is_dir() {
                out.push('/');
            }
            out.push('\n');
        }
        out
    }
}

/// Positional read out of fully-materialized content.
pub(crate) fn slice_at(content: &[u8], offset: u64, count: u32) -> Vec<u8> {
    let len = content.len() as u64;
    if offset >= len {
        return Vec::new();
    }
    let start = offset as usize;
    let end = (offset + count as u64).min(len) as usize;
    content[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;

    #[async_trait]
    impl FileOps for Empty {
        async fn read(&self, _fid: u32, _offset: u64, _count: u32) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn tree() -> Arc<Dir> {
        let root = Dir::new("/");
        let scene = Dir::new("scene");
        scene.add(FileNode::new("parse", Arc::new(Empty)));
        scene.add(FileNode::new("vars", Arc::new(Empty)));
        root.add(FileNode::new("ctl", Arc::new(Empty)));
        root.add(Node::Dir(scene));
        root
    }

    #[test]
    fn walk_resolves_nested_paths() {
        let root = Node::Dir(tree());
        let parse = root.walk(&["scene", "parse"]).unwrap();
        assert_eq!(parse.name(), "parse");
        assert!(!parse.is_dir());
    }

    #[test]
    fn walk_missing_child_is_not_found() {
        let root = Node::Dir(tree());
        assert!(matches!(
            root.walk(&["scene", "nope"]),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn walk_through_file_fails() {
        let root = Node::Dir(tree());
        assert!(root.walk(&["ctl", "x"]).is_err());
    }

    #[test]
    fn listing_preserves_insertion_order() {
        let root = tree();
        assert_eq!(root.listing(), "ctl\nscene/\n");
    }

    #[test]
    fn identity_is_by_node_not_name() {
        let a = FileNode::new("ctl", Arc::new(Empty));
        let b = FileNode::new("ctl", Arc::new(Empty));
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }

    #[test]
    fn add_replaces_same_name() {
        let d = tree();
        let n = FileNode::new("ctl", Arc::new(Empty));
        d.add(n.clone());
        assert!(d.child("ctl").unwrap().same(&n));
        assert_eq!(d.child_names(), vec!["ctl", "scene"]);
    }

    #[test]
    fn slice_at_clamps_and_eofs() {
        let content = b"hello";
        assert_eq!(slice_at(content, 0, 2), b"he");
        assert_eq!(slice_at(content, 3, 100), b"lo");
        assert_eq!(slice_at(content, 5, 10), b"");
        assert_eq!(slice_at(content, 99, 1), b"");
    }
}
