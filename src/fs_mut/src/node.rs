use std::sync::Arc;
use std::time::SystemTime;

use perm_lib::BlobRef;

use crate::dir::MutDir;
use crate::file::MutFile;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
}

/// Kernel-facing attributes of a node.
#[derive(Debug, Clone)]
pub struct NodeAttr {
    pub inode: u64,
    pub kind: NodeKind,
    pub perm: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// 512-byte blocks backing the reported size.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode: u64,
    pub kind: NodeKind,
}

/// A directory's child: either a subdirectory or a file (symlinks are
/// files with the symlink flag set).
#[derive(Clone)]
pub enum MutNode {
    Dir(Arc<MutDir>),
    File(Arc<MutFile>),
}

impl std::fmt::Debug for MutNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutNode::Dir(d) => write!(f, "MutNode::Dir({})", d.inode()),
            MutNode::File(file) => write!(f, "MutNode::File({})", file.inode()),
        }
    }
}

impl MutNode {
    pub fn inode(&self) -> u64 {
        self.permanode().to_inode()
    }

    pub fn permanode(&self) -> &BlobRef {
        match self {
            MutNode::Dir(dir) => dir.permanode(),
            MutNode::File(file) => file.permanode(),
        }
    }

    pub fn permanode_string(&self) -> String {
        self.permanode().as_str().to_string()
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            MutNode::Dir(_) => NodeKind::Dir,
            MutNode::File(file) => file.kind(),
        }
    }

    pub fn attr(&self) -> NodeAttr {
        match self {
            MutNode::Dir(dir) => dir.attr(),
            MutNode::File(file) => file.attr(),
        }
    }

    pub fn as_dir(&self) -> Option<&Arc<MutDir>> {
        match self {
            MutNode::Dir(dir) => Some(dir),
            MutNode::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&Arc<MutFile>> {
        match self {
            MutNode::File(file) => Some(file),
            MutNode::Dir(_) => None,
        }
    }

    /// Identity comparison: same in-memory node, not just same permanode.
    pub(crate) fn same_node(&self, other: &MutNode) -> bool {
        match (self, other) {
            (MutNode::Dir(a), MutNode::Dir(b)) => Arc::ptr_eq(a, b),
            (MutNode::File(a), MutNode::File(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn set_parent(&self, parent: &Arc<MutDir>, name: &str) {
        match self {
            MutNode::Dir(dir) => dir.set_parent(parent, name),
            MutNode::File(file) => file.set_parent(parent, name),
        }
    }
}
