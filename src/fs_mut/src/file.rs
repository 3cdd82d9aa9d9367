use std::io::Cursor;
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use log::{debug, warn};
use perm_lib::{BlobRef, Claim, FileReader, FsError, FsResult, ATTR_CONTENT};

use crate::dir::MutDir;
use crate::handle::WriteHandle;
use crate::mut_fs::MutFs;
use crate::node::{NodeAttr, NodeKind};

pub(crate) struct FileState {
    pub(crate) parent: Weak<MutDir>,
    pub(crate) name: String,
    pub(crate) symlink: bool,
    pub(crate) target: String,
    pub(crate) content: Option<BlobRef>,
    pub(crate) size: u64,
    pub(crate) mtime: Option<SystemTime>,
    pub(crate) atime: Option<SystemTime>,
}

/// A mutable file or symlink. The current bytes are whatever content
/// blob the permanode's `camliContent` attribute points at; an open
/// write handle sees its scratch instead.
pub struct MutFile {
    fs: Arc<MutFs>,
    permanode: BlobRef,
    state: Mutex<FileState>,
}

/// Fields a Setattr may change, per the kernel's valid mask.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetattrRequest {
    pub mtime: Option<SystemTime>,
    pub atime: Option<SystemTime>,
    pub size: Option<u64>,
}

impl MutFile {
    pub(crate) fn new_regular(
        fs: Arc<MutFs>,
        permanode: BlobRef,
        parent: Weak<MutDir>,
        name: impl Into<String>,
        content: Option<BlobRef>,
        size: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            fs,
            permanode,
            state: Mutex::new(FileState {
                parent,
                name: name.into(),
                symlink: false,
                target: String::new(),
                content,
                size,
                mtime: None,
                atime: None,
            }),
        })
    }

    pub(crate) fn new_symlink(
        fs: Arc<MutFs>,
        permanode: BlobRef,
        parent: Weak<MutDir>,
        name: impl Into<String>,
        target: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            fs,
            permanode,
            state: Mutex::new(FileState {
                parent,
                name: name.into(),
                symlink: true,
                target,
                content: None,
                size: 0,
                mtime: None,
                atime: None,
            }),
        })
    }

    pub fn permanode(&self) -> &BlobRef {
        &self.permanode
    }

    pub fn inode(&self) -> u64 {
        self.permanode.to_inode()
    }

    pub fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    pub fn parent(&self) -> Option<Arc<MutDir>> {
        self.state.lock().unwrap().parent.upgrade()
    }

    pub fn is_symlink(&self) -> bool {
        self.state.lock().unwrap().symlink
    }

    pub(crate) fn kind(&self) -> NodeKind {
        if self.is_symlink() {
            NodeKind::Symlink
        } else {
            NodeKind::File
        }
    }

    pub fn attr(&self) -> NodeAttr {
        let start = self.fs.server_start();
        let state = self.state.lock().unwrap();
        let size = state.size;
        let blocks = if size > 0 { size / 512 + 1 } else { 0 };
        let mtime = state.mtime.unwrap_or(start);
        let atime = state.atime.or(state.mtime).unwrap_or(start);
        NodeAttr {
            inode: self.permanode.to_inode(),
            kind: if state.symlink {
                NodeKind::Symlink
            } else {
                NodeKind::File
            },
            perm: 0o600,
            uid: self.fs.uid(),
            gid: self.fs.gid(),
            size,
            blocks,
            atime,
            mtime,
            ctime: start,
            crtime: start,
        }
    }

    /// Open for reading: a streaming reader over the current content
    /// blob, bypassing the scratch mechanism. A file with no content
    /// yields EOF immediately.
    pub async fn open_read(&self) -> FsResult<FileReader> {
        self.fs.counters().incr_open();
        let content = { self.state.lock().unwrap().content.clone() };
        let reader: FileReader = match content {
            Some(content) => match self.fs.files().open_file_reader(&content).await {
                Ok(reader) => reader,
                Err(err) => {
                    self.fs.counters().incr_error();
                    warn!("open {}: {}", self.permanode, err);
                    return Err(err);
                }
            },
            None => Box::pin(Cursor::new(Vec::new())),
        };
        self.fs.counters().incr_read_only();
        Ok(reader)
    }

    /// Open for writing: a handle whose scratch is seeded with the
    /// current content. The content reader is closed once copied.
    pub async fn open_rw(self: &Arc<Self>) -> FsResult<WriteHandle> {
        self.fs.counters().incr_open();
        let content = { self.state.lock().unwrap().content.clone() };
        let seed = match content {
            Some(content) => match self.fs.files().open_file_reader(&content).await {
                Ok(reader) => Some(reader),
                Err(err) => {
                    self.fs.counters().incr_error();
                    warn!("open {}: {}", self.permanode, err);
                    return Err(err);
                }
            },
            None => None,
        };
        let handle = match WriteHandle::new(self.clone(), seed).await {
            Ok(handle) => handle,
            Err(err) => {
                self.fs.counters().incr_error();
                return Err(err);
            }
        };
        self.fs.counters().incr_read_write();
        Ok(handle)
    }

    pub fn readlink(&self) -> FsResult<String> {
        let state = self.state.lock().unwrap();
        if !state.symlink {
            return Err(FsError::InvalidState(
                "readlink on a node that's not a symlink".to_string(),
            ));
        }
        Ok(state.target.clone())
    }

    /// Apply a Setattr. Assigning a size only changes the reported size;
    /// actual truncation of pending bytes goes through the write
    /// handle's Truncate.
    pub fn setattr(&self, req: SetattrRequest) -> NodeAttr {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(mtime) = req.mtime {
                state.mtime = Some(mtime);
            }
            if let Some(atime) = req.atime {
                state.atime = Some(atime);
            }
            if let Some(size) = req.size {
                state.size = size;
            }
        }
        self.attr()
    }

    /// Rebind the file to a new content blob. This is the commit point
    /// that makes a write durable: the claim follows the in-memory
    /// assignment.
    pub(crate) async fn set_content(&self, content: BlobRef, size: u64) -> FsResult<()> {
        let claim = {
            let mut state = self.state.lock().unwrap();
            state.content = Some(content.clone());
            state.size = size;
            Claim::set_attribute(&self.permanode, ATTR_CONTENT, content.as_str())
        };
        self.fs.claims().upload_and_sign_claim(claim).await?;
        Ok(())
    }

    /// Monotonic maximum assignment, used while writes are streaming in
    /// ahead of the commit.
    pub(crate) fn set_size_at_least(&self, size: u64) {
        let mut state = self.state.lock().unwrap();
        if size > state.size {
            debug!("{}: size {} -> {}", self.permanode, state.size, size);
            state.size = size;
        }
    }

    pub(crate) fn set_parent(&self, parent: &Arc<MutDir>, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.parent = Arc::downgrade(parent);
        state.name = name.to_string();
    }

    pub(crate) fn fs(&self) -> &Arc<MutFs> {
        &self.fs
    }
}
