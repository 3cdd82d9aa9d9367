use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use fs_mut::{
    MutDir, MutFile, MutFs, MutNode, NodeAttr, NodeKind, SetattrRequest, WriteHandle, SETATTR_TTL,
};
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::{EBADF, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR};
use log::{debug, info, warn};
use perm_lib::{BlobRef, FileReader, FsError, FsResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::runtime::Runtime;

use crate::remote::RemoteClient;

const TTL: Duration = Duration::from_secs(1);
pub const DEFAULT_CONFIG_PATH: &str = "/etc/permfs/permfs.json";

/// The kernel addresses the mount root as inode 1; every other node is
/// addressed by its permanode projection.
const ROOT_INODE: u64 = 1;

#[derive(Debug, Clone)]
pub struct DaemonRunOptions {
    pub mountpoint: PathBuf,
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    #[serde(alias = "server_url", alias = "blob_server")]
    pub server: String,
    #[serde(alias = "root", alias = "root_blobref")]
    pub root_permanode: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:3179".to_string(),
            root_permanode: String::new(),
        }
    }
}

struct NodeTable {
    nodes: RwLock<HashMap<u64, MutNode>>,
}

impl NodeTable {
    fn new(root: Arc<MutDir>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INODE, MutNode::Dir(root));
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    fn get(&self, ino: u64) -> Option<MutNode> {
        self.nodes.read().ok()?.get(&ino).cloned()
    }

    /// Intern a node under its inode projection and return that inode.
    fn remember(&self, node: &MutNode) -> u64 {
        let ino = node.inode();
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.insert(ino, node.clone());
        }
        ino
    }
}

enum OpenHandle {
    Read(FileReader),
    Write(WriteHandle),
}

struct HandleTable {
    next_fh: AtomicU64,
    handles: Mutex<HashMap<u64, OpenHandle>>,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, handle: OpenHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut map) = self.handles.lock() {
            map.insert(fh, handle);
        }
        fh
    }

    fn with_handle_mut<F, T>(&self, fh: u64, f: F) -> Result<T, i32>
    where
        F: FnOnce(&mut OpenHandle) -> Result<T, i32>,
    {
        let mut map = self.handles.lock().map_err(|_| EIO)?;
        let handle = map.get_mut(&fh).ok_or(EBADF)?;
        f(handle)
    }

    fn remove(&self, fh: u64) -> Option<OpenHandle> {
        self.handles.lock().ok()?.remove(&fh)
    }
}

pub struct FsDaemon {
    runtime: Runtime,
    nodes: NodeTable,
    handles: HandleTable,
}

fn map_fs_err(err: FsError) -> i32 {
    match err {
        FsError::NotFound(_) => ENOENT,
        FsError::InvalidParam(_) => EINVAL,
        FsError::IoError(_)
        | FsError::RemoteError(_)
        | FsError::DecodeError(_)
        | FsError::InvalidState(_) => EIO,
    }
}

fn utf8_name(name: &std::ffi::OsStr) -> Result<&str, i32> {
    name.to_str().ok_or(EINVAL)
}

fn build_attr(ino: u64, attr: &NodeAttr) -> FileAttr {
    let (kind, nlink) = match attr.kind {
        NodeKind::Dir => (FileType::Directory, 2),
        NodeKind::File => (FileType::RegularFile, 1),
        NodeKind::Symlink => (FileType::Symlink, 1),
    };
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind,
        perm: attr.perm,
        nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        flags: 0,
        blksize: 512,
    }
}

impl FsDaemon {
    pub fn new(runtime: Runtime, root: Arc<MutDir>) -> Self {
        Self {
            runtime,
            nodes: NodeTable::new(root),
            handles: HandleTable::new(),
        }
    }

    fn node_of(&self, ino: u64) -> Result<MutNode, i32> {
        self.nodes.get(ino).ok_or(ENOENT)
    }

    fn dir_of(&self, ino: u64) -> Result<Arc<MutDir>, i32> {
        match self.nodes.get(ino) {
            Some(MutNode::Dir(dir)) => Ok(dir),
            Some(MutNode::File(_)) => Err(ENOTDIR),
            None => Err(ENOENT),
        }
    }

    fn file_of(&self, ino: u64) -> Result<Arc<MutFile>, i32> {
        match self.nodes.get(ino) {
            Some(MutNode::File(file)) => Ok(file),
            Some(MutNode::Dir(_)) => Err(EISDIR),
            None => Err(ENOENT),
        }
    }

    pub(crate) fn lookup_entry(&self, parent: u64, name: &str) -> Result<(u64, FileAttr), i32> {
        let dir = self.dir_of(parent)?;
        let node = self.runtime.block_on(dir.lookup(name)).map_err(map_fs_err)?;
        let ino = self.nodes.remember(&node);
        Ok((ino, build_attr(ino, &node.attr())))
    }

    pub(crate) fn getattr_entry(&self, ino: u64) -> Result<FileAttr, i32> {
        let node = self.node_of(ino)?;
        Ok(build_attr(ino, &node.attr()))
    }

    pub(crate) fn readdir_entries(
        &self,
        ino: u64,
        offset: i64,
    ) -> Result<Vec<(u64, FileType, String, i64)>, i32> {
        let dir = self.dir_of(ino)?;
        let mut entries = self.runtime.block_on(dir.readdir()).map_err(map_fs_err)?;
        // map iteration order varies between calls; sort so paging by
        // offset is stable
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut out = Vec::new();
        let mut idx: i64 = offset;
        if offset == 0 {
            out.push((ino, FileType::Directory, ".".to_string(), 1));
            out.push((ino, FileType::Directory, "..".to_string(), 2));
            idx = 2;
        }
        for entry in entries.into_iter().skip((idx - 2).max(0) as usize) {
            let kind = match entry.kind {
                NodeKind::Dir => FileType::Directory,
                NodeKind::File => FileType::RegularFile,
                NodeKind::Symlink => FileType::Symlink,
            };
            idx += 1;
            out.push((entry.inode, kind, entry.name, idx));
        }
        Ok(out)
    }

    pub(crate) fn create_entry(
        &self,
        parent: u64,
        name: &str,
    ) -> Result<(u64, FileAttr, u64), i32> {
        let dir = self.dir_of(parent)?;
        let (file, handle) = self.runtime.block_on(dir.create(name)).map_err(|err| {
            warn!("create {:?}: {}", name, err);
            map_fs_err(err)
        })?;
        let node = MutNode::File(file);
        let ino = self.nodes.remember(&node);
        let fh = self.handles.insert(OpenHandle::Write(handle));
        Ok((ino, build_attr(ino, &node.attr()), fh))
    }

    pub(crate) fn mkdir_entry(&self, parent: u64, name: &str) -> Result<(u64, FileAttr), i32> {
        let dir = self.dir_of(parent)?;
        let child = self.runtime.block_on(dir.mkdir(name)).map_err(|err| {
            warn!("mkdir {:?}: {}", name, err);
            map_fs_err(err)
        })?;
        let node = MutNode::Dir(child);
        let ino = self.nodes.remember(&node);
        Ok((ino, build_attr(ino, &node.attr())))
    }

    pub(crate) fn symlink_entry(
        &self,
        parent: u64,
        name: &str,
        target: &str,
    ) -> Result<(u64, FileAttr), i32> {
        let dir = self.dir_of(parent)?;
        let link = self
            .runtime
            .block_on(dir.symlink(name, target))
            .map_err(|err| {
                warn!("symlink {:?}: {}", name, err);
                map_fs_err(err)
            })?;
        let node = MutNode::File(link);
        let ino = self.nodes.remember(&node);
        Ok((ino, build_attr(ino, &node.attr())))
    }

    pub(crate) fn readlink_entry(&self, ino: u64) -> Result<Vec<u8>, i32> {
        let file = self.file_of(ino)?;
        file.readlink().map(String::into_bytes).map_err(map_fs_err)
    }

    pub(crate) fn unlink_entry(&self, parent: u64, name: &str) -> Result<(), i32> {
        let dir = self.dir_of(parent)?;
        self.runtime.block_on(dir.remove(name)).map_err(|err| {
            warn!("remove {:?}: {}", name, err);
            map_fs_err(err)
        })
    }

    pub(crate) fn rename_entry(
        &self,
        parent: u64,
        name: &str,
        newparent: u64,
        newname: &str,
    ) -> Result<(), i32> {
        let src = self.dir_of(parent)?;
        let dst = match self.nodes.get(newparent) {
            Some(MutNode::Dir(dir)) => dir,
            Some(MutNode::File(_)) => {
                warn!(
                    "rename {:?}: destination {} is not a directory",
                    name, newparent
                );
                return Err(EIO);
            }
            None => return Err(ENOENT),
        };
        self.runtime
            .block_on(src.rename(name, &dst, newname))
            .map_err(|err| {
                warn!("rename {:?} -> {:?}: {}", name, newname, err);
                map_fs_err(err)
            })
    }

    pub(crate) fn open_entry(&self, ino: u64, flags: i32) -> Result<u64, i32> {
        let file = self.file_of(ino)?;
        let accmode = flags & libc::O_ACCMODE;
        if accmode == libc::O_RDONLY {
            let reader = self
                .runtime
                .block_on(file.open_read())
                .map_err(map_fs_err)?;
            Ok(self.handles.insert(OpenHandle::Read(reader)))
        } else {
            let handle = self.runtime.block_on(file.open_rw()).map_err(map_fs_err)?;
            Ok(self.handles.insert(OpenHandle::Write(handle)))
        }
    }

    pub(crate) fn read_fh(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        self.handles.with_handle_mut(fh, |handle| match handle {
            OpenHandle::Read(reader) => self
                .runtime
                .block_on(async {
                    reader.seek(SeekFrom::Start(offset as u64)).await?;
                    let mut buf = vec![0u8; size as usize];
                    let mut read_total = 0usize;
                    loop {
                        let n = reader.read(&mut buf[read_total..]).await?;
                        if n == 0 {
                            break;
                        }
                        read_total += n;
                        if read_total == buf.len() {
                            break;
                        }
                    }
                    buf.truncate(read_total);
                    Ok::<_, std::io::Error>(buf)
                })
                .map_err(|err| {
                    warn!("read: {}", err);
                    EIO
                }),
            OpenHandle::Write(handle) => handle
                .read(offset as u64, size as usize)
                .map_err(map_fs_err),
        })
    }

    pub(crate) fn write_fh(&self, fh: u64, offset: i64, data: &[u8]) -> Result<usize, i32> {
        self.handles.with_handle_mut(fh, |handle| match handle {
            OpenHandle::Write(handle) => handle.write(offset as u64, data).map_err(map_fs_err),
            OpenHandle::Read(_) => Err(EBADF),
        })
    }

    pub(crate) fn fsync_fh(&self, fh: u64) -> Result<(), i32> {
        self.handles.with_handle_mut(fh, |handle| match handle {
            OpenHandle::Write(handle) => {
                self.runtime.block_on(handle.fsync()).map_err(map_fs_err)
            }
            OpenHandle::Read(_) => Ok(()),
        })
    }

    pub(crate) fn release_fh(&self, fh: u64) -> Result<(), i32> {
        if let Some(handle) = self.handles.remove(fh) {
            if let OpenHandle::Write(mut handle) = handle {
                self.runtime
                    .block_on(handle.release())
                    .map_err(map_fs_err)?;
            }
        }
        Ok(())
    }

    pub(crate) fn setattr_entry(
        &self,
        ino: u64,
        size: Option<u64>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
        fh: Option<u64>,
    ) -> Result<FileAttr, i32> {
        match self.node_of(ino)? {
            MutNode::Dir(dir) => Ok(build_attr(ino, &dir.attr())),
            MutNode::File(file) => {
                if let (Some(new_size), Some(fh)) = (size, fh) {
                    // the kernel delivers truncate as a sized setattr on
                    // an open handle
                    self.handles.with_handle_mut(fh, |handle| match handle {
                        OpenHandle::Write(handle) => {
                            handle.truncate(new_size).map_err(map_fs_err)
                        }
                        OpenHandle::Read(_) => Ok(()),
                    })?;
                }
                let attr = file.setattr(SetattrRequest { mtime, atime, size });
                Ok(build_attr(ino, &attr))
            }
        }
    }
}

impl Filesystem for FsDaemon {
    fn lookup(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: ReplyEntry,
    ) {
        let name = match utf8_name(name) {
            Ok(v) => v,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.lookup_entry(parent, name) {
            Ok((_ino, attr)) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.getattr_entry(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr ino={}, size={:?}, fh={:?}", ino, size, fh);
        let now = SystemTime::now();
        let atime = atime.map(|v| match v {
            TimeOrNow::SpecificTime(t) => t,
            TimeOrNow::Now => now,
        });
        let mtime = mtime.map(|v| match v {
            TimeOrNow::SpecificTime(t) => t,
            TimeOrNow::Now => now,
        });
        match self.setattr_entry(ino, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&SETATTR_TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.readdir_entries(ino, offset) {
            Ok(entries) => {
                for (inode, file_type, name, next_offset) in entries {
                    if reply.add(inode, next_offset, file_type, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => reply.error(code),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.open_entry(ino, flags) {
            // reply flags stay zero: append and partial writes need the
            // page cache, never direct I/O
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match utf8_name(name) {
            Ok(v) => v,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.create_entry(parent, name) {
            Ok((_ino, attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match utf8_name(name) {
            Ok(v) => v,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.mkdir_entry(parent, name) {
            Ok((_ino, attr)) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &std::ffi::OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let name = match utf8_name(link_name) {
            Ok(v) => v,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let target = match target.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.symlink_entry(parent, name, target) {
            Ok((_ino, attr)) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.readlink_entry(ino) {
            Ok(target) => reply.data(&target),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: ReplyEmpty,
    ) {
        let name = match utf8_name(name) {
            Ok(v) => v,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.unlink_entry(parent, name) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        self.unlink(req, parent, name, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        newparent: u64,
        newname: &std::ffi::OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = match utf8_name(name) {
            Ok(v) => v,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let newname = match utf8_name(newname) {
            Ok(v) => v,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        match self.rename_entry(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_fh(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.write_fh(fh, offset, data) {
            Ok(n) => reply.written(n as u32),
            Err(code) => reply.error(code),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // commits happen on fsync and release
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fsync_fh(fh) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.release_fh(fh) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }
}

fn read_json_config<T: DeserializeOwned>(path: &Path) -> FsResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FsError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| FsError::DecodeError(format!("parse {} failed: {}", path.display(), e)))
}

pub fn run_fs_daemon(options: DaemonRunOptions) -> FsResult<()> {
    let runtime = Runtime::new().map_err(|e| FsError::IoError(e.to_string()))?;

    let config: DaemonConfig = read_json_config(&options.config_path)?;
    if config.root_permanode.is_empty() {
        return Err(FsError::InvalidParam(format!(
            "config {} is missing root_permanode",
            options.config_path.display()
        )));
    }
    let root_permanode = BlobRef::parse(&config.root_permanode)?;

    let client = Arc::new(RemoteClient::new(config.server.clone())?);
    let fs = MutFs::new(client.clone(), client.clone(), client.clone());
    let root = fs.root(root_permanode);

    std::fs::create_dir_all(&options.mountpoint).map_err(|e| {
        FsError::IoError(format!(
            "create mountpoint {} failed: {}",
            options.mountpoint.display(),
            e
        ))
    })?;

    let filesystem = FsDaemon::new(runtime, root);
    let mount_options = vec![
        MountOption::FSName("permfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    #[cfg(not(target_os = "macos"))]
    let mut mount_options = mount_options;
    #[cfg(not(target_os = "macos"))]
    mount_options.push(MountOption::AutoUnmount);

    info!(
        "mounting permfs at {:?}, server={}, config={}",
        options.mountpoint,
        config.server,
        options.config_path.display()
    );
    match fuser::spawn_mount2(filesystem, &options.mountpoint, &mount_options) {
        Ok(session) => {
            println!("permfs mounted at {:?}", options.mountpoint);
            session.join();
            Ok(())
        }
        Err(err) => Err(FsError::IoError(format!("mount failed: {}", err))),
    }
}
