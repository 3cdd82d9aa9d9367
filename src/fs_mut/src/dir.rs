use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Instant, SystemTime};

use log::warn;
use perm_lib::{
    path_attr, BlobRef, Claim, DescribeRequest, DescribeResponse, FsError, FsResult, ATTR_CONTENT,
    ATTR_PATH_PREFIX, ATTR_SYMLINK_TARGET, CAMLI_TYPE_FILE,
};

use crate::file::MutFile;
use crate::handle::WriteHandle;
use crate::mut_fs::MutFs;
use crate::node::{DirEntry, MutNode, NodeAttr, NodeKind};
use crate::POPULATE_INTERVAL;

/// Describe depth used by populate: the directory itself, its child
/// permanodes, and their content blobs.
const DESCRIBE_DEPTH: u32 = 3;

pub(crate) struct DirState {
    pub(crate) parent: Weak<MutDir>,
    pub(crate) name: String,
    pub(crate) last_populated: Option<Instant>,
    pub(crate) children: HashMap<String, MutNode>,
}

/// A mutable directory. Its permanode carries one `camliPath:<name>`
/// attribute per child; edits are expressed as claims on that permanode.
pub struct MutDir {
    fs: Arc<MutFs>,
    permanode: BlobRef,
    state: Mutex<DirState>,
}

impl MutDir {
    pub(crate) fn new(
        fs: Arc<MutFs>,
        permanode: BlobRef,
        parent: Weak<MutDir>,
        name: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            fs,
            permanode,
            state: Mutex::new(DirState {
                parent,
                name: name.into(),
                last_populated: None,
                children: HashMap::new(),
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

    // for log output
    pub(crate) fn full_path(&self) -> String {
        let (parent, name) = {
            let state = self.state.lock().unwrap();
            (state.parent.upgrade(), state.name.clone())
        };
        match parent {
            Some(parent) => format!("{}/{}", parent.full_path(), name),
            None => name,
        }
    }

    pub fn attr(&self) -> NodeAttr {
        let start = self.fs.server_start();
        NodeAttr {
            inode: self.inode(),
            kind: NodeKind::Dir,
            perm: 0o700,
            uid: self.fs.uid(),
            gid: self.fs.gid(),
            size: 0,
            blocks: 0,
            atime: start,
            mtime: start,
            ctime: start,
            crtime: start,
        }
    }

    /// Refresh the children map from the blob store.
    ///
    /// At most one describe per populate interval. The describe runs
    /// outside the node mutex; the freshness stamp is re-checked before
    /// reconciling, so a racing populate that lost simply drops its
    /// results. A describe failure is logged and recovered: the stale map
    /// keeps serving lookups and the stamp stays unset so the next call
    /// retries.
    pub async fn populate(self: &Arc<Self>) -> FsResult<()> {
        {
            let state = self.state.lock().unwrap();
            if let Some(last) = state.last_populated {
                if last.elapsed() < POPULATE_INTERVAL {
                    return Ok(());
                }
            }
        }

        let res = match self
            .fs
            .describer()
            .describe(DescribeRequest {
                blob_ref: self.permanode.clone(),
                depth: DESCRIBE_DEPTH,
            })
            .await
        {
            Ok(res) => res,
            Err(err) => {
                warn!("populate {}: describe failed: {}", self.full_path(), err);
                return Ok(());
            }
        };

        let found = self.children_from_describe(&res)?;

        let mut state = self.state.lock().unwrap();
        if let Some(last) = state.last_populated {
            if last.elapsed() < POPULATE_INTERVAL {
                return Ok(());
            }
        }
        for (name, node) in found {
            // Existing entries win: locally created nodes (and their open
            // write handles) survive a concurrent refresh.
            state.children.entry(name).or_insert(node);
        }
        state.last_populated = Some(Instant::now());
        Ok(())
    }

    fn children_from_describe(
        self: &Arc<Self>,
        res: &DescribeResponse,
    ) -> FsResult<Vec<(String, MutNode)>> {
        let described = res.get(&self.permanode).ok_or_else(|| {
            FsError::RemoteError(format!("directory {} not described", self.permanode))
        })?;
        let mut found = Vec::new();
        let Some(permanode_info) = &described.permanode else {
            return Ok(found);
        };
        for (key, values) in &permanode_info.attr {
            let Some(name) = key.strip_prefix(ATTR_PATH_PREFIX) else {
                continue;
            };
            let Some(child_ref) = values.first() else {
                continue;
            };
            let child_ref = match BlobRef::parse(child_ref) {
                Ok(r) => r,
                Err(_) => {
                    warn!("populate {}: bad child ref for {:?}", self.full_path(), name);
                    continue;
                }
            };
            let Some(child) = res.get(&child_ref) else {
                warn!("populate {}: child {} not described", self.full_path(), child_ref);
                continue;
            };

            let node = if let Some(target) = child.attr_first(ATTR_SYMLINK_TARGET) {
                MutNode::File(MutFile::new_symlink(
                    self.fs.clone(),
                    child_ref,
                    Arc::downgrade(self),
                    name,
                    target.to_string(),
                ))
            } else if let Some(content) = child.attr_first(ATTR_CONTENT) {
                let content_ref = match BlobRef::parse(content) {
                    Ok(r) => r,
                    Err(_) => {
                        warn!("populate {}: bad content ref on {}", self.full_path(), child_ref);
                        continue;
                    }
                };
                let Some(content_desc) = res.get(&content_ref) else {
                    warn!("populate {}: content {} not described", self.full_path(), content_ref);
                    continue;
                };
                if content_desc.camli_type.as_deref() != Some(CAMLI_TYPE_FILE) {
                    warn!("populate {}: {} content is not a file", self.full_path(), child_ref);
                    continue;
                }
                let size = content_desc.file.as_ref().map(|f| f.size).unwrap_or(0);
                MutNode::File(MutFile::new_regular(
                    self.fs.clone(),
                    child_ref,
                    Arc::downgrade(self),
                    name,
                    Some(content_ref),
                    size,
                ))
            } else {
                MutNode::Dir(MutDir::new(
                    self.fs.clone(),
                    child_ref,
                    Arc::downgrade(self),
                    name,
                ))
            };
            found.push((name.to_string(), node));
        }
        Ok(found)
    }

    pub async fn readdir(self: &Arc<Self>) -> FsResult<Vec<DirEntry>> {
        self.populate().await?;
        let state = self.state.lock().unwrap();
        Ok(state
            .children
            .iter()
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                inode: node.inode(),
                kind: node.kind(),
            })
            .collect())
    }

    pub async fn lookup(self: &Arc<Self>, name: &str) -> FsResult<MutNode> {
        self.populate().await?;
        self.state
            .lock()
            .unwrap()
            .children
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("no entry {:?}", name)))
    }

    /// Allocate a permanode and bind it under `name` on this directory.
    async fn link_new_permanode(&self, name: &str) -> FsResult<BlobRef> {
        let permanode = self.fs.claims().upload_new_permanode().await?;
        let claim = Claim::set_attribute(&self.permanode, &path_attr(name), permanode.as_str());
        self.fs.claims().upload_and_sign_claim(claim).await?;
        Ok(permanode)
    }

    fn insert_child(&self, name: &str, node: MutNode) {
        self.state
            .lock()
            .unwrap()
            .children
            .insert(name.to_string(), node);
    }

    /// Create a regular file and return it with an open write handle
    /// backed by an empty scratch.
    pub async fn create(self: &Arc<Self>, name: &str) -> FsResult<(Arc<MutFile>, WriteHandle)> {
        let permanode = self.link_new_permanode(name).await?;
        let file = MutFile::new_regular(
            self.fs.clone(),
            permanode,
            Arc::downgrade(self),
            name,
            None,
            0,
        );
        self.insert_child(name, MutNode::File(file.clone()));
        let handle = WriteHandle::new(file.clone(), None).await?;
        Ok((file, handle))
    }

    pub async fn mkdir(self: &Arc<Self>, name: &str) -> FsResult<Arc<MutDir>> {
        let permanode = self.link_new_permanode(name).await?;
        let dir = MutDir::new(self.fs.clone(), permanode, Arc::downgrade(self), name);
        self.insert_child(name, MutNode::Dir(dir.clone()));
        Ok(dir)
    }

    /// Create a symlink to `target`. A claim failure after the permanode
    /// was allocated leaves an orphan permanode behind, which is fine:
    /// the claim log is append-only and nothing references it.
    pub async fn symlink(self: &Arc<Self>, name: &str, target: &str) -> FsResult<Arc<MutFile>> {
        let permanode = self.link_new_permanode(name).await?;
        let file = MutFile::new_symlink(
            self.fs.clone(),
            permanode.clone(),
            Arc::downgrade(self),
            name,
            target.to_string(),
        );
        self.insert_child(name, MutNode::File(file.clone()));
        let claim = Claim::set_attribute(&permanode, ATTR_SYMLINK_TARGET, target);
        self.fs.claims().upload_and_sign_claim(claim).await?;
        Ok(file)
    }

    /// Unbind `name` from this directory. The claim goes out first; the
    /// local map is only touched once the store acknowledged it. The
    /// target permanode is not collected here.
    pub async fn remove(&self, name: &str) -> FsResult<()> {
        let claim = Claim::del_attribute(&self.permanode, &path_attr(name));
        self.fs.claims().upload_and_sign_claim(claim).await?;
        self.state.lock().unwrap().children.remove(name);
        Ok(())
    }

    /// Move `old_name` into `new_dir` under `new_name`.
    pub async fn rename(
        self: &Arc<Self>,
        old_name: &str,
        new_dir: &Arc<MutDir>,
        new_name: &str,
    ) -> FsResult<()> {
        self.populate().await?;
        new_dir.populate().await?;

        let target = {
            self.state.lock().unwrap().children.get(old_name).cloned()
        }
        .ok_or_else(|| FsError::NotFound(format!("no entry {:?}", old_name)))?;

        // Link into the destination before unlinking from the source,
        // both under one claim date: a crash between the two leaves a
        // duplicate entry, never an orphan.
        let now = SystemTime::now();
        let link = Claim::set_attribute(
            &new_dir.permanode,
            &path_attr(new_name),
            &target.permanode_string(),
        )
        .with_claim_date(now);
        self.fs.claims().upload_and_sign_claim(link).await?;

        let unlink = Claim::del_attribute(&self.permanode, &path_attr(old_name)).with_claim_date(now);
        self.fs.claims().upload_and_sign_claim(unlink).await?;

        let raced = {
            let mut state = self.state.lock().unwrap();
            match state.children.get(old_name) {
                Some(current) if current.same_node(&target) => {
                    state.children.remove(old_name);
                    false
                }
                _ => true,
            }
        };
        if raced {
            warn!(
                "rename {}: entry {:?} changed while claims were in flight",
                self.full_path(),
                old_name
            );
            return Err(FsError::InvalidState(format!(
                "rename race on {:?}",
                old_name
            )));
        }
        target.set_parent(new_dir, new_name);
        new_dir.insert_child(new_name, target);
        Ok(())
    }

    pub(crate) fn set_parent(&self, parent: &Arc<MutDir>, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.parent = Arc::downgrade(parent);
        state.name = name.to_string();
    }

    #[cfg(test)]
    pub(crate) fn force_repopulate(&self) {
        self.state.lock().unwrap().last_populated = None;
    }

    #[cfg(test)]
    pub(crate) fn child(&self, name: &str) -> Option<MutNode> {
        self.state.lock().unwrap().children.get(name).cloned()
    }
}
