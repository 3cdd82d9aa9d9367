use std::sync::{Arc, Weak};
use std::time::SystemTime;

use perm_lib::{BlobRef, ClaimClient, DescribeService, FileStore};

use crate::counters::OpenCounters;
use crate::dir::MutDir;

/// Shared state of one mounted view: the store clients, the mount-wide
/// timestamp fallback, and the identity reported for every node.
pub struct MutFs {
    claims: Arc<dyn ClaimClient>,
    describer: Arc<dyn DescribeService>,
    files: Arc<dyn FileStore>,
    server_start: SystemTime,
    uid: u32,
    gid: u32,
    counters: OpenCounters,
}

impl MutFs {
    pub fn new(
        claims: Arc<dyn ClaimClient>,
        describer: Arc<dyn DescribeService>,
        files: Arc<dyn FileStore>,
    ) -> Arc<Self> {
        // SAFETY: getuid/getgid are POSIX calls without preconditions.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        Arc::new(Self {
            claims,
            describer,
            files,
            server_start: SystemTime::now(),
            uid,
            gid,
            counters: OpenCounters::default(),
        })
    }

    /// Root directory node of the tree anchored at `permanode`.
    pub fn root(self: &Arc<Self>, permanode: BlobRef) -> Arc<MutDir> {
        MutDir::new(self.clone(), permanode, Weak::new(), String::new())
    }

    pub fn counters(&self) -> &OpenCounters {
        &self.counters
    }

    pub(crate) fn claims(&self) -> &Arc<dyn ClaimClient> {
        &self.claims
    }

    pub(crate) fn describer(&self) -> &Arc<dyn DescribeService> {
        &self.describer
    }

    pub(crate) fn files(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    pub(crate) fn server_start(&self) -> SystemTime {
        self.server_start
    }

    pub(crate) fn uid(&self) -> u32 {
        self.uid
    }

    pub(crate) fn gid(&self) -> u32 {
        self.gid
    }
}
