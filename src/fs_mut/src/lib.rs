//! Mutable filesystem core over a content-addressed blob store.
//!
//! Directory structure and file bindings live as signed attribute claims
//! on permanodes; file bytes live as immutable content blobs. This crate
//! holds the in-memory node tree, the claim emission for structural
//! edits, and the write-buffering handle that turns streaming POSIX
//! writes into atomic blob uploads. The kernel-facing adapter lives in
//! the `fs_daemon` crate.

mod counters;
mod dir;
mod dir_lock;
mod file;
mod handle;
mod mut_fs;
mod node;

#[cfg(test)]
mod mut_fs_tests;

pub use counters::OpenCounters;
pub use dir::MutDir;
pub use dir_lock::{delete_directory_lock, keep_directory_lock, DirLockGuard};
pub use file::{MutFile, SetattrRequest};
pub use handle::WriteHandle;
pub use mut_fs::MutFs;
pub use node::{DirEntry, MutNode, NodeAttr, NodeKind};

use std::time::Duration;

/// How often directory nodes may be refreshed from the blob store.
pub const POPULATE_INTERVAL: Duration = Duration::from_secs(30);

/// Validity hint returned with fresh attributes after a Setattr.
pub const SETATTR_TTL: Duration = Duration::from_secs(60);
