mod blob_ref;
mod claim;
mod client;
mod describe;
mod memory_client;

pub use blob_ref::*;
pub use claim::*;
pub use client::*;
pub use describe::*;
pub use memory_client::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl FsError {
    pub fn from_http_status(code: u16, info: String) -> Self {
        match code {
            404 => FsError::NotFound(info),
            500 => FsError::RemoteError(format!("server error: {}", info)),
            _ => FsError::RemoteError(format!("HTTP {}: {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::IoError(err.to_string())
    }
}

/// Directory entry attribute: `camliPath:<basename>` holds the child
/// permanode reference.
pub const ATTR_PATH_PREFIX: &str = "camliPath:";
/// File content attribute: holds the content blob reference.
pub const ATTR_CONTENT: &str = "camliContent";
/// Symlink target attribute: holds the link target path.
pub const ATTR_SYMLINK_TARGET: &str = "camliSymlinkTarget";

pub const CAMLI_TYPE_FILE: &str = "file";
pub const CAMLI_TYPE_PERMANODE: &str = "permanode";

pub fn path_attr(name: &str) -> String {
    format!("{}{}", ATTR_PATH_PREFIX, name)
}
