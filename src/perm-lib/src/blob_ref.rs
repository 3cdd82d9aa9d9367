use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{FsError, FsResult};

/// A stable reference to an immutable blob, in `<hashname>:<hexdigest>`
/// form. Permanode identities, content blobs and claim blobs all use the
/// same reference form.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    pub fn parse(s: &str) -> FsResult<Self> {
        let (hash_name, digest) = s
            .split_once(':')
            .ok_or_else(|| FsError::InvalidParam(format!("invalid blob ref: {}", s)))?;
        if hash_name.is_empty()
            || digest.is_empty()
            || !digest.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(FsError::InvalidParam(format!("invalid blob ref: {}", s)));
        }
        Ok(Self(s.to_string()))
    }

    /// Reference for a blob with the given content.
    pub fn from_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(format!("sha256:{}", hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Project the reference onto a 64-bit inode number.
    ///
    /// Hashes the serialized form and takes the first 8 bytes, so the
    /// projection is deterministic and stable for the life of the blob.
    /// Inodes 0 and 1 are reserved by the kernel interface.
    pub fn to_inode(&self) -> u64 {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let mut inode = u64::from_le_bytes(bytes);
        if inode < 2 {
            inode = inode.wrapping_add(2);
        }
        inode
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobRef({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let r = BlobRef::parse("sha256:00ff12").unwrap();
        assert_eq!(r.as_str(), "sha256:00ff12");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(BlobRef::parse("no-colon").is_err());
        assert!(BlobRef::parse(":abcd").is_err());
        assert!(BlobRef::parse("sha256:").is_err());
        assert!(BlobRef::parse("sha256:xyz!").is_err());
    }

    #[test]
    fn test_from_bytes_is_content_addressed() {
        let a = BlobRef::from_bytes(b"hello");
        let b = BlobRef::from_bytes(b"hello");
        let c = BlobRef::from_bytes(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_inode_projection_stable() {
        let r = BlobRef::from_bytes(b"some blob");
        assert_eq!(r.to_inode(), r.to_inode());
        let again = BlobRef::parse(r.as_str()).unwrap();
        assert_eq!(r.to_inode(), again.to_inode());
    }

    #[test]
    fn test_inode_never_reserved() {
        for i in 0..1000u32 {
            let r = BlobRef::from_bytes(&i.to_le_bytes());
            assert!(r.to_inode() >= 2);
        }
    }
}
