use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::{BlobRef, Claim, DescribeRequest, DescribeResponse, FsResult};

pub trait ReadSeek: AsyncRead + AsyncSeek + Send + Unpin {}
impl<T> ReadSeek for T where T: AsyncRead + AsyncSeek + Send + Unpin {}

/// Seekable byte stream over the content of a stored file blob.
pub type FileReader = Pin<Box<dyn ReadSeek>>;

/// Upload-side half of the mutation log.
#[async_trait]
pub trait ClaimClient: Send + Sync {
    /// Create a fresh, empty permanode and return its reference.
    async fn upload_new_permanode(&self) -> FsResult<BlobRef>;

    /// Sign and upload a mutation claim. Returns the claim blob reference.
    async fn upload_and_sign_claim(&self, claim: Claim) -> FsResult<BlobRef>;
}

/// Read-side materialization of the claim log.
#[async_trait]
pub trait DescribeService: Send + Sync {
    async fn describe(&self, req: DescribeRequest) -> FsResult<DescribeResponse>;
}

/// Content blob access: streaming reads of stored files and atomic,
/// chunked uploads of new file content.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn open_file_reader(&self, content: &BlobRef) -> FsResult<FileReader>;

    /// Consume `reader` fully, upload its bytes as a file blob and return
    /// the content blob reference together with the exact byte count.
    async fn write_file_from_reader(
        &self,
        name: &str,
        reader: &mut FileReader,
    ) -> FsResult<(BlobRef, u64)>;
}
