use std::io::Cursor;

use async_trait::async_trait;
use log::debug;
use perm_lib::{
    BlobRef, Claim, ClaimClient, DescribeRequest, DescribeResponse, DescribeService, FileReader,
    FileStore, FsError, FsResult,
};
use serde::Deserialize;
use tokio::io::AsyncReadExt;

/// Client for a blob server exposing permanode mint, claim signing,
/// describe and raw blob endpoints over HTTP. The server signs claims
/// with the mount owner's key; this client never sees key material.
pub struct RemoteClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobRefResponse {
    blob_ref: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    blob_ref: String,
    size: u64,
}

impl RemoteClient {
    pub fn new(base_url: String) -> FsResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| FsError::RemoteError(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn checked(res: reqwest::Response, what: &str) -> FsResult<reqwest::Response> {
        if res.status().is_success() {
            Ok(res)
        } else {
            Err(FsError::from_http_status(
                res.status().as_u16(),
                what.to_string(),
            ))
        }
    }
}

#[async_trait]
impl ClaimClient for RemoteClient {
    async fn upload_new_permanode(&self) -> FsResult<BlobRef> {
        let res = self
            .http
            .post(self.url("/sig/new-permanode"))
            .send()
            .await
            .map_err(|e| FsError::RemoteError(e.to_string()))?;
        let res = Self::checked(res, "new-permanode").await?;
        let body: BlobRefResponse = res
            .json()
            .await
            .map_err(|e| FsError::DecodeError(e.to_string()))?;
        BlobRef::parse(&body.blob_ref)
    }

    async fn upload_and_sign_claim(&self, claim: Claim) -> FsResult<BlobRef> {
        debug!("signing {:?} on {}", claim.claim_type, claim.permanode);
        let res = self
            .http
            .post(self.url("/sig/sign"))
            .json(&claim)
            .send()
            .await
            .map_err(|e| FsError::RemoteError(e.to_string()))?;
        let res = Self::checked(res, "sign claim").await?;
        let body: BlobRefResponse = res
            .json()
            .await
            .map_err(|e| FsError::DecodeError(e.to_string()))?;
        BlobRef::parse(&body.blob_ref)
    }
}

#[async_trait]
impl DescribeService for RemoteClient {
    async fn describe(&self, req: DescribeRequest) -> FsResult<DescribeResponse> {
        let depth = req.depth.to_string();
        let res = self
            .http
            .get(self.url("/search/describe"))
            .query(&[
                ("blobref", req.blob_ref.as_str()),
                ("depth", depth.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FsError::RemoteError(e.to_string()))?;
        let res = Self::checked(res, "describe").await?;
        res.json::<DescribeResponse>()
            .await
            .map_err(|e| FsError::DecodeError(e.to_string()))
    }
}

#[async_trait]
impl FileStore for RemoteClient {
    async fn open_file_reader(&self, content: &BlobRef) -> FsResult<FileReader> {
        let res = self
            .http
            .get(self.url(&format!("/blob/{}", content)))
            .send()
            .await
            .map_err(|e| FsError::RemoteError(e.to_string()))?;
        let res = Self::checked(res, content.as_str()).await?;
        let data = res
            .bytes()
            .await
            .map_err(|e| FsError::RemoteError(e.to_string()))?;
        Ok(Box::pin(Cursor::new(data.to_vec())))
    }

    async fn write_file_from_reader(
        &self,
        name: &str,
        reader: &mut FileReader,
    ) -> FsResult<(BlobRef, u64)> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let res = self
            .http
            .post(self.url("/blob"))
            .query(&[("name", name)])
            .body(data)
            .send()
            .await
            .map_err(|e| FsError::RemoteError(e.to_string()))?;
        let res = Self::checked(res, "upload file").await?;
        let body: UploadResponse = res
            .json()
            .await
            .map_err(|e| FsError::DecodeError(e.to_string()))?;
        Ok((BlobRef::parse(&body.blob_ref)?, body.size))
    }
}
