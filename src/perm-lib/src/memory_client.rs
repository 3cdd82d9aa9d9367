use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rand::RngCore;
use tokio::io::AsyncReadExt;

use crate::{
    BlobRef, Claim, ClaimClient, ClaimType, DescribeRequest, DescribeResponse, DescribeService,
    DescribedBlob, FileInfo, FileReader, FileStore, FsError, FsResult, PermanodeInfo,
    CAMLI_TYPE_FILE, CAMLI_TYPE_PERMANODE,
};

/// In-process blob/claim/describe implementation.
///
/// Claims are applied eagerly to a per-permanode attribute map, describe
/// materializes that map transitively, and file blobs are held in memory
/// keyed by their content address. Used as the store double in tests
/// across the workspace.
pub struct MemoryClient {
    state: Mutex<StoreState>,
    describes: AtomicU64,
    fail_claims: AtomicBool,
}

#[derive(Default)]
struct StoreState {
    permanodes: HashMap<String, BTreeMap<String, Vec<String>>>,
    files: HashMap<String, Vec<u8>>,
    claims: Vec<Claim>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            describes: AtomicU64::new(0),
            fail_claims: AtomicBool::new(false),
        }
    }

    /// Every claim accepted so far, in upload order.
    pub fn claim_log(&self) -> Vec<Claim> {
        self.state.lock().unwrap().claims.clone()
    }

    /// Number of describe requests served.
    pub fn describe_count(&self) -> u64 {
        self.describes.load(Ordering::Relaxed)
    }

    /// Make every subsequent claim upload fail.
    pub fn set_fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::Relaxed);
    }

    fn describe_into(
        state: &StoreState,
        blob_ref: &str,
        depth: u32,
        meta: &mut HashMap<String, DescribedBlob>,
    ) {
        if depth == 0 || meta.contains_key(blob_ref) {
            return;
        }
        if let Some(data) = state.files.get(blob_ref) {
            meta.insert(
                blob_ref.to_string(),
                DescribedBlob {
                    blob_ref: BlobRef::parse(blob_ref).expect("stored refs are valid"),
                    camli_type: Some(CAMLI_TYPE_FILE.to_string()),
                    permanode: None,
                    file: Some(FileInfo {
                        size: data.len() as u64,
                    }),
                },
            );
            return;
        }
        let Some(attr) = state.permanodes.get(blob_ref) else {
            return;
        };
        meta.insert(
            blob_ref.to_string(),
            DescribedBlob {
                blob_ref: BlobRef::parse(blob_ref).expect("stored refs are valid"),
                camli_type: Some(CAMLI_TYPE_PERMANODE.to_string()),
                permanode: Some(PermanodeInfo { attr: attr.clone() }),
                file: None,
            },
        );
        for values in attr.values() {
            for value in values {
                if BlobRef::parse(value).is_ok() {
                    Self::describe_into(state, value, depth - 1, meta);
                }
            }
        }
    }
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClaimClient for MemoryClient {
    async fn upload_new_permanode(&self) -> FsResult<BlobRef> {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let blob_ref = BlobRef::from_bytes(&seed);
        let mut state = self.state.lock().unwrap();
        state
            .permanodes
            .insert(blob_ref.as_str().to_string(), BTreeMap::new());
        Ok(blob_ref)
    }

    async fn upload_and_sign_claim(&self, claim: Claim) -> FsResult<BlobRef> {
        if self.fail_claims.load(Ordering::Relaxed) {
            return Err(FsError::RemoteError("claim upload refused".to_string()));
        }
        let ack = BlobRef::from_bytes(
            &serde_json::to_vec(&claim).map_err(|e| FsError::DecodeError(e.to_string()))?,
        );
        let mut state = self.state.lock().unwrap();
        let attrs = state
            .permanodes
            .entry(claim.permanode.as_str().to_string())
            .or_default();
        match claim.claim_type {
            ClaimType::SetAttribute => {
                let value = claim.value.clone().unwrap_or_default();
                attrs.insert(claim.attribute.clone(), vec![value]);
            }
            ClaimType::DelAttribute => {
                attrs.remove(&claim.attribute);
            }
        }
        state.claims.push(claim);
        Ok(ack)
    }
}

#[async_trait]
impl DescribeService for MemoryClient {
    async fn describe(&self, req: DescribeRequest) -> FsResult<DescribeResponse> {
        self.describes.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().unwrap();
        let mut meta = HashMap::new();
        Self::describe_into(&state, req.blob_ref.as_str(), req.depth.max(1), &mut meta);
        Ok(DescribeResponse { meta })
    }
}

#[async_trait]
impl FileStore for MemoryClient {
    async fn open_file_reader(&self, content: &BlobRef) -> FsResult<FileReader> {
        let data = self
            .state
            .lock()
            .unwrap()
            .files
            .get(content.as_str())
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("file blob {}", content)))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn write_file_from_reader(
        &self,
        _name: &str,
        reader: &mut FileReader,
    ) -> FsResult<(BlobRef, u64)> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let size = data.len() as u64;
        let blob_ref = BlobRef::from_bytes(&data);
        self.state
            .lock()
            .unwrap()
            .files
            .insert(blob_ref.as_str().to_string(), data);
        Ok((blob_ref, size))
    }
}
