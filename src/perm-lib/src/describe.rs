use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::BlobRef;

/// Request for a server-side materialization of a permanode's attribute
/// set, transitively to `depth` levels of referenced blobs.
#[derive(Debug, Clone)]
pub struct DescribeRequest {
    pub blob_ref: BlobRef,
    pub depth: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescribeResponse {
    /// Blob reference string -> description of that blob.
    pub meta: HashMap<String, DescribedBlob>,
}

impl DescribeResponse {
    pub fn get(&self, blob_ref: &BlobRef) -> Option<&DescribedBlob> {
        self.meta.get(blob_ref.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribedBlob {
    pub blob_ref: BlobRef,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub camli_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub permanode: Option<PermanodeInfo>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file: Option<FileInfo>,
}

impl DescribedBlob {
    /// First value of a permanode attribute, if present and non-empty.
    pub fn attr_first(&self, key: &str) -> Option<&str> {
        self.permanode.as_ref().and_then(|p| p.attr_first(key))
    }
}

/// Current attribute set of a permanode as computed from the claim log.
/// Attribute values are ordered lists of strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermanodeInfo {
    pub attr: BTreeMap<String, Vec<String>>,
}

impl PermanodeInfo {
    pub fn attr_first(&self, key: &str) -> Option<&str> {
        self.attr
            .get(key)
            .and_then(|values| values.first())
            .map(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_first() {
        let mut info = PermanodeInfo::default();
        info.attr
            .insert("camliPath:a".to_string(), vec!["first".into(), "second".into()]);
        info.attr.insert("empty".to_string(), vec![]);
        assert_eq!(info.attr_first("camliPath:a"), Some("first"));
        assert_eq!(info.attr_first("empty"), None);
        assert_eq!(info.attr_first("missing"), None);
    }

    #[test]
    fn test_response_wire_form() {
        let blob_ref = BlobRef::from_bytes(b"file");
        let mut res = DescribeResponse::default();
        res.meta.insert(
            blob_ref.as_str().to_string(),
            DescribedBlob {
                blob_ref: blob_ref.clone(),
                camli_type: Some("file".into()),
                permanode: None,
                file: Some(FileInfo { size: 42 }),
            },
        );
        let json = serde_json::to_string(&res).unwrap();
        assert!(json.contains("\"camliType\":\"file\""));
        let back: DescribeResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&blob_ref).unwrap().file.as_ref().unwrap().size, 42);
    }
}
