use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::BlobRef;

/// A signed, append-only assertion about one attribute of a permanode.
///
/// The claim client serializes, signs and uploads claims; this type is the
/// unsigned wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub permanode: BlobRef,
    pub claim_type: ClaimType,
    pub attribute: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
    /// Claim date in unix milliseconds. Absent means "now" at signing time.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub claim_date: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimType {
    SetAttribute,
    DelAttribute,
}

impl Claim {
    pub fn set_attribute(permanode: &BlobRef, key: &str, value: &str) -> Self {
        Self {
            permanode: permanode.clone(),
            claim_type: ClaimType::SetAttribute,
            attribute: key.to_string(),
            value: Some(value.to_string()),
            claim_date: None,
        }
    }

    pub fn del_attribute(permanode: &BlobRef, key: &str) -> Self {
        Self {
            permanode: permanode.clone(),
            claim_type: ClaimType::DelAttribute,
            attribute: key.to_string(),
            value: None,
            claim_date: None,
        }
    }

    pub fn with_claim_date(mut self, date: SystemTime) -> Self {
        let millis = date
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.claim_date = Some(millis);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_wire_form() {
        let pn = BlobRef::from_bytes(b"pn");
        let claim = Claim::set_attribute(&pn, "camliPath:notes", "sha256:abcd");
        let json = serde_json::to_string(&claim).unwrap();
        assert!(json.contains("\"claimType\":\"set-attribute\""));
        assert!(json.contains("\"attribute\":\"camliPath:notes\""));
        assert!(!json.contains("claimDate"));

        let back: Claim = serde_json::from_str(&json).unwrap();
        assert_eq!(back, claim);
    }

    #[test]
    fn test_del_claim_has_no_value() {
        let pn = BlobRef::from_bytes(b"pn");
        let claim = Claim::del_attribute(&pn, "camliPath:old");
        let json = serde_json::to_string(&claim).unwrap();
        assert!(json.contains("del-attribute"));
        assert!(!json.contains("\"value\""));
    }

    #[test]
    fn test_claim_date_round_trip() {
        let pn = BlobRef::from_bytes(b"pn");
        let now = SystemTime::now();
        let a = Claim::set_attribute(&pn, "k", "v").with_claim_date(now);
        let b = Claim::del_attribute(&pn, "k").with_claim_date(now);
        assert_eq!(a.claim_date, b.claim_date);
        assert!(a.claim_date.is_some());
    }
}
