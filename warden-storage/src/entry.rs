//! Persisted entry and metadata records.

use serde::{Deserialize, Serialize};
use warden_types::UnixMillis;

/// How an entry's payload was produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFlags {
    pub compressed: bool,
    pub encrypted: bool,
}

/// One stored value, exactly as persisted and exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEntry {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// Nonce used to seal `ciphertext`; empty when the entry is not encrypted.
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    pub metadata_flags: EntryFlags,
    pub created_at: UnixMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<UnixMillis>,
}

impl StorageEntry {
    /// Bytes charged against the namespace quota.
    pub fn size_bytes(&self) -> u64 {
        self.ciphertext.len() as u64
    }

    pub fn is_expired_at(&self, now: UnixMillis) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Bookkeeping kept for every key of a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMetadata {
    pub plugin_id: String,
    pub key: String,
    pub size_bytes: u64,
    pub created_at: UnixMillis,
    pub updated_at: UnixMillis,
    pub access_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<UnixMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<UnixMillis>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl StorageMetadata {
    pub fn is_expired_at(&self, now: UnixMillis) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// True when every tag in `wanted` is carried by this entry.
    pub fn has_all_tags(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|tag| self.tags.contains(tag))
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_wire_shape_is_camel_case_base64() {
        let entry = StorageEntry {
            ciphertext: vec![1, 2, 3],
            iv: vec![0; 12],
            metadata_flags: EntryFlags {
                compressed: true,
                encrypted: true,
            },
            created_at: 10,
            expires_at: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["ciphertext"], "AQID");
        assert_eq!(json["metadataFlags"]["compressed"], true);
        assert_eq!(json["createdAt"], 10);
        assert!(json.get("expiresAt").is_none());
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let meta = StorageMetadata {
            plugin_id: "p".into(),
            key: "k".into(),
            size_bytes: 1,
            created_at: 0,
            updated_at: 0,
            access_count: 0,
            last_accessed_at: None,
            expires_at: Some(100),
            tags: vec![],
        };
        assert!(!meta.is_expired_at(99));
        assert!(meta.is_expired_at(100));
    }

    #[test]
    fn has_all_tags_requires_every_tag() {
        let meta = StorageMetadata {
            plugin_id: "p".into(),
            key: "k".into(),
            size_bytes: 1,
            created_at: 0,
            updated_at: 0,
            access_count: 0,
            last_accessed_at: None,
            expires_at: None,
            tags: vec!["a".into(), "b".into()],
        };
        assert!(meta.has_all_tags(&["a".into()]));
        assert!(meta.has_all_tags(&["a".into(), "b".into()]));
        assert!(!meta.has_all_tags(&["a".into(), "c".into()]));
        assert!(meta.has_all_tags(&[]));
    }
}
