//! Export/import format for a whole namespace.
//!
//! Wire shape: `{ "<key>": StorageEntry, ..., "_metadata": {...}, "_salt": "<base64>" }`.

use crate::entry::{StorageEntry, StorageMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reserved top-level field names of a snapshot. Never valid storage keys.
pub(crate) const RESERVED_KEYS: [&str; 2] = ["_metadata", "_salt"];

/// Everything needed to reconstruct a namespace on another host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSnapshot {
    #[serde(flatten)]
    pub entries: BTreeMap<String, StorageEntry>,
    #[serde(rename = "_metadata")]
    pub metadata: BTreeMap<String, StorageMetadata>,
    #[serde(rename = "_salt")]
    pub salt: String,
}

impl NamespaceSnapshot {
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
