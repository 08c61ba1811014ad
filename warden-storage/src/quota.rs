//! Quota accounting. Always recomputed from metadata.

use crate::entry::StorageMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current usage and limits of one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub max_size_bytes: u64,
    pub current_size_bytes: u64,
    pub max_keys: u64,
    pub current_keys: u64,
}

/// Which limit a rejected write would have crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "limit", rename_all = "camelCase")]
pub enum QuotaLimit {
    #[serde(rename_all = "camelCase")]
    Size {
        max_size_bytes: u64,
        current_size_bytes: u64,
        attempted_size_bytes: u64,
    },
    #[serde(rename_all = "camelCase")]
    Keys { max_keys: u64, current_keys: u64 },
}

impl fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size {
                max_size_bytes,
                current_size_bytes,
                attempted_size_bytes,
            } => write!(
                f,
                "size limit of {max_size_bytes} bytes (in use {current_size_bytes}, write needs {attempted_size_bytes})"
            ),
            Self::Keys {
                max_keys,
                current_keys,
            } => write!(f, "key limit of {max_keys} keys (in use {current_keys})"),
        }
    }
}

impl Quota {
    /// Sums usage over a namespace's metadata.
    pub fn from_metadata<'a>(
        max_size_bytes: u64,
        max_keys: u64,
        metadata: impl IntoIterator<Item = &'a StorageMetadata>,
    ) -> Self {
        let (current_size_bytes, current_keys) = metadata
            .into_iter()
            .fold((0u64, 0u64), |(size, keys), m| (size + m.size_bytes, keys + 1));
        Self {
            max_size_bytes,
            current_size_bytes,
            max_keys,
            current_keys,
        }
    }

    /// Checks whether writing `new_size` bytes under a key fits.
    ///
    /// `replaced_size` is the size of the entry being overwritten, if any;
    /// it is released before the check and the key count does not grow.
    pub fn check_write(&self, replaced_size: Option<u64>, new_size: u64) -> Result<(), QuotaLimit> {
        let base = self.current_size_bytes - replaced_size.unwrap_or(0).min(self.current_size_bytes);
        let projected = base.saturating_add(new_size);
        if projected > self.max_size_bytes {
            return Err(QuotaLimit::Size {
                max_size_bytes: self.max_size_bytes,
                current_size_bytes: self.current_size_bytes,
                attempted_size_bytes: new_size,
            });
        }
        if replaced_size.is_none() && self.current_keys + 1 > self.max_keys {
            return Err(QuotaLimit::Keys {
                max_keys: self.max_keys,
                current_keys: self.current_keys,
            });
        }
        Ok(())
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.max_size_bytes.saturating_sub(self.current_size_bytes)
    }
}
