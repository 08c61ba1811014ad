//! Persistence seam for storage namespaces.
//!
//! A backend is a dumb record store: it knows nothing about encryption,
//! quotas or expiry. All of that lives in [`crate::StorageEngine`].

use crate::error::StorageResult;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};

/// The kinds of record a namespace holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    /// A serialized [`crate::StorageEntry`], keyed by the user key.
    Entry,
    /// Backup copy of an entry, keyed by the user key.
    Backup,
    /// The namespace metadata map (single record, empty key).
    Metadata,
    /// The base64 KDF salt (single record, empty key).
    Salt,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Backup => "backup",
            Self::Metadata => "metadata",
            Self::Salt => "salt",
        }
    }
}

/// One mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        kind: RecordKind,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        kind: RecordKind,
        key: String,
    },
}

impl BatchOp {
    pub fn put(kind: RecordKind, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self::Put {
            kind,
            key: key.into(),
            value,
        }
    }

    pub fn delete(kind: RecordKind, key: impl Into<String>) -> Self {
        Self::Delete {
            kind,
            key: key.into(),
        }
    }
}

/// A set of mutations applied to one namespace all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    /// Wipe every record of the namespace before applying `ops`.
    pub clear_first: bool,
    pub ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch that replaces the namespace content wholesale.
    pub fn replacing() -> Self {
        Self {
            clear_first: true,
            ops: Vec::new(),
        }
    }

    pub fn push(&mut self, op: BatchOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.clear_first && self.ops.is_empty()
    }
}

/// Record store used by the storage engine.
pub trait StorageBackend: Send + Sync {
    /// Reads one record.
    fn read(&self, namespace: &str, kind: RecordKind, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Lists the keys of every record of `kind` in a namespace, sorted.
    fn list(&self, namespace: &str, kind: RecordKind) -> StorageResult<Vec<String>>;

    /// Lists every namespace holding at least one record, sorted.
    fn namespaces(&self) -> StorageResult<Vec<String>>;

    /// Applies a batch atomically.
    fn commit(&self, namespace: &str, batch: WriteBatch) -> StorageResult<()>;
}

type RecordMap = BTreeMap<(String, RecordKind, String), Vec<u8>>;

/// In-memory backend for tests and password-less sessions.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<RecordMap>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, RecordMap> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrites a raw record, bypassing the engine. Used to simulate
    /// corruption and tampering in tests.
    pub fn write_raw(&self, namespace: &str, kind: RecordKind, key: &str, value: Vec<u8>) {
        self.records()
            .insert((namespace.to_string(), kind, key.to_string()), value);
    }

    /// Number of records across all namespaces.
    pub fn record_count(&self) -> usize {
        self.records().len()
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, namespace: &str, kind: RecordKind, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .records()
            .get(&(namespace.to_string(), kind, key.to_string()))
            .cloned())
    }

    fn list(&self, namespace: &str, kind: RecordKind) -> StorageResult<Vec<String>> {
        Ok(self
            .records()
            .keys()
            .filter(|(ns, k, _)| ns == namespace && *k == kind)
            .map(|(_, _, key)| key.clone())
            .collect())
    }

    fn namespaces(&self) -> StorageResult<Vec<String>> {
        let set: BTreeSet<String> = self.records().keys().map(|(ns, _, _)| ns.clone()).collect();
        Ok(set.into_iter().collect())
    }

    fn commit(&self, namespace: &str, batch: WriteBatch) -> StorageResult<()> {
        // Holding the lock for the whole batch keeps it atomic for readers.
        let mut records = self.records();
        if batch.clear_first {
            records.retain(|(ns, _, _), _| ns != namespace);
        }
        for op in batch.ops {
            match op {
                BatchOp::Put { kind, key, value } => {
                    records.insert((namespace.to_string(), kind, key), value);
                }
                BatchOp::Delete { kind, key } => {
                    records.remove(&(namespace.to_string(), kind, key));
                }
            }
        }
        Ok(())
    }
}
