//! Per-plugin encrypted key/value storage.
//!
//! Each plugin owns one namespace. Values are serialized to JSON,
//! optionally deflated, sealed with the namespace key from
//! `warden-crypto`, and persisted through a [`StorageBackend`].
//!
//! # Architecture
//!
//! - Entries, backups, the metadata record and the KDF salt are separate
//!   record kinds inside a namespace
//! - Metadata is cached in memory and mirrored to the persisted record on
//!   every mutation
//! - Quotas are recomputed from metadata, never stored
//! - Expired entries are removed lazily on read and by the [`Sweeper`]

mod backend;
mod codec;
mod config;
mod engine;
mod entry;
mod error;
mod quota;
mod snapshot;
mod sqlite;
mod sweeper;

pub use backend::{BatchOp, MemoryBackend, RecordKind, StorageBackend, WriteBatch};
pub use config::{BackendKind, QuotaOverride, StorageConfig, open_backend};
pub use engine::{KeySource, PutOptions, StorageEngine};
pub use entry::{EntryFlags, StorageEntry, StorageMetadata};
pub use error::{StorageError, StorageResult};
pub use quota::{Quota, QuotaLimit};
pub use snapshot::NamespaceSnapshot;
pub use sqlite::SqliteBackend;
pub use sweeper::Sweeper;
