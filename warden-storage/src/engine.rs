//! The storage engine: one encrypted namespace per plugin.

use crate::backend::{BatchOp, RecordKind, StorageBackend, WriteBatch};
use crate::codec;
use crate::config::StorageConfig;
use crate::entry::{EntryFlags, StorageEntry, StorageMetadata};
use crate::error::{StorageError, StorageResult};
use crate::quota::Quota;
use crate::snapshot::{NamespaceSnapshot, RESERVED_KEYS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use warden_crypto::{
    CryptoError, EncryptedData, Salt, SealingKey, derive_key, generate_ephemeral_key,
};
use warden_types::{PluginId, UnixMillis, now_millis};

/// Maximum storage key length in bytes.
pub const MAX_KEY_LEN: usize = 256;

/// Options accepted by [`StorageEngine::put`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutOptions {
    /// Time to live in milliseconds.
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub compress: Option<bool>,
    #[serde(default)]
    pub backup: Option<bool>,
}

impl PutOptions {
    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn compressed(mut self) -> Self {
        self.compress = Some(true);
        self
    }

    pub fn backed_up(mut self) -> Self {
        self.backup = Some(true);
        self
    }
}

/// Where namespace keys come from.
#[derive(Clone)]
pub enum KeySource {
    /// PBKDF2 over the persisted namespace salt.
    Password(String),
    /// A random key per namespace, held for the process lifetime only.
    Ephemeral,
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password([REDACTED])"),
            Self::Ephemeral => f.write_str("Ephemeral"),
        }
    }
}

/// In-memory state of one loaded namespace.
struct Namespace {
    salt: Salt,
    key: Arc<SealingKey>,
    metadata: BTreeMap<String, StorageMetadata>,
}

/// Per-plugin encrypted key/value store.
///
/// All operations serialize on one internal lock, so the metadata cache
/// is only ever mutated by one caller at a time.
///
/// Ephemeral keys live in their own table that outlasts [`evict`], so an
/// evicted namespace reopens with the key its entries were sealed under.
/// Only [`clear`] forgets them.
///
/// [`evict`]: StorageEngine::evict
/// [`clear`]: StorageEngine::clear
pub struct StorageEngine {
    backend: Arc<dyn StorageBackend>,
    config: StorageConfig,
    key_source: KeySource,
    namespaces: Mutex<HashMap<PluginId, Namespace>>,
    ephemeral_keys: Mutex<HashMap<PluginId, Arc<SealingKey>>>,
}

impl StorageEngine {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        config: StorageConfig,
        key_source: KeySource,
    ) -> Self {
        Self {
            backend,
            config,
            key_source,
            namespaces: Mutex::new(HashMap::new()),
            ephemeral_keys: Mutex::new(HashMap::new()),
        }
    }

    /// Engine over a fresh in-memory backend with ephemeral keys.
    pub fn in_memory(config: StorageConfig) -> Self {
        Self::new(
            Arc::new(crate::backend::MemoryBackend::new()),
            config,
            KeySource::Ephemeral,
        )
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PluginId, Namespace>> {
        self.namespaces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ================================================================
    // Namespace loading
    // ================================================================

    fn ephemeral_keys(&self) -> MutexGuard<'_, HashMap<PluginId, Arc<SealingKey>>> {
        self.ephemeral_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The namespace key: derived from the password over `salt`, or the
    /// plugin's process-lifetime random key.
    fn namespace_key(&self, plugin_id: &PluginId, salt: &Salt) -> StorageResult<Arc<SealingKey>> {
        match &self.key_source {
            KeySource::Password(password) => {
                let key = derive_key(password, salt, &self.config.kdf_params())?;
                Ok(Arc::new(SealingKey::new(key)))
            }
            KeySource::Ephemeral => Ok(Arc::clone(
                self.ephemeral_keys()
                    .entry(plugin_id.clone())
                    .or_insert_with(|| Arc::new(SealingKey::new(generate_ephemeral_key()))),
            )),
        }
    }

    fn load_namespace(&self, plugin_id: &PluginId) -> StorageResult<Namespace> {
        let ns = plugin_id.as_str();

        let salt = match self.backend.read(ns, RecordKind::Salt, "")? {
            Some(bytes) => {
                let encoded = String::from_utf8(bytes)
                    .map_err(|e| StorageError::Backend(format!("salt is not UTF-8: {e}")))?;
                Salt::from_base64(&encoded)?
            }
            None => {
                let salt = Salt::random();
                let mut batch = WriteBatch::new();
                batch.push(BatchOp::put(
                    RecordKind::Salt,
                    "",
                    salt.to_base64().into_bytes(),
                ));
                self.backend.commit(ns, batch)?;
                debug!(plugin_id = %plugin_id, "Generated namespace salt");
                salt
            }
        };

        let metadata = match self.backend.read(ns, RecordKind::Metadata, "")? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => BTreeMap::new(),
        };

        let key = self.namespace_key(plugin_id, &salt)?;
        Ok(Namespace {
            salt,
            key,
            metadata,
        })
    }

    fn namespace<'a>(
        &self,
        namespaces: &'a mut HashMap<PluginId, Namespace>,
        plugin_id: &PluginId,
    ) -> StorageResult<&'a mut Namespace> {
        if !namespaces.contains_key(plugin_id) {
            let loaded = self.load_namespace(plugin_id)?;
            namespaces.insert(plugin_id.clone(), loaded);
        }
        namespaces
            .get_mut(plugin_id)
            .ok_or_else(|| StorageError::Backend("namespace vanished while loading".to_string()))
    }

    fn quota_of(&self, plugin_id: &PluginId, ns: &Namespace) -> Quota {
        let (max_size, max_keys) = self.config.limits_for(plugin_id.as_str());
        Quota::from_metadata(max_size, max_keys, ns.metadata.values())
    }

    fn metadata_record(metadata: &BTreeMap<String, StorageMetadata>) -> StorageResult<BatchOp> {
        Ok(BatchOp::put(
            RecordKind::Metadata,
            "",
            serde_json::to_vec(metadata)?,
        ))
    }

    // ================================================================
    // Entry sealing
    // ================================================================

    fn seal_value(
        &self,
        key: &SealingKey,
        value: &Value,
        compress: bool,
        now: UnixMillis,
        expires_at: Option<UnixMillis>,
    ) -> StorageResult<StorageEntry> {
        let mut payload = serde_json::to_vec(value)?;
        if compress {
            payload = codec::compress(&payload)?;
        }

        let (iv, ciphertext) = if self.config.encrypt {
            let sealed = key.seal(&payload)?;
            (sealed.nonce.to_vec(), sealed.ciphertext)
        } else {
            (Vec::new(), payload)
        };

        Ok(StorageEntry {
            ciphertext,
            iv,
            metadata_flags: EntryFlags {
                compressed: compress,
                encrypted: self.config.encrypt,
            },
            created_at: now,
            expires_at,
        })
    }

    fn open_entry(
        plugin_id: &PluginId,
        key_name: &str,
        key: &SealingKey,
        entry: &StorageEntry,
    ) -> StorageResult<Value> {
        let mut payload = if entry.metadata_flags.encrypted {
            let sealed = EncryptedData::from_parts(&entry.iv, entry.ciphertext.clone())?;
            key.open(&sealed).map_err(|e| match e {
                CryptoError::AuthenticationFailure => StorageError::AuthenticationFailure {
                    plugin_id: plugin_id.to_string(),
                    key: key_name.to_string(),
                },
                other => StorageError::Crypto(other),
            })?
        } else {
            entry.ciphertext.clone()
        };
        if entry.metadata_flags.compressed {
            payload = codec::decompress(&payload)?;
        }
        Ok(serde_json::from_slice(&payload)?)
    }

    // ================================================================
    // Operations
    // ================================================================

    /// Stores `value` under `key`, returning the entry's new metadata.
    ///
    /// The quota check runs before anything is persisted; on
    /// [`StorageError::QuotaExceeded`] the namespace is untouched.
    pub fn put(
        &self,
        plugin_id: &PluginId,
        key: &str,
        value: &Value,
        options: &PutOptions,
    ) -> StorageResult<StorageMetadata> {
        validate_key(key)?;
        let mut namespaces = self.lock();
        let ns = self.namespace(&mut namespaces, plugin_id)?;

        let now = now_millis();
        let expires_at = options.ttl.map(|ttl| now.saturating_add(ttl));
        let entry = self.seal_value(
            &ns.key,
            value,
            options.compress.unwrap_or(false),
            now,
            expires_at,
        )?;

        let previous = ns.metadata.get(key);
        let size = entry.size_bytes();
        self.quota_of(plugin_id, ns)
            .check_write(previous.map(|m| m.size_bytes), size)
            .map_err(|limit| {
                warn!(plugin_id = %plugin_id, key, %limit, "Storage write rejected by quota");
                StorageError::QuotaExceeded {
                    plugin_id: plugin_id.to_string(),
                    limit,
                }
            })?;

        let metadata = StorageMetadata {
            plugin_id: plugin_id.to_string(),
            key: key.to_string(),
            size_bytes: size,
            created_at: previous.map_or(now, |m| m.created_at),
            updated_at: now,
            access_count: previous.map_or(0, |m| m.access_count),
            last_accessed_at: previous.and_then(|m| m.last_accessed_at),
            expires_at,
            tags: options.tags.clone().unwrap_or_default(),
        };

        let mut next = ns.metadata.clone();
        next.insert(key.to_string(), metadata.clone());

        let entry_bytes = serde_json::to_vec(&entry)?;
        let mut batch = WriteBatch::new();
        if options.backup.unwrap_or(false) {
            batch.push(BatchOp::put(RecordKind::Backup, key, entry_bytes.clone()));
        }
        batch
            .push(BatchOp::put(RecordKind::Entry, key, entry_bytes))
            .push(Self::metadata_record(&next)?);
        self.backend.commit(plugin_id.as_str(), batch)?;

        ns.metadata = next;
        debug!(plugin_id = %plugin_id, key, size_bytes = size, "Stored entry");
        Ok(metadata)
    }

    /// Reads a value. Returns `Ok(None)` when the key is absent or expired;
    /// an expired entry is deleted as a side effect.
    ///
    /// A tampered entry or a wrong key yields
    /// [`StorageError::AuthenticationFailure`], never `None`.
    pub fn get(&self, plugin_id: &PluginId, key: &str) -> StorageResult<Option<Value>> {
        validate_key(key)?;
        let mut namespaces = self.lock();
        let ns = self.namespace(&mut namespaces, plugin_id)?;

        let Some(bytes) = self.backend.read(plugin_id.as_str(), RecordKind::Entry, key)? else {
            return Ok(None);
        };
        let entry: StorageEntry = serde_json::from_slice(&bytes)?;

        let now = now_millis();
        if entry.is_expired_at(now) {
            debug!(plugin_id = %plugin_id, key, "Entry expired on read");
            self.delete_keys(plugin_id, ns, &[key.to_string()])?;
            return Ok(None);
        }

        let value = Self::open_entry(plugin_id, key, &ns.key, &entry)?;

        if ns.metadata.contains_key(key) {
            let mut next = ns.metadata.clone();
            if let Some(meta) = next.get_mut(key) {
                meta.access_count += 1;
                meta.last_accessed_at = Some(now);
            }
            let mut batch = WriteBatch::new();
            batch.push(Self::metadata_record(&next)?);
            self.backend.commit(plugin_id.as_str(), batch)?;
            ns.metadata = next;
        }

        Ok(Some(value))
    }

    /// Deletes a key with its metadata and backup. Returns whether it existed.
    /// Removing an absent key is a no-op.
    pub fn remove(&self, plugin_id: &PluginId, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        let mut namespaces = self.lock();
        let ns = self.namespace(&mut namespaces, plugin_id)?;
        let existed = ns.metadata.contains_key(key)
            || self
                .backend
                .read(plugin_id.as_str(), RecordKind::Entry, key)?
                .is_some();
        if existed {
            self.delete_keys(plugin_id, ns, &[key.to_string()])?;
        }
        Ok(existed)
    }

    fn delete_keys(
        &self,
        plugin_id: &PluginId,
        ns: &mut Namespace,
        keys: &[String],
    ) -> StorageResult<()> {
        let mut next = ns.metadata.clone();
        let mut batch = WriteBatch::new();
        for key in keys {
            next.remove(key);
            batch
                .push(BatchOp::delete(RecordKind::Entry, key.as_str()))
                .push(BatchOp::delete(RecordKind::Backup, key.as_str()));
        }
        batch.push(Self::metadata_record(&next)?);
        self.backend.commit(plugin_id.as_str(), batch)?;
        ns.metadata = next;
        Ok(())
    }

    /// Wipes the whole namespace: entries, backups, metadata and salt.
    pub fn clear(&self, plugin_id: &PluginId) -> StorageResult<()> {
        let mut namespaces = self.lock();
        self.backend
            .commit(plugin_id.as_str(), WriteBatch::replacing())?;
        namespaces.remove(plugin_id);
        self.ephemeral_keys().remove(plugin_id);
        info!(plugin_id = %plugin_id, "Cleared storage namespace");
        Ok(())
    }

    /// All keys of a namespace, sorted.
    pub fn list_keys(&self, plugin_id: &PluginId) -> StorageResult<Vec<String>> {
        let mut namespaces = self.lock();
        let ns = self.namespace(&mut namespaces, plugin_id)?;
        Ok(ns.metadata.keys().cloned().collect())
    }

    /// Keys whose metadata carries every tag in `tags`.
    pub fn find_by_tags(&self, plugin_id: &PluginId, tags: &[String]) -> StorageResult<Vec<String>> {
        let mut namespaces = self.lock();
        let ns = self.namespace(&mut namespaces, plugin_id)?;
        Ok(ns
            .metadata
            .values()
            .filter(|m| m.has_all_tags(tags))
            .map(|m| m.key.clone())
            .collect())
    }

    pub fn get_metadata(
        &self,
        plugin_id: &PluginId,
        key: &str,
    ) -> StorageResult<Option<StorageMetadata>> {
        let mut namespaces = self.lock();
        let ns = self.namespace(&mut namespaces, plugin_id)?;
        Ok(ns.metadata.get(key).cloned())
    }

    pub fn get_quota(&self, plugin_id: &PluginId) -> StorageResult<Quota> {
        let mut namespaces = self.lock();
        let ns = self.namespace(&mut namespaces, plugin_id)?;
        Ok(self.quota_of(plugin_id, ns))
    }

    /// Restores `key` from its backup copy. Returns `false` when no backup exists.
    pub fn restore_backup(&self, plugin_id: &PluginId, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        let mut namespaces = self.lock();
        let ns = self.namespace(&mut namespaces, plugin_id)?;

        let Some(bytes) = self.backend.read(plugin_id.as_str(), RecordKind::Backup, key)? else {
            return Ok(false);
        };
        let entry: StorageEntry = serde_json::from_slice(&bytes)?;
        let size = entry.size_bytes();
        let previous = ns.metadata.get(key);

        self.quota_of(plugin_id, ns)
            .check_write(previous.map(|m| m.size_bytes), size)
            .map_err(|limit| StorageError::QuotaExceeded {
                plugin_id: plugin_id.to_string(),
                limit,
            })?;

        let now = now_millis();
        let metadata = StorageMetadata {
            plugin_id: plugin_id.to_string(),
            key: key.to_string(),
            size_bytes: size,
            created_at: previous.map_or(entry.created_at, |m| m.created_at),
            updated_at: now,
            access_count: previous.map_or(0, |m| m.access_count),
            last_accessed_at: previous.and_then(|m| m.last_accessed_at),
            expires_at: entry.expires_at,
            tags: previous.map(|m| m.tags.clone()).unwrap_or_default(),
        };
        let mut next = ns.metadata.clone();
        next.insert(key.to_string(), metadata);

        let mut batch = WriteBatch::new();
        batch
            .push(BatchOp::put(RecordKind::Entry, key, bytes))
            .push(Self::metadata_record(&next)?);
        self.backend.commit(plugin_id.as_str(), batch)?;
        ns.metadata = next;
        info!(plugin_id = %plugin_id, key, "Restored entry from backup");
        Ok(true)
    }

    /// Captures the namespace: every entry, the full metadata and the salt.
    pub fn export_namespace(&self, plugin_id: &PluginId) -> StorageResult<NamespaceSnapshot> {
        let mut namespaces = self.lock();
        let ns = self.namespace(&mut namespaces, plugin_id)?;
        let ns_name = plugin_id.as_str();

        let mut entries = BTreeMap::new();
        for key in self.backend.list(ns_name, RecordKind::Entry)? {
            if let Some(bytes) = self.backend.read(ns_name, RecordKind::Entry, &key)? {
                entries.insert(key, serde_json::from_slice::<StorageEntry>(&bytes)?);
            }
        }

        Ok(NamespaceSnapshot {
            entries,
            metadata: ns.metadata.clone(),
            salt: ns.salt.to_base64(),
        })
    }

    /// Replaces the namespace with the snapshot's content in one atomic commit.
    ///
    /// With password keys the snapshot salt takes effect, so a snapshot
    /// exported under the same password on another host decrypts here.
    /// With ephemeral keys the current namespace key is kept.
    pub fn import_namespace(
        &self,
        plugin_id: &PluginId,
        snapshot: NamespaceSnapshot,
    ) -> StorageResult<()> {
        let salt = Salt::from_base64(&snapshot.salt)
            .map_err(|e| StorageError::SnapshotInvalid(format!("bad salt: {e}")))?;
        for key in snapshot.entries.keys() {
            validate_key(key)?;
        }
        if let Some(stray) = snapshot
            .metadata
            .keys()
            .find(|k| !snapshot.entries.contains_key(*k))
        {
            return Err(StorageError::SnapshotInvalid(format!(
                "metadata for '{stray}' has no entry"
            )));
        }

        let now = now_millis();
        let mut metadata = BTreeMap::new();
        for (key, entry) in &snapshot.entries {
            let meta = match snapshot.metadata.get(key) {
                Some(m) => StorageMetadata {
                    plugin_id: plugin_id.to_string(),
                    key: key.clone(),
                    size_bytes: entry.size_bytes(),
                    ..m.clone()
                },
                None => StorageMetadata {
                    plugin_id: plugin_id.to_string(),
                    key: key.clone(),
                    size_bytes: entry.size_bytes(),
                    created_at: entry.created_at,
                    updated_at: now,
                    access_count: 0,
                    last_accessed_at: None,
                    expires_at: entry.expires_at,
                    tags: Vec::new(),
                },
            };
            metadata.insert(key.clone(), meta);
        }

        let (max_size, max_keys) = self.config.limits_for(plugin_id.as_str());
        let quota = Quota::from_metadata(max_size, max_keys, metadata.values());
        if quota.current_size_bytes > max_size {
            return Err(StorageError::QuotaExceeded {
                plugin_id: plugin_id.to_string(),
                limit: crate::quota::QuotaLimit::Size {
                    max_size_bytes: max_size,
                    current_size_bytes: 0,
                    attempted_size_bytes: quota.current_size_bytes,
                },
            });
        }
        if quota.current_keys > max_keys {
            return Err(StorageError::QuotaExceeded {
                plugin_id: plugin_id.to_string(),
                limit: crate::quota::QuotaLimit::Keys {
                    max_keys,
                    current_keys: quota.current_keys,
                },
            });
        }

        let mut namespaces = self.lock();
        let key = self.namespace_key(plugin_id, &salt)?;

        let mut batch = WriteBatch::replacing();
        batch.push(BatchOp::put(
            RecordKind::Salt,
            "",
            salt.to_base64().into_bytes(),
        ));
        for (key_name, entry) in &snapshot.entries {
            batch.push(BatchOp::put(
                RecordKind::Entry,
                key_name.as_str(),
                serde_json::to_vec(entry)?,
            ));
        }
        batch.push(Self::metadata_record(&metadata)?);
        self.backend.commit(plugin_id.as_str(), batch)?;

        info!(
            plugin_id = %plugin_id,
            keys = metadata.len(),
            "Imported storage namespace"
        );
        namespaces.insert(
            plugin_id.clone(),
            Namespace {
                salt,
                key,
                metadata,
            },
        );
        Ok(())
    }

    /// Deletes every expired entry in every namespace. Returns how many were removed.
    pub fn sweep_expired(&self) -> StorageResult<usize> {
        let now = now_millis();
        let mut removed = 0;
        let mut namespaces = self.lock();
        for name in self.backend.namespaces()? {
            let plugin_id = match PluginId::new(name.as_str()) {
                Ok(id) => id,
                Err(e) => {
                    warn!(namespace = %name, error = %e, "Skipping unrecognised namespace in sweep");
                    continue;
                }
            };
            let ns = match self.namespace(&mut namespaces, &plugin_id) {
                Ok(ns) => ns,
                Err(e) => {
                    warn!(plugin_id = %plugin_id, error = %e, "Skipping unreadable namespace in sweep");
                    continue;
                }
            };
            let expired: Vec<String> = ns
                .metadata
                .values()
                .filter(|m| m.is_expired_at(now))
                .map(|m| m.key.clone())
                .collect();
            if expired.is_empty() {
                continue;
            }
            if let Err(e) = self.delete_keys(&plugin_id, ns, &expired) {
                warn!(plugin_id = %plugin_id, error = %e, "Failed to delete expired entries");
                continue;
            }
            debug!(plugin_id = %plugin_id, count = expired.len(), "Swept expired entries");
            removed += expired.len();
        }
        Ok(removed)
    }

    /// Drops the cached state of a namespace. The next access reloads it
    /// from the backend. An ephemeral namespace key is kept.
    pub fn evict(&self, plugin_id: &PluginId) {
        self.lock().remove(plugin_id);
    }
}

fn validate_key(key: &str) -> StorageResult<()> {
    let reason = if key.is_empty() {
        "empty"
    } else if key.len() > MAX_KEY_LEN {
        "longer than 256 bytes"
    } else if RESERVED_KEYS.contains(&key) {
        "reserved name"
    } else {
        return Ok(());
    };
    Err(StorageError::InvalidKey {
        key: key.to_string(),
        reason,
    })
}
