//! SQLite backend through the engine.

use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use warden_storage::{
    BackendKind, KeySource, PutOptions, RecordKind, SqliteBackend, StorageBackend, StorageConfig,
    StorageEngine, open_backend,
};
use warden_types::PluginId;

fn pid(id: &str) -> PluginId {
    PluginId::new(id).unwrap()
}

fn config(dir: &TempDir) -> StorageConfig {
    StorageConfig {
        backend: BackendKind::Sqlite,
        path: Some(dir.path().join("nested").join("plugins.db")),
        kdf_iterations: 1_000,
        ..StorageConfig::default()
    }
}

#[test]
fn data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    {
        let engine = StorageEngine::new(
            open_backend(&cfg).unwrap(),
            cfg.clone(),
            KeySource::Password("pw".into()),
        );
        engine
            .put(&pid("notes"), "k", &json!({"persisted": true}), &PutOptions::default().with_tags(["t"]))
            .unwrap();
    }

    let engine = StorageEngine::new(
        open_backend(&cfg).unwrap(),
        cfg.clone(),
        KeySource::Password("pw".into()),
    );
    assert_eq!(
        engine.get(&pid("notes"), "k").unwrap(),
        Some(json!({"persisted": true}))
    );
    assert_eq!(engine.find_by_tags(&pid("notes"), &["t".into()]).unwrap(), vec!["k"]);
}

#[test]
fn ephemeral_engine_over_in_memory_sqlite() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let engine = StorageEngine::new(
        Arc::new(backend),
        StorageConfig {
            kdf_iterations: 1_000,
            ..StorageConfig::default()
        },
        KeySource::Ephemeral,
    );
    engine
        .put(&pid("a"), "x", &json!(1), &PutOptions::default().backed_up())
        .unwrap();
    engine.put(&pid("b"), "y", &json!(2), &PutOptions::default()).unwrap();
    assert_eq!(engine.list_keys(&pid("a")).unwrap(), vec!["x"]);
}

#[test]
fn raw_backend_commit_is_atomic_per_batch() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let mut batch = warden_storage::WriteBatch::new();
    batch
        .push(warden_storage::BatchOp::put(RecordKind::Entry, "a", vec![1]))
        .push(warden_storage::BatchOp::put(RecordKind::Backup, "a", vec![2]));
    backend.commit("ns", batch).unwrap();
    assert_eq!(backend.list("ns", RecordKind::Entry).unwrap(), vec!["a"]);
    assert_eq!(backend.read("ns", RecordKind::Backup, "a").unwrap(), Some(vec![2]));

    backend.commit("ns", warden_storage::WriteBatch::replacing()).unwrap();
    assert!(backend.namespaces().unwrap().is_empty());
}

#[test]
fn sweep_works_against_sqlite() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir);
    let engine = StorageEngine::new(open_backend(&cfg).unwrap(), cfg, KeySource::Ephemeral);
    engine
        .put(&pid("notes"), "old", &json!(1), &PutOptions::default().with_ttl(1))
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));
    assert_eq!(engine.sweep_expired().unwrap(), 1);
}
