use chefmind_core::store::object_store::StoreDef;
use chefmind_core::{
    IsolationLevel, ObjectStoreBackend, ObjectStoreSchema, Query, Row, StorageBackend,
    StoreError, TransactionManager,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn open(dir: &Path) -> ObjectStoreBackend {
    ObjectStoreBackend::open(ObjectStoreSchema::chefmind(), Some(dir.to_path_buf())).unwrap()
}

#[test]
fn records_and_key_generator_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let backend = open(dir.path());
        backend
            .insert("users", &row(json!({"session_id": "s-1"})))
            .unwrap();
        backend
            .insert("recipes", &row(json!({"title": "Zongzi", "category": "festival"})))
            .unwrap();
        backend
            .insert("recipes", &row(json!({"title": "Mooncake", "category": "festival"})))
            .unwrap();
        backend.delete("recipes", 2).unwrap();
        backend.close().unwrap();
    }

    assert!(dir.path().join("ChefMindDB").join("meta.json").exists());
    assert!(dir.path().join("ChefMindDB").join("recipes.json").exists());

    let reopened = open(dir.path());
    let festival = reopened
        .find("recipes", &Query::new().filter_eq("category", "festival"))
        .unwrap();
    assert_eq!(festival.len(), 1);
    assert_eq!(festival[0].get_str("title"), Some("Zongzi"));

    let next = reopened
        .insert("recipes", &row(json!({"title": "Tangyuan"})))
        .unwrap();
    assert_eq!(next.id(), 3);

    let duplicate = reopened
        .insert("users", &row(json!({"session_id": "s-1"})))
        .unwrap_err();
    assert!(matches!(duplicate, StoreError::Constraint(_)));
}

#[test]
fn newer_stored_version_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let schema = ObjectStoreSchema::chefmind();
    let newer = schema.version + 1;
    ObjectStoreBackend::open(schema.clone().with_version(newer), Some(dir.path().to_path_buf()))
        .unwrap()
        .close()
        .unwrap();

    let err = ObjectStoreBackend::open(schema, Some(dir.path().to_path_buf()))
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::Unavailable(_)));
}

#[test]
fn upgrade_adds_new_stores_and_keeps_data() {
    let dir = tempfile::tempdir().unwrap();
    let schema = ObjectStoreSchema::chefmind();
    {
        let backend = open(dir.path());
        backend
            .insert("recipes", &row(json!({"title": "Hot and Sour Soup"})))
            .unwrap();
        backend.close().unwrap();
    }

    let upgraded_schema = schema
        .clone()
        .with_version(schema.version + 1)
        .with_store(StoreDef::new("meal_plans").with_index("session_id", false));
    let upgraded =
        ObjectStoreBackend::open(upgraded_schema, Some(dir.path().to_path_buf())).unwrap();

    assert_eq!(upgraded.count("recipes", &Query::new()).unwrap(), 1);
    let plan = upgraded
        .insert("meal_plans", &row(json!({"session_id": "s-9", "week": 12})))
        .unwrap();
    assert_eq!(plan.schema_version(), 0);
    assert!(upgraded
        .list_tables()
        .unwrap()
        .contains(&"meal_plans".to_string()));
}

#[test]
fn open_transaction_is_not_persisted_until_commit() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn StorageBackend> = Arc::new(open(dir.path()));
    let manager = TransactionManager::new(Arc::clone(&backend));

    manager.begin(IsolationLevel::Immediate).unwrap();
    backend
        .insert("recipes", &row(json!({"title": "Pending"})))
        .unwrap();
    assert_eq!(
        open(dir.path()).count("recipes", &Query::new()).unwrap(),
        0
    );

    manager.commit().unwrap();
    assert_eq!(
        open(dir.path()).count("recipes", &Query::new()).unwrap(),
        1
    );
}

#[test]
fn close_rolls_back_open_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn StorageBackend> = Arc::new(open(dir.path()));
    backend
        .insert("recipes", &row(json!({"title": "Committed"})))
        .unwrap();

    let manager = TransactionManager::new(Arc::clone(&backend));
    manager.begin(IsolationLevel::Immediate).unwrap();
    backend
        .insert("recipes", &row(json!({"title": "Abandoned"})))
        .unwrap();
    backend.close().unwrap();

    let titles: Vec<String> = open(dir.path())
        .find("recipes", &Query::new())
        .unwrap()
        .iter()
        .filter_map(|record| record.get_str("title").map(str::to_string))
        .collect();
    assert_eq!(titles, vec!["Committed"]);
}

#[test]
fn concurrent_writes_and_transactions_do_not_block_each_other() {
    use chefmind_core::transaction::{TransactionDriver, TxStatement};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(open(dir.path()));
    let (done_tx, done_rx) = mpsc::channel();

    let writer = {
        let backend = Arc::clone(&backend);
        let done = done_tx.clone();
        thread::spawn(move || {
            for index in 0..300 {
                backend
                    .insert("recipes", &row(json!({"title": format!("Batch {index}")})))
                    .unwrap();
            }
            done.send("writer").unwrap();
        })
    };
    let controller = {
        let backend = Arc::clone(&backend);
        thread::spawn(move || {
            for _ in 0..300 {
                backend
                    .execute_statement(&TxStatement::Begin(IsolationLevel::Deferred))
                    .unwrap();
                backend.execute_statement(&TxStatement::Rollback).unwrap();
            }
            done_tx.send("controller").unwrap();
        })
    };

    for _ in 0..2 {
        done_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("worker threads stopped making progress");
    }
    writer.join().unwrap();
    controller.join().unwrap();
}

#[test]
fn failed_disk_write_leaves_store_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let backend = open(dir.path());
    let kept = backend
        .insert("recipes", &row(json!({"title": "Kept"})))
        .unwrap();

    let staging = dir.path().join("ChefMindDB").join("recipes.json.tmp");
    std::fs::create_dir(&staging).unwrap();

    assert!(backend
        .insert("recipes", &row(json!({"title": "Lost"})))
        .is_err());
    assert!(backend.delete("recipes", kept.id()).is_err());
    assert!(backend.clear("recipes").is_err());
    assert_eq!(backend.count("recipes", &Query::new()).unwrap(), 1);

    std::fs::remove_dir(&staging).unwrap();
    let next = backend
        .insert("recipes", &row(json!({"title": "Retried"})))
        .unwrap();
    assert_eq!(next.id(), 2);
    backend.close().unwrap();

    let reopened = open(dir.path());
    let titles: Vec<String> = reopened
        .find("recipes", &Query::new())
        .unwrap()
        .iter()
        .filter_map(|record| record.get_str("title").map(str::to_string))
        .collect();
    assert_eq!(titles, vec!["Kept", "Retried"]);
}
