use chefmind_core::store::MemorySnapshot;
use chefmind_core::{MemoryBackend, Query, Row, StorageBackend, StoreError};
use serde_json::{json, Value};

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

#[test]
fn snapshot_restores_into_fresh_store_and_keeps_id_sequence() {
    let source = MemoryBackend::new();
    source
        .insert("recipes", &row(json!({"title": "Fried Rice", "servings": 2})))
        .unwrap();
    source
        .insert("recipes", &row(json!({"title": "Chow Mein"})))
        .unwrap();
    source.delete("recipes", 2).unwrap();
    source
        .insert("scratch_notes", &row(json!({"text": "buy ginger"})))
        .unwrap();

    let exported = serde_json::to_string(&source.snapshot().unwrap()).unwrap();
    let imported: MemorySnapshot = serde_json::from_str(&exported).unwrap();

    let target = MemoryBackend::new();
    target.restore(&imported).unwrap();

    let recipes = target.find("recipes", &Query::new()).unwrap();
    assert_eq!(recipes.len(), 1);
    assert_eq!(recipes[0].get_str("title"), Some("Fried Rice"));
    assert_eq!(recipes[0].get_i64("servings"), Some(2));

    let next = target
        .insert("recipes", &row(json!({"title": "Lo Mein"})))
        .unwrap();
    assert_eq!(next.id(), 3);

    let notes = target.find("scratch_notes", &Query::new()).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].schema_version(), 0);
    assert!(target
        .list_tables()
        .unwrap()
        .contains(&"scratch_notes".to_string()));
}

#[test]
fn restore_keeps_known_tables_and_replaces_contents() {
    let backend = MemoryBackend::new();
    backend
        .insert("users", &row(json!({"session_id": "old"})))
        .unwrap();

    backend.restore(&MemorySnapshot::default()).unwrap();

    assert_eq!(backend.count("users", &Query::new()).unwrap(), 0);
    assert!(backend.list_tables().unwrap().contains(&"users".to_string()));
}

#[test]
fn malformed_snapshot_is_rejected_without_changes() {
    let backend = MemoryBackend::new();
    backend
        .insert("recipes", &row(json!({"title": "Survivor"})))
        .unwrap();

    let broken: MemorySnapshot = serde_json::from_value(json!({
        "tables": {
            "recipes": {
                "last_id": 1,
                "records": [{"id": "one", "created_at": 1, "updated_at": 1}]
            }
        }
    }))
    .unwrap();

    let err = backend.restore(&broken).unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));
    assert_eq!(backend.count("recipes", &Query::new()).unwrap(), 1);
}
