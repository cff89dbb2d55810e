use chefmind_core::bootstrap::SAMPLE_SESSION_ID;
use chefmind_core::{
    select_backend, BackendKind, HostEnvironment, ObjectStoreBackend, ObjectStoreSchema,
    ObjectStoreSettings, Query, SqliteSettings, StorageBackend, StorageConfig,
};

#[test]
fn server_host_uses_embedded_sql() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default()
        .with_host(HostEnvironment::Server)
        .with_sqlite(SqliteSettings::file(dir.path().join("data").join("chefmind.db")));

    let selected = select_backend(&config).unwrap();

    assert_eq!(selected.selection.active, BackendKind::EmbeddedSql);
    assert_eq!(selected.selection.host, HostEnvironment::Server);
    assert!(!selected.selection.used_fallback());
    assert_eq!(selected.selection.seeded_records, 0);
    assert_eq!(
        selected.backend.count("recipes", &Query::new()).unwrap(),
        0
    );
}

#[test]
fn unusable_sql_path_falls_back_to_seeded_memory() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-directory");
    std::fs::write(&blocker, b"plain file").unwrap();
    let config = StorageConfig::default()
        .with_host(HostEnvironment::Server)
        .with_sqlite(SqliteSettings::file(blocker.join("chefmind.db")));

    let selected = select_backend(&config).unwrap();

    assert_eq!(selected.selection.active, BackendKind::Memory);
    assert_eq!(selected.backend.kind(), BackendKind::Memory);
    assert_eq!(selected.selection.fallback_chain.len(), 1);
    assert_eq!(
        selected.selection.fallback_chain[0].attempted,
        BackendKind::EmbeddedSql
    );
    assert!(!selected.selection.fallback_chain[0].error.is_empty());
    assert_eq!(selected.selection.seeded_records, 4);

    let recipes = selected.backend.find("recipes", &Query::new()).unwrap();
    assert_eq!(recipes.len(), 2);
    let favorite = selected
        .backend
        .find_one(
            "favorites",
            &Query::new().filter_eq("session_id", SAMPLE_SESSION_ID),
        )
        .unwrap()
        .unwrap();
    assert_eq!(favorite.get_i64("recipe_id"), Some(recipes[0].id()));
}

#[test]
fn browser_host_uses_object_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default()
        .with_host(HostEnvironment::Browser)
        .with_object_store(ObjectStoreSettings {
            available: true,
            persist_dir: Some(dir.path().to_path_buf()),
        });

    let selected = select_backend(&config).unwrap();

    assert_eq!(selected.selection.active, BackendKind::ObjectStore);
    assert!(!selected.selection.used_fallback());
    assert!(!selected.backend.supports_raw_query());
}

#[test]
fn browser_without_object_store_falls_back() {
    let config = StorageConfig::default()
        .with_host(HostEnvironment::Browser)
        .with_object_store(ObjectStoreSettings {
            available: false,
            persist_dir: None,
        });

    let selected = select_backend(&config).unwrap();

    assert_eq!(selected.selection.active, BackendKind::Memory);
    assert_eq!(
        selected.selection.fallback_chain[0].attempted,
        BackendKind::ObjectStore
    );
    assert_eq!(selected.selection.seeded_records, 4);
}

#[test]
fn object_store_from_the_future_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let schema = ObjectStoreSchema::chefmind();
    let future = schema.version + 5;
    ObjectStoreBackend::open(schema.with_version(future), Some(dir.path().to_path_buf()))
        .unwrap()
        .close()
        .unwrap();

    let config = StorageConfig::default()
        .with_host(HostEnvironment::Browser)
        .with_object_store(ObjectStoreSettings {
            available: true,
            persist_dir: Some(dir.path().to_path_buf()),
        });

    let selected = select_backend(&config).unwrap();

    assert_eq!(selected.selection.active, BackendKind::Memory);
    assert!(selected.selection.fallback_chain[0]
        .error
        .contains("newer than requested"));
}

#[test]
fn environment_host_override_is_honoured() {
    let config = StorageConfig::from_lookup(|key| match key {
        "CHEFMIND_STORAGE_HOST" => Some("web".to_string()),
        _ => None,
    })
    .with_object_store(ObjectStoreSettings {
        available: true,
        persist_dir: None,
    });

    let selected = select_backend(&config).unwrap();
    assert_eq!(selected.selection.host, HostEnvironment::Browser);
    assert_eq!(selected.selection.active, BackendKind::ObjectStore);
}
