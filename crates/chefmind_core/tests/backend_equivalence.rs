use chefmind_core::model::record::{CREATED_AT_FIELD, UPDATED_AT_FIELD};
use chefmind_core::{
    MemoryBackend, ObjectStoreBackend, Query, Record, Row, SortDirection, SqlBackend,
    StorageBackend, StoreError,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn backends() -> Vec<Arc<dyn StorageBackend>> {
    vec![
        Arc::new(SqlBackend::in_memory().unwrap()),
        Arc::new(ObjectStoreBackend::in_memory().unwrap()),
        Arc::new(MemoryBackend::new()),
    ]
}

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn visible(record: &Record) -> Row {
    let mut fields = record.fields().clone();
    fields.remove(CREATED_AT_FIELD);
    fields.remove(UPDATED_AT_FIELD);
    fields
}

fn seed_recipes(backend: &dyn StorageBackend) {
    let recipes = [
        json!({"title": "Mapo Tofu", "cuisine_type": "Sichuan", "cooking_time": 25, "difficulty": "medium"}),
        json!({"title": "Kung Pao Chicken", "cuisine_type": "Sichuan", "cooking_time": 30, "difficulty": "medium"}),
        json!({"title": "Char Siu", "cuisine_type": "Cantonese", "cooking_time": 90, "difficulty": "hard"}),
        json!({"title": "Steamed Fish", "cuisine_type": "Cantonese", "cooking_time": 20}),
        json!({"title": "Dan Dan Noodles", "cuisine_type": "Sichuan", "cooking_time": 25, "difficulty": "easy"}),
    ];
    for recipe in recipes {
        backend.insert("recipes", &row(recipe)).unwrap();
    }
}

fn ids(records: &[Record]) -> Vec<i64> {
    records.iter().map(Record::id).collect()
}

#[test]
fn inserts_produce_identical_records() {
    let payload = row(json!({
        "title": "Tomato Scrambled Eggs",
        "tags": ["quick", "vegetarian"],
        "nutrition_info": {"calories": 220},
        "is_ai_generated": true,
        "average_rating": 4.5,
        "servings": 2,
        "description": null
    }));

    let mut stored = Vec::new();
    for backend in backends() {
        let record = backend.insert("recipes", &payload).unwrap();
        assert_eq!(record.id(), 1, "{:?}", backend.kind());
        assert_eq!(record.created_at(), record.updated_at());
        assert!(record.get("description").is_none());
        stored.push(visible(&record));
    }

    let expected = row(json!({
        "id": 1,
        "title": "Tomato Scrambled Eggs",
        "tags": "[\"quick\",\"vegetarian\"]",
        "nutrition_info": "{\"calories\":220}",
        "is_ai_generated": 1,
        "average_rating": 4.5,
        "servings": 2
    }));
    for fields in stored {
        assert_eq!(fields, expected);
    }
}

#[test]
fn reserved_fields_in_payload_are_ignored() {
    for backend in backends() {
        let record = backend
            .insert(
                "recipes",
                &row(json!({"id": 99, "created_at": 5, "updated_at": 5, "title": "Wontons"})),
            )
            .unwrap();
        assert_eq!(record.id(), 1);
        assert!(record.created_at() > 5);
    }
}

#[test]
fn filtering_ordering_and_pagination_agree() {
    let query = Query::new()
        .filter_eq("cuisine_type", "Sichuan")
        .order_by("cooking_time", SortDirection::Desc)
        .limit(2)
        .offset(1);

    for backend in backends() {
        seed_recipes(backend.as_ref());

        let page = backend.find("recipes", &query).unwrap();
        // Sichuan by cooking_time desc: 2 (30), 1 (25), 5 (25); ties by id.
        assert_eq!(ids(&page), vec![1, 5], "{:?}", backend.kind());

        let total = backend.count("recipes", &query).unwrap();
        assert_eq!(total, 3);

        let everything = backend.find("recipes", &Query::new()).unwrap();
        assert_eq!(ids(&everything), vec![1, 2, 3, 4, 5]);
    }
}

#[test]
fn missing_fields_sort_first_ascending() {
    let query = Query::new().order_by("difficulty", SortDirection::Asc);
    for backend in backends() {
        seed_recipes(backend.as_ref());
        let sorted = backend.find("recipes", &query).unwrap();
        assert_eq!(ids(&sorted), vec![4, 5, 3, 1, 2], "{:?}", backend.kind());
    }
}

#[test]
fn prefix_and_equality_filters_combine() {
    let query = Query::new()
        .filter_prefix("title", "Dan")
        .filter_eq("difficulty", "easy");
    for backend in backends() {
        seed_recipes(backend.as_ref());
        let found = backend.find("recipes", &query).unwrap();
        assert_eq!(ids(&found), vec![5]);
        assert_eq!(found[0].get_str("title"), Some("Dan Dan Noodles"));
    }
}

#[test]
fn find_one_ignores_pagination() {
    let query = Query::new()
        .filter_eq("cuisine_type", "Cantonese")
        .offset(1)
        .limit(5);
    for backend in backends() {
        seed_recipes(backend.as_ref());
        let first = backend.find_one("recipes", &query).unwrap().unwrap();
        assert_eq!(first.id(), 3);

        let none = backend
            .find_one("recipes", &Query::new().filter_eq("cuisine_type", "Hunan"))
            .unwrap();
        assert!(none.is_none());
    }
}

#[test]
fn updates_merge_and_null_removes_fields() {
    for backend in backends() {
        seed_recipes(backend.as_ref());
        let before = backend
            .find_one("recipes", &Query::new().filter_eq("id", 3))
            .unwrap()
            .unwrap();

        let updated = backend
            .update(
                "recipes",
                3,
                &row(json!({"difficulty": null, "servings": 4, "id": 40})),
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.id(), 3);
        assert_eq!(updated.get_str("title"), Some("Char Siu"));
        assert_eq!(updated.get_i64("servings"), Some(4));
        assert!(updated.get("difficulty").is_none());
        assert_eq!(updated.created_at(), before.created_at());
        assert!(updated.updated_at() > before.updated_at());

        assert!(backend
            .update("recipes", 404, &row(json!({"servings": 1})))
            .unwrap()
            .is_none());
    }
}

#[test]
fn deletes_report_existence_and_ids_are_not_reused() {
    for backend in backends() {
        seed_recipes(backend.as_ref());
        assert!(backend.delete("recipes", 5).unwrap());
        assert!(!backend.delete("recipes", 5).unwrap());

        assert_eq!(backend.clear("recipes").unwrap(), 4);
        assert_eq!(backend.count("recipes", &Query::new()).unwrap(), 0);

        let next = backend
            .insert("recipes", &row(json!({"title": "Hot Pot"})))
            .unwrap();
        assert_eq!(next.id(), 6, "{:?}", backend.kind());
    }
}

#[test]
fn bulk_insert_assigns_consecutive_ids() {
    let rows = vec![
        row(json!({"title": "Spring Rolls"})),
        row(json!({"title": "Egg Tarts"})),
        row(json!({"title": "Sesame Balls"})),
    ];
    for backend in backends() {
        let inserted = backend.bulk_insert("recipes", &rows).unwrap();
        assert_eq!(ids(&inserted), vec![1, 2, 3]);
    }
}

#[test]
fn unsafe_identifiers_are_rejected_everywhere() {
    for backend in backends() {
        let table_err = backend.find("recipes\"--", &Query::new()).unwrap_err();
        assert!(matches!(table_err, StoreError::InvalidIdentifier(_)));

        let field_err = backend
            .insert("recipes", &row(json!({"title": "x", "bad field": 1})))
            .unwrap_err();
        assert!(matches!(field_err, StoreError::InvalidIdentifier(_)));

        let query_err = backend
            .find("recipes", &Query::new().filter_eq("1=1 OR title", "x"))
            .unwrap_err();
        assert!(matches!(query_err, StoreError::InvalidIdentifier(_)));
    }
}

#[test]
fn list_tables_covers_application_tables() {
    for backend in backends() {
        let tables = backend.list_tables().unwrap();
        for expected in ["favorites", "recipes", "sync_queue", "users"] {
            assert!(tables.iter().any(|name| name == expected), "{expected}");
        }
        assert!(!tables.iter().any(|name| name == "health_check"));
        let mut sorted = tables.clone();
        sorted.sort();
        assert_eq!(tables, sorted);
    }
}

#[test]
fn raw_queries_only_run_on_sql() {
    for backend in backends() {
        backend
            .insert("recipes", &row(json!({"title": "Congee"})))
            .unwrap();
        let rows = backend
            .raw_query("SELECT title FROM recipes WHERE title = ?1", &[json!("Congee")])
            .unwrap();
        if backend.supports_raw_query() {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0]["title"], json!("Congee"));
        } else {
            assert!(rows.is_empty());
        }
    }
}

#[test]
fn closed_backends_reject_work() {
    for backend in backends() {
        backend.close().unwrap();
        backend.close().unwrap();
        let err = backend.find("recipes", &Query::new()).unwrap_err();
        assert!(matches!(err, StoreError::Closed), "{:?}", backend.kind());
    }
}

#[test]
fn column_types_are_applied_identically() {
    let payload = row(json!({
        "title": "Red Braised Pork",
        "average_rating": 4,
        "cooking_time": "25",
        "servings": 4.0,
        "category": 7
    }));

    for backend in backends() {
        let record = backend.insert("recipes", &payload).unwrap();
        let fields = visible(&record);
        assert_eq!(
            fields,
            row(json!({
                "id": 1,
                "title": "Red Braised Pork",
                "average_rating": 4.0,
                "cooking_time": 25,
                "servings": 4,
                "category": "7"
            })),
            "{:?}",
            backend.kind()
        );

        let by_text = Query::new().filter_eq("category", "7");
        let by_number = Query::new().filter_eq("category", 7);
        let by_time = Query::new().filter_eq("cooking_time", "25");
        assert_eq!(backend.count("recipes", &by_text).unwrap(), 1);
        assert_eq!(backend.count("recipes", &by_number).unwrap(), 1);
        assert_eq!(backend.find("recipes", &by_time).unwrap().len(), 1);

        let updated = backend
            .update("recipes", 1, &row(json!({"average_rating": "3.5"})))
            .unwrap()
            .unwrap();
        assert_eq!(updated.get("average_rating"), Some(&json!(3.5)));
    }
}
