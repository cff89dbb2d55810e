//! Stored record shape and write-payload normalisation.
//!
//! # Invariants
//! - `id`, `created_at` and `updated_at` are always present integers.
//! - Payload values are normalised before they reach any backend: booleans
//!   become `0`/`1`, arrays and objects become JSON text.
//! - Reserved fields in a caller payload are ignored; the backend owns them.

use crate::model::ident::is_valid_identifier;
use crate::store::{StoreError, StoreResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field map exchanged with backends and raw queries.
pub type Row = Map<String, Value>;

/// Backend-assigned primary key, unique and increasing per table.
pub type RecordId = i64;

pub const ID_FIELD: &str = "id";
pub const CREATED_AT_FIELD: &str = "created_at";
pub const UPDATED_AT_FIELD: &str = "updated_at";
pub const RESERVED_FIELDS: [&str; 3] = [ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    table: String,
    schema_version: u32,
    fields: Row,
}

impl Record {
    /// Builds a record from stored fields.
    ///
    /// # Errors
    /// - [`StoreError::InvalidData`] when a reserved field is missing or not
    ///   an integer.
    pub fn from_fields(
        table: impl Into<String>,
        schema_version: u32,
        fields: Row,
    ) -> StoreResult<Self> {
        let table = table.into();
        for field in RESERVED_FIELDS {
            if fields.get(field).and_then(Value::as_i64).is_none() {
                return Err(StoreError::InvalidData(format!(
                    "record in `{table}` is missing integer field `{field}`"
                )));
            }
        }
        Ok(Self {
            table,
            schema_version,
            fields,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn id(&self) -> RecordId {
        self.reserved(ID_FIELD)
    }

    /// Epoch milliseconds of the insert.
    pub fn created_at(&self) -> i64 {
        self.reserved(CREATED_AT_FIELD)
    }

    /// Epoch milliseconds of the last write.
    pub fn updated_at(&self) -> i64 {
        self.reserved(UPDATED_AT_FIELD)
    }

    pub fn fields(&self) -> &Row {
        &self.fields
    }

    pub fn into_fields(self) -> Row {
        self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.fields.get(field).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(Value::as_f64)
    }

    /// Reads a `0`/`1` flag column.
    pub fn get_bool(&self, field: &str) -> Option<bool> {
        match self.fields.get(field)? {
            Value::Bool(flag) => Some(*flag),
            Value::Number(number) => number.as_i64().map(|value| value != 0),
            _ => None,
        }
    }

    /// Decodes a field holding JSON text (or a raw JSON value) into `T`.
    ///
    /// Returns `Ok(None)` when the field is absent.
    pub fn decode_json<T: DeserializeOwned>(&self, field: &str) -> StoreResult<Option<T>> {
        match self.fields.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Ok(Some(serde_json::from_str(text)?)),
            Some(other) => Ok(Some(serde_json::from_value(other.clone())?)),
        }
    }

    fn reserved(&self, field: &str) -> i64 {
        // Presence is checked in `from_fields`.
        self.fields.get(field).and_then(Value::as_i64).unwrap_or_default()
    }
}

/// Validates and normalises a caller write payload.
///
/// Reserved fields are dropped. `null` values are kept so updates can
/// clear a field.
///
/// # Errors
/// - [`StoreError::InvalidIdentifier`] for a field name that is not a plain
///   identifier.
pub fn normalize_payload(data: &Row) -> StoreResult<Row> {
    let mut normalized = Row::new();
    for (field, value) in data {
        if RESERVED_FIELDS.contains(&field.as_str()) {
            continue;
        }
        if !is_valid_identifier(field) {
            return Err(StoreError::InvalidIdentifier(field.clone()));
        }
        normalized.insert(field.clone(), normalize_value(value));
    }
    Ok(normalized)
}

/// Maps a JSON value onto the scalar set all backends store.
pub fn normalize_value(value: &Value) -> Value {
    match value {
        Value::Bool(flag) => Value::from(i64::from(*flag)),
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        Value::Null | Value::Number(_) | Value::String(_) => value.clone(),
    }
}

/// Merges normalised changes into stored fields; `null` removes a field.
pub fn apply_changes(target: &mut Row, changes: &Row) {
    for (field, value) in changes {
        if value.is_null() {
            target.remove(field);
        } else {
            target.insert(field.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_changes, normalize_payload, Record, Row};
    use crate::store::StoreError;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn normalize_strips_reserved_fields_and_flattens_values() {
        let payload = row(json!({
            "id": 99,
            "created_at": 1,
            "title": "Soup",
            "is_ai_generated": true,
            "tags": ["quick", "vegan"],
            "nutrition_info": {"calories": 120}
        }));

        let normalized = normalize_payload(&payload).unwrap();
        assert!(!normalized.contains_key("id"));
        assert!(!normalized.contains_key("created_at"));
        assert_eq!(normalized["is_ai_generated"], json!(1));
        assert_eq!(normalized["tags"], json!("[\"quick\",\"vegan\"]"));
        assert_eq!(normalized["nutrition_info"], json!("{\"calories\":120}"));
    }

    #[test]
    fn normalize_rejects_unsafe_field_names() {
        let payload = row(json!({"title; DROP TABLE recipes": "x"}));
        let err = normalize_payload(&payload).unwrap_err();
        assert!(matches!(err, StoreError::InvalidIdentifier(_)));
    }

    #[test]
    fn apply_changes_removes_null_fields() {
        let mut stored = row(json!({"title": "Soup", "description": "Hot"}));
        apply_changes(&mut stored, &row(json!({"description": null, "servings": 2})));
        assert_eq!(stored, row(json!({"title": "Soup", "servings": 2})));
    }

    #[test]
    fn record_requires_reserved_fields_and_decodes_json_text() {
        let missing = Record::from_fields("recipes", 1, row(json!({"id": 1})));
        assert!(matches!(missing, Err(StoreError::InvalidData(_))));

        let record = Record::from_fields(
            "recipes",
            1,
            row(json!({"id": 7, "created_at": 10, "updated_at": 11, "tags": "[\"a\",\"b\"]", "is_ai_generated": 1})),
        )
        .unwrap();
        assert_eq!(record.id(), 7);
        assert_eq!(record.get_bool("is_ai_generated"), Some(true));
        let tags: Vec<String> = record.decode_json("tags").unwrap().unwrap();
        assert_eq!(tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(record.decode_json::<Vec<String>>("missing").unwrap(), None);
    }
}
