//! Table catalogue shared by all backends.

use crate::db::migrations::latest_version;
use crate::model::ident::is_valid_identifier;
use crate::model::record::{CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use crate::model::{Condition, Query, Row};
use crate::store::{StoreError, StoreResult};
use serde_json::Value;

pub const USERS: &str = "users";
pub const RECIPES: &str = "recipes";
pub const FAVORITES: &str = "favorites";
pub const RATINGS: &str = "ratings";
pub const SHOPPING_LISTS: &str = "shopping_lists";
pub const USER_SESSIONS: &str = "user_sessions";
pub const ANALYTICS: &str = "analytics";
pub const SEARCH_HISTORY: &str = "search_history";
pub const SYNC_QUEUE: &str = "sync_queue";

/// Disposable table written by health probes.
pub const HEALTH_CHECK_TABLE: &str = "health_check";

/// Application tables in creation order.
pub const KNOWN_TABLES: [&str; 9] = [
    USERS,
    RECIPES,
    FAVORITES,
    RATINGS,
    SHOPPING_LISTS,
    USER_SESSIONS,
    ANALYTICS,
    SEARCH_HISTORY,
    SYNC_QUEUE,
];

/// Secondary lookup columns per table as `(table, column, unique)`.
pub const LOOKUP_COLUMNS: &[(&str, &str, bool)] = &[
    (USERS, "session_id", true),
    (RECIPES, "category", false),
    (RECIPES, "cuisine_type", false),
    (RECIPES, "created_at", false),
    (FAVORITES, "session_id", false),
    (FAVORITES, "recipe_id", false),
    (RATINGS, "recipe_id", false),
    (SHOPPING_LISTS, "session_id", false),
    (USER_SESSIONS, "session_id", true),
    (USER_SESSIONS, "expires_at", false),
    (ANALYTICS, "session_id", false),
    (ANALYTICS, "event_type", false),
    (SEARCH_HISTORY, "session_id", false),
    (SYNC_QUEUE, "status", false),
];

/// Type affinity of a declared column, as SQLite assigns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnAffinity {
    Integer,
    Real,
    Text,
}

use ColumnAffinity::{Integer as INT, Real as REAL, Text as TEXT};

/// Declared payload columns per known table. Must match migration 1.
pub const COLUMN_AFFINITIES: &[(&str, &[(&str, ColumnAffinity)])] = &[
    (
        USERS,
        &[
            ("session_id", TEXT),
            ("preferences", TEXT),
            ("dietary_restrictions", TEXT),
            ("favorite_cuisines", TEXT),
            ("cooking_skill_level", TEXT),
        ],
    ),
    (
        RECIPES,
        &[
            ("title", TEXT),
            ("description", TEXT),
            ("ingredients", TEXT),
            ("instructions", TEXT),
            ("cooking_time", INT),
            ("servings", INT),
            ("difficulty", TEXT),
            ("cuisine_type", TEXT),
            ("category", TEXT),
            ("tags", TEXT),
            ("nutrition_info", TEXT),
            ("image_url", TEXT),
            ("source", TEXT),
            ("is_ai_generated", INT),
            ("view_count", INT),
            ("like_count", INT),
            ("average_rating", REAL),
            ("rating_count", INT),
        ],
    ),
    (
        FAVORITES,
        &[("session_id", TEXT), ("recipe_id", INT), ("notes", TEXT)],
    ),
    (
        RATINGS,
        &[
            ("session_id", TEXT),
            ("recipe_id", INT),
            ("rating", INT),
            ("review", TEXT),
        ],
    ),
    (
        SHOPPING_LISTS,
        &[
            ("session_id", TEXT),
            ("name", TEXT),
            ("items", TEXT),
            ("is_completed", INT),
        ],
    ),
    (
        USER_SESSIONS,
        &[
            ("session_id", TEXT),
            ("user_data", TEXT),
            ("last_activity", INT),
            ("expires_at", INT),
        ],
    ),
    (
        ANALYTICS,
        &[
            ("session_id", TEXT),
            ("event_type", TEXT),
            ("event_data", TEXT),
            ("page", TEXT),
            ("action", TEXT),
        ],
    ),
    (
        SEARCH_HISTORY,
        &[
            ("session_id", TEXT),
            ("query", TEXT),
            ("filters", TEXT),
            ("results_count", INT),
        ],
    ),
    (
        SYNC_QUEUE,
        &[
            ("table_name", TEXT),
            ("record_id", INT),
            ("operation", TEXT),
            ("payload", TEXT),
            ("status", TEXT),
            ("attempts", INT),
            ("max_attempts", INT),
            ("last_error", TEXT),
        ],
    ),
];

/// Affinity of `column` in a known table; `None` for ad hoc tables and
/// undeclared columns.
pub fn column_affinity(table: &str, column: &str) -> Option<ColumnAffinity> {
    if !is_known_table(table) {
        return None;
    }
    if [ID_FIELD, CREATED_AT_FIELD, UPDATED_AT_FIELD].contains(&column) {
        return Some(ColumnAffinity::Integer);
    }
    COLUMN_AFFINITIES
        .iter()
        .find(|(name, _)| *name == table)
        .and_then(|(_, columns)| columns.iter().find(|(name, _)| *name == column))
        .map(|(_, affinity)| *affinity)
}

/// Converts a normalised scalar the way SQLite stores it in a column of
/// `affinity`.
///
/// Numeric columns take well-formed numeric text as a number, and reals
/// with no fractional part become integers in INTEGER columns. Text
/// columns store numbers as their text form.
pub fn apply_affinity(affinity: ColumnAffinity, value: &Value) -> Value {
    match (affinity, value) {
        (ColumnAffinity::Text, Value::Number(number)) => Value::String(match number.as_f64() {
            Some(real) if !number.is_i64() && !number.is_u64() => real_text(real),
            _ => number.to_string(),
        }),
        (ColumnAffinity::Integer, Value::String(text)) => match parse_numeric(text) {
            Some(real) => integer_or_real(real, text.trim()),
            None => value.clone(),
        },
        (ColumnAffinity::Integer, Value::Number(number)) if !number.is_i64() => {
            match number.as_f64() {
                Some(real) => integer_or_real(real, ""),
                None => value.clone(),
            }
        }
        (ColumnAffinity::Real, Value::String(text)) => match parse_numeric(text) {
            Some(real) => real_value(real),
            None => value.clone(),
        },
        (ColumnAffinity::Real, Value::Number(number)) => match number.as_f64() {
            Some(real) => real_value(real),
            None => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Applies column affinities to a normalised write payload.
pub fn conform_payload(table: &str, mut payload: Row) -> Row {
    for (field, value) in payload.iter_mut() {
        if let Some(affinity) = column_affinity(table, field) {
            *value = apply_affinity(affinity, value);
        }
    }
    payload
}

/// Applies column affinities to equality operands so comparisons see
/// stored representations.
pub fn conform_query(table: &str, query: &Query) -> Query {
    let mut conformed = query.clone();
    for (field, condition) in conformed.conditions.iter_mut() {
        if let (Condition::Eq(value), Some(affinity)) = (condition, column_affinity(table, field)) {
            *value = apply_affinity(affinity, value);
        }
    }
    conformed
}

fn parse_numeric(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let literal = !trimmed.is_empty()
        && trimmed.chars().any(|ch| ch.is_ascii_digit())
        && trimmed
            .chars()
            .all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | 'e' | 'E' | '+' | '-'));
    if !literal {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|real| real.is_finite())
}

fn integer_or_real(real: f64, text: &str) -> Value {
    if let Ok(integer) = text.parse::<i64>() {
        return Value::from(integer);
    }
    // i64::MAX is not exactly representable; the bound is exclusive.
    let in_range = (-9.223_372_036_854_776e18..9.223_372_036_854_776e18).contains(&real);
    if real.fract() == 0.0 && in_range {
        Value::from(real as i64)
    } else {
        real_value(real)
    }
}

fn real_value(real: f64) -> Value {
    serde_json::Number::from_f64(real)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn real_text(real: f64) -> String {
    if real.fract() == 0.0 && real.abs() < 1e15 {
        format!("{real:.1}")
    } else {
        real.to_string()
    }
}

pub fn is_known_table(table: &str) -> bool {
    KNOWN_TABLES.contains(&table)
}

/// Schema version stamped on records of `table`.
///
/// Ad hoc tables that only schemaless engines can hold report `0`.
pub fn table_schema_version(table: &str) -> u32 {
    if is_known_table(table) {
        latest_version()
    } else {
        0
    }
}

pub fn validate_table(table: &str) -> StoreResult<()> {
    if is_valid_identifier(table) {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(table.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        apply_affinity, column_affinity, conform_payload, conform_query, table_schema_version,
        validate_table, ColumnAffinity, COLUMN_AFFINITIES, KNOWN_TABLES, LOOKUP_COLUMNS,
    };
    use crate::db::migrations::latest_version;
    use crate::model::{Condition, Query};
    use serde_json::json;

    #[test]
    fn lookup_columns_reference_known_tables() {
        for (table, _, _) in LOOKUP_COLUMNS {
            assert!(KNOWN_TABLES.contains(table), "{table} is not a known table");
        }
    }

    #[test]
    fn affinity_catalogue_covers_known_tables() {
        assert_eq!(COLUMN_AFFINITIES.len(), KNOWN_TABLES.len());
        for (table, column, _) in LOOKUP_COLUMNS {
            assert!(
                column_affinity(table, column).is_some(),
                "{table}.{column} has no affinity"
            );
        }
        assert_eq!(column_affinity("recipes", "id"), Some(ColumnAffinity::Integer));
        assert_eq!(column_affinity("scratch", "title"), None);
    }

    #[test]
    fn affinity_converts_like_sqlite_columns() {
        use ColumnAffinity::{Integer, Real, Text};

        assert_eq!(apply_affinity(Real, &json!(4)), json!(4.0));
        assert_eq!(apply_affinity(Real, &json!(" 4.5 ")), json!(4.5));
        assert_eq!(apply_affinity(Integer, &json!("25")), json!(25));
        assert_eq!(apply_affinity(Integer, &json!("3.0e+5")), json!(300000));
        assert_eq!(apply_affinity(Integer, &json!(2.0)), json!(2));
        assert_eq!(apply_affinity(Integer, &json!(2.5)), json!(2.5));
        assert_eq!(apply_affinity(Integer, &json!("soon")), json!("soon"));
        assert_eq!(apply_affinity(Integer, &json!("inf")), json!("inf"));
        assert_eq!(apply_affinity(Text, &json!(7)), json!("7"));
        assert_eq!(apply_affinity(Text, &json!(4.0)), json!("4.0"));
        assert_eq!(apply_affinity(Text, &json!(0.5)), json!("0.5"));
    }

    #[test]
    fn payloads_and_filters_are_conformed_for_known_tables_only() {
        let payload = json!({"category": 7, "cooking_time": "25"});
        let payload = payload.as_object().cloned().unwrap();

        let conformed = conform_payload("recipes", payload.clone());
        assert_eq!(conformed["category"], json!("7"));
        assert_eq!(conformed["cooking_time"], json!(25));
        assert_eq!(conform_payload("scratch", payload.clone()), payload);

        let query = conform_query("recipes", &Query::new().filter_eq("category", 7));
        assert_eq!(query.conditions[0].1, Condition::Eq(json!("7")));
    }

    #[test]
    fn schema_version_follows_migrations() {
        assert_eq!(table_schema_version("recipes"), latest_version());
        assert_eq!(table_schema_version("scratch"), 0);
        assert!(validate_table("recipes; --").is_err());
    }
}
