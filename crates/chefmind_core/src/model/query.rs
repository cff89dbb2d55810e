//! Query description and the in-process evaluator used by schemaless backends.
//!
//! # Responsibility
//! - Describe filtering, ordering and pagination independent of any engine.
//! - Evaluate queries over in-process records with the same results the
//!   embedded SQL backend produces.
//!
//! # Invariants
//! - Results are ordered by the requested field, then by `id` ascending.
//! - Unordered queries return records in `id` ascending order.
//! - Value comparison follows SQLite: null < numbers < text; integers and
//!   reals compare numerically.
//! - Prefix matching is case-sensitive and counts characters.

use crate::model::ident::is_valid_identifier;
use crate::model::record::{normalize_value, Record, ID_FIELD};
use crate::store::{StoreError, StoreResult};
use serde_json::Value;
use std::cmp::Ordering;

pub const DEFAULT_QUERY_LIMIT: u32 = 50;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals the value; `null` matches an absent field.
    Eq(Value),
    /// Field text starts with the given prefix.
    Prefix(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

/// Backend-neutral query.
///
/// `limit` defaults to [`DEFAULT_QUERY_LIMIT`]; `count` ignores pagination.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub conditions: Vec<(String, Condition)>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = normalize_value(&value.into());
        self.conditions.push((field.into(), Condition::Eq(value)));
        self
    }

    pub fn filter_prefix(mut self, field: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.conditions
            .push((field.into(), Condition::Prefix(prefix.into())));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
    }

    /// Rejects field names that are not plain identifiers.
    pub fn validate(&self) -> StoreResult<()> {
        let fields = self
            .conditions
            .iter()
            .map(|(field, _)| field)
            .chain(self.order_by.as_ref().map(|order| &order.field));
        for field in fields {
            if !is_valid_identifier(field) {
                return Err(StoreError::InvalidIdentifier(field.clone()));
            }
        }
        Ok(())
    }

    /// Returns `true` when `record` satisfies every condition.
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(field, condition)| condition_matches(record.get(field), condition))
    }

    /// Filters, orders and paginates in-process records.
    pub fn apply(&self, records: impl IntoIterator<Item = Record>) -> Vec<Record> {
        let mut matched: Vec<Record> = records
            .into_iter()
            .filter(|record| self.matches(record))
            .collect();

        matched.sort_by(|left, right| {
            let primary = match &self.order_by {
                Some(order) => {
                    let ordering = compare_values(
                        left.get(&order.field).unwrap_or(&Value::Null),
                        right.get(&order.field).unwrap_or(&Value::Null),
                    );
                    match order.direction {
                        SortDirection::Asc => ordering,
                        SortDirection::Desc => ordering.reverse(),
                    }
                }
                None => Ordering::Equal,
            };
            primary.then_with(|| left.id().cmp(&right.id()))
        });

        matched
            .into_iter()
            .skip(self.offset as usize)
            .take(self.effective_limit() as usize)
            .collect()
    }

    /// Counts matching records, ignoring limit and offset.
    pub fn count<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> usize {
        records
            .into_iter()
            .filter(|record| self.matches(record))
            .count()
    }

    /// First equality condition, used by backends with secondary indexes.
    pub fn first_equality(&self) -> Option<(&str, &Value)> {
        self.conditions
            .iter()
            .find_map(|(field, condition)| match condition {
                Condition::Eq(value) if field != ID_FIELD => Some((field.as_str(), value)),
                _ => None,
            })
    }
}

fn condition_matches(stored: Option<&Value>, condition: &Condition) -> bool {
    let stored = stored.unwrap_or(&Value::Null);
    match condition {
        Condition::Eq(expected) => compare_values(stored, expected) == Ordering::Equal,
        Condition::Prefix(prefix) => match stored {
            Value::String(text) => text.starts_with(prefix.as_str()),
            Value::Number(number) => number.to_string().starts_with(prefix.as_str()),
            _ => false,
        },
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) | Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) | Value::Object(_) => 3,
    }
}

fn as_number(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(flag) => Some(Value::from(i64::from(*flag))),
        Value::Number(_) => Some(value.clone()),
        _ => None,
    }
}

/// Total order over stored values matching SQLite's cross-type comparison.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    let rank = type_rank(left).cmp(&type_rank(right));
    if rank != Ordering::Equal {
        return rank;
    }

    match (left, right) {
        (Value::String(left), Value::String(right)) => left.cmp(right),
        (Value::Null, Value::Null) => Ordering::Equal,
        _ => match (as_number(left), as_number(right)) {
            (Some(Value::Number(left)), Some(Value::Number(right))) => {
                match (left.as_i64(), right.as_i64()) {
                    (Some(left), Some(right)) => left.cmp(&right),
                    _ => {
                        let left = left.as_f64().unwrap_or(f64::NAN);
                        let right = right.as_f64().unwrap_or(f64::NAN);
                        left.partial_cmp(&right).unwrap_or(Ordering::Equal)
                    }
                }
            }
            _ => left.to_string().cmp(&right.to_string()),
        },
    }
}
