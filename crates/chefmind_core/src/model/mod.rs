//! Backend-neutral record and query model.
//!
//! # Responsibility
//! - Define the record shape every storage backend returns.
//! - Define the query description every backend evaluates.
//! - Own the shared value normalisation so backends agree byte-for-byte.
//!
//! # Invariants
//! - Every stored record carries `id`, `created_at` and `updated_at`.
//! - Identifiers (tables, fields, savepoints) match `[A-Za-z_][A-Za-z0-9_]*`.
//! - A field whose value is `null` is absent from the stored record.

pub mod clock;
pub mod ident;
pub mod query;
pub mod record;

pub use query::{Condition, OrderBy, Query, SortDirection, DEFAULT_QUERY_LIMIT};
pub use record::{Record, RecordId, Row};
