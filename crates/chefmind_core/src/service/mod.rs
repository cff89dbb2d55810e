//! Entry points handed to calling services.
//!
//! # Responsibility
//! - Wrap the selected backend with retries, transactions and health.
//! - Keep callers independent of which engine is active.

pub mod data_access;

pub use data_access::DataAccess;
