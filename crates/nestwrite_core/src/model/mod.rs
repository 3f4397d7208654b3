//! Record, schema and embedded-binding model.
//!
//! # Responsibility
//! - Define the record shape exchanged with stores and callers.
//! - Declare schemas and embedded field bindings at setup time.
//!
//! # Invariants
//! - Every stored record is identified by a store-assigned `RecordId`.
//! - Configuration is validated once, before any save runs.

pub mod binding;
pub mod record;
pub mod schema;
