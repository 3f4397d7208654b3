//! Persistence layer abstractions and SQLite implementation.
//!
//! # Responsibility
//! - Define the record store contract used by reconciliation.
//! - Isolate SQL details from service orchestration.
//!
//! # Invariants
//! - Store writes receive already validated values.
//! - Store APIs return semantic errors (`NotFound`) in addition to DB
//!   transport errors.

pub mod record_repo;
