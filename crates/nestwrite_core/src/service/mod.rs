//! Reconciliation and parent save services.
//!
//! # Responsibility
//! - Plan and apply embedded collection changes.
//! - Orchestrate scalar + embedded saves inside one transaction.
//!
//! # Invariants
//! - Services never bypass schema validation or the record store contract.
//! - Service layer remains storage-agnostic.

pub mod error;
pub mod reconciler;
pub mod save_service;
