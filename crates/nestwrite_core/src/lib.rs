//! Core logic for nestwrite.
//! Saves parent records together with their embedded child collections,
//! inferring create/update/delete per child from identifier presence.

pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use logging::{default_log_level, init_logging, logging_status, LoggingConfig};
pub use model::binding::{DeleteGuard, EmbeddedResource, EmbeddedResourceBuilder, FieldBinding};
pub use model::record::{Record, RecordId};
pub use model::schema::{
    ConfigError, FieldError, FieldKind, FieldSpec, SchemaAdapter, TableSchema, TableSchemaBuilder,
    ValidationMode,
};
pub use repo::record_repo::{RecordStore, SqliteRecordStore, StoreError, StoreResult};
pub use service::error::{SaveError, SaveResult};
pub use service::reconciler::{reconcile, PlannedCreate, PlannedUpdate, ReconciliationPlan};
pub use service::save_service::{FieldSelection, ParentSaveService};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
