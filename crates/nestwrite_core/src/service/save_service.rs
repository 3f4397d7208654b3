//! Parent save orchestration and read representations.
//!
//! # Responsibility
//! - Split a request body into parent scalars and embedded lists.
//! - Save scalars first, then reconcile every embedded field, in one
//!   transaction.
//! - Recompose the parent representation with refreshed children.
//!
//! # Invariants
//! - An embedded key absent from the body leaves that collection untouched.
//! - Any failure rolls back the scalar save and every child write.
//! - Write responses contain every field; optional fields are only dropped
//!   from reads.

use crate::model::binding::{EmbeddedResource, FieldBinding};
use crate::model::record::{Record, RecordId};
use crate::model::schema::{FieldError, ValidationMode};
use crate::repo::record_repo::{RecordStore, StoreError};
use crate::service::error::{SaveError, SaveResult};
use crate::service::reconciler::reconcile;
use log::{error, info, warn};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

const INCLUDE_ALL: &str = "*";

/// Which optional fields a read should include.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    /// Every optional field.
    All,
    /// Only the named optional fields.
    Only(BTreeSet<String>),
}

impl FieldSelection {
    /// Selection that leaves every optional field out.
    pub fn none() -> Self {
        Self::Only(BTreeSet::new())
    }

    /// Parses a comma separated include parameter. `*` selects everything.
    pub fn from_include_param(param: Option<&str>) -> Self {
        let Some(param) = param else {
            return Self::none();
        };

        let mut fields = BTreeSet::new();
        for name in param.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            if name == INCLUDE_ALL {
                return Self::All;
            }
            fields.insert(name.to_string());
        }
        Self::Only(fields)
    }

    pub fn includes(&self, field: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(fields) => fields.contains(field),
        }
    }
}

/// Save and read facade for one embedded resource.
pub struct ParentSaveService<S: RecordStore> {
    store: S,
    resource: Arc<EmbeddedResource>,
}

impl<S: RecordStore> ParentSaveService<S> {
    pub fn new(store: S, resource: Arc<EmbeddedResource>) -> Self {
        Self { store, resource }
    }

    pub fn resource(&self) -> &EmbeddedResource {
        &self.resource
    }

    /// Creates a parent and its embedded children.
    pub fn create(&self, payload: &Value) -> SaveResult<Record> {
        self.save(None, payload, false)
    }

    /// Replaces the parent's scalars and reconciles the embedded fields
    /// present in `payload`.
    pub fn update(&self, parent_id: RecordId, payload: &Value) -> SaveResult<Record> {
        self.save(Some(parent_id), payload, false)
    }

    /// Like [`Self::update`], but absent scalar fields are left unchanged and
    /// updated children are validated partially.
    pub fn partial_update(&self, parent_id: RecordId, payload: &Value) -> SaveResult<Record> {
        self.save(Some(parent_id), payload, true)
    }

    /// Saves one parent body.
    ///
    /// # Contract
    /// - `parent_id = None` creates the parent; `partial` is ignored.
    /// - Embedded keys absent from `payload` are not touched; `[]` deletes
    ///   every deletable child of that field.
    /// - Returns the full representation, embedded lists included.
    pub fn save(
        &self,
        parent_id: Option<RecordId>,
        payload: &Value,
        partial: bool,
    ) -> SaveResult<Record> {
        let started_at = Instant::now();
        let partial = partial && parent_id.is_some();
        let mode = match (parent_id, partial) {
            (None, _) => "create",
            (Some(_), false) => "update",
            (Some(_), true) => "partial_update",
        };
        let table = self.resource.parent().table();
        info!("event=parent_save module=service status=start resource={table} mode={mode}");

        let result = split_payload(&self.resource, payload).and_then(|(scalars, embedded)| {
            self.store.with_transaction(|store| {
                self.save_in_scope(store, parent_id, &scalars, &embedded, partial)
            })
        });

        match &result {
            Ok(saved) => info!(
                "event=parent_save module=service status=ok resource={table} mode={mode} id={} duration_ms={}",
                saved
                    .get(self.resource.parent().id_field())
                    .and_then(Value::as_str)
                    .unwrap_or("unknown"),
                started_at.elapsed().as_millis()
            ),
            Err(err @ SaveError::Persistence(_)) => error!(
                "event=parent_save module=service status=error resource={table} mode={mode} duration_ms={} error_code={} error={err}",
                started_at.elapsed().as_millis(),
                err.code()
            ),
            Err(err) => warn!(
                "event=parent_save module=service status=error resource={table} mode={mode} duration_ms={} error_code={}",
                started_at.elapsed().as_millis(),
                err.code()
            ),
        }

        result
    }

    /// Reads one parent with its embedded children.
    ///
    /// Optional fields are included only when `selection` names them.
    pub fn fetch(
        &self,
        parent_id: RecordId,
        selection: &FieldSelection,
    ) -> SaveResult<Option<Record>> {
        let parent_schema = self.resource.parent();
        let Some(parent) = self.store.fetch(parent_schema, parent_id)? else {
            return Ok(None);
        };

        let mut representation = parent_schema.serialize(&parent);
        for binding in self.resource.bindings() {
            let children = self.store.fetch_children(
                binding.adapter(),
                binding.foreign_key(),
                parent_id,
            )?;
            representation.insert(
                binding.field().to_string(),
                represent_children(binding, &children),
            );
        }

        let optional = self.resource.optional_fields();
        representation.retain(|field, _| !optional.contains(field) || selection.includes(field));
        Ok(Some(representation))
    }

    fn save_in_scope(
        &self,
        store: &S,
        parent_id: Option<RecordId>,
        scalars: &Record,
        embedded: &[Option<&[Value]>],
        partial: bool,
    ) -> SaveResult<Record> {
        let parent_schema = self.resource.parent();
        let parent = match parent_id {
            None => {
                let values = parent_schema
                    .validate(scalars, ValidationMode::Create)
                    .map_err(parent_validation)?;
                store.create(parent_schema, &values)?
            }
            Some(id) => {
                if store.fetch(parent_schema, id)?.is_none() {
                    return Err(SaveError::ParentNotFound(id));
                }
                let values = parent_schema
                    .validate(scalars, ValidationMode::for_update(partial))
                    .map_err(parent_validation)?;
                store.update(parent_schema, id, &values)?
            }
        };

        let id = parent_schema.identifier(&parent).ok_or_else(|| {
            SaveError::Persistence(StoreError::InvalidData(format!(
                "saved `{}` record has no identifier",
                parent_schema.table()
            )))
        })?;

        let mut representation = parent_schema.serialize(&parent);
        for (binding, items) in self.resource.bindings().iter().zip(embedded) {
            let existing = store.fetch_children(binding.adapter(), binding.foreign_key(), id)?;
            let children = reconcile(store, id, binding, existing, *items, partial)?;
            representation.insert(
                binding.field().to_string(),
                represent_children(binding, &children),
            );
        }

        Ok(representation)
    }
}

/// Splits `payload` into parent scalars and one optional list per binding,
/// in binding order.
fn split_payload<'a>(
    resource: &EmbeddedResource,
    payload: &'a Value,
) -> SaveResult<(Record, Vec<Option<&'a [Value]>>)> {
    let body = payload.as_object().ok_or_else(|| SaveError::InvalidPayload {
        path: String::new(),
        message: "expected an object".to_string(),
    })?;

    let scalars = body
        .iter()
        .filter(|(key, _)| !resource.is_embedded(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let mut embedded = Vec::with_capacity(resource.bindings().len());
    for binding in resource.bindings() {
        let items = match body.get(binding.field()) {
            None => None,
            Some(Value::Array(items)) => Some(items.as_slice()),
            Some(_) => {
                return Err(SaveError::InvalidPayload {
                    path: binding.field().to_string(),
                    message: "expected a list".to_string(),
                });
            }
        };
        embedded.push(items);
    }

    Ok((scalars, embedded))
}

fn represent_children(binding: &FieldBinding, children: &[Record]) -> Value {
    Value::Array(
        children
            .iter()
            .map(|child| Value::Object(binding.represent(child)))
            .collect(),
    )
}

fn parent_validation(errors: Vec<FieldError>) -> SaveError {
    SaveError::Validation {
        field: None,
        index: None,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::FieldSelection;

    #[test]
    fn missing_include_param_selects_nothing() {
        let selection = FieldSelection::from_include_param(None);
        assert_eq!(selection, FieldSelection::none());
        assert!(!selection.includes("comments"));
    }

    #[test]
    fn include_param_is_split_and_trimmed() {
        let selection = FieldSelection::from_include_param(Some(" comments , ,items"));
        assert!(selection.includes("comments"));
        assert!(selection.includes("items"));
        assert!(!selection.includes("history"));
    }

    #[test]
    fn star_selects_everything() {
        let selection = FieldSelection::from_include_param(Some("items,*"));
        assert_eq!(selection, FieldSelection::All);
        assert!(selection.includes("anything"));
    }
}
