//! Embedded collection reconciliation.
//!
//! # Responsibility
//! - Turn "existing children + incoming list" into a create/update/delete
//!   plan, keyed purely on identifier presence.
//! - Apply the plan through a record store.
//!
//! # Invariants
//! - Every existing child is either updated or scheduled for deletion.
//! - Every payload item is either created or updated, never both.
//! - Identifiers unknown to the parent are rejected, never adopted.
//! - Writes run deletes, then updates, then creates.
//! - The result lists payload items in payload order, followed by children
//!   kept back by a delete guard.
//!
//! Callers own the transaction scope; `reconcile` never opens one.

use crate::model::binding::FieldBinding;
use crate::model::record::{id_value, lookup_id, IdLookup, Record, RecordId};
use crate::model::schema::{FieldError, ValidationMode};
use crate::repo::record_repo::RecordStore;
use crate::service::error::{record_path, SaveError, SaveResult};
use log::{info, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Instant;

/// Payload item scheduled for creation.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCreate {
    /// Position in the incoming list.
    pub index: usize,
    /// Validated values, foreign key included.
    pub values: Record,
}

/// Payload item matched to an existing child.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpdate {
    pub index: usize,
    pub id: RecordId,
    pub values: Record,
}

/// Create/update/delete sets for one embedded field.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationPlan {
    to_create: Vec<PlannedCreate>,
    to_update: Vec<PlannedUpdate>,
    to_delete: Vec<Record>,
    payload_len: usize,
}

impl ReconciliationPlan {
    /// Partitions `payload` against `existing` and validates every item.
    ///
    /// The foreign key of each item is overwritten with `parent_id` before
    /// validation. Created items are always fully validated and defaulted;
    /// updated items follow `partial` and never receive defaults.
    pub fn build(
        parent_id: RecordId,
        binding: &FieldBinding,
        existing: &[Record],
        payload: &[Value],
        partial: bool,
    ) -> SaveResult<Self> {
        let adapter = binding.adapter();
        let field = binding.field();
        let known: HashSet<RecordId> = existing
            .iter()
            .filter_map(|child| adapter.identifier(child))
            .collect();
        let mut claimed = HashSet::new();
        let mut to_create = Vec::new();
        let mut to_update = Vec::new();

        for (index, item) in payload.iter().enumerate() {
            let object = item.as_object().ok_or_else(|| SaveError::InvalidPayload {
                path: record_path(Some(field), Some(index)),
                message: "expected an object".to_string(),
            })?;

            let mut input = object.clone();
            input.insert(binding.foreign_key().to_string(), id_value(parent_id));

            match lookup_id(object, adapter.id_field()) {
                IdLookup::Missing => {
                    let values = adapter
                        .validate(&input, ValidationMode::Create)
                        .map_err(|errors| SaveError::child_validation(field, index, errors))?;
                    to_create.push(PlannedCreate { index, values });
                }
                IdLookup::Present(id) => {
                    if !known.contains(&id) {
                        return Err(SaveError::UnknownChildIdentifier {
                            field: field.to_string(),
                            index,
                            id,
                        });
                    }
                    if !claimed.insert(id) {
                        return Err(SaveError::DuplicateChildIdentifier {
                            field: field.to_string(),
                            index,
                            id,
                        });
                    }
                    let values = adapter
                        .validate(&input, ValidationMode::for_update(partial))
                        .map_err(|errors| SaveError::child_validation(field, index, errors))?;
                    to_update.push(PlannedUpdate { index, id, values });
                }
                IdLookup::Malformed => {
                    return Err(SaveError::child_validation(
                        field,
                        index,
                        vec![FieldError::new(adapter.id_field(), "expected a UUID string")],
                    ));
                }
            }
        }

        let to_delete = existing
            .iter()
            .filter(|child| {
                adapter
                    .identifier(child)
                    .is_some_and(|id| !claimed.contains(&id))
            })
            .cloned()
            .collect();

        Ok(Self {
            to_create,
            to_update,
            to_delete,
            payload_len: payload.len(),
        })
    }

    pub fn to_create(&self) -> &[PlannedCreate] {
        &self.to_create
    }

    pub fn to_update(&self) -> &[PlannedUpdate] {
        &self.to_update
    }

    /// Existing children omitted from the payload.
    pub fn to_delete(&self) -> &[Record] {
        &self.to_delete
    }

    /// Writes the plan and returns the resulting children.
    pub fn apply<S: RecordStore>(
        self,
        store: &S,
        binding: &FieldBinding,
    ) -> SaveResult<Vec<Record>> {
        let adapter = binding.adapter();
        let mut retained = Vec::new();

        for child in self.to_delete {
            let Some(id) = adapter.identifier(&child) else {
                continue;
            };
            if binding.is_deletable(&child) {
                store.delete(adapter, id)?;
            } else {
                retained.push(child);
            }
        }

        let mut slots: Vec<Option<Record>> = vec![None; self.payload_len];
        for update in self.to_update {
            slots[update.index] = Some(store.update(adapter, update.id, &update.values)?);
        }
        for create in self.to_create {
            slots[create.index] = Some(store.create(adapter, &create.values)?);
        }

        let mut children: Vec<Record> = slots.into_iter().flatten().collect();
        children.extend(retained);
        Ok(children)
    }
}

/// Reconciles one embedded field of the parent `parent_id`.
///
/// `payload = None` means the field was absent from the request: nothing is
/// written and `existing` is returned unchanged. `Some(&[])` deletes every
/// deletable child.
pub fn reconcile<S: RecordStore>(
    store: &S,
    parent_id: RecordId,
    binding: &FieldBinding,
    existing: Vec<Record>,
    payload: Option<&[Value]>,
    partial: bool,
) -> SaveResult<Vec<Record>> {
    let Some(payload) = payload else {
        return Ok(existing);
    };

    let started_at = Instant::now();
    let result = ReconciliationPlan::build(parent_id, binding, &existing, payload, partial)
        .and_then(|plan| {
            let counts = (
                plan.to_create().len(),
                plan.to_update().len(),
                plan.to_delete().len(),
            );
            plan.apply(store, binding).map(|children| (children, counts))
        });

    match result {
        Ok((children, (created, updated, omitted))) => {
            info!(
                "event=reconcile module=service status=ok field={} parent_id={parent_id} created={created} updated={updated} omitted={omitted} kept={} duration_ms={}",
                binding.field(),
                children.len(),
                started_at.elapsed().as_millis()
            );
            Ok(children)
        }
        Err(err) => {
            warn!(
                "event=reconcile module=service status=error field={} parent_id={parent_id} duration_ms={} error_code={}",
                binding.field(),
                started_at.elapsed().as_millis(),
                err.code()
            );
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ReconciliationPlan;
    use crate::model::binding::FieldBinding;
    use crate::model::record::{id_value, Record};
    use crate::model::schema::{FieldSpec, TableSchema};
    use crate::service::error::SaveError;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use uuid::Uuid;

    fn binding() -> FieldBinding {
        let items = TableSchema::builder("order_items")
            .field(FieldSpec::text("name"))
            .field(FieldSpec::integer("quantity").min(1))
            .field(FieldSpec::reference("order_id"))
            .build()
            .unwrap();
        FieldBinding::new("items", Arc::new(items), "order_id")
    }

    fn child(id: Uuid, parent: Uuid, name: &str) -> Record {
        json!({"id": id_value(id), "name": name, "quantity": 1, "order_id": id_value(parent)})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn payload(value: Value) -> Vec<Value> {
        value.as_array().cloned().unwrap()
    }

    #[test]
    fn partitions_by_identifier_presence() {
        let parent = Uuid::new_v4();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let existing = vec![child(first, parent, "a"), child(second, parent, "b")];
        let items = payload(json!([
            {"name": "new", "quantity": 3},
            {"id": second.to_string(), "name": "b2", "quantity": 2}
        ]));

        let plan = ReconciliationPlan::build(parent, &binding(), &existing, &items, false).unwrap();

        assert_eq!(plan.to_create().len(), 1);
        assert_eq!(plan.to_create()[0].index, 0);
        assert_eq!(plan.to_update().len(), 1);
        assert_eq!(plan.to_update()[0].id, second);
        assert_eq!(plan.to_update()[0].index, 1);
        assert_eq!(plan.to_delete().len(), 1);
        assert_eq!(plan.to_delete()[0].get("id"), Some(&id_value(first)));
    }

    #[test]
    fn foreign_key_is_forced_to_parent() {
        let parent = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let items = payload(json!([
            {"name": "x", "quantity": 1, "order_id": intruder.to_string()}
        ]));

        let plan = ReconciliationPlan::build(parent, &binding(), &[], &items, false).unwrap();

        assert_eq!(
            plan.to_create()[0].values.get("order_id"),
            Some(&id_value(parent))
        );
    }

    #[test]
    fn empty_payload_schedules_every_child_for_deletion() {
        let parent = Uuid::new_v4();
        let existing = vec![
            child(Uuid::new_v4(), parent, "a"),
            child(Uuid::new_v4(), parent, "b"),
        ];

        let plan = ReconciliationPlan::build(parent, &binding(), &existing, &[], false).unwrap();

        assert!(plan.to_create().is_empty());
        assert!(plan.to_update().is_empty());
        assert_eq!(plan.to_delete().len(), 2);
    }

    #[test]
    fn foreign_identifier_is_rejected() {
        let parent = Uuid::new_v4();
        let existing = vec![child(Uuid::new_v4(), parent, "a")];
        let stranger = Uuid::new_v4();
        let items = payload(json!([{"id": stranger.to_string(), "name": "x", "quantity": 1}]));

        let err =
            ReconciliationPlan::build(parent, &binding(), &existing, &items, false).unwrap_err();

        match err {
            SaveError::UnknownChildIdentifier { field, index, id } => {
                assert_eq!(field, "items");
                assert_eq!(index, 0);
                assert_eq!(id, stranger);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn repeated_identifier_is_rejected() {
        let parent = Uuid::new_v4();
        let id = Uuid::new_v4();
        let existing = vec![child(id, parent, "a")];
        let items = payload(json!([
            {"id": id.to_string(), "name": "x", "quantity": 1},
            {"id": id.to_string(), "name": "y", "quantity": 1}
        ]));

        let err =
            ReconciliationPlan::build(parent, &binding(), &existing, &items, false).unwrap_err();

        assert!(matches!(
            err,
            SaveError::DuplicateChildIdentifier { index: 1, .. }
        ));
    }

    #[test]
    fn invalid_item_reports_field_and_index() {
        let parent = Uuid::new_v4();
        let items = payload(json!([
            {"name": "ok", "quantity": 1},
            {"name": "bad", "quantity": 0}
        ]));

        let err = ReconciliationPlan::build(parent, &binding(), &[], &items, false).unwrap_err();

        assert_eq!(err.error_paths(), vec!["items[1].quantity".to_string()]);
    }

    #[test]
    fn malformed_identifier_is_a_validation_error() {
        let parent = Uuid::new_v4();
        let items = payload(json!([{"id": 42, "name": "x", "quantity": 1}]));

        let err = ReconciliationPlan::build(parent, &binding(), &[], &items, false).unwrap_err();

        assert_eq!(err.error_paths(), vec!["items[0].id".to_string()]);
    }

    #[test]
    fn non_object_item_is_invalid_payload() {
        let parent = Uuid::new_v4();
        let items = payload(json!(["nope"]));

        let err = ReconciliationPlan::build(parent, &binding(), &[], &items, false).unwrap_err();

        assert!(matches!(err, SaveError::InvalidPayload { ref path, .. } if path == "items[0]"));
    }

    #[test]
    fn partial_update_skips_required_checks_but_create_does_not() {
        let parent = Uuid::new_v4();
        let id = Uuid::new_v4();
        let existing = vec![child(id, parent, "a")];

        let updates = payload(json!([{"id": id.to_string(), "quantity": 4}]));
        let plan = ReconciliationPlan::build(parent, &binding(), &existing, &updates, true).unwrap();
        assert!(!plan.to_update()[0].values.contains_key("name"));

        let creates = payload(json!([{"quantity": 4}]));
        let err = ReconciliationPlan::build(parent, &binding(), &existing, &creates, true)
            .unwrap_err();
        assert_eq!(err.error_paths(), vec!["items[0].name".to_string()]);
    }
}
