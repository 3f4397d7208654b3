//! Record representation shared by parents and children.
//!
//! # Responsibility
//! - Define the JSON-object shape used for payloads, rows and responses.
//! - Provide identifier helpers keyed by a schema's identifier field.
//!
//! # Invariants
//! - Persisted identifiers are UUID strings assigned by the record store.

use serde_json::{Map, Value};
use uuid::Uuid;

/// Stable identifier of a persisted record.
pub type RecordId = Uuid;

/// Field-name keyed record, as received in payloads and returned by stores.
pub type Record = Map<String, Value>;

/// Identifier lookup outcome for one payload item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdLookup {
    /// The identifier key is absent or `null`.
    Missing,
    /// The identifier parsed as a UUID.
    Present(RecordId),
    /// The identifier key holds something that is not a UUID string.
    Malformed,
}

/// Reads the identifier stored under `id_field`.
pub fn lookup_id(record: &Record, id_field: &str) -> IdLookup {
    match record.get(id_field) {
        None | Some(Value::Null) => IdLookup::Missing,
        Some(Value::String(text)) => match Uuid::parse_str(text) {
            Ok(id) => IdLookup::Present(id),
            Err(_) => IdLookup::Malformed,
        },
        Some(_) => IdLookup::Malformed,
    }
}

/// Returns the identifier of a persisted record, if it carries a valid one.
pub fn record_id(record: &Record, id_field: &str) -> Option<RecordId> {
    match lookup_id(record, id_field) {
        IdLookup::Present(id) => Some(id),
        IdLookup::Missing | IdLookup::Malformed => None,
    }
}

/// Encodes an identifier the way records carry it.
pub fn id_value(id: RecordId) -> Value {
    Value::String(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::{id_value, lookup_id, IdLookup, Record};
    use serde_json::json;
    use uuid::Uuid;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().expect("object literal")
    }

    #[test]
    fn lookup_distinguishes_missing_null_and_malformed() {
        let id = Uuid::new_v4();
        assert_eq!(lookup_id(&record(json!({})), "id"), IdLookup::Missing);
        assert_eq!(lookup_id(&record(json!({"id": null})), "id"), IdLookup::Missing);
        assert_eq!(lookup_id(&record(json!({"id": 7})), "id"), IdLookup::Malformed);
        assert_eq!(
            lookup_id(&record(json!({"id": "not-a-uuid"})), "id"),
            IdLookup::Malformed
        );
        assert_eq!(
            lookup_id(&record(json!({ "id": id_value(id) })), "id"),
            IdLookup::Present(id)
        );
    }
}
