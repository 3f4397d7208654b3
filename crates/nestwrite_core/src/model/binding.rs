//! Embedded field bindings and per-parent configuration.
//!
//! # Responsibility
//! - Map a parent field name to the child schema and the child's foreign key.
//! - Validate the whole embedded configuration once, at setup time.
//!
//! # Invariants
//! - The foreign key exists on the child schema and is a writable reference.
//! - Embedded field names are unique and never shadow parent scalar fields.
//! - The foreign key never appears in a child's outgoing representation.

use crate::model::record::Record;
use crate::model::schema::{ensure_identifier, ConfigError, FieldKind, SchemaAdapter};
use std::collections::{BTreeSet, HashSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Predicate deciding whether an omitted child may be deleted.
pub type DeleteGuard = dyn Fn(&Record) -> bool + Send + Sync;

/// Binding of one embedded parent field to its child record type.
#[derive(Clone)]
pub struct FieldBinding {
    field: String,
    adapter: Arc<dyn SchemaAdapter>,
    foreign_key: String,
    delete_guard: Option<Arc<DeleteGuard>>,
}

impl FieldBinding {
    pub fn new(
        field: impl Into<String>,
        adapter: Arc<dyn SchemaAdapter>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            adapter,
            foreign_key: foreign_key.into(),
            delete_guard: None,
        }
    }

    /// Restricts deletion of omitted children to those accepted by `guard`.
    ///
    /// Refused children are kept in storage and in the returned collection.
    pub fn with_delete_guard(
        mut self,
        guard: impl Fn(&Record) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.delete_guard = Some(Arc::new(guard));
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn adapter(&self) -> &dyn SchemaAdapter {
        self.adapter.as_ref()
    }

    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    /// Returns whether `child` may be deleted when omitted from a payload.
    pub fn is_deletable(&self, child: &Record) -> bool {
        self.delete_guard.as_ref().map_or(true, |guard| (**guard)(child))
    }

    /// Outgoing representation of one stored child, without the foreign key.
    pub fn represent(&self, child: &Record) -> Record {
        let mut output = self.adapter.serialize(child);
        output.remove(&self.foreign_key);
        output
    }

    /// Checks the binding against its child schema.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_identifier("embedded field", &self.field)?;
        ensure_identifier("table", self.adapter.table())?;
        ensure_identifier("identifier", self.adapter.id_field())?;
        ensure_identifier("foreign key", &self.foreign_key)?;

        let spec = self
            .adapter
            .field(&self.foreign_key)
            .ok_or_else(|| ConfigError::UnknownForeignKey {
                binding: self.field.clone(),
                table: self.adapter.table().to_string(),
                foreign_key: self.foreign_key.clone(),
            })?;

        if spec.kind() != FieldKind::Reference || spec.is_read_only() {
            return Err(ConfigError::ForeignKeyNotSettable {
                binding: self.field.clone(),
                foreign_key: self.foreign_key.clone(),
            });
        }

        Ok(())
    }
}

impl Debug for FieldBinding {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldBinding")
            .field("field", &self.field)
            .field("table", &self.adapter.table())
            .field("foreign_key", &self.foreign_key)
            .field("delete_guard", &self.delete_guard.is_some())
            .finish()
    }
}

/// A parent record type together with its embedded collections.
#[derive(Clone)]
pub struct EmbeddedResource {
    parent: Arc<dyn SchemaAdapter>,
    bindings: Vec<FieldBinding>,
    optional_fields: BTreeSet<String>,
}

impl EmbeddedResource {
    pub fn builder(parent: Arc<dyn SchemaAdapter>) -> EmbeddedResourceBuilder {
        EmbeddedResourceBuilder {
            parent,
            bindings: Vec::new(),
            optional_fields: Vec::new(),
        }
    }

    pub fn parent(&self) -> &dyn SchemaAdapter {
        self.parent.as_ref()
    }

    /// Bindings in declaration order.
    pub fn bindings(&self) -> &[FieldBinding] {
        &self.bindings
    }

    pub fn binding(&self, field: &str) -> Option<&FieldBinding> {
        self.bindings.iter().find(|binding| binding.field() == field)
    }

    pub fn is_embedded(&self, field: &str) -> bool {
        self.binding(field).is_some()
    }

    /// Fields left out of read representations unless explicitly included.
    pub fn optional_fields(&self) -> &BTreeSet<String> {
        &self.optional_fields
    }

    /// Parent schema followed by every child schema.
    pub fn adapters(&self) -> impl Iterator<Item = &dyn SchemaAdapter> {
        std::iter::once(self.parent.as_ref())
            .chain(self.bindings.iter().map(FieldBinding::adapter))
    }
}

impl Debug for EmbeddedResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedResource")
            .field("parent", &self.parent.table())
            .field("bindings", &self.bindings)
            .field("optional_fields", &self.optional_fields)
            .finish()
    }
}

/// Builder returned by [`EmbeddedResource::builder`].
pub struct EmbeddedResourceBuilder {
    parent: Arc<dyn SchemaAdapter>,
    bindings: Vec<FieldBinding>,
    optional_fields: Vec<String>,
}

impl EmbeddedResourceBuilder {
    pub fn embed(mut self, binding: FieldBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Marks a scalar or embedded field as optional on reads.
    pub fn optional_field(mut self, field: impl Into<String>) -> Self {
        self.optional_fields.push(field.into());
        self
    }

    pub fn build(self) -> Result<EmbeddedResource, ConfigError> {
        ensure_identifier("table", self.parent.table())?;
        ensure_identifier("identifier", self.parent.id_field())?;

        let mut seen = HashSet::new();
        let mut relations = HashSet::new();
        for binding in &self.bindings {
            binding.validate()?;
            if self.parent.field(binding.field()).is_some()
                || binding.field() == self.parent.id_field()
            {
                return Err(ConfigError::EmbeddedFieldShadowsScalar(
                    binding.field().to_string(),
                ));
            }
            if !seen.insert(binding.field()) {
                return Err(ConfigError::DuplicateField {
                    owner: self.parent.table().to_string(),
                    field: binding.field().to_string(),
                });
            }
            if !relations.insert((binding.adapter().table(), binding.foreign_key())) {
                return Err(ConfigError::SharedChildRelation {
                    binding: binding.field().to_string(),
                    table: binding.adapter().table().to_string(),
                    foreign_key: binding.foreign_key().to_string(),
                });
            }
        }

        for field in &self.optional_fields {
            let known = self.parent.field(field).is_some() || seen.contains(field.as_str());
            if !known {
                return Err(ConfigError::UnknownOptionalField(field.clone()));
            }
        }

        Ok(EmbeddedResource {
            parent: self.parent,
            bindings: self.bindings,
            optional_fields: self.optional_fields.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{EmbeddedResource, FieldBinding};
    use crate::model::schema::{ConfigError, FieldSpec, TableSchema};
    use serde_json::json;
    use std::sync::Arc;

    fn orders() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::builder("orders")
                .field(FieldSpec::text("customer"))
                .build()
                .unwrap(),
        )
    }

    fn items() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::builder("order_items")
                .field(FieldSpec::text("name"))
                .field(FieldSpec::reference("order_id"))
                .field(FieldSpec::text("sku").optional())
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn binding_requires_existing_reference_foreign_key() {
        let err = FieldBinding::new("items", items(), "order")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownForeignKey { .. }));

        let err = FieldBinding::new("items", items(), "sku")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ForeignKeyNotSettable { .. }));

        assert!(FieldBinding::new("items", items(), "order_id")
            .validate()
            .is_ok());
    }

    #[test]
    fn builder_rejects_duplicate_and_shadowing_bindings() {
        let err = EmbeddedResource::builder(orders())
            .embed(FieldBinding::new("items", items(), "order_id"))
            .embed(FieldBinding::new("items", items(), "order_id"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateField { .. }));

        let err = EmbeddedResource::builder(orders())
            .embed(FieldBinding::new("customer", items(), "order_id"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::EmbeddedFieldShadowsScalar("customer".to_string())
        );
    }

    #[test]
    fn builder_rejects_two_fields_over_the_same_child_relation() {
        let err = EmbeddedResource::builder(orders())
            .embed(FieldBinding::new("items", items(), "order_id"))
            .embed(FieldBinding::new("lines", items(), "order_id"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::SharedChildRelation {
                binding: "lines".to_string(),
                table: "order_items".to_string(),
                foreign_key: "order_id".to_string(),
            }
        );
    }

    #[test]
    fn optional_fields_must_name_known_fields() {
        let err = EmbeddedResource::builder(orders())
            .embed(FieldBinding::new("items", items(), "order_id"))
            .optional_field("history")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownOptionalField("history".to_string()));

        let resource = EmbeddedResource::builder(orders())
            .embed(FieldBinding::new("items", items(), "order_id"))
            .optional_field("items")
            .optional_field("customer")
            .build()
            .unwrap();
        assert_eq!(resource.optional_fields().len(), 2);
    }

    #[test]
    fn representation_hides_foreign_key() {
        let binding = FieldBinding::new("items", items(), "order_id");
        let stored = json!({
            "id": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "name": "pen",
            "order_id": "0f8fad5b-d9cb-469f-a165-70867728950e"
        });
        let output = binding.represent(stored.as_object().unwrap());
        assert!(!output.contains_key("order_id"));
        assert_eq!(output.get("name"), Some(&json!("pen")));
    }

    #[test]
    fn delete_guard_defaults_to_allow() {
        let binding = FieldBinding::new("items", items(), "order_id");
        let child = json!({"name": "keep"});
        assert!(binding.is_deletable(child.as_object().unwrap()));

        let guarded = binding.with_delete_guard(|child| child.get("name") != Some(&json!("keep")));
        assert!(!guarded.is_deletable(child.as_object().unwrap()));
    }
}
