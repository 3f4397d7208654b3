//! Declarative record schemas and the schema adapter capability set.
//!
//! # Responsibility
//! - Describe one stored record type: table, identifier and scalar fields.
//! - Validate and coerce incoming field values before persistence.
//! - Serialize stored records into their outgoing representation.
//!
//! # Invariants
//! - Every name that reaches SQL matches `^[A-Za-z_][A-Za-z0-9_]*$`.
//! - The identifier field is never a declared scalar field and is never
//!   produced by validation.
//! - Read-only fields are ignored on input.

use crate::model::record::{id_value, record_id, Record, RecordId};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

const DEFAULT_ID_FIELD: &str = "id";

/// Setup-time error for schemas, bindings and embedded resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A table, field or column name is not a plain SQL identifier.
    InvalidName { context: &'static str, name: String },
    /// The same field name is declared twice.
    DuplicateField { owner: String, field: String },
    /// A schema declares its identifier as a regular field.
    IdentifierDeclaredAsField { table: String, field: String },
    /// The foreign-key attribute does not exist on the child schema.
    UnknownForeignKey {
        binding: String,
        table: String,
        foreign_key: String,
    },
    /// The foreign-key attribute is not a writable reference field.
    ForeignKeyNotSettable { binding: String, foreign_key: String },
    /// Two embedded fields reconcile the same child table through the same
    /// foreign key.
    SharedChildRelation {
        binding: String,
        table: String,
        foreign_key: String,
    },
    /// An embedded field name collides with a scalar field of the parent.
    EmbeddedFieldShadowsScalar(String),
    /// An optional field does not name any parent field.
    UnknownOptionalField(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName { context, name } => {
                write!(f, "invalid {context} name `{name}`")
            }
            Self::DuplicateField { owner, field } => {
                write!(f, "field `{field}` is declared twice on `{owner}`")
            }
            Self::IdentifierDeclaredAsField { table, field } => write!(
                f,
                "identifier `{field}` of `{table}` must not be declared as a field"
            ),
            Self::UnknownForeignKey {
                binding,
                table,
                foreign_key,
            } => write!(
                f,
                "embedded field `{binding}`: `{table}` has no foreign key field `{foreign_key}`"
            ),
            Self::ForeignKeyNotSettable {
                binding,
                foreign_key,
            } => write!(
                f,
                "embedded field `{binding}`: foreign key `{foreign_key}` must be a writable reference field"
            ),
            Self::SharedChildRelation {
                binding,
                table,
                foreign_key,
            } => write!(
                f,
                "embedded field `{binding}`: `{table}.{foreign_key}` is already bound to another embedded field"
            ),
            Self::EmbeddedFieldShadowsScalar(field) => {
                write!(f, "embedded field `{field}` shadows a scalar field of the parent")
            }
            Self::UnknownOptionalField(field) => {
                write!(f, "optional field `{field}` is not a field of the resource")
            }
        }
    }
}

impl Error for ConfigError {}

/// Checks that `name` can be used unescaped as a SQL identifier.
pub fn ensure_identifier(context: &'static str, name: &str) -> Result<(), ConfigError> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidName {
            context,
            name: name.to_string(),
        })
    }
}

/// One failed field inside a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Storage and validation kind of one scalar field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    Text { max_length: Option<usize> },
    Integer { min: Option<i64>, max: Option<i64> },
    Real,
    Bool,
    /// UUID of another record, stored as text.
    Reference,
}

/// Declaration of one scalar field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    name: String,
    kind: FieldKind,
    required: bool,
    nullable: bool,
    read_only: bool,
    default: Option<Value>,
}

impl FieldSpec {
    /// Creates a required, non-null field of `kind`.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            nullable: false,
            read_only: false,
            default: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text { max_length: None })
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer { min: None, max: None })
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Real)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Bool)
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Reference)
    }

    /// Caps text length in characters. No effect on non-text fields.
    pub fn max_length(mut self, limit: usize) -> Self {
        if let FieldKind::Text { max_length } = &mut self.kind {
            *max_length = Some(limit);
        }
        self
    }

    /// Lower bound for integer fields.
    pub fn min(mut self, bound: i64) -> Self {
        if let FieldKind::Integer { min, .. } = &mut self.kind {
            *min = Some(bound);
        }
        self
    }

    /// Upper bound for integer fields.
    pub fn max(mut self, bound: i64) -> Self {
        if let FieldKind::Integer { max, .. } = &mut self.kind {
            *max = Some(bound);
        }
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Output-only field: input values are ignored.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self.required = false;
        self
    }

    /// Value used when a new record omits the field.
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self.required = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Checks and coerces one present input value.
    pub fn validate_value(&self, value: &Value) -> Result<Value, String> {
        if value.is_null() {
            return if self.nullable {
                Ok(Value::Null)
            } else {
                Err("this field may not be null".to_string())
            };
        }

        match self.kind {
            FieldKind::Text { max_length } => {
                let text = value.as_str().ok_or("expected a string")?;
                if let Some(limit) = max_length {
                    if text.chars().count() > limit {
                        return Err(format!("ensure this field has no more than {limit} characters"));
                    }
                }
                Ok(Value::String(text.to_string()))
            }
            FieldKind::Integer { min, max } => {
                let number = value.as_i64().ok_or("expected an integer")?;
                if let Some(bound) = min {
                    if number < bound {
                        return Err(format!("ensure this value is greater than or equal to {bound}"));
                    }
                }
                if let Some(bound) = max {
                    if number > bound {
                        return Err(format!("ensure this value is less than or equal to {bound}"));
                    }
                }
                Ok(Value::from(number))
            }
            FieldKind::Real => {
                let number = value.as_f64().ok_or("expected a number")?;
                Ok(Value::from(number))
            }
            FieldKind::Bool => value
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| "expected a boolean".to_string()),
            FieldKind::Reference => value
                .as_str()
                .and_then(|text| Uuid::parse_str(text).ok())
                .map(id_value)
                .ok_or_else(|| "expected a UUID string".to_string()),
        }
    }
}

/// How absent fields are treated during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// New record: required fields must be present, defaults fill the rest.
    Create,
    /// Full replacement of a stored record: required fields must be present,
    /// absent defaulted fields keep their stored value.
    Update,
    /// Only present fields are checked.
    PartialUpdate,
}

impl ValidationMode {
    pub fn for_update(partial: bool) -> Self {
        if partial {
            Self::PartialUpdate
        } else {
            Self::Update
        }
    }
}

/// Capability set required from every parent or child record type.
///
/// Implementors decide how input is validated and how stored records are
/// presented. `TableSchema` is the declarative implementation; custom
/// adapters usually wrap one and add record-level rules.
pub trait SchemaAdapter: Send + Sync {
    /// Storage table name.
    fn table(&self) -> &str;

    /// Identifier attribute, present on every stored record.
    fn id_field(&self) -> &str {
        DEFAULT_ID_FIELD
    }

    /// Declared scalar fields, in representation order.
    fn fields(&self) -> &[FieldSpec];

    fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields().iter().find(|spec| spec.name() == name)
    }

    /// Validates `input` and returns the cleaned values to persist.
    ///
    /// Defaults are only applied in [`ValidationMode::Create`].
    fn validate(&self, input: &Record, mode: ValidationMode) -> Result<Record, Vec<FieldError>>;

    /// Outgoing representation of a stored record.
    fn serialize(&self, record: &Record) -> Record {
        let mut output = Record::new();
        if let Some(id) = record.get(self.id_field()) {
            output.insert(self.id_field().to_string(), id.clone());
        }
        for spec in self.fields() {
            if let Some(value) = record.get(spec.name()) {
                output.insert(spec.name().to_string(), value.clone());
            }
        }
        output
    }

    fn identifier(&self, record: &Record) -> Option<RecordId> {
        record_id(record, self.id_field())
    }
}

/// Declarative schema for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    table: String,
    id_field: String,
    fields: Vec<FieldSpec>,
}

impl TableSchema {
    pub fn builder(table: impl Into<String>) -> TableSchemaBuilder {
        TableSchemaBuilder {
            table: table.into(),
            id_field: DEFAULT_ID_FIELD.to_string(),
            fields: Vec::new(),
        }
    }
}

impl SchemaAdapter for TableSchema {
    fn table(&self) -> &str {
        &self.table
    }

    fn id_field(&self) -> &str {
        &self.id_field
    }

    fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    fn validate(&self, input: &Record, mode: ValidationMode) -> Result<Record, Vec<FieldError>> {
        let mut cleaned = Record::new();
        let mut errors = Vec::new();

        for spec in self.fields.iter().filter(|spec| !spec.is_read_only()) {
            match input.get(spec.name()) {
                Some(value) => match spec.validate_value(value) {
                    Ok(value) => {
                        cleaned.insert(spec.name().to_string(), value);
                    }
                    Err(message) => errors.push(FieldError::new(spec.name(), message)),
                },
                None if mode == ValidationMode::PartialUpdate => {}
                None => match &spec.default {
                    Some(default) if mode == ValidationMode::Create => {
                        cleaned.insert(spec.name().to_string(), default.clone());
                    }
                    Some(_) => {}
                    None if spec.is_required() => {
                        errors.push(FieldError::new(spec.name(), "this field is required"));
                    }
                    None => {}
                },
            }
        }

        if errors.is_empty() {
            Ok(cleaned)
        } else {
            Err(errors)
        }
    }
}

/// Builder returned by [`TableSchema::builder`].
#[derive(Debug, Clone)]
pub struct TableSchemaBuilder {
    table: String,
    id_field: String,
    fields: Vec<FieldSpec>,
}

impl TableSchemaBuilder {
    pub fn id_field(mut self, name: impl Into<String>) -> Self {
        self.id_field = name.into();
        self
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn build(self) -> Result<TableSchema, ConfigError> {
        ensure_identifier("table", &self.table)?;
        ensure_identifier("identifier", &self.id_field)?;

        let mut seen = HashSet::new();
        for spec in &self.fields {
            ensure_identifier("field", spec.name())?;
            if spec.name() == self.id_field {
                return Err(ConfigError::IdentifierDeclaredAsField {
                    table: self.table,
                    field: spec.name().to_string(),
                });
            }
            if !seen.insert(spec.name()) {
                return Err(ConfigError::DuplicateField {
                    owner: self.table.clone(),
                    field: spec.name().to_string(),
                });
            }
        }

        Ok(TableSchema {
            table: self.table,
            id_field: self.id_field,
            fields: self.fields,
        })
    }
}
