//! Error type shared by the reconciler and the save service.
//!
//! # Invariants
//! - Every variant aborts the enclosing parent save; nothing is committed.
//! - Child-level errors carry the embedded field name and the item index so
//!   callers can map them back to the nested position in the request body.

use crate::model::record::RecordId;
use crate::model::schema::FieldError;
use crate::repo::record_repo::StoreError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type SaveResult<T> = Result<T, SaveError>;

#[derive(Debug)]
pub enum SaveError {
    /// Request body has the wrong shape at `path`.
    InvalidPayload { path: String, message: String },
    /// Field validation failed for the parent (`field = None`) or for the
    /// child at `field[index]`.
    Validation {
        field: Option<String>,
        index: Option<usize>,
        errors: Vec<FieldError>,
    },
    /// A child item names an identifier the parent does not own.
    UnknownChildIdentifier {
        field: String,
        index: usize,
        id: RecordId,
    },
    /// The same child identifier appears twice in one list.
    DuplicateChildIdentifier {
        field: String,
        index: usize,
        id: RecordId,
    },
    ParentNotFound(RecordId),
    Persistence(StoreError),
}

impl SaveError {
    pub(crate) fn child_validation(field: &str, index: usize, errors: Vec<FieldError>) -> Self {
        Self::Validation {
            field: Some(field.to_string()),
            index: Some(index),
            errors,
        }
    }

    /// Stable error code used in log events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::Validation { .. } => "validation",
            Self::UnknownChildIdentifier { .. } => "unknown_child_identifier",
            Self::DuplicateChildIdentifier { .. } => "duplicate_child_identifier",
            Self::ParentNotFound(_) => "parent_not_found",
            Self::Persistence(_) => "persistence",
        }
    }

    /// Full paths of every failing field, e.g. `items[1].quantity`.
    pub fn error_paths(&self) -> Vec<String> {
        match self {
            Self::Validation {
                field,
                index,
                errors,
            } => {
                let prefix = record_path(field.as_deref(), *index);
                errors
                    .iter()
                    .map(|error| join_path(&prefix, &error.field))
                    .collect()
            }
            Self::InvalidPayload { path, .. } => vec![path.clone()],
            Self::UnknownChildIdentifier { field, index, .. }
            | Self::DuplicateChildIdentifier { field, index, .. } => {
                vec![record_path(Some(field.as_str()), Some(*index))]
            }
            Self::ParentNotFound(_) | Self::Persistence(_) => Vec::new(),
        }
    }
}

impl Display for SaveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPayload { path, message } => {
                if path.is_empty() {
                    write!(f, "invalid payload: {message}")
                } else {
                    write!(f, "invalid payload at `{path}`: {message}")
                }
            }
            Self::Validation {
                field,
                index,
                errors,
            } => {
                let prefix = record_path(field.as_deref(), *index);
                write!(f, "validation failed")?;
                for (position, error) in errors.iter().enumerate() {
                    let separator = if position == 0 { ": " } else { "; " };
                    write!(
                        f,
                        "{separator}{} {}",
                        join_path(&prefix, &error.field),
                        error.message
                    )?;
                }
                Ok(())
            }
            Self::UnknownChildIdentifier { field, index, id } => write!(
                f,
                "`{field}[{index}]` references unknown identifier {id}"
            ),
            Self::DuplicateChildIdentifier { field, index, id } => write!(
                f,
                "`{field}[{index}]` repeats identifier {id}"
            ),
            Self::ParentNotFound(id) => write!(f, "parent record not found: {id}"),
            Self::Persistence(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SaveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Persistence(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for SaveError {
    fn from(value: StoreError) -> Self {
        Self::Persistence(value)
    }
}

pub(crate) fn record_path(field: Option<&str>, index: Option<usize>) -> String {
    match (field, index) {
        (Some(field), Some(index)) => format!("{field}[{index}]"),
        (Some(field), None) => field.to_string(),
        (None, _) => String::new(),
    }
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

#[cfg(test)]
mod tests {
    use super::SaveError;
    use crate::model::schema::FieldError;

    #[test]
    fn child_validation_paths_include_field_and_index() {
        let err = SaveError::child_validation(
            "items",
            1,
            vec![
                FieldError::new("quantity", "expected an integer"),
                FieldError::new("name", "this field is required"),
            ],
        );
        assert_eq!(
            err.error_paths(),
            vec!["items[1].quantity".to_string(), "items[1].name".to_string()]
        );
        assert_eq!(
            err.to_string(),
            "validation failed: items[1].quantity expected an integer; items[1].name this field is required"
        );
    }

    #[test]
    fn parent_validation_paths_are_bare_field_names() {
        let err = SaveError::Validation {
            field: None,
            index: None,
            errors: vec![FieldError::new("customer", "this field is required")],
        };
        assert_eq!(err.error_paths(), vec!["customer".to_string()]);
    }
}
