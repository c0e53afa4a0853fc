use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::store::{DocId, StoreError};

/// One field that failed validation, addressed by JSON pointer (`/done`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub path: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        write!(f, "{}: {}", path, self.message)
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeftError {
    #[error("Schema invalid: {}", join(.errors))]
    SchemaInvalid { errors: Vec<String> },

    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    #[error("Schema not found: {0}")]
    SchemaNotFound(DocId),

    #[error("Operation invalid: {0}")]
    OperationInvalid(String),

    #[error("Validation failed: {}", join(.violations))]
    ValidationFailed { violations: Vec<FieldViolation> },

    #[error("Reference unavailable: {id} at {path}")]
    ReferenceUnavailable { id: DocId, path: String },

    #[error("Reference circular: {id} at {path}")]
    ReferenceCircular { id: DocId, path: String },

    #[error("Depth exceeded at {path} (max {max_depth})")]
    DepthExceeded { path: String, max_depth: usize },

    #[error("Value not found: {0}")]
    NotFound(DocId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(String),
}

impl WeftError {
    pub fn schema_invalid(message: impl Into<String>) -> Self {
        WeftError::SchemaInvalid {
            errors: vec![message.into()],
        }
    }

    pub fn invalid_op(message: impl Into<String>) -> Self {
        WeftError::OperationInvalid(message.into())
    }

    /// Stable name of the error kind, used in batch reports.
    pub fn code(&self) -> &'static str {
        match self {
            WeftError::SchemaInvalid { .. } => "SchemaInvalid",
            WeftError::SchemaConflict(_) => "SchemaConflict",
            WeftError::SchemaNotFound(_) => "SchemaNotFound",
            WeftError::OperationInvalid(_) => "OperationInvalid",
            WeftError::ValidationFailed { .. } => "ValidationFailed",
            WeftError::ReferenceUnavailable { .. } => "ReferenceUnavailable",
            WeftError::ReferenceCircular { .. } => "ReferenceCircular",
            WeftError::DepthExceeded { .. } => "DepthExceeded",
            WeftError::NotFound(_) => "NotFound",
            WeftError::Store(_) => "Store",
            WeftError::Config(_) => "Config",
        }
    }

    /// Paths named by a `ValidationFailed` error; empty for anything else.
    pub fn violation_paths(&self) -> Vec<&str> {
        match self {
            WeftError::ValidationFailed { violations } => {
                violations.iter().map(|v| v.path.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl From<serde_json::Error> for WeftError {
    fn from(e: serde_json::Error) -> Self {
        WeftError::Store(StoreError::Backend(format!("serialization: {e}")))
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_paths() {
        let err = WeftError::ValidationFailed {
            violations: vec![
                FieldViolation::new("/done", "expected boolean"),
                FieldViolation::new("", "expected object"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Validation failed: /done: expected boolean; /: expected object"
        );
        assert_eq!(err.violation_paths(), vec!["/done", ""]);
        assert_eq!(err.code(), "ValidationFailed");
    }

    #[test]
    fn test_store_errors_convert() {
        let err: WeftError = StoreError::Backend("down".into()).into();
        assert_eq!(err.code(), "Store");
        assert_eq!(err.to_string(), "Backend error: down");
    }
}
