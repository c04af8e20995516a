//! Error handling for the curation core.
//!
//! This module provides idiomatic Rust error types using thiserror. The
//! variants fall into four families that callers treat differently:
//! validation errors (fix the input), concurrency errors (re-fetch and retry
//! with the current version), not-found errors, and infrastructure errors.

use thiserror::Error;

/// Main error type for the curation core
#[derive(Error, Debug)]
pub enum CurationError {
    /// A record with this persistent id already exists; an update must carry
    /// the current version.
    #[error("record already exists; supply the current version to change it")]
    AlreadyExists,

    /// The supplied expected version no longer matches the chain head.
    #[error("stale version: current head is {current}")]
    StaleVersion { current: i64 },

    #[error("not found: {0}")]
    NotFound(String),

    /// Sibling tag definitions must have distinct names.
    #[error("a tag definition named '{0}' already exists under the same parent")]
    DuplicateName(String),

    /// A tag definition's parent must be Inner-typed.
    #[error("tag definition {0} cannot have children: not Inner-typed")]
    InvalidParent(String),

    /// A tag instance value failed validation against its definition's type.
    #[error("invalid value '{value}' for a {expected} tag")]
    InvalidValue { value: String, expected: String },

    /// Columns mapped to missing or hidden tag definitions.
    #[error("invalid tag assignment for columns: {}", .columns.join(", "))]
    InvalidTagAssignment { columns: Vec<String> },

    /// Two active columns mapped to the same tag definition.
    #[error("duplicate tag assignment for columns: {}", .columns.join(", "))]
    DuplicateAssignment { columns: Vec<String> },

    /// The operation is not permitted in the record's current state.
    #[error("cannot {operation} while in state {state}")]
    InvalidState {
        state: String,
        operation: &'static str,
    },

    #[error("permission denied: {0}")]
    Forbidden(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CurationError {
    /// Short message suitable for the `error_msg` column of a pipeline record.
    pub fn pipeline_msg(&self) -> String {
        self.to_string()
    }

    /// Verbose rendering (including the source chain) for `error_trace`.
    pub fn pipeline_trace(&self) -> String {
        format!("{self:?}")
    }
}

pub type Result<T, E = CurationError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_errors_list_columns() {
        let err = CurationError::DuplicateAssignment {
            columns: vec!["age".into(), "age_years".into()],
        };
        assert_eq!(
            err.to_string(),
            "duplicate tag assignment for columns: age, age_years"
        );
    }

    #[test]
    fn test_stale_version_carries_current_head() {
        let err = CurationError::StaleVersion { current: 42 };
        assert!(err.to_string().contains("42"));
    }
}
