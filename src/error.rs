// 🚫 Error Kinds - every failure is a typed, recoverable result
//
// Validation     → malformed record, rejected before any state change
// CatalogUnavailable → nothing to allocate against (empty or stale snapshot)
// CommitFailure  → a checkout batch had bad lines, whole batch rolled back
// Storage / Serialization / Io / Csv → durable state or an import file could not be read or written

use crate::optimizer::AllocationPlan;
use serde::Serialize;
use thiserror::Error;

/// Library result type
pub type LedgerResult<T> = Result<T, LedgerError>;

// ============================================================================
// FIELD-LEVEL VALIDATION ERROR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub context: String,
}

impl ValidationError {
    pub fn new(context: &str, field: &str, message: impl Into<String>) -> Self {
        ValidationError {
            field: field.to_string(),
            message: message.into(),
            context: context.to_string(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.context, self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// A checkout line that failed validation, by its position in the plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineFailure {
    pub line_index: usize,
    pub offering_id: String,
    pub errors: Vec<ValidationError>,
}

// ============================================================================
// LEDGER ERROR
// ============================================================================

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("catalog unavailable: {reason}")]
    CatalogUnavailable { reason: String },

    /// The plan is handed back untouched so the caller can correct it
    #[error("commit failed: {} of {} line(s) invalid, ledger unchanged", .failures.len(), .plan.lines.len())]
    CommitFailure {
        failures: Vec<LineFailure>,
        plan: AllocationPlan,
    },

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv failure: {0}")]
    Csv(#[from] csv::Error),
}

impl LedgerError {
    pub fn validation(context: &str, field: &str, message: impl Into<String>) -> Self {
        LedgerError::Validation(vec![ValidationError::new(context, field, message)])
    }

    pub fn catalog_unavailable(reason: impl Into<String>) -> Self {
        LedgerError::CatalogUnavailable {
            reason: reason.into(),
        }
    }

    /// Short machine-readable kind, used by the API envelope
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation_error",
            LedgerError::CatalogUnavailable { .. } => "catalog_unavailable",
            LedgerError::CommitFailure { .. } => "commit_failure",
            LedgerError::Storage(_) => "storage_failure",
            LedgerError::Serialization(_) => "serialization_failure",
            LedgerError::Io(_) => "io_failure",
            LedgerError::Csv(_) => "csv_failure",
        }
    }

    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            LedgerError::Validation(errors) => errors,
            _ => &[],
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new("Emission", "amount_kg", "must be greater than 0");
        assert_eq!(err.to_string(), "[Emission] amount_kg: must be greater than 0");
    }

    #[test]
    fn test_ledger_error_joins_all_validation_errors() {
        let err = LedgerError::Validation(vec![
            ValidationError::new("Emission", "amount_kg", "must be finite"),
            ValidationError::new("Emission", "date", "unparseable"),
        ]);

        let message = err.to_string();
        assert!(message.contains("amount_kg"));
        assert!(message.contains("date"));
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(err.validation_errors().len(), 2);
    }

    #[test]
    fn test_catalog_unavailable_kind() {
        let err = LedgerError::catalog_unavailable("no offerings");
        assert_eq!(err.kind(), "catalog_unavailable");
        assert!(err.validation_errors().is_empty());
        assert_eq!(err.to_string(), "catalog unavailable: no offerings");
    }
}
