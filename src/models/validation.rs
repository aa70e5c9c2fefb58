use serde::{Deserialize, Serialize};

/// Severity of a validation finding.
///
/// `Critical` and `Error` block an import; `Warning` is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::Critical | Self::Error)
    }
}

/// Machine-readable identifier of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    InvalidJson,
    MissingField,
    InvalidStops,
    MissingStopField,
    InvalidStopField,
    StopCountMismatch,
    InvalidMetadata,
    DuplicateStopId,
    SchemaIncompatible,
    InvalidSetting,
    InvalidTimestamp,
    MissingTimestamp,
    DocumentUnreadable,
    DepthExceeded,
    SecurityRejected,
    ImportInProgress,
    RepositoryFailure,
    MergeFailure,
    Cancelled,
    MemoryExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn new(code: IssueCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            severity,
        }
    }

    pub fn critical(code: IssueCode, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Critical, message)
    }

    pub fn error(code: IssueCode, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Error, message)
    }

    pub fn warning(code: IssueCode, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Warning, message)
    }

    pub fn at(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Outcome of validating one document.
///
/// `errors` holds `Critical` and `Error` issues, `warnings` the rest;
/// `is_valid` is always derived from the issue list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub schema_version: String,
    pub is_compatible: bool,
}

impl ValidationResult {
    /// Split collected issues by severity and derive validity.
    pub fn from_issues(
        issues: Vec<ValidationIssue>,
        schema_version: impl Into<String>,
        is_compatible: bool,
    ) -> Self {
        let (errors, warnings): (Vec<_>, Vec<_>) =
            issues.into_iter().partition(|i| i.severity.is_blocking());
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            schema_version: schema_version.into(),
            is_compatible,
        }
    }

    /// Result used when the caller opted out of validation.
    pub fn skipped(schema_version: impl Into<String>) -> Self {
        Self::from_issues(Vec::new(), schema_version, true)
    }

    /// Result carrying a single critical issue.
    pub fn critical(
        code: IssueCode,
        message: impl Into<String>,
        schema_version: impl Into<String>,
    ) -> Self {
        Self::from_issues(
            vec![ValidationIssue::critical(code, message)],
            schema_version,
            false,
        )
    }

    /// Append an issue, keeping `is_valid` consistent.
    pub fn push(&mut self, issue: ValidationIssue) {
        if issue.severity.is_blocking() {
            self.errors.push(issue);
            self.is_valid = false;
        } else {
            self.warnings.push(issue);
        }
    }

    pub fn has_code(&self, code: IssueCode) -> bool {
        self.issues().any(|i| i.code == code)
    }

    pub fn issues(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.errors.iter().chain(self.warnings.iter())
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.issues().filter(|i| i.severity == severity).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warnings_never_block_validity() {
        let result = ValidationResult::from_issues(
            vec![ValidationIssue::warning(IssueCode::DuplicateStopId, "dup")],
            "1.0.0",
            true,
        );
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_error_blocks_validity() {
        let result = ValidationResult::from_issues(
            vec![
                ValidationIssue::warning(IssueCode::DuplicateStopId, "dup"),
                ValidationIssue::error(IssueCode::StopCountMismatch, "count"),
            ],
            "1.0.0",
            true,
        );
        assert!(!result.is_valid);
        assert_eq!(result.count(Severity::Error), 1);
        assert_eq!(result.count(Severity::Warning), 1);
    }

    #[test]
    fn test_push_keeps_validity_in_sync() {
        let mut result = ValidationResult::skipped("1.0.0");
        assert!(result.is_valid);

        result.push(ValidationIssue::critical(IssueCode::MergeFailure, "boom"));
        assert!(!result.is_valid);
        assert!(result.has_code(IssueCode::MergeFailure));
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let code = serde_json::to_string(&IssueCode::SchemaIncompatible).unwrap();
        assert_eq!(code, "\"SCHEMA_INCOMPATIBLE\"");
    }
}
