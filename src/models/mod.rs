//! Data models shared by every stage of the import/export engine.
//!
//! - [`AppConfig`] / [`StopConfig`]: the user's dashboard configuration
//! - [`ConfigExport`]: the portable, versioned document written on export
//! - [`ValidationResult`]: graded findings about an incoming document
//! - [`ImportOptions`], [`ImportPreview`], [`ImportResult`], [`Backup`]: the
//!   import conversation with the UI layer
//!
//! All wire-facing types serialize with camelCase keys so the exported JSON
//! matches the documents older installations produce.

pub mod export;
pub mod import;
pub mod stop;
pub mod validation;

pub use export::{
    CURRENT_SCHEMA_VERSION, ConfigExport, ExportMetadata, ExportSettings,
    SUPPORTED_SCHEMA_VERSIONS,
};
pub use import::{
    Backup, ConflictKind, ConflictSeverity, EstimatedChanges, GlobalSettingsChanges,
    ImportConflict, ImportOptions, ImportPreview, ImportResult, MergeStrategy, StopChange,
    StopPreviewItem,
};
pub use stop::{AppConfig, City, StopConfig};
pub use validation::{IssueCode, Severity, ValidationIssue, ValidationResult};
