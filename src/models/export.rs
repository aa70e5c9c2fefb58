use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stop::AppConfig;

/// Schema version written into every new export.
pub const CURRENT_SCHEMA_VERSION: &str = "1.0.0";

/// Schema versions this engine can import without loss.
pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &["1.0.0", "1.0"];

/// Portable, versioned envelope around an [`AppConfig`].
///
/// Structurally valid only when `metadata.stop_count == config.stops.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigExport {
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exported_by: String,
    pub metadata: ExportMetadata,
    pub config: AppConfig,
    #[serde(default)]
    pub export_settings: ExportSettings,
}

impl ConfigExport {
    pub fn stop_count_consistent(&self) -> bool {
        self.metadata.stop_count == self.config.stops.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub stop_count: usize,
    #[serde(default)]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Which parts of the configuration an export carries verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSettings {
    #[serde(default = "enabled")]
    pub include_user_settings: bool,
    #[serde(default = "enabled")]
    pub include_stop_positions: bool,
    #[serde(default = "enabled")]
    pub include_visibility_settings: bool,
}

fn enabled() -> bool {
    true
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            include_user_settings: true,
            include_stop_positions: true,
            include_visibility_settings: true,
        }
    }
}

/// Whether `version` is one of the importable schema versions.
pub fn is_supported_schema_version(version: &str, supported: &[String]) -> bool {
    supported.iter().any(|v| v == version)
}
