//! Building the portable export document.

use chrono::{DateTime, Utc};

use crate::models::{AppConfig, CURRENT_SCHEMA_VERSION, ConfigExport, ExportMetadata, ExportSettings};

const FILENAME_PREFIX: &str = "stopboard-config";

/// Identifies the producing engine in `metadata.source`.
pub fn export_source() -> String {
    format!("{}/{}", crate::APP_NAME, crate::VERSION)
}

/// Summary metadata for `config`, as written into the export header.
pub fn create_export_summary(config: &AppConfig) -> ExportMetadata {
    ExportMetadata {
        stop_count: config.stops.len(),
        language: config.language.clone(),
        source: Some(export_source()),
    }
}

/// Build an export of `config` stamped with the current time.
pub fn create_export(
    config: &AppConfig,
    exported_by: &str,
    settings: ExportSettings,
) -> ConfigExport {
    create_export_at(config, exported_by, settings, Utc::now())
}

/// Build an export of `config` stamped with `now`.
///
/// Stop order is always kept. Parts excluded through `settings` are written
/// in their neutral form: default global settings, array-order positions,
/// every stop visible.
pub fn create_export_at(
    config: &AppConfig,
    exported_by: &str,
    settings: ExportSettings,
    now: DateTime<Utc>,
) -> ConfigExport {
    let mut exported = if settings.include_user_settings {
        config.clone()
    } else {
        AppConfig {
            stops: config.stops.clone(),
            ..AppConfig::default()
        }
    };

    for (index, stop) in exported.stops.iter_mut().enumerate() {
        if !settings.include_stop_positions {
            stop.position = index;
        }
        if !settings.include_visibility_settings {
            stop.visible = true;
        }
    }

    tracing::info!(
        "Exporting {} stops (settings={}, positions={}, visibility={})",
        exported.stops.len(),
        settings.include_user_settings,
        settings.include_stop_positions,
        settings.include_visibility_settings
    );

    ConfigExport {
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
        export_timestamp: Some(now),
        exported_by: exported_by.to_string(),
        metadata: create_export_summary(&exported),
        config: exported,
        export_settings: settings,
    }
}

/// File name offered for download, e.g. `stopboard-config-2024-03-01_14-05-09.json`.
pub fn export_filename(now: DateTime<Utc>) -> String {
    format!("{FILENAME_PREFIX}-{}.json", now.format("%Y-%m-%d_%H-%M-%S"))
}

pub fn to_pretty_json(export: &ConfigExport) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(export)
}
