use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stop::{AppConfig, City, StopConfig};
use super::validation::ValidationResult;

/// Per-attempt import switches. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    pub overwrite_existing: bool,
    pub import_only_visible: bool,
    pub preserve_stop_positions: bool,
    pub import_global_settings: bool,
    pub validate_before_import: bool,
    pub create_backup: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            overwrite_existing: false,
            import_only_visible: false,
            preserve_stop_positions: true,
            import_global_settings: true,
            validate_before_import: true,
            create_backup: true,
        }
    }
}

impl ImportOptions {
    pub fn strategy(&self) -> MergeStrategy {
        if self.overwrite_existing {
            MergeStrategy::Replace
        } else {
            MergeStrategy::Merge
        }
    }
}

/// How incoming stops combine with existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Discard existing stops; incoming order defines positions.
    Replace,
    /// Upsert by id; updates keep their slot, new stops are appended.
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopChange {
    Added,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPreviewItem {
    pub id: String,
    pub name: String,
    pub city: City,
    pub stop_id: String,
    pub visible: bool,
    pub change: StopChange,
}

impl StopPreviewItem {
    pub fn from_stop(stop: &StopConfig, change: StopChange) -> Self {
        Self {
            id: stop.id.clone(),
            name: stop.name.clone(),
            city: stop.city,
            stop_id: stop.stop_id.clone(),
            visible: stop.visible,
            change,
        }
    }
}

/// Ordered so that sorting descending puts `High` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Same id, different display slot.
    PositionChanged,
    /// Same id, different name.
    NameChanged,
    /// Same id, different network or provider stop id.
    IdentityCollision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportConflict {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub severity: ConflictSeverity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_resolution: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimatedChanges {
    pub stops_added: usize,
    pub stops_updated: usize,
    pub stops_removed: usize,
    pub settings_changed: usize,
}

/// The global settings an import would change, with their incoming values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettingsChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dark_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_departures_shown: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl GlobalSettingsChanges {
    pub fn between(current: &AppConfig, incoming: &AppConfig) -> Self {
        Self {
            dark_mode: (current.dark_mode != incoming.dark_mode).then_some(incoming.dark_mode),
            refresh_interval_seconds: (current.refresh_interval_seconds
                != incoming.refresh_interval_seconds)
                .then_some(incoming.refresh_interval_seconds),
            max_departures_shown: (current.max_departures_shown != incoming.max_departures_shown)
                .then_some(incoming.max_departures_shown),
            language: (current.language != incoming.language).then(|| incoming.language.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dark_mode.is_none()
            && self.refresh_interval_seconds.is_none()
            && self.max_departures_shown.is_none()
            && self.language.is_none()
    }
}

/// What an import would do, computed without touching anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPreview {
    pub stop_count: usize,
    pub stops: Vec<StopPreviewItem>,
    pub conflicts: Vec<ImportConflict>,
    pub estimated_changes: EstimatedChanges,
    pub global_settings_changes: GlobalSettingsChanges,
}

/// Immutable pre-import snapshot of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    timestamp: DateTime<Utc>,
    config: AppConfig,
}

impl Backup {
    /// Deep-copy `config` into a new snapshot.
    pub fn capture(config: &AppConfig) -> Self {
        Self {
            timestamp: Utc::now(),
            config: config.clone(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub success: bool,
    pub imported_config: Option<AppConfig>,
    pub imported_stops_count: usize,
    pub validation: ValidationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<Backup>,
    pub messages: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_options_defaults() {
        let options = ImportOptions::default();
        assert!(!options.overwrite_existing);
        assert!(!options.import_only_visible);
        assert!(options.preserve_stop_positions);
        assert!(options.import_global_settings);
        assert!(options.validate_before_import);
        assert!(options.create_backup);
        assert_eq!(options.strategy(), MergeStrategy::Merge);
    }

    #[test]
    fn test_backup_is_detached_from_source() {
        let mut config = AppConfig::default();
        let backup = Backup::capture(&config);

        config.dark_mode = true;
        config.language = "de".to_string();

        assert!(!backup.config().dark_mode);
        assert_eq!(backup.config().language, "en");
    }

    #[test]
    fn test_conflict_severity_ordering() {
        let mut severities = vec![
            ConflictSeverity::Low,
            ConflictSeverity::High,
            ConflictSeverity::Medium,
        ];
        severities.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            severities,
            vec![
                ConflictSeverity::High,
                ConflictSeverity::Medium,
                ConflictSeverity::Low
            ]
        );
    }

    #[test]
    fn test_global_settings_changes_only_lists_differences() {
        let current = AppConfig::default();
        let mut incoming = AppConfig::default();
        incoming.refresh_interval_seconds = 120;

        let changes = GlobalSettingsChanges::between(&current, &incoming);
        assert_eq!(changes.refresh_interval_seconds, Some(120));
        assert!(changes.dark_mode.is_none());
        assert!(changes.language.is_none());
        assert!(!changes.is_empty());
    }
}
