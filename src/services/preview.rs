//! Side-effect-free diff between the current configuration and an import.

use indexmap::IndexMap;

use crate::i18n::{Locale, Message};
use crate::models::{
    AppConfig, ConfigExport, ConflictKind, ConflictSeverity, EstimatedChanges,
    GlobalSettingsChanges, ImportConflict, ImportPreview, MergeStrategy, StopChange, StopConfig,
    StopPreviewItem,
};

/// Preview an import under the default `merge` strategy.
pub fn preview(doc: &ConfigExport, current: &AppConfig) -> ImportPreview {
    preview_with_strategy(doc, current, MergeStrategy::Merge)
}

pub fn preview_with_strategy(
    doc: &ConfigExport,
    current: &AppConfig,
    strategy: MergeStrategy,
) -> ImportPreview {
    let incoming = &doc.config;
    let current_by_id: IndexMap<&str, &StopConfig> =
        current.stops.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut stops = Vec::with_capacity(incoming.stops.len());
    let mut conflicts = Vec::new();
    let mut changes = EstimatedChanges::default();

    for stop in &incoming.stops {
        let change = match current_by_id.get(stop.id.as_str()) {
            None => {
                changes.stops_added += 1;
                StopChange::Added
            }
            Some(existing) => {
                conflicts.extend(conflicts_for(existing, stop));
                if existing.same_content(stop) {
                    StopChange::Unchanged
                } else {
                    changes.stops_updated += 1;
                    StopChange::Updated
                }
            }
        };
        stops.push(StopPreviewItem::from_stop(stop, change));
    }

    changes.stops_removed = match strategy {
        MergeStrategy::Merge => 0,
        MergeStrategy::Replace => {
            let surviving = current
                .stops
                .iter()
                .filter(|s| incoming.stops.iter().any(|i| i.id == s.id))
                .count();
            current.stops.len() - surviving
        }
    };
    changes.settings_changed = current.settings_diff_count(incoming);

    // Stable sort keeps document order inside a severity band.
    conflicts.sort_by(|a, b| b.severity.cmp(&a.severity));

    tracing::debug!(
        "Import preview: +{} ~{} -{} settings={} conflicts={}",
        changes.stops_added,
        changes.stops_updated,
        changes.stops_removed,
        changes.settings_changed,
        conflicts.len()
    );

    ImportPreview {
        stop_count: incoming.stops.len(),
        stops,
        conflicts,
        estimated_changes: changes,
        global_settings_changes: GlobalSettingsChanges::between(current, incoming),
    }
}

/// One-line conflict summary for the preview dialog.
pub fn conflict_summary(preview: &ImportPreview, locale: Locale) -> String {
    match preview.conflicts.len() {
        0 => Message::NoConflicts.render(locale),
        count => Message::Conflicts { count }.render(locale),
    }
}

fn conflicts_for(existing: &StopConfig, incoming: &StopConfig) -> Vec<ImportConflict> {
    let mut found = Vec::new();
    let id = Some(existing.id.clone());

    if existing.city != incoming.city || existing.stop_id != incoming.stop_id {
        found.push(ImportConflict {
            kind: ConflictKind::IdentityCollision,
            severity: ConflictSeverity::High,
            description: format!(
                "stop {:?} points to {}/{} here but {}/{} in the import",
                existing.id,
                existing.city.code(),
                existing.stop_id,
                incoming.city.code(),
                incoming.stop_id
            ),
            stop_id: id.clone(),
            suggested_resolution: Some("treat as distinct stop / regenerate id".to_string()),
        });
    }

    if existing.name != incoming.name {
        found.push(ImportConflict {
            kind: ConflictKind::NameChanged,
            severity: ConflictSeverity::Medium,
            description: format!(
                "stop {:?} is named {:?} here but {:?} in the import",
                existing.id, existing.name, incoming.name
            ),
            stop_id: id.clone(),
            suggested_resolution: None,
        });
    }

    if existing.position != incoming.position {
        found.push(ImportConflict {
            kind: ConflictKind::PositionChanged,
            severity: ConflictSeverity::Low,
            description: format!(
                "stop {:?} sits at position {} here but {} in the import; the current slot is kept",
                existing.id, existing.position, incoming.position
            ),
            stop_id: id,
            suggested_resolution: None,
        });
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{City, ExportMetadata, ExportSettings};

    fn stop(id: &str, name: &str, position: usize) -> StopConfig {
        StopConfig {
            id: id.to_string(),
            name: name.to_string(),
            city: City::A,
            stop_id: format!("p-{id}"),
            walking_time_minutes: 2,
            visible: true,
            position,
        }
    }

    fn export_of(config: AppConfig) -> ConfigExport {
        ConfigExport {
            schema_version: "1.0.0".to_string(),
            export_timestamp: None,
            exported_by: "tests".to_string(),
            metadata: ExportMetadata {
                stop_count: config.stops.len(),
                language: config.language.clone(),
                source: None,
            },
            config,
            export_settings: ExportSettings::default(),
        }
    }

    fn current() -> AppConfig {
        AppConfig {
            stops: vec![stop("s1", "One", 0), stop("s2", "Two", 1)],
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_counts_added_updated_and_unchanged() {
        let mut renamed = stop("s1", "One renamed", 0);
        renamed.walking_time_minutes = 9;
        let doc = export_of(AppConfig {
            stops: vec![renamed, stop("s2", "Two", 1), stop("s3", "Three", 2)],
            ..AppConfig::default()
        });

        let preview = preview(&doc, &current());

        assert_eq!(preview.stop_count, 3);
        assert_eq!(preview.estimated_changes.stops_added, 1);
        assert_eq!(preview.estimated_changes.stops_updated, 1);
        assert_eq!(preview.estimated_changes.stops_removed, 0);
        let changes: Vec<_> = preview.stops.iter().map(|s| s.change).collect();
        assert_eq!(
            changes,
            vec![StopChange::Updated, StopChange::Unchanged, StopChange::Added]
        );
    }

    #[test]
    fn test_position_only_difference_is_not_an_update() {
        let doc = export_of(AppConfig {
            stops: vec![stop("s1", "One", 7)],
            ..AppConfig::default()
        });
        let preview = preview(&doc, &current());

        assert_eq!(preview.estimated_changes.stops_updated, 0);
        assert_eq!(preview.conflicts.len(), 1);
        assert_eq!(preview.conflicts[0].severity, ConflictSeverity::Low);
    }

    #[test]
    fn test_replace_counts_removed_stops() {
        let doc = export_of(AppConfig {
            stops: vec![stop("s2", "Two", 0), stop("s9", "Nine", 1)],
            ..AppConfig::default()
        });
        let preview = preview_with_strategy(&doc, &current(), MergeStrategy::Replace);
        assert_eq!(preview.estimated_changes.stops_removed, 1);
    }

    #[test]
    fn test_conflicts_sorted_high_first() {
        let mut moved_and_renamed = stop("s1", "Renamed", 3);
        moved_and_renamed.stop_id = "other-provider".to_string();
        let doc = export_of(AppConfig {
            stops: vec![stop("s2", "Two again", 1), moved_and_renamed],
            ..AppConfig::default()
        });

        let preview = preview(&doc, &current());
        let severities: Vec<_> = preview.conflicts.iter().map(|c| c.severity).collect();
        assert_eq!(
            severities,
            vec![
                ConflictSeverity::High,
                ConflictSeverity::Medium,
                ConflictSeverity::Medium,
                ConflictSeverity::Low
            ]
        );
        assert_eq!(
            preview.conflicts[0].suggested_resolution.as_deref(),
            Some("treat as distinct stop / regenerate id")
        );
    }

    #[test]
    fn test_conflict_summary() {
        let clean = preview(&export_of(current()), &current());
        assert_eq!(
            conflict_summary(&clean, Locale::En),
            Message::NoConflicts.render(Locale::En)
        );

        let doc = export_of(AppConfig {
            stops: vec![stop("s1", "Renamed", 0)],
            ..AppConfig::default()
        });
        assert_eq!(
            conflict_summary(&preview(&doc, &current()), Locale::De),
            Message::Conflicts { count: 1 }.render(Locale::De)
        );
    }

    #[test]
    fn test_settings_changes_counted() {
        let doc = export_of(AppConfig {
            dark_mode: true,
            language: "de".to_string(),
            ..AppConfig::default()
        });
        let preview = preview(&doc, &current());

        assert_eq!(preview.estimated_changes.settings_changed, 2);
        assert_eq!(preview.global_settings_changes.dark_mode, Some(true));
        assert_eq!(preview.global_settings_changes.language.as_deref(), Some("de"));
    }
}
