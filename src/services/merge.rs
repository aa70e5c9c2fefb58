//! Deterministic combination of an existing configuration with an imported one.
//!
//! Under [`MergeStrategy::Merge`] a stop matched by id is updated in place and
//! keeps its slot; an unmatched stop is appended at the end. An import can
//! therefore never reorder the stops a user already arranged. Position
//! renumbering and visibility filtering are separate passes applied after
//! the merge by [`MergeEngine::apply`].

use indexmap::IndexMap;
use std::collections::HashSet;
use thiserror::Error;

use crate::models::{AppConfig, ImportOptions, MergeStrategy, StopConfig};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("merged configuration contains stop id {0:?} more than once")]
    DuplicateStopId(String),

    #[error(
        "merged configuration has out-of-range settings (refresh {refresh_interval_seconds}s, {max_departures_shown} departures)"
    )]
    InvalidSettings {
        refresh_interval_seconds: u32,
        max_departures_shown: u32,
    },
}

/// Combine two stop lists according to `strategy`.
///
/// Duplicate ids inside `incoming` resolve by document order: the last
/// occurrence supplies the content, the first occurrence's slot is kept.
pub fn merge_stops(
    existing: &[StopConfig],
    incoming: &[StopConfig],
    strategy: MergeStrategy,
) -> Vec<StopConfig> {
    match strategy {
        MergeStrategy::Replace => replace_stops(incoming),
        MergeStrategy::Merge => upsert_stops(existing, incoming),
    }
}

fn replace_stops(incoming: &[StopConfig]) -> Vec<StopConfig> {
    let mut by_id: IndexMap<&str, &StopConfig> = IndexMap::with_capacity(incoming.len());
    for stop in incoming {
        // IndexMap::insert keeps the original slot of an existing key.
        by_id.insert(stop.id.as_str(), stop);
    }

    by_id
        .into_values()
        .enumerate()
        .map(|(position, stop)| StopConfig {
            position,
            ..stop.clone()
        })
        .collect()
}

fn upsert_stops(existing: &[StopConfig], incoming: &[StopConfig]) -> Vec<StopConfig> {
    let mut merged = existing.to_vec();
    let mut slots: IndexMap<String, usize> = IndexMap::with_capacity(merged.len() + incoming.len());
    for (index, stop) in merged.iter().enumerate() {
        slots.entry(stop.id.clone()).or_insert(index);
    }

    for stop in incoming {
        match slots.get(&stop.id) {
            Some(&index) => merged[index].update_content_from(stop),
            None => {
                let mut appended = stop.clone();
                appended.position = merged.len();
                slots.insert(appended.id.clone(), merged.len());
                merged.push(appended);
            }
        }
    }

    merged
}

/// Renumber positions 0..n-1 in the list's current order.
pub fn normalize_positions(stops: &mut [StopConfig]) {
    for (position, stop) in stops.iter_mut().enumerate() {
        stop.position = position;
    }
}

/// Drop stops that are not visible.
pub fn filter_visible(stops: &mut Vec<StopConfig>) {
    stops.retain(|stop| stop.visible);
}

/// Take all four global settings from `incoming`, or none of them.
pub fn merge_settings(target: &mut AppConfig, incoming: &AppConfig, import_global_settings: bool) {
    if import_global_settings {
        target.take_global_settings(incoming);
    }
}

/// Full merge pipeline used by the import orchestrator.
pub struct MergeEngine;

impl MergeEngine {
    /// Compute the configuration an import would commit.
    ///
    /// Steps: stop merge, visibility filter on the merged list, optional
    /// position normalization, settings merge, final invariant check.
    pub fn apply(
        existing: &AppConfig,
        incoming: &AppConfig,
        options: &ImportOptions,
    ) -> Result<AppConfig, MergeError> {
        let strategy = options.strategy();
        let mut stops = merge_stops(&existing.stops, &incoming.stops, strategy);

        if options.import_only_visible {
            filter_visible(&mut stops);
        }
        if !options.preserve_stop_positions {
            normalize_positions(&mut stops);
        }

        let mut merged = AppConfig {
            stops,
            ..existing.clone()
        };
        merge_settings(&mut merged, incoming, options.import_global_settings);

        Self::verify(&merged)?;

        tracing::debug!(
            "Merged configuration ({:?}): {} existing + {} incoming -> {} stops",
            strategy,
            existing.stops.len(),
            incoming.stops.len(),
            merged.stops.len()
        );

        Ok(merged)
    }

    fn verify(config: &AppConfig) -> Result<(), MergeError> {
        let mut ids = HashSet::with_capacity(config.stops.len());
        if let Some(dup) = config.stops.iter().find(|s| !ids.insert(s.id.as_str())) {
            return Err(MergeError::DuplicateStopId(dup.id.clone()));
        }
        if !config.settings_in_range() {
            return Err(MergeError::InvalidSettings {
                refresh_interval_seconds: config.refresh_interval_seconds,
                max_departures_shown: config.max_departures_shown,
            });
        }
        Ok(())
    }
}
