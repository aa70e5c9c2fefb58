//! Structural and schema validation of incoming export documents.
//!
//! Findings are graded: `critical` for documents that cannot be interpreted
//! at all, `error` for recoverable structural problems, `warning` for things
//! the user should see but that never block an import. Validity is derived
//! from the collected issues, never tracked separately.

use chrono::DateTime;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

use super::{ChunkGate, Interrupted, Ungated};
use crate::config::SchemaSettings;
use crate::models::export::is_supported_schema_version;
use crate::models::stop::{MIN_DEPARTURES_SHOWN, MIN_REFRESH_INTERVAL_SECONDS};
use crate::models::{City, ConfigExport, IssueCode, ValidationIssue, ValidationResult};

const REQUIRED_TOP_LEVEL: &[&str] = &["schemaVersion", "config", "metadata"];
const REQUIRED_STOP_FIELDS: &[&str] = &["id", "name", "city"];

/// Schema expectations for one validation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationContext {
    pub current_schema_version: String,
    pub supported_versions: Vec<String>,
    /// When false, an unsupported schema version is only a warning.
    pub strict: bool,
}

impl Default for ValidationContext {
    fn default() -> Self {
        Self::from(&SchemaSettings::default())
    }
}

impl From<&SchemaSettings> for ValidationContext {
    fn from(settings: &SchemaSettings) -> Self {
        Self {
            current_schema_version: settings.current_version.clone(),
            supported_versions: settings.supported_versions.clone(),
            strict: settings.strict,
        }
    }
}

impl ValidationContext {
    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaValidator {
    ctx: ValidationContext,
}

impl SchemaValidator {
    pub fn new(ctx: ValidationContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ValidationContext {
        &self.ctx
    }

    /// Parse `text` and validate it. Unparseable JSON is a single critical issue.
    pub fn validate_text(&self, text: &str) -> ValidationResult {
        match serde_json::from_str::<Value>(text) {
            Ok(doc) => self.validate(&doc),
            Err(err) => ValidationResult::critical(
                IssueCode::InvalidJson,
                format!("document is not valid JSON: {err}"),
                String::new(),
            ),
        }
    }

    pub fn validate(&self, doc: &Value) -> ValidationResult {
        match self.validate_with(doc, &Ungated) {
            Ok(result) => result,
            Err(interrupted) => {
                // Ungated never interrupts; keep a structured answer anyway.
                ValidationResult::critical(IssueCode::Cancelled, interrupted.to_string(), "")
            }
        }
    }

    /// Validate `doc`, yielding to `gate` between chunks of stops.
    pub fn validate_with(
        &self,
        doc: &Value,
        gate: &dyn ChunkGate,
    ) -> Result<ValidationResult, Interrupted> {
        let Some(root) = doc.as_object() else {
            return Ok(ValidationResult::critical(
                IssueCode::InvalidJson,
                "document root must be a JSON object",
                String::new(),
            ));
        };

        let mut issues = Vec::new();

        for field in REQUIRED_TOP_LEVEL {
            if root.get(*field).is_none_or(Value::is_null) {
                issues.push(
                    ValidationIssue::critical(
                        IssueCode::MissingField,
                        format!("required field {field} is missing"),
                    )
                    .at(*field),
                );
            }
        }

        let schema_version = match root.get("schemaVersion") {
            Some(Value::String(v)) => Some(v.clone()),
            Some(Value::Null) | None => None,
            Some(_) => {
                issues.push(
                    ValidationIssue::critical(
                        IssueCode::SchemaIncompatible,
                        "schemaVersion must be a string",
                    )
                    .at("schemaVersion"),
                );
                None
            }
        };

        let stop_count = match root.get("config") {
            Some(Value::Object(config)) => {
                self.check_settings(config, &mut issues);
                self.check_stops(config, gate, &mut issues)?
            }
            Some(Value::Null) | None => None,
            Some(_) => {
                issues.push(
                    ValidationIssue::critical(IssueCode::MissingField, "config must be an object")
                        .at("config"),
                );
                None
            }
        };

        match root.get("metadata") {
            Some(Value::Object(metadata)) => check_metadata(metadata, stop_count, &mut issues),
            Some(Value::Null) | None => {}
            Some(_) => issues.push(
                ValidationIssue::critical(IssueCode::InvalidMetadata, "metadata must be an object")
                    .at("metadata"),
            ),
        }

        if root.get("exportedBy").is_some_and(|v| !v.is_string()) {
            issues.push(
                ValidationIssue::error(IssueCode::InvalidMetadata, "exportedBy must be a string")
                    .at("exportedBy"),
            );
        }

        check_export_settings(root.get("exportSettings"), &mut issues);

        match root.get("exportTimestamp") {
            None | Some(Value::Null) => issues.push(
                ValidationIssue::warning(IssueCode::MissingTimestamp, "export timestamp is missing")
                    .at("exportTimestamp"),
            ),
            Some(Value::String(ts)) if DateTime::parse_from_rfc3339(ts).is_ok() => {}
            Some(_) => issues.push(
                ValidationIssue::error(
                    IssueCode::InvalidTimestamp,
                    "export timestamp is not an ISO 8601 date-time",
                )
                .at("exportTimestamp"),
            ),
        }

        let is_compatible = match &schema_version {
            Some(version) if is_supported_schema_version(version, &self.ctx.supported_versions) => {
                true
            }
            Some(version) => {
                let message = format!(
                    "schema version {version} is not supported (current: {})",
                    self.ctx.current_schema_version
                );
                let issue = if self.ctx.strict {
                    ValidationIssue::critical(IssueCode::SchemaIncompatible, message)
                } else {
                    ValidationIssue::warning(IssueCode::SchemaIncompatible, message)
                };
                issues.push(issue.at("schemaVersion"));
                false
            }
            None => false,
        };

        // Anything the field checks let through must still decode.
        if !issues.iter().any(|issue| issue.severity.is_blocking()) {
            if let Err(err) = ConfigExport::deserialize(doc) {
                issues.push(ValidationIssue::critical(
                    IssueCode::DocumentUnreadable,
                    format!("document could not be read: {err}"),
                ));
            }
        }

        let result =
            ValidationResult::from_issues(issues, schema_version.unwrap_or_default(), is_compatible);

        tracing::debug!(
            "Validated document: valid={}, errors={}, warnings={}, compatible={}",
            result.is_valid,
            result.errors.len(),
            result.warnings.len(),
            result.is_compatible
        );

        Ok(result)
    }

    /// Convert an already validated document into its typed form.
    pub fn decode(doc: Value) -> Result<ConfigExport, ValidationIssue> {
        serde_json::from_value(doc).map_err(|err| {
            ValidationIssue::critical(
                IssueCode::DocumentUnreadable,
                format!("document could not be read: {err}"),
            )
        })
    }

    fn check_settings(&self, config: &Map<String, Value>, issues: &mut Vec<ValidationIssue>) {
        let min_checks = [
            ("refreshIntervalSeconds", MIN_REFRESH_INTERVAL_SECONDS),
            ("maxDeparturesShown", MIN_DEPARTURES_SHOWN),
        ];
        for (field, min) in min_checks {
            let Some(value) = config.get(field) else {
                continue;
            };
            let in_range = value
                .as_u64()
                .is_some_and(|v| v >= u64::from(min) && v <= u64::from(u32::MAX));
            if !in_range {
                issues.push(
                    ValidationIssue::error(
                        IssueCode::InvalidSetting,
                        format!("{field} must be an integer of at least {min}"),
                    )
                    .at(format!("config.{field}")),
                );
            }
        }

        if config.get("darkMode").is_some_and(|v| !v.is_boolean()) {
            issues.push(
                ValidationIssue::error(IssueCode::InvalidSetting, "darkMode must be a boolean")
                    .at("config.darkMode"),
            );
        }
        if config.get("language").is_some_and(|v| !v.is_string()) {
            issues.push(
                ValidationIssue::error(IssueCode::InvalidSetting, "language must be a string")
                    .at("config.language"),
            );
        }
    }

    /// Check every stop; returns the stop count when `stops` is an array.
    fn check_stops(
        &self,
        config: &Map<String, Value>,
        gate: &dyn ChunkGate,
        issues: &mut Vec<ValidationIssue>,
    ) -> Result<Option<usize>, Interrupted> {
        let Some(stops) = config.get("stops").and_then(Value::as_array) else {
            issues.push(
                ValidationIssue::critical(IssueCode::InvalidStops, "config.stops must be an array")
                    .at("config.stops"),
            );
            return Ok(None);
        };

        let mut seen_ids = HashSet::new();
        let chunk_size = gate.chunk_size().max(1);

        for (chunk_index, chunk) in stops.chunks(chunk_size).enumerate() {
            for (offset, stop) in chunk.iter().enumerate() {
                let index = chunk_index * chunk_size + offset;
                check_stop(index, stop, &mut seen_ids, issues);
            }
            gate.checkpoint(chunk_index * chunk_size + chunk.len())?;
        }

        Ok(Some(stops.len()))
    }
}

fn check_metadata(
    metadata: &Map<String, Value>,
    stop_count: Option<usize>,
    issues: &mut Vec<ValidationIssue>,
) {
    if let Some(actual) = stop_count {
        match metadata.get("stopCount").and_then(Value::as_u64) {
            Some(declared) if declared == actual as u64 => {}
            Some(declared) => issues.push(
                ValidationIssue::error(
                    IssueCode::StopCountMismatch,
                    format!("metadata declares {declared} stops but config contains {actual}"),
                )
                .at("metadata.stopCount"),
            ),
            None => issues.push(
                ValidationIssue::error(
                    IssueCode::StopCountMismatch,
                    "metadata.stopCount is missing or not a count",
                )
                .at("metadata.stopCount"),
            ),
        }
    }

    if metadata.get("language").is_some_and(|v| !v.is_string()) {
        issues.push(
            ValidationIssue::error(IssueCode::InvalidMetadata, "metadata.language must be a string")
                .at("metadata.language"),
        );
    }
    if metadata
        .get("source")
        .is_some_and(|v| !v.is_null() && !v.is_string())
    {
        issues.push(
            ValidationIssue::error(IssueCode::InvalidMetadata, "metadata.source must be a string")
                .at("metadata.source"),
        );
    }
}

fn check_export_settings(settings: Option<&Value>, issues: &mut Vec<ValidationIssue>) {
    let settings = match settings {
        None => return,
        Some(Value::Object(settings)) => settings,
        Some(_) => {
            issues.push(
                ValidationIssue::error(IssueCode::InvalidSetting, "exportSettings must be an object")
                    .at("exportSettings"),
            );
            return;
        }
    };

    for field in [
        "includeUserSettings",
        "includeStopPositions",
        "includeVisibilitySettings",
    ] {
        if settings.get(field).is_some_and(|v| !v.is_boolean()) {
            issues.push(
                ValidationIssue::error(
                    IssueCode::InvalidSetting,
                    format!("exportSettings.{field} must be a boolean"),
                )
                .at(format!("exportSettings.{field}")),
            );
        }
    }
}

fn check_stop(
    index: usize,
    stop: &Value,
    seen_ids: &mut HashSet<String>,
    issues: &mut Vec<ValidationIssue>,
) {
    let path = format!("config.stops[{index}]");
    let Some(stop) = stop.as_object() else {
        issues.push(
            ValidationIssue::error(IssueCode::MissingStopField, format!("stop {index} is not an object"))
                .at(path),
        );
        return;
    };

    for field in REQUIRED_STOP_FIELDS {
        let present = stop.get(*field).and_then(Value::as_str).is_some_and(|v| !v.is_empty());
        if !present {
            issues.push(
                ValidationIssue::error(
                    IssueCode::MissingStopField,
                    format!("stop {index} is missing {field}"),
                )
                .at(format!("{path}.{field}")),
            );
        }
    }

    if let Some(city) = stop.get("city").and_then(Value::as_str) {
        if !city.is_empty() && City::from_code(city).is_none() {
            issues.push(
                ValidationIssue::error(
                    IssueCode::InvalidStopField,
                    format!("stop {index} has unknown city {city:?}"),
                )
                .at(format!("{path}.city")),
            );
        }
    }

    let bounds = [
        ("walkingTimeMinutes", u64::from(u32::MAX)),
        ("position", u64::try_from(usize::MAX).unwrap_or(u64::MAX)),
    ];
    for (field, max) in bounds {
        if stop
            .get(field)
            .is_some_and(|v| v.as_u64().is_none_or(|n| n > max))
        {
            issues.push(
                ValidationIssue::error(
                    IssueCode::InvalidStopField,
                    format!("stop {index} has a negative, non-integer or out of range {field}"),
                )
                .at(format!("{path}.{field}")),
            );
        }
    }

    if stop.get("stopId").is_some_and(|v| !v.is_string()) {
        issues.push(
            ValidationIssue::error(
                IssueCode::InvalidStopField,
                format!("stop {index} has a non-string stopId"),
            )
            .at(format!("{path}.stopId")),
        );
    }

    if stop.get("visible").is_some_and(|v| !v.is_boolean()) {
        issues.push(
            ValidationIssue::error(
                IssueCode::InvalidStopField,
                format!("stop {index} has a non-boolean visible flag"),
            )
            .at(format!("{path}.visible")),
        );
    }

    if let Some(id) = stop.get("id").and_then(Value::as_str) {
        if !seen_ids.insert(id.to_string()) {
            issues.push(
                ValidationIssue::warning(
                    IssueCode::DuplicateStopId,
                    format!("stop id {id:?} appears more than once; the last occurrence wins"),
                )
                .at(format!("{path}.id")),
            );
        }
    }
}
