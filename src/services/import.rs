//! Transactional import: validate, back up, merge, commit or roll back.
//!
//! The repository is written at most once per attempt, in `Finalizing`.
//! Every failure before that point leaves it untouched and still produces a
//! structured [`ImportResult`] with localized messages.

use serde_json::Value;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Instant;
use tokio::sync::watch;

use super::{ChunkGate, Interrupted, MergeEngine, SchemaValidator, Ungated, create_export};
use crate::config::{ConfigRepository, RepositoryError};
use crate::i18n::{Locale, Message};
use crate::metrics::Metrics;
use crate::models::{
    AppConfig, Backup, ConfigExport, ExportSettings, ImportOptions, ImportPreview, ImportResult,
    IssueCode, ValidationIssue, ValidationResult,
};
use crate::state::{ImportCheckpoint, ImportPhase, ImportStateManager};

/// Requests cancellation of the operation holding the paired [`CancelSignal`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace works with no receivers left
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Cooperative cancellation flag checked between chunks.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested.
    ///
    /// Never resolves if the handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl ChunkGate for CancelSignal {
    fn chunk_size(&self) -> usize {
        usize::MAX
    }

    fn checkpoint(&self, _processed: usize) -> Result<(), Interrupted> {
        if self.is_cancelled() {
            Err(Interrupted::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Create a connected cancel handle and signal.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// Why an attempt ended in `RolledBack`.
struct Abort {
    issue: ValidationIssue,
    message: Message,
}

impl Abort {
    fn new(code: IssueCode, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            message: Message::for_issue(code, &detail),
            issue: ValidationIssue::critical(code, detail),
        }
    }

    fn interrupted(interrupted: Interrupted) -> Self {
        Self::new(interrupted.issue_code(), interrupted.to_string())
    }
}

/// Drives one import at a time against a [`ConfigRepository`].
///
/// Also serves the read-only operations the UI layer needs (export,
/// validation, preview) so they share the same repository and validator.
pub struct ImportOrchestrator {
    repository: Arc<dyn ConfigRepository>,
    validator: SchemaValidator,
    state: ImportStateManager,
    metrics: Arc<Metrics>,
    in_flight: Mutex<()>,
}

impl ImportOrchestrator {
    pub fn new(repository: Arc<dyn ConfigRepository>, validator: SchemaValidator) -> Self {
        Self::with_parts(
            repository,
            validator,
            ImportStateManager::new(),
            Arc::new(Metrics::new()),
        )
    }

    pub fn with_parts(
        repository: Arc<dyn ConfigRepository>,
        validator: SchemaValidator,
        state: ImportStateManager,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            repository,
            validator,
            state,
            metrics,
            in_flight: Mutex::new(()),
        }
    }

    pub fn state(&self) -> &ImportStateManager {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn validator(&self) -> &SchemaValidator {
        &self.validator
    }

    /// Locale of the current configuration, English when unreadable.
    pub fn locale(&self) -> Locale {
        self.repository
            .get()
            .map(|config| Locale::from_language(&config.language))
            .unwrap_or_default()
    }

    pub fn export_config(
        &self,
        exported_by: &str,
        settings: ExportSettings,
    ) -> Result<ConfigExport, RepositoryError> {
        let current = self.repository.get()?;
        self.metrics.record_export();
        Ok(create_export(&current, exported_by, settings))
    }

    pub fn validate_config(&self, doc: &Value) -> ValidationResult {
        self.metrics.record_validation();
        self.validator.validate(doc)
    }

    /// Preview `doc` against the current configuration.
    ///
    /// Returns the validation result instead when the document is not valid
    /// or cannot be read.
    pub fn preview_import(
        &self,
        doc: &Value,
        options: &ImportOptions,
    ) -> Result<ImportPreview, ValidationResult> {
        self.metrics.record_preview();
        let validation = self.validator.validate(doc);
        if !validation.is_valid {
            return Err(validation);
        }
        let export = SchemaValidator::decode(doc.clone()).map_err(|issue| {
            ValidationResult::from_issues(vec![issue], validation.schema_version.clone(), false)
        })?;
        let current = self.repository.get().map_err(|err| {
            ValidationResult::critical(
                IssueCode::RepositoryFailure,
                err.to_string(),
                validation.schema_version.clone(),
            )
        })?;
        Ok(super::preview_with_strategy(
            &export,
            &current,
            options.strategy(),
        ))
    }

    pub fn import_config(&self, doc: &Value, options: &ImportOptions) -> ImportResult {
        self.import_config_with(doc, options, &Ungated)
    }

    /// Run one import attempt, yielding to `gate` between heavy steps.
    ///
    /// A second call while one is in flight is rejected with
    /// [`IssueCode::ImportInProgress`] and does not touch the state machine.
    pub fn import_config_with(
        &self,
        doc: &Value,
        options: &ImportOptions,
        gate: &dyn ChunkGate,
    ) -> ImportResult {
        let _guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                tracing::warn!("Import rejected: another import is in flight");
                self.metrics.record_import_in_flight();
                return self.reject(IssueCode::ImportInProgress, "another import is in flight");
            }
        };

        let started = Instant::now();
        let locale = self.locale();
        self.state.begin();
        tracing::info!(
            "Import started (strategy={:?}, validate={}, backup={})",
            options.strategy(),
            options.validate_before_import,
            options.create_backup
        );

        // Validating
        let validation = if options.validate_before_import {
            match self.validator.validate_with(doc, gate) {
                Ok(result) => result,
                Err(interrupted) => {
                    return self.roll_back(
                        locale,
                        ValidationResult::skipped(schema_version_of(doc)),
                        None,
                        Abort::interrupted(interrupted),
                    );
                }
            }
        } else {
            ValidationResult::skipped(schema_version_of(doc))
        };

        if !validation.is_valid {
            tracing::warn!(
                "Import rejected by validation: {} blocking issue(s)",
                validation.errors.len()
            );
            let message = Message::ValidationFailed {
                errors: validation.errors.len(),
            };
            return self.finish_rolled_back(locale, validation, None, vec![message]);
        }
        self.state.reach(ImportCheckpoint::Validation);

        match self.run_transaction(doc, options, gate, validation.clone()) {
            Ok(result) => {
                self.state.finish(true);
                self.metrics.record_import_committed(started.elapsed());
                let mut messages = vec![Message::ImportCommitted {
                    stops: result.imported_stops_count,
                }];
                if !result.validation.warnings.is_empty() {
                    messages.push(Message::ImportWarnings {
                        count: result.validation.warnings.len(),
                    });
                }
                tracing::info!(
                    "Import committed: {} stop(s) in {:?}",
                    result.imported_stops_count,
                    started.elapsed()
                );
                ImportResult {
                    messages: messages.iter().map(|m| m.render(locale)).collect(),
                    ..result
                }
            }
            Err((abort, backup)) => self.roll_back(locale, validation, backup, abort),
        }
    }

    /// Back up, merge and commit. Runs after validation passed or was skipped.
    fn run_transaction(
        &self,
        doc: &Value,
        options: &ImportOptions,
        gate: &dyn ChunkGate,
        validation: ValidationResult,
    ) -> Result<ImportResult, (Abort, Option<Backup>)> {
        let export = SchemaValidator::decode(doc.clone()).map_err(|issue| {
            let message = Message::DocumentUnreadable {
                reason: issue.message.clone(),
            };
            (Abort { issue, message }, None)
        })?;

        let current = self
            .repository
            .get()
            .map_err(|err| (Abort::new(IssueCode::RepositoryFailure, err.to_string()), None))?;

        // BackingUp
        let backup = if options.create_backup {
            self.state.enter(ImportPhase::BackingUp);
            let backup = Backup::capture(&current);
            tracing::debug!("Backup captured with {} stops", backup.config().stops.len());
            Some(backup)
        } else {
            None
        };
        self.state.reach(ImportCheckpoint::Backup);

        // Merging
        self.state.enter(ImportPhase::Merging);
        let merged = MergeEngine::apply(&current, &export.config, options).map_err(|err| {
            (
                Abort::new(IssueCode::MergeFailure, err.to_string()),
                backup.clone(),
            )
        })?;
        gate.checkpoint(merged.stops.len())
            .map_err(|interrupted| (Abort::interrupted(interrupted), backup.clone()))?;
        self.state.reach(ImportCheckpoint::Merge);

        // Finalizing
        self.state.enter(ImportPhase::Finalizing);
        self.repository.set(merged.clone()).map_err(|err| {
            (
                Abort::new(IssueCode::RepositoryFailure, err.to_string()),
                backup.clone(),
            )
        })?;
        self.state.reach(ImportCheckpoint::Finalize);

        Ok(ImportResult {
            success: true,
            imported_config: Some(merged),
            imported_stops_count: export.config.stops.len(),
            validation,
            backup,
            messages: Vec::new(),
        })
    }

    fn roll_back(
        &self,
        locale: Locale,
        mut validation: ValidationResult,
        backup: Option<Backup>,
        abort: Abort,
    ) -> ImportResult {
        tracing::error!("Import rolled back: {}", abort.issue.message);
        if abort.issue.code == IssueCode::Cancelled {
            self.metrics.record_cancellation();
        }
        validation.push(abort.issue);
        self.finish_rolled_back(locale, validation, backup, vec![abort.message])
    }

    fn finish_rolled_back(
        &self,
        locale: Locale,
        validation: ValidationResult,
        backup: Option<Backup>,
        mut messages: Vec<Message>,
    ) -> ImportResult {
        if backup.is_some() {
            messages.push(Message::BackupAvailable);
        }
        self.state.finish(false);
        self.metrics.record_import_rolled_back();

        ImportResult {
            success: false,
            imported_config: None,
            imported_stops_count: 0,
            validation,
            backup,
            messages: messages.iter().map(|m| m.render(locale)).collect(),
        }
    }

    /// Failed result for an attempt refused before the state machine started,
    /// e.g. by the sandbox or the memory governor.
    pub fn reject(&self, code: IssueCode, detail: impl Into<String>) -> ImportResult {
        let abort = Abort::new(code, detail);
        ImportResult {
            success: false,
            imported_config: None,
            imported_stops_count: 0,
            validation: ValidationResult::from_issues(vec![abort.issue], "", false),
            backup: None,
            messages: vec![abort.message.render(self.locale())],
        }
    }

    /// Write `backup` back to the repository in a single `set()`.
    ///
    /// Returns the confirmation to show, in the restored configuration's language.
    pub fn restore_backup(&self, backup: &Backup) -> Result<String, RepositoryError> {
        tracing::info!(
            "Restoring backup from {} ({} stops)",
            backup.timestamp(),
            backup.config().stops.len()
        );
        self.repository.set(backup.config().clone())?;
        Ok(Message::BackupRestored.render(Locale::from_language(&backup.config().language)))
    }

    /// Current configuration, for callers that render it after an import.
    pub fn current_config(&self) -> Result<AppConfig, RepositoryError> {
        self.repository.get()
    }
}

fn schema_version_of(doc: &Value) -> String {
    doc.get("schemaVersion")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryConfigRepository;
    use crate::models::{City, Severity, StopConfig};
    use serde_json::json;

    fn stop(id: &str, name: &str, position: usize) -> StopConfig {
        StopConfig {
            id: id.to_string(),
            name: name.to_string(),
            city: City::A,
            stop_id: format!("p-{id}"),
            walking_time_minutes: 1,
            visible: true,
            position,
        }
    }

    fn create_test_orchestrator(config: AppConfig) -> (ImportOrchestrator, Arc<InMemoryConfigRepository>) {
        let repository = Arc::new(InMemoryConfigRepository::new(config));
        let orchestrator = ImportOrchestrator::new(repository.clone(), SchemaValidator::default());
        (orchestrator, repository)
    }

    fn doc_with_stops(stops: Value, count: usize) -> Value {
        json!({
            "schemaVersion": "1.0.0",
            "exportTimestamp": "2024-03-01T12:00:00Z",
            "exportedBy": "tests",
            "metadata": { "stopCount": count, "language": "en" },
            "config": {
                "stops": stops,
                "darkMode": true,
                "refreshIntervalSeconds": 90,
                "maxDeparturesShown": 6,
                "language": "en"
            }
        })
    }

    fn current() -> AppConfig {
        AppConfig {
            stops: vec![stop("s1", "One", 0), stop("s2", "Two", 1)],
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_successful_import_commits_and_backs_up() {
        let (orchestrator, repository) = create_test_orchestrator(current());
        let doc = doc_with_stops(
            json!([
                { "id": "s1", "name": "One renamed", "city": "A", "stopId": "p-s1", "position": 5 },
                { "id": "s3", "name": "Three", "city": "B", "stopId": "b-3", "position": 0 }
            ]),
            2,
        );

        let result = orchestrator.import_config(&doc, &ImportOptions::default());

        assert!(result.success, "{:?}", result.messages);
        assert_eq!(result.imported_stops_count, 2);
        assert_eq!(result.backup.as_ref().unwrap().config(), &current());
        assert!(!result.messages.is_empty());

        let stored = repository.get().unwrap();
        assert_eq!(stored, result.imported_config.unwrap());
        let layout: Vec<_> = stored
            .stops
            .iter()
            .map(|s| (s.id.as_str(), s.position))
            .collect();
        assert_eq!(layout, vec![("s1", 0), ("s2", 1), ("s3", 2)]);
        assert!(stored.dark_mode);

        let state = orchestrator.state().snapshot();
        assert_eq!(state.phase, ImportPhase::Committed);
        assert_eq!(state.progress, 100);
    }

    #[test]
    fn test_invalid_document_leaves_repository_untouched() {
        let (orchestrator, repository) = create_test_orchestrator(current());
        let mut doc = doc_with_stops(json!([]), 0);
        doc["schemaVersion"] = json!("9.9.9");

        let result = orchestrator.import_config(&doc, &ImportOptions::default());

        assert!(!result.success);
        assert!(result.imported_config.is_none());
        assert!(!result.validation.is_valid);
        assert_eq!(result.validation.count(Severity::Critical), 1);
        assert!(result.validation.has_code(IssueCode::SchemaIncompatible));
        assert!(result.backup.is_none());
        assert!(!result.messages.is_empty());
        assert_eq!(repository.get().unwrap(), current());
        assert_eq!(orchestrator.state().snapshot().phase, ImportPhase::RolledBack);
    }

    #[test]
    fn test_skipped_validation_still_requires_readable_document() {
        let (orchestrator, repository) = create_test_orchestrator(current());
        let doc = json!({ "schemaVersion": "1.0.0" });
        let options = ImportOptions {
            validate_before_import: false,
            ..ImportOptions::default()
        };

        let result = orchestrator.import_config(&doc, &options);

        assert!(!result.success);
        assert!(result.validation.has_code(IssueCode::DocumentUnreadable));
        assert_eq!(repository.get().unwrap(), current());
    }

    #[test]
    fn test_merge_failure_rolls_back_with_backup_message() {
        let (orchestrator, repository) = create_test_orchestrator(current());
        let mut doc = doc_with_stops(json!([]), 0);
        doc["config"]["refreshIntervalSeconds"] = json!(5);
        let options = ImportOptions {
            validate_before_import: false,
            ..ImportOptions::default()
        };

        let result = orchestrator.import_config(&doc, &options);

        assert!(!result.success);
        assert!(result.validation.has_code(IssueCode::MergeFailure));
        assert!(result.backup.is_some());
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages[1], Message::BackupAvailable.render(Locale::En));
        assert_eq!(repository.get().unwrap(), current());
    }

    #[test]
    fn test_cancelled_before_finalizing_commits_nothing() {
        let (orchestrator, repository) = create_test_orchestrator(current());
        let doc = doc_with_stops(
            json!([{ "id": "s9", "name": "Nine", "city": "A", "stopId": "x" }]),
            1,
        );
        let (handle, signal) = cancellation();
        handle.cancel();

        let result = orchestrator.import_config_with(&doc, &ImportOptions::default(), &signal);

        assert!(!result.success);
        assert!(result.validation.has_code(IssueCode::Cancelled));
        assert_eq!(repository.get().unwrap(), current());
        assert_eq!(
            orchestrator
                .metrics()
                .cancellations
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_cancelled_future_resolves_after_cancel() {
        let (handle, mut signal) = cancellation();
        let mut waiting = tokio_test::task::spawn(async move { signal.cancelled().await });

        tokio_test::assert_pending!(waiting.poll());
        handle.cancel();
        assert!(waiting.is_woken());
        tokio_test::assert_ready!(waiting.poll());
    }

    #[test]
    fn test_messages_follow_configured_language() {
        let (orchestrator, _) = create_test_orchestrator(AppConfig {
            language: "de".to_string(),
            ..current()
        });
        let doc = doc_with_stops(json!([]), 3);

        let result = orchestrator.import_config(&doc, &ImportOptions::default());

        assert!(!result.success);
        assert_eq!(
            result.messages[0],
            Message::ValidationFailed { errors: 1 }.render(Locale::De)
        );
    }

    #[test]
    fn test_restore_backup_writes_snapshot() {
        let (orchestrator, repository) = create_test_orchestrator(current());
        let backup = Backup::capture(&current());
        repository.set(AppConfig::default()).unwrap();

        let message = orchestrator.restore_backup(&backup).unwrap();

        assert_eq!(repository.get().unwrap(), current());
        assert_eq!(message, Message::BackupRestored.render(Locale::En));
    }

    #[test]
    fn test_preview_import_reports_changes() {
        let (orchestrator, _) = create_test_orchestrator(current());
        let doc = doc_with_stops(
            json!([{ "id": "s3", "name": "Three", "city": "A", "stopId": "x" }]),
            1,
        );

        let preview = orchestrator
            .preview_import(&doc, &ImportOptions::default())
            .unwrap();
        assert_eq!(preview.estimated_changes.stops_added, 1);
        assert_eq!(preview.estimated_changes.stops_removed, 0);

        let replace = ImportOptions {
            overwrite_existing: true,
            ..ImportOptions::default()
        };
        let preview = orchestrator.preview_import(&doc, &replace).unwrap();
        assert_eq!(preview.estimated_changes.stops_removed, 2);
    }

    #[test]
    fn test_preview_of_invalid_document_returns_validation() {
        let (orchestrator, _) = create_test_orchestrator(current());
        let rejected = orchestrator
            .preview_import(&json!({}), &ImportOptions::default())
            .unwrap_err();
        assert!(!rejected.is_valid);
        assert_eq!(rejected.count(Severity::Critical), 3);
    }

    #[test]
    fn test_export_config_reads_repository() {
        let (orchestrator, _) = create_test_orchestrator(current());
        let export = orchestrator
            .export_config("tests", ExportSettings::default())
            .unwrap();
        assert_eq!(export.metadata.stop_count, 2);
        assert_eq!(export.config, current());
    }

    #[test]
    fn test_concurrent_import_is_rejected() {
        let (orchestrator, _) = create_test_orchestrator(current());
        let _held = orchestrator.in_flight.lock().unwrap();

        let result = orchestrator.import_config(&doc_with_stops(json!([]), 0), &ImportOptions::default());

        assert!(!result.success);
        assert!(result.validation.has_code(IssueCode::ImportInProgress));
        assert_eq!(orchestrator.state().snapshot().phase, ImportPhase::Idle);
    }
}
