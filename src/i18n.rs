//! User-facing messages in the dashboard's supported languages.
//!
//! Only the texts the import/export engine itself produces live here. The
//! locale is picked from the `language` setting of the current configuration;
//! anything that is not German falls back to English.

use crate::models::IssueCode;
use crate::state::ImportCheckpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Locale {
    #[default]
    En,
    De,
}

impl Locale {
    /// Resolve a language tag such as `de`, `de-DE` or `en_US`.
    pub fn from_language(language: &str) -> Self {
        let primary = language
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match primary.as_str() {
            "de" => Self::De,
            _ => Self::En,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::De => "de",
        }
    }
}

/// Messages placed into `ImportResult::messages` and worker error replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ImportCommitted { stops: usize },
    ImportWarnings { count: usize },
    ValidationFailed { errors: usize },
    BackupAvailable,
    BackupRestored,
    ImportInProgress,
    Cancelled,
    MemoryExhausted,
    SecurityRejected { reason: String },
    DocumentUnreadable { reason: String },
    RepositoryFailure { reason: String },
    MergeFailure { reason: String },
    NoConflicts,
    Conflicts { count: usize },
    WorkerBusy,
    WorkerStopped,
}

impl Message {
    pub fn render(&self, locale: Locale) -> String {
        match locale {
            Locale::En => self.render_en(),
            Locale::De => self.render_de(),
        }
    }

    fn render_en(&self) -> String {
        match self {
            Self::ImportCommitted { stops } => {
                format!("Import completed: {stops} stop(s) imported.")
            }
            Self::ImportWarnings { count } => {
                format!("{count} warning(s) were found; please review the imported stops.")
            }
            Self::ValidationFailed { errors } => {
                format!("The file failed validation with {errors} error(s). Nothing was changed.")
            }
            Self::BackupAvailable => {
                "A backup of your previous configuration is available for manual restore."
                    .to_string()
            }
            Self::BackupRestored => "The backup was restored.".to_string(),
            Self::ImportInProgress => {
                "Another import is already running. Please wait for it to finish.".to_string()
            }
            Self::Cancelled => "The import was cancelled. Nothing was changed.".to_string(),
            Self::MemoryExhausted => {
                "Not enough memory to process this file. Nothing was changed.".to_string()
            }
            Self::SecurityRejected { reason } => format!("The file was rejected: {reason}"),
            Self::DocumentUnreadable { reason } => {
                format!("The file could not be read: {reason}")
            }
            Self::RepositoryFailure { reason } => {
                format!("The configuration could not be saved: {reason}")
            }
            Self::MergeFailure { reason } => format!("The import could not be applied: {reason}"),
            Self::NoConflicts => "No conflicts found.".to_string(),
            Self::Conflicts { count } => format!("{count} conflict(s) need your attention."),
            Self::WorkerBusy => "Too many requests are queued. Please try again shortly.".to_string(),
            Self::WorkerStopped => "The background worker is not running.".to_string(),
        }
    }

    fn render_de(&self) -> String {
        match self {
            Self::ImportCommitted { stops } => {
                format!("Import abgeschlossen: {stops} Haltestelle(n) importiert.")
            }
            Self::ImportWarnings { count } => {
                format!("{count} Warnung(en) gefunden; bitte prüfe die importierten Haltestellen.")
            }
            Self::ValidationFailed { errors } => format!(
                "Die Datei ist bei der Prüfung mit {errors} Fehler(n) durchgefallen. Es wurde nichts geändert."
            ),
            Self::BackupAvailable => {
                "Eine Sicherung deiner bisherigen Konfiguration steht zur manuellen Wiederherstellung bereit."
                    .to_string()
            }
            Self::BackupRestored => "Die Sicherung wurde wiederhergestellt.".to_string(),
            Self::ImportInProgress => {
                "Es läuft bereits ein Import. Bitte warte, bis er abgeschlossen ist.".to_string()
            }
            Self::Cancelled => "Der Import wurde abgebrochen. Es wurde nichts geändert.".to_string(),
            Self::MemoryExhausted => {
                "Nicht genügend Speicher, um diese Datei zu verarbeiten. Es wurde nichts geändert."
                    .to_string()
            }
            Self::SecurityRejected { reason } => format!("Die Datei wurde abgelehnt: {reason}"),
            Self::DocumentUnreadable { reason } => {
                format!("Die Datei konnte nicht gelesen werden: {reason}")
            }
            Self::RepositoryFailure { reason } => {
                format!("Die Konfiguration konnte nicht gespeichert werden: {reason}")
            }
            Self::MergeFailure { reason } => {
                format!("Der Import konnte nicht angewendet werden: {reason}")
            }
            Self::NoConflicts => "Keine Konflikte gefunden.".to_string(),
            Self::Conflicts { count } => format!("{count} Konflikt(e) erfordern deine Aufmerksamkeit."),
            Self::WorkerBusy => {
                "Zu viele Anfragen in der Warteschlange. Bitte versuche es gleich noch einmal."
                    .to_string()
            }
            Self::WorkerStopped => "Der Hintergrundprozess läuft nicht.".to_string(),
        }
    }

    /// Generic message for a blocking issue code.
    pub fn for_issue(code: IssueCode, detail: &str) -> Self {
        match code {
            IssueCode::ImportInProgress => Self::ImportInProgress,
            IssueCode::Cancelled => Self::Cancelled,
            IssueCode::MemoryExhausted => Self::MemoryExhausted,
            IssueCode::SecurityRejected | IssueCode::DepthExceeded => Self::SecurityRejected {
                reason: detail.to_string(),
            },
            IssueCode::RepositoryFailure => Self::RepositoryFailure {
                reason: detail.to_string(),
            },
            IssueCode::MergeFailure => Self::MergeFailure {
                reason: detail.to_string(),
            },
            _ => Self::DocumentUnreadable {
                reason: detail.to_string(),
            },
        }
    }
}

/// Label shown next to the progress bar for a checkpoint.
pub fn checkpoint_label(checkpoint: ImportCheckpoint, locale: Locale) -> &'static str {
    match (checkpoint, locale) {
        (ImportCheckpoint::Validation, Locale::En) => "Validating file",
        (ImportCheckpoint::Backup, Locale::En) => "Creating backup",
        (ImportCheckpoint::Merge, Locale::En) => "Importing stops",
        (ImportCheckpoint::Finalize, Locale::En) => "Finalizing",
        (ImportCheckpoint::Validation, Locale::De) => "Datei wird geprüft",
        (ImportCheckpoint::Backup, Locale::De) => "Sicherung wird erstellt",
        (ImportCheckpoint::Merge, Locale::De) => "Haltestellen werden importiert",
        (ImportCheckpoint::Finalize, Locale::De) => "Abschluss",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locale_from_language_tags() {
        assert_eq!(Locale::from_language("de"), Locale::De);
        assert_eq!(Locale::from_language("de-DE"), Locale::De);
        assert_eq!(Locale::from_language("DE_at"), Locale::De);
        assert_eq!(Locale::from_language("en"), Locale::En);
        assert_eq!(Locale::from_language("fr"), Locale::En);
        assert_eq!(Locale::from_language(""), Locale::En);
    }

    #[test]
    fn test_every_message_renders_non_empty() {
        let messages = [
            Message::ImportCommitted { stops: 3 },
            Message::ImportWarnings { count: 1 },
            Message::ValidationFailed { errors: 2 },
            Message::BackupAvailable,
            Message::BackupRestored,
            Message::ImportInProgress,
            Message::Cancelled,
            Message::MemoryExhausted,
            Message::SecurityRejected {
                reason: "x".into(),
            },
            Message::DocumentUnreadable {
                reason: "x".into(),
            },
            Message::RepositoryFailure {
                reason: "x".into(),
            },
            Message::MergeFailure {
                reason: "x".into(),
            },
            Message::NoConflicts,
            Message::Conflicts { count: 4 },
            Message::WorkerBusy,
            Message::WorkerStopped,
        ];
        for message in &messages {
            for locale in [Locale::En, Locale::De] {
                assert!(!message.render(locale).is_empty(), "{message:?} in {locale:?}");
            }
        }
    }

    #[test]
    fn test_german_differs_from_english() {
        let message = Message::ImportCommitted { stops: 2 };
        assert_ne!(message.render(Locale::En), message.render(Locale::De));
        assert!(message.render(Locale::De).contains("Haltestelle"));
    }

    #[test]
    fn test_issue_codes_map_to_messages() {
        assert_eq!(
            Message::for_issue(IssueCode::Cancelled, ""),
            Message::Cancelled
        );
        assert_eq!(
            Message::for_issue(IssueCode::DepthExceeded, "too deep"),
            Message::SecurityRejected {
                reason: "too deep".into()
            }
        );
    }

    #[test]
    fn test_checkpoint_labels() {
        assert_eq!(
            checkpoint_label(ImportCheckpoint::Backup, Locale::En),
            "Creating backup"
        );
        assert_eq!(
            checkpoint_label(ImportCheckpoint::Finalize, Locale::De),
            "Abschluss"
        );
    }
}
