//! Request/response protocol between callers and the background worker.
//!
//! Every request gets a [`RequestId`] that is echoed on its response and on
//! any progress updates it produces.

use camino::Utf8PathBuf;
use std::fmt;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::governor::GovernorError;
use crate::config::RepositoryError;
use crate::i18n::{Locale, Message};
use crate::models::{
    ConfigExport, ExportSettings, ImportOptions, ImportPreview, ImportResult, ValidationResult,
};
use crate::services::CancelHandle;
use crate::state::ImportEvent;

/// Correlation id of one worker request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work for the background worker.
///
/// `caller` is the rate-limit key of whoever sent the request. Text
/// requests without one are not rate limited; file imports fall back to the
/// file name.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRequest {
    ExportConfig {
        exported_by: String,
        settings: ExportSettings,
    },
    ValidateConfig {
        text: String,
        caller: Option<String>,
    },
    PreviewImport {
        text: String,
        options: ImportOptions,
        caller: Option<String>,
    },
    ImportConfig {
        text: String,
        options: ImportOptions,
        caller: Option<String>,
    },
    /// Sandbox file checks, read, then the same pipeline as `ImportConfig`.
    ImportFile {
        path: Utf8PathBuf,
        options: ImportOptions,
        caller: Option<String>,
    },
}

impl WorkerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExportConfig { .. } => "export",
            Self::ValidateConfig { .. } => "validate",
            Self::PreviewImport { .. } => "preview",
            Self::ImportConfig { .. } => "import",
            Self::ImportFile { .. } => "import_file",
        }
    }

    /// Requests that may write the repository; the worker runs these one at a time.
    pub fn is_import(&self) -> bool {
        matches!(self, Self::ImportConfig { .. } | Self::ImportFile { .. })
    }

    pub fn caller(&self) -> Option<&str> {
        match self {
            Self::ExportConfig { .. } => None,
            Self::ValidateConfig { caller, .. }
            | Self::PreviewImport { caller, .. }
            | Self::ImportConfig { caller, .. }
            | Self::ImportFile { caller, .. } => caller.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    Exported(Box<ConfigExport>),
    Validated(ValidationResult),
    /// The preview, or the validation result that prevented it.
    Previewed(Result<ImportPreview, ValidationResult>),
    Imported(Box<ImportResult>),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker mailbox is full ({capacity} requests queued)")]
    Backpressure { capacity: usize },

    #[error("worker has shut down")]
    Closed,

    #[error("request was cancelled before it started")]
    Cancelled,

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Memory(#[from] GovernorError),

    #[error("worker task failed: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Localized text for showing this error to the user.
    pub fn user_message(&self, locale: Locale) -> String {
        let message = match self {
            Self::Backpressure { .. } => Message::WorkerBusy,
            Self::Closed | Self::Internal(_) => Message::WorkerStopped,
            Self::Cancelled => Message::Cancelled,
            Self::Repository(err) => Message::RepositoryFailure {
                reason: err.to_string(),
            },
            Self::Memory(_) => Message::MemoryExhausted,
        };
        message.render(locale)
    }
}

#[derive(Debug)]
pub struct WorkerResponse {
    pub id: RequestId,
    pub outcome: Result<WorkerReply, WorkerError>,
}

/// Progress of an import request, correlated by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub id: RequestId,
    pub event: ImportEvent,
}

/// Handle to a submitted request.
#[derive(Debug)]
pub struct PendingReply {
    pub(crate) id: RequestId,
    pub(crate) rx: oneshot::Receiver<WorkerResponse>,
    pub(crate) cancel: CancelHandle,
}

impl PendingReply {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Ask the worker to stop this request at its next chunk boundary.
    pub fn cancel(&self) {
        tracing::info!("Cancellation requested for {}", self.id);
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the worker's response.
    pub async fn wait(self) -> Result<WorkerReply, WorkerError> {
        match self.rx.await {
            Ok(response) => {
                debug_assert_eq!(response.id, self.id);
                response.outcome
            }
            Err(_) => Err(WorkerError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.as_uuid().to_string());
    }

    #[test]
    fn test_request_kinds() {
        let import = WorkerRequest::ImportConfig {
            text: String::new(),
            options: ImportOptions::default(),
            caller: Some("settings-panel".to_string()),
        };
        assert_eq!(import.kind(), "import");
        assert!(import.is_import());
        assert_eq!(import.caller(), Some("settings-panel"));

        let validate = WorkerRequest::ValidateConfig {
            text: String::new(),
            caller: None,
        };
        assert!(!validate.is_import());
        assert_eq!(validate.caller(), None);
    }

    #[test]
    fn test_worker_errors_have_localized_messages() {
        let busy = WorkerError::Backpressure { capacity: 1000 };
        assert_eq!(
            busy.user_message(Locale::En),
            Message::WorkerBusy.render(Locale::En)
        );
        assert_ne!(busy.user_message(Locale::De), busy.user_message(Locale::En));
        assert!(busy.to_string().contains("1000"));
    }
}
