//! Background worker that runs every heavy step off the caller's thread.
//!
//! Callers talk to the worker only through messages: a [`WorkerHandle`]
//! puts requests into a bounded mailbox and gets a [`PendingReply`] back.
//! The dispatcher holds one semaphore permit per running operation, so at
//! most `max_concurrent_operations` run at once while the rest wait in the
//! mailbox. A full mailbox rejects new requests with
//! [`WorkerError::Backpressure`].
//!
//! Parsing, validation and merging run on blocking threads under the
//! [`MemoryGovernor`]. Imports go through a separate lane that runs them one
//! at a time, so two of them never read or commit the same configuration
//! concurrently. A queued import holds no permit until its turn comes, which
//! keeps validation and previews moving behind a long import.

pub mod governor;
pub mod protocol;

use camino::Utf8Path;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, mpsc, oneshot, watch};

pub use governor::{
    GovernedRun, GovernorError, MemoryGovernor, MemoryProbe, MemorySnapshot, PressureTier,
    ProcessMemoryProbe, StaticMemoryProbe,
};
pub use protocol::{
    PendingReply, ProgressUpdate, RequestId, WorkerError, WorkerReply, WorkerRequest,
    WorkerResponse,
};

use crate::config::EngineSettings;
use crate::metrics::Metrics;
use crate::models::{
    ConfigExport, ExportSettings, ImportOptions, ImportPreview, ImportResult, IssueCode,
    ValidationResult,
};
use crate::services::{
    CancelSignal, FileDescriptor, FileSandbox, ImportOrchestrator, SecurityRejection,
    cancellation,
};
use crate::state::ImportEvent;

/// Parsed JSON takes several times the space of its text.
const PARSE_EXPANSION_FACTOR: u64 = 4;

/// Rough in-memory size of one exported stop.
const EXPORT_BYTES_PER_STOP: u64 = 512;

const PROGRESS_CHANNEL_CAPACITY: usize = 100;

struct Envelope {
    id: RequestId,
    request: WorkerRequest,
    cancel: CancelSignal,
    reply: oneshot::Sender<WorkerResponse>,
}

/// Shared state of a running worker.
pub struct ConfigWorker {
    orchestrator: Arc<ImportOrchestrator>,
    sandbox: FileSandbox,
    governor: Arc<MemoryGovernor>,
    metrics: Arc<Metrics>,
    progress_tx: broadcast::Sender<ProgressUpdate>,
}

/// Cloneable sender side of the worker mailbox.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Envelope>,
    progress_tx: broadcast::Sender<ProgressUpdate>,
    metrics: Arc<Metrics>,
    capacity: usize,
    caller: Option<String>,
}

impl ConfigWorker {
    /// Start the dispatcher and memory sampler on the current tokio runtime.
    ///
    /// The worker stops once every [`WorkerHandle`] has been dropped and the
    /// mailbox is drained. Install a release hint on `governor` with
    /// [`MemoryGovernor::with_release_hint`] before handing it over; the
    /// worker runs it after guarded work, on refusals and whenever the
    /// sampler sees emergency pressure.
    pub fn spawn(
        settings: &EngineSettings,
        orchestrator: Arc<ImportOrchestrator>,
        governor: Arc<MemoryGovernor>,
    ) -> WorkerHandle {
        let capacity = settings.governor.queue_capacity.max(1);
        let max_concurrent = settings.governor.max_concurrent_operations.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        let metrics = Arc::clone(orchestrator.metrics());

        let worker = Arc::new(Self {
            orchestrator,
            sandbox: FileSandbox::new(settings.sandbox.clone()),
            governor,
            metrics: Arc::clone(&metrics),
            progress_tx: progress_tx.clone(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        tokio::spawn(Self::run_sampler(Arc::clone(&worker.governor), shutdown_rx));
        tokio::spawn(Self::run_dispatcher(
            worker,
            rx,
            max_concurrent,
            capacity,
            shutdown_tx,
        ));

        tracing::info!(
            "Config worker started (max concurrent: {}, mailbox: {})",
            max_concurrent,
            capacity
        );

        WorkerHandle {
            tx,
            progress_tx,
            metrics,
            capacity,
            caller: None,
        }
    }

    async fn run_dispatcher(
        worker: Arc<Self>,
        mut rx: mpsc::Receiver<Envelope>,
        max_concurrent: usize,
        capacity: usize,
        _shutdown_tx: watch::Sender<()>,
    ) {
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let (import_tx, import_rx) = mpsc::channel(capacity);
        let import_lane = tokio::spawn(Self::run_import_lane(
            Arc::clone(&worker),
            import_rx,
            Arc::clone(&semaphore),
        ));

        loop {
            // Take a permit before pulling, so excess requests stay in the mailbox.
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let Some(envelope) = rx.recv().await else {
                break;
            };

            if envelope.request.is_import() {
                drop(permit);
                if import_tx.send(envelope).await.is_err() {
                    tracing::error!("Import lane stopped unexpectedly");
                    break;
                }
                continue;
            }

            tokio::spawn(Self::run_envelope(Arc::clone(&worker), envelope, permit));
        }

        drop(import_tx);
        if let Err(err) = import_lane.await {
            tracing::error!("Import lane failed: {}", err);
        }
        tracing::info!("Config worker dispatcher stopped");
    }

    /// Run imports one after another, each under its own permit.
    async fn run_import_lane(
        worker: Arc<Self>,
        mut import_rx: mpsc::Receiver<Envelope>,
        semaphore: Arc<Semaphore>,
    ) {
        while let Some(envelope) = import_rx.recv().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            Self::run_envelope(Arc::clone(&worker), envelope, permit).await;
        }
        tracing::debug!("Import lane stopped");
    }

    async fn run_envelope(worker: Arc<Self>, envelope: Envelope, _permit: OwnedSemaphorePermit) {
        let id = envelope.id;
        let kind = envelope.request.kind();
        tracing::debug!("Handling {} request {}", kind, id);

        let outcome = worker.handle(id, envelope.request, envelope.cancel).await;
        if envelope.reply.send(WorkerResponse { id, outcome }).is_err() {
            tracing::debug!("Caller dropped reply for {} request {}", kind, id);
        }
    }

    async fn run_sampler(governor: Arc<MemoryGovernor>, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            let interval = governor.poll_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let snapshot = governor.sample();
                    tracing::trace!(
                        "Memory sample: {} bytes ({})",
                        snapshot.used_bytes,
                        snapshot.tier.as_str()
                    );
                    if snapshot.tier == PressureTier::Emergency {
                        governor.release_memory();
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Memory sampler stopped");
    }

    async fn handle(
        self: &Arc<Self>,
        id: RequestId,
        request: WorkerRequest,
        cancel: CancelSignal,
    ) -> Result<WorkerReply, WorkerError> {
        if cancel.is_cancelled() {
            self.metrics.record_cancellation();
            return Err(WorkerError::Cancelled);
        }

        match request {
            WorkerRequest::ExportConfig {
                exported_by,
                settings,
            } => {
                let worker = Arc::clone(self);
                self.blocking(move || worker.export(&exported_by, settings))
                    .await?
                    .map(|export| WorkerReply::Exported(Box::new(export)))
            }
            WorkerRequest::ValidateConfig { text, caller } => {
                let worker = Arc::clone(self);
                self.blocking(move || match worker.screen_caller(caller.as_deref()) {
                    Ok(()) => worker.validate(&text, cancel),
                    Err(rejected) => rejected,
                })
                .await
                .map(WorkerReply::Validated)
            }
            WorkerRequest::PreviewImport {
                text,
                options,
                caller,
            } => {
                let worker = Arc::clone(self);
                self.blocking(move || {
                    worker.screen_caller(caller.as_deref())?;
                    worker.preview(&text, &options)
                })
                .await
                .map(WorkerReply::Previewed)
            }
            WorkerRequest::ImportConfig {
                text,
                options,
                caller,
            } => {
                let worker = Arc::clone(self);
                self.with_progress(id, move || match worker.screen_caller(caller.as_deref()) {
                    Ok(()) => worker.import_text(&text, &options, cancel),
                    Err(rejected) => worker.reject_import(rejected),
                })
                .await
                .map(|result| WorkerReply::Imported(Box::new(result)))
            }
            WorkerRequest::ImportFile {
                path,
                options,
                caller,
            } => {
                let worker = Arc::clone(self);
                self.with_progress(id, move || {
                    worker.import_file(&path, caller.as_deref(), &options, cancel)
                })
                .await
                .map(|result| WorkerReply::Imported(Box::new(result)))
            }
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, WorkerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(op)
            .await
            .map_err(|err| WorkerError::Internal(err.to_string()))
    }

    /// Run an import and forward its state events tagged with `id`.
    ///
    /// Forwarding stops at `ImportFinished`, or once `op` has returned and the
    /// remaining events are drained. Attempts rejected before the state
    /// machine starts produce no events.
    async fn with_progress<F>(&self, id: RequestId, op: F) -> Result<ImportResult, WorkerError>
    where
        F: FnOnce() -> ImportResult + Send + 'static,
    {
        let mut events = self.orchestrator.state().subscribe();
        let progress_tx = self.progress_tx.clone();
        let (done_tx, mut done_rx) = oneshot::channel::<()>();

        let forwarder = tokio::spawn(async move {
            let forward = |event: ImportEvent| {
                let finished = matches!(event, ImportEvent::ImportFinished { .. });
                // No subscribers is fine
                let _ = progress_tx.send(ProgressUpdate { id, event });
                finished
            };

            loop {
                tokio::select! {
                    biased;
                    received = events.recv() => match received {
                        Ok(event) => {
                            if forward(event) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!("Progress forwarder skipped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = &mut done_rx => {
                        loop {
                            match events.try_recv() {
                                Ok(event) => {
                                    if forward(event) {
                                        break;
                                    }
                                }
                                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                                Err(_) => break,
                            }
                        }
                        break;
                    }
                }
            }
        });

        let result = self.blocking(op).await;

        let _ = done_tx.send(());
        if let Err(err) = forwarder.await {
            tracing::debug!("Progress forwarder for {} failed: {}", id, err);
        }
        result
    }

    fn export(
        &self,
        exported_by: &str,
        settings: ExportSettings,
    ) -> Result<ConfigExport, WorkerError> {
        let stops = self.orchestrator.current_config()?.stops.len() as u64;
        let export = self
            .governor
            .with_memory_guard(stops.saturating_mul(EXPORT_BYTES_PER_STOP), || {
                self.orchestrator.export_config(exported_by, settings)
            })
            .inspect_err(|_| self.metrics.record_memory_refusal())??;
        Ok(export)
    }

    fn validate(&self, text: &str, cancel: CancelSignal) -> ValidationResult {
        self.metrics.record_validation();
        let doc = match self.admit(text) {
            Ok(doc) => doc,
            Err(rejected) => return rejected,
        };
        let gate = self.governor.gate(Some(cancel));
        match self.orchestrator.validator().validate_with(&doc, &gate) {
            Ok(result) => result,
            Err(interrupted) => {
                ValidationResult::critical(interrupted.issue_code(), interrupted.to_string(), "")
            }
        }
    }

    fn preview(
        &self,
        text: &str,
        options: &ImportOptions,
    ) -> Result<ImportPreview, ValidationResult> {
        let doc = self.admit(text)?;
        self.orchestrator.preview_import(&doc, options)
    }

    fn import_text(&self, text: &str, options: &ImportOptions, cancel: CancelSignal) -> ImportResult {
        let doc = match self.admit(text) {
            Ok(doc) => doc,
            Err(rejected) => return self.reject_import(rejected),
        };
        let gate = self.governor.gate(Some(cancel));
        let estimate = (text.len() as u64).saturating_mul(PARSE_EXPANSION_FACTOR);
        match self.governor.with_memory_guard(estimate, || {
            self.orchestrator.import_config_with(&doc, options, &gate)
        }) {
            Ok(result) => result,
            Err(err) => {
                self.metrics.record_memory_refusal();
                self.orchestrator
                    .reject(IssueCode::MemoryExhausted, err.to_string())
            }
        }
    }

    fn import_file(
        &self,
        path: &Utf8Path,
        caller: Option<&str>,
        options: &ImportOptions,
        cancel: CancelSignal,
    ) -> ImportResult {
        let descriptor = match FileDescriptor::from_path(path) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                tracing::warn!("Cannot inspect import file {}: {}", path, err);
                return self
                    .orchestrator
                    .reject(IssueCode::DocumentUnreadable, err.to_string());
            }
        };
        let key = caller.unwrap_or(descriptor.name.as_str());
        if let Err(rejection) = self.sandbox.validate_file_for(key, &descriptor) {
            return self.reject_security(&rejection);
        }

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!("Cannot read import file {}: {}", path, err);
                return self
                    .orchestrator
                    .reject(IssueCode::DocumentUnreadable, err.to_string());
            }
        };
        let text = match self.sandbox.decode_text(bytes) {
            Ok(text) => text,
            Err(rejection) => return self.reject_security(&rejection),
        };
        tracing::info!("Importing {} ({} bytes)", path, text.len());
        self.import_text(&text, options, cancel)
    }

    fn reject_security(&self, rejection: &SecurityRejection) -> ImportResult {
        self.metrics.record_security_rejection();
        self.orchestrator
            .reject(rejection_code(rejection), rejection.to_string())
    }

    /// Rate-limit a keyed text request. Unkeyed requests always pass.
    fn screen_caller(&self, caller: Option<&str>) -> Result<(), ValidationResult> {
        let Some(key) = caller else {
            return Ok(());
        };
        self.sandbox.check_rate(key).map_err(|rejection| {
            self.metrics.record_security_rejection();
            ValidationResult::critical(rejection_code(&rejection), rejection.to_string(), "")
        })
    }

    /// Content screening and governed parse shared by every text request.
    fn admit(&self, text: &str) -> Result<Value, ValidationResult> {
        if let Err(rejection) = self.sandbox.validate_content(text) {
            self.metrics.record_security_rejection();
            return Err(ValidationResult::critical(
                rejection_code(&rejection),
                rejection.to_string(),
                "",
            ));
        }

        let estimate = (text.len() as u64).saturating_mul(PARSE_EXPANSION_FACTOR);
        let parsed = self
            .governor
            .with_memory_guard(estimate, || serde_json::from_str::<Value>(text))
            .map_err(|err| {
                self.metrics.record_memory_refusal();
                ValidationResult::critical(IssueCode::MemoryExhausted, err.to_string(), "")
            })?;

        parsed.map_err(|err| {
            ValidationResult::critical(
                IssueCode::InvalidJson,
                format!("document is not valid JSON: {err}"),
                "",
            )
        })
    }

    fn reject_import(&self, rejected: ValidationResult) -> ImportResult {
        let Some(issue) = rejected.errors.first() else {
            return self
                .orchestrator
                .reject(IssueCode::DocumentUnreadable, "document was rejected");
        };
        self.orchestrator.reject(issue.code, issue.message.clone())
    }
}

fn rejection_code(rejection: &SecurityRejection) -> IssueCode {
    match rejection {
        SecurityRejection::DepthExceeded { .. } => IssueCode::DepthExceeded,
        _ => IssueCode::SecurityRejected,
    }
}

impl WorkerHandle {
    /// Queue `request` without waiting.
    ///
    /// # Errors
    /// [`WorkerError::Backpressure`] when the mailbox is full,
    /// [`WorkerError::Closed`] when the worker has stopped.
    pub fn submit(&self, request: WorkerRequest) -> Result<PendingReply, WorkerError> {
        let id = RequestId::new();
        let (cancel_handle, cancel) = cancellation();
        let (reply, rx) = oneshot::channel();
        let kind = request.kind();

        match self.tx.try_send(Envelope {
            id,
            request,
            cancel,
            reply,
        }) {
            Ok(()) => {
                tracing::debug!("Queued {} request {}", kind, id);
                Ok(PendingReply {
                    id,
                    rx,
                    cancel: cancel_handle,
                })
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Rejected {} request: mailbox full", kind);
                self.metrics.record_backpressure();
                Err(WorkerError::Backpressure {
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WorkerError::Closed),
        }
    }

    /// Queue `request` and wait for its reply.
    pub async fn request(&self, request: WorkerRequest) -> Result<WorkerReply, WorkerError> {
        self.submit(request)?.wait().await
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress_tx.subscribe()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// A handle whose text and file requests are rate limited under `key`.
    pub fn with_caller(&self, key: impl Into<String>) -> Self {
        Self {
            caller: Some(key.into()),
            ..self.clone()
        }
    }

    pub async fn export_config(
        &self,
        exported_by: &str,
        settings: ExportSettings,
    ) -> Result<ConfigExport, WorkerError> {
        match self
            .request(WorkerRequest::ExportConfig {
                exported_by: exported_by.to_string(),
                settings,
            })
            .await?
        {
            WorkerReply::Exported(export) => Ok(*export),
            other => Err(unexpected(other)),
        }
    }

    pub async fn validate_config(&self, text: String) -> Result<ValidationResult, WorkerError> {
        match self
            .request(WorkerRequest::ValidateConfig {
                text,
                caller: self.caller.clone(),
            })
            .await?
        {
            WorkerReply::Validated(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn preview_import(
        &self,
        text: String,
        options: ImportOptions,
    ) -> Result<Result<ImportPreview, ValidationResult>, WorkerError> {
        match self
            .request(WorkerRequest::PreviewImport {
                text,
                options,
                caller: self.caller.clone(),
            })
            .await?
        {
            WorkerReply::Previewed(preview) => Ok(preview),
            other => Err(unexpected(other)),
        }
    }

    pub async fn import_config(
        &self,
        text: String,
        options: ImportOptions,
    ) -> Result<ImportResult, WorkerError> {
        match self
            .request(WorkerRequest::ImportConfig {
                text,
                options,
                caller: self.caller.clone(),
            })
            .await?
        {
            WorkerReply::Imported(result) => Ok(*result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn import_file(
        &self,
        path: impl AsRef<Utf8Path>,
        options: ImportOptions,
    ) -> Result<ImportResult, WorkerError> {
        match self
            .request(WorkerRequest::ImportFile {
                path: path.as_ref().to_path_buf(),
                options,
                caller: self.caller.clone(),
            })
            .await?
        {
            WorkerReply::Imported(result) => Ok(*result),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: WorkerReply) -> WorkerError {
    WorkerError::Internal(format!("unexpected reply: {reply:?}"))
}
