// Stopboard - configuration import/export engine for a transit departure dashboard
//
// This library crate holds the sandbox, validator, merge engine, import
// orchestrator and the background worker. Presentation layers embed it and
// talk to it through `ImportOrchestrator` or a `WorkerHandle`.

pub mod config;
pub mod i18n;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;
pub mod worker;

// Re-export commonly used types for convenience
pub use config::{
    ConfigRepository, EngineSettings, FileConfigRepository, InMemoryConfigRepository,
    RepositoryError,
};
pub use models::{
    AppConfig, ConfigExport, ImportOptions, ImportPreview, ImportResult, StopConfig,
    ValidationResult,
};
pub use services::{FileSandbox, ImportOrchestrator, SchemaValidator};
pub use state::{ImportEvent, ImportPhase, ImportStateManager};
pub use worker::{ConfigWorker, MemoryGovernor, WorkerHandle};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
