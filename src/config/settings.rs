use anyhow::{Context, Result};
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{CURRENT_SCHEMA_VERSION, SUPPORTED_SCHEMA_VERSIONS};

const MIB: u64 = 1024 * 1024;

/// Prefix of environment variables overriding engine settings,
/// e.g. `STOPBOARD__SANDBOX__MAX_DEPTH=12`.
pub const ENV_PREFIX: &str = "STOPBOARD";

/// Tunables of the import/export engine.
///
/// Every section falls back to its defaults, so an empty settings file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub sandbox: SandboxSettings,
    pub governor: GovernorSettings,
    pub schema: SchemaSettings,
    pub logging: LoggingOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub max_file_bytes: u64,
    pub max_depth: usize,
    pub rate_limit_attempts: usize,
    pub rate_limit_window_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_file_bytes: 10 * MIB,
            max_depth: 10,
            rate_limit_attempts: 5,
            rate_limit_window_secs: 300,
            cooldown_secs: 30,
        }
    }
}

impl SandboxSettings {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSettings {
    pub heap_limit_bytes: u64,
    pub guard_margin_bytes: u64,
    pub base_interval_ms: u64,
    pub min_interval_ms: u64,
    pub base_chunk_size: usize,
    pub max_concurrent_operations: usize,
    pub queue_capacity: usize,
    pub history_len: usize,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            heap_limit_bytes: 512 * MIB,
            guard_margin_bytes: 10 * MIB,
            base_interval_ms: 1000,
            min_interval_ms: 250,
            base_chunk_size: 200,
            max_concurrent_operations: 3,
            queue_capacity: 1000,
            history_len: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaSettings {
    pub current_version: String,
    pub supported_versions: Vec<String>,
    pub strict: bool,
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            current_version: CURRENT_SCHEMA_VERSION.to_string(),
            supported_versions: SUPPORTED_SCHEMA_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            strict: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    pub log_dir: String,
    pub file_prefix: String,
    pub debug: bool,
    pub console: bool,
    pub json: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            file_prefix: "stopboard".to_string(),
            debug: false,
            console: false,
            json: false,
        }
    }
}

impl EngineSettings {
    /// Load settings from built-in defaults, an optional YAML file and the
    /// environment, later sources overriding earlier ones.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&EngineSettings::default())
            .context("Failed to seed default engine settings")?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            if path.exists() {
                tracing::info!("Loading engine settings from {}", path);
            } else {
                tracing::warn!("Engine settings file not found at {}, using defaults", path);
            }
            builder = builder.add_source(
                config::File::new(path.as_str(), config::FileFormat::Yaml).required(false),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build engine settings")?
            .try_deserialize::<EngineSettings>()
            .context("Failed to parse engine settings")?;

        tracing::debug!(
            "Engine settings: max_file_bytes={}, max_depth={}, heap_limit={}, schema={}",
            settings.sandbox.max_file_bytes,
            settings.sandbox.max_depth,
            settings.governor.heap_limit_bytes,
            settings.schema.current_version
        );

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_engine_limits() {
        let settings = EngineSettings::default();
        assert_eq!(settings.sandbox.max_file_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.sandbox.max_depth, 10);
        assert_eq!(settings.sandbox.rate_limit_attempts, 5);
        assert_eq!(settings.sandbox.rate_limit_window(), Duration::from_secs(300));
        assert_eq!(settings.sandbox.cooldown(), Duration::from_secs(30));
        assert_eq!(settings.governor.guard_margin_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.governor.max_concurrent_operations, 3);
        assert_eq!(settings.governor.queue_capacity, 1000);
        assert_eq!(settings.governor.history_len, 20);
        assert!(settings.schema.strict);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let settings = EngineSettings::load(None).unwrap();
        assert_eq!(settings.sandbox, SandboxSettings::default());
        assert_eq!(settings.schema, SchemaSettings::default());
    }

    #[test]
    fn test_load_partial_yaml_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let path = dir.join("engine.yaml");
        fs::write(
            &path,
            "sandbox:\n  max_depth: 12\ngovernor:\n  heap_limit_bytes: 1048576\n",
        )
        .unwrap();

        let settings = EngineSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.sandbox.max_depth, 12);
        assert_eq!(settings.sandbox.rate_limit_attempts, 5);
        assert_eq!(settings.governor.heap_limit_bytes, 1_048_576);
        assert_eq!(settings.governor.queue_capacity, 1000);
    }
}
