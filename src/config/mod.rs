//! Persistence of the current configuration and engine settings.
//!
//! The engine never keeps a long-lived reference to the user's
//! [`AppConfig`]; it reads a copy through [`ConfigRepository::get`] and writes
//! a complete replacement through [`ConfigRepository::set`]. Implementations
//! must make `set` atomic: readers see either the old or the new value.

pub mod settings;

pub use settings::{EngineSettings, GovernorSettings, LoggingOptions, SandboxSettings, SchemaSettings};

use crate::models::AppConfig;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

/// File name used by [`FileConfigRepository`] inside its directory.
pub const CONFIG_FILE_NAME: &str = "stopboard-config.yaml";

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse stored configuration {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[source] serde_yaml_ng::Error),

    #[error("configuration store unavailable: {0}")]
    Unavailable(String),
}

/// Store holding the user's current configuration.
pub trait ConfigRepository: Send + Sync {
    fn get(&self) -> Result<AppConfig, RepositoryError>;

    /// Replace the stored configuration in one step.
    fn set(&self, config: AppConfig) -> Result<(), RepositoryError>;
}

/// Repository kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryConfigRepository {
    config: RwLock<AppConfig>,
}

impl InMemoryConfigRepository {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }
}

impl ConfigRepository for InMemoryConfigRepository {
    fn get(&self) -> Result<AppConfig, RepositoryError> {
        Ok(self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn set(&self, config: AppConfig) -> Result<(), RepositoryError> {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }
}

/// Repository persisting the configuration as YAML in a directory.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash mid-write never leaves a truncated configuration behind.
#[derive(Debug)]
pub struct FileConfigRepository {
    config_dir: Utf8PathBuf,
    config_path: Utf8PathBuf,
    write_lock: Mutex<()>,
}

impl FileConfigRepository {
    /// Open (and create if needed) a repository rooted at `config_dir`.
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self, RepositoryError> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).map_err(|source| RepositoryError::Io {
                path: config_dir.clone(),
                source,
            })?;
        }

        Ok(Self {
            config_path: config_dir.join(CONFIG_FILE_NAME),
            config_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }
}

impl ConfigRepository for FileConfigRepository {
    fn get(&self) -> Result<AppConfig, RepositoryError> {
        if !self.config_path.exists() {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                self.config_path
            );
            return Ok(AppConfig::default());
        }

        let contents = fs::read_to_string(&self.config_path).map_err(|source| RepositoryError::Io {
            path: self.config_path.clone(),
            source,
        })?;

        let config: AppConfig =
            serde_yaml_ng::from_str(&contents).map_err(|source| RepositoryError::Parse {
                path: self.config_path.clone(),
                source,
            })?;

        tracing::debug!(
            "Loaded configuration with {} stops from {}",
            config.stops.len(),
            self.config_path
        );
        Ok(config)
    }

    fn set(&self, config: AppConfig) -> Result<(), RepositoryError> {
        let yaml = serde_yaml_ng::to_string(&config).map_err(RepositoryError::Serialize)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let temp_path = self.config_dir.join(format!("{CONFIG_FILE_NAME}.tmp"));

        fs::write(&temp_path, yaml).map_err(|source| RepositoryError::Io {
            path: temp_path.clone(),
            source,
        })?;
        fs::rename(&temp_path, &self.config_path).map_err(|source| RepositoryError::Io {
            path: self.config_path.clone(),
            source,
        })?;

        tracing::info!(
            "Saved configuration with {} stops to {}",
            config.stops.len(),
            self.config_path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{City, StopConfig};
    use tempfile::TempDir;

    fn create_test_repository() -> (FileConfigRepository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let repository = FileConfigRepository::new(config_path.join("data")).unwrap();
        (repository, temp_dir)
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let (repository, _temp_dir) = create_test_repository();
        assert!(repository.config_dir().exists());

        let config = repository.get().unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_set_then_get_round_trips() {
        let (repository, _temp_dir) = create_test_repository();

        let mut config = AppConfig::default();
        config.dark_mode = true;
        config.stops.push(StopConfig {
            id: "s1".to_string(),
            name: "Central".to_string(),
            city: City::B,
            stop_id: "900001".to_string(),
            walking_time_minutes: 3,
            visible: true,
            position: 0,
        });
        repository.set(config.clone()).unwrap();

        assert_eq!(repository.get().unwrap(), config);
        assert!(!repository.config_dir().join(format!("{CONFIG_FILE_NAME}.tmp")).exists());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let (repository, _temp_dir) = create_test_repository();
        fs::write(repository.config_path(), "stops: [unclosed").unwrap();

        let err = repository.get().unwrap_err();
        assert!(matches!(err, RepositoryError::Parse { .. }));
    }

    #[test]
    fn test_in_memory_set_replaces_whole_value() {
        let repository = InMemoryConfigRepository::default();
        let mut config = AppConfig::default();
        config.language = "de".to_string();

        repository.set(config.clone()).unwrap();
        assert_eq!(repository.get().unwrap(), config);
    }
}
