use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingOptions;

/// Build the level filter: `RUST_LOG` when set, otherwise `debug`/`info`.
fn env_filter(debug_mode: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug_mode {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

/// Setup logging with a daily rotating file appender.
///
/// Logs go to `options.log_dir` with `options.file_prefix`, either as plain
/// text or as JSON lines. With `options.console` set, a second layer mirrors
/// output to the terminal.
///
/// # Returns
/// A guard that must be held for as long as logging should stay active.
///
/// # Errors
/// Fails when the log directory cannot be created or a global subscriber is
/// already installed.
pub fn init_logging(options: &LoggingOptions) -> Result<WorkerGuard> {
    let log_path = Utf8PathBuf::from(&options.log_dir);
    if !log_path.exists() {
        fs::create_dir_all(&log_path)
            .with_context(|| format!("Failed to create log directory: {}", log_path))?;
    }

    let file_appender = rolling::daily(log_path.as_std_path(), &options.file_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let text_layer = (!options.json).then(|| {
        fmt::layer()
            .with_writer(non_blocking.clone())
            .with_ansi(false) // No ANSI codes in log files
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });

    let json_layer = options.json.then(|| {
        fmt::layer()
            .json()
            .with_writer(non_blocking.clone())
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });

    let console_layer = options
        .console
        .then(|| fmt::layer().with_ansi(true).with_target(false));

    tracing_subscriber::registry()
        .with(env_filter(options.debug))
        .with(text_layer)
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install the global tracing subscriber")?;

    tracing::info!(
        "Logging initialized: dir={}, prefix={}, debug={}, console={}, json={}",
        options.log_dir,
        options.file_prefix,
        options.debug,
        options.console,
        options.json
    );

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options_in(dir: &TempDir) -> LoggingOptions {
        LoggingOptions {
            log_dir: dir.path().join("logs").to_str().unwrap().to_string(),
            file_prefix: "test".to_string(),
            ..LoggingOptions::default()
        }
    }

    #[test]
    fn test_init_logging_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let options = options_in(&temp_dir);

        // May fail if another test already installed a subscriber, but the
        // directory is created before that point either way.
        let _guard = init_logging(&options);

        assert!(Utf8PathBuf::from(&options.log_dir).exists());
    }

    #[test]
    fn test_second_init_errors_instead_of_panicking() {
        let temp_dir = TempDir::new().unwrap();
        let options = options_in(&temp_dir);

        let _first = init_logging(&options);
        let second = init_logging(&options);

        assert!(second.is_err());
    }
}
