//! First line of defence for untrusted import files.
//!
//! Everything here runs before JSON parsing: file metadata checks, a
//! per-key sliding-window rate limiter with a cooldown, a deny-list scan of
//! the raw text and a bounded nesting-depth pass. Failures are typed
//! [`SecurityRejection`]s; nothing in this module touches the stored
//! configuration.

use camino::Utf8Path;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::SandboxSettings;

/// MIME types accepted when the picker reports one.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/json",
    "text/json",
    "text/plain",
    "application/octet-stream",
];

/// Required file extension, compared exactly.
pub const REQUIRED_EXTENSION: &str = ".json";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityRejection {
    #[error("too many import attempts for {key}, retry in {}s", .retry_after.as_secs().max(1))]
    RateLimited { key: String, retry_after: Duration },

    #[error("file is empty")]
    EmptyFile,

    #[error("file is {size} bytes, limit is {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("file {name} does not have the .json extension")]
    InvalidExtension { name: String },

    #[error("MIME type {mime} is not allowed")]
    DisallowedMimeType { mime: String },

    #[error("file name {name:?} is not allowed")]
    SuspiciousFileName { name: String },

    #[error("file is not valid UTF-8 text")]
    InvalidEncoding,

    #[error("file contains disallowed content ({pattern})")]
    SuspiciousContent { pattern: &'static str },

    #[error("JSON nesting exceeds {max} levels")]
    DepthExceeded { max: usize },
}

/// Metadata the file picker reports about a candidate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub mime_type: Option<String>,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64, mime_type: Option<&str>) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.map(str::to_string),
        }
    }

    /// Describe a file on disk. The MIME type is unknown for local paths.
    pub fn from_path(path: &Utf8Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            name: path.file_name().unwrap_or(path.as_str()).to_string(),
            size: metadata.len(),
            mime_type: None,
        })
    }
}

#[derive(Debug, Default)]
struct KeyWindow {
    hits: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

/// Sliding-window attempt counter keyed by caller or file name.
///
/// A key that exhausts its window enters a fixed cooldown; while the
/// cooldown runs every attempt is rejected, even if the window itself has
/// already drained.
#[derive(Debug)]
pub struct RateLimiterState {
    max_attempts: usize,
    window: Duration,
    cooldown: Duration,
    keys: HashMap<String, KeyWindow>,
    last_pruned: Option<Instant>,
}

impl RateLimiterState {
    pub fn new(max_attempts: usize, window: Duration, cooldown: Duration) -> Self {
        Self {
            max_attempts,
            window,
            cooldown,
            keys: HashMap::new(),
            last_pruned: None,
        }
    }

    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self::new(
            settings.rate_limit_attempts,
            settings.rate_limit_window(),
            settings.cooldown(),
        )
    }

    pub fn check(&mut self, key: &str) -> Result<(), SecurityRejection> {
        self.check_at(key, Instant::now())
    }

    /// Record an attempt for `key` at `now`, rejecting it if the key is
    /// cooling down or its window is full.
    ///
    /// Idle keys are swept at most once per window, so the table only holds
    /// keys seen in roughly the last two windows plus those cooling down.
    pub fn check_at(&mut self, key: &str, now: Instant) -> Result<(), SecurityRejection> {
        let window = self.window;
        if self
            .last_pruned
            .is_none_or(|at| now.saturating_duration_since(at) >= window)
        {
            self.prune(now);
            self.last_pruned = Some(now);
        }

        let entry = self.keys.entry(key.to_string()).or_default();

        if let Some(until) = entry.cooldown_until {
            if now < until {
                return Err(SecurityRejection::RateLimited {
                    key: key.to_string(),
                    retry_after: until - now,
                });
            }
            entry.cooldown_until = None;
        }

        while entry
            .hits
            .front()
            .is_some_and(|hit| now.saturating_duration_since(*hit) >= window)
        {
            entry.hits.pop_front();
        }

        if entry.hits.len() >= self.max_attempts {
            let until = now + self.cooldown;
            entry.cooldown_until = Some(until);
            tracing::warn!(
                "Rate limit exhausted for {}: {} attempts in {:?}, cooling down for {:?}",
                key,
                entry.hits.len(),
                window,
                self.cooldown
            );
            return Err(SecurityRejection::RateLimited {
                key: key.to_string(),
                retry_after: self.cooldown,
            });
        }

        entry.hits.push_back(now);
        Ok(())
    }

    /// Drop keys with no recent attempts and no active cooldown.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.keys.retain(|_, entry| {
            let cooling = entry.cooldown_until.is_some_and(|until| now < until);
            let recent = entry
                .hits
                .back()
                .is_some_and(|hit| now.saturating_duration_since(*hit) < window);
            cooling || recent
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }
}

/// Validator for untrusted import files and their raw text.
pub struct FileSandbox {
    settings: SandboxSettings,
    limiter: Mutex<RateLimiterState>,
    file_name_deny: Regex,
    content_deny: Vec<(&'static str, Regex)>,
}

impl FileSandbox {
    /// Create a sandbox with its own rate-limit table.
    pub fn new(settings: SandboxSettings) -> Self {
        let limiter = RateLimiterState::from_settings(&settings);
        Self::with_limiter(settings, limiter)
    }

    pub fn with_limiter(settings: SandboxSettings, limiter: RateLimiterState) -> Self {
        let content_deny = vec![
            ("script tag", Regex::new(r"(?i)<\s*/?\s*script").expect("Invalid script regex")),
            ("javascript url", Regex::new(r"(?i)javascript\s*:").expect("Invalid url regex")),
            ("eval call", Regex::new(r"\beval\s*\(").expect("Invalid eval regex")),
            (
                "function constructor",
                Regex::new(r"\bFunction\s*\(").expect("Invalid function regex"),
            ),
            ("__proto__ reference", Regex::new(r"__proto__").expect("Invalid proto regex")),
            (
                "constructor/prototype reference",
                Regex::new(r#""(constructor|prototype)"\s*:|\bconstructor\s*(\.\s*prototype\b|\[)"#)
                    .expect("Invalid constructor regex"),
            ),
        ];

        Self {
            settings,
            limiter: Mutex::new(limiter),
            file_name_deny: Regex::new(
                r"(?i)[\x00-\x1f\x7f/\\]|\.\.|\.(exe|bat|cmd|com|scr|msi|dll|ps1|vbs|js|jar|sh|app|bin)\.",
            )
            .expect("Invalid file name regex"),
            content_deny,
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Count one attempt against `key` without looking at any file.
    pub fn check_rate(&self, key: &str) -> Result<(), SecurityRejection> {
        self.limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check(key)
            .inspect_err(|rejection| tracing::warn!("Rejected request from {}: {}", key, rejection))
    }

    /// Rate-limit by file name, then run the metadata checks.
    pub fn validate_file(&self, file: &FileDescriptor) -> Result<(), SecurityRejection> {
        self.validate_file_for(&file.name, file)
    }

    /// Rate-limit by an explicit caller key, then run the metadata checks.
    pub fn validate_file_for(
        &self,
        key: &str,
        file: &FileDescriptor,
    ) -> Result<(), SecurityRejection> {
        self.check_rate(key)?;
        self.check_file(file).inspect_err(|rejection| {
            tracing::warn!("Rejected import file {:?}: {}", file.name, rejection);
        })
    }

    /// Metadata checks in order: size, extension, MIME type, file name.
    pub fn check_file(&self, file: &FileDescriptor) -> Result<(), SecurityRejection> {
        if file.size == 0 {
            return Err(SecurityRejection::EmptyFile);
        }
        if file.size > self.settings.max_file_bytes {
            return Err(SecurityRejection::FileTooLarge {
                size: file.size,
                max: self.settings.max_file_bytes,
            });
        }

        if !file.name.ends_with(REQUIRED_EXTENSION) || file.name.len() == REQUIRED_EXTENSION.len()
        {
            return Err(SecurityRejection::InvalidExtension {
                name: file.name.clone(),
            });
        }

        if let Some(mime) = file.mime_type.as_deref().filter(|m| !m.trim().is_empty()) {
            let essence = mime
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            if !ALLOWED_MIME_TYPES.contains(&essence.as_str()) {
                return Err(SecurityRejection::DisallowedMimeType {
                    mime: mime.to_string(),
                });
            }
        }

        if self.file_name_deny.is_match(&file.name) {
            return Err(SecurityRejection::SuspiciousFileName {
                name: file.name.clone(),
            });
        }

        Ok(())
    }

    /// Turn raw file bytes into text. Anything but UTF-8 is rejected.
    pub fn decode_text(&self, bytes: Vec<u8>) -> Result<String, SecurityRejection> {
        String::from_utf8(bytes).map_err(|err| {
            tracing::warn!(
                "Rejected import content: invalid UTF-8 at byte {}",
                err.utf8_error().valid_up_to()
            );
            SecurityRejection::InvalidEncoding
        })
    }

    /// Screen raw text before it is handed to the JSON parser.
    pub fn validate_content(&self, text: &str) -> Result<(), SecurityRejection> {
        let size = text.len() as u64;
        if size == 0 {
            return Err(SecurityRejection::EmptyFile);
        }
        if size > self.settings.max_file_bytes {
            return Err(SecurityRejection::FileTooLarge {
                size,
                max: self.settings.max_file_bytes,
            });
        }

        if let Some((label, _)) = self.content_deny.iter().find(|(_, re)| re.is_match(text)) {
            tracing::warn!("Rejected import content: matched {}", label);
            return Err(SecurityRejection::SuspiciousContent { pattern: label });
        }

        scan_depth(text, self.settings.max_depth)?;
        Ok(())
    }
}

/// Deepest object/array nesting in `text`, without building a value tree.
///
/// Brackets inside string literals are ignored. Scanning stops as soon as
/// `max_depth` is exceeded, so memory use is constant regardless of input.
pub fn scan_depth(text: &str, max_depth: usize) -> Result<usize, SecurityRejection> {
    let mut depth = 0usize;
    let mut deepest = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for byte in text.bytes() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                if depth > max_depth {
                    return Err(SecurityRejection::DepthExceeded { max: max_depth });
                }
                deepest = deepest.max(depth);
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    Ok(deepest)
}
