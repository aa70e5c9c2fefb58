//! Memory governor for heavy worker operations.
//!
//! Refuses work that would not fit into the heap budget, adapts the sampling
//! interval and chunk size to the current pressure tier, and keeps a short
//! history of samples to spot steadily rising usage.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;

use crate::config::GovernorSettings;
use crate::services::{CancelSignal, ChunkGate, Interrupted};

/// Discretized memory utilization band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PressureTier {
    Low,
    Moderate,
    High,
    Critical,
    Emergency,
}

impl PressureTier {
    /// Tier for `used / limit`.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio < 0.30 {
            Self::Low
        } else if ratio < 0.50 {
            Self::Moderate
        } else if ratio < 0.80 {
            Self::High
        } else if ratio <= 0.85 {
            Self::Critical
        } else {
            Self::Emergency
        }
    }

    pub fn from_usage(used_bytes: u64, limit_bytes: u64) -> Self {
        if limit_bytes == 0 {
            return Self::Emergency;
        }
        Self::from_ratio(used_bytes as f64 / limit_bytes as f64)
    }

    /// Factor applied to the base interval and the base chunk size.
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Low => 2.0,
            Self::Moderate => 1.0,
            Self::High => 0.5,
            Self::Critical | Self::Emergency => 0.1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    pub timestamp: Instant,
    pub used_bytes: u64,
    pub tier: PressureTier,
}

/// Source of the current memory usage.
pub trait MemoryProbe: Send + Sync {
    fn used_bytes(&self) -> u64;
}

/// Resident set size of the current process, read through `sysinfo`.
pub struct ProcessMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessMemoryProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMemoryProbe")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn used_bytes(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(sysinfo::Process::memory).unwrap_or(0)
    }
}

/// Fixed, settable usage for tests and embedders with their own accounting.
#[derive(Debug, Default)]
pub struct StaticMemoryProbe {
    used: AtomicU64,
}

impl StaticMemoryProbe {
    pub fn new(used_bytes: u64) -> Self {
        Self {
            used: AtomicU64::new(used_bytes),
        }
    }

    pub fn set(&self, used_bytes: u64) {
        self.used.store(used_bytes, Ordering::Relaxed);
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GovernorError {
    #[error(
        "memory exhausted: {used_bytes} used + {estimate_bytes} estimated + {guard_margin_bytes} margin exceeds {limit_bytes} bytes"
    )]
    MemoryExhausted {
        used_bytes: u64,
        estimate_bytes: u64,
        guard_margin_bytes: u64,
        limit_bytes: u64,
    },
}

/// Best-effort hook run after each guarded operation and on every refusal,
/// e.g. dropping caches or purging an allocator arena.
pub type ReleaseHint = Box<dyn Fn() + Send + Sync>;

pub struct MemoryGovernor {
    settings: GovernorSettings,
    probe: Arc<dyn MemoryProbe>,
    history: Mutex<VecDeque<MemorySnapshot>>,
    release_hint: Option<ReleaseHint>,
}

impl MemoryGovernor {
    pub fn new(settings: GovernorSettings, probe: Arc<dyn MemoryProbe>) -> Self {
        let capacity = settings.history_len;
        Self {
            settings,
            probe,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            release_hint: None,
        }
    }

    pub fn with_release_hint(mut self, hint: ReleaseHint) -> Self {
        self.release_hint = Some(hint);
        self
    }

    pub fn settings(&self) -> &GovernorSettings {
        &self.settings
    }

    /// Read the probe, record the sample and return it.
    pub fn sample(&self) -> MemorySnapshot {
        let used_bytes = self.probe.used_bytes();
        let snapshot = MemorySnapshot {
            timestamp: Instant::now(),
            used_bytes,
            tier: PressureTier::from_usage(used_bytes, self.settings.heap_limit_bytes),
        };

        let rising = {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if self.settings.history_len > 0 {
                while history.len() >= self.settings.history_len {
                    history.pop_front();
                }
                history.push_back(snapshot);
            }
            history.len() >= self.settings.history_len.max(2) && strictly_rising(&history)
        };

        if rising {
            tracing::warn!(
                "Memory usage rose across the last {} samples (now {} bytes, tier {})",
                self.settings.history_len,
                used_bytes,
                snapshot.tier.as_str()
            );
        }

        snapshot
    }

    pub fn history(&self) -> Vec<MemorySnapshot> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// True when every recorded sample used more memory than the one before.
    pub fn is_usage_rising(&self) -> bool {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.len() >= 2 && strictly_rising(&history)
    }

    pub fn latest(&self) -> Option<MemorySnapshot> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .copied()
    }

    fn current_tier(&self) -> PressureTier {
        self.latest()
            .map(|s| s.tier)
            .unwrap_or_else(|| self.sample().tier)
    }

    pub fn poll_interval_for(&self, tier: PressureTier) -> Duration {
        let scaled = (self.settings.base_interval_ms as f64 * tier.multiplier()) as u64;
        Duration::from_millis(scaled.max(self.settings.min_interval_ms))
    }

    /// Sampling interval for the most recent pressure tier.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval_for(self.current_tier())
    }

    pub fn chunk_size_for(&self, tier: PressureTier) -> usize {
        ((self.settings.base_chunk_size as f64 * tier.multiplier()) as usize).max(1)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size_for(self.current_tier())
    }

    /// Refuse when `used + estimate + margin` would exceed the heap limit.
    pub fn check(&self, estimate_bytes: u64) -> Result<MemorySnapshot, GovernorError> {
        let snapshot = self.sample();
        let required = snapshot
            .used_bytes
            .saturating_add(estimate_bytes)
            .saturating_add(self.settings.guard_margin_bytes);

        if required > self.settings.heap_limit_bytes {
            tracing::warn!(
                "Refusing operation: {} used + {} estimated + {} margin > {} limit",
                snapshot.used_bytes,
                estimate_bytes,
                self.settings.guard_margin_bytes,
                self.settings.heap_limit_bytes
            );
            return Err(GovernorError::MemoryExhausted {
                used_bytes: snapshot.used_bytes,
                estimate_bytes,
                guard_margin_bytes: self.settings.guard_margin_bytes,
                limit_bytes: self.settings.heap_limit_bytes,
            });
        }

        Ok(snapshot)
    }

    /// Run the release hint, if one is installed.
    pub fn release_memory(&self) {
        if let Some(hint) = &self.release_hint {
            tracing::debug!("Running memory release hint");
            hint();
        }
    }

    /// Run `op` only if `estimate_bytes` fits the budget.
    ///
    /// The release hint runs after `op` returns, whatever it returned, and
    /// also when the operation is refused.
    pub fn with_memory_guard<T>(
        &self,
        estimate_bytes: u64,
        op: impl FnOnce() -> T,
    ) -> Result<T, GovernorError> {
        let snapshot = self
            .check(estimate_bytes)
            .inspect_err(|_| self.release_memory())?;
        tracing::debug!(
            "Guarded operation admitted: estimate={} used={} tier={}",
            estimate_bytes,
            snapshot.used_bytes,
            snapshot.tier.as_str()
        );

        let output = op();
        self.release_memory();
        Ok(output)
    }

    /// Chunk gate combining pressure checks with optional cancellation.
    pub fn gate(&self, cancel: Option<CancelSignal>) -> GovernedRun<'_> {
        GovernedRun {
            governor: self,
            cancel,
            chunk_size: self.chunk_size(),
        }
    }
}

impl std::fmt::Debug for MemoryGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGovernor")
            .field("settings", &self.settings)
            .field("has_release_hint", &self.release_hint.is_some())
            .finish_non_exhaustive()
    }
}

fn strictly_rising(history: &VecDeque<MemorySnapshot>) -> bool {
    history
        .iter()
        .zip(history.iter().skip(1))
        .all(|(prev, next)| next.used_bytes > prev.used_bytes)
}

/// [`ChunkGate`] handed to validation and import while a governor is active.
///
/// Interrupts on cancellation, or when usage plus the guard margin has
/// reached the heap limit.
pub struct GovernedRun<'a> {
    governor: &'a MemoryGovernor,
    cancel: Option<CancelSignal>,
    chunk_size: usize,
}

impl ChunkGate for GovernedRun<'_> {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn checkpoint(&self, processed: usize) -> Result<(), Interrupted> {
        if self.cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
            tracing::info!("Operation cancelled after {} items", processed);
            return Err(Interrupted::Cancelled);
        }

        let snapshot = self.governor.sample();
        let limit_bytes = self.governor.settings.heap_limit_bytes;
        let margin = self.governor.settings.guard_margin_bytes;
        if snapshot.tier == PressureTier::Emergency
            && snapshot.used_bytes.saturating_add(margin) >= limit_bytes
        {
            tracing::warn!(
                "Operation interrupted under memory pressure after {} items",
                processed
            );
            return Err(Interrupted::MemoryPressure {
                used_bytes: snapshot.used_bytes,
                limit_bytes,
            });
        }
        Ok(())
    }
}
