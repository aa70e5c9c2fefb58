// State management module
//
// Tracks the phase and progress of the import state machine behind an
// Arc<RwLock<T>> and emits change events for any number of subscribers.

use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Phases of one import attempt.
///
/// `Idle → Validating → (BackingUp) → Merging → Finalizing → {Committed | RolledBack}`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImportPhase {
    #[default]
    Idle,
    Validating,
    BackingUp,
    Merging,
    Finalizing,
    Committed,
    RolledBack,
}

impl ImportPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// True while an attempt is between `Validating` and `Finalizing`.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != Self::Idle
    }
}

/// Fixed progress checkpoints, each worth 25%.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImportCheckpoint {
    Validation,
    Backup,
    Merge,
    Finalize,
}

impl ImportCheckpoint {
    pub const ALL: [ImportCheckpoint; 4] = [
        ImportCheckpoint::Validation,
        ImportCheckpoint::Backup,
        ImportCheckpoint::Merge,
        ImportCheckpoint::Finalize,
    ];

    /// Progress value (0-100) once this checkpoint is reached.
    pub fn progress(self) -> u8 {
        match self {
            Self::Validation => 25,
            Self::Backup => 50,
            Self::Merge => 75,
            Self::Finalize => 100,
        }
    }
}

/// Snapshot of the import state machine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportState {
    pub phase: ImportPhase,
    pub progress: u8,
    pub checkpoint: Option<ImportCheckpoint>,
    /// Number of attempts started since creation.
    pub attempts: u64,
}

/// Change events emitted when the import state is modified
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportEvent {
    PhaseChanged {
        from: ImportPhase,
        to: ImportPhase,
    },

    ProgressUpdated {
        progress: u8,
        checkpoint: Option<ImportCheckpoint>,
    },

    /// The attempt reached `Committed` or `RolledBack`
    ImportFinished {
        success: bool,
        progress: u8,
    },
}

/// Thread-safe import state with event emission
///
/// The orchestrator drives this through [`begin`](Self::begin),
/// [`enter`](Self::enter), [`reach`](Self::reach) and
/// [`finish`](Self::finish). UI layers [`subscribe`](Self::subscribe) to
/// render progress without polling.
pub struct ImportStateManager {
    state: Arc<RwLock<ImportState>>,

    /// Multiple subscribers can listen for state changes
    event_tx: broadcast::Sender<ImportEvent>,
}

impl ImportStateManager {
    /// Create a new manager with a broadcast buffer of 100 events
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(RwLock::new(ImportState::default())),
            event_tx,
        }
    }

    pub fn snapshot(&self) -> ImportState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Execute a function with read access to the state
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&ImportState) -> R,
    {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Apply `update_fn`, then emit one event per detected change.
    ///
    /// Returns the emitted events.
    pub fn update<F>(&self, update_fn: F) -> Vec<ImportEvent>
    where
        F: FnOnce(&mut ImportState),
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let old_state = state.clone();

        update_fn(&mut state);

        let changes = Self::detect_changes(&old_state, &state);

        for change in &changes {
            // No subscribers is fine
            let _ = self.event_tx.send(change.clone());
        }

        changes
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.event_tx.subscribe()
    }

    fn detect_changes(old: &ImportState, new: &ImportState) -> Vec<ImportEvent> {
        let mut changes = Vec::new();

        if old.phase != new.phase {
            changes.push(ImportEvent::PhaseChanged {
                from: old.phase,
                to: new.phase,
            });
        }

        if old.progress != new.progress || old.checkpoint != new.checkpoint {
            changes.push(ImportEvent::ProgressUpdated {
                progress: new.progress,
                checkpoint: new.checkpoint,
            });
        }

        if new.phase.is_terminal() && old.phase != new.phase {
            changes.push(ImportEvent::ImportFinished {
                success: new.phase == ImportPhase::Committed,
                progress: new.progress,
            });
        }

        changes
    }

    /// Start a new attempt in `Validating` with progress reset to 0.
    pub fn begin(&self) -> Vec<ImportEvent> {
        self.update(|state| {
            state.phase = ImportPhase::Validating;
            state.progress = 0;
            state.checkpoint = None;
            state.attempts += 1;
        })
    }

    pub fn enter(&self, phase: ImportPhase) -> Vec<ImportEvent> {
        tracing::debug!("Import phase -> {:?}", phase);
        self.update(|state| state.phase = phase)
    }

    pub fn reach(&self, checkpoint: ImportCheckpoint) -> Vec<ImportEvent> {
        self.update(|state| {
            state.checkpoint = Some(checkpoint);
            state.progress = state.progress.max(checkpoint.progress());
        })
    }

    /// Move to the terminal phase for `success`.
    pub fn finish(&self, success: bool) -> Vec<ImportEvent> {
        self.update(|state| {
            state.phase = if success {
                ImportPhase::Committed
            } else {
                ImportPhase::RolledBack
            };
        })
    }

    /// Return to `Idle`, keeping the attempt counter.
    pub fn reset(&self) -> Vec<ImportEvent> {
        self.update(|state| {
            state.phase = ImportPhase::Idle;
            state.progress = 0;
            state.checkpoint = None;
        })
    }
}

impl Default for ImportStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ImportStateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            event_tx: self.event_tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_manager() {
        let manager = ImportStateManager::new();
        let state = manager.snapshot();

        assert_eq!(state.phase, ImportPhase::Idle);
        assert_eq!(state.progress, 0);
        assert_eq!(state.attempts, 0);
    }

    #[test]
    fn test_begin_emits_phase_change() {
        let manager = ImportStateManager::new();

        let changes = manager.begin();

        assert_eq!(
            changes,
            vec![ImportEvent::PhaseChanged {
                from: ImportPhase::Idle,
                to: ImportPhase::Validating
            }]
        );
        assert_eq!(manager.snapshot().attempts, 1);
    }

    #[test]
    fn test_checkpoints_advance_in_quarters() {
        let manager = ImportStateManager::new();
        manager.begin();

        let mut seen = Vec::new();
        for checkpoint in ImportCheckpoint::ALL {
            manager.reach(checkpoint);
            seen.push(manager.read(|s| s.progress));
        }

        assert_eq!(seen, vec![25, 50, 75, 100]);
    }

    #[test]
    fn test_finish_emits_finished_event() {
        let manager = ImportStateManager::new();
        manager.begin();
        manager.reach(ImportCheckpoint::Validation);

        let changes = manager.finish(false);

        assert_eq!(changes.len(), 2);
        assert!(matches!(
            changes[0],
            ImportEvent::PhaseChanged {
                to: ImportPhase::RolledBack,
                ..
            }
        ));
        assert_eq!(
            changes[1],
            ImportEvent::ImportFinished {
                success: false,
                progress: 25
            }
        );
    }

    #[test]
    fn test_no_events_without_change() {
        let manager = ImportStateManager::new();
        let changes = manager.update(|_| {});
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let manager = ImportStateManager::new();
        let mut rx = manager.subscribe();

        manager.begin();
        manager.reach(ImportCheckpoint::Validation);

        assert!(matches!(
            rx.recv().await.unwrap(),
            ImportEvent::PhaseChanged { .. }
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            ImportEvent::ProgressUpdated {
                progress: 25,
                checkpoint: Some(ImportCheckpoint::Validation)
            }
        );
    }

    #[test]
    fn test_phase_predicates() {
        assert!(ImportPhase::Merging.is_active());
        assert!(!ImportPhase::Idle.is_active());
        assert!(ImportPhase::Committed.is_terminal());
        assert!(!ImportPhase::Committed.is_active());
    }
}
