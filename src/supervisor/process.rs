use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::state_machine::{ObservedState, Transition};
use crate::application::{ApplicationSpec, DesiredStatus};
use crate::process_monitor::Pid;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("no process record for '{0}'")]
    NotFound(String),
    #[error("lock poisoned")]
    LockPoisoned,
}

/// Serializes loop and imperative work on a single application name.
pub type OperationGate = Arc<tokio::sync::Mutex<()>>;

/// Last-known reconciliation state of one application.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub executable_path: PathBuf,
    pub desired_status: DesiredStatus,
    pub state: ObservedState,
    pub last_restart_attempt: Option<Instant>,
}

impl ProcessRecord {
    pub fn new(spec: &ApplicationSpec) -> Self {
        Self {
            executable_path: spec.executable_path.clone(),
            desired_status: spec.status,
            state: ObservedState::Unknown,
            last_restart_attempt: None,
        }
    }

    pub fn observed_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn observed_pid(&self) -> Option<Pid> {
        self.state.pid()
    }

    pub fn observe(&mut self, probed: Option<Pid>) -> Transition {
        self.state.observe(probed)
    }

    pub fn cooldown_elapsed(&self, now: Instant, cooldown: Duration) -> bool {
        match self.last_restart_attempt {
            Some(last) => now.saturating_duration_since(last) >= cooldown,
            None => true,
        }
    }

    /// Stamp a restart attempt if the cool-down allows one.
    pub fn claim_restart(&mut self, now: Instant, cooldown: Duration) -> bool {
        if !self.cooldown_elapsed(now, cooldown) {
            return false;
        }
        self.last_restart_attempt = Some(now);
        true
    }
}

struct Entry {
    record: ProcessRecord,
    gate: OperationGate,
}

/// In-memory record table, keyed by application name. Not persisted.
pub struct RecordStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutex 락 획득 헬퍼 (보일러플레이트 제거)
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, ProcessError> {
        self.entries.lock().map_err(|e| {
            tracing::error!("RecordStore lock poisoned: {}", e);
            ProcessError::LockPoisoned
        })
    }

    /// Reconcile the table with a configuration snapshot.
    ///
    /// Names kept with the same executable keep their observed state and restart
    /// stamp; desired status always comes from the snapshot. A changed executable,
    /// or a name that is new or reappearing, gets a fresh record. Names missing
    /// from the snapshot are dropped and returned.
    pub fn sync(&self, specs: &[ApplicationSpec]) -> Result<Vec<(String, ProcessRecord)>, ProcessError> {
        let mut entries = self.lock()?;
        let mut previous = std::mem::take(&mut *entries);

        for spec in specs {
            let entry = match previous.remove(&spec.name) {
                Some(mut entry) => {
                    if entry.record.executable_path == spec.executable_path {
                        entry.record.desired_status = spec.status;
                    } else {
                        tracing::info!(
                            "Executable of '{}' changed to {}, resetting record",
                            spec.name,
                            spec.executable_path.display()
                        );
                        entry.record = ProcessRecord::new(spec);
                    }
                    entry
                }
                None => Entry {
                    record: ProcessRecord::new(spec),
                    gate: OperationGate::default(),
                },
            };
            entries.insert(spec.name.clone(), entry);
        }

        let removed: Vec<(String, ProcessRecord)> = previous
            .into_iter()
            .map(|(name, entry)| (name, entry.record))
            .collect();
        for (name, _) in &removed {
            tracing::info!("Application '{}' removed from configuration", name);
        }
        tracing::debug!("Record store synced with {} applications", entries.len());
        Ok(removed)
    }

    /// Snapshot of a record.
    pub fn get(&self, name: &str) -> Result<ProcessRecord, ProcessError> {
        let entries = self.lock()?;
        entries
            .get(name)
            .map(|e| e.record.clone())
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))
    }

    pub fn gate(&self, name: &str) -> Result<OperationGate, ProcessError> {
        let entries = self.lock()?;
        entries
            .get(name)
            .map(|e| e.gate.clone())
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))
    }

    /// Mutate a record under the table lock. Keep `f` short and non-blocking.
    pub fn update<R>(&self, name: &str, f: impl FnOnce(&mut ProcessRecord) -> R) -> Result<R, ProcessError> {
        let mut entries = self.lock()?;
        entries
            .get_mut(name)
            .map(|e| f(&mut e.record))
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))
    }
}
