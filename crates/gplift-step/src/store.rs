//! Crash-safe persistence of substep outcomes.
//!
//! The whole table lives in one JSON file,
//! `{ "INITIALIZE": { "CHECK_UPGRADE": "FAILED" } }`, rewritten atomically
//! on every change.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use gplift_core::{FileSystem, Status, StepName, Substep, atomically_write};
use tracing::debug;

use crate::error::{StepError, StepResult};

pub type StepStatuses = BTreeMap<Substep, Status>;
pub type StatusTable = BTreeMap<StepName, StepStatuses>;

/// Where substep outcomes are recorded.
pub trait SubstepStore: Send + Sync {
    /// `Unknown` when either the step or the substep has no entry.
    fn read(&self, step: StepName, substep: Substep) -> StepResult<Status>;

    /// Every recorded substep of `step`; empty when the step has no entry.
    fn read_step(&self, step: StepName) -> StepResult<StepStatuses>;

    fn write(&self, step: StepName, substep: Substep, status: Status) -> StepResult<()>;
}

/// [`SubstepStore`] over a JSON status file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> StepResult<StatusTable> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(StatusTable::new()),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&data).map_err(|source| StepError::StatusFile {
            path: self.path.display().to_string(),
            source,
        })
    }
}

impl SubstepStore for FileStore {
    fn read(&self, step: StepName, substep: Substep) -> StepResult<Status> {
        Ok(self
            .load()?
            .get(&step)
            .and_then(|substeps| substeps.get(&substep))
            .copied()
            .unwrap_or_default())
    }

    fn read_step(&self, step: StepName) -> StepResult<StepStatuses> {
        Ok(self.load()?.remove(&step).unwrap_or_default())
    }

    fn write(&self, step: StepName, substep: Substep, status: Status) -> StepResult<()> {
        let mut table = self.load()?;
        table.entry(step).or_default().insert(substep, status);

        let data = serde_json::to_vec_pretty(&table).map_err(|source| StepError::StatusFile {
            path: self.path.display().to_string(),
            source,
        })?;
        atomically_write(&self.path, &data)?;
        debug!(%step, %substep, %status, "recorded substep status");
        Ok(())
    }
}

/// Creates the status file containing `{}` unless it already exists.
///
/// Concurrent callers race on an exclusive create; losing the race is fine.
pub fn bootstrap_status_file(fs: &dyn FileSystem, path: &Path) -> StepResult<()> {
    match fs.create_exclusive(path) {
        Ok(mut file) => {
            file.write_all(b"{}")?;
            file.sync_all()?;
            debug!(path = %path.display(), "created status file");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: std::sync::Mutex<StatusTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, step: StepName, substep: Substep, status: Status) -> Self {
        if let Ok(mut table) = self.table.lock() {
            table.entry(step).or_default().insert(substep, status);
        }
        self
    }

    fn table(&self) -> std::sync::MutexGuard<'_, StatusTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SubstepStore for MemoryStore {
    fn read(&self, step: StepName, substep: Substep) -> StepResult<Status> {
        Ok(self
            .table()
            .get(&step)
            .and_then(|s| s.get(&substep))
            .copied()
            .unwrap_or_default())
    }

    fn read_step(&self, step: StepName) -> StepResult<StepStatuses> {
        Ok(self.table().get(&step).cloned().unwrap_or_default())
    }

    fn write(&self, step: StepName, substep: Substep, status: Status) -> StepResult<()> {
        self.table().entry(step).or_default().insert(substep, status);
        Ok(())
    }
}
