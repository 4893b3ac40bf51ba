//! The step engine.
//!
//! A [`Step`] runs substeps in order. Each substep's outcome is persisted
//! before and after its body runs, so a re-run resumes where the last one
//! stopped: completed substeps are reported and skipped, and a substep found
//! still `RUNNING` halts the step for manual cleanup.
//!
//! The first failure is latched. Later substeps do not run; the client is
//! told they were skipped.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gplift_core::paths::status_file;
use gplift_core::{
    ErrorList, Message, MessageSender, OsFs, OutStreams, SharedStreams, Status, StepName, Substep, SubstepStatus,
};
use tracing::{debug, info, warn};

use crate::error::{StepError, StepResult};
use crate::store::{FileStore, SubstepStore, bootstrap_status_file};
use crate::stream::Multiplexer;

/// Returned by a substep body that decided there is nothing to do.
///
/// The substep is persisted as `COMPLETE` and reported as `SKIPPED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipSubstep;

impl fmt::Display for SkipSubstep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("skip substep")
    }
}

impl std::error::Error for SkipSubstep {}

/// Path of the per-step log inside the state directory.
pub fn step_log_path(state_dir: &Path, step: StepName) -> PathBuf {
    state_dir.join(format!("{}.log", step.as_str().to_lowercase()))
}

pub struct Step {
    name: StepName,
    sender: Arc<dyn MessageSender>,
    store: Arc<dyn SubstepStore>,
    streams: Multiplexer,
    err: Option<StepError>,
}

impl Step {
    pub fn new(
        name: StepName,
        sender: Arc<dyn MessageSender>,
        store: Arc<dyn SubstepStore>,
        streams: Multiplexer,
    ) -> Self {
        Self {
            name,
            sender,
            store,
            streams,
            err: None,
        }
    }

    /// Opens the step log and status file under `state_dir` and starts the
    /// step.
    pub fn begin(
        state_dir: &Path,
        name: StepName,
        sender: Arc<dyn MessageSender>,
    ) -> StepResult<Self> {
        fs::create_dir_all(state_dir)?;

        let log_path = step_log_path(state_dir, name);
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&log_path)?;
        write!(log, "\n{} in progress.\n", name.title())?;

        let status_path = status_file(state_dir);
        bootstrap_status_file(&OsFs, &status_path)?;

        info!(step = %name, log = %log_path.display(), "beginning step");
        let streams = Multiplexer::to_file(log, Some(sender.clone()));
        Ok(Self::new(
            name,
            sender,
            Arc::new(FileStore::new(status_path)),
            streams,
        ))
    }

    pub fn name(&self) -> StepName {
        self.name
    }

    /// The step's output pair, for work done outside a substep.
    pub fn streams(&self) -> SharedStreams {
        Arc::new(self.streams.clone())
    }

    /// The latched error, if any substep has failed.
    pub fn err(&self) -> Option<&StepError> {
        self.err.as_ref()
    }

    pub async fn run<F, Fut>(&mut self, substep: Substep, body: F)
    where
        F: FnOnce(SharedStreams) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.run_substep(substep, false, body).await;
    }

    /// Like [`run`](Self::run), but executes even when the substep is
    /// already `COMPLETE`.
    pub async fn always_run<F, Fut>(&mut self, substep: Substep, body: F)
    where
        F: FnOnce(SharedStreams) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.run_substep(substep, true, body).await;
    }

    /// Runs the substep only when `condition` holds; otherwise reports it as
    /// skipped without touching the store.
    pub async fn run_conditionally<F, Fut>(&mut self, substep: Substep, condition: bool, body: F)
    where
        F: FnOnce(SharedStreams) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if !condition {
            self.send(substep, Status::Skipped);
            return;
        }
        self.run_substep(substep, false, body).await;
    }

    /// Runs work that has no substep of its own. Failures latch like a
    /// substep failure, but nothing is persisted or reported.
    pub async fn run_internal<F, Fut>(&mut self, body: F)
    where
        F: FnOnce(SharedStreams) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self.err.is_some() {
            return;
        }
        if let Err(err) = body(self.streams()).await {
            self.err = Some(StepError::Internal(err));
        }
    }

    /// Closes the step log, then returns the latched error if there is one.
    pub fn finish(self) -> StepResult<()> {
        let closed = self.streams.close();
        if let Some(err) = self.err {
            return Err(err);
        }
        closed?;
        info!(step = %self.name, "step finished");
        Ok(())
    }

    async fn run_substep<F, Fut>(&mut self, substep: Substep, always_run: bool, body: F)
    where
        F: FnOnce(SharedStreams) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self.err.is_some() {
            self.send(substep, Status::Skipped);
            return;
        }

        if let Err(err) = self.execute(substep, always_run, body).await {
            warn!(step = %self.name, %substep, "substep failed: {err}");
            self.err = Some(err);
        }
    }

    async fn execute<F, Fut>(&self, substep: Substep, always_run: bool, body: F) -> StepResult<()>
    where
        F: FnOnce(SharedStreams) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        match self.store.read(self.name, substep)? {
            Status::Running => {
                self.send(substep, Status::Failed);
                return Err(StepError::SubstepRunning(substep));
            }
            Status::Complete if !always_run => {
                debug!(step = %self.name, %substep, "already complete");
                self.send(substep, Status::Complete);
                return Ok(());
            }
            _ => {}
        }

        self.print(&format!("\nStarting {substep}...\n\n"));
        let started = Instant::now();

        self.store.write(self.name, substep, Status::Running)?;
        self.send(substep, Status::Running);

        let result = body(self.streams()).await;
        let reported = match &result {
            Ok(()) => Status::Complete,
            Err(err) if err.is::<SkipSubstep>() => Status::Skipped,
            Err(_) => Status::Failed,
        };
        let persisted = match reported {
            Status::Skipped => Status::Complete,
            other => other,
        };

        // The outcome is reported even when it could not be persisted.
        let written = self.store.write(self.name, substep, persisted);
        self.send(substep, reported);
        let elapsed = Duration::from_millis(started.elapsed().as_millis() as u64);
        self.print(&format!(
            "\n{substep} took {}\n\n",
            humantime::format_duration(elapsed)
        ));

        let failed = match result {
            Err(error) if reported == Status::Failed => Some(StepError::Substep { substep, error }),
            _ => None,
        };
        ErrorList::fold(failed.into_iter().chain(written.err()))
    }

    /// Progress is fire-and-forget; the client may be gone.
    fn send(&self, substep: Substep, status: Status) {
        let message = Message::Status(SubstepStatus {
            step: self.name,
            substep,
            status,
        });
        if let Err(err) = self.sender.send(message) {
            debug!(step = %self.name, %substep, %status, "status not delivered: {err}");
        }
    }

    fn print(&self, text: &str) {
        let mut out = self.streams.stdout();
        if let Err(err) = out.write_all(text.as_bytes()) {
            warn!(step = %self.name, "writing step log: {err}");
        }
    }
}

/// Whether `substep` of `step` has ever been started, according to the
/// status file in `state_dir`.
pub fn has_run(state_dir: &Path, step: StepName, substep: Substep) -> StepResult<bool> {
    let status = FileStore::new(status_file(state_dir)).read(step, substep)?;
    Ok(status != Status::Unknown)
}
