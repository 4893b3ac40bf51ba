//! Resuming a step across process restarts.
//!
//! Each `Step::begin` below stands in for a fresh hub process pointed at the
//! same state directory.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use gplift_core::{Message, MessageSender, Status, StepName, Substep};
use gplift_step::{
    FileStore, LocalWriter, MemoryStore, Multiplexer, Step, StepError, StepResult, StepStatuses, SubstepStore,
};
use tokio::sync::mpsc;

fn channel() -> (Arc<dyn MessageSender>, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<(Substep, Status)> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let Message::Status(s) = message {
            out.push((s.substep, s.status));
        }
    }
    out
}

/// Accepts everything except recording a failure, as when the disk filled
/// up during the substep.
#[derive(Default)]
struct FullDiskStore {
    inner: MemoryStore,
}

impl SubstepStore for FullDiskStore {
    fn read(&self, step: StepName, substep: Substep) -> StepResult<Status> {
        self.inner.read(step, substep)
    }

    fn read_step(&self, step: StepName) -> StepResult<StepStatuses> {
        self.inner.read_step(step)
    }

    fn write(&self, step: StepName, substep: Substep, status: Status) -> StepResult<()> {
        if status == Status::Failed {
            return Err(io::Error::other("disk full").into());
        }
        self.inner.write(step, substep, status)
    }
}

#[tokio::test]
async fn unrecorded_failure_is_still_reported_with_its_cause() {
    let (sender, mut rx) = channel();
    let streams = Multiplexer::new(LocalWriter::Other(Box::new(io::sink())), None);
    let mut step = Step::new(StepName::Execute, sender, Arc::new(FullDiskStore::default()), streams);

    step.run(Substep::UpgradeCoordinator, |_| async {
        Err(anyhow::anyhow!("pg_upgrade exited 1"))
    })
    .await;

    assert_eq!(
        drain(&mut rx),
        vec![
            (Substep::UpgradeCoordinator, Status::Running),
            (Substep::UpgradeCoordinator, Status::Failed),
        ]
    );

    let err = step.finish().unwrap_err();
    assert!(matches!(err, StepError::Multiple(_)), "{err:?}");
    let text = err.to_string();
    assert!(text.starts_with("2 errors occurred:"), "{text}");
    assert!(text.contains("substep \"UPGRADE_COORDINATOR\": pg_upgrade exited 1"), "{text}");
    assert!(text.contains("disk full"), "{text}");
}

#[tokio::test]
async fn rerun_after_failure_resumes_at_failed_substep() {
    let dir = tempfile::tempdir().unwrap();
    let runs = AtomicUsize::new(0);

    // First attempt: the second substep fails.
    let (sender, mut rx) = channel();
    let mut step = Step::begin(dir.path(), StepName::Execute, sender).unwrap();
    step.run(Substep::ShutdownSourceCluster, |_| async {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .await;
    step.run(Substep::UpgradeCoordinator, |_| async {
        Err(anyhow::anyhow!("pg_upgrade exited 1"))
    })
    .await;
    step.run(Substep::CopyCoordinator, |_| async { Ok(()) }).await;
    assert!(step.finish().is_err());
    assert_eq!(
        drain(&mut rx).last(),
        Some(&(Substep::CopyCoordinator, Status::Skipped))
    );

    // Second attempt: the completed substep is reported, not re-run.
    let (sender, mut rx) = channel();
    let mut step = Step::begin(dir.path(), StepName::Execute, sender).unwrap();
    step.run(Substep::ShutdownSourceCluster, |_| async {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .await;
    step.run(Substep::UpgradeCoordinator, |_| async { Ok(()) }).await;
    step.run(Substep::CopyCoordinator, |_| async { Ok(()) }).await;
    step.finish().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        drain(&mut rx),
        vec![
            (Substep::ShutdownSourceCluster, Status::Complete),
            (Substep::UpgradeCoordinator, Status::Running),
            (Substep::UpgradeCoordinator, Status::Complete),
            (Substep::CopyCoordinator, Status::Running),
            (Substep::CopyCoordinator, Status::Complete),
        ]
    );

    let store = FileStore::new(dir.path().join("status.json"));
    let statuses = store.read_step(StepName::Execute).unwrap();
    assert!(statuses.values().all(|s| *s == Status::Complete));

    let log = std::fs::read_to_string(dir.path().join("execute.log")).unwrap();
    assert_eq!(log.matches("Execute in progress.").count(), 2);
    assert!(log.contains("Starting UPGRADE_COORDINATOR..."));
}
