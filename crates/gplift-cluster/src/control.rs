//! Starting and stopping a cluster, and probing its coordinator.

use gplift_core::{Command, CoreError, FileSystem, Launcher, SharedStreams};
use tracing::{debug, info};

use crate::cluster::Cluster;
use crate::error::{ClusterError, ClusterResult};
use crate::runner::ClusterRunner;

const POSTMASTER_PID: &str = "postmaster.pid";

impl Cluster {
    pub fn runner<'a>(&self, launcher: &'a dyn Launcher, streams: SharedStreams) -> ClusterRunner<'a> {
        ClusterRunner::for_cluster(launcher, self, streams)
    }

    pub async fn start(&self, launcher: &dyn Launcher, streams: SharedStreams) -> ClusterResult<()> {
        self.control(launcher, streams, "start", "gpstart", false).await
    }

    pub async fn start_coordinator_only(
        &self,
        launcher: &dyn Launcher,
        streams: SharedStreams,
    ) -> ClusterResult<()> {
        self.control(launcher, streams, "start", "gpstart", true).await
    }

    /// Stops the cluster. Fails with [`ClusterError::CoordinatorStopped`]
    /// when the coordinator is not running.
    pub async fn stop(
        &self,
        launcher: &dyn Launcher,
        fs: &dyn FileSystem,
        streams: SharedStreams,
    ) -> ClusterResult<()> {
        if !self.is_coordinator_running(launcher, fs).await? {
            return Err(ClusterError::CoordinatorStopped);
        }
        self.control(launcher, streams, "stop", "gpstop", false).await
    }

    pub async fn stop_coordinator_only(
        &self,
        launcher: &dyn Launcher,
        fs: &dyn FileSystem,
        streams: SharedStreams,
    ) -> ClusterResult<()> {
        if !self.is_coordinator_running(launcher, fs).await? {
            return Err(ClusterError::CoordinatorStopped);
        }
        self.control(launcher, streams, "stop", "gpstop", true).await
    }

    async fn control(
        &self,
        launcher: &dyn Launcher,
        streams: SharedStreams,
        action: &'static str,
        utility: &str,
        coordinator_only: bool,
    ) -> ClusterResult<()> {
        let datadir = self.coordinator_datadir().to_string_lossy().into_owned();
        let mut args = vec!["-a", "-d", datadir.as_str()];
        if coordinator_only {
            args.push("-m");
        }

        info!(destination = %self.destination, action, coordinator_only, "controlling cluster");
        self.runner(launcher, streams)
            .run(utility, &args)
            .await
            .map_err(|source| ClusterError::Control {
                action,
                destination: self.destination,
                source,
            })
    }

    /// Whether the coordinator's postmaster is alive, according to
    /// `pgrep -F <datadir>/postmaster.pid`.
    ///
    /// A missing pidfile means not running; any other failure to stat it is
    /// an error.
    pub async fn is_coordinator_running(&self, launcher: &dyn Launcher, fs: &dyn FileSystem) -> ClusterResult<bool> {
        let pidfile = self.coordinator_datadir().join(POSTMASTER_PID);
        let exists = fs
            .exists(&pidfile)
            .map_err(|err| ClusterError::RunningCheck(err.into()))?;
        if !exists {
            debug!(path = %pidfile.display(), "no postmaster pidfile");
            return Ok(false);
        }

        let cmd = Command::new("pgrep").arg("-F").arg(pidfile.to_string_lossy());
        let output = launcher.output(&cmd).await.map_err(ClusterError::RunningCheck)?;
        match output.exit.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(ClusterError::RunningCheck(CoreError::Exit {
                command: cmd.to_string(),
                exit: output.exit,
                output: output.combined(),
            })),
        }
    }
}
