//! `revert`: discard the intermediate cluster and bring the source back.
//!
//! Only possible while the source has a mirror for every primary and a
//! standby; those are what the source is restored from after link mode.

use std::path::PathBuf;
use std::sync::Arc;

use gplift_cluster::COORDINATOR_DBID;
use gplift_core::{MessageSender, SharedStreams, StepName, Substep};
use gplift_step::{SkipSubstep, Step};
use gplift_upgrade::{POSTGRES_FILES, delete_directories, delete_tablespace_directories, restore_pg_control, tablespace_path};
use tracing::{debug, info};

use crate::agents::{AgentRequest, fan_out};
use crate::error::{HubError, HubResult};
use crate::hub::Hub;
use crate::initialize::finish;

impl Hub {
    pub async fn revert(&mut self, sender: Arc<dyn MessageSender>) -> HubResult<()> {
        if !self.config.source()?.has_all_mirrors_and_standby() {
            return Err(HubError::NoMirrorsOrStandby);
        }

        let mut step = Step::begin(&self.state_dir, StepName::Revert, sender)?;

        let intermediate_running = self.intermediate_running().await;
        step.run_conditionally(Substep::ShutdownTargetCluster, intermediate_running, |streams| {
            self.stop_intermediate(streams)
        })
        .await;
        step.run(Substep::DeletePrimaryDatadirs, |streams| self.delete_primary_datadirs(streams))
            .await;
        step.run(Substep::DeleteCoordinatorDatadir, |streams| {
            self.delete_coordinator_datadir(streams)
        })
        .await;
        step.run(Substep::DeleteTablespaces, |streams| self.delete_tablespaces(streams))
            .await;
        step.run_conditionally(Substep::RestorePgControl, self.config.link_mode, |streams| {
            self.restore_source_pg_control(streams)
        })
        .await;
        step.run(Substep::ArchiveLogDirectories, |streams| self.archive_log_directories(streams))
            .await;
        step.run(Substep::DeleteSegmentStatedirs, |streams| self.delete_segment_state_dirs(streams))
            .await;

        let source_running = self.source_running().await;
        step.run_conditionally(Substep::StartSourceCluster, !source_running, |streams| {
            self.start_source(streams)
        })
        .await;

        finish(step)
    }

    /// A probe failure counts as stopped; the shutdown would fail anyway.
    async fn intermediate_running(&self) -> bool {
        let Ok(intermediate) = self.config.intermediate() else {
            return false;
        };
        intermediate
            .is_coordinator_running(self.launcher.as_ref(), self.fs.as_ref())
            .await
            .unwrap_or_else(|err| {
                debug!("probing intermediate coordinator: {err}");
                false
            })
    }

    async fn source_running(&self) -> bool {
        let Ok(source) = self.config.source() else {
            return false;
        };
        source
            .is_coordinator_running(self.launcher.as_ref(), self.fs.as_ref())
            .await
            .unwrap_or_else(|err| {
                debug!("probing source coordinator: {err}");
                false
            })
    }

    async fn delete_primary_datadirs(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let plan = self.config.plan()?;
        let datadirs = plan
            .primaries
            .iter()
            .map(|s| (s.hostname.as_str(), s.datadir.clone()));
        let requests = Hub::per_host(datadirs, |datadirs| AgentRequest::DeleteDataDirectories { datadirs });
        fan_out(self.agents.clone(), requests, streams.as_ref()).await?;
        Ok(())
    }

    async fn delete_coordinator_datadir(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let coordinator = &self.config.plan()?.coordinator;
        delete_directories(
            self.fs.as_ref(),
            std::slice::from_ref(&coordinator.datadir),
            &POSTGRES_FILES,
            &coordinator.hostname,
            streams.as_ref(),
        )?;
        Ok(())
    }

    /// Removes the target's `GPDB_<major>_<catalog>` directories from every
    /// user tablespace. Nothing exists to delete when the intermediate
    /// cluster was never created.
    async fn delete_tablespaces(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let source = self.config.source()?;
        let Some(intermediate) = self.config.intermediate.as_ref() else {
            return Err(SkipSubstep.into());
        };
        if source.tablespaces.is_empty() {
            return Err(SkipSubstep.into());
        }
        let major = intermediate.version.major;
        let catalog_version = intermediate.catalog_version.as_str();

        let coordinator: Vec<PathBuf> = source
            .tablespaces
            .user_defined(COORDINATOR_DBID)
            .map(|(_, info)| tablespace_path(&info.location, COORDINATOR_DBID, major, catalog_version))
            .collect();
        delete_tablespace_directories(
            self.fs.as_ref(),
            &coordinator,
            source.coordinator_hostname(),
            streams.as_ref(),
        )?;

        let primaries = source.select(|s| s.is_primary()).flat_map(|seg| {
            source
                .tablespaces
                .user_defined(seg.dbid)
                .map(move |(_, info)| {
                    (
                        seg.hostname.as_str(),
                        tablespace_path(&info.location, seg.dbid, major, catalog_version),
                    )
                })
        });
        let requests = Hub::per_host(primaries, |dirs| AgentRequest::DeleteTablespaces { dirs });
        info!(hosts = requests.len(), "deleting target tablespace directories");
        fan_out(self.agents.clone(), requests, streams.as_ref()).await?;
        Ok(())
    }

    /// After link mode the source's control files were disabled by
    /// pg_upgrade; put them back on the coordinator and every primary.
    async fn restore_source_pg_control(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let source = self.config.source()?;
        restore_pg_control(self.fs.as_ref(), source.coordinator_datadir(), streams.as_ref())?;

        let datadirs = source
            .select(|s| s.is_primary())
            .map(|s| (s.hostname.as_str(), s.datadir.clone()));
        let requests = Hub::per_host(datadirs, |datadirs| AgentRequest::RestorePgControl { datadirs });
        fan_out(self.agents.clone(), requests, streams.as_ref()).await?;
        Ok(())
    }

    async fn start_source(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let source = self.config.source()?;
        source.start(self.launcher.as_ref(), streams).await?;
        self.wait_for_ready(source).await?;
        Ok(())
    }
}
