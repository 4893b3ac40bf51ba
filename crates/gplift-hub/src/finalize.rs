//! `finalize`: move the upgraded cluster into the source's data directories
//! and ports, start it, and clean up.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Local;
use gplift_core::{MessageSender, SharedStreams, StepName, Substep};
use gplift_step::Step;
use gplift_upgrade::{archive_directory_name, archive_source};
use tracing::info;

use crate::agents::{AgentRequest, ConfUpdate, fan_out};
use crate::commands::{port_pattern, port_replacement, update_configuration_file};
use crate::error::HubResult;
use crate::handlers::archive_log_directory;
use crate::hub::Hub;
use crate::initialize::finish;

const POSTGRESQL_CONF: &str = "postgresql.conf";

impl Hub {
    pub async fn finalize(&mut self, sender: Arc<dyn MessageSender>) -> HubResult<()> {
        let mut step = Step::begin(&self.state_dir, StepName::Finalize, sender)?;

        step.run(Substep::ShutdownTargetCluster, |streams| self.stop_intermediate(streams))
            .await;
        step.run(Substep::UpdateDataDirectories, |streams| self.update_data_directories(streams))
            .await;
        step.run(Substep::UpdateTargetConfFiles, |streams| self.update_target_conf_files(streams))
            .await;
        step.run(Substep::StartTargetCluster, |streams| self.start_target(streams))
            .await;
        step.run(Substep::ArchiveLogDirectories, |streams| self.archive_log_directories(streams))
            .await;
        step.run(Substep::DeleteSegmentStatedirs, |streams| self.delete_segment_state_dirs(streams))
            .await;

        finish(step)
    }

    /// Archives the source coordinator and every source primary, moving the
    /// upgraded directories into their places.
    async fn update_data_directories(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let source = self.config.source()?;
        let intermediate = self.config.intermediate()?;

        archive_source(
            self.fs.as_ref(),
            source.coordinator_datadir(),
            intermediate.coordinator_datadir(),
            true,
        )?;

        if self.config.link_mode {
            // Linked primaries share files with the source; its mirrors and
            // standby can no longer be used.
            let datadirs = source
                .select(|s| s.is_mirror() || s.is_standby())
                .map(|s| (s.hostname.as_str(), s.datadir.clone()));
            let requests = Hub::per_host(datadirs, |datadirs| AgentRequest::DeleteDataDirectories { datadirs });
            fan_out(self.agents.clone(), requests, streams.as_ref()).await?;
        }

        fan_out(self.agents.clone(), self.rename_requests()?, streams.as_ref()).await?;
        Ok(())
    }

    /// Points every upgraded `postgresql.conf` at the source's port.
    async fn update_target_conf_files(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let source = self.config.source()?;
        let intermediate = self.config.intermediate()?;

        update_configuration_file(
            &source.coordinator_datadir().join(POSTGRESQL_CONF),
            &port_pattern(intermediate.coordinator_port()),
            &port_replacement(source.coordinator_port()),
        )?;

        let mut by_host: BTreeMap<String, Vec<ConfUpdate>> = BTreeMap::new();
        for seg in source.select(|s| s.is_primary()) {
            let Some(temporary) = intermediate.primaries.get(&seg.content_id) else {
                continue;
            };
            by_host.entry(seg.hostname.clone()).or_default().push(ConfUpdate {
                path: seg.datadir.join(POSTGRESQL_CONF),
                pattern: port_pattern(temporary.port),
                replacement: port_replacement(seg.port),
            });
        }
        let requests = by_host
            .into_iter()
            .map(|(host, files)| (host, AgentRequest::UpdateConfiguration { files }))
            .collect();
        fan_out(self.agents.clone(), requests, streams.as_ref()).await?;
        Ok(())
    }

    async fn start_target(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let target = self.config.target()?;
        target.start(self.launcher.as_ref(), streams).await?;
        self.wait_for_ready(&target).await?;
        Ok(())
    }

    /// Moves the log directory on every host aside under a name that
    /// records the upgrade id and time.
    pub(crate) async fn archive_log_directories(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let name = archive_directory_name(self.config.upgrade_id, &Local::now());
        let new_dir = match self.log_dir.parent() {
            Some(parent) => parent.join(&name),
            None => self.log_dir.with_file_name(&name),
        };
        info!(to = %new_dir.display(), "archiving log directories");

        archive_log_directory(self.fs.as_ref(), &self.log_dir, &new_dir)?;
        let requests = Hub::broadcast(self.remote_hosts()?, AgentRequest::ArchiveLogDirectory { new_dir });
        fan_out(self.agents.clone(), requests, streams.as_ref()).await?;
        Ok(())
    }

    pub(crate) async fn delete_segment_state_dirs(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let requests = Hub::broadcast(self.remote_hosts()?, AgentRequest::DeleteStateDirectory);
        fan_out(self.agents.clone(), requests, streams.as_ref()).await?;
        Ok(())
    }
}
