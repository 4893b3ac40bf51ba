//! `execute`: stop the source and upgrade the coordinator and primaries into
//! the intermediate cluster.

use std::sync::Arc;

use gplift_core::{MessageSender, SharedStreams, StepName, Substep};
use gplift_step::Step;
use tracing::info;

use crate::agents::fan_out;
use crate::commands::{CoordinatorUpgrade, TABLESPACES_DIR, UPGRADED_COORDINATOR_BACKUP, contents_of, copy_to_hosts};
use crate::error::HubResult;
use crate::hub::Hub;
use crate::initialize::finish;

impl Hub {
    pub async fn execute(&mut self, sender: Arc<dyn MessageSender>) -> HubResult<()> {
        let mut step = Step::begin(&self.state_dir, StepName::Execute, sender)?;

        step.run(Substep::ShutdownSourceCluster, |streams| self.stop_source(streams))
            .await;
        step.run(Substep::UpgradeCoordinator, |streams| self.upgrade_coordinator(streams))
            .await;
        step.run(Substep::CopyCoordinator, |streams| self.copy_coordinator(streams))
            .await;
        step.run(Substep::UpgradePrimaries, |streams| self.upgrade_primaries(streams))
            .await;
        step.run(Substep::StartTargetCluster, |streams| self.start_intermediate(streams))
            .await;

        finish(step)
    }

    async fn stop_source(&self, streams: SharedStreams) -> anyhow::Result<()> {
        self.config
            .source()?
            .stop(self.launcher.as_ref(), self.fs.as_ref(), streams)
            .await?;
        Ok(())
    }

    async fn upgrade_coordinator(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let upgrade = CoordinatorUpgrade {
            state_dir: &self.state_dir,
            source: self.config.source()?,
            intermediate: self.config.intermediate()?,
            check_only: false,
            link_mode: self.config.link_mode,
            tablespace_file: Some(self.config.tablespaces_mapping_file.clone()),
        };
        upgrade.run(self.launcher.as_ref(), streams).await?;
        Ok(())
    }

    /// Ships the upgraded coordinator, and any user tablespaces with their
    /// mapping file, to every primary host.
    async fn copy_coordinator(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let source = self.config.source()?;
        let intermediate = self.config.intermediate()?;
        let hosts = self.agent_hosts()?;

        copy_to_hosts(
            self.launcher.as_ref(),
            streams.as_ref(),
            &[contents_of(intermediate.coordinator_datadir())],
            &self.state_dir.join(UPGRADED_COORDINATOR_BACKUP),
            &hosts,
        )
        .await?;

        if source.tablespaces.is_empty() {
            return Ok(());
        }
        let mut sources = vec![self.config.tablespaces_mapping_file.to_string_lossy().into_owned()];
        sources.extend(
            source
                .tablespaces
                .user_defined(gplift_cluster::COORDINATOR_DBID)
                .map(|(_, info)| info.location.to_string_lossy().into_owned()),
        );
        info!(sources = sources.len(), hosts = hosts.len(), "copying coordinator tablespaces");
        copy_to_hosts(
            self.launcher.as_ref(),
            streams.as_ref(),
            &sources,
            &self.state_dir.join(TABLESPACES_DIR),
            &hosts,
        )
        .await?;
        Ok(())
    }

    async fn upgrade_primaries(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let requests = self.upgrade_primaries_requests(false)?;
        fan_out(self.agents.clone(), requests, streams.as_ref()).await?;
        Ok(())
    }

    async fn start_intermediate(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let intermediate = self.config.intermediate()?;
        intermediate.start(self.launcher.as_ref(), streams).await?;
        self.wait_for_ready(intermediate).await?;
        Ok(())
    }
}
