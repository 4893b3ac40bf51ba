//! `initialize`: record the source, build an intermediate target cluster
//! beside it, and check that the upgrade can proceed.

use std::sync::Arc;

use gplift_cluster::{
    Cluster, ConnectionConfig, Destination, check_active_connections, local_version, tablespaces_from_db,
};
use gplift_core::{ErrorList, MessageSender, SharedStreams, StepName, Substep};
use gplift_step::Step;
use tracing::{error, info};

use crate::agents::fan_out;
use crate::commands::{COORDINATOR_BACKUP, CoordinatorUpgrade, catalog_version, init_target_cluster, rsync_coordinator_data_dir};
use crate::error::{HubError, HubResult};
use crate::hub::Hub;
use crate::plan::{assign_datadirs_and_ports, write_gpinitsystem_config};
use crate::versions::{DatabaseVersions, ToolVersions, ensure_versions_match};

impl Hub {
    pub async fn initialize(&mut self, sender: Arc<dyn MessageSender>) -> HubResult<()> {
        let mut step = Step::begin(&self.state_dir, StepName::Initialize, sender)?;

        step.run_internal(|_| self.check_installed_versions()).await;
        step.run(Substep::SavingSourceClusterConfig, |_| self.save_source_cluster_config())
            .await;
        step.run_internal(|_| self.check_host_versions()).await;
        step.run(Substep::CheckActiveConnections, |_| self.check_source_connections())
            .await;
        step.run(Substep::GenerateTargetConfig, |_| self.generate_target_config())
            .await;
        step.run(Substep::InitTargetCluster, |streams| self.create_intermediate(streams))
            .await;
        step.run(Substep::ShutdownTargetCluster, |streams| self.stop_intermediate(streams))
            .await;
        step.run(Substep::BackupTargetCoordinator, |streams| {
            self.backup_target_coordinator(streams)
        })
        .await;
        step.always_run(Substep::CheckUpgrade, |streams| self.check_upgrade(streams))
            .await;

        finish(step)
    }

    /// Both installations must be versions this tool can upgrade between.
    async fn check_installed_versions(&self) -> anyhow::Result<()> {
        let launcher = self.launcher.as_ref();
        let source = local_version(launcher, &self.config.source_gphome).await?;
        let target = local_version(launcher, &self.config.target_gphome).await?;
        info!(%source, %target, "installed versions");
        self.config.gate.verify(&source, &target)?;
        Ok(())
    }

    async fn save_source_cluster_config(&mut self) -> anyhow::Result<()> {
        let version = local_version(self.launcher.as_ref(), &self.config.source_gphome).await?;
        let connection = ConnectionConfig::new(version, self.config.source_port).utility_mode();
        let catalog = self.connect(&connection).await?;

        let tablespaces = tablespaces_from_db(catalog.as_ref(), &self.config.tablespaces_mapping_file).await?;
        let source = Cluster::from_database(catalog.as_ref(), &self.config.source_gphome, Destination::Source)
            .await?
            .with_tablespaces(tablespaces);
        let plan = assign_datadirs_and_ports(&source, self.config.ports.clone(), self.config.upgrade_id)?;

        info!(
            coordinator = %source.coordinator_datadir().display(),
            segments = source.content_ids().len(),
            "saving source cluster configuration"
        );
        self.config.source = Some(source);
        self.config.plan = Some(plan);
        self.save_config()?;
        Ok(())
    }

    /// Every agent host runs this gplift and the same target installation.
    async fn check_host_versions(&self) -> anyhow::Result<()> {
        let hosts = self.agent_hosts()?;
        let tools = ToolVersions {
            launcher: self.launcher.clone(),
            tool_path: self.config.tool_path.clone(),
        };
        let target = DatabaseVersions {
            launcher: self.launcher.clone(),
            gphome: self.config.target_gphome.clone(),
            label: "target cluster".to_string(),
        };

        ensure_versions_match(&hosts, Arc::new(tools)).await?;
        ensure_versions_match(&hosts, Arc::new(target)).await?;
        Ok(())
    }

    async fn check_source_connections(&self) -> anyhow::Result<()> {
        let source = self.config.source()?;
        let catalog = self.connect(&source.connection()).await?;
        check_active_connections(catalog.as_ref(), source).await?;
        Ok(())
    }

    async fn generate_target_config(&self) -> anyhow::Result<()> {
        let source = self.config.source()?;
        let catalog = self.connect(&source.connection().utility_mode()).await?;
        let path = write_gpinitsystem_config(
            catalog.as_ref(),
            self.config.plan()?,
            self.config.use_hba_hostnames,
            &self.state_dir,
        )
        .await?;
        info!(path = %path.display(), "wrote gpinitsystem configuration");
        Ok(())
    }

    async fn create_intermediate(&mut self, streams: SharedStreams) -> anyhow::Result<()> {
        let launcher = self.launcher.as_ref();
        let gphome = self.config.target_gphome.clone();
        let version = local_version(launcher, &gphome).await?;
        let plan = self.config.plan()?.clone();

        init_target_cluster(
            launcher,
            streams,
            &gphome,
            &plan.coordinator.datadir,
            plan.coordinator.port,
            &self.state_dir.join(crate::plan::GPINITSYSTEM_CONFIG),
            &version,
        )
        .await?;
        let catalog_version = catalog_version(launcher, &gphome, &plan.coordinator.datadir).await?;

        let intermediate = plan
            .intermediate_cluster(&gphome, version)?
            .with_catalog_version(catalog_version);
        self.config.intermediate = Some(intermediate);
        self.save_config()?;
        Ok(())
    }

    pub(crate) async fn stop_intermediate(&self, streams: SharedStreams) -> anyhow::Result<()> {
        self.config
            .intermediate()?
            .stop(self.launcher.as_ref(), self.fs.as_ref(), streams)
            .await?;
        Ok(())
    }

    /// Keeps a pristine copy of the new coordinator; every `pg_upgrade` run
    /// starts from it.
    async fn backup_target_coordinator(&self, streams: SharedStreams) -> anyhow::Result<()> {
        rsync_coordinator_data_dir(
            self.launcher.as_ref(),
            streams,
            self.config.intermediate()?.coordinator_datadir(),
            &self.state_dir.join(COORDINATOR_BACKUP),
        )
        .await?;
        Ok(())
    }

    /// `pg_upgrade --check` on the coordinator and every primary. Problems
    /// from both are reported together.
    async fn check_upgrade(&self, streams: SharedStreams) -> anyhow::Result<()> {
        let coordinator = CoordinatorUpgrade {
            state_dir: &self.state_dir,
            source: self.config.source()?,
            intermediate: self.config.intermediate()?,
            check_only: true,
            link_mode: self.config.link_mode,
            tablespace_file: None,
        };

        let mut errors = Vec::new();
        if let Err(err) = coordinator.run(self.launcher.as_ref(), streams.clone()).await {
            errors.push(err);
        }
        let requests = self.upgrade_primaries_requests(true)?;
        if let Err(err) = fan_out(self.agents.clone(), requests, streams.as_ref()).await {
            errors.push(err);
        }
        ErrorList::fold::<HubError>(errors)?;
        Ok(())
    }
}

/// Closes the step, logging the failure that stopped it.
pub(crate) fn finish(step: Step) -> HubResult<()> {
    let name = step.name();
    step.finish().map_err(|err| {
        error!(step = %name, "step failed: {err}");
        HubError::from(err)
    })
}
