//! The hub: configuration plus the capabilities every pipeline uses.
//!
//! Pipelines live in their own modules as `impl Hub` blocks. This module
//! holds what they share: connecting to a coordinator, waiting for
//! readiness, and building per-host agent requests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gplift_cluster::{
    Catalog, Cluster, ClusterResult, ConnectionConfig, FakeCatalog, PgCatalog, TABLESPACES_MAPPING_FILE,
    wait_for_segments,
};
use gplift_core::{FileSystem, Launcher, OsFs};
use tracing::{debug, info};

use crate::agents::{AgentClient, AgentRequest, AgentSegment, RenameDirectories, SshAgentClient, UpgradePrimaries};
use crate::commands::{TABLESPACES_DIR, UPGRADED_COORDINATOR_BACKUP};
use crate::config::Config;
use crate::error::{HubError, HubResult};

/// How long a freshly started cluster has to report every segment up.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(300);

// ── Connector ──────────────────────────────────────────────────────

/// Opens catalog connections to a coordinator.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> ClusterResult<Arc<dyn Catalog>>;
}

/// Connects over the wire with `tokio-postgres`.
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, config: &ConnectionConfig) -> ClusterResult<Arc<dyn Catalog>> {
        Ok(Arc::new(PgCatalog::connect(config).await?))
    }
}

/// Hands out scripted catalogs by coordinator port.
#[derive(Default)]
pub struct FakeConnector {
    catalogs: BTreeMap<u16, Arc<FakeCatalog>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, port: u16, catalog: FakeCatalog) -> Self {
        self.catalogs.insert(port, Arc::new(catalog));
        self
    }

    pub fn catalog(&self, port: u16) -> Option<Arc<FakeCatalog>> {
        self.catalogs.get(&port).cloned()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, config: &ConnectionConfig) -> ClusterResult<Arc<dyn Catalog>> {
        match self.catalogs.get(&config.port) {
            Some(catalog) => Ok(catalog.clone()),
            None => Err(gplift_cluster::ClusterError::Query(format!(
                "no database listening on port {}",
                config.port
            ))),
        }
    }
}

// ── Hub ────────────────────────────────────────────────────────────

pub struct Hub {
    pub config: Config,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub launcher: Arc<dyn Launcher>,
    pub fs: Arc<dyn FileSystem>,
    pub agents: Arc<dyn AgentClient>,
    pub connector: Arc<dyn Connector>,
    pub readiness_timeout: Duration,
}

impl Hub {
    /// A hub that reaches agents over ssh and the database over the wire.
    pub fn new(config: Config, state_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>, launcher: Arc<dyn Launcher>) -> Self {
        let agents = Arc::new(SshAgentClient {
            launcher: launcher.clone(),
            tool_path: config.tool_path.clone(),
        });
        Self {
            config,
            state_dir: state_dir.into(),
            log_dir: log_dir.into(),
            launcher,
            fs: Arc::new(OsFs),
            agents,
            connector: Arc::new(PgConnector),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }

    pub fn with_agents(mut self, agents: Arc<dyn AgentClient>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_fs(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    pub(crate) fn save_config(&self) -> HubResult<()> {
        self.config.save(&self.state_dir)
    }

    pub(crate) async fn connect(&self, config: &ConnectionConfig) -> HubResult<Arc<dyn Catalog>> {
        debug!(port = config.port, utility = config.utility_mode, "connecting to coordinator");
        Ok(self.connector.connect(config).await?)
    }

    /// Waits until every segment of a just-started `cluster` is up.
    pub(crate) async fn wait_for_ready(&self, cluster: &Cluster) -> HubResult<()> {
        let catalog = self.connect(&cluster.connection()).await?;
        wait_for_segments(catalog.as_ref(), self.readiness_timeout, cluster).await?;
        Ok(())
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Hosts running data-bearing primaries of the source cluster.
    pub(crate) fn agent_hosts(&self) -> HubResult<Vec<String>> {
        Ok(self.config.source()?.primary_hostnames())
    }

    /// Every source host except the coordinator's, which the hub serves
    /// itself.
    pub(crate) fn remote_hosts(&self) -> HubResult<Vec<String>> {
        let source = self.config.source()?;
        let coordinator = source.coordinator_hostname();
        Ok(source
            .select(|s| !s.is_coordinator())
            .map(|s| s.hostname.clone())
            .filter(|host| host != coordinator)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    /// The same request for each host.
    pub(crate) fn broadcast(hosts: Vec<String>, request: AgentRequest) -> BTreeMap<String, AgentRequest> {
        hosts.into_iter().map(|host| (host, request.clone())).collect()
    }

    // ── Requests ───────────────────────────────────────────────────

    /// Where segment hosts receive the upgraded coordinator's tablespaces
    /// and mapping file.
    pub(crate) fn shipped_mapping_file(&self) -> PathBuf {
        self.state_dir.join(TABLESPACES_DIR).join(TABLESPACES_MAPPING_FILE)
    }

    /// One `upgrade-primaries` request per host, pairing each source primary
    /// with its intermediate counterpart.
    pub(crate) fn upgrade_primaries_requests(&self, check_only: bool) -> HubResult<BTreeMap<String, AgentRequest>> {
        let source = self.config.source()?;
        let intermediate = self.config.intermediate()?;

        let mut by_host: BTreeMap<String, Vec<AgentSegment>> = BTreeMap::new();
        for seg in source.select(|s| s.is_primary()) {
            let target = intermediate
                .primaries
                .get(&seg.content_id)
                .ok_or(HubError::MissingSegment {
                    destination: "intermediate",
                    content: seg.content_id,
                })?;
            if target.hostname != seg.hostname {
                return Err(HubError::HostMismatch {
                    content: seg.content_id,
                    source_host: seg.hostname.clone(),
                    target_host: target.hostname.clone(),
                });
            }

            by_host.entry(seg.hostname.clone()).or_default().push(AgentSegment {
                content: seg.content_id,
                dbid: seg.dbid,
                source_datadir: seg.datadir.clone(),
                target_datadir: target.datadir.clone(),
                source_port: seg.port,
                target_port: target.port,
                tablespaces: source.tablespaces.for_dbid(seg.dbid).cloned().unwrap_or_default(),
            });
        }

        let (backup, mapping_file) = if check_only {
            (None, None)
        } else {
            (
                Some(self.state_dir.join(UPGRADED_COORDINATOR_BACKUP)),
                Some(self.shipped_mapping_file()),
            )
        };

        Ok(by_host
            .into_iter()
            .map(|(host, segments)| {
                let request = UpgradePrimaries {
                    check_only,
                    link_mode: self.config.link_mode,
                    source_bin_dir: source.bin_dir(),
                    target_bin_dir: intermediate.bin_dir(),
                    target_version: intermediate.version.clone(),
                    coordinator_backup_dir: backup.clone(),
                    tablespaces_mapping_file: mapping_file.clone(),
                    segments,
                };
                (host, AgentRequest::UpgradePrimaries(request))
            })
            .collect())
    }

    /// Swaps every upgraded primary into its source location. Without link
    /// mode mirrors and the standby are archived as well, since their data
    /// directories still hold the old cluster.
    pub(crate) fn rename_requests(&self) -> HubResult<BTreeMap<String, AgentRequest>> {
        let source = self.config.source()?;
        let plan = self.config.plan()?;
        let intermediate = self.config.intermediate()?;

        let mut by_host: BTreeMap<String, Vec<RenameDirectories>> = BTreeMap::new();
        let mut add = |host: &str, source: &Path, target: &Path, rename_target: bool| {
            by_host.entry(host.to_string()).or_default().push(RenameDirectories {
                source: source.to_path_buf(),
                target: target.to_path_buf(),
                rename_target,
            });
        };

        for seg in source.select(|s| s.is_primary()) {
            let target = intermediate
                .primaries
                .get(&seg.content_id)
                .ok_or(HubError::MissingSegment {
                    destination: "intermediate",
                    content: seg.content_id,
                })?;
            add(&seg.hostname, &seg.datadir, &target.datadir, true);
        }

        if !self.config.link_mode {
            for seg in source.select(|s| s.is_mirror()) {
                let planned = plan
                    .mirrors
                    .iter()
                    .find(|m| m.content_id == seg.content_id)
                    .ok_or(HubError::MissingSegment {
                        destination: "planned mirror",
                        content: seg.content_id,
                    })?;
                add(&seg.hostname, &seg.datadir, &planned.datadir, false);
            }
            if let (Some(standby), Some(planned)) = (source.standby(), plan.standby.as_ref()) {
                add(&standby.hostname, &standby.datadir, &planned.datadir, false);
            }
        }

        info!(hosts = by_host.len(), link = self.config.link_mode, "planned data directory renames");
        Ok(by_host
            .into_iter()
            .map(|(host, dirs)| (host, AgentRequest::RenameDirectories { dirs }))
            .collect())
    }

    /// Groups `segments` by host as one request each, built by `make`.
    pub(crate) fn per_host<'a, I, F>(segments: I, make: F) -> BTreeMap<String, AgentRequest>
    where
        I: IntoIterator<Item = (&'a str, PathBuf)>,
        F: Fn(Vec<PathBuf>) -> AgentRequest,
    {
        let mut by_host: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for (host, path) in segments {
            by_host.entry(host.to_string()).or_default().push(path);
        }
        by_host
            .into_iter()
            .map(|(host, paths)| (host, make(paths)))
            .collect()
    }
}
