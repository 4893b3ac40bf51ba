//! Hub configuration persisted across invocations.
//!
//! Initialize creates it; every later step loads it. Saved as pretty JSON
//! at `<state_dir>/config.json` with the same atomic write as the status
//! file.

use std::fs;
use std::path::{Path, PathBuf};

use gplift_cluster::{Cluster, Destination, Segment, TABLESPACES_MAPPING_FILE, VersionGate};
use gplift_core::paths::config_file;
use gplift_core::{UpgradeId, atomically_write};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HubError, HubResult};
use crate::plan::InitializePlan;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub upgrade_id: UpgradeId,
    pub source_gphome: PathBuf,
    pub target_gphome: PathBuf,
    pub source_port: u16,
    pub link_mode: bool,
    pub use_hba_hostnames: bool,
    /// Ports for the intermediate cluster; empty selects the default range.
    pub ports: Vec<u16>,
    pub tablespaces_mapping_file: PathBuf,
    /// The gplift binary on every host, used to reach agents.
    pub tool_path: PathBuf,
    #[serde(default)]
    pub gate: VersionGate,
    pub source: Option<Cluster>,
    pub plan: Option<InitializePlan>,
    pub intermediate: Option<Cluster>,
}

impl Config {
    pub fn new(
        state_dir: &Path,
        source_gphome: impl Into<PathBuf>,
        target_gphome: impl Into<PathBuf>,
        source_port: u16,
        tool_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            upgrade_id: UpgradeId::generate(),
            source_gphome: source_gphome.into(),
            target_gphome: target_gphome.into(),
            source_port,
            link_mode: false,
            use_hba_hostnames: false,
            ports: Vec::new(),
            tablespaces_mapping_file: state_dir.join(TABLESPACES_MAPPING_FILE),
            tool_path: tool_path.into(),
            gate: VersionGate::default(),
            source: None,
            plan: None,
            intermediate: None,
        }
    }

    pub fn load(state_dir: &Path) -> HubResult<Self> {
        let path = config_file(state_dir);
        let data = fs::read(&path)?;
        serde_json::from_slice(&data).map_err(|source| HubError::Config {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, state_dir: &Path) -> HubResult<()> {
        let path = config_file(state_dir);
        let data = serde_json::to_vec_pretty(self)?;
        atomically_write(&path, &data)?;
        debug!(path = %path.display(), "saved hub configuration");
        Ok(())
    }

    pub fn source(&self) -> HubResult<&Cluster> {
        self.source.as_ref().ok_or(HubError::MissingCluster("source"))
    }

    pub fn plan(&self) -> HubResult<&InitializePlan> {
        self.plan.as_ref().ok_or(HubError::MissingCluster("target plan"))
    }

    pub fn intermediate(&self) -> HubResult<&Cluster> {
        self.intermediate
            .as_ref()
            .ok_or(HubError::MissingCluster("intermediate"))
    }

    /// The upgraded cluster once finalize has moved it into the source's
    /// data directories and ports.
    pub fn target(&self) -> HubResult<Cluster> {
        let source = self.source()?;
        let intermediate = self.intermediate()?;

        let segments = intermediate
            .primaries
            .values()
            .map(|seg| match source.primaries.get(&seg.content_id) {
                Some(original) => Segment {
                    port: original.port,
                    datadir: original.datadir.clone(),
                    ..seg.clone()
                },
                None => seg.clone(),
            })
            .collect();

        let target = Cluster::new(
            Destination::Target,
            segments,
            &self.target_gphome,
            intermediate.version.clone(),
        )?
        .with_catalog_version(intermediate.catalog_version.clone())
        .with_tablespaces(source.tablespaces.clone());
        Ok(target)
    }
}
