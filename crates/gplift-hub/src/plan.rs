//! Planning the intermediate target cluster.
//!
//! The target is first created beside the source: every segment gets a
//! temporary data directory next to its source directory and a port from the
//! configured range. Finalize later moves it into the source's place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gplift_cluster::{Catalog, Cluster, Destination, Segment};
use gplift_core::UpgradeId;
use gplift_upgrade::temp_data_dir;
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HubError, HubResult};

/// Used when no port range is configured.
pub const DEFAULT_FIRST_PORT: u16 = 50432;

pub const GPINITSYSTEM_CONFIG: &str = "gpinitsystem_config";

/// Temporary locations and ports for every segment of the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializePlan {
    pub coordinator: Segment,
    pub standby: Option<Segment>,
    pub primaries: Vec<Segment>,
    pub mirrors: Vec<Segment>,
}

impl InitializePlan {
    /// The cluster `gpinitsystem` creates from this plan: the coordinator and
    /// the primaries. Mirrors and standby are only planned for finalize.
    pub fn intermediate_cluster(&self, gphome: &Path, version: Version) -> HubResult<Cluster> {
        let mut segments = vec![self.coordinator.clone()];
        segments.extend(self.primaries.iter().cloned());
        Ok(Cluster::new(Destination::Intermediate, segments, gphome, version)?)
    }
}

/// Parses `"6000-6010,6020"` into a list of ports.
pub fn parse_ports(text: &str) -> HubResult<Vec<u16>> {
    let mut ports = Vec::new();
    if text.trim().is_empty() {
        return Ok(ports);
    }

    let bad = || HubError::PortRange(text.to_string());
    for part in text.split(',') {
        match part.split_once('-') {
            Some((low, high)) => {
                let low: u16 = low.trim().parse().map_err(|_| bad())?;
                let high: u16 = high.trim().parse().map_err(|_| bad())?;
                if low > high {
                    return Err(bad());
                }
                ports.extend(low..=high);
            }
            None => ports.push(part.trim().parse().map_err(|_| bad())?),
        }
    }
    Ok(ports)
}

/// The segment prefix of a coordinator data directory: `seg` for
/// `/data/qddir/seg-1`.
pub fn coordinator_seg_prefix(datadir: &Path) -> HubResult<String> {
    let base = datadir
        .file_name()
        .map(|b| b.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(prefix) = base.strip_suffix("-1") else {
        return Err(HubError::SegmentPrefix(format!(
            "path requires a coordinator content identifier: '{}'",
            datadir.display()
        )));
    };
    if prefix.is_empty() {
        return Err(HubError::SegmentPrefix(format!(
            "path has no segment prefix: '{}'",
            datadir.display()
        )));
    }
    Ok(prefix.to_string())
}

struct PortAllocator {
    ports: Vec<u16>,
    next: usize,
    by_host: HashMap<String, usize>,
}

impl PortAllocator {
    fn new(mut ports: Vec<u16>, segments: usize) -> Self {
        if ports.is_empty() {
            let count = segments.min(usize::from(u16::MAX - DEFAULT_FIRST_PORT) + 1);
            ports = (0..count)
                .filter_map(|i| u16::try_from(i).ok())
                .map(|i| DEFAULT_FIRST_PORT + i)
                .collect();
        }
        ports.sort_unstable();
        ports.dedup();
        Self {
            ports,
            next: 0,
            by_host: HashMap::new(),
        }
    }

    fn get(&self, index: usize) -> HubResult<u16> {
        self.ports.get(index).copied().ok_or(HubError::NotEnoughPorts {
            needed: index + 1,
            available: self.ports.len(),
        })
    }

    /// A port from the shared head of the range, used by the coordinator and
    /// standby.
    fn reserve(&mut self) -> HubResult<u16> {
        let port = self.get(self.next)?;
        self.next += 1;
        Ok(port)
    }

    /// Segment ports restart after the reserved ones on every host.
    fn for_host(&mut self, host: &str) -> HubResult<u16> {
        let index = *self.by_host.get(host).unwrap_or(&self.next);
        let port = self.get(index)?;
        self.by_host.insert(host.to_string(), index + 1);
        Ok(port)
    }
}

/// Assigns temporary data directories and ports to every source segment.
pub fn assign_datadirs_and_ports(source: &Cluster, ports: Vec<u16>, id: UpgradeId) -> HubResult<InitializePlan> {
    let segments = source.primaries.len() + source.mirrors.len();
    let mut alloc = PortAllocator::new(ports, segments);
    let prefix = coordinator_seg_prefix(source.coordinator_datadir())?;

    let plan_segment = |seg: &Segment, port: u16| Segment {
        port,
        datadir: temp_data_dir(&seg.datadir, &prefix, id),
        ..seg.clone()
    };

    let coordinator_port = alloc.reserve()?;
    let coordinator = plan_segment(source.coordinator(), coordinator_port);
    let standby = match source.standby() {
        Some(standby) => {
            let port = alloc.reserve()?;
            Some(plan_segment(standby, port))
        }
        None => None,
    };

    let mut primaries = Vec::new();
    for seg in source.select(|s| s.is_primary()) {
        let port = alloc.for_host(&seg.hostname)?;
        primaries.push(plan_segment(seg, port));
    }
    let mut mirrors = Vec::new();
    for seg in source.select(|s| s.is_mirror()) {
        let port = alloc.for_host(&seg.hostname)?;
        mirrors.push(plan_segment(seg, port));
    }

    debug!(
        coordinator = %coordinator.datadir.display(),
        primaries = primaries.len(),
        mirrors = mirrors.len(),
        "planned intermediate cluster"
    );
    Ok(InitializePlan {
        coordinator,
        standby,
        primaries,
        mirrors,
    })
}

fn array_entry(seg: &Segment) -> String {
    format!(
        "{}~{}~{}~{}~{}",
        seg.hostname,
        seg.port,
        seg.datadir.display(),
        seg.dbid,
        seg.content_id
    )
}

/// Lines of the `gpinitsystem` configuration for `plan`.
pub fn gpinitsystem_config(
    plan: &InitializePlan,
    use_hba_hostnames: bool,
    checkpoint_segments: &str,
    encoding: &str,
) -> HubResult<Vec<String>> {
    let prefix = coordinator_seg_prefix(&plan.coordinator.datadir)?;
    let mut config = vec![
        r#"ARRAY_NAME="gp_upgrade cluster""#.to_string(),
        format!("SEG_PREFIX={prefix}"),
        "TRUSTED_SHELL=ssh".to_string(),
        format!("HBA_HOSTNAMES={}", u8::from(use_hba_hostnames)),
        format!("CHECK_POINT_SEGMENTS={checkpoint_segments}"),
        format!("ENCODING={encoding}"),
        format!("QD_PRIMARY_ARRAY={}", array_entry(&plan.coordinator)),
        "declare -a PRIMARY_ARRAY=(".to_string(),
    ];
    config.extend(plan.primaries.iter().map(|p| format!("\t{}", array_entry(p))));
    config.push(")".to_string());
    Ok(config)
}

async fn current_setting(catalog: &dyn Catalog, name: &str) -> HubResult<String> {
    let rows = catalog
        .query(&format!("SELECT current_setting('{name}') AS string"))
        .await?;
    match rows.first() {
        Some(row) => Ok(row.text(0)?.to_string()),
        None => Err(gplift_cluster::ClusterError::Query(format!("no value for setting {name}")).into()),
    }
}

/// Writes `<state_dir>/gpinitsystem_config`, reading the checkpoint and
/// encoding settings from the source.
pub async fn write_gpinitsystem_config(
    catalog: &dyn Catalog,
    plan: &InitializePlan,
    use_hba_hostnames: bool,
    state_dir: &Path,
) -> HubResult<PathBuf> {
    let checkpoint_segments = current_setting(catalog, "checkpoint_segments").await?;
    let encoding = current_setting(catalog, "server_encoding").await?;
    let lines = gpinitsystem_config(plan, use_hba_hostnames, &checkpoint_segments, &encoding)?;

    let path = state_dir.join(GPINITSYSTEM_CONFIG);
    std::fs::write(&path, lines.join("\n"))?;
    debug!(path = %path.display(), "wrote gpinitsystem configuration");
    Ok(path)
}
