//! The cluster topology model.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::Catalog;
use crate::connection::ConnectionConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::segment::{COORDINATOR_CONTENT, Role, Segment};
use crate::tablespace::Tablespaces;

const SEGMENT_CONFIG_QUERY_5X: &str = "
SELECT
	s.dbid,
	s.content as contentid,
	s.port,
	s.hostname,
	e.fselocation as datadir,
	s.role
FROM gp_segment_configuration s
JOIN pg_filespace_entry e ON s.dbid = e.fsedbid
JOIN pg_filespace f ON e.fsefsoid = f.oid
WHERE f.fsname = 'pg_system'
ORDER BY s.content;";

const SEGMENT_CONFIG_QUERY: &str = "
SELECT
	dbid,
	content as contentid,
	port,
	hostname,
	datadir,
	role
FROM gp_segment_configuration
ORDER BY content;";

/// Which cluster of the upgrade a [`Cluster`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Source,
    Intermediate,
    Target,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Destination::Source => "source",
            Destination::Intermediate => "intermediate",
            Destination::Target => "target",
        })
    }
}

/// Segments keyed by content id, plus install location and version.
///
/// Construction validates that the coordinator exists, that no content has
/// two primaries or two mirrors, and that every mirror has a primary.
/// Deserializing runs the same checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredCluster")]
pub struct Cluster {
    pub destination: Destination,
    pub primaries: BTreeMap<i32, Segment>,
    pub mirrors: BTreeMap<i32, Segment>,
    #[serde(default)]
    pub tablespaces: Tablespaces,
    pub gphome: PathBuf,
    pub version: Version,
    #[serde(default)]
    pub catalog_version: String,
}

/// A [`Cluster`] as saved on disk, before validation.
#[derive(Deserialize)]
struct StoredCluster {
    destination: Destination,
    primaries: BTreeMap<i32, Segment>,
    mirrors: BTreeMap<i32, Segment>,
    #[serde(default)]
    tablespaces: Tablespaces,
    gphome: PathBuf,
    version: Version,
    #[serde(default)]
    catalog_version: String,
}

impl TryFrom<StoredCluster> for Cluster {
    type Error = ClusterError;

    fn try_from(stored: StoredCluster) -> ClusterResult<Self> {
        let entries = stored.primaries.into_iter().chain(stored.mirrors);
        let mut segments = Vec::new();
        for (content, seg) in entries {
            if content != seg.content_id {
                return Err(ClusterError::InvalidSegment {
                    segment: seg.to_string(),
                    reason: format!("stored under content ID {content}"),
                });
            }
            segments.push(seg);
        }

        Ok(Cluster::new(stored.destination, segments, stored.gphome, stored.version)?
            .with_tablespaces(stored.tablespaces)
            .with_catalog_version(stored.catalog_version))
    }
}

impl Cluster {
    pub fn new(
        destination: Destination,
        segments: Vec<Segment>,
        gphome: impl Into<PathBuf>,
        version: Version,
    ) -> ClusterResult<Self> {
        let mut primaries = BTreeMap::new();
        let mut mirrors = BTreeMap::new();

        for seg in segments {
            let content = seg.content_id;
            let table = match seg.role {
                Role::Primary => &mut primaries,
                Role::Mirror => &mut mirrors,
            };
            if table.contains_key(&content) {
                let kind = match seg.role {
                    Role::Primary => "primaries",
                    Role::Mirror => "mirrors",
                };
                return Err(ClusterError::InvalidSegment {
                    segment: seg.to_string(),
                    reason: format!("multiple {kind} with content ID {content}"),
                });
            }
            table.insert(content, seg);
        }

        if let Some(orphan) = mirrors.values().find(|m| !primaries.contains_key(&m.content_id)) {
            return Err(ClusterError::InvalidSegment {
                segment: orphan.to_string(),
                reason: format!("mirror with content ID {} has no primary", orphan.content_id),
            });
        }

        if !primaries.contains_key(&COORDINATOR_CONTENT) {
            return Err(ClusterError::MissingCoordinator);
        }

        Ok(Self {
            destination,
            primaries,
            mirrors,
            tablespaces: Tablespaces::default(),
            gphome: gphome.into(),
            version,
            catalog_version: String::new(),
        })
    }

    /// Reads the segment configuration from a live cluster.
    ///
    /// The query differs by major version: 5-series clusters keep data
    /// directories in the filespace catalog.
    pub async fn from_database(
        catalog: &dyn Catalog,
        gphome: impl Into<PathBuf>,
        destination: Destination,
    ) -> ClusterResult<Self> {
        let version = catalog.version().clone();
        let query = if version.major < 6 {
            SEGMENT_CONFIG_QUERY_5X
        } else {
            SEGMENT_CONFIG_QUERY
        };

        let rows = catalog.query(query).await?;
        let segments = rows
            .iter()
            .map(Segment::from_row)
            .collect::<ClusterResult<Vec<_>>>()?;
        debug!(%destination, segments = segments.len(), "loaded segment configuration");

        Cluster::new(destination, segments, gphome, version)
    }

    pub fn with_tablespaces(mut self, tablespaces: Tablespaces) -> Self {
        self.tablespaces = tablespaces;
        self
    }

    pub fn with_catalog_version(mut self, catalog_version: impl Into<String>) -> Self {
        self.catalog_version = catalog_version.into();
        self
    }

    // ── Coordinator and standby ────────────────────────────────────

    pub fn coordinator(&self) -> &Segment {
        // `new` guarantees the coordinator entry.
        &self.primaries[&COORDINATOR_CONTENT]
    }

    pub fn coordinator_hostname(&self) -> &str {
        &self.coordinator().hostname
    }

    pub fn coordinator_port(&self) -> u16 {
        self.coordinator().port
    }

    pub fn coordinator_datadir(&self) -> &Path {
        &self.coordinator().datadir
    }

    pub fn standby(&self) -> Option<&Segment> {
        self.mirrors.get(&COORDINATOR_CONTENT)
    }

    pub fn standby_hostname(&self) -> Option<&str> {
        self.standby().map(|s| s.hostname.as_str())
    }

    pub fn standby_port(&self) -> Option<u16> {
        self.standby().map(|s| s.port)
    }

    pub fn standby_datadir(&self) -> Option<&Path> {
        self.standby().map(|s| s.datadir.as_path())
    }

    // ── Topology queries ───────────────────────────────────────────

    /// At least one data-bearing mirror exists.
    pub fn has_mirrors(&self) -> bool {
        self.mirrors.keys().any(|&c| c != COORDINATOR_CONTENT)
    }

    pub fn has_standby(&self) -> bool {
        self.mirrors.contains_key(&COORDINATOR_CONTENT)
    }

    /// Every primary, including the coordinator, has a mirror.
    pub fn has_all_mirrors_and_standby(&self) -> bool {
        self.primaries.keys().all(|c| self.mirrors.contains_key(c))
    }

    /// Content ids in ascending order, coordinator first.
    pub fn content_ids(&self) -> Vec<i32> {
        self.primaries.keys().copied().collect()
    }

    /// Distinct hosts running data-bearing primaries.
    pub fn primary_hostnames(&self) -> Vec<String> {
        self.select(Segment::is_primary)
            .map(|s| s.hostname.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// All data-bearing segments, primaries and mirrors.
    pub fn excluding_coordinator_or_standby(&self) -> Vec<&Segment> {
        self.select(|s| s.content_id != COORDINATOR_CONTENT).collect()
    }

    /// Segments matching `predicate`, in ascending content order with each
    /// primary visited before its mirror.
    pub fn select<'a, P>(&'a self, predicate: P) -> impl Iterator<Item = &'a Segment> + 'a
    where
        P: Fn(&Segment) -> bool + 'a,
    {
        self.primaries
            .iter()
            .flat_map(move |(content, primary)| {
                std::iter::once(primary).chain(self.mirrors.get(content))
            })
            .filter(move |seg| predicate(seg))
    }

    /// Connection settings for the coordinator of this cluster.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.version.clone(), self.coordinator_port())
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.gphome.join("bin")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::FakeCatalog;
    use crate::rows;

    pub(crate) fn seg(dbid: i32, content: i32, role: Role, host: &str, port: u16, dir: &str) -> Segment {
        Segment {
            dbid,
            content_id: content,
            port,
            hostname: host.into(),
            datadir: dir.into(),
            role,
        }
    }

    /// Coordinator + standby + two primary/mirror pairs over two hosts.
    pub(crate) fn mirrored_cluster(version: Version) -> Cluster {
        Cluster::new(
            Destination::Source,
            vec![
                seg(1, -1, Role::Primary, "cdw", 15432, "/data/qddir/seg-1"),
                seg(8, -1, Role::Mirror, "scdw", 15432, "/data/standby"),
                seg(2, 0, Role::Primary, "sdw1", 25432, "/data/dbfast1/seg0"),
                seg(3, 1, Role::Primary, "sdw2", 25433, "/data/dbfast2/seg1"),
                seg(4, 0, Role::Mirror, "sdw2", 25434, "/data/dbfast_mirror1/seg0"),
                seg(5, 1, Role::Mirror, "sdw1", 25435, "/data/dbfast_mirror2/seg1"),
            ],
            "/usr/local/greenplum-db-source",
            version,
        )
        .unwrap()
    }

    #[test]
    fn duplicate_primary_is_rejected() {
        let err = Cluster::new(
            Destination::Source,
            vec![
                seg(1, -1, Role::Primary, "cdw", 15432, "/a"),
                seg(2, -1, Role::Primary, "cdw", 15433, "/b"),
            ],
            "/gphome",
            Version::new(6, 20, 0),
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("multiple primaries with content ID -1"),
            "{err}"
        );
        assert!(err.to_string().starts_with("invalid segment configuration ("));
    }

    #[test]
    fn mirror_without_primary_is_rejected() {
        let err = Cluster::new(
            Destination::Source,
            vec![
                seg(1, -1, Role::Primary, "cdw", 15432, "/a"),
                seg(3, 4, Role::Mirror, "sdw1", 25432, "/m"),
            ],
            "/gphome",
            Version::new(6, 20, 0),
        )
        .unwrap_err();
        assert!(err.to_string().contains("mirror with content ID 4 has no primary"));
    }

    #[test]
    fn missing_coordinator_is_rejected() {
        let err = Cluster::new(
            Destination::Source,
            vec![seg(2, 0, Role::Primary, "sdw1", 25432, "/p")],
            "/gphome",
            Version::new(6, 20, 0),
        )
        .unwrap_err();
        assert!(matches!(err, ClusterError::MissingCoordinator));
    }

    #[test]
    fn topology_queries() {
        let cluster = mirrored_cluster(Version::new(6, 20, 0));

        assert_eq!(cluster.coordinator_hostname(), "cdw");
        assert_eq!(cluster.coordinator_port(), 15432);
        assert_eq!(cluster.standby_hostname(), Some("scdw"));
        assert!(cluster.has_mirrors());
        assert!(cluster.has_standby());
        assert!(cluster.has_all_mirrors_and_standby());
        assert_eq!(cluster.content_ids(), vec![-1, 0, 1]);
        assert_eq!(cluster.excluding_coordinator_or_standby().len(), 4);

        let mut hosts = cluster.primary_hostnames();
        hosts.sort();
        assert_eq!(hosts, vec!["sdw1", "sdw2"]);
    }

    #[test]
    fn standby_alone_does_not_count_as_mirrors() {
        let cluster = Cluster::new(
            Destination::Source,
            vec![
                seg(1, -1, Role::Primary, "cdw", 15432, "/q"),
                seg(2, -1, Role::Mirror, "scdw", 15432, "/s"),
                seg(3, 0, Role::Primary, "sdw1", 25432, "/p0"),
            ],
            "/gphome",
            Version::new(6, 20, 0),
        )
        .unwrap();
        assert!(!cluster.has_mirrors());
        assert!(cluster.has_standby());
        assert!(!cluster.has_all_mirrors_and_standby());
    }

    #[test]
    fn select_visits_primary_before_mirror_in_content_order() {
        let cluster = mirrored_cluster(Version::new(6, 20, 0));
        let dbids: Vec<i32> = cluster.select(|_| true).map(|s| s.dbid).collect();
        assert_eq!(dbids, vec![1, 8, 2, 4, 3, 5]);

        let mirrors: Vec<i32> = cluster.select(Segment::is_mirror).map(|s| s.dbid).collect();
        assert_eq!(mirrors, vec![4, 5]);
    }

    #[tokio::test]
    async fn from_database_uses_configuration_view_on_6x() {
        let catalog = FakeCatalog::new(Version::new(6, 20, 0)).on(
            "FROM gp_segment_configuration",
            rows![
                ["1", "-1", "15432", "cdw", "/data/qddir/seg-1", "p"],
                ["2", "0", "25432", "sdw1", "/data/p0", "p"],
            ],
        );

        let cluster = Cluster::from_database(&catalog, "/gphome", Destination::Source)
            .await
            .unwrap();
        assert_eq!(cluster.primaries.len(), 2);
        assert_eq!(cluster.version, Version::new(6, 20, 0));
        assert!(!catalog.statements()[0].contains("pg_filespace"));
    }

    #[tokio::test]
    async fn from_database_joins_filespaces_on_5x() {
        let catalog = FakeCatalog::new(Version::new(5, 29, 1)).on(
            "pg_filespace",
            rows![["1", "-1", "15432", "cdw", "/data/qddir/seg-1", "p"]],
        );

        Cluster::from_database(&catalog, "/gphome", Destination::Source)
            .await
            .unwrap();
        assert_eq!(catalog.count("fsname = 'pg_system'"), 1);
    }

    #[tokio::test]
    async fn from_database_rejects_unknown_role() {
        let catalog = FakeCatalog::new(Version::new(6, 20, 0)).on(
            "gp_segment_configuration",
            rows![
                ["1", "-1", "15432", "cdw", "/q", "p"],
                ["2", "0", "25432", "sdw1", "/p0", "z"],
            ],
        );

        let err = Cluster::from_database(&catalog, "/gphome", Destination::Source)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidSegment { .. }));
    }

    #[test]
    fn serde_keeps_topology() {
        let cluster = mirrored_cluster(Version::new(6, 20, 0));
        let json = serde_json::to_string(&cluster).unwrap();
        let back: Cluster = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cluster);
    }

    #[test]
    fn saved_cluster_without_coordinator_is_rejected() {
        let mut value = serde_json::to_value(mirrored_cluster(Version::new(6, 20, 0))).unwrap();
        value["primaries"].as_object_mut().unwrap().remove("-1");
        value["mirrors"].as_object_mut().unwrap().remove("-1");

        let err = serde_json::from_value::<Cluster>(value).unwrap_err();
        assert!(err.to_string().contains("no coordinator"), "{err}");
    }

    #[test]
    fn saved_orphan_mirror_is_rejected() {
        let mut value = serde_json::to_value(mirrored_cluster(Version::new(6, 20, 0))).unwrap();
        value["primaries"].as_object_mut().unwrap().remove("1");

        let err = serde_json::from_value::<Cluster>(value).unwrap_err();
        assert!(err.to_string().contains("has no primary"), "{err}");
    }

    #[test]
    fn saved_segment_under_wrong_content_is_rejected() {
        let mut value = serde_json::to_value(mirrored_cluster(Version::new(6, 20, 0))).unwrap();
        let primaries = value["primaries"].as_object_mut().unwrap();
        let seg0 = primaries.remove("0").unwrap();
        primaries.insert("7".into(), seg0);

        let err = serde_json::from_value::<Cluster>(value).unwrap_err();
        assert!(err.to_string().contains("stored under content ID 7"), "{err}");
    }
}
