//! Database version probing and the supported-version gate.

use std::collections::BTreeMap;
use std::path::Path;

use gplift_core::{Command, ErrorList, Launcher, bin_path};
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::Destination;
use crate::error::{ClusterError, ClusterResult};

const VERSION_BANNER: &str = "postgres (Greenplum Database) ";

// ── Probe ──────────────────────────────────────────────────────────

/// The `postgres --gp-version` invocation for an install.
pub fn version_command(gphome: &Path) -> Command {
    Command::new(bin_path(gphome, "postgres"))
        .arg("--gp-version")
        .env_clear()
}

/// Parses `postgres (Greenplum Database) 6.20.3 build commit:...`.
pub fn parse_gp_version(raw: &str) -> ClusterResult<Version> {
    let rest = raw
        .trim()
        .split_once(VERSION_BANNER)
        .map(|(_, rest)| rest)
        .ok_or_else(|| ClusterError::UnknownVersion(raw.to_string()))?;

    let pattern = Regex::new(r"\d+\.\d+\.\d+")?;
    let found = pattern
        .find(rest)
        .ok_or_else(|| ClusterError::UnknownVersion(raw.to_string()))?;

    Ok(Version::parse(found.as_str())?)
}

/// Version of the installation at `gphome`.
pub async fn local_version(launcher: &dyn Launcher, gphome: &Path) -> ClusterResult<Version> {
    let output = launcher.output_checked(&version_command(gphome)).await?;
    let version = parse_gp_version(&output.combined())?;
    debug!(gphome = %gphome.display(), %version, "probed database version");
    Ok(version)
}

// ── Gate ───────────────────────────────────────────────────────────

/// Minimum supported version per major release, for each side of the upgrade.
///
/// A version `v` passes when its major has an entry and
/// `min <= v < (major + 1).0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionGate {
    pub source: BTreeMap<u64, String>,
    pub target: BTreeMap<u64, String>,
}

impl Default for VersionGate {
    fn default() -> Self {
        Self {
            source: BTreeMap::from([(5, "5.29.1".to_string()), (6, "6.18.0".to_string())]),
            target: BTreeMap::from([(6, "6.18.0".to_string()), (7, "7.0.0".to_string())]),
        }
    }
}

impl VersionGate {
    fn table(&self, side: Destination) -> &BTreeMap<u64, String> {
        match side {
            Destination::Target | Destination::Intermediate => &self.target,
            Destination::Source => &self.source,
        }
    }

    /// The floor reported for `version`. When its major has no entry this is
    /// the floor of the lowest configured major.
    pub fn min_version(&self, side: Destination, version: &Version) -> ClusterResult<Version> {
        let table = self.table(side);
        let floor = table
            .get(&version.major)
            .or_else(|| table.values().next())
            .ok_or_else(|| ClusterError::NoSupportedVersions(side.to_string()))?;
        Ok(Version::parse(floor)?)
    }

    pub fn is_allowed(&self, side: Destination, version: &Version) -> ClusterResult<bool> {
        let Some(floor) = self.table(side).get(&version.major) else {
            return Ok(false);
        };
        let floor = Version::parse(floor)?;
        let ceiling = Version::new(version.major + 1, 0, 0);
        Ok(*version >= floor && *version < ceiling)
    }

    pub fn check(&self, side: Destination, version: &Version) -> ClusterResult<()> {
        if self.is_allowed(side, version)? {
            return Ok(());
        }
        Err(ClusterError::UnsupportedVersion {
            side: side.to_string(),
            version: version.clone(),
            minimum: self.min_version(side, version)?,
        })
    }

    /// Checks both sides, reporting every failure.
    pub fn verify(&self, source: &Version, target: &Version) -> ClusterResult<()> {
        let errors = [
            self.check(Destination::Source, source),
            self.check(Destination::Target, target),
        ]
        .into_iter()
        .filter_map(Result::err);
        ErrorList::fold(errors)
    }
}

#[cfg(test)]
mod tests {
    use gplift_core::{FakeLauncher, FakeResponse};

    use super::*;

    #[test]
    fn rejects_source_below_configured_majors() {
        let gate = VersionGate {
            source: BTreeMap::from([(7, "7.0.0".to_string())]),
            target: BTreeMap::new(),
        };
        let err = gate
            .check(Destination::Source, &Version::new(6, 8, 0))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "source cluster version 6.8.0 is not supported.  The minimum required version is 7.0.0. We recommend the latest version."
        );
    }

    #[test]
    fn accepts_versions_inside_major_range() {
        let gate = VersionGate::default();
        assert!(gate.check(Destination::Source, &Version::new(5, 29, 1)).is_ok());
        assert!(gate.check(Destination::Source, &Version::new(6, 26, 2)).is_ok());
        assert!(gate.check(Destination::Target, &Version::new(7, 1, 0)).is_ok());
    }

    #[test]
    fn rejects_below_floor_for_same_major() {
        let gate = VersionGate::default();
        let err = gate
            .check(Destination::Source, &Version::new(5, 28, 0))
            .unwrap_err();
        assert!(err.to_string().contains("minimum required version is 5.29.1"));
    }

    #[test]
    fn unconfigured_major_reports_lowest_floor() {
        let gate = VersionGate::default();
        let err = gate
            .check(Destination::Source, &Version::new(8, 0, 0))
            .unwrap_err();
        assert!(err.to_string().contains("minimum required version is 5.29.1"), "{err}");
    }

    #[test]
    fn verify_reports_both_sides() {
        let gate = VersionGate::default();
        let err = gate
            .verify(&Version::new(4, 3, 0), &Version::new(5, 0, 0))
            .unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("2 errors occurred:"), "{text}");
        assert!(text.contains("source cluster version 4.3.0"));
        assert!(text.contains("target cluster version 5.0.0"));
    }

    #[test]
    fn verify_with_one_failure_is_the_failure_itself() {
        let gate = VersionGate::default();
        let err = gate
            .verify(&Version::new(6, 20, 0), &Version::new(5, 0, 0))
            .unwrap_err();
        assert!(matches!(err, ClusterError::UnsupportedVersion { .. }));
    }

    #[test]
    fn empty_table_is_reported() {
        let gate = VersionGate {
            source: BTreeMap::new(),
            target: BTreeMap::new(),
        };
        let err = gate
            .check(Destination::Target, &Version::new(7, 0, 0))
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoSupportedVersions(_)));
    }

    #[test]
    fn parses_banner_with_build_metadata() {
        let v = parse_gp_version(
            "postgres (Greenplum Database) 6.20.3 build commit:24b949d2585cdbe8a157062fb756013e7c2874ab\n",
        )
        .unwrap();
        assert_eq!(v, Version::new(6, 20, 3));

        let v = parse_gp_version("postgres (Greenplum Database) 7.0.0-beta.0+dev.1 build dev").unwrap();
        assert_eq!(v, Version::new(7, 0, 0));
    }

    #[test]
    fn rejects_unknown_banner() {
        assert!(matches!(
            parse_gp_version("postgres (PostgreSQL) 12.4"),
            Err(ClusterError::UnknownVersion(_))
        ));
        assert!(matches!(
            parse_gp_version("postgres (Greenplum Database) main"),
            Err(ClusterError::UnknownVersion(_))
        ));
    }

    #[tokio::test]
    async fn local_version_runs_postgres_with_cleared_env() {
        let launcher = FakeLauncher::new();
        launcher.push(
            "postgres",
            FakeResponse::success().with_stdout("postgres (Greenplum Database) 6.20.0 build 1"),
        );

        let v = local_version(&launcher, Path::new("/usr/local/gpdb6")).await.unwrap();
        assert_eq!(v, Version::new(6, 20, 0));

        let call = &launcher.calls()[0];
        assert_eq!(call.to_string(), "/usr/local/gpdb6/bin/postgres --gp-version");
        assert_eq!(call.env, gplift_core::Env::Replace(vec![]));
    }
}
