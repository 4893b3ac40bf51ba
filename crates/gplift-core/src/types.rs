//! Step, substep and status names.
//!
//! All three serialize as their SCREAMING_SNAKE_CASE names so that the
//! persisted status file stays readable by operators.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A top-level step of the upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepName {
    Initialize,
    Execute,
    Finalize,
    Revert,
}

impl StepName {
    pub fn as_str(self) -> &'static str {
        match self {
            StepName::Initialize => "INITIALIZE",
            StepName::Execute => "EXECUTE",
            StepName::Finalize => "FINALIZE",
            StepName::Revert => "REVERT",
        }
    }

    /// "Initialize", "Execute", ... as printed in log headers.
    pub fn title(self) -> &'static str {
        match self {
            StepName::Initialize => "Initialize",
            StepName::Execute => "Execute",
            StepName::Finalize => "Finalize",
            StepName::Revert => "Revert",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! substeps {
    ($($variant:ident => $name:literal, $title:literal;)+) => {
        /// A unit of work inside a step whose outcome is persisted.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum Substep {
            $(
                #[serde(rename = $name)]
                $variant,
            )+
        }

        impl Substep {
            pub const ALL: &'static [Substep] = &[$(Substep::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Substep::$variant => $name,)+
                }
            }

            /// Human description shown by the CLI.
            pub fn title(self) -> &'static str {
                match self {
                    $(Substep::$variant => $title,)+
                }
            }
        }
    };
}

substeps! {
    SavingSourceClusterConfig => "SAVING_SOURCE_CLUSTER_CONFIG", "Saving source cluster configuration";
    CheckActiveConnections => "CHECK_ACTIVE_CONNECTIONS", "Checking for active connections";
    GenerateTargetConfig => "GENERATE_TARGET_CONFIG", "Generating target cluster configuration";
    InitTargetCluster => "INIT_TARGET_CLUSTER", "Creating target cluster";
    ShutdownTargetCluster => "SHUTDOWN_TARGET_CLUSTER", "Stopping target cluster";
    BackupTargetCoordinator => "BACKUP_TARGET_COORDINATOR", "Backing up target coordinator";
    CheckUpgrade => "CHECK_UPGRADE", "Running pg_upgrade checks";
    ShutdownSourceCluster => "SHUTDOWN_SOURCE_CLUSTER", "Stopping source cluster";
    UpgradeCoordinator => "UPGRADE_COORDINATOR", "Upgrading coordinator";
    CopyCoordinator => "COPY_COORDINATOR", "Copying coordinator catalog to primary segments";
    UpgradePrimaries => "UPGRADE_PRIMARIES", "Upgrading primary segments";
    StartTargetCluster => "START_TARGET_CLUSTER", "Starting target cluster";
    UpdateDataDirectories => "UPDATE_DATA_DIRECTORIES", "Renaming data directories";
    UpdateTargetConfFiles => "UPDATE_TARGET_CONF_FILES", "Updating target configuration files";
    ArchiveLogDirectories => "ARCHIVE_LOG_DIRECTORIES", "Archiving log directories";
    DeleteSegmentStatedirs => "DELETE_SEGMENT_STATEDIRS", "Deleting state directories on the segments";
    DeletePrimaryDatadirs => "DELETE_PRIMARY_DATADIRS", "Deleting primary segment data directories";
    DeleteCoordinatorDatadir => "DELETE_COORDINATOR_DATADIR", "Deleting coordinator data directory";
    DeleteTablespaces => "DELETE_TABLESPACES", "Deleting target tablespace directories";
    RestorePgControl => "RESTORE_PGCONTROL", "Re-enabling source cluster";
    StartSourceCluster => "START_SOURCE_CLUSTER", "Starting source cluster";
}

impl fmt::Display for Substep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted outcome of a substep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Unknown,
    Running,
    Complete,
    Failed,
    Skipped,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "UNKNOWN",
            Status::Running => "RUNNING",
            Status::Complete => "COMPLETE",
            Status::Failed => "FAILED",
            Status::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substep_serializes_as_name() {
        let json = serde_json::to_string(&Substep::CheckUpgrade).unwrap();
        assert_eq!(json, "\"CHECK_UPGRADE\"");
    }

    #[test]
    fn substep_display_matches_serde_name() {
        for substep in Substep::ALL {
            let json = serde_json::to_string(substep).unwrap();
            assert_eq!(json, format!("\"{substep}\""));
        }
    }

    #[test]
    fn status_rejects_unknown_name() {
        let err = serde_json::from_str::<Status>("\"DONE\"").unwrap_err();
        assert!(err.to_string().contains("DONE"), "{err}");
    }

    #[test]
    fn step_title_case() {
        assert_eq!(StepName::Initialize.title(), "Initialize");
        assert_eq!(StepName::Revert.to_string(), "REVERT");
    }
}
