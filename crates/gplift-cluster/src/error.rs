//! Error types for the cluster model and its collaborators.

use std::io;
use std::time::Duration;

use gplift_core::{CoreError, ErrorList, NextActionError};
use thiserror::Error;

use crate::cluster::Destination;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid segment configuration ({segment}): {reason}")]
    InvalidSegment { segment: String, reason: String },

    #[error("invalid segment configuration: no coordinator (content id -1) primary")]
    MissingCoordinator,

    #[error("catalog query failed: {0}")]
    Query(String),

    #[error("unexpected catalog row: column {column}: {reason}")]
    Row { column: usize, reason: String },

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error(
        "{side} cluster version {version} is not supported.  The minimum required version is {minimum}. We recommend the latest version."
    )]
    UnsupportedVersion {
        side: String,
        version: semver::Version,
        minimum: semver::Version,
    },

    #[error("no {0} versions are configured as supported")]
    NoSupportedVersions(String),

    #[error("unknown version string {0:?}")]
    UnknownVersion(String),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error("parse version: {0}")]
    Version(#[from] semver::Error),

    #[error(
        "{} timeout exceeded waiting for all segments to be up, in their preferred roles, and synchronized.",
        timeout_text(.0)
    )]
    Timeout(Duration),

    #[error(transparent)]
    NextAction(#[from] NextActionError),

    #[error("coordinator is already stopped")]
    CoordinatorStopped,

    #[error("{action} {destination} cluster: {source}")]
    Control {
        action: &'static str,
        destination: Destination,
        #[source]
        source: CoreError,
    },

    #[error("checking for postmaster process: {0}")]
    RunningCheck(#[source] CoreError),

    #[error("tablespace mapping file: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Multiple(#[from] ErrorList),
}

fn timeout_text(d: &Duration) -> String {
    humantime::format_duration(*d).to_string()
}
