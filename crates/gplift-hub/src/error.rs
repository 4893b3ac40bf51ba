use std::io;

use gplift_cluster::ClusterError;
use gplift_core::{CoreError, ErrorList, NextActionError};
use gplift_step::StepError;
use gplift_upgrade::UpgradeError;
use thiserror::Error;

pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, Error)]
pub enum HubError {
    #[error(
        "Version mismatch between {description} hub and agent hosts. \n    Hub version: {hub:?}\n\n    Mismatched Agents:\n    {mismatched}"
    )]
    VersionMismatch {
        description: String,
        hub: String,
        mismatched: String,
    },

    #[error("getting hub version: {0}")]
    HubVersion(#[source] Box<HubError>),

    #[error("agent on host {host}: {message}")]
    Agent { host: String, message: String },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<HubError>,
    },

    #[error("agent task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("unexpected agent command {got:?}, request is for {expected:?}")]
    AgentCommand { expected: String, got: String },

    #[error("no {0} cluster in the configuration; run initialize first")]
    MissingCluster(&'static str),

    #[error("no {destination} segment with content {content}")]
    MissingSegment { destination: &'static str, content: i32 },

    #[error(
        "source and target hosts differ for content {content}: source {source_host:?}, target {target_host:?}"
    )]
    HostMismatch {
        content: i32,
        source_host: String,
        target_host: String,
    },

    #[error(
        "Source cluster does not have mirrors and/or standby. Cannot restore source cluster. Please contact support."
    )]
    NoMirrorsOrStandby,

    #[error("pg_controldata output is missing catalog version")]
    UnknownCatalogVersion,

    #[error("{0}")]
    SegmentPrefix(String),

    #[error("not enough ports in the target port range: need {needed}, have {available}")]
    NotEnoughPorts { needed: usize, available: usize },

    #[error("invalid port range {0:?}")]
    PortRange(String),

    #[error("configuration file {path}: {source}")]
    Config {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("agent request: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    NextAction(#[from] NextActionError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Upgrade(#[from] UpgradeError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Multiple(#[from] ErrorList),
}

impl HubError {
    /// Prefixes the error with what was being attempted.
    pub fn context(self, context: impl Into<String>) -> Self {
        HubError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}
