use std::io;

use gplift_core::{ErrorList, Substep};
use thiserror::Error;

pub type StepResult<T> = Result<T, StepError>;

#[derive(Debug, Error)]
pub enum StepError {
    #[error(
        "substep \"{0}\": Found previous substep {0} was running. Manual intervention needed to cleanup. Please contact support."
    )]
    SubstepRunning(Substep),

    /// The rendered error chain is part of the message, so it carries no
    /// separate source.
    #[error("substep \"{substep}\": {error:#}")]
    Substep { substep: Substep, error: anyhow::Error },

    #[error("{0:#}")]
    Internal(anyhow::Error),

    #[error("status file {path}: {source}")]
    StatusFile {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Core(#[from] gplift_core::CoreError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Multiple(#[from] ErrorList),
}
