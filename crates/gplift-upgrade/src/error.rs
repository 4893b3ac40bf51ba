use std::io;
use std::path::PathBuf;

use gplift_core::{CoreError, ErrorList};
use thiserror::Error;

pub type UpgradeResult<T> = Result<T, UpgradeError>;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("{} does not look like a postgres directory. Failed to find {file}", .path.display())]
    InvalidDataDirectory { path: PathBuf, file: &'static str },

    #[error("Invalid tablespace directory. Expected {} to start with 'GPDB_'.", .0.display())]
    InvalidTablespaceDirectory(PathBuf),

    #[error("Invalid tablespace directory {}", .0.display())]
    UnrecognizedTablespaceDirectory(PathBuf),

    #[error("{action} {}: {source}", .path.display())]
    Fs {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unexpected version output from {host}: {output:?}")]
    VersionOutput { host: String, output: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Multiple(#[from] ErrorList),
}

impl UpgradeError {
    pub(crate) fn fs(action: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| UpgradeError::Fs {
            action,
            path,
            source,
        }
    }
}
