//! Error types shared across gplift crates.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use thiserror::Error;

use crate::exec::ProcessExit;

/// Boxed error used for heterogeneous aggregation.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the core capabilities (process launch, id parsing, paths).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command}: {exit}{}", render_output(.output))]
    Exit {
        command: String,
        exit: ProcessExit,
        output: String,
    },

    #[error("invalid upgrade id {0:?}")]
    InvalidId(String),

    #[error("HOME is not set; cannot locate the gplift state directory")]
    HomeNotSet,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Exit code of a child that ran and failed, if this error is one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CoreError::Exit { exit, .. } => exit.code(),
            _ => None,
        }
    }
}

fn render_output(output: &str) -> String {
    let trimmed = output.trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n{trimmed}")
    }
}

// ── Error list ─────────────────────────────────────────────────────

/// An ordered collection of errors reported together.
///
/// Appending another `ErrorList` flattens it, so lists never nest.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<BoxError>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an error, flattening nested lists.
    pub fn push<E: Into<BoxError>>(&mut self, err: E) {
        let boxed: BoxError = err.into();
        match boxed.downcast::<ErrorList>() {
            Ok(list) => self.errors.extend(list.errors),
            Err(other) => self.errors.push(other),
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(dyn StdError + Send + Sync + 'static)> {
        self.errors.iter().map(|e| e.as_ref())
    }

    /// Collapses a batch of errors of one type.
    ///
    /// No errors is success; a single error is returned unchanged; more than
    /// one is wrapped into a list and converted back into `E`.
    pub fn fold<E>(errors: impl IntoIterator<Item = E>) -> Result<(), E>
    where
        E: From<ErrorList> + StdError + Send + Sync + 'static,
    {
        let mut errors: Vec<E> = errors.into_iter().collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => {
                let list: ErrorList = errors.into_iter().collect();
                Err(E::from(list))
            }
        }
    }
}

impl<E: Into<BoxError>> FromIterator<E> for ErrorList {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        let mut list = ErrorList::new();
        for err in iter {
            list.push(err);
        }
        list
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            return write!(f, "1 error occurred:\n\t* {}\n\n", self.errors[0]);
        }

        let points: Vec<String> = self.errors.iter().map(|e| format!("* {e}")).collect();
        write!(
            f,
            "{} errors occurred:\n\t{}\n\n",
            self.errors.len(),
            points.join("\n\t")
        )
    }
}

impl StdError for ErrorList {}

// ── Next action ────────────────────────────────────────────────────

/// A user-facing error that carries a recommended next action.
#[derive(Debug, Error)]
#[error("{description}")]
pub struct NextActionError {
    pub description: String,
    pub next_action: String,
}

impl NextActionError {
    pub fn new(description: impl Into<String>, next_action: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            next_action: next_action.into(),
        }
    }

    /// The help block printed below the error.
    pub fn help(&self) -> String {
        format!("\nNEXT ACTIONS\n------------\n{}", self.next_action)
    }
}
