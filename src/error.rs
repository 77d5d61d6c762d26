use std::io;

use thiserror::Error;

use crate::flamegraph::RenderError;

/// Everything that can abort one of the `rankflame` stages.
///
/// Failures that only affect one line or one source never show up here; they are recovered from
/// and listed in the stage's report instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid paths, arguments or configuration, detected before any processing started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No source contributed a single valid stack.
    #[error("no valid stacks in any source")]
    NoStacks,

    /// Rendering failed.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Reading inputs or writing outputs failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }
}
