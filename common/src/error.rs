use std::io;

/// Classified outcome of a cloud CLI invocation.
///
/// The reconciler branches on `NotFound` (drives the create transition) and
/// `NoFile` (drives the not-installed / no-stale-pid decisions); everything
/// else is recovered by the next cycle.
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("node not found")]
    NotFound,
    #[error("no such file: {0}")]
    NoFile(String),
    #[error("{context}: exit {code:?}: {stderr}")]
    CommandFailed {
        context: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

impl DriverError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound)
    }

    pub fn is_no_file(&self) -> bool {
        matches!(self, DriverError::NoFile(_))
    }

    pub fn failed(context: impl Into<String>, code: Option<i32>, stderr: impl Into<String>) -> Self {
        DriverError::CommandFailed {
            context: context.into(),
            code,
            stderr: stderr.into(),
        }
    }
}
