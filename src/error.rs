use std::path::{Path, PathBuf};

/// Worker-wide error type.
///
/// A returned [`crate::executor::Response`] means the sandbox ran; an `Error`
/// means the worker could not run it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{op} {path:?}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worker busy (exclusive: {exclusive})")]
    WorkerBusy { exclusive: bool },
    #[error("sandbox failure: {0}")]
    Sandbox(String),
    #[error("{0} not implemented")]
    NotImplemented(&'static str),
    #[error("event stream: {0}")]
    EventStream(#[source] std::io::Error),
}

impl Error {
    /// Adapter for `map_err` on filesystem calls.
    pub(crate) fn io(op: &'static str, path: impl AsRef<Path>) -> impl FnOnce(std::io::Error) -> Error {
        let path = path.as_ref().to_path_buf();
        move |source| Error::Io { op, path, source }
    }

    /// True when the underlying cause is a missing file.
    ///
    /// Used by the dispatcher to turn absent declared outputs into a
    /// response-level status instead of a hard failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}
