//! Error and warning types for parmap.

use std::fmt;

use thiserror::Error;

use crate::config::Mode;

/// Result type for parmap operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the session lifecycle and the dispatcher.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or contradictory start arguments. The session keeps its prior state.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A resource needed by the session is unusable (storage directory, worker pool, registry).
    #[error("resource error: {0}")]
    Resource(String),

    /// Pushing staged exports, libraries or sources failed. No task was run.
    #[error("staging failed for {kind} '{name}': {message}")]
    Staging {
        kind: StagedKind,
        name: String,
        message: String,
    },

    /// A mapped function failed on a worker.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn resource(message: impl Into<String>) -> Self {
        Error::Resource(message.into())
    }
}

/// What kind of staged item failed to reach the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedKind {
    Export,
    Library,
    Source,
}

impl fmt::Display for StagedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            StagedKind::Export => "export",
            StagedKind::Library => "library",
            StagedKind::Source => "source",
        };
        f.write_str(kind)
    }
}

/// Failure of a single function evaluation.
///
/// `iteration` is 1-based, matching the per-task log file names.
#[derive(Debug, Clone, Error)]
#[error("task {iteration} failed{}: {message}", worker.map(|w| format!(" on worker {}", w)).unwrap_or_default())]
pub struct TaskError {
    pub iteration: usize,
    pub worker: Option<usize>,
    pub message: String,
}

impl TaskError {
    pub(crate) fn new(iteration: usize, worker: Option<usize>, error: &anyhow::Error) -> Self {
        Self {
            iteration,
            worker,
            message: format!("{:#}", error),
        }
    }

    pub(crate) fn from_panic(
        iteration: usize,
        worker: Option<usize>,
        payload: Box<dyn std::any::Any + Send>,
    ) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("panicked: {}", s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("panicked: {}", s)
        } else {
            "panicked".to_string()
        };
        Self {
            iteration,
            worker,
            message,
        }
    }
}

/// Non-fatal conditions reported by `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// The active level is not present in the level registry.
    UnregisteredLevel { level: String },
    /// A running session was stopped to make room for the new one.
    AutoStopped { previous: Mode },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnregisteredLevel { level } => write!(
                f,
                "selected level '{}' is not registered; register it to silence this warning",
                level
            ),
            Warning::AutoStopped { previous } => write!(
                f,
                "parallelization in mode '{}' was not stopped, stopping it now",
                previous
            ),
        }
    }
}
