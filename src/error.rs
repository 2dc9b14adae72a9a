use std::path::PathBuf;

use thiserror::Error;

use crate::surface::Affinity;

/// Errors returned by the host window, its render surface and its execution thread.
///
/// A stop that needs escalation is not an error: it is reported through
/// [`StopReport`](crate::execution::StopReport) and the log.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested context profile is not available, or the driver refused to create it.
    #[error("failed to create rendering context: {0}")]
    ContextCreation(String),

    /// A context call was made by a thread that does not hold the context.
    #[error("{operation} called without context affinity (held by {holder:?})")]
    AffinityViolation {
        operation: &'static str,
        holder: Affinity,
    },

    /// The native graphics layer failed an operation on an owned context.
    #[error("graphics driver error: {0}")]
    Driver(String),

    #[error("execution thread is already running")]
    AlreadyRunning,

    /// The emulation core was lost with an abandoned or panicked worker.
    #[error("emulation core is no longer available")]
    CoreUnavailable,

    #[error("invalid configuration {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("invalid geometry snapshot: {0}")]
    Geometry(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
