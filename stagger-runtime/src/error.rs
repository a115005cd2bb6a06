use stagger::RunError;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Server command is empty")]
    EmptyCommand,

    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Server {0} was not captured")]
    MissingPipe(&'static str),

    #[error("Server start timed out after {0:?}")]
    StartTimeout(Duration),

    #[error("Server exited before startup ({0})")]
    Exited(ExitStatus),

    #[error("Server I/O failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to allocate a free port: {0}")]
    Port(#[source] io::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("Failed to open quiz service: {0}")]
    Service(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("Failed to write report {}: {source}", .path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to format report timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}
