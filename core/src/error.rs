use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinError;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ConductorErr>;

#[derive(Error, Debug)]
pub enum ConductorErr {
    /// Raised during startup when the merged configuration is unusable.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The wrapped worker could not be started. This is the only error that
    /// is fatal to the whole conductor.
    #[error("failed to spawn wrapped command `{command}`: {source}")]
    ChildSpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The child process was spawned but one of its standard streams could
    /// not be captured.
    #[error("spawn failed: child stdio not captured")]
    Spawn,

    /// The child's stdin is gone; the affected injection is recorded as
    /// failed but the conductor keeps running.
    #[error("child stdin is not writable")]
    StdinUnwritable,

    /// A gateway call referenced a request id that is not pending.
    #[error("no pending request with id: {0}")]
    UnknownRequestId(Uuid),

    /// A gateway call was missing required fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unexpected HTTP status from a remote analyzer backend.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// The orchestrator task is gone; nothing can be submitted any more.
    #[error("internal error; conductor loop died unexpectedly")]
    LoopTerminated,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}
