//! Error taxonomy for the director.
//!
//! Raw reqwest/engine failures are translated at the adapter boundary; the
//! observation cycle and scheduler only ever see these types.

use quay_ids::NodeUuid;
use thiserror::Error;

/// Docker Engine errors, normalized from the raw HTTP client.
#[derive(Debug, Error)]
pub enum DockerError {
    /// The engine responded with an error status.
    #[error("docker engine error (status {status}): {message}")]
    Engine { status: u16, message: String },

    /// The service does not exist (404 from the engine).
    #[error("docker service not found: {0}")]
    ServiceNotFound(String),

    /// The request did not complete within the bounded timeout.
    #[error("docker engine request timed out: {0}")]
    Timeout(String),

    /// The engine rejected the spec outright (malformed, missing image).
    #[error("invalid service spec: {0}")]
    InvalidSpec(String),

    /// A scheduler-data label could not be decoded.
    #[error("bad scheduler-data label: {0}")]
    BadLabel(String),

    /// Transport-level failure reaching the engine.
    #[error("docker engine unreachable: {0}")]
    Transport(String),
}

/// Sidecar HTTP client errors.
#[derive(Debug, Error)]
pub enum SidecarError {
    /// Connection-level failure (refused/reset/timeout). Retried with
    /// bounded backoff inside the client; surfaced only once exhausted.
    #[error("sidecar transport error: {0}")]
    Transport(String),

    /// Non-transient transport failure (e.g. a request build error).
    /// Never retried.
    #[error("sidecar client error: {0}")]
    Client(String),

    /// The sidecar responded, but not with the documented status.
    /// Never retried.
    #[error("unexpected status {status} from {url}: {body}")]
    UnexpectedStatus {
        status: u16,
        url: String,
        body: String,
    },
}

impl SidecarError {
    /// True for errors the retry wrapper is allowed to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SidecarError::Transport(_))
    }
}

/// Scheduler policy errors, surfaced to REST callers as 4xx.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A tracked entry already exists for this node.
    #[error("service for node {0} is already tracked")]
    AlreadyTracked(NodeUuid),

    /// No tracked entry for this node.
    #[error("no tracked service for node {0}")]
    NotFound(NodeUuid),

    /// A service name for this node already exists in the swarm.
    #[error("node {0} collides with an already running service")]
    NodeCollision(NodeUuid),

    /// The entry is parked awaiting an operator; automatic operations are
    /// refused until a forced removal.
    #[error("service for node {0} awaits manual intervention")]
    ManualInterventionRequired(NodeUuid),

    /// A lower-level failure during a directly invoked operation.
    #[error(transparent)]
    Docker(#[from] DockerError),

    /// A lower-level failure during a directly invoked operation.
    #[error(transparent)]
    Sidecar(#[from] SidecarError),
}
