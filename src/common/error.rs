use thiserror::Error;

use crate::common::pack::PackError;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("no such job or step")]
    InvalidJobId,
    #[error("job already finished")]
    AlreadyDone,
    #[error("job is pending")]
    JobPending,
    #[error("job is not in a state that can be updated")]
    TransitionStateNoUpdate,
    #[error("request issued by unexpected user id")]
    UserIdMissing,
    #[error("access denied")]
    AccessDenied,
    #[error("operation disabled in current job state")]
    Disabled,
    #[error("step request against a pending job allocation")]
    DuplicateJobId,
    #[error("unsupported task distribution")]
    BadDistribution,
    #[error("arbitrary task distribution not supported by switch type")]
    ArbitraryUnsupported,
    #[error("string field exceeds length limit")]
    PathnameTooLong,
    #[error("invalid task count")]
    BadTaskCount,
    #[error("maximum node count below minimum")]
    InvalidNodeCount,
    #[error("requested nodes are busy")]
    NodesBusy,
    #[error("some allocated nodes are not available")]
    NodeNotAvail,
    #[error("requested node configuration is not available")]
    RequestedNodeConfigUnavailable,
    #[error("insufficient memory for requested task layout")]
    InvalidTaskMemory,
    #[error("insufficient generic resources for request")]
    InvalidGres,
    #[error("more CPUs requested than the node limit permits")]
    TooManyRequestedCpus,
    #[error("time limit exceeds partition maximum")]
    InvalidTimeLimit,
    #[error("interconnect setup failed")]
    InterconnectFailure,
    #[error("job has reached its step id limit")]
    TooManySteps,
    #[error("prolog is still running")]
    PrologRunning,
    #[error("invalid reserved port count")]
    InvalidPortCount,
    #[error("reserved ports unavailable on selected nodes")]
    PortsBusy,
    #[error("invalid completion range")]
    InvalidRange,
    #[error("state format error: {0}")]
    StateFormat(#[from] PackError),
    #[error("error: {0}")]
    GenericError(String),
}

impl From<String> for StepError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

impl From<&str> for StepError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}
