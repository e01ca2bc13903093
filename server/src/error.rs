use std::{error::Error, fmt, io};

use model::{PolicyErr, RoundId};

use crate::{aggregation::AggregationErr, checkpoint::CheckpointErr};

/// The session's result type.
pub type Result<T> = std::result::Result<T, SessionErr>;

/// Failures that end the whole session.
#[derive(Debug)]
pub enum SessionErr {
    /// Persisting or loading a round failed, resumability can't be guaranteed.
    Checkpoint(CheckpointErr),
    /// The retry limit of a round was exhausted.
    Aborted { round_id: RoundId, reason: String },
    /// Not enough clients were admitted before the admission timeout.
    QuorumNotMet { connected: usize, required: usize },
    /// The operator asked the session to stop.
    Stopped,
    InvalidConfig(String),
    Io(io::Error),
}

impl fmt::Display for SessionErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionErr::Checkpoint(e) => write!(f, "checkpoint failure: {e}"),
            SessionErr::Aborted { round_id, reason } => {
                write!(f, "retry limit exhausted at round {round_id}: {reason}")
            }
            SessionErr::QuorumNotMet {
                connected,
                required,
            } => write!(
                f,
                "admission timed out with {connected} connected clients, {required} required"
            ),
            SessionErr::Stopped => f.write_str("stopped by the operator"),
            SessionErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            SessionErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for SessionErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SessionErr::Checkpoint(e) => Some(e),
            SessionErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CheckpointErr> for SessionErr {
    fn from(value: CheckpointErr) -> Self {
        Self::Checkpoint(value)
    }
}

impl From<io::Error> for SessionErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries.
impl From<SessionErr> for io::Error {
    fn from(value: SessionErr) -> Self {
        match value {
            SessionErr::Io(e) => e,
            SessionErr::InvalidConfig(_) => io::Error::new(io::ErrorKind::InvalidInput, value),
            other => io::Error::other(other),
        }
    }
}

/// Why a single round attempt failed. None of these end the session by themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundFailure {
    NoClientsSelected,
    QuorumNotMet { active: usize, required: usize },
    Policy(PolicyErr),
    Aggregation(AggregationErr),
}

impl fmt::Display for RoundFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundFailure::NoClientsSelected => f.write_str("no clients selected"),
            RoundFailure::QuorumNotMet { active, required } => {
                write!(f, "quorum not met: {active} of {required} required clients")
            }
            RoundFailure::Policy(e) => write!(f, "policy failure: {e}"),
            RoundFailure::Aggregation(e) => write!(f, "aggregation error: {e}"),
        }
    }
}

impl Error for RoundFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RoundFailure::Policy(e) => Some(e),
            RoundFailure::Aggregation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PolicyErr> for RoundFailure {
    fn from(value: PolicyErr) -> Self {
        Self::Policy(value)
    }
}

impl From<AggregationErr> for RoundFailure {
    fn from(value: AggregationErr) -> Self {
        Self::Aggregation(value)
    }
}
