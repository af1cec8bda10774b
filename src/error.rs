use thiserror::Error;

use crate::{
    cluster::ClusterError,
    key::{KeyError, KeyValue},
    oplog::OpLogError,
    plan::{PlanError, SplitOperation},
    poll::PollError,
};

/// Errors that end a balanced split run. The operation log is left on disk
/// for every one of them.
#[derive(Debug, Error)]
pub enum SplitError {
    /// A key read from the cluster does not fit the key space.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// Shard boundaries could not be turned into a plan.
    #[error(transparent)]
    Plan(#[from] PlanError),
    /// The operation log failed or is corrupt.
    #[error(transparent)]
    OpLog(#[from] OpLogError),
    /// The shard owning a split point does not start where the plan says.
    #[error(
        "plan no longer matches the cluster: {operation} expects shard start {:x}, found {:x}",
        .operation.start,
        .found
    )]
    PlanInconsistency {
        /// Operation being executed.
        operation: SplitOperation,
        /// Start key of the shard that owns the split point.
        found: KeyValue,
    },
    /// A wait on the cluster hit its attempt or time ceiling.
    #[error("timed out waiting for {what} after {attempts} attempts")]
    SplitTimeout {
        /// What was being waited for.
        what: String,
        /// Probes issued.
        attempts: u32,
    },
    /// The run was cancelled.
    #[error("balanced split cancelled")]
    Cancelled,
    /// The cluster failed with a non-transient error.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl From<PollError> for SplitError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::TimedOut { what, attempts } => SplitError::SplitTimeout { what, attempts },
            PollError::Cancelled => SplitError::Cancelled,
            PollError::Cluster(err) => SplitError::Cluster(err),
        }
    }
}
