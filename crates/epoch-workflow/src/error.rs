//! Error types for epoch orchestration
//!
//! - `ActivityError`: one activity attempt failed, classified for retry
//! - `WorkflowError`: a flow cannot continue

use epoch_core::{EpochId, ProtocolError};

/// Failure of a single activity attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivityError {
    /// Transient; the retry policy may run the activity again
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent; retrying cannot help
    #[error("non-retryable: {0}")]
    NonRetryable(String),
}

impl ActivityError {
    /// A required dependency was never injected
    #[must_use]
    pub fn not_configured(what: &str) -> Self {
        Self::NonRetryable(format!("{what} not configured"))
    }

    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Reasons a flow stops
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Activity failed permanently; an operator has to fix the setup
    #[error("activity '{activity}' misconfigured: {reason}")]
    Misconfigured { activity: String, reason: String },

    /// Activity still failing after every retry
    #[error("activity '{activity}' failed after retries: {reason}")]
    ActivityFailed { activity: String, reason: String },

    /// A slice failed; siblings were cancelled
    #[error("slice '{slice}' failed: {reason}")]
    SliceFailed {
        slice: String,
        reason: String,
        /// Whether the last attempt failed transiently
        retryable: bool,
    },

    /// Protocol refused an operation the flow depends on
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Signal channel closed before the epoch finished
    #[error("signal channel closed for epoch {0}")]
    SignalsClosed(EpochId),

    /// History journal read/write failed
    #[error("history error: {0}")]
    History(String),

    /// An epoch with this id is already running
    #[error("epoch {0} is already running")]
    AlreadyRunning(EpochId),

    /// No running epoch with this id
    #[error("no running epoch {0}")]
    UnknownEpoch(EpochId),

    /// No flow registered under this name
    #[error("no flow registered as '{0}'")]
    UnknownFlow(String),

    /// A flow was asked to start from something it cannot work
    #[error("cannot start flow '{flow}': {reason}")]
    InvalidRequest { flow: String, reason: String },

    /// Flow task panicked or was aborted
    #[error("flow task failed: {0}")]
    Join(String),
}

impl WorkflowError {
    /// Classify a slice failure that survived the retry policy
    #[must_use]
    pub fn from_slice(slice: &str, error: ActivityError) -> Self {
        Self::SliceFailed {
            slice: slice.to_string(),
            retryable: error.is_retryable(),
            reason: error.to_string(),
        }
    }

    /// Classify an activity failure that survived the retry policy
    #[must_use]
    pub fn from_activity(activity: &str, error: ActivityError) -> Self {
        match error {
            ActivityError::NonRetryable(reason) => Self::Misconfigured {
                activity: activity.to_string(),
                reason,
            },
            ActivityError::Retryable(reason) => Self::ActivityFailed {
                activity: activity.to_string(),
                reason,
            },
        }
    }

    /// Check if re-running the flow could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ActivityFailed { .. }
                | Self::SliceFailed {
                    retryable: true,
                    ..
                }
                | Self::History(_)
        )
    }

    /// Check if an operator must intervene
    #[must_use]
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            Self::Misconfigured { .. }
                | Self::SliceFailed {
                    retryable: false,
                    ..
                }
                | Self::Protocol(_)
                | Self::Join(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_retryable_activity_needs_an_operator() {
        let err = WorkflowError::from_activity(
            "check_constraints",
            ActivityError::not_configured("constraint evaluator"),
        );
        assert!(matches!(err, WorkflowError::Misconfigured { .. }));
        assert!(err.requires_operator());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "activity 'check_constraints' misconfigured: constraint evaluator not configured"
        );
    }

    #[test]
    fn exhausted_retries_stay_retryable() {
        let err = WorkflowError::from_activity(
            "record_audit_event",
            ActivityError::Retryable("sink unavailable".into()),
        );
        assert!(err.is_retryable());
        assert!(!err.requires_operator());
    }

    #[test]
    fn slice_failures_keep_their_classification() {
        let broken =
            WorkflowError::from_slice("s2", ActivityError::NonRetryable("no toolchain".into()));
        assert!(broken.requires_operator());
        assert!(!broken.is_retryable());
        assert_eq!(broken.to_string(), "slice 's2' failed: non-retryable: no toolchain");

        let flaky =
            WorkflowError::from_slice("s1", ActivityError::Retryable("worker lost".into()));
        assert!(flaky.is_retryable());
        assert!(!flaky.requires_operator());
    }

    #[test]
    fn bad_start_requests_are_neither_retryable_nor_operator_work() {
        let err = WorkflowError::InvalidRequest {
            flow: "review".into(),
            reason: "phase intake is not a review phase".into(),
        };
        assert!(!err.is_retryable());
        assert!(!err.requires_operator());
        assert_eq!(
            WorkflowError::UnknownFlow("deploy".into()).to_string(),
            "no flow registered as 'deploy'"
        );
    }
}
