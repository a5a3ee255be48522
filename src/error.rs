use thiserror::Error;

use crate::queue::{JobId, SubmissionId};

/// Errors returned synchronously from `submit`; none of them enter the queue
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("queue is at capacity ({capacity} jobs in flight)")]
    AdmissionRejected { capacity: usize },

    #[error("service is draining and no longer accepts submissions")]
    Draining,

    #[error("invalid submission: {0}")]
    Validation(String),

    #[error("submission {0} already has an active job")]
    DuplicateSubmission(SubmissionId),

    #[error("problem provider failed: {0}")]
    Provider(#[source] anyhow::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} already finished")]
    AlreadyFinished(JobId),
}
