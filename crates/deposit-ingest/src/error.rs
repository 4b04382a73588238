//! Error types for deposit ingestion
//!
//! `JobError` is the taxonomy jobs report to whoever scheduled them. Only two
//! of its variants ever leave [`DepositJob::run`](crate::job::DepositJob::run):
//! [`JobError::Failed`] and [`JobError::Interrupted`]. Everything else is
//! folded into `Failed` at that boundary.

use deposit_common::{DepositId, ObjectId};
use thiserror::Error;

/// Errors raised by the deposit graph model and its store
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Deposit model not found: {0}")]
    DepositNotFound(DepositId),

    #[error("Staged resource not found: {0}")]
    ResourceNotFound(ObjectId),

    #[error("Invalid deposit model: {0}")]
    Invalid(String),

    #[error("Model persistence error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by a repository backend
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Repository object not found: {0}")]
    NotFound(ObjectId),

    #[error("Repository object already exists: {0}")]
    AlreadyExists(ObjectId),

    #[error("Cannot add {child} as a member of {parent}: {reason}")]
    InvalidMembership {
        parent: ObjectId,
        child: ObjectId,
        reason: String,
    },

    #[error("IO error while transferring content: {0}")]
    Io(#[from] std::io::Error),

    #[error("Repository backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by deposit jobs
#[derive(Error, Debug)]
pub enum JobError {
    /// Fatal, non-retriable failure raised through `fail_job`
    #[error("{message}")]
    Failed {
        message: String,
        details: Option<String>,
    },

    /// Cooperative cancellation was observed
    #[error("Job interrupted: {0}")]
    Interrupted(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A concurrent task panicked or was torn down
    #[error("Task execution failed: {0}")]
    Task(String),

    /// Failure reported by an external collaborator
    #[error(transparent)]
    Service(#[from] anyhow::Error),
}

impl JobError {
    /// Build the fatal failure error carrying a short message and long-form detail
    pub fn failed(message: impl Into<String>, details: impl Into<String>) -> Self {
        JobError::Failed {
            message: message.into(),
            details: Some(details.into()),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, JobError::Interrupted(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, JobError::Failed { .. })
    }

    /// Long-form, human-readable detail for a failure
    pub fn details(&self) -> Option<&str> {
        match self {
            JobError::Failed { details, .. } => details.as_deref(),
            _ => None,
        }
    }

    /// Fold any error into one of the two kinds a scheduler sees
    pub fn into_reportable(self) -> Self {
        match self {
            JobError::Failed { .. } | JobError::Interrupted(_) => self,
            other => JobError::Failed {
                message: "Unexpected error while running job".to_string(),
                details: Some(error_chain(&other)),
            },
        }
    }
}

/// Render an error and all of its sources on one line
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !rendered.ends_with(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_keeps_details() {
        let err = JobError::failed("Missing staging location", "file f1 has no location");
        assert!(err.is_failed());
        assert_eq!(err.to_string(), "Missing staging location");
        assert_eq!(err.details(), Some("file f1 has no location"));
    }

    #[test]
    fn test_into_reportable_folds_other_errors() {
        let id: ObjectId = "obj-1".parse().unwrap();
        let err = JobError::from(RepositoryError::NotFound(id)).into_reportable();

        assert!(err.is_failed());
        assert!(err.details().unwrap().contains("obj-1"));
    }

    #[test]
    fn test_into_reportable_keeps_interrupted() {
        let err = JobError::Interrupted("paused".to_string()).into_reportable();
        assert!(err.is_interrupted());
    }

    #[test]
    fn test_service_errors_keep_context() {
        let err = JobError::from(anyhow::anyhow!("connection refused").context("status lookup"));
        let reported = err.into_reportable();
        assert!(reported.details().unwrap().contains("status lookup"));
    }
}
