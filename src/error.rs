// Error taxonomy for the refresh pipeline
//
// Library modules return anyhow::Result; these variants mark the failure
// classes the orchestrator must tell apart. Per-file parse errors and
// validation issues are captured as data, not as errors, so they never
// appear here.

use std::path::PathBuf;

/// Failure classes that cross module boundaries.
#[derive(Debug, thiserror::Error)]
pub enum BudgetlineError {
    /// A stage's structural precondition is missing; abort that stage.
    #[error("precondition failed: {message}")]
    FatalPrecondition { message: String },

    /// A refresh stage failed; triggers rollback when enabled.
    #[error("stage '{stage}' failed: {message}")]
    StageFailure { stage: String, message: String },

    /// Webhook or other notification delivery failed. Always non-fatal.
    #[error("notification failed: {0}")]
    NotificationFailure(String),

    /// Filesystem I/O error with the offending path.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl BudgetlineError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::FatalPrecondition {
            message: msg.into(),
        }
    }

    pub fn stage(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StageFailure {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// True when an anyhow error chain bottoms out in a fatal precondition.
pub fn is_precondition(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<BudgetlineError>(),
        Some(BudgetlineError::FatalPrecondition { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BudgetlineError::precondition("documents root missing");
        assert_eq!(err.to_string(), "precondition failed: documents root missing");

        let err = BudgetlineError::stage("build", "disk full");
        assert!(err.to_string().contains("build"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_is_precondition_through_anyhow() {
        let err: anyhow::Error = BudgetlineError::precondition("no db").into();
        assert!(is_precondition(&err));

        let err: anyhow::Error = BudgetlineError::stage("validate", "boom").into();
        assert!(!is_precondition(&err));
    }
}
