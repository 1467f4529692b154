//! Error taxonomy for the classroom core.
//!
//! None of these errors stop the process. Loop-local errors are logged and the
//! loop keeps running; buffer and sync errors surface as status flags.

use classguard_integrations::BackendError;
use classguard_storage::{Partition, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Retried with backoff; only surfaced once the retry budget is spent
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Sync is suspended until the device re-authenticates
    #[error("backend credentials expired")]
    AuthExpired,

    /// Only the named partition is affected
    #[error("local state of the {partition} partition is corrupt")]
    CorruptLocalState { partition: Partition },

    /// Degrades to an ALLOW decision
    #[error("classification failed: {0}")]
    Classification(String),

    /// Rejected; state is unchanged
    #[error("invalid transition from {from} on {trigger}")]
    InvalidTransition { from: SessionState, trigger: String },

    #[error("platform permission revoked")]
    PermissionRevoked,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<BackendError> for CoreError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::AuthExpired { .. } => Self::AuthExpired,
            BackendError::Transient(msg) | BackendError::Protocol(msg) => {
                Self::TransientNetwork(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_mapping() {
        assert!(matches!(
            CoreError::from(BackendError::AuthExpired { status: 401 }),
            CoreError::AuthExpired
        ));
        assert!(matches!(
            CoreError::from(BackendError::Transient("timeout".into())),
            CoreError::TransientNetwork(_)
        ));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = CoreError::InvalidTransition {
            from: SessionState::Finalized,
            trigger: "resume".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid transition from finalized on resume"
        );
    }
}
