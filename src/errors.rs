//! Typed errors for the tracker core.
//!
//! `TrackerError` covers local operations. `RemoteError` covers the
//! document gateway; it never escapes a local mutation as an `Err`, it is
//! folded into the mutation's `SyncAdvisory` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid email or password.")]
    InvalidCredentials,

    #[error("Email already in use.")]
    EmailTaken,

    #[error("Cannot delete '{stage}' because it contains {jobs} application(s). Move them first.")]
    StageInUse { stage: String, jobs: usize },

    #[error("No user is logged in")]
    NoActivePrincipal,

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// Only raised by explicit remote operations such as a pull, never by a
    /// local mutation.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<anyhow::Error> for TrackerError {
    fn from(err: anyhow::Error) -> Self {
        TrackerError::Storage(err)
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::Storage(err.into())
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote database is not configured")]
    NotConfigured,

    #[error("Remote request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Remote API returned {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Failed to decode remote response: {0}")]
    Decode(String),

    #[error("No async runtime available for remote sync")]
    RuntimeUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_in_use_message_names_stage() {
        let err = TrackerError::StageInUse {
            stage: "Applied".to_string(),
            jobs: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("'Applied'"));
        assert!(msg.contains("2 application"));
    }

    #[test]
    fn test_storage_error_wraps_anyhow_source() {
        let err: TrackerError = anyhow::anyhow!("disk full").into();
        match &err {
            TrackerError::Storage(inner) => assert_eq!(inner.to_string(), "disk full"),
            _ => panic!("Expected Storage variant"),
        }
    }

    #[test]
    fn test_http_error_carries_status() {
        let err = RemoteError::Http {
            status: reqwest::StatusCode::UNAUTHORIZED,
            body: "bad key".to_string(),
        };
        assert!(err.to_string().contains("401"));
    }
}
