//! Classification of backend failures.

use reqwest::StatusCode;

/// Backend failure, classified by how the caller should react
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Connectivity loss, timeouts, 5xx and rate limiting. Retried with backoff.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Credentials rejected. Sending stops until re-authentication.
    #[error("backend rejected credentials ({status})")]
    AuthExpired { status: u16 },

    /// Unexpected status or undecodable response
    #[error("backend protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Classify a non-success HTTP status
    #[must_use]
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        };

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::AuthExpired {
                status: status.as_u16(),
            },
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Self::Transient(detail),
            s if s.is_server_error() => Self::Transient(detail),
            _ => Self::Protocol(detail),
        }
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub const fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired { .. })
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status, "");
        }
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}
