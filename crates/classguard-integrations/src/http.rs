//! HTTP utilities shared by the backend, push and hub clients.

use std::time::Duration;

use crate::error::BackendError;

/// Extension trait for `reqwest::Response` that classifies error statuses.
#[async_trait::async_trait]
pub trait ResponseExt {
    /// Ensure the response status is successful.
    ///
    /// # Errors
    ///
    /// Returns a classified `BackendError` carrying the status code and
    /// response body if the status is not 2xx.
    async fn ensure_success(self, api_name: &str) -> Result<Self, BackendError>
    where
        Self: Sized;
}

#[async_trait::async_trait]
impl ResponseExt for reqwest::Response {
    async fn ensure_success(self, api_name: &str) -> Result<Self, BackendError> {
        if !self.status().is_success() {
            let status = self.status();
            let error_text = self.text().await.unwrap_or_default();
            log::debug!("{api_name} API error ({status}): {error_text}");
            return Err(BackendError::from_status(status, &error_text));
        }
        Ok(self)
    }
}

/// Build an HTTP client with the given request timeout
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be created
pub fn build_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;

    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")
}

/// Strip a trailing slash so paths can be appended with `/`
#[must_use]
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://api.example.com/"),
            "https://api.example.com"
        );
        assert_eq!(normalize_base_url("http://hub.local"), "http://hub.local");
    }
}
