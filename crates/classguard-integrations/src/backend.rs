use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::BackendError;
use crate::http::{build_client, normalize_base_url, ResponseExt};

// ============================================================================
// Wire types
// ============================================================================

/// One event in an ingestion batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestItem {
    pub device_id: String,
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    /// `attention`, `enforcement` or `emergency`
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub captured_at: DateTime<Utc>,
}

impl IngestItem {
    /// Idempotency key the backend echoes in its per-item result
    #[must_use]
    pub fn key(&self) -> String {
        match (self.sequence_number, self.request_id) {
            (_, Some(request_id)) => format!("req:{request_id}"),
            (Some(seq), None) => format!("seq:{seq}"),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct IngestRequest<'a> {
    items: &'a [IngestItem],
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    results: Vec<ItemResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    Duplicate,
    InvalidSession,
    #[serde(other)]
    Other,
}

/// Backend verdict for one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub key: String,
    pub status: ItemStatus,
    #[serde(default)]
    pub reason: Option<RejectReason>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// What the sender should do with an item after a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Accepted,
    /// Already stored server-side; counts as delivered
    Duplicate,
    /// Session unknown or closed; never retried
    InvalidSession,
    /// Any other rejection; retried within budget
    Rejected(String),
}

impl ItemResult {
    #[must_use]
    pub fn outcome(&self) -> ItemOutcome {
        match (self.status, &self.reason) {
            (ItemStatus::Accepted, _) => ItemOutcome::Accepted,
            (ItemStatus::Rejected, Some(RejectReason::Duplicate)) => ItemOutcome::Duplicate,
            (ItemStatus::Rejected, Some(RejectReason::InvalidSession)) => {
                ItemOutcome::InvalidSession
            }
            (ItemStatus::Rejected, _) => ItemOutcome::Rejected(
                self.detail
                    .clone()
                    .unwrap_or_else(|| "rejected".to_string()),
            ),
        }
    }
}

#[derive(Debug, Serialize)]
struct FinalizeRequest<'a> {
    device_id: &'a str,
}

// ============================================================================
// Ingestion trait
// ============================================================================

/// Remote store the outbox drains into
#[async_trait]
pub trait IngestionBackend: Send + Sync {
    /// Send a batch. Results come back per item, keyed by idempotency key.
    ///
    /// # Errors
    ///
    /// Returns a `BackendError` if the batch as a whole could not be delivered
    async fn send_batch(&self, items: &[IngestItem]) -> Result<Vec<ItemResult>, BackendError>;

    /// Ask the backend to mark a session's attendance records final
    ///
    /// # Errors
    ///
    /// Returns a `BackendError` if the request fails
    async fn finalize_session(&self, device_id: &str, session_id: Uuid)
        -> Result<(), BackendError>;
}

// ============================================================================
// HTTP client
// ============================================================================

/// HTTP client for the ingestion API
pub struct BackendClient {
    base_url: String,
    api_token: String,
    client: reqwest::Client,
}

impl BackendClient {
    /// Create a new backend client
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created
    pub fn new(base_url: &str, api_token: String, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_token,
            client: build_client(timeout)?,
        })
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }
}

#[async_trait]
impl IngestionBackend for BackendClient {
    async fn send_batch(&self, items: &[IngestItem]) -> Result<Vec<ItemResult>, BackendError> {
        let url = self.build_url("ingest");
        log::debug!("POST {url} ({} items)", items.len());

        let response: IngestResponse = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&IngestRequest { items })
            .send()
            .await?
            .ensure_success("Ingestion")
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("Failed to parse ingest response: {e}")))?;

        Ok(response.results)
    }

    async fn finalize_session(
        &self,
        device_id: &str,
        session_id: Uuid,
    ) -> Result<(), BackendError> {
        let url = self.build_url(&format!("sessions/{session_id}/finalize"));
        log::debug!("POST {url}");

        self.client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&FinalizeRequest { device_id })
            .send()
            .await?
            .ensure_success("Finalize")
            .await?;
        Ok(())
    }
}
