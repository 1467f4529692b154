//! Backend push channel for session commands.
//!
//! Commands are fetched by long-polling. When a shared secret is configured,
//! every response body must carry a valid HMAC-SHA256 signature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::error::BackendError;
use crate::http::{build_client, normalize_base_url, ResponseExt};

/// Header carrying the hex HMAC of the response body
pub const SIGNATURE_HEADER: &str = "X-Classguard-Signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Start,
    Pause,
    Resume,
    End,
    Finalize,
}

impl CommandKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::End => "end",
            Self::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session policy carried by a `start` command; unset fields keep local config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicyOverride {
    pub interval_secs: Option<u64>,
    pub confidence_threshold: Option<f32>,
    /// Category name to `allow` / `block`
    pub rules: BTreeMap<String, String>,
    pub always_on_lock: Option<bool>,
}

/// Command pushed by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushCommand {
    pub command_id: String,
    pub session_id: Uuid,
    pub command: CommandKind,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub policy: Option<SessionPolicyOverride>,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    commands: Vec<PushCommand>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
struct AckRequest<'a> {
    command_ids: &'a [String],
}

/// Source of pushed commands
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// Wait for the next commands, in the order the backend issued them.
    /// An empty vector means the poll timed out with nothing new.
    ///
    /// # Errors
    ///
    /// Returns a `BackendError` if the poll fails or the response is not
    /// correctly signed
    async fn poll(&self) -> Result<Vec<PushCommand>, BackendError>;

    /// Acknowledge receipt of commands
    ///
    /// # Errors
    ///
    /// Returns a `BackendError` if the request fails
    async fn acknowledge(&self, command_ids: &[String]) -> Result<(), BackendError>;
}

/// Long-poll client for the push channel
pub struct PushClient {
    base_url: String,
    api_token: String,
    device_id: String,
    secret: Option<String>,
    poll_timeout: Duration,
    cursor: Mutex<Option<String>>,
    client: reqwest::Client,
}

impl PushClient {
    /// Create a new push client
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created
    pub fn new(
        base_url: &str,
        api_token: String,
        device_id: String,
        secret: Option<String>,
        poll_timeout: Duration,
    ) -> anyhow::Result<Self> {
        // The HTTP timeout must outlast the server-side hold
        let client = build_client(poll_timeout + Duration::from_secs(10))?;
        Ok(Self {
            base_url: normalize_base_url(base_url),
            api_token,
            device_id,
            secret,
            poll_timeout,
            cursor: Mutex::new(None),
            client,
        })
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}/v1/devices/{}/{}", self.base_url, self.device_id, path)
    }

    fn decode(&self, body: &[u8], signature: Option<&str>) -> Result<PollResponse, BackendError> {
        if let Some(secret) = &self.secret {
            let valid = signature.is_some_and(|sig| verify_command_signature(body, sig, secret));
            if !valid {
                return Err(BackendError::Protocol(
                    "push response signature missing or invalid".to_string(),
                ));
            }
        }
        serde_json::from_slice(body)
            .map_err(|e| BackendError::Protocol(format!("Failed to parse push response: {e}")))
    }
}

#[async_trait]
impl CommandSource for PushClient {
    async fn poll(&self) -> Result<Vec<PushCommand>, BackendError> {
        let cursor = self
            .cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut query = vec![("timeout", self.poll_timeout.as_secs().to_string())];
        if let Some(cursor) = cursor {
            query.push(("after", cursor));
        }

        let response = self
            .client
            .get(self.build_url("commands"))
            .bearer_auth(&self.api_token)
            .query(&query)
            .send()
            .await?
            .ensure_success("Push")
            .await?;

        let signature = response
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        let decoded = self.decode(&body, signature.as_deref())?;

        if let Some(next) = decoded.cursor {
            *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = Some(next);
        }
        Ok(decoded.commands)
    }

    async fn acknowledge(&self, command_ids: &[String]) -> Result<(), BackendError> {
        if command_ids.is_empty() {
            return Ok(());
        }
        self.client
            .post(self.build_url("commands/ack"))
            .bearer_auth(&self.api_token)
            .json(&AckRequest { command_ids })
            .send()
            .await?
            .ensure_success("Push ack")
            .await?;
        Ok(())
    }
}

/// Verify a push response signature (hex HMAC-SHA256 of the raw body)
#[must_use]
pub fn verify_command_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    use std::fmt::Write;

    let mac = hmac_sha256::HMAC::mac(payload, secret.as_bytes());
    let mut computed = String::with_capacity(64);
    for byte in mac {
        let _ = write!(computed, "{byte:02x}");
    }

    constant_time_compare(&computed, &signature.to_ascii_lowercase())
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
