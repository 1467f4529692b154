//! Optional classroom hardware hub.
//!
//! The hub reports whether the device is near it. Readings only relax policy;
//! an unreachable hub is the same as no hub.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::http::{build_client, normalize_base_url, ResponseExt};

/// Header carrying the hub shared secret
pub const HUB_SECRET_HEADER: &str = "X-Hub-Secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proximity {
    Present,
    Away,
}

#[derive(Debug, Deserialize)]
struct ProximityResponse {
    status: Proximity,
}

/// Auxiliary proximity signal
#[async_trait]
pub trait ProximitySource: Send + Sync {
    /// Current reading, `None` when unavailable
    async fn proximity(&self) -> Option<Proximity>;
}

/// HTTP client for the hub
pub struct HubClient {
    base_url: String,
    shared_secret: String,
    device_id: String,
    client: reqwest::Client,
}

impl HubClient {
    /// Create a new hub client
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created
    pub fn new(
        base_url: &str,
        shared_secret: String,
        device_id: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url),
            shared_secret,
            device_id,
            client: build_client(timeout)?,
        })
    }

    async fn fetch(&self) -> Result<Proximity, crate::BackendError> {
        let response: ProximityResponse = self
            .client
            .get(format!("{}/proximity", self.base_url))
            .query(&[("device", self.device_id.as_str())])
            .header(HUB_SECRET_HEADER, &self.shared_secret)
            .send()
            .await?
            .ensure_success("Hub")
            .await?
            .json()
            .await?;
        Ok(response.status)
    }
}

#[async_trait]
impl ProximitySource for HubClient {
    async fn proximity(&self) -> Option<Proximity> {
        match self.fetch().await {
            Ok(reading) => Some(reading),
            Err(e) => {
                log::debug!("Hub unavailable: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proximity() {
        let parsed: ProximityResponse = serde_json::from_str(r#"{"status":"away"}"#).unwrap();
        assert_eq!(parsed.status, Proximity::Away);
    }

    #[tokio::test]
    async fn test_unreachable_hub_reads_none() {
        let hub = HubClient::new(
            "http://127.0.0.1:9",
            "secret".to_string(),
            "dev-1".to_string(),
            Duration::from_millis(500),
        )
        .unwrap();
        assert_eq!(hub.proximity().await, None);
    }
}
