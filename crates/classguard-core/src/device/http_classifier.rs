use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{Classification, ScreenClassifier, ScreenImage};

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    category: String,
    confidence: f32,
}

/// Classifier served over HTTP: the raw image is POSTed, a
/// `{"category", "confidence"}` object comes back
pub struct HttpClassifier {
    url: String,
    client: reqwest::Client,
}

impl HttpClassifier {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl ScreenClassifier for HttpClassifier {
    async fn classify(&self, image: &ScreenImage) -> Result<Classification> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/octet-stream")
            .body(image.bytes.clone())
            .send()
            .await
            .context("Failed to reach classifier")?;

        if !response.status().is_success() {
            anyhow::bail!("Classifier returned {}", response.status());
        }

        let parsed: ClassifyResponse = response
            .json()
            .await
            .context("Failed to parse classifier response")?;

        if !(0.0..=1.0).contains(&parsed.confidence) {
            anyhow::bail!("Classifier confidence out of range: {}", parsed.confidence);
        }

        Ok(Classification {
            label: parsed.category,
            confidence: parsed.confidence,
        })
    }
}
