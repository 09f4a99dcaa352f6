//! HTTP transport to the schedule server.

use anyhow::{Context, Result};
use serde::Serialize;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Body of a watering-status post.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusMsg {
    pub(crate) is_watering: bool,
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

pub(crate) trait Network {
    /// GET `url` and return the body text.
    async fn fetch(&self, url: &str) -> Result<String>;

    /// POST `{"isWatering": <bool>}` to `url`.
    async fn post_status(&self, url: &str, is_watering: bool) -> Result<()>;

    /// Tell the server the valve sensor never confirmed. Best-effort.
    async fn notify_no_ack(&self, url: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

/// Opens a fresh connection per request; nothing is kept alive between
/// cycles.
pub(crate) struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub(crate) fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl Network for HttpNetwork {
    async fn fetch(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?
            .error_for_status()
            .with_context(|| format!("GET {url} returned an error status"))?;
        resp.text()
            .await
            .with_context(|| format!("GET {url}: failed to read body"))
    }

    async fn post_status(&self, url: &str, is_watering: bool) -> Result<()> {
        self.client
            .post(url)
            .json(&StatusMsg { is_watering })
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?
            .error_for_status()
            .with_context(|| format!("POST {url} returned an error status"))?;
        tracing::debug!(url, is_watering, "watering status posted");
        Ok(())
    }

    async fn notify_no_ack(&self, url: &str) -> Result<()> {
        self.fetch(url).await.map(|_| ())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
