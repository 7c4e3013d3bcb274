//! Debugger discovery over the host's HTTP target listing.

use super::InjectError;
use conductor_core::{ConductorError, ConductorResult};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-request timeout for the target listing.
const LISTING_TIMEOUT: Duration = Duration::from_millis(500);

/// One entry of the `/json` target listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDescriptor {
    pub title: String,
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

/// Locates the debugger URL of one named target.
#[derive(Debug, Clone)]
pub struct Discovery {
    listing_url: String,
    target_title: String,
    http_client: reqwest::Client,
}

impl Discovery {
    pub fn new(
        listing_url: impl Into<String>,
        target_title: impl Into<String>,
    ) -> ConductorResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(LISTING_TIMEOUT)
            .build()
            .map_err(|e| ConductorError::Discovery(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            listing_url: listing_url.into(),
            target_title: target_title.into(),
            http_client,
        })
    }

    /// Fetch the listing once and return the target's debugger URL.
    pub async fn find_debugger_url(&self) -> Result<String, InjectError> {
        let resp = self
            .http_client
            .get(&self.listing_url)
            .send()
            .await
            .map_err(|e| InjectError::Refused(format!("{}: {e}", self.listing_url)))?;

        if !resp.status().is_success() {
            return Err(InjectError::BadStatus(resp.status().as_u16()));
        }

        let targets: Vec<TargetDescriptor> = resp
            .json()
            .await
            .map_err(|e| InjectError::TargetNotFound(format!("bad target listing: {e}")))?;

        select_target(&targets, &self.target_title)
    }

    /// Poll the listing until the target shows up or `cancel` fires.
    pub async fn wait_for_debugger_url(
        &self,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Option<String> {
        loop {
            match self.find_debugger_url().await {
                Ok(url) => {
                    debug!(url = %url, "found debugger URL");
                    return Some(url);
                }
                Err(e) => {
                    info!(error = %e, "connection to Steam client failed, retrying...");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }
}

/// Pick the debugger URL of the target titled `title`.
pub fn select_target(targets: &[TargetDescriptor], title: &str) -> Result<String, InjectError> {
    let target = targets
        .iter()
        .find(|t| t.title == title)
        .ok_or_else(|| InjectError::TargetNotFound(title.to_string()))?;

    target
        .web_socket_debugger_url
        .clone()
        .ok_or_else(|| InjectError::TargetNotFound(format!("{title} has no debugger URL")))
}
