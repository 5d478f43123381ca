// =============================================================================
// Alerter (C9) — opaque best-effort notification port (§4.9).
// =============================================================================
//
// The runner and watchdog never block on delivery: a failed send is logged
// and swallowed rather than propagated, since a notification outage must
// never stop the kill switch or the runner from completing its own work.
// =============================================================================

use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait Alerter: Send + Sync {
    /// Best-effort delivery of `text`. Implementations must not panic or
    /// block indefinitely; callers do not retry on failure.
    async fn send(&self, text: &str);
}

/// Writes alerts to the log at `warn` level. Used when no external channel
/// is configured — always available, never fails.
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn send(&self, text: &str) {
        warn!(alert = text, "alert");
    }
}

/// Posts to a webhook URL (e.g. a chat incoming-webhook). Delivery failures
/// are logged, never surfaced to the caller.
pub struct WebhookAlerter {
    url: String,
    client: reqwest::Client,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn send(&self, text: &str) {
        let body = serde_json::json!({ "text": text });
        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "webhook alert delivery rejected"),
            Err(e) => warn!(error = %e, "webhook alert delivery failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_alerter_never_panics() {
        LogAlerter.send("test alert").await;
    }
}
