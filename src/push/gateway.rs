//! Push gateway client for delivering notifications to sink callbacks.
//!
//! Each linked account carries a callback endpoint and a delivery
//! token. Tokens sharing an endpoint and an identical notification are
//! sent as one batch; the sink reports per-token outcomes so a single
//! bad token does not fail the rest of the batch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::AppError;
use crate::metrics::UPSTREAM_REQUESTS_TOTAL;

/// Copy limits imposed by the sink's push API.
pub const MAX_TITLE_CHARS: usize = 32;
pub const MAX_BODY_CHARS: usize = 128;

/// A notification shaped for the sink push API.
///
/// The idempotency key equals the source event id, so the sink can
/// drop duplicates even if the relay sends the same event twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notification {
    pub idempotency_key: String,
    pub title: String,
    pub body: String,
    pub target_url: String,
}

impl Notification {
    /// Builds a notification, truncating title and body to the sink's
    /// copy limits on character boundaries.
    pub fn new(idempotency_key: &str, title: &str, body: &str, target_url: &str) -> Self {
        Self {
            idempotency_key: idempotency_key.to_string(),
            title: truncate_chars(title, MAX_TITLE_CHARS),
            body: truncate_chars(body, MAX_BODY_CHARS),
            target_url: target_url.to_string(),
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}

/// Per-token outcome of one batch send.
///
/// Tokens absent from all three lists are treated as accepted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReceipt {
    #[serde(default)]
    pub successful_tokens: Vec<String>,
    #[serde(default)]
    pub invalid_tokens: Vec<String>,
    #[serde(default)]
    pub rate_limited_tokens: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest<'a> {
    notification_id: &'a str,
    title: &'a str,
    body: &'a str,
    target_url: &'a str,
    tokens: &'a [String],
}

/// Client for the sink's push API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Sends one notification to a callback endpoint on behalf of a
    /// batch of delivery tokens.
    ///
    /// `Ok` means the endpoint acknowledged the batch; per-token
    /// failures are reported in the receipt. `Err` means the batch as
    /// a whole did not go through (network error or non-success
    /// status) and no token-level outcome is known.
    async fn send_batch(
        &self,
        callback_endpoint: &str,
        tokens: &[String],
        notification: &Notification,
    ) -> Result<BatchReceipt, AppError>;
}

/// HTTP implementation of [`PushGateway`].
pub struct HttpPushGateway {
    http_client: Arc<reqwest::Client>,
    timeout: Duration,
}

impl HttpPushGateway {
    pub fn new(http_client: Arc<reqwest::Client>, timeout: Duration) -> Self {
        Self {
            http_client,
            timeout,
        }
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send_batch(
        &self,
        callback_endpoint: &str,
        tokens: &[String],
        notification: &Notification,
    ) -> Result<BatchReceipt, AppError> {
        let request = PushRequest {
            notification_id: &notification.idempotency_key,
            title: &notification.title,
            body: &notification.body,
            target_url: &notification.target_url,
            tokens,
        };

        tracing::debug!(
            endpoint = %callback_endpoint,
            tokens = tokens.len(),
            event = %notification.idempotency_key,
            "Sending notification batch"
        );

        let response = self
            .http_client
            .post(callback_endpoint)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&["sink", status.as_str()])
                    .inc();

                if !status.is_success() {
                    return Err(AppError::SinkRejected(format!(
                        "Callback endpoint {} returned {}",
                        callback_endpoint, status
                    )));
                }

                let receipt = resp.json::<BatchReceipt>().await.map_err(|e| {
                    AppError::SinkRejected(format!("Invalid batch receipt: {}", e))
                })?;
                Ok(receipt)
            }
            Err(e) => {
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&["sink", "error"])
                    .inc();
                Err(AppError::SinkRejected(format!(
                    "Failed to reach callback endpoint {}: {}",
                    callback_endpoint, e
                )))
            }
        }
    }
}
