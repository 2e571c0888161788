//! Outbound message delivery for autonomously executed actions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DeliveryConfig;
use crate::error::{GigError, Result};
use crate::types::{ActionType, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRequest {
    pub user_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: ActionType,
}

impl DeliveryRequest {
    /// Client-facing text for the action.
    pub fn message(&self) -> String {
        match self.action {
            ActionType::SendInvoiceReminder => {
                "Hi! Just a reminder that your invoice is still outstanding. Thank you!".into()
            }
            ActionType::AutoSendGentleNudge => {
                "Hi! Checking that the invoice came through okay. Let me know if you have any questions.".into()
            }
            ActionType::SendFollowUpText => {
                "Hi! Following up on your request. Are you still looking for help?".into()
            }
            ActionType::SuggestStatusUpdate => {
                "Hi! Checking in about your scheduled job.".into()
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// `Err` is a transport failure; a gateway rejection is an `Ok` receipt
    /// with `success = false`.
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt>;
}

// ---------------------------------------------------------------------------
// LogDelivery
// ---------------------------------------------------------------------------

/// Dry run: records the send in the trace log only.
#[derive(Debug, Clone, Default)]
pub struct LogDelivery;

#[async_trait]
impl DeliveryChannel for LogDelivery {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt> {
        let message = request.message();
        tracing::info!(
            user = %request.user_id,
            entity = %request.entity_type,
            id = %request.entity_id,
            action = %request.action,
            %message,
            "delivery (dry run)"
        );
        Ok(DeliveryReceipt {
            success: true,
            message_content: Some(message),
            channel: Some("log".into()),
            error: None,
        })
    }
}

// ---------------------------------------------------------------------------
// WebhookDelivery
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WebhookPayload<'a> {
    user_id: &'a str,
    entity_type: EntityType,
    entity_id: &'a str,
    action: ActionType,
    message: &'a str,
}

/// Gateway reply; both fields are optional.
#[derive(Deserialize, Default)]
struct WebhookReply {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// POSTs each send as JSON to an SMS/email gateway.
pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
}

impl WebhookDelivery {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GigError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DeliveryChannel for WebhookDelivery {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryReceipt> {
        let message = request.message();
        let payload = WebhookPayload {
            user_id: &request.user_id,
            entity_type: request.entity_type,
            entity_id: &request.entity_id,
            action: request.action,
            message: &message,
        };
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GigError::Delivery(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let reply: WebhookReply = serde_json::from_str(&body).unwrap_or_default();

        if status.is_success() {
            Ok(DeliveryReceipt {
                success: true,
                message_content: Some(message),
                channel: Some(reply.channel.unwrap_or_else(|| "webhook".into())),
                error: None,
            })
        } else {
            tracing::warn!(%status, url = %self.url, "delivery gateway rejected send");
            Ok(DeliveryReceipt {
                success: false,
                message_content: Some(message),
                channel: reply.channel.or_else(|| Some("webhook".into())),
                error: Some(reply.error.unwrap_or_else(|| format!("gateway returned {status}"))),
            })
        }
    }
}

/// Build the configured delivery channel.
pub fn from_config(config: &DeliveryConfig) -> Result<Arc<dyn DeliveryChannel>> {
    match config {
        DeliveryConfig::Log => Ok(Arc::new(LogDelivery)),
        DeliveryConfig::Webhook { url, timeout_secs } => Ok(Arc::new(WebhookDelivery::new(
            url.clone(),
            Duration::from_secs(*timeout_secs),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn request() -> DeliveryRequest {
        DeliveryRequest {
            user_id: "u1".into(),
            entity_type: EntityType::Invoice,
            entity_id: "inv-1".into(),
            action: ActionType::SendInvoiceReminder,
        }
    }

    #[tokio::test]
    async fn log_delivery_always_succeeds() {
        let receipt = LogDelivery.deliver(&request()).await.unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.channel.as_deref(), Some("log"));
        assert!(receipt.message_content.unwrap().contains("reminder"));
    }

    #[tokio::test]
    async fn webhook_posts_json_and_reads_channel() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "user_id": "u1",
                "entity_type": "invoice",
                "entity_id": "inv-1",
                "action": "send_invoice_reminder",
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"channel":"sms"}"#)
            .create_async()
            .await;

        let channel =
            WebhookDelivery::new(format!("{}/send", server.url()), Duration::from_secs(5)).unwrap();
        let receipt = channel.deliver(&request()).await.unwrap();
        mock.assert_async().await;
        assert!(receipt.success);
        assert_eq!(receipt.channel.as_deref(), Some("sms"));
    }

    #[tokio::test]
    async fn webhook_rejection_is_unsuccessful_receipt() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/send")
            .with_status(502)
            .with_body(r#"{"error":"carrier unavailable"}"#)
            .create_async()
            .await;

        let channel =
            WebhookDelivery::new(format!("{}/send", server.url()), Duration::from_secs(5)).unwrap();
        let receipt = channel.deliver(&request()).await.unwrap();
        assert!(!receipt.success);
        assert_eq!(receipt.error.as_deref(), Some("carrier unavailable"));
    }

    #[tokio::test]
    async fn webhook_transport_failure_is_error() {
        // Nothing listens on port 9 on the loopback interface.
        let channel =
            WebhookDelivery::new("http://127.0.0.1:9/send", Duration::from_secs(2)).unwrap();
        let err = channel.deliver(&request()).await.unwrap_err();
        assert!(matches!(err, GigError::Delivery(_)), "{err}");
    }

    #[test]
    fn from_config_builds_log_channel() {
        assert!(from_config(&DeliveryConfig::Log).is_ok());
        assert!(from_config(&DeliveryConfig::Webhook {
            url: "https://sms.example.com".into(),
            timeout_secs: 3,
        })
        .is_ok());
    }
}
