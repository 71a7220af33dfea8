//! Channel adapters
//!
//! Every channel exposes the same `deliver` contract. Channels without a live provider
//! are served by [`UnconfiguredAdapter`], which fails deterministically so the rest of
//! the pipeline treats them like any other failed delivery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::email::{MailMessage, MailTransport};
use super::{Channel, NotificationRequest, NotificationStatus};
use crate::error::DeliveryError;

/// Proof of a successful delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// SENT when handed to a provider, DELIVERED when the engine itself completed it
    pub status: NotificationStatus,
    pub provider_message_id: Option<String>,
}

impl DeliveryReceipt {
    pub fn sent(provider_message_id: Option<String>) -> Self {
        Self {
            status: NotificationStatus::Sent,
            provider_message_id,
        }
    }

    pub fn delivered() -> Self {
        Self {
            status: NotificationStatus::Delivered,
            provider_message_id: None,
        }
    }
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    async fn deliver(&self, request: &NotificationRequest) -> Result<DeliveryReceipt, DeliveryError>;
}

/// EMAIL through the mail transport
pub struct EmailAdapter {
    transport: Arc<dyn MailTransport>,
    from_address: String,
}

impl EmailAdapter {
    pub fn new(transport: Arc<dyn MailTransport>, from_address: impl Into<String>) -> Self {
        Self {
            transport,
            from_address: from_address.into(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn deliver(&self, request: &NotificationRequest) -> Result<DeliveryReceipt, DeliveryError> {
        let to = request
            .recipient_address
            .clone()
            .ok_or(DeliveryError::MissingAddress(Channel::Email))?;

        let message = MailMessage {
            from: self.from_address.clone(),
            to: vec![to],
            subject: request.subject.clone(),
            text: request.content.clone(),
            html: None,
        };

        let sent = self.transport.send(&message).await?;
        Ok(DeliveryReceipt::sent(Some(sent.message_id)))
    }
}

/// IN_APP rows are the inbox itself; nothing leaves the process
#[derive(Debug, Default)]
pub struct InAppAdapter;

#[async_trait]
impl ChannelAdapter for InAppAdapter {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn deliver(&self, _request: &NotificationRequest) -> Result<DeliveryReceipt, DeliveryError> {
        Ok(DeliveryReceipt::delivered())
    }
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    #[serde(rename = "type")]
    type_: &'a str,
    subject: &'a str,
    content: &'a str,
    metadata: &'a serde_json::Value,
}

/// WEBHOOK: POST the notification to the recipient's URL, success on 2xx
pub struct WebhookAdapter {
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn deliver(&self, request: &NotificationRequest) -> Result<DeliveryReceipt, DeliveryError> {
        let url = request
            .recipient_address
            .as_deref()
            .ok_or(DeliveryError::MissingAddress(Channel::Webhook))?;

        let body = WebhookBody {
            type_: request.notification_type.as_str(),
            subject: &request.subject,
            content: &request.content,
            metadata: &request.metadata,
        };

        let response = self.client.post(url).json(&body).send().await?;
        let status = response.status();

        if status.is_success() {
            Ok(DeliveryReceipt::sent(None))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Stand-in for a channel with no provider wired up
#[derive(Debug)]
pub struct UnconfiguredAdapter {
    channel: Channel,
}

impl UnconfiguredAdapter {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelAdapter for UnconfiguredAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn deliver(&self, _request: &NotificationRequest) -> Result<DeliveryReceipt, DeliveryError> {
        Err(DeliveryError::NotConfigured(self.channel))
    }
}

/// Adapter lookup by channel
#[derive(Clone, Default)]
pub struct ChannelRouter {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// IN_APP and WEBHOOK always; EMAIL when a transport is supplied
    pub fn with_defaults(
        client: reqwest::Client,
        mail: Option<(Arc<dyn MailTransport>, String)>,
    ) -> Self {
        let mut router = Self::new()
            .with_adapter(Arc::new(InAppAdapter))
            .with_adapter(Arc::new(WebhookAdapter::new(client)));

        if let Some((transport, from_address)) = mail {
            router = router.with_adapter(Arc::new(EmailAdapter::new(transport, from_address)));
        }

        router
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.channel(), adapter);
        self
    }

    pub fn is_configured(&self, channel: Channel) -> bool {
        self.adapters.contains_key(&channel)
    }

    pub fn adapter_for(&self, channel: Channel) -> Arc<dyn ChannelAdapter> {
        self.adapters
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| Arc::new(UnconfiguredAdapter::new(channel)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{NotificationType, Priority};
    use crate::state_machine::RetryState;
    use mockito::Matcher;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn request(channel: Channel, address: Option<String>) -> NotificationRequest {
        NotificationRequest {
            id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            recipient_address: address,
            notification_type: NotificationType::PanicButtonAlert,
            channel,
            status: NotificationStatus::Pending,
            priority: Priority::Urgent,
            subject: "Panic button pressed".into(),
            content: "Escalation raised".into(),
            template: None,
            metadata: serde_json::json!({"ticket": 42}),
            retry: RetryState::new(3),
            scheduled_for: None,
            lease_expires_at: None,
            source_event_id: None,
            provider_message_id: None,
            error_message: None,
            created_at: OffsetDateTime::now_utc(),
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
        }
    }

    #[tokio::test]
    async fn test_webhook_posts_notification_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hooks/escalations")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(serde_json::json!({
                "type": "panic_button_alert",
                "subject": "Panic button pressed",
                "content": "Escalation raised",
                "metadata": {"ticket": 42},
            })))
            .with_status(204)
            .create_async()
            .await;

        let adapter = WebhookAdapter::new(reqwest::Client::new());
        let url = format!("{}/hooks/escalations", server.url());
        let receipt = adapter
            .deliver(&request(Channel::Webhook, Some(url)))
            .await
            .unwrap();

        assert_eq!(receipt.status, NotificationStatus::Sent);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_non_2xx_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/hook")
            .with_status(503)
            .create_async()
            .await;

        let adapter = WebhookAdapter::new(reqwest::Client::new());
        let url = format!("{}/hook", server.url());
        let err = adapter
            .deliver(&request(Channel::Webhook, Some(url)))
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::Rejected { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_webhook_without_url() {
        let adapter = WebhookAdapter::new(reqwest::Client::new());
        let err = adapter
            .deliver(&request(Channel::Webhook, None))
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::MissingAddress(Channel::Webhook));
    }

    #[tokio::test]
    async fn test_in_app_is_delivered_immediately() {
        let receipt = InAppAdapter
            .deliver(&request(Channel::InApp, None))
            .await
            .unwrap();
        assert_eq!(receipt, DeliveryReceipt::delivered());
    }

    #[tokio::test]
    async fn test_router_falls_back_to_unconfigured() {
        let router = ChannelRouter::with_defaults(reqwest::Client::new(), None);
        assert!(router.is_configured(Channel::InApp));
        assert!(router.is_configured(Channel::Webhook));

        for channel in [Channel::Email, Channel::Sms, Channel::Push, Channel::Slack, Channel::Discord] {
            assert!(!router.is_configured(channel));
            let err = router
                .adapter_for(channel)
                .deliver(&request(channel, None))
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), format!("{} provider not configured", channel));
        }
    }
}
