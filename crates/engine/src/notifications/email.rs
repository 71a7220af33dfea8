//! Mail transport used by the EMAIL channel

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EmailConfig;
use crate::error::DeliveryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub message_id: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<SentMail, DeliveryError>;
}

#[derive(Debug, Deserialize)]
struct ResendResponse {
    id: String,
}

/// Resend HTTP API transport
#[derive(Clone)]
pub struct ResendTransport {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
}

impl ResendTransport {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Transport for the configured API key, if there is one
    pub fn from_config(client: reqwest::Client, config: &EmailConfig) -> Option<Self> {
        config
            .api_key
            .as_ref()
            .map(|key| Self::new(client, key.clone(), config.api_url.clone()))
    }
}

#[async_trait]
impl MailTransport for ResendTransport {
    async fn send(&self, message: &MailMessage) -> Result<SentMail, DeliveryError> {
        let response = self
            .client
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(&self.api_key)
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                to = ?message.to,
                "Mail transport rejected message"
            );
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let sent: ResendResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transport(format!("invalid mail transport response: {}", e)))?;

        Ok(SentMail { message_id: sent.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn message() -> MailMessage {
        MailMessage {
            from: "Deskbell <notifications@deskbell.dev>".into(),
            to: vec!["owner@example.com".into()],
            subject: "Welcome".into(),
            text: "Hello".into(),
            html: None,
        }
    }

    #[tokio::test]
    async fn test_resend_returns_message_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "to": ["owner@example.com"],
                "subject": "Welcome",
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"msg_123"}"#)
            .create_async()
            .await;

        let transport = ResendTransport::new(reqwest::Client::new(), "re_test", server.url());
        let sent = transport.send(&message()).await.unwrap();

        assert_eq!(sent.message_id, "msg_123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_resend_rejection_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/emails")
            .with_status(422)
            .with_body(r#"{"message":"invalid from"}"#)
            .create_async()
            .await;

        let transport = ResendTransport::new(reqwest::Client::new(), "re_test", server.url());
        let err = transport.send(&message()).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Rejected { status: 422, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = EmailConfig::default();
        assert!(ResendTransport::from_config(reqwest::Client::new(), &config).is_none());
    }
}
