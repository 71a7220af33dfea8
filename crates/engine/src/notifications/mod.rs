//! Outbound notifications
//!
//! A logical notification fans out into one [`NotificationRequest`] per channel. Each
//! request runs through the same processing state machine as external events and is
//! delivered by the [`ChannelAdapter`] registered for its channel.

pub mod channels;
pub mod content;
pub mod email;
pub mod fanout;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::EngineError;
use crate::state_machine::{Processable, RetryState};

pub use channels::{
    ChannelAdapter, ChannelRouter, DeliveryReceipt, EmailAdapter, InAppAdapter,
    UnconfiguredAdapter, WebhookAdapter,
};
pub use email::{MailMessage, MailTransport, ResendTransport, SentMail};
pub use fanout::{resolve_channels, DeliveryReport, NotificationService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
    InApp,
    Push,
    Webhook,
    Slack,
    Discord,
}

impl Channel {
    pub const ALL: [Channel; 7] = [
        Channel::Email,
        Channel::Sms,
        Channel::InApp,
        Channel::Push,
        Channel::Webhook,
        Channel::Slack,
        Channel::Discord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
            Channel::InApp => "IN_APP",
            Channel::Push => "PUSH",
            Channel::Webhook => "WEBHOOK",
            Channel::Slack => "SLACK",
            Channel::Discord => "DISCORD",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EngineError::InvalidPayload(format!("unknown channel '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
    Bounced,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Delivered => "DELIVERED",
            NotificationStatus::Read => "READ",
            NotificationStatus::Failed => "FAILED",
            NotificationStatus::Bounced => "BOUNCED",
        }
    }

    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Sent | Delivered | Failed)
                | (Failed, Sent | Delivered | Failed)
                | (Sent, Delivered | Read | Bounced)
                | (Delivered, Read)
        )
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(NotificationStatus::Pending),
            "SENT" => Ok(NotificationStatus::Sent),
            "DELIVERED" => Ok(NotificationStatus::Delivered),
            "READ" => Ok(NotificationStatus::Read),
            "FAILED" => Ok(NotificationStatus::Failed),
            "BOUNCED" => Ok(NotificationStatus::Bounced),
            other => Err(EngineError::InvalidState(format!(
                "unknown notification status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(EngineError::InvalidState(format!(
                "unknown priority '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Welcome,
    TierChanged,
    SubscriptionCancelled,
    PaymentSucceeded,
    PaymentFailed,
    SubscriptionPastDue,
    TrialEnding,
    PanicButtonAlert,
    OfficeHoursReminder,
    SecurityAlert,
}

impl NotificationType {
    pub const ALL: [NotificationType; 10] = [
        NotificationType::Welcome,
        NotificationType::TierChanged,
        NotificationType::SubscriptionCancelled,
        NotificationType::PaymentSucceeded,
        NotificationType::PaymentFailed,
        NotificationType::SubscriptionPastDue,
        NotificationType::TrialEnding,
        NotificationType::PanicButtonAlert,
        NotificationType::OfficeHoursReminder,
        NotificationType::SecurityAlert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Welcome => "welcome",
            NotificationType::TierChanged => "tier_changed",
            NotificationType::SubscriptionCancelled => "subscription_cancelled",
            NotificationType::PaymentSucceeded => "payment_succeeded",
            NotificationType::PaymentFailed => "payment_failed",
            NotificationType::SubscriptionPastDue => "subscription_past_due",
            NotificationType::TrialEnding => "trial_ending",
            NotificationType::PanicButtonAlert => "panic_button_alert",
            NotificationType::OfficeHoursReminder => "office_hours_reminder",
            NotificationType::SecurityAlert => "security_alert",
        }
    }

    /// Urgent categories reach the recipient on every live channel by default
    pub fn is_urgent(&self) -> bool {
        matches!(
            self,
            NotificationType::PanicButtonAlert
                | NotificationType::SubscriptionPastDue
                | NotificationType::SecurityAlert
        )
    }

    pub fn default_priority(&self) -> Priority {
        if self.is_urgent() {
            Priority::Urgent
        } else {
            match self {
                NotificationType::PaymentFailed | NotificationType::TrialEnding => Priority::High,
                NotificationType::OfficeHoursReminder => Priority::Normal,
                NotificationType::PaymentSucceeded => Priority::Low,
                _ => Priority::Normal,
            }
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NotificationType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EngineError::InvalidPayload(format!("unknown notification type '{}'", s)))
    }
}

/// Who a notification goes to and where they can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub webhook_url: Option<String>,
}

impl Recipient {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            email: None,
            phone: None,
            webhook_url: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    /// Channel-specific address. IN_APP needs none; PUSH/SLACK/DISCORD are resolved by
    /// their providers.
    pub fn address_for(&self, channel: Channel) -> Option<String> {
        match channel {
            Channel::Email => self.email.clone(),
            Channel::Sms => self.phone.clone(),
            Channel::Webhook => self.webhook_url.clone(),
            Channel::InApp | Channel::Push | Channel::Slack | Channel::Discord => None,
        }
    }
}

/// Content of one logical notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification_type: NotificationType,
    pub subject: String,
    pub content: String,
    pub template: Option<String>,
    pub metadata: serde_json::Value,
    pub priority: Option<Priority>,
}

impl NotificationPayload {
    pub fn new(
        notification_type: NotificationType,
        subject: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            notification_type,
            subject: subject.into(),
            content: content.into(),
            template: None,
            metadata: serde_json::Value::Object(Default::default()),
            priority: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Explicit channel set; `None` uses the type-based default
    pub channels: Option<Vec<Channel>>,
    /// Deliver later instead of immediately
    pub schedule_for: Option<OffsetDateTime>,
    pub max_retries: Option<u32>,
}

impl SendOptions {
    pub fn channels(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            channels: Some(channels.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn scheduled(at: OffsetDateTime) -> Self {
        Self {
            schedule_for: Some(at),
            ..Self::default()
        }
    }
}

/// A notification not yet fanned out, produced by reconciliation handlers
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationDraft {
    pub recipient: Recipient,
    pub payload: NotificationPayload,
    pub options: SendOptions,
}

impl NotificationDraft {
    pub fn new(recipient: Recipient, payload: NotificationPayload) -> Self {
        Self {
            recipient,
            payload,
            options: SendOptions::default(),
        }
    }
}

/// One notification on one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub recipient_address: Option<String>,
    pub notification_type: NotificationType,
    pub channel: Channel,
    pub status: NotificationStatus,
    pub priority: Priority,
    pub subject: String,
    pub content: String,
    pub template: Option<String>,
    pub metadata: serde_json::Value,
    pub retry: RetryState,
    pub scheduled_for: Option<OffsetDateTime>,
    /// Set while a delivery attempt holds the row
    pub lease_expires_at: Option<OffsetDateTime>,
    /// Event whose reconciliation produced this request
    pub source_event_id: Option<Uuid>,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub sent_at: Option<OffsetDateTime>,
    pub delivered_at: Option<OffsetDateTime>,
    pub read_at: Option<OffsetDateTime>,
    pub failed_at: Option<OffsetDateTime>,
}

impl NotificationRequest {
    pub fn is_scheduled_after(&self, now: OffsetDateTime) -> bool {
        self.scheduled_for.is_some_and(|at| at > now)
    }

    /// Mark as read by its recipient. Only delivered rows can be read.
    pub fn mark_read(&mut self, now: OffsetDateTime) -> bool {
        if !self.status.can_transition_to(NotificationStatus::Read) {
            return false;
        }
        self.status = NotificationStatus::Read;
        self.read_at = Some(now);
        true
    }
}

impl Processable for NotificationRequest {
    type Completion = DeliveryReceipt;

    fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    fn retry_state_mut(&mut self) -> &mut RetryState {
        &mut self.retry
    }

    fn mark_completed(&mut self, receipt: DeliveryReceipt, now: OffsetDateTime) {
        self.status = receipt.status;
        self.provider_message_id = receipt.provider_message_id;
        self.error_message = None;
        self.lease_expires_at = None;
        self.sent_at = Some(now);
        if receipt.status == NotificationStatus::Delivered {
            self.delivered_at = Some(now);
        }
    }

    fn mark_ignored(&mut self, reason: &str, now: OffsetDateTime) {
        // Notifications are never skipped silently; record as a terminal failure
        self.status = NotificationStatus::Failed;
        self.error_message = Some(reason.to_string());
        self.lease_expires_at = None;
        self.failed_at = Some(now);
    }

    fn mark_failed(&mut self, now: OffsetDateTime) {
        self.status = NotificationStatus::Failed;
        self.error_message = self.retry.last_error.clone();
        self.lease_expires_at = None;
        self.failed_at = Some(now);
    }
}
