//! Notification fan-out and delivery
//!
//! One logical notification becomes one row per resolved channel. Rows are persisted
//! before any delivery attempt; each attempt takes a short lease on its row so two
//! callers (inline send and a retry drain, or two drains) do not deliver it at the same
//! time. Adapter calls are cut off well before the lease runs out, and an attempt whose
//! lease was taken over anyway discards its result instead of overwriting the newer one.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::{
    Channel, ChannelRouter, NotificationPayload, NotificationRequest, NotificationStatus,
    NotificationType, Recipient, SendOptions,
};
use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::state_machine::{settle, Attempt, Outcome, RetryPolicy, RetryState, Settlement};
use crate::store::{write_with_retry, NotificationStore};

/// How long one delivery attempt may hold a row
pub const DELIVERY_LEASE: Duration = Duration::minutes(5);

/// Longest a single adapter call may run
pub const DELIVERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Channels for a notification: the explicit list when one is given (duplicates
/// dropped, order kept), otherwise the default for its type
pub fn resolve_channels(notification_type: NotificationType, options: &SendOptions) -> Vec<Channel> {
    match options.channels.as_deref() {
        Some(explicit) if !explicit.is_empty() => {
            let mut channels = Vec::with_capacity(explicit.len());
            for channel in explicit {
                if !channels.contains(channel) {
                    channels.push(*channel);
                }
            }
            channels
        }
        _ if notification_type.is_urgent() => vec![Channel::Email, Channel::Sms, Channel::InApp],
        _ => vec![Channel::Email, Channel::InApp],
    }
}

/// Build the per-channel rows for one logical notification
pub(crate) fn fan_out(
    recipient: &Recipient,
    payload: &NotificationPayload,
    options: &SendOptions,
    source_event_id: Option<Uuid>,
    default_max_retries: u32,
    now: OffsetDateTime,
) -> Vec<NotificationRequest> {
    let priority = payload
        .priority
        .unwrap_or_else(|| payload.notification_type.default_priority());
    let max_retries = options.max_retries.unwrap_or(default_max_retries);

    resolve_channels(payload.notification_type, options)
        .into_iter()
        .map(|channel| NotificationRequest {
            id: Uuid::new_v4(),
            recipient_id: recipient.id,
            recipient_address: recipient.address_for(channel),
            notification_type: payload.notification_type,
            channel,
            status: NotificationStatus::Pending,
            priority,
            subject: payload.subject.clone(),
            content: payload.content.clone(),
            template: payload.template.clone(),
            metadata: payload.metadata.clone(),
            retry: RetryState::new(max_retries),
            scheduled_for: options.schedule_for,
            lease_expires_at: None,
            source_event_id,
            provider_message_id: None,
            error_message: None,
            created_at: now,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
        })
        .collect()
}

/// Provider callback about a message it accepted earlier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    Delivered,
    Bounced(String),
}

#[derive(Clone)]
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    router: ChannelRouter,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        router: ChannelRouter,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            router,
            clock,
            policy,
        }
    }

    /// Fan a notification out to its channels and attempt immediate delivery of each
    /// row unless it is scheduled for later. Returns the rows as they stand afterwards.
    pub async fn send_notification(
        &self,
        recipient: &Recipient,
        payload: NotificationPayload,
        options: SendOptions,
    ) -> EngineResult<Vec<NotificationRequest>> {
        let now = self.clock.now();
        let requests = fan_out(
            recipient,
            &payload,
            &options,
            None,
            self.policy.max_retries,
            now,
        );
        self.store.insert_notifications(&requests).await?;

        tracing::info!(
            recipient_id = %recipient.id,
            notification_type = %payload.notification_type,
            channels = requests.len(),
            scheduled = options.schedule_for.is_some_and(|at| at > now),
            "Notification queued"
        );

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            if !request.is_scheduled_after(now) {
                self.deliver(request.id).await?;
            }
            let current = self.store.get_notification(request.id).await?;
            results.push(current.unwrap_or(request));
        }
        Ok(results)
    }

    /// Attempt delivery of one row through its channel adapter
    pub async fn deliver(&self, id: Uuid) -> EngineResult<Attempt> {
        self.deliver_at(id, self.clock.now()).await
    }

    pub(crate) async fn deliver_at(&self, id: Uuid, now: OffsetDateTime) -> EngineResult<Attempt> {
        let lease = now + DELIVERY_LEASE;
        let Some(mut request) = self.store.claim_notification(id, now, lease).await? else {
            tracing::debug!(notification_id = %id, "Notification not claimable, skipping");
            return Ok(Attempt::Skipped);
        };

        let adapter = self.router.adapter_for(request.channel);
        let outcome = match tokio::time::timeout(DELIVERY_TIMEOUT, adapter.deliver(&request)).await {
            Ok(Ok(receipt)) => Outcome::Completed(receipt),
            Ok(Err(e)) => Outcome::Failed {
                retryable: e.is_retryable(),
                error: e.to_string(),
            },
            Err(_) => Outcome::Failed {
                retryable: true,
                error: format!(
                    "{} delivery timed out after {}s",
                    request.channel,
                    DELIVERY_TIMEOUT.as_secs()
                ),
            },
        };

        let settlement = settle(&mut request, outcome, &self.policy, now);
        let settled = write_with_retry("notification", || {
            self.store.settle_notification(&request, lease)
        })
        .await?;

        if !settled {
            tracing::warn!(
                notification_id = %request.id,
                channel = %request.channel,
                "Lost lease on notification, discarding attempt"
            );
            return Ok(Attempt::Skipped);
        }

        match settlement {
            Settlement::Completed | Settlement::Ignored => tracing::info!(
                notification_id = %request.id,
                channel = %request.channel,
                status = %request.status,
                "Notification delivered"
            ),
            Settlement::RetryScheduled { attempt, at } => tracing::warn!(
                notification_id = %request.id,
                channel = %request.channel,
                attempt = attempt,
                next_retry_at = %at,
                error = request.error_message.as_deref().unwrap_or_default(),
                "Notification delivery failed, retry scheduled"
            ),
            Settlement::Exhausted { attempts } => tracing::error!(
                notification_id = %request.id,
                channel = %request.channel,
                attempts = attempts,
                error = request.error_message.as_deref().unwrap_or_default(),
                "Notification delivery failed permanently"
            ),
        }

        Ok(Attempt::Settled(settlement))
    }

    pub async fn mark_as_read(&self, id: Uuid, recipient_id: Uuid) -> EngineResult<bool> {
        self.store.mark_read(id, recipient_id, self.clock.now()).await
    }

    pub async fn mark_all_as_read(&self, recipient_id: Uuid) -> EngineResult<u64> {
        let count = self.store.mark_all_read(recipient_id, self.clock.now()).await?;
        tracing::debug!(recipient_id = %recipient_id, count = count, "Marked notifications read");
        Ok(count)
    }

    /// Delete READ notifications read before `cutoff`
    pub async fn purge_read(&self, cutoff: OffsetDateTime) -> EngineResult<u64> {
        let purged = self.store.purge_read_before(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged = purged, cutoff = %cutoff, "Purged read notifications");
        }
        Ok(purged)
    }

    /// Apply a provider delivery report. Reports that arrive out of order (e.g. after
    /// the recipient already read the message) leave the row unchanged.
    pub async fn record_delivery_report(
        &self,
        provider_message_id: &str,
        report: DeliveryReport,
    ) -> EngineResult<NotificationRequest> {
        let mut request = self
            .store
            .find_notification_by_provider_message_id(provider_message_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("notification for message {}", provider_message_id))
            })?;

        let now = self.clock.now();
        let next = match &report {
            DeliveryReport::Delivered => NotificationStatus::Delivered,
            DeliveryReport::Bounced(_) => NotificationStatus::Bounced,
        };

        if !request.status.can_transition_to(next) {
            tracing::debug!(
                notification_id = %request.id,
                status = %request.status,
                report = ?report,
                "Ignoring delivery report for notification"
            );
            return Ok(request);
        }

        request.status = next;
        match report {
            DeliveryReport::Delivered => request.delivered_at = Some(now),
            DeliveryReport::Bounced(reason) => {
                tracing::warn!(
                    notification_id = %request.id,
                    reason = %reason,
                    "Notification bounced"
                );
                request.error_message = Some(reason);
                request.failed_at = Some(now);
            }
        }

        self.store.save_notification(&request).await?;
        Ok(request)
    }

    pub async fn notifications_for(
        &self,
        recipient_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> EngineResult<Vec<NotificationRequest>> {
        self.store
            .notifications_for_recipient(recipient_id, unread_only, limit)
            .await
    }

    pub async fn unread_count(&self, recipient_id: Uuid) -> EngineResult<u64> {
        self.store.unread_count(recipient_id).await
    }
}
