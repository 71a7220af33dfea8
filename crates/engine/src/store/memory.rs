//! In-process store backed by `tokio::sync::RwLock`
//!
//! All tables sit behind one lock, so every trait method is atomic with respect to the
//! others. Used by tests and by single-process embeddings.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EventStore, InsertOutcome, NotificationStore, OwnerDirectory, SubscriptionStore};
use crate::error::{EngineError, EngineResult};
use crate::event::{EventStatus, ExternalEvent};
use crate::notifications::{Channel, NotificationRequest, NotificationStatus, Recipient};
use crate::subscription::{Feature, Subscription, UsageCounters};

#[derive(Default)]
struct Tables {
    events: HashMap<Uuid, ExternalEvent>,
    events_by_source: HashMap<String, Uuid>,
    notifications: HashMap<Uuid, NotificationRequest>,
    subscriptions: HashMap<Uuid, Subscription>,
    owners: HashMap<Uuid, Recipient>,
    customers: HashMap<String, Uuid>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local owner reachable through a processor customer id
    pub async fn put_owner(&self, external_customer_id: impl Into<String>, owner: Recipient) {
        let mut tables = self.tables.write().await;
        tables.customers.insert(external_customer_id.into(), owner.id);
        tables.owners.insert(owner.id, owner);
    }

    pub async fn put_subscription(&self, subscription: Subscription) {
        let mut tables = self.tables.write().await;
        tables.subscriptions.insert(subscription.id, subscription);
    }

    pub async fn events(&self) -> Vec<ExternalEvent> {
        let tables = self.tables.read().await;
        let mut events: Vec<_> = tables.events.values().cloned().collect();
        events.sort_by_key(|e| e.received_at);
        events
    }

    pub async fn notifications(&self) -> Vec<NotificationRequest> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables.notifications.values().cloned().collect();
        rows.sort_by_key(|n| (n.created_at, n.channel));
        rows
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        let tables = self.tables.read().await;
        tables.subscriptions.values().cloned().collect()
    }
}

fn event_due(event: &ExternalEvent, expected: EventStatus, now: OffsetDateTime) -> bool {
    event.status == expected && (expected != EventStatus::Failed || event.retry.is_due(now))
}

/// The row to store for a reconciled subscription. Fails with `Conflict` when the stored
/// row moved past the version the handler read. Usage counters are kept from the stored
/// row and only restart when the billing period advances.
fn fenced_subscription_write(
    tables: &Tables,
    subscription: &Subscription,
) -> EngineResult<Subscription> {
    let stored = tables
        .subscriptions
        .values()
        .find(|s| s.external_subscription_id == subscription.external_subscription_id);

    let stored_version = stored.map_or(0, |s| s.version);
    if stored_version != subscription.version {
        return Err(EngineError::Conflict(format!(
            "subscription {} is at version {}, attempt read {}",
            subscription.external_subscription_id, stored_version, subscription.version
        )));
    }

    let mut next = subscription.clone();
    next.version = stored_version + 1;
    if let Some(stored) = stored {
        next.id = stored.id;
        let advanced = match (stored.current_period_start, next.current_period_start) {
            (Some(current), Some(incoming)) => incoming > current,
            _ => false,
        };
        next.usage = if advanced {
            UsageCounters::default()
        } else {
            stored.usage
        };
    }
    Ok(next)
}

fn notification_claimable(request: &NotificationRequest, now: OffsetDateTime) -> bool {
    if request.lease_expires_at.is_some_and(|until| until > now) {
        return false;
    }
    match request.status {
        NotificationStatus::Pending => !request.is_scheduled_after(now),
        NotificationStatus::Failed => request.retry.is_due(now),
        _ => false,
    }
}

fn is_unread_inbox_row(request: &NotificationRequest, recipient_id: Uuid) -> bool {
    request.recipient_id == recipient_id
        && request.channel == Channel::InApp
        && request.status.can_transition_to(NotificationStatus::Read)
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert_event(&self, event: &ExternalEvent) -> EngineResult<InsertOutcome> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.events_by_source.get(&event.source_event_id) {
            return Ok(InsertOutcome::Duplicate(*existing));
        }
        tables
            .events_by_source
            .insert(event.source_event_id.clone(), event.id);
        tables.events.insert(event.id, event.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get_event(&self, id: Uuid) -> EngineResult<Option<ExternalEvent>> {
        Ok(self.tables.read().await.events.get(&id).cloned())
    }

    async fn find_event_by_source_id(
        &self,
        source_event_id: &str,
    ) -> EngineResult<Option<ExternalEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .events_by_source
            .get(source_event_id)
            .and_then(|id| tables.events.get(id))
            .cloned())
    }

    async fn claim_event(
        &self,
        id: Uuid,
        expected: EventStatus,
        now: OffsetDateTime,
    ) -> EngineResult<Option<ExternalEvent>> {
        let mut tables = self.tables.write().await;
        let Some(event) = tables.events.get_mut(&id) else {
            return Ok(None);
        };
        if !event_due(event, expected, now) {
            return Ok(None);
        }
        if let Err(e) = event.begin_processing(now) {
            tracing::debug!(event_id = %id, error = %e, "Event not claimable");
            return Ok(None);
        }
        Ok(Some(event.clone()))
    }

    async fn save_event(&self, event: &ExternalEvent) -> EngineResult<()> {
        let mut tables = self.tables.write().await;
        match tables.events.get_mut(&event.id) {
            Some(stored) => {
                *stored = event.clone();
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("event {}", event.id))),
        }
    }

    async fn commit_reconciliation(
        &self,
        event: &ExternalEvent,
        subscription: Option<&Subscription>,
        notifications: &[NotificationRequest],
    ) -> EngineResult<()> {
        let mut tables = self.tables.write().await;

        let stored = tables
            .events
            .get(&event.id)
            .ok_or_else(|| EngineError::NotFound(format!("event {}", event.id)))?;
        if stored.status != EventStatus::Processing
            || stored.processing_started_at != event.processing_started_at
        {
            return Err(EngineError::InvalidState(format!(
                "event {} is no longer held by this attempt",
                event.source_event_id
            )));
        }

        let subscription = match subscription {
            Some(subscription) => Some(fenced_subscription_write(&tables, subscription)?),
            None => None,
        };

        tables.events.insert(event.id, event.clone());
        if let Some(subscription) = subscription {
            tables.subscriptions.insert(subscription.id, subscription);
        }
        for request in notifications {
            tables.notifications.insert(request.id, request.clone());
        }
        Ok(())
    }

    async fn due_failed_events(&self, now: OffsetDateTime, limit: i64) -> EngineResult<Vec<Uuid>> {
        let tables = self.tables.read().await;
        let mut due: Vec<_> = tables
            .events
            .values()
            .filter(|e| e.status == EventStatus::Failed && e.retry.is_due(now))
            .collect();
        due.sort_by_key(|e| (e.retry.next_retry_at, e.received_at));
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|e| e.id)
            .collect())
    }

    async fn due_pending_events(
        &self,
        received_before: OffsetDateTime,
        limit: i64,
    ) -> EngineResult<Vec<Uuid>> {
        let tables = self.tables.read().await;
        let mut due: Vec<_> = tables
            .events
            .values()
            .filter(|e| e.status == EventStatus::Pending && e.received_at < received_before)
            .collect();
        due.sort_by_key(|e| e.received_at);
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|e| e.id)
            .collect())
    }

    async fn release_stuck_events(
        &self,
        started_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> EngineResult<u64> {
        let mut tables = self.tables.write().await;
        let mut released = 0;
        for event in tables.events.values_mut() {
            let stuck = event.status == EventStatus::Processing
                && event
                    .processing_started_at
                    .is_some_and(|started| started < started_before);
            if stuck {
                event.status = EventStatus::Failed;
                event.failed_at = Some(now);
                event.retry.next_retry_at = Some(now);
                event.retry.last_error = Some("processing timed out".to_string());
                released += 1;
            }
        }
        Ok(released)
    }

    async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<ExternalEvent>> {
        let tables = self.tables.read().await;
        let mut events: Vec<_> = tables
            .events
            .values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        Ok(events
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn insert_notifications(&self, requests: &[NotificationRequest]) -> EngineResult<()> {
        let mut tables = self.tables.write().await;
        for request in requests {
            tables.notifications.insert(request.id, request.clone());
        }
        Ok(())
    }

    async fn get_notification(&self, id: Uuid) -> EngineResult<Option<NotificationRequest>> {
        Ok(self.tables.read().await.notifications.get(&id).cloned())
    }

    async fn claim_notification(
        &self,
        id: Uuid,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> EngineResult<Option<NotificationRequest>> {
        let mut tables = self.tables.write().await;
        let Some(request) = tables.notifications.get_mut(&id) else {
            return Ok(None);
        };
        if !notification_claimable(request, now) {
            return Ok(None);
        }
        request.lease_expires_at = Some(lease_until);
        Ok(Some(request.clone()))
    }

    async fn save_notification(&self, request: &NotificationRequest) -> EngineResult<()> {
        let mut tables = self.tables.write().await;
        match tables.notifications.get_mut(&request.id) {
            Some(stored) => {
                *stored = request.clone();
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("notification {}", request.id))),
        }
    }

    async fn settle_notification(
        &self,
        request: &NotificationRequest,
        lease: OffsetDateTime,
    ) -> EngineResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.notifications.get_mut(&request.id) {
            Some(stored) if stored.lease_expires_at == Some(lease) => {
                *stored = request.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::NotFound(format!("notification {}", request.id))),
        }
    }

    async fn due_failed_notifications(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> EngineResult<Vec<Uuid>> {
        let tables = self.tables.read().await;
        let mut due: Vec<_> = tables
            .notifications
            .values()
            .filter(|n| n.status == NotificationStatus::Failed && n.retry.is_due(now))
            .collect();
        due.sort_by_key(|n| (n.retry.next_retry_at, n.created_at));
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|n| n.id)
            .collect())
    }

    async fn due_pending_notifications(
        &self,
        now: OffsetDateTime,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> EngineResult<Vec<Uuid>> {
        let tables = self.tables.read().await;
        let mut due: Vec<_> = tables
            .notifications
            .values()
            .filter(|n| n.status == NotificationStatus::Pending)
            .filter(|n| match n.scheduled_for {
                Some(at) => at <= now,
                None => n.created_at < created_before,
            })
            .collect();
        due.sort_by_key(|n| (n.scheduled_for.unwrap_or(n.created_at), n.created_at));
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|n| n.id)
            .collect())
    }

    async fn mark_read(
        &self,
        id: Uuid,
        recipient_id: Uuid,
        now: OffsetDateTime,
    ) -> EngineResult<bool> {
        let mut tables = self.tables.write().await;
        Ok(match tables.notifications.get_mut(&id) {
            Some(request) if request.recipient_id == recipient_id => request.mark_read(now),
            _ => false,
        })
    }

    async fn mark_all_read(&self, recipient_id: Uuid, now: OffsetDateTime) -> EngineResult<u64> {
        let mut tables = self.tables.write().await;
        let mut count = 0;
        for request in tables.notifications.values_mut() {
            if is_unread_inbox_row(request, recipient_id) && request.mark_read(now) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_read_before(&self, cutoff: OffsetDateTime) -> EngineResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.notifications.len();
        tables.notifications.retain(|_, n| {
            !(n.status == NotificationStatus::Read && n.read_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - tables.notifications.len()) as u64)
    }

    async fn find_notification_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> EngineResult<Option<NotificationRequest>> {
        let tables = self.tables.read().await;
        Ok(tables
            .notifications
            .values()
            .find(|n| n.provider_message_id.as_deref() == Some(provider_message_id))
            .cloned())
    }

    async fn notifications_for_recipient(
        &self,
        recipient_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> EngineResult<Vec<NotificationRequest>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables
            .notifications
            .values()
            .filter(|n| n.recipient_id == recipient_id && n.channel == Channel::InApp)
            .filter(|n| !unread_only || is_unread_inbox_row(n, recipient_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn unread_count(&self, recipient_id: Uuid) -> EngineResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .notifications
            .values()
            .filter(|n| is_unread_inbox_row(n, recipient_id))
            .count() as u64)
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> EngineResult<Option<Subscription>> {
        let tables = self.tables.read().await;
        Ok(tables
            .subscriptions
            .values()
            .find(|s| s.external_subscription_id == external_subscription_id)
            .cloned())
    }

    async fn find_subscription_by_owner(&self, owner_id: Uuid) -> EngineResult<Option<Subscription>> {
        let tables = self.tables.read().await;
        Ok(tables
            .subscriptions
            .values()
            .filter(|s| s.owner_id == owner_id)
            .max_by_key(|s| (s.status.is_entitled(), s.created_at))
            .cloned())
    }

    async fn increment_usage(
        &self,
        subscription_id: Uuid,
        feature: Feature,
        limit: u32,
    ) -> EngineResult<Option<u32>> {
        let mut tables = self.tables.write().await;
        let subscription = tables
            .subscriptions
            .get_mut(&subscription_id)
            .ok_or_else(|| EngineError::NotFound(format!("subscription {}", subscription_id)))?;

        let counter = subscription.usage.get_mut(feature);
        if *counter >= limit {
            return Ok(None);
        }
        *counter += 1;
        Ok(Some(*counter))
    }
}

#[async_trait]
impl OwnerDirectory for InMemoryStore {
    async fn owner_for_customer(&self, external_customer_id: &str) -> EngineResult<Option<Recipient>> {
        let tables = self.tables.read().await;
        Ok(tables
            .customers
            .get(external_customer_id)
            .and_then(|id| tables.owners.get(id))
            .cloned())
    }

    async fn owner(&self, owner_id: Uuid) -> EngineResult<Option<Recipient>> {
        Ok(self.tables.read().await.owners.get(&owner_id).cloned())
    }
}
