//! Event processing pipeline
//!
//! One attempt: claim the event, run its handler, settle the outcome and commit the
//! settled event together with whatever the handler produced. Notifications generated
//! by a committed reconciliation are then delivered; their failures are tracked on the
//! notification rows and never affect the event.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::PriceMap;
use crate::error::{EngineError, EngineResult};
use crate::event::{EventStatus, ExternalEvent};
use crate::notifications::fanout::fan_out;
use crate::notifications::{NotificationRequest, NotificationService};
use crate::reconcile::{HandlerContext, HandlerRegistry, Reconciliation};
use crate::state_machine::{settle, Attempt, Outcome, RetryPolicy, Settlement};
use crate::store::{write_with_retry, EventStore, OwnerDirectory, Store, SubscriptionStore};
use crate::subscription::Subscription;

/// Handler runs within one claim when the subscription keeps changing underneath
const MAX_HANDLER_RUNS: u32 = 3;

#[derive(Clone)]
pub struct EventProcessor {
    events: Arc<dyn EventStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    owners: Arc<dyn OwnerDirectory>,
    registry: Arc<HandlerRegistry>,
    notifications: NotificationService,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    prices: Arc<PriceMap>,
}

impl EventProcessor {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        registry: HandlerRegistry,
        notifications: NotificationService,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        prices: PriceMap,
    ) -> Self {
        Self {
            events: store.clone(),
            subscriptions: store.clone(),
            owners: store,
            registry: Arc::new(registry),
            notifications,
            clock,
            policy,
            prices: Arc::new(prices),
        }
    }

    /// Run one processing attempt for a PENDING or due FAILED event
    pub async fn process_event(&self, id: Uuid) -> EngineResult<Attempt> {
        self.process_event_at(id, self.clock.now()).await
    }

    pub(crate) async fn process_event_at(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> EngineResult<Attempt> {
        let current = self
            .events
            .get_event(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("event {}", id)))?;

        let expected = match current.status {
            EventStatus::Pending | EventStatus::Failed => current.status,
            status => {
                tracing::debug!(event_id = %id, status = %status, "Event not processable, skipping");
                return Ok(Attempt::Skipped);
            }
        };

        let Some(claimed) = self.events.claim_event(id, expected, now).await? else {
            tracing::debug!(event_id = %id, "Event claimed elsewhere or not due, skipping");
            return Ok(Attempt::Skipped);
        };

        let mut runs = 0;
        loop {
            runs += 1;
            let mut event = claimed.clone();
            let (outcome, reconciliation) = self.run_handler(&event, now).await;
            let settlement = settle(&mut event, outcome, &self.policy, now);

            let requests: Vec<NotificationRequest> = reconciliation
                .iter()
                .flat_map(|r| r.notifications.iter())
                .flat_map(|draft| {
                    fan_out(
                        &draft.recipient,
                        &draft.payload,
                        &draft.options,
                        Some(event.id),
                        self.policy.max_retries,
                        now,
                    )
                })
                .collect();
            let subscription = reconciliation.as_ref().and_then(|r| r.subscription.as_ref());

            match self.commit(&event, subscription, &requests).await {
                Ok(true) => {}
                Ok(false) => return Ok(Attempt::Skipped),
                Err(EngineError::Conflict(reason)) if runs < MAX_HANDLER_RUNS => {
                    tracing::debug!(
                        event_id = %event.id,
                        reason = %reason,
                        "Subscription changed under the handler, re-running"
                    );
                    continue;
                }
                Err(EngineError::Conflict(reason)) => {
                    // Keep the claim moving: record a retryable failure, apply nothing
                    let mut event = claimed.clone();
                    let error = EngineError::Conflict(reason);
                    let settlement = settle(&mut event, Outcome::failed(&error), &self.policy, now);
                    if !self.commit(&event, None, &[]).await? {
                        return Ok(Attempt::Skipped);
                    }
                    log_settlement(&event, settlement, None);
                    return Ok(Attempt::Settled(settlement));
                }
                Err(e) => return Err(e),
            }

            log_settlement(&event, settlement, reconciliation.as_ref());

            for request in requests.iter().filter(|r| !r.is_scheduled_after(now)) {
                if let Err(e) = self.notifications.deliver_at(request.id, now).await {
                    tracing::error!(
                        notification_id = %request.id,
                        event_id = %event.id,
                        error = %e,
                        "Notification delivery attempt failed"
                    );
                }
            }

            return Ok(Attempt::Settled(settlement));
        }
    }

    /// Commit one settled attempt. Returns false when the claim was lost; `Conflict`
    /// is passed through for the caller to re-run the handler.
    async fn commit(
        &self,
        event: &ExternalEvent,
        subscription: Option<&Subscription>,
        requests: &[NotificationRequest],
    ) -> EngineResult<bool> {
        let committed = write_with_retry("event", || {
            self.events
                .commit_reconciliation(event, subscription, requests)
        })
        .await;

        match committed {
            Ok(()) => Ok(true),
            Err(EngineError::InvalidState(reason)) => {
                // Stuck-row recovery released the claim while the handler ran
                tracing::warn!(
                    event_id = %event.id,
                    source_event_id = %event.source_event_id,
                    reason = %reason,
                    "Lost claim on event, discarding attempt"
                );
                Ok(false)
            }
            Err(e @ EngineError::Conflict(_)) => Err(e),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    source_event_id = %event.source_event_id,
                    error = %e,
                    "CRITICAL: Failed to record event result after retry"
                );
                Err(e)
            }
        }
    }

    async fn run_handler(
        &self,
        event: &ExternalEvent,
        now: OffsetDateTime,
    ) -> (Outcome<()>, Option<Reconciliation>) {
        let Some(handler) = self.registry.handler_for(event.event_type) else {
            return (
                Outcome::Ignored(format!("no handler for {}", event.source_type)),
                None,
            );
        };

        let ctx = HandlerContext {
            subscriptions: self.subscriptions.clone(),
            owners: self.owners.clone(),
            prices: self.prices.clone(),
            now,
        };

        match handler.handle(&ctx, event).await {
            Ok(reconciliation) => (Outcome::Completed(()), Some(reconciliation)),
            Err(e) => {
                tracing::debug!(
                    event_id = %event.id,
                    handler = handler.name(),
                    error = %e,
                    "Handler failed"
                );
                (Outcome::failed(&e), None)
            }
        }
    }

    /// Re-run a FAILED event by its upstream id.
    ///
    /// An event that exhausted its budget gets exactly one more attempt.
    pub async fn replay_event(&self, source_event_id: &str) -> EngineResult<Attempt> {
        let now = self.clock.now();
        let mut event = self
            .events
            .find_event_by_source_id(source_event_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("event {}", source_event_id)))?;

        if event.status != EventStatus::Failed {
            return Err(EngineError::InvalidState(format!(
                "only failed events can be replayed, {} is {}",
                source_event_id, event.status
            )));
        }

        if !event.retry.has_budget() {
            event.retry.max_retries = event.retry.retry_count.saturating_add(1);
        }
        event.retry.next_retry_at = Some(now);
        self.events.save_event(&event).await?;

        tracing::info!(
            event_id = %event.id,
            source_event_id = %source_event_id,
            retry_count = event.retry.retry_count,
            "Replaying event"
        );

        self.process_event_at(event.id, now).await
    }

    pub async fn get_event(&self, id: Uuid) -> EngineResult<Option<ExternalEvent>> {
        self.events.get_event(id).await
    }

    /// Events newest first, optionally filtered by status
    pub async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<ExternalEvent>> {
        self.events.list_events(status, limit, offset).await
    }
}

fn log_settlement(event: &ExternalEvent, settlement: Settlement, reconciliation: Option<&Reconciliation>) {
    match settlement {
        Settlement::Completed => tracing::info!(
            event_id = %event.id,
            source_event_id = %event.source_event_id,
            event_type = %event.event_type,
            note = reconciliation.and_then(|r| r.note.as_deref()).unwrap_or_default(),
            "Event processed"
        ),
        Settlement::Ignored => tracing::info!(
            event_id = %event.id,
            source_event_id = %event.source_event_id,
            source_type = %event.source_type,
            "Event ignored, no handler"
        ),
        Settlement::RetryScheduled { attempt, at } => tracing::warn!(
            event_id = %event.id,
            source_event_id = %event.source_event_id,
            attempt = attempt,
            next_retry_at = %at,
            error = event.retry.last_error.as_deref().unwrap_or_default(),
            "Event processing failed, retry scheduled"
        ),
        Settlement::Exhausted { attempts } => tracing::error!(
            event_id = %event.id,
            source_event_id = %event.source_event_id,
            event_type = %event.event_type,
            attempts = attempts,
            error = event.retry.last_error.as_deref().unwrap_or_default(),
            "Event processing failed permanently"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notifications::{Channel, ChannelRouter, NotificationStatus, Recipient};
    use crate::provider::ProviderEvent;
    use crate::store::{InMemoryStore, InsertOutcome};
    use crate::subscription::{Subscription, SubscriptionStatus, SubscriptionTier};
    use serde_json::json;
    use time::Duration;

    fn start() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        processor: EventProcessor,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let policy = RetryPolicy::default();
        let notifications = NotificationService::new(
            store.clone(),
            ChannelRouter::with_defaults(reqwest::Client::new(), None),
            clock.clone(),
            policy,
        );
        let processor = EventProcessor::new(
            store.clone(),
            HandlerRegistry::with_defaults().unwrap(),
            notifications,
            clock.clone(),
            policy,
            PriceMap {
                pro: Some("price_pro".into()),
                ..PriceMap::default()
            },
        );
        Fixture {
            store,
            clock,
            processor,
        }
    }

    async fn insert(store: &InMemoryStore, type_: &str, object: serde_json::Value) -> Uuid {
        let raw = json!({
            "id": format!("evt_{}", Uuid::new_v4().simple()),
            "type": type_,
            "created": 1_700_000_000,
            "data": {"object": object},
        });
        let event =
            ExternalEvent::received(&ProviderEvent::from_json(&raw.to_string()).unwrap(), 3, start());
        assert_eq!(store.insert_event(&event).await.unwrap(), InsertOutcome::Inserted);
        event.id
    }

    fn update_object() -> serde_json::Value {
        json!({
            "id": "sub_1",
            "object": "subscription",
            "customer": "cus_1",
            "status": "active",
            "items": {"data": [{"price": {"id": "price_pro"}}]},
        })
    }

    #[tokio::test]
    async fn test_unhandled_type_is_ignored() {
        let f = fixture();
        let id = insert(&f.store, "payout.created", json!({"id": "po_1"})).await;

        let attempt = f.processor.process_event(id).await.unwrap();
        assert_eq!(attempt, Attempt::Settled(Settlement::Ignored));

        let event = f.store.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Ignored);
        assert!(event.processed_at.is_some());
        assert_eq!(event.retry.retry_count, 0);
    }

    #[tokio::test]
    async fn test_missing_event_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.processor.process_event(Uuid::new_v4()).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_settled_event_is_skipped() {
        let f = fixture();
        let id = insert(&f.store, "payout.created", json!({"id": "po_1"})).await;
        f.processor.process_event(id).await.unwrap();
        assert_eq!(f.processor.process_event(id).await.unwrap(), Attempt::Skipped);
    }

    #[tokio::test]
    async fn test_backoff_schedule_until_exhausted() {
        let f = fixture();
        let id = insert(&f.store, "customer.subscription.updated", update_object()).await;

        let first = f.processor.process_event(id).await.unwrap();
        assert_eq!(
            first,
            Attempt::Settled(Settlement::RetryScheduled {
                attempt: 1,
                at: start() + Duration::minutes(1)
            })
        );

        // Not due yet
        assert_eq!(f.processor.process_event(id).await.unwrap(), Attempt::Skipped);

        f.clock.advance(Duration::minutes(1));
        let second = f.processor.process_event(id).await.unwrap();
        assert_eq!(
            second,
            Attempt::Settled(Settlement::RetryScheduled {
                attempt: 2,
                at: start() + Duration::minutes(3)
            })
        );

        f.clock.advance(Duration::minutes(2));
        let third = f.processor.process_event(id).await.unwrap();
        assert_eq!(third, Attempt::Settled(Settlement::Exhausted { attempts: 3 }));

        let event = f.store.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.retry.retry_count, 3);
        assert!(event.retry.next_retry_at.is_none());
        assert!(event.retry.last_error.unwrap().contains("sub_1"));

        f.clock.advance(Duration::hours(1));
        assert_eq!(f.processor.process_event(id).await.unwrap(), Attempt::Skipped);
    }

    #[tokio::test]
    async fn test_replay_grants_one_more_attempt() {
        let f = fixture();
        let id = insert(&f.store, "customer.subscription.updated", update_object()).await;
        for _ in 0..3 {
            f.processor.process_event(id).await.unwrap();
            f.clock.advance(Duration::minutes(10));
        }
        let source_id = f.store.get_event(id).await.unwrap().unwrap().source_event_id;

        // The subscription arrives late
        let owner = Recipient::new(Uuid::new_v4());
        f.store.put_owner("cus_1", owner.clone()).await;
        f.store
            .put_subscription(Subscription::new(
                owner.id,
                "cus_1",
                "sub_1",
                SubscriptionTier::Starter,
                SubscriptionStatus::Active,
                start(),
            ))
            .await;

        let attempt = f.processor.replay_event(&source_id).await.unwrap();
        assert_eq!(attempt, Attempt::Settled(Settlement::Completed));

        let event = f.store.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Processed);
        assert_eq!(event.retry.max_retries, 4);

        let subs = f.store.subscriptions().await;
        assert_eq!(subs[0].tier, SubscriptionTier::Pro);

        // Tier changed: EMAIL (unconfigured) and IN_APP rows tied to the event
        let notifications = f.store.notifications().await;
        assert_eq!(notifications.len(), 2);
        assert!(notifications.iter().all(|n| n.source_event_id == Some(id)));
        let statuses: Vec<_> = notifications.iter().map(|n| (n.channel, n.status)).collect();
        assert!(statuses.contains(&(Channel::InApp, NotificationStatus::Delivered)));
        assert!(statuses.contains(&(Channel::Email, NotificationStatus::Failed)));

        assert!(matches!(
            f.processor.replay_event(&source_id).await,
            Err(EngineError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_event_held_by_another_worker_is_skipped() {
        let f = fixture();
        let id = insert(&f.store, "payout.created", json!({"id": "po_1"})).await;

        let mut held = f.store.get_event(id).await.unwrap().unwrap();
        held.status = EventStatus::Failed;
        held.retry.next_retry_at = Some(start());
        f.store.save_event(&held).await.unwrap();
        let claimed = f
            .store
            .claim_event(id, EventStatus::Failed, start())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, EventStatus::Processing);

        assert_eq!(f.processor.process_event(id).await.unwrap(), Attempt::Skipped);
    }
}
