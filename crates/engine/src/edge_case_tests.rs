// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! End-to-end edge cases for the event engine
//!
//! Drives the wired [`Engine`] over the in-memory store with a manual clock:
//! - Intake (signatures, redelivery)
//! - Reconciliation through the full pipeline
//! - Retry draining, claims and stuck-row recovery
//! - Notification channels

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::clock::{Clock, ManualClock};
use crate::config::{EngineConfig, PriceMap};
use crate::engine::Engine;
use crate::error::{DeliveryError, EngineError, EngineResult};
use crate::event::{EventStatus, EventType, ExternalEvent};
use crate::notifications::{
    Channel, ChannelRouter, MailMessage, MailTransport, NotificationPayload, NotificationStatus,
    NotificationType, Recipient, SendOptions, SentMail,
};
use crate::processor::EventProcessor;
use crate::provider::ProviderEvent;
use crate::reconcile::{
    EventHandler, HandlerContext, HandlerRegistry, PaymentFailedHandler, PaymentSucceededHandler,
    Reconciliation,
};
use crate::retry::RetryScheduler;
use crate::state_machine::{Attempt, RetryPolicy, Settlement};
use crate::store::{EventStore, InMemoryStore};
use crate::subscription::{
    Feature, Subscription, SubscriptionService, SubscriptionStatus, SubscriptionTier,
};
use crate::webhooks::{sign_payload, IngestOutcome, StripeSignatureVerifier};

const SECRET: &str = "whsec_edge_case_secret";

fn start() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
}

#[derive(Default)]
struct RecordingMail {
    sent: Mutex<Vec<MailMessage>>,
}

#[async_trait]
impl MailTransport for RecordingMail {
    async fn send(&self, message: &MailMessage) -> Result<SentMail, DeliveryError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        Ok(SentMail {
            message_id: format!("msg_{}", sent.len()),
        })
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
    mail: Arc<RecordingMail>,
    engine: Engine,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let mail = Arc::new(RecordingMail::default());

        let mut config = EngineConfig::new(SECRET);
        config.prices = PriceMap {
            starter: Some("price_starter".into()),
            pro: Some("price_pro".into()),
            enterprise: None,
        };

        let transport: Arc<dyn MailTransport> = mail.clone();
        let router = ChannelRouter::with_defaults(
            reqwest::Client::new(),
            Some((transport, "Deskbell <notifications@deskbell.dev>".to_string())),
        );
        let verifier = Arc::new(StripeSignatureVerifier::new(SECRET, clock.clone()));
        let engine = Engine::new(store.clone(), config, clock.clone(), verifier, router).unwrap();

        Self {
            store,
            clock,
            mail,
            engine,
        }
    }

    fn body(id: &str, type_: &str, created: i64, object: serde_json::Value) -> String {
        json!({
            "id": id,
            "type": type_,
            "created": created,
            "data": {"object": object},
        })
        .to_string()
    }

    async fn deliver(
        &self,
        id: &str,
        type_: &str,
        created: i64,
        object: serde_json::Value,
    ) -> IngestOutcome {
        let body = Self::body(id, type_, created, object);
        let signature = sign_payload(SECRET, self.clock.now().unix_timestamp(), &body);
        self.engine.intake.ingest(&body, &signature).await.unwrap()
    }

    async fn seed_owner(&self) -> Recipient {
        let owner = Recipient::new(Uuid::new_v4()).with_email("owner@example.com");
        self.store.put_owner("cus_1", owner.clone()).await;
        owner
    }

    async fn seed_subscription(&self, tier: SubscriptionTier) -> Subscription {
        let owner = self.seed_owner().await;
        let mut sub = Subscription::new(
            owner.id,
            "cus_1",
            "sub_1",
            tier,
            SubscriptionStatus::Active,
            start(),
        );
        sub.observe_event(start(), start());
        self.store.put_subscription(sub.clone()).await;
        sub
    }

    /// Processor and drain with one extra handler registered next to the defaults
    fn with_handler(&self, handler: Arc<dyn EventHandler>) -> (EventProcessor, RetryScheduler) {
        let mut registry = HandlerRegistry::with_defaults().unwrap();
        registry.register(handler).unwrap();
        self.with_registry(registry)
    }

    fn with_registry(&self, registry: HandlerRegistry) -> (EventProcessor, RetryScheduler) {
        let processor = EventProcessor::new(
            self.store.clone(),
            registry,
            self.engine.notifications.clone(),
            self.clock.clone(),
            RetryPolicy::default(),
            PriceMap::default(),
        );
        let scheduler = RetryScheduler::new(
            self.store.clone(),
            processor.clone(),
            self.engine.notifications.clone(),
            self.clock.clone(),
            Duration::minutes(30),
        );
        (processor, scheduler)
    }

    async fn insert_raw(&self, type_: &str) -> ExternalEvent {
        self.insert_object(type_, json!({"id": "ch_1", "object": "charge"}))
            .await
    }

    async fn insert_object(&self, type_: &str, object: serde_json::Value) -> ExternalEvent {
        let body = Self::body(
            &format!("evt_{}", Uuid::new_v4().simple()),
            type_,
            start().unix_timestamp(),
            object,
        );
        let event =
            ExternalEvent::received(&ProviderEvent::from_json(&body).unwrap(), 3, self.clock.now());
        self.store.insert_event(&event).await.unwrap();
        event
    }
}

fn subscription_object(price: &str, status: &str) -> serde_json::Value {
    json!({
        "id": "sub_1",
        "object": "subscription",
        "customer": "cus_1",
        "status": status,
        "cancel_at_period_end": false,
        "trial_end": 1_700_000_000 + 14 * 86_400,
        "current_period_start": 1_700_000_000,
        "current_period_end": 1_702_592_000,
        "items": {"data": [{"price": {"id": price}}]},
    })
}

fn failed_invoice(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "object": "invoice",
        "customer": "cus_1",
        "subscription": "sub_1",
        "amount_due": 4900,
        "currency": "usd",
    })
}

/// Handler for charge refunds that records calls and can be slowed down
struct CountingHandler {
    calls: AtomicUsize,
    failures: usize,
    delay: std::time::Duration,
}

impl CountingHandler {
    fn new(failures: usize, delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures,
            delay: std::time::Duration::from_millis(delay_ms),
        })
    }
}

#[async_trait]
impl EventHandler for CountingHandler {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::ChargeRefunded]
    }

    async fn handle(
        &self,
        _ctx: &HandlerContext,
        _event: &ExternalEvent,
    ) -> EngineResult<Reconciliation> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if call < self.failures {
            return Err(EngineError::Precondition("not yet".into()));
        }
        Ok(Reconciliation::unchanged("counted"))
    }
}

// =========================================================================
// Intake
// =========================================================================

#[tokio::test]
async fn test_invalid_signature_persists_nothing() {
    let h = Harness::new();
    let body = Harness::body(
        "evt_bad",
        "customer.subscription.created",
        start().unix_timestamp(),
        subscription_object("price_pro", "active"),
    );
    let forged = sign_payload("whsec_attacker", start().unix_timestamp(), &body);

    let result = h.engine.intake.ingest(&body, &forged).await;
    assert!(matches!(result, Err(EngineError::InvalidSignature)));
    assert!(h.store.events().await.is_empty());
    assert!(h.store.subscriptions().await.is_empty());
}

// Scenario: duplicate delivery within seconds
#[tokio::test]
async fn test_duplicate_delivery_is_acknowledged_once() {
    let h = Harness::new();
    h.seed_owner().await;

    let first = h
        .deliver(
            "evt_dup",
            "customer.subscription.created",
            start().unix_timestamp(),
            subscription_object("price_pro", "active"),
        )
        .await;
    h.clock.advance(Duration::seconds(3));
    let second = h
        .deliver(
            "evt_dup",
            "customer.subscription.created",
            start().unix_timestamp(),
            subscription_object("price_pro", "active"),
        )
        .await;

    assert!(matches!(first, IngestOutcome::Accepted { .. }));
    assert_eq!(
        second,
        IngestOutcome::Duplicate {
            event_id: first.event_id()
        }
    );
    assert!(first.acknowledges() && second.acknowledges());
    assert_eq!(h.store.events().await.len(), 1);
    assert_eq!(h.store.subscriptions().await.len(), 1);
    assert_eq!(h.mail.sent.lock().unwrap().len(), 1, "one welcome email");
}

#[tokio::test]
async fn test_unhandled_types_are_ignored() {
    let h = Harness::new();
    for (i, type_) in ["charge.refunded", "customer.updated", "payout.paid"]
        .into_iter()
        .enumerate()
    {
        let outcome = h
            .deliver(
                &format!("evt_{}", i),
                type_,
                start().unix_timestamp(),
                json!({"id": "obj_1"}),
            )
            .await;
        assert!(matches!(
            outcome,
            IngestOutcome::Accepted {
                attempt: Attempt::Settled(Settlement::Ignored),
                ..
            }
        ));
    }
    assert!(h
        .store
        .events()
        .await
        .iter()
        .all(|e| e.status == EventStatus::Ignored));
}

// =========================================================================
// Reconciliation scenarios
// =========================================================================

// Scenario: subscription created for an unmapped customer
#[tokio::test]
async fn test_unmapped_customer_fails_after_three_attempts() {
    let h = Harness::new();

    let outcome = h
        .deliver(
            "evt_created",
            "customer.subscription.created",
            start().unix_timestamp(),
            subscription_object("price_pro", "active"),
        )
        .await;
    assert!(matches!(
        outcome,
        IngestOutcome::Accepted {
            attempt: Attempt::Settled(Settlement::RetryScheduled { attempt: 1, .. }),
            ..
        }
    ));

    h.clock.advance(Duration::minutes(1));
    let report = h.engine.scheduler.drain_retry_queue().await.unwrap();
    assert_eq!(report.events.rescheduled, 1);

    h.clock.advance(Duration::minutes(2));
    let report = h.engine.scheduler.drain_retry_queue().await.unwrap();
    assert_eq!(report.events.exhausted, 1);

    h.clock.advance(Duration::hours(2));
    let report = h.engine.scheduler.drain_retry_queue().await.unwrap();
    assert_eq!(report.events.attempted(), 0);

    let event = h.store.find_event_by_source_id("evt_created").await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.retry.retry_count, 3);
    assert!(event.retry.next_retry_at.is_none());
    assert!(h.store.subscriptions().await.is_empty());
}

// Scenario: subscription created for a mapped customer
#[tokio::test]
async fn test_mapped_customer_gets_subscription_and_welcome() {
    let h = Harness::new();
    let owner = h.seed_owner().await;

    h.deliver(
        "evt_created",
        "customer.subscription.created",
        start().unix_timestamp(),
        subscription_object("price_pro", "trialing"),
    )
    .await;

    let subs = h.store.subscriptions().await;
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].owner_id, owner.id);
    assert_eq!(subs[0].status, SubscriptionStatus::Trial);
    assert_eq!(subs[0].tier, SubscriptionTier::Pro);

    let notifications = h.store.notifications().await;
    assert_eq!(notifications.len(), 2, "welcome on EMAIL and IN_APP");
    for n in &notifications {
        assert_eq!(n.notification_type, NotificationType::Welcome);
        assert_ne!(n.status, NotificationStatus::Pending, "attempted inline");
    }
    let sent = h.mail.sent.lock().unwrap();
    assert_eq!(sent[0].to, vec!["owner@example.com".to_string()]);
}

// Scenario: three consecutive payment failures
#[tokio::test]
async fn test_past_due_exactly_on_third_failure() {
    let h = Harness::new();
    h.seed_subscription(SubscriptionTier::Pro).await;

    for n in 1..=3 {
        h.deliver(
            &format!("evt_fail_{}", n),
            "invoice.payment_failed",
            start().unix_timestamp() + n,
            failed_invoice(&format!("in_{}", n)),
        )
        .await;

        let sub = h.store.subscriptions().await.remove(0);
        assert_eq!(sub.consecutive_payment_failures, n as u32);
        let expected = if n < 3 {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::PastDue
        };
        assert_eq!(sub.status, expected, "after failure {}", n);
    }

    let past_due: Vec<_> = h
        .store
        .notifications()
        .await
        .into_iter()
        .filter(|n| n.notification_type == NotificationType::SubscriptionPastDue)
        .collect();
    assert!(!past_due.is_empty());
}

#[tokio::test]
async fn test_payment_success_does_not_change_tier() {
    let h = Harness::new();
    h.seed_subscription(SubscriptionTier::Pro).await;

    h.deliver(
        "evt_paid",
        "invoice.paid",
        start().unix_timestamp() + 10,
        json!({
            "id": "in_1",
            "object": "invoice",
            "customer": "cus_1",
            "subscription": "sub_1",
            "amount_paid": 900,
            "currency": "usd",
            "lines": {"data": [{"price": {"id": "price_starter"}}]},
        }),
    )
    .await;

    let sub = h.store.subscriptions().await.remove(0);
    assert_eq!(sub.tier, SubscriptionTier::Pro);
    assert_eq!(sub.last_payment_amount, Some(900));
}

#[tokio::test]
async fn test_out_of_order_update_is_a_no_op() {
    let h = Harness::new();
    h.seed_subscription(SubscriptionTier::Pro).await;

    h.deliver(
        "evt_new",
        "customer.subscription.updated",
        start().unix_timestamp() + 100,
        subscription_object("price_starter", "active"),
    )
    .await;
    h.deliver(
        "evt_old",
        "customer.subscription.updated",
        start().unix_timestamp() + 50,
        subscription_object("price_pro", "past_due"),
    )
    .await;

    let sub = h.store.subscriptions().await.remove(0);
    assert_eq!(sub.tier, SubscriptionTier::Starter);
    assert_eq!(sub.status, SubscriptionStatus::Active);

    let old = h.store.find_event_by_source_id("evt_old").await.unwrap().unwrap();
    assert_eq!(old.status, EventStatus::Processed);
}

#[tokio::test]
async fn test_update_before_create_succeeds_on_retry() {
    let h = Harness::new();
    h.seed_owner().await;

    h.deliver(
        "evt_update",
        "customer.subscription.updated",
        start().unix_timestamp() + 5,
        subscription_object("price_starter", "active"),
    )
    .await;
    h.deliver(
        "evt_create",
        "customer.subscription.created",
        start().unix_timestamp(),
        subscription_object("price_pro", "active"),
    )
    .await;

    h.clock.advance(Duration::minutes(1));
    h.engine.scheduler.drain_retry_queue().await.unwrap();

    let sub = h.store.subscriptions().await.remove(0);
    assert_eq!(sub.tier, SubscriptionTier::Starter);
    let update = h.store.find_event_by_source_id("evt_update").await.unwrap().unwrap();
    assert_eq!(update.status, EventStatus::Processed);
}

// =========================================================================
// Claims and recovery
// =========================================================================

#[tokio::test]
async fn test_concurrent_drains_process_row_once() {
    let h = Harness::new();
    let handler = CountingHandler::new(1, 30);
    let (processor, scheduler) = h.with_handler(handler.clone());

    let event = h.insert_raw("charge.refunded").await;
    let first = processor.process_event(event.id).await.unwrap();
    assert!(matches!(first, Attempt::Settled(Settlement::RetryScheduled { .. })));

    h.clock.advance(Duration::minutes(1));
    let (a, b) = tokio::join!(scheduler.drain_retry_queue(), scheduler.drain_retry_queue());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.events.succeeded + b.events.succeeded, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2, "one inline, one retry");

    let stored = h.store.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Processed);
}

#[tokio::test]
async fn test_released_claim_cannot_commit() {
    let h = Harness::new();
    let handler = CountingHandler::new(0, 50);
    let (processor, _) = h.with_handler(handler.clone());
    let event = h.insert_raw("charge.refunded").await;

    let slow = processor.process_event(event.id);
    let recover = async {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        h.clock.advance(Duration::minutes(31));
        let now = h.clock.now();
        let released = h
            .store
            .release_stuck_events(now - Duration::minutes(30), now)
            .await
            .unwrap();
        assert_eq!(released, 1);
        processor.process_event(event.id).await
    };
    let (stale, fresh) = tokio::join!(slow, recover);

    assert_eq!(stale.unwrap(), Attempt::Skipped);
    assert_eq!(fresh.unwrap(), Attempt::Settled(Settlement::Completed));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

    let stored = h.store.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Processed);
}

/// Runs the real payment handler, then books usage before the processor commits
struct UsageDuringPaymentHandler {
    service: SubscriptionService,
    owner_id: Uuid,
}

#[async_trait]
impl EventHandler for UsageDuringPaymentHandler {
    fn name(&self) -> &'static str {
        "usage_during_payment"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::PaymentSucceeded]
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &ExternalEvent,
    ) -> EngineResult<Reconciliation> {
        let reconciliation = PaymentSucceededHandler.handle(ctx, event).await?;
        let booked = self
            .service
            .record_usage(self.owner_id, Feature::PanicButton)
            .await?;
        assert!(booked.allowed);
        Ok(reconciliation)
    }
}

/// Runs the real failure handler; on its first call another payment failure for the
/// same subscription commits before this attempt does
struct RacingFailureHandler {
    store: Arc<InMemoryStore>,
    calls: AtomicUsize,
}

#[async_trait]
impl EventHandler for RacingFailureHandler {
    fn name(&self) -> &'static str {
        "racing_failure"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::PaymentFailed]
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &ExternalEvent,
    ) -> EngineResult<Reconciliation> {
        let reconciliation = PaymentFailedHandler.handle(ctx, event).await?;
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            let mut other = self.store.subscriptions().await.remove(0);
            other.record_payment_failure();
            other.version += 1;
            self.store.put_subscription(other).await;
        }
        Ok(reconciliation)
    }
}

#[tokio::test]
async fn test_usage_booked_during_reconciliation_is_kept() {
    let h = Harness::new();
    let sub = h.seed_subscription(SubscriptionTier::Pro).await;

    let mut registry = HandlerRegistry::new();
    registry
        .register(Arc::new(UsageDuringPaymentHandler {
            service: h.engine.subscriptions.clone(),
            owner_id: sub.owner_id,
        }))
        .unwrap();
    let (processor, _) = h.with_registry(registry);

    let event = h
        .insert_object(
            "invoice.paid",
            json!({
                "id": "in_1",
                "object": "invoice",
                "customer": "cus_1",
                "subscription": "sub_1",
                "amount_paid": 4900,
                "currency": "usd",
            }),
        )
        .await;

    let attempt = processor.process_event(event.id).await.unwrap();
    assert_eq!(attempt, Attempt::Settled(Settlement::Completed));

    let stored = h.store.subscriptions().await.remove(0);
    assert_eq!(stored.last_payment_amount, Some(4900));
    assert_eq!(stored.usage.panic_alerts, 1, "usage booked mid-flight survives the commit");
}

#[tokio::test]
async fn test_concurrent_payment_failures_both_counted() {
    let h = Harness::new();
    h.seed_subscription(SubscriptionTier::Pro).await;

    let handler = Arc::new(RacingFailureHandler {
        store: h.store.clone(),
        calls: AtomicUsize::new(0),
    });
    let mut registry = HandlerRegistry::new();
    registry.register(handler.clone()).unwrap();
    let (processor, _) = h.with_registry(registry);

    let event = h.insert_object("invoice.payment_failed", failed_invoice("in_2")).await;
    let attempt = processor.process_event(event.id).await.unwrap();

    assert_eq!(attempt, Attempt::Settled(Settlement::Completed));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2, "re-run against fresh state");

    let stored = h.store.subscriptions().await.remove(0);
    assert_eq!(stored.consecutive_payment_failures, 2);
    assert_eq!(stored.version, 2);
    let event = h.store.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(event.retry.retry_count, 0, "a re-run is not a failed attempt");
}

// =========================================================================
// Notification channels
// =========================================================================

// Scenario: unconfigured SMS channel
#[tokio::test]
async fn test_sms_without_provider_fails_terminally() {
    let h = Harness::new();
    let recipient = Recipient::new(Uuid::new_v4())
        .with_email("owner@example.com")
        .with_phone("+15550100");

    let rows = h
        .engine
        .notifications
        .send_notification(
            &recipient,
            NotificationPayload::new(NotificationType::PanicButtonAlert, "Panic", "Help needed"),
            SendOptions::default(),
        )
        .await
        .unwrap();

    let channels: Vec<_> = rows.iter().map(|r| r.channel).collect();
    assert_eq!(channels, vec![Channel::Email, Channel::Sms, Channel::InApp]);

    let sms = rows.iter().find(|r| r.channel == Channel::Sms).unwrap();
    assert_eq!(sms.status, NotificationStatus::Failed);
    assert_eq!(sms.error_message.as_deref(), Some("SMS provider not configured"));
    assert!(sms.retry.next_retry_at.is_none());

    h.clock.advance(Duration::hours(1));
    let report = h.engine.scheduler.drain_retry_queue().await.unwrap();
    assert_eq!(report.notifications.attempted(), 0);
}

#[tokio::test]
async fn test_retention_purges_only_expired_read_rows() {
    let h = Harness::new();
    let recipient = Recipient::new(Uuid::new_v4());
    let rows = h
        .engine
        .notifications
        .send_notification(
            &recipient,
            NotificationPayload::new(NotificationType::SecurityAlert, "New login", "From Berlin"),
            SendOptions::channels([Channel::InApp]),
        )
        .await
        .unwrap();
    assert_eq!(h.engine.notifications.unread_count(recipient.id).await.unwrap(), 1);

    assert!(h
        .engine
        .notifications
        .mark_as_read(rows[0].id, recipient.id)
        .await
        .unwrap());
    assert_eq!(h.engine.notifications.unread_count(recipient.id).await.unwrap(), 0);

    let retention = EngineConfig::new(SECRET).notification_retention;
    let purged = h
        .engine
        .notifications
        .purge_read(h.clock.now() - retention)
        .await
        .unwrap();
    assert_eq!(purged, 0);

    h.clock.advance(retention + Duration::days(1));
    let purged = h
        .engine
        .notifications
        .purge_read(h.clock.now() - retention)
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(h.store.notifications().await.is_empty());
}
