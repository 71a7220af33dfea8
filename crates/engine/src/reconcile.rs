//! Subscription reconciliation handlers
//!
//! A handler reads the event and current state and returns what should change; it never
//! writes. The processor commits the returned [`Reconciliation`] together with the event
//! status, so a crash between "mutate" and "mark processed" cannot double-apply.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::config::PriceMap;
use crate::error::{EngineError, EngineResult};
use crate::event::{EventType, ExternalEvent};
use crate::notifications::content;
use crate::notifications::{NotificationDraft, NotificationPayload, Recipient};
use crate::provider::{InvoiceObject, SubscriptionObject};
use crate::store::{OwnerDirectory, SubscriptionStore};
use crate::subscription::{Subscription, SubscriptionStatus, SubscriptionTier};

/// What a handler wants applied
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// New state of the subscription the event refers to
    pub subscription: Option<Subscription>,
    pub notifications: Vec<NotificationDraft>,
    /// Why nothing changed, for no-op outcomes
    pub note: Option<String>,
}

impl Reconciliation {
    pub fn unchanged(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Self::default()
        }
    }

    pub fn update(subscription: Subscription) -> Self {
        Self {
            subscription: Some(subscription),
            ..Self::default()
        }
    }

    pub fn notify(mut self, recipient: &Recipient, payload: NotificationPayload) -> Self {
        self.notifications
            .push(NotificationDraft::new(recipient.clone(), payload));
        self
    }
}

/// Read access handlers get to the rest of the system
#[derive(Clone)]
pub struct HandlerContext {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub owners: Arc<dyn OwnerDirectory>,
    pub prices: Arc<PriceMap>,
    pub now: OffsetDateTime,
}

impl HandlerContext {
    /// Subscription the event refers to; absence is retryable since the creating
    /// event may still be in flight
    async fn require_subscription(&self, external_id: Option<&str>) -> EngineResult<Subscription> {
        let external_id = external_id.ok_or_else(|| {
            EngineError::InvalidPayload("event carries no subscription reference".to_string())
        })?;
        self.subscriptions
            .find_subscription_by_external_id(external_id)
            .await?
            .ok_or_else(|| {
                EngineError::Precondition(format!("subscription {} not found", external_id))
            })
    }

    async fn recipient_for(&self, subscription: &Subscription) -> EngineResult<Recipient> {
        Ok(self
            .owners
            .owner(subscription.owner_id)
            .await?
            .unwrap_or_else(|| Recipient::new(subscription.owner_id)))
    }

    fn tier_for(&self, object: &SubscriptionObject) -> Option<SubscriptionTier> {
        object
            .price_id()
            .and_then(|price| self.prices.tier_for_price_id(price))
            .or_else(|| object.metadata.get("tier").and_then(|t| t.parse().ok()))
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Event types this handler owns
    fn handles(&self) -> &'static [EventType];

    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &ExternalEvent,
    ) -> EngineResult<Reconciliation>;
}

/// Event type to handler mapping; each type has at most one handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the subscription lifecycle handlers
    pub fn with_defaults() -> EngineResult<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(SubscriptionCreatedHandler))?;
        registry.register(Arc::new(SubscriptionUpdatedHandler))?;
        registry.register(Arc::new(SubscriptionDeletedHandler))?;
        registry.register(Arc::new(PaymentSucceededHandler))?;
        registry.register(Arc::new(PaymentFailedHandler))?;
        registry.register(Arc::new(TrialEndingHandler))?;
        Ok(registry)
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) -> EngineResult<()> {
        for event_type in handler.handles() {
            if *event_type == EventType::Unknown {
                return Err(EngineError::Config(format!(
                    "handler {} cannot claim unknown events",
                    handler.name()
                )));
            }
            if let Some(existing) = self.handlers.get(event_type) {
                return Err(EngineError::Config(format!(
                    "{} is already handled by {}",
                    event_type,
                    existing.name()
                )));
            }
        }
        for event_type in handler.handles() {
            self.handlers.insert(*event_type, handler.clone());
        }
        Ok(())
    }

    pub fn handler_for(&self, event_type: EventType) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&event_type).cloned()
    }
}

// ============================================================================
// Subscription lifecycle
// ============================================================================

pub struct SubscriptionCreatedHandler;

#[async_trait]
impl EventHandler for SubscriptionCreatedHandler {
    fn name(&self) -> &'static str {
        "subscription_created"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::SubscriptionCreated]
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &ExternalEvent,
    ) -> EngineResult<Reconciliation> {
        let object = SubscriptionObject::parse(&event.payload)?;
        let customer_id = object
            .customer
            .clone()
            .or_else(|| event.correlation.customer_id.clone())
            .ok_or_else(|| EngineError::InvalidPayload("subscription has no customer".into()))?;

        let owner = ctx
            .owners
            .owner_for_customer(&customer_id)
            .await?
            .ok_or_else(|| {
                EngineError::Precondition(format!("no local owner for customer {}", customer_id))
            })?;

        let tier = ctx.tier_for(&object).ok_or_else(|| {
            EngineError::InvalidPayload(format!(
                "price {} does not map to a tier",
                object.price_id().unwrap_or("<none>")
            ))
        })?;

        let status = object
            .status
            .as_deref()
            .and_then(SubscriptionStatus::from_provider_status)
            .unwrap_or_else(|| match object.trial_end_at() {
                Some(end) if end > ctx.now => SubscriptionStatus::Trial,
                _ => SubscriptionStatus::Active,
            });

        // Upsert: a row may already exist if the subscription was imported or a later
        // event was applied first
        let existing = ctx
            .subscriptions
            .find_subscription_by_external_id(&object.id)
            .await?;
        let is_new = existing.is_none();

        let mut subscription = match existing {
            Some(existing) if existing.is_stale(event.occurred_at) => {
                return Ok(Reconciliation::unchanged("newer state already applied"));
            }
            Some(mut existing) => {
                existing.tier = tier;
                existing.status = status;
                existing
            }
            None => Subscription::new(owner.id, &customer_id, &object.id, tier, status, ctx.now),
        };

        subscription.sync_period(object.period_start(), object.period_end());
        subscription.trial_end = object.trial_end_at();
        subscription.cancel_at_period_end = object.cancel_at_period_end;
        subscription.observe_event(event.occurred_at, ctx.now);

        tracing::info!(
            owner_id = %owner.id,
            subscription_id = %object.id,
            tier = %tier,
            status = %status,
            created = is_new,
            "Reconciled new subscription"
        );

        let reconciliation = Reconciliation::update(subscription.clone());
        if is_new {
            Ok(reconciliation.notify(&owner, content::welcome(&subscription)))
        } else {
            Ok(reconciliation)
        }
    }
}

pub struct SubscriptionUpdatedHandler;

#[async_trait]
impl EventHandler for SubscriptionUpdatedHandler {
    fn name(&self) -> &'static str {
        "subscription_updated"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::SubscriptionUpdated]
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &ExternalEvent,
    ) -> EngineResult<Reconciliation> {
        let object = SubscriptionObject::parse(&event.payload)?;
        let mut subscription = ctx.require_subscription(Some(object.id.as_str())).await?;

        if subscription.is_stale(event.occurred_at) {
            tracing::info!(
                subscription_id = %object.id,
                event_id = %event.source_event_id,
                "Skipping stale subscription update"
            );
            return Ok(Reconciliation::unchanged("stale subscription update"));
        }

        let previous_tier = subscription.tier;
        match ctx.tier_for(&object) {
            Some(tier) => subscription.tier = tier,
            None => tracing::warn!(
                subscription_id = %object.id,
                price_id = object.price_id().unwrap_or("<none>"),
                "Price does not map to a tier, keeping current tier"
            ),
        }

        if let Some(status) = object
            .status
            .as_deref()
            .and_then(SubscriptionStatus::from_provider_status)
        {
            subscription.status = status;
            if status == SubscriptionStatus::Cancelled {
                let at = object.canceled_at_time().unwrap_or(event.occurred_at);
                subscription.cancel(at);
            }
        }

        subscription.sync_period(object.period_start(), object.period_end());
        subscription.trial_end = object.trial_end_at().or(subscription.trial_end);
        subscription.cancel_at_period_end = object.cancel_at_period_end;
        subscription.observe_event(event.occurred_at, ctx.now);

        let reconciliation = Reconciliation::update(subscription.clone());
        if subscription.tier == previous_tier {
            return Ok(reconciliation);
        }

        tracing::info!(
            subscription_id = %object.id,
            from = %previous_tier,
            to = %subscription.tier,
            "Subscription tier changed"
        );
        let recipient = ctx.recipient_for(&subscription).await?;
        Ok(reconciliation.notify(&recipient, content::tier_changed(&subscription, previous_tier)))
    }
}

pub struct SubscriptionDeletedHandler;

#[async_trait]
impl EventHandler for SubscriptionDeletedHandler {
    fn name(&self) -> &'static str {
        "subscription_deleted"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::SubscriptionDeleted]
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &ExternalEvent,
    ) -> EngineResult<Reconciliation> {
        let object = SubscriptionObject::parse(&event.payload)?;
        let Some(mut subscription) = ctx
            .subscriptions
            .find_subscription_by_external_id(&object.id)
            .await?
        else {
            return Ok(Reconciliation::unchanged("subscription already absent"));
        };

        if subscription.status == SubscriptionStatus::Cancelled {
            return Ok(Reconciliation::unchanged("subscription already cancelled"));
        }
        if subscription.is_stale(event.occurred_at) {
            return Ok(Reconciliation::unchanged("stale subscription deletion"));
        }

        subscription.cancel(object.canceled_at_time().unwrap_or(event.occurred_at));
        subscription.cancel_at_period_end = false;
        subscription.observe_event(event.occurred_at, ctx.now);

        tracing::info!(
            subscription_id = %object.id,
            owner_id = %subscription.owner_id,
            "Subscription cancelled"
        );

        let recipient = ctx.recipient_for(&subscription).await?;
        Ok(Reconciliation::update(subscription.clone())
            .notify(&recipient, content::cancelled(&subscription)))
    }
}

pub struct TrialEndingHandler;

#[async_trait]
impl EventHandler for TrialEndingHandler {
    fn name(&self) -> &'static str {
        "trial_ending"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::TrialEnding]
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &ExternalEvent,
    ) -> EngineResult<Reconciliation> {
        let object = SubscriptionObject::parse(&event.payload)?;
        let subscription = ctx.require_subscription(Some(object.id.as_str())).await?;

        let Some(trial_end) = object.trial_end_at().or(subscription.trial_end) else {
            return Ok(Reconciliation::unchanged("subscription has no trial end"));
        };

        let days = content::days_remaining(trial_end, ctx.now);
        let recipient = ctx.recipient_for(&subscription).await?;

        // Reminder only; the subscription itself is left untouched
        Ok(Reconciliation::default().notify(&recipient, content::trial_ending(&subscription, days)))
    }
}

// ============================================================================
// Payments
// ============================================================================

fn invoice_subscription_id(invoice: &InvoiceObject, event: &ExternalEvent) -> Option<String> {
    invoice
        .subscription_id()
        .or_else(|| event.correlation.subscription_id.clone())
}

pub struct PaymentSucceededHandler;

#[async_trait]
impl EventHandler for PaymentSucceededHandler {
    fn name(&self) -> &'static str {
        "payment_succeeded"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::PaymentSucceeded]
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &ExternalEvent,
    ) -> EngineResult<Reconciliation> {
        let invoice = InvoiceObject::parse(&event.payload)?;
        let Some(subscription_id) = invoice_subscription_id(&invoice, event) else {
            return Ok(Reconciliation::unchanged("invoice is not tied to a subscription"));
        };
        let mut subscription = ctx.require_subscription(Some(subscription_id.as_str())).await?;

        let amount = invoice.amount_paid.or(event.amount);
        let currency = invoice
            .currency
            .as_deref()
            .map(str::to_ascii_lowercase)
            .or_else(|| event.currency.clone());
        let paid_at = invoice.paid_at().unwrap_or(event.occurred_at);

        let was_past_due = subscription.status == SubscriptionStatus::PastDue;
        subscription.record_payment(amount, currency.clone(), paid_at);
        subscription.updated_at = ctx.now;

        tracing::info!(
            subscription_id = %subscription_id,
            invoice_id = %invoice.id,
            amount = ?amount,
            recovered = was_past_due,
            "Payment recorded"
        );

        let recipient = ctx.recipient_for(&subscription).await?;
        let payload = content::payment_succeeded(&subscription, amount, currency.as_deref());
        Ok(Reconciliation::update(subscription).notify(&recipient, payload))
    }
}

pub struct PaymentFailedHandler;

#[async_trait]
impl EventHandler for PaymentFailedHandler {
    fn name(&self) -> &'static str {
        "payment_failed"
    }

    fn handles(&self) -> &'static [EventType] {
        &[EventType::PaymentFailed]
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        event: &ExternalEvent,
    ) -> EngineResult<Reconciliation> {
        let invoice = InvoiceObject::parse(&event.payload)?;
        let Some(subscription_id) = invoice_subscription_id(&invoice, event) else {
            return Ok(Reconciliation::unchanged("invoice is not tied to a subscription"));
        };
        let mut subscription = ctx.require_subscription(Some(subscription_id.as_str())).await?;

        let became_past_due = subscription.record_payment_failure();
        subscription.updated_at = ctx.now;

        tracing::warn!(
            subscription_id = %subscription_id,
            invoice_id = %invoice.id,
            consecutive_failures = subscription.consecutive_payment_failures,
            attempt_count = ?invoice.attempt_count,
            past_due = became_past_due,
            "Payment failed"
        );

        let recipient = ctx.recipient_for(&subscription).await?;
        let currency = invoice.currency.as_deref().or(event.currency.as_deref());
        let mut reconciliation = Reconciliation::update(subscription.clone()).notify(
            &recipient,
            content::payment_failed(
                &subscription,
                invoice.amount_due.or(event.amount),
                currency,
                invoice.hosted_invoice_url.as_deref(),
            ),
        );
        if became_past_due {
            reconciliation = reconciliation.notify(&recipient, content::past_due(&subscription));
        }
        Ok(reconciliation)
    }
}
