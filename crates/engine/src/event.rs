//! Persisted upstream webhook deliveries and their processing state

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::EngineError;
use crate::provider::ProviderEvent;
use crate::state_machine::{Processable, RetryState};

/// Event categories the engine knows about.
///
/// Only some of them have a reconciliation handler; the rest are declared so they are
/// recorded with a typed category and settle as IGNORED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    TrialEnding,
    PaymentSucceeded,
    PaymentFailed,
    /// Fires alongside `invoice.paid` for the same invoice; handling both would apply
    /// the payment twice, so only `invoice.paid` is reconciled.
    InvoicePaymentSucceeded,
    InvoiceFinalized,
    CheckoutCompleted,
    ChargeRefunded,
    ChargeDisputeCreated,
    CustomerUpdated,
    Unknown,
}

impl EventType {
    pub const ALL: [EventType; 13] = [
        EventType::SubscriptionCreated,
        EventType::SubscriptionUpdated,
        EventType::SubscriptionDeleted,
        EventType::TrialEnding,
        EventType::PaymentSucceeded,
        EventType::PaymentFailed,
        EventType::InvoicePaymentSucceeded,
        EventType::InvoiceFinalized,
        EventType::CheckoutCompleted,
        EventType::ChargeRefunded,
        EventType::ChargeDisputeCreated,
        EventType::CustomerUpdated,
        EventType::Unknown,
    ];

    /// Classify a processor event type string
    pub fn from_provider_type(raw: &str) -> Self {
        match raw {
            "customer.subscription.created" => EventType::SubscriptionCreated,
            "customer.subscription.updated" => EventType::SubscriptionUpdated,
            "customer.subscription.deleted" => EventType::SubscriptionDeleted,
            "customer.subscription.trial_will_end" => EventType::TrialEnding,
            "invoice.paid" => EventType::PaymentSucceeded,
            "invoice.payment_failed" => EventType::PaymentFailed,
            "invoice.payment_succeeded" => EventType::InvoicePaymentSucceeded,
            "invoice.finalized" => EventType::InvoiceFinalized,
            "checkout.session.completed" => EventType::CheckoutCompleted,
            "charge.refunded" => EventType::ChargeRefunded,
            "charge.dispute.created" => EventType::ChargeDisputeCreated,
            "customer.updated" => EventType::CustomerUpdated,
            _ => EventType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SubscriptionCreated => "subscription_created",
            EventType::SubscriptionUpdated => "subscription_updated",
            EventType::SubscriptionDeleted => "subscription_deleted",
            EventType::TrialEnding => "trial_ending",
            EventType::PaymentSucceeded => "payment_succeeded",
            EventType::PaymentFailed => "payment_failed",
            EventType::InvoicePaymentSucceeded => "invoice_payment_succeeded",
            EventType::InvoiceFinalized => "invoice_finalized",
            EventType::CheckoutCompleted => "checkout_completed",
            EventType::ChargeRefunded => "charge_refunded",
            EventType::ChargeDisputeCreated => "charge_dispute_created",
            EventType::CustomerUpdated => "customer_updated",
            EventType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EngineError::UnknownEventType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Ignored,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
            EventStatus::Ignored => "ignored",
        }
    }

    /// Transitions are forward-only, except FAILED -> PROCESSING for a retry
    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Failed, Processing)
                | (Processing, Processed)
                | (Processing, Failed)
                | (Processing, Ignored)
        )
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "processed" => Ok(EventStatus::Processed),
            "failed" => Ok(EventStatus::Failed),
            "ignored" => Ok(EventStatus::Ignored),
            other => Err(EngineError::InvalidState(format!(
                "unknown event status '{}'",
                other
            ))),
        }
    }
}

/// Processor object references carried by an event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub invoice_id: Option<String>,
    pub charge_id: Option<String>,
    pub payment_intent_id: Option<String>,
}

/// One received upstream webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub id: Uuid,
    /// Upstream event id, unique across all rows
    pub source_event_id: String,
    pub event_type: EventType,
    /// Type string as sent by the processor
    pub source_type: String,
    pub status: EventStatus,
    pub payload: serde_json::Value,
    pub correlation: Correlation,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    /// Creation time reported by the processor
    pub occurred_at: OffsetDateTime,
    pub retry: RetryState,
    pub received_at: OffsetDateTime,
    pub processing_started_at: Option<OffsetDateTime>,
    pub processed_at: Option<OffsetDateTime>,
    pub failed_at: Option<OffsetDateTime>,
}

impl ExternalEvent {
    /// Build the PENDING row for a freshly verified delivery
    pub fn received(event: &ProviderEvent, max_retries: u32, now: OffsetDateTime) -> Self {
        let (amount, currency) = event.amount();

        Self {
            id: Uuid::new_v4(),
            source_event_id: event.id.clone(),
            event_type: EventType::from_provider_type(&event.type_),
            source_type: event.type_.clone(),
            status: EventStatus::Pending,
            payload: event.object().clone(),
            correlation: event.correlation(),
            amount,
            currency,
            occurred_at: event.created_at().unwrap_or(now),
            retry: RetryState::new(max_retries),
            received_at: now,
            processing_started_at: None,
            processed_at: None,
            failed_at: None,
        }
    }

    /// Move into PROCESSING, enforcing the transition rules
    pub fn begin_processing(&mut self, now: OffsetDateTime) -> Result<(), EngineError> {
        if !self.status.can_transition_to(EventStatus::Processing) {
            return Err(EngineError::InvalidState(format!(
                "event {} cannot move from {} to processing",
                self.source_event_id, self.status
            )));
        }
        if self.status == EventStatus::Failed && !self.retry.has_budget() {
            return Err(EngineError::TerminalFailure(format!(
                "event {} has used {} of {} attempts",
                self.source_event_id, self.retry.retry_count, self.retry.max_retries
            )));
        }
        self.status = EventStatus::Processing;
        self.processing_started_at = Some(now);
        Ok(())
    }
}

impl Processable for ExternalEvent {
    type Completion = ();

    fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    fn retry_state_mut(&mut self) -> &mut RetryState {
        &mut self.retry
    }

    fn mark_completed(&mut self, _: (), now: OffsetDateTime) {
        self.status = EventStatus::Processed;
        self.processed_at = Some(now);
    }

    fn mark_ignored(&mut self, _reason: &str, now: OffsetDateTime) {
        self.status = EventStatus::Ignored;
        self.processed_at = Some(now);
    }

    fn mark_failed(&mut self, now: OffsetDateTime) {
        self.status = EventStatus::Failed;
        self.failed_at = Some(now);
    }
}
