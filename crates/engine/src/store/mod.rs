//! Persistence seams
//!
//! Every state change that must not be lost or double-applied goes through one of
//! these traits. Claims (`claim_event`, `claim_notification`) are atomic conditional
//! updates: at most one caller wins a given row, the others get `None`.

mod memory;
mod postgres;

use std::future::Future;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::event::{EventStatus, ExternalEvent};
use crate::notifications::{NotificationRequest, Recipient};
use crate::subscription::{Feature, Subscription};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Result of persisting a newly received event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An event with the same upstream id exists; carries its local id
    Duplicate(Uuid),
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new event unless its `source_event_id` is already known
    async fn insert_event(&self, event: &ExternalEvent) -> EngineResult<InsertOutcome>;

    async fn get_event(&self, id: Uuid) -> EngineResult<Option<ExternalEvent>>;

    async fn find_event_by_source_id(
        &self,
        source_event_id: &str,
    ) -> EngineResult<Option<ExternalEvent>>;

    /// Move an event from `expected` to PROCESSING.
    ///
    /// A FAILED event can only be claimed while it has retry budget and its
    /// `next_retry_at` has passed.
    async fn claim_event(
        &self,
        id: Uuid,
        expected: EventStatus,
        now: OffsetDateTime,
    ) -> EngineResult<Option<ExternalEvent>>;

    async fn save_event(&self, event: &ExternalEvent) -> EngineResult<()>;

    /// Write the settled event, the reconciled subscription and the notification rows
    /// it produced as one unit.
    ///
    /// Fails with `InvalidState` when the attempt no longer holds the event, and with
    /// `Conflict` when the subscription moved past the version the handler read.
    async fn commit_reconciliation(
        &self,
        event: &ExternalEvent,
        subscription: Option<&Subscription>,
        notifications: &[NotificationRequest],
    ) -> EngineResult<()>;

    /// FAILED events with budget left whose retry time has come, oldest first
    async fn due_failed_events(&self, now: OffsetDateTime, limit: i64) -> EngineResult<Vec<Uuid>>;

    /// PENDING events received before `received_before` that no attempt ever claimed
    async fn due_pending_events(
        &self,
        received_before: OffsetDateTime,
        limit: i64,
    ) -> EngineResult<Vec<Uuid>>;

    /// Release events stuck in PROCESSING since before `started_before` back to FAILED,
    /// due immediately
    async fn release_stuck_events(
        &self,
        started_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> EngineResult<u64>;

    async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<ExternalEvent>>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_notifications(&self, requests: &[NotificationRequest]) -> EngineResult<()>;

    async fn get_notification(&self, id: Uuid) -> EngineResult<Option<NotificationRequest>>;

    /// Take a delivery lease on a PENDING or due FAILED request until `lease_until`.
    ///
    /// PENDING requests scheduled for later and requests under an unexpired lease
    /// cannot be claimed.
    async fn claim_notification(
        &self,
        id: Uuid,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> EngineResult<Option<NotificationRequest>>;

    async fn save_notification(&self, request: &NotificationRequest) -> EngineResult<()>;

    /// Write the result of a delivery attempt, but only while the row still carries the
    /// lease that attempt claimed. Returns false when the lease was lost.
    async fn settle_notification(
        &self,
        request: &NotificationRequest,
        lease: OffsetDateTime,
    ) -> EngineResult<bool>;

    /// FAILED requests with budget left whose retry time has come
    async fn due_failed_notifications(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> EngineResult<Vec<Uuid>>;

    /// PENDING requests ready for a first attempt: scheduled ones whose time has come,
    /// and unscheduled ones created before `created_before` that were never attempted
    async fn due_pending_notifications(
        &self,
        now: OffsetDateTime,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> EngineResult<Vec<Uuid>>;

    /// Mark one of the recipient's notifications as read
    async fn mark_read(
        &self,
        id: Uuid,
        recipient_id: Uuid,
        now: OffsetDateTime,
    ) -> EngineResult<bool>;

    /// Mark every unread IN_APP notification of the recipient as read
    async fn mark_all_read(&self, recipient_id: Uuid, now: OffsetDateTime) -> EngineResult<u64>;

    /// Delete READ notifications read before `cutoff`
    async fn purge_read_before(&self, cutoff: OffsetDateTime) -> EngineResult<u64>;

    async fn find_notification_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> EngineResult<Option<NotificationRequest>>;

    /// The recipient's IN_APP inbox, newest first
    async fn notifications_for_recipient(
        &self,
        recipient_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> EngineResult<Vec<NotificationRequest>>;

    async fn unread_count(&self, recipient_id: Uuid) -> EngineResult<u64>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> EngineResult<Option<Subscription>>;

    /// The owner's current subscription: the newest entitled one, else the newest
    async fn find_subscription_by_owner(&self, owner_id: Uuid) -> EngineResult<Option<Subscription>>;

    /// Add one unit of usage if it stays within `limit`. Returns the new count, or
    /// `None` when the limit was already reached.
    async fn increment_usage(
        &self,
        subscription_id: Uuid,
        feature: Feature,
        limit: u32,
    ) -> EngineResult<Option<u32>>;
}

/// Maps processor customers to local owners and their contact addresses
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn owner_for_customer(&self, external_customer_id: &str) -> EngineResult<Option<Recipient>>;

    async fn owner(&self, owner_id: Uuid) -> EngineResult<Option<Recipient>>;
}

/// Everything the engine persists
pub trait Store: EventStore + NotificationStore + SubscriptionStore + OwnerDirectory {}

impl<T> Store for T where T: EventStore + NotificationStore + SubscriptionStore + OwnerDirectory {}

const STATUS_WRITE_RETRY_DELAY_MS: u64 = 250;

/// Run a final status write, retrying once on a database error.
///
/// A lost status write leaves a row claimed but unsettled until stuck-row recovery
/// picks it up, so it gets one more chance before the error is surfaced.
pub(crate) async fn write_with_retry<T, F, Fut>(what: &str, op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    RetryIf::spawn(
        FixedInterval::from_millis(STATUS_WRITE_RETRY_DELAY_MS).take(1),
        op,
        |e: &EngineError| {
            let transient = matches!(e, EngineError::Database(_));
            if transient {
                tracing::warn!(write = what, error = %e, "Status write failed");
            }
            transient
        },
    )
    .await
}
