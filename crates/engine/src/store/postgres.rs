//! Postgres store
//!
//! Runtime-checked `sqlx` queries. Deduplication relies on the unique
//! `source_event_id` constraint, claims are conditional `UPDATE ... RETURNING`
//! statements, and a reconciliation commit is one transaction.

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{EventStore, InsertOutcome, NotificationStore, OwnerDirectory, SubscriptionStore};
use crate::error::{EngineError, EngineResult};
use crate::event::{Correlation, EventStatus, EventType, ExternalEvent};
use crate::notifications::{NotificationRequest, Recipient};
use crate::state_machine::RetryState;
use crate::subscription::{Feature, Subscription, UsageCounters};

macro_rules! event_columns {
    () => {
        "id, source_event_id, event_type, source_type, status, payload, customer_id, \
         subscription_id, invoice_id, charge_id, payment_intent_id, amount, currency, \
         occurred_at, retry_count, max_retries, next_retry_at, last_error, received_at, \
         processing_started_at, processed_at, failed_at"
    };
}

macro_rules! notification_columns {
    () => {
        "id, recipient_id, recipient_address, notification_type, channel, status, priority, \
         subject, content, template, metadata, retry_count, max_retries, next_retry_at, \
         last_error, scheduled_for, lease_expires_at, source_event_id, provider_message_id, \
         error_message, created_at, sent_at, delivered_at, read_at, failed_at"
    };
}

macro_rules! subscription_columns {
    () => {
        "id, owner_id, tier, status, current_period_start, current_period_end, trial_end, \
         external_customer_id, external_subscription_id, cancel_at_period_end, cancelled_at, \
         last_payment_amount, last_payment_currency, last_payment_at, \
         consecutive_payment_failures, panic_alerts_used, office_hours_used, last_event_at, \
         version, created_at, updated_at"
    };
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> EngineResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    source_event_id: String,
    event_type: String,
    source_type: String,
    status: String,
    payload: serde_json::Value,
    customer_id: Option<String>,
    subscription_id: Option<String>,
    invoice_id: Option<String>,
    charge_id: Option<String>,
    payment_intent_id: Option<String>,
    amount: Option<i64>,
    currency: Option<String>,
    occurred_at: OffsetDateTime,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<OffsetDateTime>,
    last_error: Option<String>,
    received_at: OffsetDateTime,
    processing_started_at: Option<OffsetDateTime>,
    processed_at: Option<OffsetDateTime>,
    failed_at: Option<OffsetDateTime>,
}

impl TryFrom<EventRow> for ExternalEvent {
    type Error = EngineError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(ExternalEvent {
            id: row.id,
            source_event_id: row.source_event_id,
            // Rows written by a newer build may carry types this one does not know
            event_type: row.event_type.parse().unwrap_or(EventType::Unknown),
            source_type: row.source_type,
            status: row.status.parse()?,
            payload: row.payload,
            correlation: Correlation {
                customer_id: row.customer_id,
                subscription_id: row.subscription_id,
                invoice_id: row.invoice_id,
                charge_id: row.charge_id,
                payment_intent_id: row.payment_intent_id,
            },
            amount: row.amount,
            currency: row.currency,
            occurred_at: row.occurred_at,
            retry: RetryState {
                retry_count: to_u32(row.retry_count),
                max_retries: to_u32(row.max_retries),
                next_retry_at: row.next_retry_at,
                last_error: row.last_error,
            },
            received_at: row.received_at,
            processing_started_at: row.processing_started_at,
            processed_at: row.processed_at,
            failed_at: row.failed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    recipient_id: Uuid,
    recipient_address: Option<String>,
    notification_type: String,
    channel: String,
    status: String,
    priority: String,
    subject: String,
    content: String,
    template: Option<String>,
    metadata: serde_json::Value,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<OffsetDateTime>,
    last_error: Option<String>,
    scheduled_for: Option<OffsetDateTime>,
    lease_expires_at: Option<OffsetDateTime>,
    source_event_id: Option<Uuid>,
    provider_message_id: Option<String>,
    error_message: Option<String>,
    created_at: OffsetDateTime,
    sent_at: Option<OffsetDateTime>,
    delivered_at: Option<OffsetDateTime>,
    read_at: Option<OffsetDateTime>,
    failed_at: Option<OffsetDateTime>,
}

impl TryFrom<NotificationRow> for NotificationRequest {
    type Error = EngineError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(NotificationRequest {
            id: row.id,
            recipient_id: row.recipient_id,
            recipient_address: row.recipient_address,
            notification_type: row.notification_type.parse()?,
            channel: row.channel.parse()?,
            status: row.status.parse()?,
            priority: row.priority.parse()?,
            subject: row.subject,
            content: row.content,
            template: row.template,
            metadata: row.metadata,
            retry: RetryState {
                retry_count: to_u32(row.retry_count),
                max_retries: to_u32(row.max_retries),
                next_retry_at: row.next_retry_at,
                last_error: row.last_error,
            },
            scheduled_for: row.scheduled_for,
            lease_expires_at: row.lease_expires_at,
            source_event_id: row.source_event_id,
            provider_message_id: row.provider_message_id,
            error_message: row.error_message,
            created_at: row.created_at,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            read_at: row.read_at,
            failed_at: row.failed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    owner_id: Uuid,
    tier: String,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
    external_customer_id: String,
    external_subscription_id: String,
    cancel_at_period_end: bool,
    cancelled_at: Option<OffsetDateTime>,
    last_payment_amount: Option<i64>,
    last_payment_currency: Option<String>,
    last_payment_at: Option<OffsetDateTime>,
    consecutive_payment_failures: i32,
    panic_alerts_used: i32,
    office_hours_used: i32,
    last_event_at: Option<OffsetDateTime>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = EngineError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            owner_id: row.owner_id,
            tier: row.tier.parse()?,
            status: row.status.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            trial_end: row.trial_end,
            external_customer_id: row.external_customer_id,
            external_subscription_id: row.external_subscription_id,
            cancel_at_period_end: row.cancel_at_period_end,
            cancelled_at: row.cancelled_at,
            last_payment_amount: row.last_payment_amount,
            last_payment_currency: row.last_payment_currency,
            last_payment_at: row.last_payment_at,
            consecutive_payment_failures: to_u32(row.consecutive_payment_failures),
            usage: UsageCounters {
                panic_alerts: to_u32(row.panic_alerts_used),
                office_hours: to_u32(row.office_hours_used),
            },
            last_event_at: row.last_event_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    owner_id: Uuid,
    email: Option<String>,
    phone: Option<String>,
    webhook_url: Option<String>,
}

impl From<CustomerRow> for Recipient {
    fn from(row: CustomerRow) -> Self {
        Recipient {
            id: row.owner_id,
            email: row.email,
            phone: row.phone,
            webhook_url: row.webhook_url,
        }
    }
}

async fn insert_notification_row(
    conn: &mut PgConnection,
    request: &NotificationRequest,
) -> EngineResult<()> {
    sqlx::query(concat!(
        "INSERT INTO notification_requests (",
        notification_columns!(),
        ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
         $17, $18, $19, $20, $21, $22, $23, $24, $25)"
    ))
    .bind(request.id)
    .bind(request.recipient_id)
    .bind(&request.recipient_address)
    .bind(request.notification_type.as_str())
    .bind(request.channel.as_str())
    .bind(request.status.as_str())
    .bind(request.priority.as_str())
    .bind(&request.subject)
    .bind(&request.content)
    .bind(&request.template)
    .bind(&request.metadata)
    .bind(to_i32(request.retry.retry_count))
    .bind(to_i32(request.retry.max_retries))
    .bind(request.retry.next_retry_at)
    .bind(&request.retry.last_error)
    .bind(request.scheduled_for)
    .bind(request.lease_expires_at)
    .bind(request.source_event_id)
    .bind(&request.provider_message_id)
    .bind(&request.error_message)
    .bind(request.created_at)
    .bind(request.sent_at)
    .bind(request.delivered_at)
    .bind(request.read_at)
    .bind(request.failed_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Write a reconciled subscription if the stored row is still at the version the
/// handler read. Usage counters are never taken from the reconciled copy: a new row
/// starts at zero and an existing one keeps its counters until the period advances.
async fn upsert_subscription_row(
    conn: &mut PgConnection,
    subscription: &Subscription,
) -> EngineResult<()> {
    let written: Option<(Uuid,)> = sqlx::query_as(concat!(
        "INSERT INTO subscriptions (",
        subscription_columns!(),
        r#") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, 0, 0,
              $16, $17 + 1, $18, $19)
        ON CONFLICT (external_subscription_id) DO UPDATE SET
            tier = EXCLUDED.tier,
            status = EXCLUDED.status,
            current_period_start = EXCLUDED.current_period_start,
            current_period_end = EXCLUDED.current_period_end,
            trial_end = EXCLUDED.trial_end,
            cancel_at_period_end = EXCLUDED.cancel_at_period_end,
            cancelled_at = EXCLUDED.cancelled_at,
            last_payment_amount = EXCLUDED.last_payment_amount,
            last_payment_currency = EXCLUDED.last_payment_currency,
            last_payment_at = EXCLUDED.last_payment_at,
            consecutive_payment_failures = EXCLUDED.consecutive_payment_failures,
            panic_alerts_used = CASE
                WHEN EXCLUDED.current_period_start > subscriptions.current_period_start THEN 0
                ELSE subscriptions.panic_alerts_used
            END,
            office_hours_used = CASE
                WHEN EXCLUDED.current_period_start > subscriptions.current_period_start THEN 0
                ELSE subscriptions.office_hours_used
            END,
            last_event_at = EXCLUDED.last_event_at,
            version = subscriptions.version + 1,
            updated_at = EXCLUDED.updated_at
        WHERE subscriptions.version = $17
        RETURNING id
        "#
    ))
    .bind(subscription.id)
    .bind(subscription.owner_id)
    .bind(subscription.tier.as_str())
    .bind(subscription.status.as_str())
    .bind(subscription.current_period_start)
    .bind(subscription.current_period_end)
    .bind(subscription.trial_end)
    .bind(&subscription.external_customer_id)
    .bind(&subscription.external_subscription_id)
    .bind(subscription.cancel_at_period_end)
    .bind(subscription.cancelled_at)
    .bind(subscription.last_payment_amount)
    .bind(&subscription.last_payment_currency)
    .bind(subscription.last_payment_at)
    .bind(to_i32(subscription.consecutive_payment_failures))
    .bind(subscription.last_event_at)
    .bind(subscription.version)
    .bind(subscription.created_at)
    .bind(subscription.updated_at)
    .fetch_optional(conn)
    .await?;

    match written {
        Some(_) => Ok(()),
        None => Err(EngineError::Conflict(format!(
            "subscription {} changed since version {}",
            subscription.external_subscription_id, subscription.version
        ))),
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_event(&self, event: &ExternalEvent) -> EngineResult<InsertOutcome> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(concat!(
            "INSERT INTO external_events (",
            event_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21, $22) \
             ON CONFLICT (source_event_id) DO NOTHING \
             RETURNING id"
        ))
        .bind(event.id)
        .bind(&event.source_event_id)
        .bind(event.event_type.as_str())
        .bind(&event.source_type)
        .bind(event.status.as_str())
        .bind(&event.payload)
        .bind(&event.correlation.customer_id)
        .bind(&event.correlation.subscription_id)
        .bind(&event.correlation.invoice_id)
        .bind(&event.correlation.charge_id)
        .bind(&event.correlation.payment_intent_id)
        .bind(event.amount)
        .bind(&event.currency)
        .bind(event.occurred_at)
        .bind(to_i32(event.retry.retry_count))
        .bind(to_i32(event.retry.max_retries))
        .bind(event.retry.next_retry_at)
        .bind(&event.retry.last_error)
        .bind(event.received_at)
        .bind(event.processing_started_at)
        .bind(event.processed_at)
        .bind(event.failed_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(InsertOutcome::Inserted);
        }

        let existing: (Uuid,) =
            sqlx::query_as("SELECT id FROM external_events WHERE source_event_id = $1")
                .bind(&event.source_event_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(InsertOutcome::Duplicate(existing.0))
    }

    async fn get_event(&self, id: Uuid) -> EngineResult<Option<ExternalEvent>> {
        sqlx::query_as::<_, EventRow>(concat!(
            "SELECT ",
            event_columns!(),
            " FROM external_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(ExternalEvent::try_from)
        .transpose()
    }

    async fn find_event_by_source_id(
        &self,
        source_event_id: &str,
    ) -> EngineResult<Option<ExternalEvent>> {
        sqlx::query_as::<_, EventRow>(concat!(
            "SELECT ",
            event_columns!(),
            " FROM external_events WHERE source_event_id = $1"
        ))
        .bind(source_event_id)
        .fetch_optional(&self.pool)
        .await?
        .map(ExternalEvent::try_from)
        .transpose()
    }

    async fn claim_event(
        &self,
        id: Uuid,
        expected: EventStatus,
        now: OffsetDateTime,
    ) -> EngineResult<Option<ExternalEvent>> {
        if !expected.can_transition_to(EventStatus::Processing) {
            return Ok(None);
        }

        sqlx::query_as::<_, EventRow>(concat!(
            r#"
            UPDATE external_events
            SET status = 'processing', processing_started_at = $3
            WHERE id = $1
              AND status = $2
              AND ($2 <> 'failed' OR (retry_count < max_retries AND next_retry_at <= $3))
            RETURNING "#,
            event_columns!()
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(ExternalEvent::try_from)
        .transpose()
    }

    async fn save_event(&self, event: &ExternalEvent) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE external_events
            SET status = $2,
                retry_count = $3,
                max_retries = $4,
                next_retry_at = $5,
                last_error = $6,
                processing_started_at = $7,
                processed_at = $8,
                failed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(event.id)
        .bind(event.status.as_str())
        .bind(to_i32(event.retry.retry_count))
        .bind(to_i32(event.retry.max_retries))
        .bind(event.retry.next_retry_at)
        .bind(&event.retry.last_error)
        .bind(event.processing_started_at)
        .bind(event.processed_at)
        .bind(event.failed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("event {}", event.id)));
        }
        Ok(())
    }

    async fn commit_reconciliation(
        &self,
        event: &ExternalEvent,
        subscription: Option<&Subscription>,
        notifications: &[NotificationRequest],
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE external_events
            SET status = $2,
                retry_count = $3,
                next_retry_at = $4,
                last_error = $5,
                processed_at = $6,
                failed_at = $7
            WHERE id = $1
              AND status = 'processing'
              AND processing_started_at IS NOT DISTINCT FROM $8
            "#,
        )
        .bind(event.id)
        .bind(event.status.as_str())
        .bind(to_i32(event.retry.retry_count))
        .bind(event.retry.next_retry_at)
        .bind(&event.retry.last_error)
        .bind(event.processed_at)
        .bind(event.failed_at)
        .bind(event.processing_started_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Dropping the transaction rolls it back
            return Err(EngineError::InvalidState(format!(
                "event {} is no longer held by this attempt",
                event.source_event_id
            )));
        }

        if let Some(subscription) = subscription {
            upsert_subscription_row(&mut *tx, subscription).await?;
        }
        for request in notifications {
            insert_notification_row(&mut *tx, request).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn due_failed_events(&self, now: OffsetDateTime, limit: i64) -> EngineResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM external_events
            WHERE status = 'failed'
              AND retry_count < max_retries
              AND next_retry_at <= $1
            ORDER BY next_retry_at, received_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn due_pending_events(
        &self,
        received_before: OffsetDateTime,
        limit: i64,
    ) -> EngineResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM external_events
            WHERE status = 'pending' AND received_at < $1
            ORDER BY received_at
            LIMIT $2
            "#,
        )
        .bind(received_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn release_stuck_events(
        &self,
        started_before: OffsetDateTime,
        now: OffsetDateTime,
    ) -> EngineResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE external_events
            SET status = 'failed',
                failed_at = $2,
                next_retry_at = $2,
                last_error = 'processing timed out'
            WHERE status = 'processing'
              AND processing_started_at < $1
            "#,
        )
        .bind(started_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_events(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<ExternalEvent>> {
        let rows: Vec<EventRow> = match status {
            Some(status) => {
                sqlx::query_as(concat!(
                    "SELECT ",
                    event_columns!(),
                    " FROM external_events WHERE status = $1 \
                     ORDER BY received_at DESC LIMIT $2 OFFSET $3"
                ))
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(concat!(
                    "SELECT ",
                    event_columns!(),
                    " FROM external_events ORDER BY received_at DESC LIMIT $1 OFFSET $2"
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(ExternalEvent::try_from).collect()
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn insert_notifications(&self, requests: &[NotificationRequest]) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;
        for request in requests {
            insert_notification_row(&mut *tx, request).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_notification(&self, id: Uuid) -> EngineResult<Option<NotificationRequest>> {
        sqlx::query_as::<_, NotificationRow>(concat!(
            "SELECT ",
            notification_columns!(),
            " FROM notification_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(NotificationRequest::try_from)
        .transpose()
    }

    async fn claim_notification(
        &self,
        id: Uuid,
        now: OffsetDateTime,
        lease_until: OffsetDateTime,
    ) -> EngineResult<Option<NotificationRequest>> {
        sqlx::query_as::<_, NotificationRow>(concat!(
            r#"
            UPDATE notification_requests
            SET lease_expires_at = $3
            WHERE id = $1
              AND (lease_expires_at IS NULL OR lease_expires_at <= $2)
              AND (
                (status = 'PENDING' AND (scheduled_for IS NULL OR scheduled_for <= $2))
                OR (status = 'FAILED' AND retry_count < max_retries AND next_retry_at <= $2)
              )
            RETURNING "#,
            notification_columns!()
        ))
        .bind(id)
        .bind(now)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await?
        .map(NotificationRequest::try_from)
        .transpose()
    }

    async fn save_notification(&self, request: &NotificationRequest) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE notification_requests
            SET status = $2,
                retry_count = $3,
                next_retry_at = $4,
                last_error = $5,
                lease_expires_at = $6,
                provider_message_id = $7,
                error_message = $8,
                sent_at = $9,
                delivered_at = $10,
                read_at = $11,
                failed_at = $12
            WHERE id = $1
            "#,
        )
        .bind(request.id)
        .bind(request.status.as_str())
        .bind(to_i32(request.retry.retry_count))
        .bind(request.retry.next_retry_at)
        .bind(&request.retry.last_error)
        .bind(request.lease_expires_at)
        .bind(&request.provider_message_id)
        .bind(&request.error_message)
        .bind(request.sent_at)
        .bind(request.delivered_at)
        .bind(request.read_at)
        .bind(request.failed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("notification {}", request.id)));
        }
        Ok(())
    }

    async fn settle_notification(
        &self,
        request: &NotificationRequest,
        lease: OffsetDateTime,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notification_requests
            SET status = $2,
                retry_count = $3,
                next_retry_at = $4,
                last_error = $5,
                lease_expires_at = $6,
                provider_message_id = $7,
                error_message = $8,
                sent_at = $9,
                delivered_at = $10,
                failed_at = $11
            WHERE id = $1
              AND lease_expires_at = $12
            "#,
        )
        .bind(request.id)
        .bind(request.status.as_str())
        .bind(to_i32(request.retry.retry_count))
        .bind(request.retry.next_retry_at)
        .bind(&request.retry.last_error)
        .bind(request.lease_expires_at)
        .bind(&request.provider_message_id)
        .bind(&request.error_message)
        .bind(request.sent_at)
        .bind(request.delivered_at)
        .bind(request.failed_at)
        .bind(lease)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn due_failed_notifications(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> EngineResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM notification_requests
            WHERE status = 'FAILED'
              AND retry_count < max_retries
              AND next_retry_at <= $1
            ORDER BY next_retry_at, created_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn due_pending_notifications(
        &self,
        now: OffsetDateTime,
        created_before: OffsetDateTime,
        limit: i64,
    ) -> EngineResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM notification_requests
            WHERE status = 'PENDING'
              AND (
                scheduled_for <= $1
                OR (scheduled_for IS NULL AND created_at < $2)
              )
            ORDER BY COALESCE(scheduled_for, created_at), created_at
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn mark_read(
        &self,
        id: Uuid,
        recipient_id: Uuid,
        now: OffsetDateTime,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notification_requests
            SET status = 'READ', read_at = $3
            WHERE id = $1 AND recipient_id = $2 AND status IN ('SENT', 'DELIVERED')
            "#,
        )
        .bind(id)
        .bind(recipient_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_read(&self, recipient_id: Uuid, now: OffsetDateTime) -> EngineResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notification_requests
            SET status = 'READ', read_at = $2
            WHERE recipient_id = $1
              AND channel = 'IN_APP'
              AND status IN ('SENT', 'DELIVERED')
            "#,
        )
        .bind(recipient_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_read_before(&self, cutoff: OffsetDateTime) -> EngineResult<u64> {
        let result = sqlx::query(
            "DELETE FROM notification_requests WHERE status = 'READ' AND read_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_notification_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> EngineResult<Option<NotificationRequest>> {
        sqlx::query_as::<_, NotificationRow>(concat!(
            "SELECT ",
            notification_columns!(),
            " FROM notification_requests WHERE provider_message_id = $1"
        ))
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?
        .map(NotificationRequest::try_from)
        .transpose()
    }

    async fn notifications_for_recipient(
        &self,
        recipient_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> EngineResult<Vec<NotificationRequest>> {
        let rows: Vec<NotificationRow> = sqlx::query_as(concat!(
            "SELECT ",
            notification_columns!(),
            r#" FROM notification_requests
            WHERE recipient_id = $1
              AND channel = 'IN_APP'
              AND ($2 = FALSE OR status IN ('SENT', 'DELIVERED'))
            ORDER BY created_at DESC
            LIMIT $3
            "#
        ))
        .bind(recipient_id)
        .bind(unread_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(NotificationRequest::try_from).collect()
    }

    async fn unread_count(&self, recipient_id: Uuid) -> EngineResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM notification_requests
            WHERE recipient_id = $1
              AND channel = 'IN_APP'
              AND status IN ('SENT', 'DELIVERED')
            "#,
        )
        .bind(recipient_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> EngineResult<Option<Subscription>> {
        sqlx::query_as::<_, SubscriptionRow>(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM subscriptions WHERE external_subscription_id = $1"
        ))
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Subscription::try_from)
        .transpose()
    }

    async fn find_subscription_by_owner(&self, owner_id: Uuid) -> EngineResult<Option<Subscription>> {
        sqlx::query_as::<_, SubscriptionRow>(concat!(
            "SELECT ",
            subscription_columns!(),
            r#" FROM subscriptions
            WHERE owner_id = $1
            ORDER BY (status IN ('trial', 'active', 'past_due')) DESC, created_at DESC
            LIMIT 1
            "#
        ))
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Subscription::try_from)
        .transpose()
    }

    async fn increment_usage(
        &self,
        subscription_id: Uuid,
        feature: Feature,
        limit: u32,
    ) -> EngineResult<Option<u32>> {
        let sql = match feature {
            Feature::PanicButton => {
                r#"
                UPDATE subscriptions
                SET panic_alerts_used = panic_alerts_used + 1, updated_at = NOW()
                WHERE id = $1 AND panic_alerts_used < $2
                RETURNING panic_alerts_used
                "#
            }
            Feature::OfficeHours => {
                r#"
                UPDATE subscriptions
                SET office_hours_used = office_hours_used + 1, updated_at = NOW()
                WHERE id = $1 AND office_hours_used < $2
                RETURNING office_hours_used
                "#
            }
        };

        let updated: Option<(i32,)> = sqlx::query_as(sql)
            .bind(subscription_id)
            .bind(i64::from(limit))
            .fetch_optional(&self.pool)
            .await?;

        if let Some((used,)) = updated {
            return Ok(Some(to_u32(used)));
        }

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM subscriptions WHERE id = $1")
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(None),
            None => Err(EngineError::NotFound(format!("subscription {}", subscription_id))),
        }
    }
}

#[async_trait]
impl OwnerDirectory for PgStore {
    async fn owner_for_customer(&self, external_customer_id: &str) -> EngineResult<Option<Recipient>> {
        let row: Option<CustomerRow> = sqlx::query_as(
            r#"
            SELECT owner_id, email, phone, webhook_url
            FROM customer_accounts
            WHERE external_customer_id = $1
            "#,
        )
        .bind(external_customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Recipient::from))
    }

    async fn owner(&self, owner_id: Uuid) -> EngineResult<Option<Recipient>> {
        let row: Option<CustomerRow> = sqlx::query_as(
            "SELECT owner_id, email, phone, webhook_url FROM customer_accounts WHERE owner_id = $1",
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Recipient::from))
    }
}
