//! Retry drain
//!
//! Run periodically by the worker. Each pass releases events stuck in PROCESSING,
//! re-attempts due events, then due notifications. Every record is claimed before it is
//! run, so overlapping passes (or a pass racing inline processing) never run the same
//! record twice.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineResult;
use crate::notifications::NotificationService;
use crate::processor::EventProcessor;
use crate::state_machine::{Attempt, Settlement};
use crate::store::{EventStore, NotificationStore, Store};

/// Records taken per query in one pass
pub const DRAIN_BATCH_SIZE: i64 = 100;

/// PENDING rows younger than this are left to their inline attempt
pub const PENDING_GRACE: Duration = Duration::minutes(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainCounts {
    pub succeeded: u32,
    pub rescheduled: u32,
    pub exhausted: u32,
    /// Claimed elsewhere or no longer eligible
    pub skipped: u32,
    pub errors: u32,
}

impl DrainCounts {
    fn record(&mut self, result: EngineResult<Attempt>) {
        match result {
            Ok(Attempt::Settled(settlement)) => match settlement {
                Settlement::Completed | Settlement::Ignored => self.succeeded += 1,
                Settlement::RetryScheduled { .. } => self.rescheduled += 1,
                Settlement::Exhausted { .. } => self.exhausted += 1,
            },
            Ok(Attempt::Skipped) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
    }

    pub fn attempted(&self) -> u32 {
        self.succeeded + self.rescheduled + self.exhausted
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub released_stuck: u64,
    pub events: DrainCounts,
    pub notifications: DrainCounts,
}

#[derive(Clone)]
pub struct RetryScheduler {
    events: Arc<dyn EventStore>,
    notification_store: Arc<dyn NotificationStore>,
    processor: EventProcessor,
    notifications: NotificationService,
    clock: Arc<dyn Clock>,
    processing_timeout: Duration,
}

impl RetryScheduler {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        processor: EventProcessor,
        notifications: NotificationService,
        clock: Arc<dyn Clock>,
        processing_timeout: Duration,
    ) -> Self {
        Self {
            events: store.clone(),
            notification_store: store,
            processor,
            notifications,
            clock,
            processing_timeout,
        }
    }

    /// Run one drain pass at the current time
    pub async fn drain_retry_queue(&self) -> EngineResult<DrainReport> {
        self.drain_retry_queue_at(self.clock.now()).await
    }

    pub async fn drain_retry_queue_at(&self, now: OffsetDateTime) -> EngineResult<DrainReport> {
        let mut report = DrainReport {
            released_stuck: self
                .events
                .release_stuck_events(now - self.processing_timeout, now)
                .await?,
            ..DrainReport::default()
        };
        if report.released_stuck > 0 {
            tracing::warn!(
                released = report.released_stuck,
                timeout_minutes = self.processing_timeout.whole_minutes(),
                "Released events stuck in processing"
            );
        }

        let mut event_ids = self
            .events
            .due_pending_events(now - PENDING_GRACE, DRAIN_BATCH_SIZE)
            .await?;
        event_ids.extend(self.events.due_failed_events(now, DRAIN_BATCH_SIZE).await?);

        for id in dedup(event_ids) {
            let result = self.processor.process_event_at(id, now).await;
            if let Err(e) = &result {
                tracing::error!(event_id = %id, error = %e, "Retry attempt for event errored");
            }
            report.events.record(result);
        }

        let mut notification_ids = self
            .notification_store
            .due_failed_notifications(now, DRAIN_BATCH_SIZE)
            .await?;
        notification_ids.extend(
            self.notification_store
                .due_pending_notifications(now, now - PENDING_GRACE, DRAIN_BATCH_SIZE)
                .await?,
        );

        for id in dedup(notification_ids) {
            let result = self.notifications.deliver_at(id, now).await;
            if let Err(e) = &result {
                tracing::error!(notification_id = %id, error = %e, "Retry attempt for notification errored");
            }
            report.notifications.record(result);
        }

        if report.events.attempted() + report.notifications.attempted() > 0 {
            tracing::info!(
                events_succeeded = report.events.succeeded,
                events_rescheduled = report.events.rescheduled,
                events_exhausted = report.events.exhausted,
                notifications_succeeded = report.notifications.succeeded,
                notifications_rescheduled = report.notifications.rescheduled,
                notifications_exhausted = report.notifications.exhausted,
                "Retry drain complete"
            );
        } else {
            tracing::debug!("Retry drain found nothing due");
        }

        Ok(report)
    }
}

fn dedup(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
