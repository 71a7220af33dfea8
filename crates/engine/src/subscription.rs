//! Subscription aggregate reconciled from processor events
//!
//! Lifecycle fields (tier, status, billing period, payment metadata) change only through
//! reconciliation handlers. Tier-gated features elsewhere in the product read this state
//! through [`SubscriptionService`], which may also bump usage counters. Reconciliation
//! writes never carry usage counters; the store restarts them when the period advances.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::store::SubscriptionStore;

/// Consecutive failed payments that force a subscription into PAST_DUE
pub const PAST_DUE_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Starter => "starter",
            SubscriptionTier::Pro => "pro",
            SubscriptionTier::Enterprise => "enterprise",
        }
    }

    pub fn features(&self) -> TierFeatures {
        match self {
            SubscriptionTier::Free => TierFeatures {
                panic_alerts_per_period: 0,
                office_hours_per_period: 0,
                priority_support: false,
                response_sla_hours: 72,
            },
            SubscriptionTier::Starter => TierFeatures {
                panic_alerts_per_period: 2,
                office_hours_per_period: 1,
                priority_support: false,
                response_sla_hours: 24,
            },
            SubscriptionTier::Pro => TierFeatures {
                panic_alerts_per_period: 10,
                office_hours_per_period: 4,
                priority_support: true,
                response_sla_hours: 8,
            },
            SubscriptionTier::Enterprise => TierFeatures {
                panic_alerts_per_period: u32::MAX,
                office_hours_per_period: u32::MAX,
                priority_support: true,
                response_sla_hours: 1,
            },
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(SubscriptionTier::Free),
            "starter" => Ok(SubscriptionTier::Starter),
            "pro" => Ok(SubscriptionTier::Pro),
            "enterprise" => Ok(SubscriptionTier::Enterprise),
            other => Err(EngineError::InvalidPayload(format!(
                "unknown subscription tier '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Map a processor subscription status
    pub fn from_provider_status(raw: &str) -> Option<Self> {
        match raw {
            "trialing" => Some(SubscriptionStatus::Trial),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" | "incomplete" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Cancelled),
            "incomplete_expired" | "paused" => Some(SubscriptionStatus::Expired),
            _ => None,
        }
    }

    /// Statuses that keep tier features available. PAST_DUE keeps access as a grace
    /// period until the processor cancels.
    pub fn is_entitled(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trial | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(EngineError::InvalidState(format!(
                "unknown subscription status '{}'",
                other
            ))),
        }
    }
}

/// Per-period limits for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierFeatures {
    pub panic_alerts_per_period: u32,
    pub office_hours_per_period: u32,
    pub priority_support: bool,
    pub response_sla_hours: u32,
}

/// Metered product features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    PanicButton,
    OfficeHours,
}

impl Feature {
    pub fn limit(&self, features: &TierFeatures) -> u32 {
        match self {
            Feature::PanicButton => features.panic_alerts_per_period,
            Feature::OfficeHours => features.office_hours_per_period,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub panic_alerts: u32,
    pub office_hours: u32,
}

impl UsageCounters {
    pub fn get(&self, feature: Feature) -> u32 {
        match feature {
            Feature::PanicButton => self.panic_alerts,
            Feature::OfficeHours => self.office_hours,
        }
    }

    pub fn get_mut(&mut self, feature: Feature) -> &mut u32 {
        match feature {
            Feature::PanicButton => &mut self.panic_alerts,
            Feature::OfficeHours => &mut self.office_hours,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub external_customer_id: String,
    pub external_subscription_id: String,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<OffsetDateTime>,
    pub last_payment_amount: Option<i64>,
    pub last_payment_currency: Option<String>,
    pub last_payment_at: Option<OffsetDateTime>,
    pub consecutive_payment_failures: u32,
    pub usage: UsageCounters,
    /// Processor creation time of the newest event applied, used to drop stale updates
    pub last_event_at: Option<OffsetDateTime>,
    /// Bumped by every reconciliation write; a write based on an older read is rejected
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn new(
        owner_id: Uuid,
        external_customer_id: impl Into<String>,
        external_subscription_id: impl Into<String>,
        tier: SubscriptionTier,
        status: SubscriptionStatus,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            tier,
            status,
            current_period_start: None,
            current_period_end: None,
            trial_end: None,
            external_customer_id: external_customer_id.into(),
            external_subscription_id: external_subscription_id.into(),
            cancel_at_period_end: false,
            cancelled_at: None,
            last_payment_amount: None,
            last_payment_currency: None,
            last_payment_at: None,
            consecutive_payment_failures: 0,
            usage: UsageCounters::default(),
            last_event_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn features(&self) -> TierFeatures {
        if self.status.is_entitled() {
            self.tier.features()
        } else {
            SubscriptionTier::Free.features()
        }
    }

    /// Whether an event created at `occurred_at` predates state already applied
    pub fn is_stale(&self, occurred_at: OffsetDateTime) -> bool {
        self.last_event_at.is_some_and(|last| occurred_at < last)
    }

    pub fn observe_event(&mut self, occurred_at: OffsetDateTime, now: OffsetDateTime) {
        if self.last_event_at.map_or(true, |last| occurred_at > last) {
            self.last_event_at = Some(occurred_at);
        }
        self.updated_at = now;
    }

    /// Adopt a billing period; usage counters restart when the period moves forward
    pub fn sync_period(&mut self, start: Option<OffsetDateTime>, end: Option<OffsetDateTime>) {
        let advanced = match (self.current_period_start, start) {
            (Some(current), Some(next)) => next > current,
            _ => false,
        };
        if advanced {
            self.usage = UsageCounters::default();
        }
        if start.is_some() {
            self.current_period_start = start;
        }
        if end.is_some() {
            self.current_period_end = end;
        }
    }

    pub fn record_payment(
        &mut self,
        amount: Option<i64>,
        currency: Option<String>,
        paid_at: OffsetDateTime,
    ) {
        self.last_payment_amount = amount;
        self.last_payment_currency = currency;
        self.last_payment_at = Some(paid_at);
        self.consecutive_payment_failures = 0;
        if self.status == SubscriptionStatus::PastDue {
            self.status = SubscriptionStatus::Active;
        }
    }

    /// Count a failed payment. Returns true when this failure moved the subscription
    /// into PAST_DUE.
    pub fn record_payment_failure(&mut self) -> bool {
        self.consecutive_payment_failures = self.consecutive_payment_failures.saturating_add(1);

        let reached = self.consecutive_payment_failures >= PAST_DUE_FAILURE_THRESHOLD;
        let open = matches!(
            self.status,
            SubscriptionStatus::Trial | SubscriptionStatus::Active
        );
        if reached && open {
            self.status = SubscriptionStatus::PastDue;
            return true;
        }
        false
    }

    pub fn cancel(&mut self, at: OffsetDateTime) {
        self.status = SubscriptionStatus::Cancelled;
        if self.cancelled_at.is_none() {
            self.cancelled_at = Some(at);
        }
    }
}

/// Result of a feature check against tier limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureCheck {
    pub allowed: bool,
    pub used: u32,
    pub limit: u32,
    pub reason: Option<String>,
}

impl FeatureCheck {
    fn denied(used: u32, limit: u32, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            used,
            limit,
            reason: Some(reason.into()),
        }
    }
}

/// Read API over reconciled subscriptions for tier-gated features
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    pub async fn for_owner(&self, owner_id: Uuid) -> EngineResult<Option<Subscription>> {
        self.store.find_subscription_by_owner(owner_id).await
    }

    /// Effective limits for an owner; anyone without an entitled subscription gets Free
    pub async fn entitlements(&self, owner_id: Uuid) -> EngineResult<TierFeatures> {
        Ok(self
            .for_owner(owner_id)
            .await?
            .map(|s| s.features())
            .unwrap_or_else(|| SubscriptionTier::Free.features()))
    }

    pub async fn check_feature(&self, owner_id: Uuid, feature: Feature) -> EngineResult<FeatureCheck> {
        let Some(subscription) = self.for_owner(owner_id).await? else {
            let limit = feature.limit(&SubscriptionTier::Free.features());
            return Ok(FeatureCheck::denied(0, limit, "no subscription"));
        };

        let limit = feature.limit(&subscription.features());
        let used = subscription.usage.get(feature);

        if !subscription.status.is_entitled() {
            return Ok(FeatureCheck::denied(
                used,
                limit,
                format!("subscription is {}", subscription.status),
            ));
        }
        if used >= limit {
            return Ok(FeatureCheck::denied(used, limit, "usage limit reached"));
        }

        Ok(FeatureCheck {
            allowed: true,
            used,
            limit,
            reason: None,
        })
    }

    /// Consume one unit of `feature` if the tier allows it
    pub async fn record_usage(&self, owner_id: Uuid, feature: Feature) -> EngineResult<FeatureCheck> {
        let check = self.check_feature(owner_id, feature).await?;
        if !check.allowed {
            return Ok(check);
        }

        let subscription = self
            .for_owner(owner_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("subscription for owner {}", owner_id)))?;

        match self
            .store
            .increment_usage(subscription.id, feature, check.limit)
            .await?
        {
            Some(used) => {
                tracing::info!(
                    owner_id = %owner_id,
                    feature = ?feature,
                    used = used,
                    limit = check.limit,
                    "Recorded feature usage"
                );
                Ok(FeatureCheck {
                    allowed: true,
                    used,
                    limit: check.limit,
                    reason: None,
                })
            }
            // Lost a race with a concurrent booking for the last unit
            None => Ok(FeatureCheck::denied(check.limit, check.limit, "usage limit reached")),
        }
    }
}
