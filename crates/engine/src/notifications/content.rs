//! Notification copy for subscription lifecycle notices

use serde_json::json;
use time::OffsetDateTime;

use super::{NotificationPayload, NotificationType};
use crate::subscription::{Subscription, SubscriptionTier};

fn format_amount(amount: Option<i64>, currency: Option<&str>) -> String {
    match amount {
        Some(cents) => format!(
            "{}.{:02} {}",
            cents / 100,
            (cents % 100).abs(),
            currency.unwrap_or("usd").to_ascii_uppercase()
        ),
        None => "your subscription amount".to_string(),
    }
}

pub fn welcome(subscription: &Subscription) -> NotificationPayload {
    NotificationPayload::new(
        NotificationType::Welcome,
        format!("Welcome to Deskbell {}", subscription.tier),
        format!(
            "Your {} subscription is {}. Panic alerts, office hours and priority routing \
             follow your plan's limits.",
            subscription.tier, subscription.status
        ),
    )
    .with_template("welcome")
    .with_metadata(json!({
        "subscription_id": subscription.id,
        "tier": subscription.tier,
        "status": subscription.status,
    }))
}

pub fn tier_changed(subscription: &Subscription, previous: SubscriptionTier) -> NotificationPayload {
    NotificationPayload::new(
        NotificationType::TierChanged,
        format!("Your plan changed to {}", subscription.tier),
        format!(
            "Your subscription moved from {} to {}. New limits apply immediately.",
            previous, subscription.tier
        ),
    )
    .with_template("tier_changed")
    .with_metadata(json!({
        "subscription_id": subscription.id,
        "previous_tier": previous,
        "tier": subscription.tier,
    }))
}

pub fn cancelled(subscription: &Subscription) -> NotificationPayload {
    NotificationPayload::new(
        NotificationType::SubscriptionCancelled,
        "Your subscription was cancelled",
        format!(
            "Your {} subscription has been cancelled. You can resubscribe at any time.",
            subscription.tier
        ),
    )
    .with_template("subscription_cancelled")
    .with_metadata(json!({
        "subscription_id": subscription.id,
        "cancelled_at": subscription.cancelled_at.map(|t| t.unix_timestamp()),
    }))
}

pub fn payment_succeeded(
    subscription: &Subscription,
    amount: Option<i64>,
    currency: Option<&str>,
) -> NotificationPayload {
    NotificationPayload::new(
        NotificationType::PaymentSucceeded,
        "Payment received",
        format!("We received your payment of {}. Thank you!", format_amount(amount, currency)),
    )
    .with_template("payment_succeeded")
    .with_metadata(json!({
        "subscription_id": subscription.id,
        "amount": amount,
        "currency": currency,
    }))
}

pub fn payment_failed(
    subscription: &Subscription,
    amount: Option<i64>,
    currency: Option<&str>,
    invoice_url: Option<&str>,
) -> NotificationPayload {
    let mut content = format!(
        "We could not collect your payment of {}. Please update your payment method.",
        format_amount(amount, currency)
    );
    if let Some(url) = invoice_url {
        content.push_str(&format!(" You can pay the invoice at {}.", url));
    }

    NotificationPayload::new(NotificationType::PaymentFailed, "Payment failed", content)
        .with_template("payment_failed")
        .with_metadata(json!({
            "subscription_id": subscription.id,
            "amount": amount,
            "currency": currency,
            "consecutive_failures": subscription.consecutive_payment_failures,
        }))
}

pub fn past_due(subscription: &Subscription) -> NotificationPayload {
    NotificationPayload::new(
        NotificationType::SubscriptionPastDue,
        "Your subscription is past due",
        format!(
            "{} payment attempts have failed. Your {} features stay available for now; \
             update your payment method to avoid cancellation.",
            subscription.consecutive_payment_failures, subscription.tier
        ),
    )
    .with_template("subscription_past_due")
    .with_metadata(json!({
        "subscription_id": subscription.id,
        "consecutive_failures": subscription.consecutive_payment_failures,
    }))
}

/// Whole days until `trial_end`, never negative
pub fn days_remaining(trial_end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let seconds = (trial_end - now).whole_seconds().max(0);
    // Round up so a trial ending in 36 hours reads as 2 days
    (seconds + 86_399) / 86_400
}

pub fn trial_ending(subscription: &Subscription, days: i64) -> NotificationPayload {
    let when = match days {
        0 => "today".to_string(),
        1 => "in 1 day".to_string(),
        n => format!("in {} days", n),
    };

    NotificationPayload::new(
        NotificationType::TrialEnding,
        format!("Your trial ends {}", when),
        format!(
            "Your {} trial ends {}. Add a payment method to keep your plan.",
            subscription.tier, when
        ),
    )
    .with_template("trial_ending")
    .with_metadata(json!({
        "subscription_id": subscription.id,
        "days_remaining": days,
    }))
}
