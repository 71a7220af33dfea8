//! Engine configuration loaded from the environment

use std::str::FromStr;

use time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::state_machine::RetryPolicy;
use crate::subscription::SubscriptionTier;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE_MINUTES: i64 = 1;
const DEFAULT_RETENTION_DAYS: i64 = 30;
const DEFAULT_PROCESSING_TIMEOUT_MINUTES: i64 = 30;
const DEFAULT_RESEND_API_URL: &str = "https://api.resend.com";

/// Payment processor price ids for each paid tier
#[derive(Debug, Clone, Default)]
pub struct PriceMap {
    pub starter: Option<String>,
    pub pro: Option<String>,
    pub enterprise: Option<String>,
}

impl PriceMap {
    /// Map a processor price id back to a subscription tier
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<SubscriptionTier> {
        let matches = |candidate: &Option<String>| candidate.as_deref() == Some(price_id);

        if matches(&self.starter) {
            Some(SubscriptionTier::Starter)
        } else if matches(&self.pro) {
            Some(SubscriptionTier::Pro)
        } else if matches(&self.enterprise) {
            Some(SubscriptionTier::Enterprise)
        } else {
            None
        }
    }
}

/// Mail transport settings
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key. Without it the EMAIL channel is left unconfigured.
    pub api_key: Option<String>,
    pub from_address: String,
    pub api_url: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            from_address: "Deskbell <notifications@deskbell.dev>".to_string(),
            api_url: DEFAULT_RESEND_API_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub webhook_secret: String,
    pub prices: PriceMap,
    pub email: EmailConfig,
    pub retry: RetryPolicy,
    /// READ notifications older than this are purged by the retention sweep
    pub notification_retention: Duration,
    /// Events stuck in PROCESSING longer than this are released for retry
    pub processing_timeout: Duration,
}

impl EngineConfig {
    /// Config with defaults for everything except the webhook secret
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            prices: PriceMap::default(),
            email: EmailConfig::default(),
            retry: RetryPolicy::default(),
            notification_retention: Duration::days(DEFAULT_RETENTION_DAYS),
            processing_timeout: Duration::minutes(DEFAULT_PROCESSING_TIMEOUT_MINUTES),
        }
    }

    pub fn from_env() -> EngineResult<Self> {
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| EngineError::Config("STRIPE_WEBHOOK_SECRET must be set".to_string()))?;

        let prices = PriceMap {
            starter: optional_var("STRIPE_PRICE_STARTER"),
            pro: optional_var("STRIPE_PRICE_PRO"),
            enterprise: optional_var("STRIPE_PRICE_ENTERPRISE"),
        };

        let defaults = EmailConfig::default();
        let email = EmailConfig {
            api_key: optional_var("RESEND_API_KEY"),
            from_address: optional_var("EMAIL_FROM").unwrap_or(defaults.from_address),
            api_url: optional_var("RESEND_API_URL").unwrap_or(defaults.api_url),
        };

        let max_retries: u32 = parse_var("EVENT_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        let base_minutes: i64 =
            parse_var("RETRY_BACKOFF_BASE_MINUTES", DEFAULT_BACKOFF_BASE_MINUTES)?;
        if base_minutes <= 0 {
            return Err(EngineError::Config(
                "RETRY_BACKOFF_BASE_MINUTES must be positive".to_string(),
            ));
        }

        let retention_days: i64 = parse_var("NOTIFICATION_RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?;
        let timeout_minutes: i64 = parse_var(
            "PROCESSING_TIMEOUT_MINUTES",
            DEFAULT_PROCESSING_TIMEOUT_MINUTES,
        )?;

        Ok(Self {
            webhook_secret,
            prices,
            email,
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::minutes(base_minutes),
            },
            notification_retention: Duration::days(retention_days),
            processing_timeout: Duration::minutes(timeout_minutes),
        })
    }
}

fn optional_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> EngineResult<T> {
    match optional_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::Config(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}
