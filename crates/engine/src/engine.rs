//! Engine wiring
//!
//! Builds every service over one shared store so callers (the worker, an HTTP layer,
//! tests) get a consistent set of handles.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::notifications::{ChannelRouter, MailTransport, NotificationService, ResendTransport};
use crate::processor::EventProcessor;
use crate::reconcile::HandlerRegistry;
use crate::retry::RetryScheduler;
use crate::store::Store;
use crate::subscription::SubscriptionService;
use crate::webhooks::{EventIntake, StripeSignatureVerifier, WebhookVerifier};

/// Per-request timeout for provider calls, well inside the delivery lease
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Engine {
    pub intake: EventIntake,
    pub processor: EventProcessor,
    pub notifications: NotificationService,
    pub subscriptions: SubscriptionService,
    pub scheduler: RetryScheduler,
}

impl Engine {
    /// Production wiring: wall clock, signature verification with the configured
    /// secret, and the default channel adapters (EMAIL only when a mail API key is set)
    pub fn from_config<S: Store + 'static>(store: Arc<S>, config: EngineConfig) -> EngineResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {}", e)))?;

        let mail = ResendTransport::from_config(client.clone(), &config.email).map(|transport| {
            let transport: Arc<dyn MailTransport> = Arc::new(transport);
            (transport, config.email.from_address.clone())
        });
        if mail.is_none() {
            tracing::warn!("No mail API key configured, EMAIL notifications will fail");
        }

        let router = ChannelRouter::with_defaults(client, mail);
        let verifier = Arc::new(StripeSignatureVerifier::new(
            config.webhook_secret.clone(),
            clock.clone(),
        ));

        Self::new(store, config, clock, verifier, router)
    }

    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        verifier: Arc<dyn WebhookVerifier>,
        router: ChannelRouter,
    ) -> EngineResult<Self> {
        let notifications =
            NotificationService::new(store.clone(), router, clock.clone(), config.retry);

        let processor = EventProcessor::new(
            store.clone(),
            HandlerRegistry::with_defaults()?,
            notifications.clone(),
            clock.clone(),
            config.retry,
            config.prices,
        );

        let intake = EventIntake::new(
            verifier,
            store.clone(),
            processor.clone(),
            clock.clone(),
            config.retry.max_retries,
        );

        let scheduler = RetryScheduler::new(
            store.clone(),
            processor.clone(),
            notifications.clone(),
            clock,
            config.processing_timeout,
        );

        Ok(Self {
            intake,
            processor,
            notifications,
            subscriptions: SubscriptionService::new(store),
            scheduler,
        })
    }
}
