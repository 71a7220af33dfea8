// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![allow(clippy::too_many_arguments)] // Service constructors take the full wiring

//! Deskbell Event Engine
//!
//! Reliable processing of payment processor webhooks and the notifications they
//! trigger.
//!
//! ## Features
//!
//! - **Webhook Intake**: Signature verification and exactly-once persistence keyed by
//!   the upstream event id
//! - **Processing State Machine**: Bounded retries with exponential backoff, shared by
//!   events and notifications
//! - **Reconciliation**: Subscription lifecycle and payment handlers that keep local
//!   subscription state in sync
//! - **Notifications**: Per-channel fan-out, delivery adapters, inbox read tracking and
//!   retention
//! - **Retry Drain**: Periodic pass over due events and notifications with stuck-row
//!   recovery

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod notifications;
pub mod processor;
pub mod provider;
pub mod reconcile;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod subscription;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Config
pub use config::{EmailConfig, EngineConfig, PriceMap};

// Engine
pub use engine::Engine;

// Error
pub use error::{DeliveryError, EngineError, EngineResult};

// Events
pub use event::{Correlation, EventStatus, EventType, ExternalEvent};
pub use provider::ProviderEvent;

// Notifications
pub use notifications::{
    Channel, ChannelAdapter, ChannelRouter, DeliveryReceipt, DeliveryReport, NotificationDraft,
    NotificationPayload, NotificationRequest, NotificationService, NotificationStatus,
    NotificationType, Priority, Recipient, SendOptions,
};

// Processing
pub use processor::EventProcessor;
pub use reconcile::{EventHandler, HandlerContext, HandlerRegistry, Reconciliation};
pub use retry::{DrainCounts, DrainReport, RetryScheduler};
pub use state_machine::{Attempt, Outcome, RetryPolicy, RetryState, Settlement};

// Storage
pub use store::{
    EventStore, InMemoryStore, InsertOutcome, NotificationStore, OwnerDirectory, PgStore, Store,
    SubscriptionStore,
};

// Subscriptions
pub use subscription::{
    Feature, FeatureCheck, Subscription, SubscriptionService, SubscriptionStatus,
    SubscriptionTier, TierFeatures,
};

// Webhooks
pub use webhooks::{
    sign_payload, EventIntake, IngestOutcome, StripeSignatureVerifier, WebhookVerifier,
};
