//! Engine error types

use thiserror::Error;

use crate::notifications::Channel;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by intake, processing and the store layer.
///
/// Handler errors never reach webhook callers: the processor converts them into
/// retry state. Only `InvalidSignature` (and store failures before persistence)
/// are returned synchronously from intake.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Webhook signature is invalid")]
    InvalidSignature,

    #[error("Unsupported event type: {0}")]
    UnknownEventType(String),

    /// A precondition the handler depends on does not hold yet, e.g. the customer
    /// has no local owner mapping or the subscription row has not arrived.
    #[error("Precondition not met: {0}")]
    Precondition(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Retries exhausted: {0}")]
    TerminalFailure(String),

    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    /// A row changed between the read a decision was based on and the write
    #[error("Concurrent update: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl EngineError {
    /// Whether the processing pipeline should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Precondition(_) | EngineError::Conflict(_) | EngineError::Database(_) => {
                true
            }
            EngineError::Delivery(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::InvalidPayload(e.to_string())
    }
}

/// Failure returned by a channel adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The channel has no live provider. Deterministic, never retried.
    #[error("{0} provider not configured")]
    NotConfigured(Channel),

    #[error("Recipient has no {0} address")]
    MissingAddress(Channel),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Provider rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::NotConfigured(_) | DeliveryError::MissingAddress(_) => false,
            DeliveryError::Transport(_) => true,
            // Timeouts, throttling and provider-side errors are worth another attempt
            DeliveryError::Rejected { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        DeliveryError::Transport(e.to_string())
    }
}
