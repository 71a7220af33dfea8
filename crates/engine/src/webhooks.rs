//! Webhook intake
//!
//! Verifies the processor signature, persists the event exactly once keyed by its
//! upstream id, then runs the first processing attempt inline. Handler failures never
//! reach the caller: once the event is stored the delivery is acknowledged and any
//! further attempts belong to the retry drain.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::event::ExternalEvent;
use crate::processor::EventProcessor;
use crate::provider::ProviderEvent;
use crate::state_machine::Attempt;
use crate::store::{EventStore, InsertOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Authenticates a raw webhook body and parses it
pub trait WebhookVerifier: Send + Sync {
    fn verify(&self, payload: &str, signature: &str) -> EngineResult<ProviderEvent>;
}

/// Verifies `t=<unix>,v1=<hex hmac>` signature headers
pub struct StripeSignatureVerifier {
    secret: String,
    clock: Arc<dyn Clock>,
}

impl StripeSignatureVerifier {
    pub fn new(secret: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret.into(),
            clock,
        }
    }

    fn signing_key(&self) -> &str {
        self.secret.strip_prefix("whsec_").unwrap_or(&self.secret)
    }
}

impl WebhookVerifier for StripeSignatureVerifier {
    fn verify(&self, payload: &str, signature: &str) -> EngineResult<ProviderEvent> {
        // Header: t=timestamp,v1=signature[,v1=signature...][,v0=...]
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for part in signature.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = value.parse().ok(),
                    "v1" => candidates.push(value),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            EngineError::InvalidSignature
        })?;
        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(EngineError::InvalidSignature);
        }

        let now = self.clock.now().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                diff = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(EngineError::InvalidSignature);
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        let matched = candidates.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(self.signing_key().as_bytes()) else {
                return false;
            };
            mac.update(signed_payload.as_bytes());
            mac.verify_slice(&expected).is_ok()
        });

        if !matched {
            tracing::warn!(payload_len = payload.len(), "Webhook signature mismatch");
            return Err(EngineError::InvalidSignature);
        }

        // A correctly signed body that does not parse is still a bad delivery
        ProviderEvent::from_json(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            EngineError::InvalidSignature
        })
    }
}

/// Build a signature header for `payload`, as the processor would
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> String {
    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return format!("t={}", timestamp),
    };
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

/// What intake did with a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Newly persisted; `attempt` is the inline processing attempt
    Accepted { event_id: Uuid, attempt: Attempt },
    /// Already seen; nothing was run
    Duplicate { event_id: Uuid },
}

impl IngestOutcome {
    pub fn event_id(&self) -> Uuid {
        match self {
            IngestOutcome::Accepted { event_id, .. } | IngestOutcome::Duplicate { event_id } => {
                *event_id
            }
        }
    }

    /// Whether the delivery should be answered with success. Both outcomes are:
    /// a duplicate was stored by the first delivery.
    pub fn acknowledges(&self) -> bool {
        true
    }
}

/// Entry point for webhook deliveries
#[derive(Clone)]
pub struct EventIntake {
    verifier: Arc<dyn WebhookVerifier>,
    store: Arc<dyn EventStore>,
    processor: EventProcessor,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl EventIntake {
    pub fn new(
        verifier: Arc<dyn WebhookVerifier>,
        store: Arc<dyn EventStore>,
        processor: EventProcessor,
        clock: Arc<dyn Clock>,
        max_retries: u32,
    ) -> Self {
        Self {
            verifier,
            store,
            processor,
            clock,
            max_retries,
        }
    }

    /// Verify, persist and process one delivery.
    ///
    /// Returns `InvalidSignature` without persisting anything when verification
    /// fails, and a store error when the event could not be persisted (the processor
    /// will redeliver). Everything after persistence is acknowledged.
    pub async fn ingest(&self, payload: &str, signature: &str) -> EngineResult<IngestOutcome> {
        let provider_event = self.verifier.verify(payload, signature)?;
        let now = self.clock.now();
        let event = ExternalEvent::received(&provider_event, self.max_retries, now);

        match self.store.insert_event(&event).await? {
            InsertOutcome::Duplicate(existing) => {
                tracing::info!(
                    source_event_id = %event.source_event_id,
                    event_id = %existing,
                    "Duplicate webhook delivery, already recorded"
                );
                return Ok(IngestOutcome::Duplicate { event_id: existing });
            }
            InsertOutcome::Inserted => {
                tracing::info!(
                    source_event_id = %event.source_event_id,
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Webhook event recorded"
                );
            }
        }

        let attempt = match self.processor.process_event_at(event.id, now).await {
            Ok(attempt) => attempt,
            Err(e) => {
                // The row stays PENDING or PROCESSING; the drain and stuck-row
                // recovery pick it up
                tracing::error!(
                    event_id = %event.id,
                    error = %e,
                    "Inline processing failed, leaving event for the retry drain"
                );
                Attempt::Skipped
            }
        };

        Ok(IngestOutcome::Accepted {
            event_id: event.id,
            attempt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use time::{Duration, OffsetDateTime};

    const SECRET: &str = "whsec_test_secret";

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn verifier() -> (StripeSignatureVerifier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now()));
        (StripeSignatureVerifier::new(SECRET, clock.clone()), clock)
    }

    const PAYLOAD: &str =
        r#"{"id":"evt_1","type":"invoice.paid","created":1700000000,"data":{"object":{}}}"#;

    #[test]
    fn test_valid_signature() {
        let (verifier, _) = verifier();
        let header = sign_payload(SECRET, now().unix_timestamp(), PAYLOAD);
        let event = verifier.verify(PAYLOAD, &header).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.type_, "invoice.paid");
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let (verifier, _) = verifier();
        let signed = sign_payload(SECRET, now().unix_timestamp(), PAYLOAD);
        let good = signed.split_once(",v1=").unwrap().1;
        let header = format!(
            "t={},v1={},v1={},v0=deadbeef",
            now().unix_timestamp(),
            "00".repeat(32),
            good
        );
        assert!(verifier.verify(PAYLOAD, &header).is_ok());
    }

    #[test]
    fn test_rejects_tampered_payload() {
        let (verifier, _) = verifier();
        let header = sign_payload(SECRET, now().unix_timestamp(), PAYLOAD);
        let tampered = PAYLOAD.replace("evt_1", "evt_2");
        assert!(matches!(
            verifier.verify(&tampered, &header),
            Err(EngineError::InvalidSignature)
        ));
    }

    #[test]
    fn test_rejects_wrong_secret_and_malformed_headers() {
        let (verifier, _) = verifier();
        let ts = now().unix_timestamp();

        let wrong = sign_payload("whsec_other", ts, PAYLOAD);
        assert!(verifier.verify(PAYLOAD, &wrong).is_err());

        let timestamp_only = format!("t={}", ts);
        let headers: [&str; 5] = ["", "garbage", "v1=abcd", &timestamp_only, "t=abc,v1=zz"];
        for header in headers {
            assert!(
                matches!(verifier.verify(PAYLOAD, header), Err(EngineError::InvalidSignature)),
                "{}",
                header
            );
        }
    }

    #[test]
    fn test_timestamp_tolerance() {
        let (verifier, clock) = verifier();
        let header = sign_payload(SECRET, now().unix_timestamp(), PAYLOAD);

        clock.advance(Duration::seconds(SIGNATURE_TOLERANCE_SECS));
        assert!(verifier.verify(PAYLOAD, &header).is_ok());

        clock.advance(Duration::seconds(1));
        assert!(matches!(
            verifier.verify(PAYLOAD, &header),
            Err(EngineError::InvalidSignature)
        ));
    }

    #[test]
    fn test_signed_but_unparseable_body() {
        let (verifier, _) = verifier();
        let body = r#"{"type":"invoice.paid"}"#;
        let header = sign_payload(SECRET, now().unix_timestamp(), body);
        assert!(matches!(
            verifier.verify(body, &header),
            Err(EngineError::InvalidSignature)
        ));
    }
}
