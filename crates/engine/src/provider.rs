//! Payment processor event payloads
//!
//! The engine keeps the raw object as an opaque snapshot and only reads the handful of
//! fields reconciliation needs through the typed views below. Reference fields may be
//! either a bare id or an expanded object, depending on how the endpoint is configured.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use time::OffsetDateTime;

use crate::error::{EngineError, EngineResult};
use crate::event::Correlation;

/// Event envelope as delivered to the webhook endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub livemode: bool,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl ProviderEvent {
    pub fn from_json(payload: &str) -> EngineResult<Self> {
        let event: ProviderEvent = serde_json::from_str(payload)?;
        if event.id.trim().is_empty() {
            return Err(EngineError::InvalidPayload("event id is empty".to_string()));
        }
        Ok(event)
    }

    pub fn object(&self) -> &serde_json::Value {
        &self.data.object
    }

    pub fn created_at(&self) -> Option<OffsetDateTime> {
        self.created.and_then(from_unix)
    }

    /// Object kind, e.g. `subscription`, `invoice`, `charge`
    pub fn object_kind(&self) -> Option<&str> {
        self.object().get("object").and_then(|v| v.as_str())
    }

    /// Pull processor references out of the event object
    pub fn correlation(&self) -> Correlation {
        let object = self.object();
        let field = |name: &str| object.get(name).and_then(reference_id);
        let own_id = field("id");

        let mut correlation = Correlation {
            customer_id: field("customer"),
            subscription_id: field("subscription"),
            invoice_id: field("invoice"),
            charge_id: field("charge"),
            payment_intent_id: field("payment_intent"),
        };

        match self.object_kind() {
            Some("subscription") => correlation.subscription_id = own_id,
            Some("invoice") => {
                correlation.invoice_id = own_id;
                if correlation.subscription_id.is_none() {
                    correlation.subscription_id = parent_subscription(object);
                }
            }
            Some("charge") => correlation.charge_id = own_id,
            Some("payment_intent") => correlation.payment_intent_id = own_id,
            Some("customer") => correlation.customer_id = own_id,
            _ => {}
        }

        correlation
    }

    /// Monetary amount and currency, when the object carries one
    pub fn amount(&self) -> (Option<i64>, Option<String>) {
        let object = self.object();
        let int = |name: &str| object.get(name).and_then(|v| v.as_i64());

        let amount = match self.object_kind() {
            Some("invoice") => match int("amount_paid") {
                Some(paid) if paid > 0 => Some(paid),
                _ => int("amount_due"),
            },
            Some("checkout.session") => int("amount_total"),
            _ => int("amount"),
        };
        let currency = object
            .get("currency")
            .and_then(|v| v.as_str())
            .map(|c| c.to_ascii_lowercase());

        (amount, currency)
    }
}

/// Subscription object view
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub items: ItemList,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Price {
    pub id: String,
    #[serde(default)]
    pub nickname: Option<String>,
}

impl SubscriptionObject {
    pub fn parse(object: &serde_json::Value) -> EngineResult<Self> {
        Ok(serde_json::from_value(object.clone())?)
    }

    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    // Newer API versions only report billing periods on the items
    pub fn period_start(&self) -> Option<OffsetDateTime> {
        self.current_period_start
            .or_else(|| self.items.data.first().and_then(|i| i.current_period_start))
            .and_then(from_unix)
    }

    pub fn period_end(&self) -> Option<OffsetDateTime> {
        self.current_period_end
            .or_else(|| self.items.data.first().and_then(|i| i.current_period_end))
            .and_then(from_unix)
    }

    pub fn trial_end_at(&self) -> Option<OffsetDateTime> {
        self.trial_end.and_then(from_unix)
    }

    pub fn canceled_at_time(&self) -> Option<OffsetDateTime> {
        self.canceled_at.and_then(from_unix)
    }
}

/// Invoice object view
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    subscription: Option<String>,
    #[serde(default)]
    parent: Option<serde_json::Value>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub amount_due: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub attempt_count: Option<u32>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub status_transitions: Option<StatusTransitions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusTransitions {
    #[serde(default)]
    pub paid_at: Option<i64>,
}

impl InvoiceObject {
    pub fn parse(object: &serde_json::Value) -> EngineResult<Self> {
        Ok(serde_json::from_value(object.clone())?)
    }

    pub fn subscription_id(&self) -> Option<String> {
        self.subscription
            .clone()
            .or_else(|| self.parent.as_ref().and_then(|p| {
                p.get("subscription_details")
                    .and_then(|d| d.get("subscription"))
                    .and_then(reference_id)
            }))
    }

    pub fn paid_at(&self) -> Option<OffsetDateTime> {
        self.status_transitions
            .as_ref()
            .and_then(|t| t.paid_at)
            .and_then(from_unix)
    }
}

pub(crate) fn from_unix(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

/// Id of a reference that is either `"cus_123"` or `{"id": "cus_123", ...}`
fn reference_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(id) if !id.is_empty() => Some(id.clone()),
        serde_json::Value::Object(map) => map.get("id").and_then(reference_id),
        _ => None,
    }
}

fn parent_subscription(object: &serde_json::Value) -> Option<String> {
    object
        .get("parent")
        .and_then(|p| p.get("subscription_details"))
        .and_then(|d| d.get("subscription"))
        .and_then(reference_id)
}

fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(reference_id))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(type_: &str, object: serde_json::Value) -> ProviderEvent {
        let raw = json!({
            "id": "evt_123",
            "type": type_,
            "created": 1_700_000_000,
            "data": { "object": object },
        });
        ProviderEvent::from_json(&raw.to_string()).unwrap()
    }

    #[test]
    fn test_rejects_missing_id() {
        let raw = r#"{"id":"","type":"invoice.paid","data":{"object":{}}}"#;
        assert!(matches!(
            ProviderEvent::from_json(raw),
            Err(EngineError::InvalidPayload(_))
        ));
        assert!(ProviderEvent::from_json("not json").is_err());
    }

    #[test]
    fn test_subscription_correlation() {
        let event = event(
            "customer.subscription.updated",
            json!({"id": "sub_1", "object": "subscription", "customer": "cus_1"}),
        );
        let correlation = event.correlation();
        assert_eq!(correlation.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(correlation.customer_id.as_deref(), Some("cus_1"));
        assert!(correlation.invoice_id.is_none());
    }

    #[test]
    fn test_invoice_correlation_and_amount() {
        let event = event(
            "invoice.payment_failed",
            json!({
                "id": "in_1",
                "object": "invoice",
                "customer": {"id": "cus_1", "object": "customer"},
                "parent": {"subscription_details": {"subscription": "sub_1"}},
                "charge": "ch_1",
                "payment_intent": "pi_1",
                "amount_paid": 0,
                "amount_due": 4900,
                "currency": "USD",
            }),
        );
        let correlation = event.correlation();
        assert_eq!(correlation.invoice_id.as_deref(), Some("in_1"));
        assert_eq!(correlation.customer_id.as_deref(), Some("cus_1"));
        assert_eq!(correlation.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(correlation.charge_id.as_deref(), Some("ch_1"));
        assert_eq!(correlation.payment_intent_id.as_deref(), Some("pi_1"));
        assert_eq!(event.amount(), (Some(4900), Some("usd".to_string())));
    }

    #[test]
    fn test_subscription_object_reads_item_periods() {
        let object = json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "trialing",
            "cancel_at_period_end": null,
            "metadata": null,
            "items": {"data": [{
                "price": {"id": "price_pro"},
                "current_period_start": 1_700_000_000,
                "current_period_end": 1_702_592_000,
            }]},
        });
        let sub = SubscriptionObject::parse(&object).unwrap();
        assert_eq!(sub.price_id(), Some("price_pro"));
        assert!(!sub.cancel_at_period_end);
        assert_eq!(sub.period_start(), from_unix(1_700_000_000));
        assert_eq!(sub.period_end(), from_unix(1_702_592_000));
    }

    #[test]
    fn test_invoice_object_direct_subscription() {
        let invoice = InvoiceObject::parse(&json!({
            "id": "in_2",
            "subscription": "sub_9",
            "amount_paid": 1500,
            "status_transitions": {"paid_at": 1_700_000_100},
        }))
        .unwrap();
        assert_eq!(invoice.subscription_id().as_deref(), Some("sub_9"));
        assert_eq!(invoice.paid_at(), from_unix(1_700_000_100));
    }
}
