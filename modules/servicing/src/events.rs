//! Typed event payloads and the envelope parser
//!
//! Payloads are partial by design: producers publish deltas, so every field
//! is optional and handlers check presence explicitly. Events outside the
//! typed account/customer families (chat and write-off traffic) are
//! consumed as the sanitised envelope map.

use crate::envelope::{sanitize_envelope, Envelope};
use serde::Deserialize;
use serde_json::Value;

/// Account-family payload (`account.*`, `payment.*` events).
///
/// Covers the union of the family's event versions; each event populates
/// its own subset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountPayload {
    pub account_id: Option<String>,
    pub account_number: Option<String>,
    pub customer_id: Option<String>,
    pub status: Option<String>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub loan_amount: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub loan_fee: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub loan_total_payable: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub current_balance: Option<f64>,
    pub opened_date: Option<String>,
    pub last_payment_date: Option<String>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub last_payment_amount: Option<f64>,
    pub new_status: Option<String>,
    pub changed_at: Option<String>,
    pub schedule_id: Option<String>,
    pub n_payments: Option<i64>,
    pub payment_frequency: Option<String>,
    pub created_date: Option<String>,
    pub payments: Option<Vec<SchedulePayment>>,
}

/// One payment row inside a schedule event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulePayment {
    pub payment_number: Option<i64>,
    pub due_date: Option<String>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub amount: Option<f64>,
    pub status: Option<String>,
    pub paid_date: Option<String>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub amount_paid: Option<f64>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub amount_remaining: Option<f64>,
    pub linked_transaction_ids: Option<Vec<String>>,
    pub last_updated: Option<String>,
}

/// Customer-family payload (`customer.*`, `application.*` events).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerPayload {
    pub customer_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub preferred_name: Option<String>,
    pub email_address: Option<String>,
    pub mobile_phone_number: Option<String>,
    pub date_of_birth: Option<String>,
    pub ekyc_status: Option<String>,
    pub residential_address: Option<ResidentialAddress>,
    pub changed_at: Option<String>,
}

/// Residential address components as published by the customers service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResidentialAddress {
    pub unit_number: Option<String>,
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub street_type: Option<String>,
    pub suburb: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
    pub country: Option<String>,
    pub full_address: Option<String>,
}

/// A parsed event, ready for handler dispatch.
#[derive(Debug, Clone)]
pub enum ParsedEvent {
    Account {
        event_type: String,
        conversation_id: String,
        sequence: i64,
        payload: AccountPayload,
    },
    Customer {
        event_type: String,
        conversation_id: String,
        sequence: i64,
        payload: CustomerPayload,
    },
    /// Chat and write-off events: the sanitised envelope as-is
    Raw(Envelope),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to decode {event_type} payload: {source}")]
pub struct ParseError {
    pub event_type: String,
    #[source]
    pub source: serde_json::Error,
}

/// Select a decoder by event-type prefix and produce a [`ParsedEvent`].
///
/// `account.*`/`payment.*` decode the account payload, `customer.*`/
/// `application.*` the customer payload; everything else passes the
/// sanitised envelope through unchanged.
pub fn parse_event(event_type: &str, envelope: &Envelope) -> Result<ParsedEvent, ParseError> {
    let sanitized = sanitize_envelope(envelope);

    let conversation_id = sanitized
        .get("conv")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let sequence = sanitized.get("seq").and_then(Value::as_i64).unwrap_or(0);
    let body = sanitized.get("dat").cloned().unwrap_or(Value::Null);

    if event_type.starts_with("account.") || event_type.starts_with("payment.") {
        let payload = decode_payload(event_type, body)?;
        Ok(ParsedEvent::Account {
            event_type: event_type.to_string(),
            conversation_id,
            sequence,
            payload,
        })
    } else if event_type.starts_with("customer.") || event_type.starts_with("application.") {
        let payload = decode_payload(event_type, body)?;
        Ok(ParsedEvent::Customer {
            event_type: event_type.to_string(),
            conversation_id,
            sequence,
            payload,
        })
    } else {
        Ok(ParsedEvent::Raw(sanitized))
    }
}

fn decode_payload<T>(event_type: &str, body: Value) -> Result<T, ParseError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match body {
        Value::Null => Ok(T::default()),
        other => serde_json::from_value(other).map_err(|source| ParseError {
            event_type: event_type.to_string(),
            source,
        }),
    }
}

/// Accept a number, a numeric string (`"500.00"`), an empty string (→
/// absent), or null for money-like fields.
fn de_flexible_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected number or numeric string, got {other}"
        ))),
    }
}
