//! Write-off event handlers for CRM-originated events
//!
//! Handles events:
//! - writeoff.requested.v1
//! - writeoff.approved.v1
//! - writeoff.rejected.v1
//! - writeoff.cancelled.v1
//!
//! These events originate from the CRM and arrive on the internal stream.
//! The envelope's `conv` is the request id for workflow correlation and
//! `cause` the event id used for polling lookups.

use crate::envelope::Envelope;
use crate::events::ParsedEvent;
use crate::handlers::{now_timestamp, EventHandler, HandlerError, WRITE_OFF_REQUESTS};
use async_trait::async_trait;
use chrono::Utc;
use projection_store::{Filter, ProjectionStore, UpdateDocument};
use rand::Rng;
use serde_json::{json, Map, Value};

fn raw_envelope(event: &ParsedEvent) -> Result<&Envelope, HandlerError> {
    match event {
        ParsedEvent::Raw(envelope) => Ok(envelope),
        _ => Err(HandlerError::Malformed(
            "write-off handler invoked without a raw envelope".to_string(),
        )),
    }
}

/// Parse the payload from the envelope.
///
/// The payload may be a JSON string or an already-parsed map; anything
/// else decodes to an empty map.
pub fn parse_payload(envelope: &Envelope) -> Map<String, Value> {
    match envelope.get("payload") {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default(),
        _ => Map::new(),
    }
}

/// Generate a human-readable write-off request number.
///
/// Format: `WO-YYYYMMDDHHMMSS-XXXX` with a random upper-alphanumeric
/// suffix.
pub fn generate_request_number() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("WO-{timestamp}-{suffix}")
}

fn request_id(envelope: &Envelope) -> String {
    envelope
        .get("conv")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn event_id(envelope: &Envelope) -> String {
    envelope
        .get("cause")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn payload_str(payload: &Map<String, Value>, key: &str) -> Value {
    payload.get(key).cloned().unwrap_or(Value::Null)
}

fn payload_str_or(payload: &Map<String, Value>, key: &str, default: &str) -> Value {
    match payload.get(key) {
        Some(Value::Null) | None => json!(default),
        Some(other) => other.clone(),
    }
}

/// Inserts a new write-off request document on writeoff.requested.v1
pub struct WriteoffRequestedHandler;

#[async_trait]
impl EventHandler for WriteoffRequestedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let envelope = raw_envelope(event)?;
        let payload = parse_payload(envelope);
        let request_id = request_id(envelope);
        let event_id = event_id(envelope);

        tracing::info!(
            request_id = %request_id,
            event_id = %event_id,
            loan_account_id = ?payload.get("loanAccountId"),
            "Processing writeoff.requested.v1"
        );

        let request_number = generate_request_number();
        let now = now_timestamp();

        let document = json!({
            // IDs for lookup and correlation
            "requestId": request_id,
            "eventId": event_id,
            "requestNumber": request_number,

            // Account/customer info
            "loanAccountId": payload_str(&payload, "loanAccountId"),
            "customerId": payload_str(&payload, "customerId"),
            "customerName": payload_str_or(&payload, "customerName", ""),
            "accountNumber": payload_str_or(&payload, "accountNumber", ""),

            // Request details
            "amount": payload_str(&payload, "amount"),
            "originalBalance": payload_str(&payload, "originalBalance"),
            "reason": payload_str(&payload, "reason"),
            "notes": payload_str(&payload, "notes"),
            "priority": payload_str_or(&payload, "priority", "normal"),
            "status": "pending",

            // Audit
            "requestedBy": payload_str(&payload, "requestedBy"),
            "requestedByName": payload_str_or(&payload, "requestedByName", ""),
            "requestedAt": now,

            "createdAt": now,
            "updatedAt": now,
        });
        let document = document
            .as_object()
            .cloned()
            .ok_or_else(|| HandlerError::Malformed("write-off document not an object".to_string()))?;

        let inserted_id = store.insert_one(WRITE_OFF_REQUESTS, document).await?;

        tracing::info!(
            request_id = %request_id,
            request_number = %request_number,
            inserted_id = %inserted_id,
            "Write-off request created"
        );

        Ok(())
    }
}

/// Transitions a request to approved on writeoff.approved.v1
pub struct WriteoffApprovedHandler;

#[async_trait]
impl EventHandler for WriteoffApprovedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let envelope = raw_envelope(event)?;
        let payload = parse_payload(envelope);
        let request_id = request_id(envelope);

        tracing::info!(
            request_id = %request_id,
            event_id = %event_id(envelope),
            "Processing writeoff.approved.v1"
        );

        let result = store
            .update_one(
                WRITE_OFF_REQUESTS,
                &Filter::new().eq("requestId", json!(request_id)),
                &UpdateDocument::new()
                    .set("status", json!("approved"))
                    .set(
                        "approvalDetails",
                        json!({
                            "approvedBy": payload_str(&payload, "approvedBy"),
                            "approvedByName": payload_str_or(&payload, "approvedByName", ""),
                            "comment": payload_str_or(&payload, "comment", ""),
                            "approvedAt": now_timestamp(),
                        }),
                    )
                    .set("updatedAt", json!(now_timestamp())),
                false,
            )
            .await?;

        tracing::info!(
            request_id = %request_id,
            matched = result.matched_count,
            modified = result.modified_count,
            "Write-off request approved"
        );

        Ok(())
    }
}

/// Transitions a request to rejected on writeoff.rejected.v1
pub struct WriteoffRejectedHandler;

#[async_trait]
impl EventHandler for WriteoffRejectedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let envelope = raw_envelope(event)?;
        let payload = parse_payload(envelope);
        let request_id = request_id(envelope);

        tracing::info!(
            request_id = %request_id,
            event_id = %event_id(envelope),
            "Processing writeoff.rejected.v1"
        );

        let result = store
            .update_one(
                WRITE_OFF_REQUESTS,
                &Filter::new().eq("requestId", json!(request_id)),
                &UpdateDocument::new()
                    .set("status", json!("rejected"))
                    .set(
                        "approvalDetails",
                        json!({
                            "rejectedBy": payload_str(&payload, "rejectedBy"),
                            "rejectedByName": payload_str_or(&payload, "rejectedByName", ""),
                            "reason": payload_str_or(&payload, "reason", ""),
                            "rejectedAt": now_timestamp(),
                        }),
                    )
                    .set("updatedAt", json!(now_timestamp())),
                false,
            )
            .await?;

        tracing::info!(
            request_id = %request_id,
            matched = result.matched_count,
            modified = result.modified_count,
            "Write-off request rejected"
        );

        Ok(())
    }
}

/// Transitions a request to cancelled on writeoff.cancelled.v1
pub struct WriteoffCancelledHandler;

#[async_trait]
impl EventHandler for WriteoffCancelledHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let envelope = raw_envelope(event)?;
        let payload = parse_payload(envelope);
        let request_id = request_id(envelope);

        tracing::info!(
            request_id = %request_id,
            event_id = %event_id(envelope),
            "Processing writeoff.cancelled.v1"
        );

        let result = store
            .update_one(
                WRITE_OFF_REQUESTS,
                &Filter::new().eq("requestId", json!(request_id)),
                &UpdateDocument::new()
                    .set("status", json!("cancelled"))
                    .set(
                        "cancellationDetails",
                        json!({
                            "cancelledBy": payload_str(&payload, "cancelledBy"),
                            "cancelledByName": payload_str_or(&payload, "cancelledByName", ""),
                            "cancelledAt": now_timestamp(),
                        }),
                    )
                    .set("updatedAt", json!(now_timestamp())),
                false,
            )
            .await?;

        tracing::info!(
            request_id = %request_id,
            matched = result.matched_count,
            modified = result.modified_count,
            "Write-off request cancelled"
        );

        Ok(())
    }
}
