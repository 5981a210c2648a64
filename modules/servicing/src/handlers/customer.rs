//! Customer event handlers
//!
//! Handles events:
//! - customer.changed.v1 / customer.created.v1 / customer.updated.v1
//! - customer.verified.v1
//!
//! Customer events are partial updates: only fields present in the payload
//! are written, everything else on the projection survives.

use crate::events::{CustomerPayload, ParsedEvent, ResidentialAddress};
use crate::handlers::{now_timestamp, EventHandler, HandlerError, CUSTOMERS};
use async_trait::async_trait;
use projection_store::{Filter, ProjectionStore, UpdateDocument};
use serde_json::{json, Value};

/// Upsert-merge for customer.changed.v1 / created.v1 / updated.v1
pub struct CustomerChangedHandler;

#[async_trait]
impl EventHandler for CustomerChangedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let ParsedEvent::Customer { payload, .. } = event else {
            return Err(HandlerError::Malformed(
                "customer handler invoked without a customer payload".to_string(),
            ));
        };
        let customer_id = payload
            .customer_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerError::Malformed("customer event without customer_id".to_string()))?;

        tracing::info!(customer_id = %customer_id, "Processing customer event");

        merge_customer(store, customer_id, payload).await
    }
}

/// Merge a partial customer payload into the projection, creating it on
/// first sight. Shared with the application-detail handler, which carries
/// customer sub-documents on the chat stream.
pub(crate) async fn merge_customer(
    store: &dyn ProjectionStore,
    customer_id: &str,
    payload: &CustomerPayload,
) -> Result<(), HandlerError> {
    let filter = Filter::new().eq("customerId", json!(customer_id));

    // Events may carry only one name part; fall back to the stored value
    // so fullName never degrades.
    let existing = store.find_one(CUSTOMERS, &filter).await?;
    let stored = |field: &str| -> String {
        existing
            .as_ref()
            .and_then(|doc| doc.get(field))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    let first = payload
        .first_name
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| stored("firstName"));
    let last = payload
        .last_name
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| stored("lastName"));
    let full_name = format!("{first} {last}").trim().to_string();

    let mut update = UpdateDocument::new()
        .set("customerId", json!(customer_id))
        .set("fullName", json!(full_name))
        .set("updatedAt", json!(now_timestamp()))
        .set_on_insert("createdAt", json!(now_timestamp()));

    let field_mappings: [(&Option<String>, &str); 7] = [
        (&payload.first_name, "firstName"),
        (&payload.last_name, "lastName"),
        (&payload.preferred_name, "preferredName"),
        (&payload.email_address, "emailAddress"),
        (&payload.mobile_phone_number, "mobilePhoneNumber"),
        (&payload.date_of_birth, "dateOfBirth"),
        (&payload.ekyc_status, "ekycStatus"),
    ];
    for (value, field) in field_mappings {
        if let Some(value) = value {
            update = update.set(field, json!(value));
        }
    }

    if let Some(addr) = &payload.residential_address {
        update = update.set(
            "residentialAddress",
            json!({
                "streetNumber": addr.street_number,
                "streetName": addr.street_name,
                "streetType": addr.street_type,
                "unitNumber": addr.unit_number,
                "suburb": addr.suburb,
                "state": addr.state,
                "postcode": addr.postcode,
                "country": addr.country.as_deref().unwrap_or("Australia"),
                "fullAddress": addr.full_address,
                // Computed street field for backward compatibility
                "street": build_street_address(addr),
                "city": addr.suburb, // Map suburb to city
            }),
        );
    }

    let result = store.update_one(CUSTOMERS, &filter, &update, true).await?;

    tracing::info!(
        customer_id = %customer_id,
        full_name = %full_name,
        matched = result.matched_count,
        modified = result.modified_count,
        upserted_id = ?result.upserted_id,
        "Customer upserted"
    );

    Ok(())
}

/// Build a single-line street address from components.
fn build_street_address(addr: &ResidentialAddress) -> String {
    let mut parts = Vec::new();

    if let Some(unit) = addr.unit_number.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Unit {unit}"));
    }

    if let Some(number) = addr.street_number.as_deref().filter(|s| !s.is_empty()) {
        let mut line = number.to_string();
        if let Some(name) = addr.street_name.as_deref().filter(|s| !s.is_empty()) {
            line.push(' ');
            line.push_str(name);
        }
        if let Some(street_type) = addr.street_type.as_deref().filter(|s| !s.is_empty()) {
            line.push(' ');
            line.push_str(street_type);
        }
        parts.push(line);
    }

    parts.join(", ")
}

/// Sets the identity-verification flag on customer.verified.v1
pub struct CustomerVerifiedHandler;

#[async_trait]
impl EventHandler for CustomerVerifiedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let ParsedEvent::Customer { payload, .. } = event else {
            return Err(HandlerError::Malformed(
                "customer handler invoked without a customer payload".to_string(),
            ));
        };
        let customer_id = payload
            .customer_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerError::Malformed("customer event without customer_id".to_string()))?;

        tracing::info!(customer_id = %customer_id, "Processing customer.verified.v1");

        let result = store
            .update_one(
                CUSTOMERS,
                &Filter::new().eq("customerId", json!(customer_id)),
                &UpdateDocument::new()
                    .set("identityVerified", json!(true))
                    .set("ekycStatus", json!("successful"))
                    .set("updatedAt", json!(now_timestamp())),
                false,
            )
            .await?;

        tracing::info!(
            customer_id = %customer_id,
            matched = result.matched_count,
            modified = result.modified_count,
            "Customer verified"
        );

        Ok(())
    }
}
