//! Loan-account event handlers
//!
//! Handles events:
//! - account.created.v1
//! - account.updated.v1
//! - account.status_changed.v1
//! - account.schedule.created.v1
//! - account.schedule.updated.v1
//!
//! Schedule events carry no ordering guarantee relative to each other:
//! `schedule.updated` may land before `schedule.created`, so the created
//! handler preserves already-recorded payment statuses and the updated
//! handler creates placeholder payments for rows it cannot match yet.

use crate::events::{AccountPayload, ParsedEvent, SchedulePayment};
use crate::handlers::{now_timestamp, EventHandler, HandlerError, CUSTOMERS, LOAN_ACCOUNTS};
use async_trait::async_trait;
use projection_store::{Filter, ProjectionStore, UpdateDocument};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// SDK account status to projection accountStatus mapping. Unknown values
/// map to `active` so a new upstream status never stalls the stream.
pub(crate) fn map_sdk_status(sdk_status: &str) -> &'static str {
    match sdk_status {
        "PENDING" => "active",
        "ACTIVE" => "active",
        "SUSPENDED" => "in_arrears",
        "CLOSED" => "paid_off",
        _ => "active",
    }
}

/// Remove an enum prefix if present (e.g. "AccountStatus.ACTIVE" -> "ACTIVE").
fn strip_enum_prefix(raw: &str) -> &str {
    raw.rsplit('.').next().unwrap_or(raw)
}

fn account_payload(event: &ParsedEvent) -> Result<&AccountPayload, HandlerError> {
    match event {
        ParsedEvent::Account { payload, .. } => Ok(payload),
        _ => Err(HandlerError::Malformed(
            "account handler invoked without an account payload".to_string(),
        )),
    }
}

fn required_account_id(payload: &AccountPayload) -> Result<&str, HandlerError> {
    payload
        .account_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerError::Malformed("account event without account_id".to_string()))
}

/// Builds the loan-account projection on account.created.v1
pub struct AccountCreatedHandler;

#[async_trait]
impl EventHandler for AccountCreatedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let payload = account_payload(event)?;
        let account_id = required_account_id(payload)?;
        let customer_id = payload.customer_id.as_deref().unwrap_or("");

        tracing::info!(
            account_id = %account_id,
            customer_id = %customer_id,
            "Processing account.created.v1"
        );

        // Resolve the customer for the back-reference and denormalised
        // name; account creation proceeds even when the customer has not
        // been projected yet.
        let customer = if customer_id.is_empty() {
            None
        } else {
            store
                .find_one(CUSTOMERS, &Filter::new().eq("customerId", json!(customer_id)))
                .await?
        };
        let customer_ref = customer
            .as_ref()
            .and_then(|doc| doc.get("_id").cloned())
            .unwrap_or(Value::Null);
        let customer_name = customer
            .as_ref()
            .and_then(|doc| doc.get("fullName"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let sdk_status = strip_enum_prefix(
            payload
                .status
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or("PENDING"),
        )
        .to_string();
        let account_status = map_sdk_status(&sdk_status);

        let update = UpdateDocument::new()
            .set("loanAccountId", json!(account_id))
            .set("accountNumber", json!(payload.account_number))
            .set("customerId", customer_ref)
            .set("customerIdString", json!(customer_id))
            .set("customerName", json!(customer_name))
            .set(
                "loanTerms",
                json!({
                    "loanAmount": payload.loan_amount,
                    "loanFee": payload.loan_fee,
                    "totalPayable": payload.loan_total_payable,
                    "openedDate": payload.opened_date,
                }),
            )
            .set(
                "balances",
                json!({
                    "currentBalance": payload.current_balance.unwrap_or(0.0),
                    "totalOutstanding": payload.current_balance.unwrap_or(0.0),
                    "totalPaid": 0.0,
                }),
            )
            .set("accountStatus", json!(account_status))
            .set("sdkStatus", json!(sdk_status))
            .set("updatedAt", json!(now_timestamp()))
            .set_on_insert("createdAt", json!(now_timestamp()));

        let result = store
            .update_one(
                LOAN_ACCOUNTS,
                &Filter::new().eq("loanAccountId", json!(account_id)),
                &update,
                true,
            )
            .await?;

        tracing::info!(
            account_id = %account_id,
            matched = result.matched_count,
            modified = result.modified_count,
            upserted_id = ?result.upserted_id,
            "Loan account upserted"
        );

        Ok(())
    }
}

/// Partial update on account.updated.v1
pub struct AccountUpdatedHandler;

#[async_trait]
impl EventHandler for AccountUpdatedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let payload = account_payload(event)?;
        let account_id = required_account_id(payload)?;

        tracing::info!(account_id = %account_id, "Processing account.updated.v1");

        let mut update = UpdateDocument::new().set("updatedAt", json!(now_timestamp()));

        if let Some(balance) = payload.current_balance {
            // totalOutstanding mirrors currentBalance until a dedicated
            // outstanding-balance feed exists
            update = update
                .set("balances.currentBalance", json!(balance))
                .set("balances.totalOutstanding", json!(balance));
        }

        if let Some(status) = payload.status.as_deref().filter(|s| !s.is_empty()) {
            let sdk_status = strip_enum_prefix(status).to_string();
            let account_status = map_sdk_status(&sdk_status);
            update = update
                .set("sdkStatus", json!(sdk_status))
                .set("accountStatus", json!(account_status));
        }

        if let Some(date) = payload.last_payment_date.as_deref().filter(|s| !s.is_empty()) {
            update = update.set("lastPayment.date", json!(date));
        }

        if let Some(amount) = payload.last_payment_amount {
            update = update.set("lastPayment.amount", json!(amount));
        }

        let result = store
            .update_one(
                LOAN_ACCOUNTS,
                &Filter::new().eq("loanAccountId", json!(account_id)),
                &update,
                false,
            )
            .await?;

        tracing::info!(
            account_id = %account_id,
            matched = result.matched_count,
            modified = result.modified_count,
            "Loan account updated"
        );

        Ok(())
    }
}

/// Status remap on account.status_changed.v1
pub struct AccountStatusChangedHandler;

#[async_trait]
impl EventHandler for AccountStatusChangedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let payload = account_payload(event)?;
        let account_id = required_account_id(payload)?;
        let new_status = payload
            .new_status
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                HandlerError::Malformed("status_changed event without new_status".to_string())
            })?;

        tracing::info!(account_id = %account_id, "Processing account.status_changed.v1");

        let sdk_status = strip_enum_prefix(new_status).to_string();
        let account_status = map_sdk_status(&sdk_status);

        let result = store
            .update_one(
                LOAN_ACCOUNTS,
                &Filter::new().eq("loanAccountId", json!(account_id)),
                &UpdateDocument::new()
                    .set("sdkStatus", json!(sdk_status))
                    .set("accountStatus", json!(account_status))
                    .set("updatedAt", json!(now_timestamp())),
                false,
            )
            .await?;

        tracing::info!(
            account_id = %account_id,
            new_status = %account_status,
            matched = result.matched_count,
            modified = result.modified_count,
            "Account status changed"
        );

        Ok(())
    }
}

/// Fields preserved from a payment that was updated before its schedule
/// arrived.
struct PreservedPayment {
    status: Value,
    paid_date: Option<Value>,
    amount_paid: Option<Value>,
    amount_remaining: Option<Value>,
    linked_transaction_ids: Option<Value>,
    last_updated: Option<Value>,
}

/// Writes the repayment schedule on account.schedule.created.v1
///
/// Preserves existing payment statuses so a `schedule.updated` that
/// arrived first is not lost when the schedule itself lands.
pub struct ScheduleCreatedHandler;

#[async_trait]
impl EventHandler for ScheduleCreatedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let payload = account_payload(event)?;
        let account_id = required_account_id(payload)?;

        tracing::info!(
            account_id = %account_id,
            schedule_id = ?payload.schedule_id,
            "Processing account.schedule.created.v1"
        );

        let filter = Filter::new().eq("loanAccountId", json!(account_id));
        let existing = store.find_one(LOAN_ACCOUNTS, &filter).await?;

        // Lookup of payments whose status was already moved off "scheduled"
        let mut preserved: HashMap<i64, PreservedPayment> = HashMap::new();
        let existing_payments = existing
            .as_ref()
            .and_then(|doc| doc.get("repaymentSchedule"))
            .and_then(|schedule| schedule.get("payments"))
            .and_then(Value::as_array);
        if let Some(rows) = existing_payments {
            for row in rows {
                let Some(number) = row.get("paymentNumber").and_then(Value::as_i64) else {
                    continue;
                };
                let status = row.get("status").and_then(Value::as_str).unwrap_or("");
                if status.is_empty() || status == "scheduled" {
                    continue;
                }
                preserved.insert(
                    number,
                    PreservedPayment {
                        status: json!(status),
                        paid_date: non_null(row.get("paidDate")),
                        amount_paid: non_null(row.get("amountPaid")),
                        amount_remaining: non_null(row.get("amountRemaining")),
                        linked_transaction_ids: non_empty(row.get("linkedTransactionIds")),
                        last_updated: non_null(row.get("lastUpdated")),
                    },
                );
            }
        }

        let mut payments = Vec::new();
        let mut preserved_count = 0usize;
        for payment in payload.payments.as_deref().unwrap_or(&[]) {
            let mut doc = Map::new();
            doc.insert("paymentNumber".to_string(), json!(payment.payment_number));
            doc.insert("dueDate".to_string(), json!(payment.due_date));
            doc.insert("amount".to_string(), json!(payment.amount.unwrap_or(0.0)));
            doc.insert("status".to_string(), json!("scheduled"));

            if let Some(kept) = payment.payment_number.and_then(|n| preserved.get(&n)) {
                doc.insert("status".to_string(), kept.status.clone());
                if let Some(v) = &kept.paid_date {
                    doc.insert("paidDate".to_string(), v.clone());
                }
                if let Some(v) = &kept.amount_paid {
                    doc.insert("amountPaid".to_string(), v.clone());
                }
                if let Some(v) = &kept.amount_remaining {
                    doc.insert("amountRemaining".to_string(), v.clone());
                }
                if let Some(v) = &kept.linked_transaction_ids {
                    doc.insert("linkedTransactionIds".to_string(), v.clone());
                }
                if let Some(v) = &kept.last_updated {
                    doc.insert("lastUpdated".to_string(), v.clone());
                }
                preserved_count += 1;
            }

            payments.push(Value::Object(doc));
        }

        let result = store
            .update_one(
                LOAN_ACCOUNTS,
                &filter,
                &UpdateDocument::new()
                    .set(
                        "repaymentSchedule",
                        json!({
                            "scheduleId": payload.schedule_id,
                            "numberOfPayments": payload.n_payments,
                            "paymentFrequency": payload.payment_frequency,
                            "payments": payments,
                            "createdDate": payload.created_date,
                        }),
                    )
                    .set("updatedAt", json!(now_timestamp())),
                false,
            )
            .await?;

        tracing::info!(
            account_id = %account_id,
            num_payments = payload.payments.as_ref().map(Vec::len).unwrap_or(0),
            preserved_statuses = preserved_count,
            frequency = ?payload.payment_frequency,
            matched = result.matched_count,
            modified = result.modified_count,
            "Repayment schedule added"
        );

        Ok(())
    }
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|v| !v.is_null()).cloned()
}

fn non_empty(value: Option<&Value>) -> Option<Value> {
    value
        .filter(|v| match v {
            Value::Array(items) => !items.is_empty(),
            Value::Null => false,
            _ => true,
        })
        .cloned()
}

/// Applies per-payment status updates on account.schedule.updated.v1
///
/// Payments that cannot be matched yet (schedule not created) become
/// placeholder rows, enriched later by the created handler.
pub struct ScheduleUpdatedHandler;

#[async_trait]
impl EventHandler for ScheduleUpdatedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let payload = account_payload(event)?;
        let account_id = required_account_id(payload)?;

        tracing::info!(
            account_id = %account_id,
            schedule_id = ?payload.schedule_id,
            "Processing account.schedule.updated.v1"
        );

        let payment_updates = payload.payments.as_deref().unwrap_or(&[]);
        if payment_updates.is_empty() {
            tracing::warn!(account_id = %account_id, "No payment updates in event");
            return Ok(());
        }

        let mut total_matched = 0u64;
        let mut total_modified = 0u64;
        let mut placeholders_created = 0u64;

        for payment in payment_updates {
            let new_status = payment
                .status
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase)
                .unwrap_or_else(|| "scheduled".to_string());

            let mut update = UpdateDocument::new()
                .set("repaymentSchedule.payments.$.status", json!(new_status))
                .set("updatedAt", json!(now_timestamp()));

            if let Some(date) = payment.paid_date.as_deref().filter(|s| !s.is_empty()) {
                update = update.set("repaymentSchedule.payments.$.paidDate", json!(date));
            }
            if let Some(amount) = payment.amount_paid {
                update = update.set("repaymentSchedule.payments.$.amountPaid", json!(amount));
            }
            if let Some(amount) = payment.amount_remaining {
                update = update.set("repaymentSchedule.payments.$.amountRemaining", json!(amount));
            }
            if let Some(ids) = payment
                .linked_transaction_ids
                .as_ref()
                .filter(|ids| !ids.is_empty())
            {
                update = update.set("repaymentSchedule.payments.$.linkedTransactionIds", json!(ids));
            }
            if let Some(at) = payment.last_updated.as_deref().filter(|s| !s.is_empty()) {
                update = update.set("repaymentSchedule.payments.$.lastUpdated", json!(at));
            }

            let result = store
                .update_one(
                    LOAN_ACCOUNTS,
                    &Filter::new()
                        .eq("loanAccountId", json!(account_id))
                        .eq(
                            "repaymentSchedule.payments.paymentNumber",
                            json!(payment.payment_number),
                        ),
                    &update,
                    false,
                )
                .await?;

            if result.matched_count > 0 {
                total_matched += result.matched_count;
                total_modified += result.modified_count;
            } else {
                // Payment not yet projected: push a placeholder that
                // schedule.created will enrich with dueDate and amount
                tracing::info!(
                    account_id = %account_id,
                    payment_number = ?payment.payment_number,
                    new_status = %new_status,
                    "Payment not found, creating placeholder for out-of-order handling"
                );

                let placeholder = placeholder_payment(payment, &new_status);
                let upsert_result = store
                    .update_one(
                        LOAN_ACCOUNTS,
                        &Filter::new().eq("loanAccountId", json!(account_id)),
                        &UpdateDocument::new()
                            .push("repaymentSchedule.payments", placeholder)
                            .set("updatedAt", json!(now_timestamp()))
                            .set_on_insert("repaymentSchedule.scheduleId", json!(payload.schedule_id))
                            .set_on_insert("createdAt", json!(now_timestamp())),
                        true,
                    )
                    .await?;

                if upsert_result.upserted_id.is_some() {
                    tracing::info!(
                        account_id = %account_id,
                        "Created new account with placeholder schedule"
                    );
                }
                placeholders_created += 1;
            }

            tracing::debug!(
                account_id = %account_id,
                payment_number = ?payment.payment_number,
                new_status = %new_status,
                matched = result.matched_count,
                modified = result.modified_count,
                "Payment status updated"
            );
        }

        tracing::info!(
            account_id = %account_id,
            payments_processed = payment_updates.len(),
            total_matched = total_matched,
            total_modified = total_modified,
            placeholders_created = placeholders_created,
            "Repayment schedule updated"
        );

        Ok(())
    }
}

fn placeholder_payment(payment: &SchedulePayment, new_status: &str) -> Value {
    let mut doc = Map::new();
    doc.insert("paymentNumber".to_string(), json!(payment.payment_number));
    doc.insert("status".to_string(), json!(new_status));
    // dueDate and amount arrive with schedule.created
    doc.insert("dueDate".to_string(), Value::Null);
    doc.insert("amount".to_string(), Value::Null);
    if let Some(date) = payment.paid_date.as_deref().filter(|s| !s.is_empty()) {
        doc.insert("paidDate".to_string(), json!(date));
    }
    if let Some(amount) = payment.amount_paid {
        doc.insert("amountPaid".to_string(), json!(amount));
    }
    if let Some(amount) = payment.amount_remaining {
        doc.insert("amountRemaining".to_string(), json!(amount));
    }
    if let Some(ids) = payment
        .linked_transaction_ids
        .as_ref()
        .filter(|ids| !ids.is_empty())
    {
        doc.insert("linkedTransactionIds".to_string(), json!(ids));
    }
    Value::Object(doc)
}
