//! Conversation event handlers
//!
//! Handles all chat/conversation events:
//! - conversation_started
//! - user_input / assistant_response
//! - applicationDetail_changed
//! - identityRisk_assessment / serviceability_assessment_results / fraudCheck_assessment
//! - noticeboard_updated
//! - final_decision
//! - conversation_summary
//!
//! Chat events arrive as raw envelopes; the payload may be a nested map or
//! flattened onto the envelope, so each handler reads from the payload when
//! it is a map and falls back to the top level otherwise.

use crate::envelope::{event_type_of, Envelope};
use crate::events::{CustomerPayload, ParsedEvent};
use crate::handlers::customer::merge_customer;
use crate::handlers::{now_timestamp, EventHandler, HandlerError, CONVERSATIONS, CUSTOMERS};
use async_trait::async_trait;
use projection_store::{Filter, ProjectionStore, UpdateDocument};
use serde_json::{json, Map, Value};

fn raw_envelope(event: &ParsedEvent) -> Result<&Envelope, HandlerError> {
    match event {
        ParsedEvent::Raw(envelope) => Ok(envelope),
        _ => Err(HandlerError::Malformed(
            "conversation handler invoked without a raw envelope".to_string(),
        )),
    }
}

/// First non-empty string value among the given keys.
fn first_str<'a>(envelope: &'a Envelope, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| envelope.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

fn conversation_id(envelope: &Envelope) -> Result<&str, HandlerError> {
    first_str(envelope, &["cid", "conv", "conversation_id"]).ok_or_else(|| {
        HandlerError::Malformed("conversation event without a conversation id".to_string())
    })
}

fn payload_object(envelope: &Envelope) -> Option<&Map<String, Value>> {
    envelope.get("payload").and_then(Value::as_object)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Number(_) => true,
    }
}

/// Timestamp from the envelope when present, current time otherwise.
fn timestamp_or_now(envelope: &Envelope) -> Value {
    envelope
        .get("timestamp")
        .filter(|v| is_truthy(v))
        .cloned()
        .unwrap_or_else(|| json!(now_timestamp()))
}

/// Creates the conversation projection on conversation_started
pub struct ConversationStartedHandler;

#[async_trait]
impl EventHandler for ConversationStartedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let envelope = raw_envelope(event)?;
        let conversation_id = conversation_id(envelope)?;
        let customer_id = first_str(envelope, &["usr", "user_id"]);
        let application_number = first_str(envelope, &["app_number", "application_number"])
            .or_else(|| {
                payload_object(envelope)
                    .and_then(|p| p.get("application_number"))
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
            })
            .unwrap_or("");

        tracing::info!(
            conversation_id = %conversation_id,
            customer_id = ?customer_id,
            application_number = %application_number,
            "Processing conversation_started"
        );

        // Back-reference to the customer document when it already exists
        let customer_ref = match customer_id {
            Some(id) => store
                .find_one(CUSTOMERS, &Filter::new().eq("customerId", json!(id)))
                .await?
                .and_then(|doc| doc.get("_id").cloned())
                .unwrap_or(Value::Null),
            None => Value::Null,
        };

        let update = UpdateDocument::new()
            .set("conversationId", json!(conversation_id))
            .set("customerId", customer_ref)
            .set("customerIdString", json!(customer_id))
            .set("applicationNumber", json!(application_number))
            .set("status", json!("active"))
            .set("startedAt", timestamp_or_now(envelope))
            .set("updatedAt", json!(now_timestamp()))
            .set("utterances", json!([]))
            .set("assessments", json!({}))
            .set("noticeboard", json!([]))
            .set("version", json!(1))
            .set_on_insert("createdAt", json!(now_timestamp()));

        let result = store
            .update_one(
                CONVERSATIONS,
                &Filter::new().eq("conversationId", json!(conversation_id)),
                &update,
                true,
            )
            .await?;

        tracing::info!(
            conversation_id = %conversation_id,
            matched = result.matched_count,
            upserted_id = ?result.upserted_id,
            "Conversation created"
        );

        Ok(())
    }
}

/// Create a minimal conversation stub when an event arrives before
/// conversation_started.
async fn ensure_conversation_exists(
    store: &dyn ProjectionStore,
    conversation_id: &str,
    envelope: &Envelope,
) -> Result<(), HandlerError> {
    let filter = Filter::new().eq("conversationId", json!(conversation_id));
    if store.find_one(CONVERSATIONS, &filter).await?.is_some() {
        return Ok(());
    }

    tracing::info!(
        conversation_id = %conversation_id,
        "Conversation not found, creating stub"
    );

    let customer_id = first_str(envelope, &["usr", "user_id"]);
    store
        .update_one(
            CONVERSATIONS,
            &filter,
            &UpdateDocument::new()
                .set("conversationId", json!(conversation_id))
                .set("customerIdString", json!(customer_id))
                .set("status", json!("active"))
                .set("startedAt", json!(now_timestamp()))
                .set("updatedAt", json!(now_timestamp()))
                .set("utterances", json!([]))
                .set("assessments", json!({}))
                .set("noticeboard", json!([]))
                .set("version", json!(1))
                .set_on_insert("createdAt", json!(now_timestamp())),
            true,
        )
        .await?;
    Ok(())
}

/// Appends an utterance on user_input / assistant_response
pub struct UtteranceHandler;

#[async_trait]
impl EventHandler for UtteranceHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let envelope = raw_envelope(event)?;
        let conversation_id = conversation_id(envelope)?;
        let event_type = event_type_of(envelope);

        tracing::info!(
            conversation_id = %conversation_id,
            event_type = %event_type,
            "Processing utterance"
        );

        let username = if event_type == "user_input" {
            "customer"
        } else {
            "assistant"
        };

        // Read from the payload when it is a map, the envelope otherwise
        let source: &Map<String, Value> = payload_object(envelope).unwrap_or(envelope);
        let get = |key: &str| source.get(key).cloned().unwrap_or(Value::Null);

        let created_at = match source.get("created_at").filter(|v| is_truthy(v)) {
            Some(v) => v.clone(),
            None => json!(now_timestamp()),
        };
        let prev_seq = envelope
            .get("prev_seq")
            .filter(|v| !v.is_null())
            .or_else(|| envelope.get("seq"))
            .cloned()
            .unwrap_or(Value::Null);

        let utterance = json!({
            "username": username,
            "utterance": source.get("utterance").cloned().unwrap_or(json!("")),
            "rationale": get("rationale"),
            "createdAt": created_at,
            "answerInputType": get("answer_input_type"),
            "prevSeq": prev_seq,
            "endConversation": source
                .get("end_conversation")
                .cloned()
                .unwrap_or(json!(false)),
            "additionalData": get("additional_data"),
        });

        ensure_conversation_exists(store, conversation_id, envelope).await?;

        let result = store
            .update_one(
                CONVERSATIONS,
                &Filter::new().eq("conversationId", json!(conversation_id)),
                &UpdateDocument::new()
                    .push("utterances", utterance)
                    .set("updatedAt", json!(now_timestamp()))
                    .set("lastUtteranceTime", created_at.clone())
                    .inc("version", 1),
                false,
            )
            .await?;

        tracing::info!(
            conversation_id = %conversation_id,
            username = %username,
            matched = result.matched_count,
            modified = result.modified_count,
            "Utterance added"
        );

        Ok(())
    }
}

/// Synchronises customer data and application details on
/// applicationDetail_changed
pub struct ApplicationDetailChangedHandler;

/// Envelope keys never copied into the applicationData blob.
const APPLICATION_DATA_DENYLIST: [&str; 4] = ["typ", "agt", "timestamp", "customer"];

#[async_trait]
impl EventHandler for ApplicationDetailChangedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let envelope = raw_envelope(event)?;
        let conversation_id = conversation_id(envelope)?;

        tracing::info!(conversation_id = %conversation_id, "Processing applicationDetail_changed");

        // Customer data may ride on the envelope or inside the payload
        if let Some(customer_data) = envelope.get("customer").and_then(Value::as_object) {
            let customer_id = customer_data
                .get("customer_id")
                .and_then(Value::as_str)
                .or_else(|| envelope.get("customer_id").and_then(Value::as_str))
                .filter(|s| !s.is_empty());
            if let Some(customer_id) = customer_id {
                sync_customer(store, customer_id, customer_data).await?;
            }
        }
        if let Some(customer_data) = payload_object(envelope)
            .and_then(|p| p.get("customer"))
            .and_then(Value::as_object)
        {
            let customer_id = customer_data
                .get("customer_id")
                .and_then(Value::as_str)
                .or_else(|| customer_data.get("customerId").and_then(Value::as_str))
                .filter(|s| !s.is_empty());
            if let Some(customer_id) = customer_id {
                sync_customer(store, customer_id, customer_data).await?;
            }
        }

        let application_number = first_str(envelope, &["application_number", "applicationNumber"])
            .or_else(|| {
                payload_object(envelope)
                    .and_then(|p| p.get("application_number"))
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
            });

        let mut update = UpdateDocument::new().set("updatedAt", json!(now_timestamp()));
        if let Some(number) = application_number {
            update = update.set("applicationNumber", json!(number));
        }

        // Permissive by design: everything except the denylist lands in
        // the applicationData blob, whose schema is not a contract
        let app_data: Map<String, Value> = envelope
            .iter()
            .filter(|(key, _)| !APPLICATION_DATA_DENYLIST.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !app_data.is_empty() {
            update = update.set("applicationData", Value::Object(app_data));
        }

        store
            .update_one(
                CONVERSATIONS,
                &Filter::new().eq("conversationId", json!(conversation_id)),
                &update.inc("version", 1),
                false,
            )
            .await?;

        Ok(())
    }
}

/// Merge a customer sub-document from a chat event into the customer
/// projection, reusing the customer-family merge rules.
async fn sync_customer(
    store: &dyn ProjectionStore,
    customer_id: &str,
    customer_data: &Map<String, Value>,
) -> Result<(), HandlerError> {
    match serde_json::from_value::<CustomerPayload>(Value::Object(customer_data.clone())) {
        Ok(payload) => merge_customer(store, customer_id, &payload).await,
        Err(error) => {
            tracing::warn!(
                customer_id = %customer_id,
                error = %error,
                "Skipping unparseable customer data on application event"
            );
            Ok(())
        }
    }
}

/// Stores assessment results under assessments.<key>
pub struct AssessmentHandler;

#[async_trait]
impl EventHandler for AssessmentHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let envelope = raw_envelope(event)?;
        let conversation_id = conversation_id(envelope)?;
        let event_type = event_type_of(envelope);

        tracing::info!(
            conversation_id = %conversation_id,
            event_type = %event_type,
            "Processing assessment"
        );

        let assessment_key = match event_type {
            "identityRisk_assessment" => "identityRisk",
            "serviceability_assessment_results" => "serviceability",
            "fraudCheck_assessment" => "fraudCheck",
            _ => {
                tracing::warn!(event_type = %event_type, "Unknown assessment type");
                return Ok(());
            }
        };

        let assessment_data = envelope
            .get("payload")
            .filter(|v| is_truthy(v))
            .cloned()
            .unwrap_or_else(|| Value::Object(envelope.clone()));

        let result = store
            .update_one(
                CONVERSATIONS,
                &Filter::new().eq("conversationId", json!(conversation_id)),
                &UpdateDocument::new()
                    .set(format!("assessments.{assessment_key}"), assessment_data)
                    .set("updatedAt", json!(now_timestamp()))
                    .inc("version", 1),
                false,
            )
            .await?;

        tracing::info!(
            conversation_id = %conversation_id,
            assessment_key = %assessment_key,
            matched = result.matched_count,
            "Assessment updated"
        );

        Ok(())
    }
}

/// Appends an agent note on noticeboard_updated
pub struct NoticeboardUpdatedHandler;

#[async_trait]
impl EventHandler for NoticeboardUpdatedHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let envelope = raw_envelope(event)?;
        let conversation_id = conversation_id(envelope)?;

        tracing::info!(conversation_id = %conversation_id, "Processing noticeboard_updated");

        let agent_name = first_str(envelope, &["agentName", "agent_name"]).unwrap_or("unknown");
        let content = envelope.get("content").cloned().unwrap_or(json!(""));

        // Topic is the tail of "agent::Topic" style names
        let topic = agent_name.rsplit("::").next().unwrap_or(agent_name);

        let entry = json!({
            "agentName": agent_name,
            "topic": topic,
            "content": content,
            "timestamp": timestamp_or_now(envelope),
        });

        let result = store
            .update_one(
                CONVERSATIONS,
                &Filter::new().eq("conversationId", json!(conversation_id)),
                &UpdateDocument::new()
                    .push("noticeboard", entry)
                    .set("updatedAt", json!(now_timestamp()))
                    .inc("version", 1),
                false,
            )
            .await?;

        tracing::info!(
            conversation_id = %conversation_id,
            agent_name = %agent_name,
            matched = result.matched_count,
            "Noticeboard updated"
        );

        Ok(())
    }
}

/// Maps the decision onto the conversation status on final_decision
pub struct FinalDecisionHandler;

#[async_trait]
impl EventHandler for FinalDecisionHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let envelope = raw_envelope(event)?;
        let conversation_id = conversation_id(envelope)?;
        let decision = first_str(envelope, &["decision", "outcome"])
            .unwrap_or("")
            .to_uppercase();

        tracing::info!(
            conversation_id = %conversation_id,
            decision = %decision,
            "Processing final_decision"
        );

        let status = match decision.as_str() {
            "APPROVED" => "approved",
            "DECLINED" => "declined",
            "REFERRED" => "referred",
            _ => "hard_end",
        };

        let result = store
            .update_one(
                CONVERSATIONS,
                &Filter::new().eq("conversationId", json!(conversation_id)),
                &UpdateDocument::new()
                    .set("status", json!(status))
                    .set("finalDecision", json!(decision))
                    .set("updatedAt", json!(now_timestamp()))
                    .inc("version", 1),
                false,
            )
            .await?;

        tracing::info!(
            conversation_id = %conversation_id,
            status = %status,
            matched = result.matched_count,
            modified = result.modified_count,
            "Final decision recorded"
        );

        Ok(())
    }
}

/// Stores purpose and key facts on conversation_summary
pub struct ConversationSummaryHandler;

#[async_trait]
impl EventHandler for ConversationSummaryHandler {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError> {
        let envelope = raw_envelope(event)?;
        let conversation_id = conversation_id(envelope)?;

        tracing::info!(conversation_id = %conversation_id, "Processing conversation_summary");

        let source: &Map<String, Value> = payload_object(envelope).unwrap_or(envelope);
        let purpose = source
            .get("purpose")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let facts: Vec<Value> = source
            .get("facts")
            .and_then(Value::as_array)
            .map(|facts| facts.iter().map(|f| json!({"fact": f})).collect())
            .unwrap_or_default();

        let num_facts = facts.len();
        let result = store
            .update_one(
                CONVERSATIONS,
                &Filter::new().eq("conversationId", json!(conversation_id)),
                &UpdateDocument::new()
                    .set("purpose", json!(purpose))
                    .set("facts", Value::Array(facts))
                    .set("updatedAt", json!(now_timestamp()))
                    .inc("version", 1),
                false,
            )
            .await?;

        tracing::info!(
            conversation_id = %conversation_id,
            purpose = %purpose,
            num_facts = num_facts,
            matched = result.matched_count,
            "Conversation summary updated"
        );

        Ok(())
    }
}
