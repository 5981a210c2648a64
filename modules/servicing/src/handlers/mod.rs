//! Consumer-side event dispatch: handler trait, registry, and the
//! projection handlers for each event family.

pub mod account;
pub mod conversation;
pub mod customer;
pub mod writeoff;

use crate::events::ParsedEvent;
use async_trait::async_trait;
use chrono::Utc;
use projection_store::{ProjectionStore, StoreError};
use std::collections::HashMap;
use std::sync::Arc;

/// Collection the customer projections live in
pub const CUSTOMERS: &str = "customers";
/// Collection the loan-account projections live in
pub const LOAN_ACCOUNTS: &str = "loan-accounts";
/// Collection the conversation projections live in
pub const CONVERSATIONS: &str = "conversations";
/// Collection the write-off request projections live in
pub const WRITE_OFF_REQUESTS: &str = "write-off-requests";

/// Errors raised by projection handlers
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The event is missing data the projection cannot proceed without
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A projection handler for one event type.
///
/// Handlers are idempotent: invoking one twice with the same event leaves
/// the store in the state a single invocation produces. Handlers receive
/// either a typed family variant or the raw envelope and discriminate
/// internally, so the registry stays uniform.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        store: &dyn ProjectionStore,
        event: &ParsedEvent,
    ) -> Result<(), HandlerError>;
}

/// Mapping from event type to its projection handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a specific event type.
    pub fn register(&mut self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type.to_string(), handler);
        tracing::info!(event_type = %event_type, "Registered handler");
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registry wired with every handler the processor serves.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        // Account events
        let account_created = Arc::new(account::AccountCreatedHandler);
        registry.register("account.created.v1", account_created);
        registry.register("account.updated.v1", Arc::new(account::AccountUpdatedHandler));
        registry.register(
            "account.status_changed.v1",
            Arc::new(account::AccountStatusChangedHandler),
        );
        registry.register(
            "account.schedule.created.v1",
            Arc::new(account::ScheduleCreatedHandler),
        );
        registry.register(
            "account.schedule.updated.v1",
            Arc::new(account::ScheduleUpdatedHandler),
        );

        // Customer events: created/updated/changed share the merge handler
        let customer_changed = Arc::new(customer::CustomerChangedHandler);
        registry.register("customer.changed.v1", customer_changed.clone());
        registry.register("customer.created.v1", customer_changed.clone());
        registry.register("customer.updated.v1", customer_changed);
        registry.register(
            "customer.verified.v1",
            Arc::new(customer::CustomerVerifiedHandler),
        );

        // Conversation/chat events
        registry.register(
            "conversation_started",
            Arc::new(conversation::ConversationStartedHandler),
        );
        let utterance = Arc::new(conversation::UtteranceHandler);
        registry.register("user_input", utterance.clone());
        registry.register("assistant_response", utterance);
        registry.register(
            "applicationDetail_changed",
            Arc::new(conversation::ApplicationDetailChangedHandler),
        );
        let assessment = Arc::new(conversation::AssessmentHandler);
        registry.register("identityRisk_assessment", assessment.clone());
        registry.register("serviceability_assessment_results", assessment.clone());
        registry.register("fraudCheck_assessment", assessment);
        registry.register(
            "noticeboard_updated",
            Arc::new(conversation::NoticeboardUpdatedHandler),
        );
        registry.register(
            "final_decision",
            Arc::new(conversation::FinalDecisionHandler),
        );
        registry.register(
            "conversation_summary",
            Arc::new(conversation::ConversationSummaryHandler),
        );

        // Write-off events (CRM-originated, internal stream)
        registry.register(
            "writeoff.requested.v1",
            Arc::new(writeoff::WriteoffRequestedHandler),
        );
        registry.register(
            "writeoff.approved.v1",
            Arc::new(writeoff::WriteoffApprovedHandler),
        );
        registry.register(
            "writeoff.rejected.v1",
            Arc::new(writeoff::WriteoffRejectedHandler),
        );
        registry.register(
            "writeoff.cancelled.v1",
            Arc::new(writeoff::WriteoffCancelledHandler),
        );

        registry
    }
}

/// Current time in the format projections persist (RFC 3339 UTC).
pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}
