use projection_store::{Document, Filter, ProjectionStore};
use servicing_processor::envelope::event_type_of;
use servicing_processor::events::parse_event;
use servicing_processor::handlers::{HandlerError, HandlerRegistry};
use serde_json::Value;

/// Parse an envelope and dispatch it through the default registry, the way
/// the processor loop does once an entry clears deduplication.
pub async fn apply_event(
    store: &dyn ProjectionStore,
    envelope: Value,
) -> Result<(), HandlerError> {
    let envelope = envelope
        .as_object()
        .cloned()
        .expect("test envelope must be a JSON object");
    let event_type = event_type_of(&envelope).to_string();
    let parsed = parse_event(&event_type, &envelope).expect("envelope should parse");
    let handler = HandlerRegistry::with_defaults()
        .get(&event_type)
        .unwrap_or_else(|| panic!("no handler registered for {event_type}"));
    handler.handle(store, &parsed).await
}

/// Fetch the single document keyed by `field == value`.
pub async fn find_by(
    store: &dyn ProjectionStore,
    collection: &str,
    field: &str,
    value: &str,
) -> Option<Document> {
    store
        .find_one(collection, &Filter::new().eq(field, Value::from(value)))
        .await
        .expect("store lookup should succeed")
}
