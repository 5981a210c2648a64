//! Dead Letter Queue (DLQ) handling
//!
//! Entries whose handler has exhausted its retries are published to the
//! DLQ stream: the original envelope fields plus diagnostics, so operators
//! can inspect and replay them.

use chrono::Utc;
use stream_log::{StreamEntry, StreamLog, StreamResult};

/// Publish a failed entry to the DLQ stream.
///
/// The DLQ record is the original envelope fields plus
/// `original_message_id`, `error`, and `moved_at` (ISO-8601 UTC).
pub async fn move_to_dlq(
    log: &dyn StreamLog,
    dlq_stream: &str,
    entry: &StreamEntry,
    error: &str,
) -> StreamResult<String> {
    let mut fields = entry.fields.clone();
    fields.push(("original_message_id".to_string(), entry.id.clone()));
    fields.push(("error".to_string(), error.to_string()));
    fields.push(("moved_at".to_string(), Utc::now().to_rfc3339()));

    let dlq_id = log.add(dlq_stream, fields).await?;

    tracing::error!(
        original_message_id = %entry.id,
        dlq_stream = %dlq_stream,
        error = %error,
        "Event moved to DLQ after retries exhausted"
    );

    Ok(dlq_id)
}
