//! Event processor with transactional guarantees
//!
//! Guarantees:
//! - At-least-once delivery via consumer groups with manual acknowledgement
//! - Exactly-once effect via short-TTL deduplication keys
//! - No message loss via pending-list recovery on startup
//! - Dead letter queue for messages that exhaust their retries
//!
//! The loop is a serial pipeline: acknowledgement happens only after the
//! projection write succeeded and the dedup mark is in place, so a crash at
//! any point leaves the entry pending for the next consumer.

use crate::config::Config;
use crate::dlq;
use crate::envelope::{event_id_of, event_type_of, Envelope};
use crate::events::parse_event;
use crate::handlers::HandlerRegistry;
use chrono::Utc;
use projection_store::ProjectionStore;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_log::{StreamEntry, StreamError, StreamLog};
use tracing::Instrument;

/// Errors that stop the processor
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Consumer-group reader that drives events through sanitise → parse →
/// dispatch → dedup-mark → acknowledge.
pub struct EventProcessor {
    log: Arc<dyn StreamLog>,
    store: Arc<dyn ProjectionStore>,
    config: Config,
    registry: HandlerRegistry,
    consumer_id: String,
    running: AtomicBool,
}

impl EventProcessor {
    pub fn new(
        log: Arc<dyn StreamLog>,
        store: Arc<dyn ProjectionStore>,
        config: Config,
        registry: HandlerRegistry,
    ) -> Self {
        // Unique for the life of this process; the consumer group tracks
        // pending entries per consumer id
        let consumer_id = format!(
            "processor-{}-{}",
            std::process::id(),
            Utc::now().format("%Y%m%d%H%M%S")
        );
        Self {
            log,
            store,
            config,
            registry,
            consumer_id,
            running: AtomicBool::new(false),
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Set up consumer groups, recover pending entries, then read new
    /// entries until [`stop`](Self::stop) is called.
    pub async fn start(&self) -> Result<(), ProcessorError> {
        self.ensure_consumer_group(&self.config.inbox_stream).await?;
        self.ensure_consumer_group(&self.config.internal_stream)
            .await?;

        self.process_pending(&self.config.inbox_stream).await?;
        self.process_pending(&self.config.internal_stream).await?;

        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            consumer_id = %self.consumer_id,
            inbox_stream = %self.config.inbox_stream,
            internal_stream = %self.config.internal_stream,
            "Event processor started"
        );

        while self.running.load(Ordering::SeqCst) {
            self.process_new().await?;
        }

        tracing::info!(consumer_id = %self.consumer_id, "Event processor stopped");
        Ok(())
    }

    /// Request a stop; the blocking read observes the flag at the next
    /// block-timeout boundary and the in-flight entry completes naturally.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Shutdown requested");
    }

    /// Create the consumer group if it doesn't exist for the given stream.
    async fn ensure_consumer_group(&self, stream: &str) -> Result<(), ProcessorError> {
        match self.log.create_group(stream, &self.config.consumer_group).await {
            Ok(()) => {
                tracing::info!(
                    group = %self.config.consumer_group,
                    stream = %stream,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(StreamError::GroupExists(_)) => {
                tracing::debug!(
                    group = %self.config.consumer_group,
                    stream = %stream,
                    "Consumer group already exists"
                );
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Process entries from previous runs that were never acknowledged.
    async fn process_pending(&self, stream: &str) -> Result<(), ProcessorError> {
        tracing::info!(stream = %stream, "Processing pending messages");
        let mut processed = 0u64;

        loop {
            let pending = self
                .log
                .pending(stream, &self.config.consumer_group, self.config.batch_size)
                .await?;
            if pending.is_empty() {
                break;
            }

            for row in pending {
                let claimed = self
                    .log
                    .claim(
                        stream,
                        &self.config.consumer_group,
                        &self.consumer_id,
                        Duration::ZERO,
                        &[row.id.as_str()],
                    )
                    .await?;

                if let Some(entry) = claimed.into_iter().next() {
                    self.process_entry(stream, &entry, row.times_delivered).await;
                    processed += 1;
                }
            }
        }

        tracing::info!(stream = %stream, count = processed, "Pending messages processed");
        Ok(())
    }

    /// Read one batch of new entries from both input streams.
    async fn process_new(&self) -> Result<(), ProcessorError> {
        let streams = [
            self.config.inbox_stream.as_str(),
            self.config.internal_stream.as_str(),
        ];
        let batches = self
            .log
            .read_group(
                &self.config.consumer_group,
                &self.consumer_id,
                &streams,
                self.config.batch_size,
                Duration::from_millis(self.config.block_timeout_ms),
            )
            .await?;

        for (stream, entries) in batches {
            for entry in entries {
                self.process_entry(&stream, &entry, 1).await;
            }
        }
        Ok(())
    }

    /// Process a single entry.
    ///
    /// Acknowledgement only happens after a successful projection write
    /// (or when the entry is a duplicate, unroutable, or exhausted).
    /// Broker-side failures leave the entry pending for redelivery.
    async fn process_entry(&self, stream: &str, entry: &StreamEntry, delivery_count: u64) {
        let envelope: Envelope = entry
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();

        let event_type = event_type_of(&envelope).to_string();
        let event_id = event_id_of(&envelope, &entry.id);

        let span = tracing::info_span!(
            "process_event",
            message_id = %entry.id,
            event_type = %event_type,
            event_id = %event_id,
            stream = %stream,
            delivery_count = delivery_count
        );

        async {
            let dedup_key = format!("dedup:{event_id}");
            match self.log.exists(&dedup_key).await {
                Ok(true) => {
                    tracing::debug!("Duplicate event, skipping");
                    self.ack_entry(stream, &entry.id).await;
                    return;
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::error!(error = %error, "Dedup check failed, leaving entry for redelivery");
                    return;
                }
            }

            let parsed = match parse_event(&event_type, &envelope) {
                Ok(parsed) => parsed,
                Err(error) => {
                    self.handle_failure(stream, entry, delivery_count, &error.to_string())
                        .await;
                    return;
                }
            };

            let Some(handler) = self.registry.get(&event_type) else {
                tracing::warn!("No handler registered for event type");
                self.ack_entry(stream, &entry.id).await;
                return;
            };

            match handler.handle(self.store.as_ref(), &parsed).await {
                Ok(()) => {
                    let ttl = Duration::from_secs(self.config.dedup_ttl_seconds);
                    if let Err(error) = self.log.set_with_ttl(&dedup_key, "1", ttl).await {
                        tracing::error!(
                            error = %error,
                            "Failed to set dedup mark, leaving entry for redelivery"
                        );
                        return;
                    }
                    self.ack_entry(stream, &entry.id).await;
                    tracing::info!("Event processed successfully");
                }
                Err(error) => {
                    self.handle_failure(stream, entry, delivery_count, &error.to_string())
                        .await;
                }
            }
        }
        .instrument(span)
        .await;
    }

    /// Retry accounting: below the retry cap the entry is simply left
    /// un-acknowledged; at the cap it is quarantined and acknowledged so it
    /// stops redelivering.
    async fn handle_failure(
        &self,
        stream: &str,
        entry: &StreamEntry,
        delivery_count: u64,
        error: &str,
    ) {
        tracing::error!(error = %error, "Error processing message");

        if delivery_count < self.config.max_retries {
            return;
        }

        match dlq::move_to_dlq(self.log.as_ref(), &self.config.dlq_stream, entry, error).await {
            Ok(_) => {
                self.ack_entry(stream, &entry.id).await;
            }
            Err(dlq_error) => {
                tracing::error!(
                    error = %dlq_error,
                    "Failed to publish to DLQ, leaving entry for redelivery"
                );
            }
        }
    }

    async fn ack_entry(&self, stream: &str, id: &str) {
        if let Err(error) = self
            .log
            .ack(stream, &self.config.consumer_group, id)
            .await
        {
            tracing::error!(
                message_id = %id,
                error = %error,
                "Failed to acknowledge entry"
            );
        }
    }
}
