//! # Stream Log Abstraction
//!
//! A platform-level abstraction over an append-only stream log with
//! consumer-group semantics (Redis-Streams style).
//!
//! ## Why This Lives in Tier 1
//!
//! The stream log is a **shared runtime capability**: the event processor
//! consumes it, and any module that quarantines failures publishes to it
//! (dead-letter streams are ordinary streams). Placing it in `platform/`
//! keeps the service modules free of broker-product dependencies and allows
//! a config-driven swap between a production broker and the in-memory
//! implementation used by tests and local development.
//!
//! ## Model
//!
//! A *stream* is an ordered sequence of entries, each a flat list of
//! string field/value pairs under a broker-assigned id. A *consumer group*
//! tracks, per stream, which entries have been delivered and which of those
//! are still un-acknowledged (the *pending list*). Delivery is
//! at-least-once: an entry stays pending until some consumer acknowledges
//! it, and a crashed consumer's pending entries can be *claimed* by another
//! consumer id.
//!
//! The broker host also provides a small TTL'd key-value namespace, used
//! for short-lived deduplication marks.
//!
//! ## Implementations
//!
//! - **MemoryStreamLog**: in-memory implementation for tests and local dev

mod memory;

pub use memory::MemoryStreamLog;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// A single entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Broker-assigned entry id, unique and ascending within the stream
    pub id: String,
    /// Flat field/value pairs in insertion order
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Look up a field value by key (first occurrence).
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// One row of a consumer group's pending list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Entry id awaiting acknowledgement
    pub id: String,
    /// Consumer id the entry is currently assigned to
    pub consumer: String,
    /// Number of times the entry has been delivered (reads + claims)
    pub times_delivered: u64,
}

/// Errors that can occur when using the stream log
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("consumer group already exists: {0}")]
    GroupExists(String),

    #[error("no such consumer group: {0}")]
    NoSuchGroup(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for stream log operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Append-only stream log with consumer-group delivery tracking.
///
/// All operations are async; implementations are expected to be cheap to
/// clone or shared behind `Arc<dyn StreamLog>`.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Create a consumer group on a stream, creating the stream if absent.
    ///
    /// Creation is not idempotent at the broker: a second create for the
    /// same `(stream, group)` returns [`StreamError::GroupExists`], which
    /// callers treat as success when setting up at startup.
    async fn create_group(&self, stream: &str, group: &str) -> StreamResult<()>;

    /// Append an entry to a stream and return its assigned id.
    async fn add(&self, stream: &str, fields: Vec<(String, String)>) -> StreamResult<String>;

    /// Read new (never-delivered) entries from the given streams on behalf
    /// of `consumer` within `group`.
    ///
    /// Returns up to `count` entries per stream. Entries returned here join
    /// the group's pending list assigned to `consumer` with
    /// `times_delivered = 1`. When no stream has new entries the call
    /// blocks up to `block` before returning an empty result.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<(String, Vec<StreamEntry>)>>;

    /// Scan a group's pending list in entry order, up to `count` rows.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> StreamResult<Vec<PendingEntry>>;

    /// Re-assign pending entries to `consumer`, provided they have been
    /// idle at least `min_idle`. Claimed entries have their delivery
    /// counter incremented and their data returned.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[&str],
    ) -> StreamResult<Vec<StreamEntry>>;

    /// Acknowledge an entry, removing it from the group's pending list.
    ///
    /// Returns the number of entries removed (0 when already acked).
    async fn ack(&self, stream: &str, group: &str, id: &str) -> StreamResult<u64>;

    /// Set a key in the broker-host key-value namespace with a TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StreamResult<()>;

    /// Check whether a key exists (and has not expired).
    async fn exists(&self, key: &str) -> StreamResult<bool>;
}

impl fmt::Debug for dyn StreamLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamLog")
    }
}
