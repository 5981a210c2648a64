//! In-memory implementation of the StreamLog trait for testing and development

use crate::{PendingEntry, StreamEntry, StreamError, StreamLog, StreamResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// StreamLog implementation backed by process memory
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need fast, isolated brokers
///
/// Semantics follow the consumer-group contract: entries delivered via
/// `read_group` join the pending list until acknowledged; `claim` hands a
/// pending entry to another consumer and bumps its delivery counter; the
/// key-value namespace honours TTLs against a monotonic clock.
///
/// # Example
/// ```rust
/// use stream_log::{MemoryStreamLog, StreamLog};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = MemoryStreamLog::new();
/// log.create_group("inbox", "workers").await?;
/// log.add("inbox", vec![("typ".into(), "ping".into())]).await?;
///
/// let batches = log
///     .read_group("workers", "worker-1", &["inbox"], 10, Duration::from_millis(10))
///     .await?;
/// let (stream, entries) = &batches[0];
/// assert_eq!(stream, "inbox");
/// log.ack("inbox", "workers", &entries[0].id).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryStreamLog {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    seq: Arc<AtomicU64>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    kv: HashMap<String, KvEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    // Cursor into `entries`: everything before it has been delivered
    next_index: usize,
    pending: HashMap<String, PendingState>,
}

struct PendingState {
    consumer: String,
    times_delivered: u64,
    entry_index: usize,
    last_delivered: Instant,
}

struct KvEntry {
    #[allow(dead_code)]
    value: String,
    expires_at: Instant,
}

impl MemoryStreamLog {
    /// Create a new, empty in-memory stream log
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StreamResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StreamError::Backend("stream log lock poisoned".to_string()))
    }

    fn next_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        format!("{millis}-{seq}")
    }
}

#[async_trait]
impl StreamLog for MemoryStreamLog {
    async fn create_group(&self, stream: &str, group: &str) -> StreamResult<()> {
        let mut inner = self.lock()?;
        let state = inner.streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Err(StreamError::GroupExists(format!("{group} on {stream}")));
        }
        state.groups.insert(group.to_string(), GroupState::default());
        Ok(())
    }

    async fn add(&self, stream: &str, fields: Vec<(String, String)>) -> StreamResult<String> {
        let id = self.next_id();
        {
            let mut inner = self.lock()?;
            let state = inner.streams.entry(stream.to_string()).or_default();
            state.entries.push(StreamEntry {
                id: id.clone(),
                fields,
            });
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<(String, Vec<StreamEntry>)>> {
        let deadline = Instant::now() + block;
        loop {
            // Register for wakeups before checking, so an `add` racing with
            // the check cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock()?;
                let mut out = Vec::new();
                for stream in streams {
                    let state = inner
                        .streams
                        .get_mut(*stream)
                        .ok_or_else(|| StreamError::NoSuchGroup(format!("{group} on {stream}")))?;
                    let StreamState { entries, groups } = state;
                    let group_state = groups
                        .get_mut(group)
                        .ok_or_else(|| StreamError::NoSuchGroup(format!("{group} on {stream}")))?;

                    let mut batch = Vec::new();
                    while group_state.next_index < entries.len() && batch.len() < count {
                        let idx = group_state.next_index;
                        let entry = entries[idx].clone();
                        group_state.pending.insert(
                            entry.id.clone(),
                            PendingState {
                                consumer: consumer.to_string(),
                                times_delivered: 1,
                                entry_index: idx,
                                last_delivered: Instant::now(),
                            },
                        );
                        group_state.next_index += 1;
                        batch.push(entry);
                    }
                    if !batch.is_empty() {
                        out.push((stream.to_string(), batch));
                    }
                }
                if !out.is_empty() {
                    return Ok(out);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> StreamResult<Vec<PendingEntry>> {
        let inner = self.lock()?;
        let Some(state) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get(group) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<(&String, &PendingState)> = group_state.pending.iter().collect();
        rows.sort_by_key(|(_, p)| p.entry_index);
        Ok(rows
            .into_iter()
            .take(count)
            .map(|(id, p)| PendingEntry {
                id: id.clone(),
                consumer: p.consumer.clone(),
                times_delivered: p.times_delivered,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[&str],
    ) -> StreamResult<Vec<StreamEntry>> {
        let mut inner = self.lock()?;
        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::NoSuchGroup(format!("{group} on {stream}")))?;
        let StreamState { entries, groups } = state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| StreamError::NoSuchGroup(format!("{group} on {stream}")))?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for id in ids {
            if let Some(p) = group_state.pending.get_mut(*id) {
                if now.duration_since(p.last_delivered) < min_idle {
                    continue;
                }
                p.consumer = consumer.to_string();
                p.times_delivered += 1;
                p.last_delivered = now;
                claimed.push(entries[p.entry_index].clone());
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> StreamResult<u64> {
        let mut inner = self.lock()?;
        let removed = inner
            .streams
            .get_mut(stream)
            .and_then(|state| state.groups.get_mut(group))
            .map(|group_state| group_state.pending.remove(id).is_some())
            .unwrap_or(false);
        Ok(u64::from(removed))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StreamResult<()> {
        let mut inner = self.lock()?;
        inner.kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> StreamResult<bool> {
        let mut inner = self.lock()?;
        match inner.kv.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(true),
            Some(_) => {
                inner.kv.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}
