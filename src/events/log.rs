//! Append-only event logs with consumer-group cursors.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Event log unreachable: {0}")]
    Unavailable(String),
    #[error("Event log error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: String,
    pub payload: String,
    /// How many times the entry has been handed to a consumer, this time included.
    pub deliveries: u64,
}

/// A set of ordered streams read through named consumer groups.
///
/// Entries handed to a consumer stay pending until acknowledged. Pending
/// entries left idle by any consumer (a crashed process, a failed handler)
/// are taken over with [`EventLog::claim_idle`].
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn ping(&self) -> Result<(), EventLogError>;
    async fn append(&self, stream: &str, payload: &str) -> Result<String, EventLogError>;
    /// Create the group at the start of the stream; existing groups are kept.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), EventLogError>;
    /// Entries never delivered to the group.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>, EventLogError>;
    /// Reassign up to `count` entries pending for at least `min_idle`, under
    /// any consumer, to `consumer`. Claiming resets their idle time.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>, EventLogError>;
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), EventLogError>;
}

// ============================================================================
// In-memory log
// ============================================================================

struct Delivery {
    consumer: String,
    at: Instant,
    count: u64,
}

#[derive(Default)]
struct GroupState {
    next_index: usize,
    pending: BTreeMap<u64, Delivery>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(u64, String)>,
    groups: HashMap<String, GroupState>,
}

/// Process-local [`EventLog`] with the same delivery semantics as a
/// Redis stream. Can be switched offline to simulate a broker outage.
pub struct MemoryEventLog {
    streams: Mutex<HashMap<String, StreamState>>,
    next_id: AtomicU64,
    online: AtomicBool,
    acks: AtomicU64,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            online: AtomicBool::new(true),
            acks: AtomicU64::new(0),
        }
    }
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Total entries acknowledged across all streams and groups.
    pub fn ack_count(&self) -> u64 {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .ok()
            .and_then(|streams| {
                streams
                    .get(stream)
                    .and_then(|s| s.groups.get(group))
                    .map(|g| g.pending.len())
            })
            .unwrap_or(0)
    }

    /// Pending entries currently assigned to `consumer`.
    pub fn pending_for(&self, stream: &str, group: &str, consumer: &str) -> usize {
        self.streams
            .lock()
            .ok()
            .and_then(|streams| {
                streams.get(stream).and_then(|s| s.groups.get(group)).map(|g| {
                    g.pending
                        .values()
                        .filter(|d| d.consumer == consumer)
                        .count()
                })
            })
            .unwrap_or(0)
    }

    pub fn len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .ok()
            .and_then(|streams| streams.get(stream).map(|s| s.entries.len()))
            .unwrap_or(0)
    }

    fn check_online(&self) -> Result<(), EventLogError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EventLogError::Unavailable("memory log is offline".to_string()))
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, StreamState>>, EventLogError> {
        self.streams
            .lock()
            .map_err(|e| EventLogError::Backend(e.to_string()))
    }
}

fn parse_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn ping(&self) -> Result<(), EventLogError> {
        self.check_online()
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<String, EventLogError> {
        self.check_online()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut streams = self.lock()?;
        streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .push((id, payload.to_string()));
        Ok(format!("{id}-0"))
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), EventLogError> {
        self.check_online()?;
        let mut streams = self.lock()?;
        streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>, EventLogError> {
        self.check_online()?;
        let mut streams = self.lock()?;
        let Some(state) = streams.get_mut(stream) else {
            return Err(EventLogError::Backend(format!("no such stream: {stream}")));
        };
        let StreamState { entries, groups } = state;
        let Some(cursor) = groups.get_mut(group) else {
            return Err(EventLogError::Backend(format!("no such group: {group}")));
        };

        let mut delivered = Vec::new();
        while cursor.next_index < entries.len() && delivered.len() < count {
            let (id, ref payload) = entries[cursor.next_index];
            cursor.pending.insert(
                id,
                Delivery {
                    consumer: consumer.to_string(),
                    at: Instant::now(),
                    count: 1,
                },
            );
            delivered.push(LogEntry {
                id: format!("{id}-0"),
                payload: payload.clone(),
                deliveries: 1,
            });
            cursor.next_index += 1;
        }
        Ok(delivered)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>, EventLogError> {
        self.check_online()?;
        let mut streams = self.lock()?;
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let StreamState { entries, groups } = state;
        let Some(cursor) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (id, delivery) in cursor.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(delivery.at) < min_idle {
                continue;
            }
            let Some((_, payload)) = entries.iter().find(|(eid, _)| eid == id) else {
                continue;
            };
            delivery.consumer = consumer.to_string();
            delivery.at = now;
            delivery.count += 1;
            claimed.push(LogEntry {
                id: format!("{id}-0"),
                payload: payload.clone(),
                deliveries: delivery.count,
            });
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), EventLogError> {
        self.check_online()?;
        let mut streams = self.lock()?;
        if let Some(cursor) = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            for id in ids.iter().filter_map(|id| parse_id(id)) {
                if cursor.pending.remove(&id).is_some() {
                    self.acks.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }
}
