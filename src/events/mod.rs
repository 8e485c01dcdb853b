//! Storage event fabric.
//!
//! Two delivery modes, picked once at startup:
//! - durable: events go to a per-type stream and are consumed through a
//!   shared consumer group, acknowledged only after every local handler
//!   succeeded (at-least-once);
//! - fallback: handlers run in-process right away, best effort.

mod log;
mod redis_stream;

pub use self::log::{EventLog, EventLogError, LogEntry, MemoryEventLog};
pub use self::redis_stream::RedisEventLog;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EventsConfig;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    FileUploaded,
    FileUpdated,
    FileDeleted,
    FileRestored,
    FilePurged,
    FileDeduplicated,
    FileColdStorage,
    FileArchived,
    FileWarmed,
    QuotaWarning,
    QuotaExceeded,
    BandwidthExceeded,
}

impl EventType {
    pub const ALL: [EventType; 12] = [
        EventType::FileUploaded,
        EventType::FileUpdated,
        EventType::FileDeleted,
        EventType::FileRestored,
        EventType::FilePurged,
        EventType::FileDeduplicated,
        EventType::FileColdStorage,
        EventType::FileArchived,
        EventType::FileWarmed,
        EventType::QuotaWarning,
        EventType::QuotaExceeded,
        EventType::BandwidthExceeded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FileUploaded => "file-uploaded",
            EventType::FileUpdated => "file-updated",
            EventType::FileDeleted => "file-deleted",
            EventType::FileRestored => "file-restored",
            EventType::FilePurged => "file-purged",
            EventType::FileDeduplicated => "file-deduplicated",
            EventType::FileColdStorage => "file-cold-storage",
            EventType::FileArchived => "file-archived",
            EventType::FileWarmed => "file-warmed",
            EventType::QuotaWarning => "quota-warning",
            EventType::QuotaExceeded => "quota-exceeded",
            EventType::BandwidthExceeded => "bandwidth-exceeded",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub metadata: EventMetadata,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Registrations are keyed by (event type, name).
    fn name(&self) -> &str;
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Writes every event it sees to the log.
pub struct TracingHandler;

#[async_trait]
impl EventHandler for TracingHandler {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            request_id = event.metadata.request_id.as_deref().unwrap_or(""),
            data = %event.data,
            "Storage event"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Durable,
    Fallback,
}

struct Durable {
    log: Arc<dyn EventLog>,
    stream_prefix: String,
    group: String,
    consumer: String,
    batch_size: usize,
    poll_interval: Duration,
    claim_idle: Duration,
    max_deliveries: u64,
}

impl Durable {
    fn stream(&self, event_type: EventType) -> String {
        format!("{}:{}", self.stream_prefix, event_type.as_str())
    }
}

pub struct EventBus {
    source: String,
    durable: Option<Durable>,
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    /// In-process delivery only.
    pub fn fallback(source: &str) -> Self {
        Self {
            source: source.to_string(),
            durable: None,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn durable(log: Arc<dyn EventLog>, config: &EventsConfig, consumer: &str) -> Self {
        Self {
            source: config.source.clone(),
            durable: Some(Durable {
                log,
                stream_prefix: config.stream_prefix.clone(),
                group: config.consumer_group.clone(),
                consumer: consumer.to_string(),
                batch_size: config.batch_size.max(1),
                poll_interval: config.poll_interval,
                claim_idle: config.claim_idle,
                max_deliveries: config.max_deliveries.max(1),
            }),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Ping the broker once; durable if it answers within the connect timeout.
    pub async fn connect(config: &EventsConfig, consumer: &str) -> Self {
        let Some(ref url) = config.redis_url else {
            info!("No event broker configured, using in-process delivery");
            return Self::fallback(&config.source);
        };

        let log = match RedisEventLog::new(url, config.stream_max_len, config.connect_timeout) {
            Ok(log) => log,
            Err(e) => {
                warn!(error = %e, "Event broker misconfigured, using in-process delivery");
                return Self::fallback(&config.source);
            }
        };

        match tokio::time::timeout(config.connect_timeout, log.ping()).await {
            Ok(Ok(())) => {
                info!(
                    group = %config.consumer_group,
                    "Event broker reachable, using durable delivery"
                );
                Self::durable(Arc::new(log), config, consumer)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Event broker unreachable, using in-process delivery");
                Self::fallback(&config.source)
            }
            Err(_) => {
                warn!(
                    timeout = ?config.connect_timeout,
                    "Event broker ping timed out, using in-process delivery"
                );
                Self::fallback(&config.source)
            }
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        if self.durable.is_some() {
            DeliveryMode::Durable
        } else {
            DeliveryMode::Fallback
        }
    }

    /// Register a handler. Returns false if `(event_type, handler.name())`
    /// was already registered.
    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) -> bool {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let list = handlers.entry(event_type).or_default();
        if list.iter().any(|h| h.name() == handler.name()) {
            return false;
        }
        list.push(handler);
        true
    }

    fn handlers_for(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.get(&event_type).cloned().unwrap_or_default()
    }

    fn subscribed_types(&self) -> Vec<EventType> {
        let handlers = match self.handlers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(t, _)| *t)
            .collect()
    }

    /// Publish an event and return its id. Never fails.
    pub async fn publish(
        &self,
        event_type: EventType,
        data: serde_json::Value,
        request_id: Option<&str>,
    ) -> String {
        let event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            data,
            metadata: EventMetadata {
                timestamp: Utc::now(),
                source: self.source.clone(),
                request_id: request_id.map(str::to_string),
            },
        };

        if let Some(ref durable) = self.durable {
            let appended = match serde_json::to_string(&event) {
                Ok(payload) => durable
                    .log
                    .append(&durable.stream(event_type), &payload)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match appended {
                Ok(entry_id) => {
                    debug!(event_id = %event.id, %entry_id, %event_type, "Event appended");
                    metrics::EVENTS_PUBLISHED.with_label_values(&["durable"]).inc();
                    return event.id;
                }
                Err(e) => {
                    warn!(
                        event_id = %event.id,
                        %event_type,
                        error = %e,
                        "Event append failed, delivering in-process"
                    );
                    metrics::record_best_effort_failure("event_publish");
                }
            }
        }

        metrics::EVENTS_PUBLISHED.with_label_values(&["fallback"]).inc();
        self.dispatch(&event).await;
        event.id
    }

    /// Run every handler for the event; true if all succeeded.
    async fn dispatch(&self, event: &Event) -> bool {
        let mut ok = true;
        for handler in self.handlers_for(event.event_type) {
            if let Err(e) = handler.handle(event).await {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    handler = handler.name(),
                    error = %e,
                    "Event handler failed"
                );
                ok = false;
            }
        }
        ok
    }

    /// Process one batch for `event_type`: entries left idle by any
    /// consumer of the group first, then new ones. Returns the number of
    /// entries acknowledged.
    ///
    /// Entries whose handlers fail stay pending and are claimed again once
    /// idle; after `max_deliveries` attempts they are dropped.
    pub async fn poll(&self, event_type: EventType) -> Result<usize, EventLogError> {
        let Some(ref durable) = self.durable else {
            return Ok(0);
        };
        let stream = durable.stream(event_type);
        durable.log.ensure_group(&stream, &durable.group).await?;

        let claimed = durable
            .log
            .claim_idle(
                &stream,
                &durable.group,
                &durable.consumer,
                durable.claim_idle,
                durable.batch_size,
            )
            .await?;
        if !claimed.is_empty() {
            debug!(%stream, claimed = claimed.len(), "Claimed idle entries");
        }
        let mut acked = self.handle_entries(durable, &stream, claimed).await?;

        let fresh = durable
            .log
            .read_group(&stream, &durable.group, &durable.consumer, durable.batch_size)
            .await?;
        acked += self.handle_entries(durable, &stream, fresh).await?;
        Ok(acked)
    }

    async fn handle_entries(
        &self,
        durable: &Durable,
        stream: &str,
        entries: Vec<LogEntry>,
    ) -> Result<usize, EventLogError> {
        let mut done = Vec::new();
        for entry in entries {
            if entry.deliveries > durable.max_deliveries {
                error!(
                    %stream,
                    entry_id = %entry.id,
                    deliveries = entry.deliveries,
                    "Dropping event after repeated handler failures"
                );
                metrics::record_best_effort_failure("event_delivery");
                done.push(entry.id);
                continue;
            }
            match serde_json::from_str::<Event>(&entry.payload) {
                Ok(event) => {
                    if self.dispatch(&event).await {
                        done.push(entry.id);
                    }
                }
                Err(e) => {
                    error!(%stream, entry_id = %entry.id, error = %e, "Dropping undecodable event");
                    done.push(entry.id);
                }
            }
        }

        if !done.is_empty() {
            durable.log.ack(stream, &durable.group, &done).await?;
        }
        Ok(done.len())
    }

    /// Spawn one consumer loop per subscribed event type (durable mode only).
    /// Subscribe handlers before calling this.
    pub fn start_consumers(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(ref durable) = self.durable else {
            return Vec::new();
        };
        let interval = durable.poll_interval;

        self.subscribed_types()
            .into_iter()
            .map(|event_type| {
                let bus = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    info!(%event_type, "Event consumer started");
                    loop {
                        let handled = match bus.poll(event_type).await {
                            Ok(n) => n,
                            Err(e) => {
                                warn!(%event_type, error = %e, "Event poll failed");
                                0
                            }
                        };
                        if handled > 0 {
                            continue;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(interval) => {}
                        }
                    }
                    info!(%event_type, "Event consumer stopped");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_wire_names() {
        let event = Event {
            id: "e1".to_string(),
            event_type: EventType::QuotaWarning,
            data: serde_json::json!({ "ownerId": "u1" }),
            metadata: EventMetadata {
                timestamp: Utc::now(),
                source: "test".to_string(),
                request_id: Some("r1".to_string()),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "quota-warning");
        assert_eq!(json["metadata"]["requestId"], "r1");
    }
}
