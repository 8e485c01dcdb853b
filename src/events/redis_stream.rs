//! Redis Streams event log.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::streams::{
    StreamClaimReply, StreamMaxlen, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;

use super::log::{EventLog, EventLogError, LogEntry};

const PAYLOAD_FIELD: &str = "event";

pub struct RedisEventLog {
    pool: Pool,
    max_len: usize,
}

impl RedisEventLog {
    pub fn new(url: &str, max_len: usize, timeout: Duration) -> Result<Self, EventLogError> {
        let pool = Config::from_url(url)
            .builder()
            .map(|b| {
                b.max_size(8)
                    .wait_timeout(Some(timeout))
                    .create_timeout(Some(timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| EventLogError::Unavailable(e.to_string()))?
            .map_err(|e| EventLogError::Unavailable(e.to_string()))?;

        Ok(Self { pool, max_len })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, EventLogError> {
        self.pool
            .get()
            .await
            .map_err(|e| EventLogError::Unavailable(e.to_string()))
    }
}

fn backend(e: redis::RedisError) -> EventLogError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
        EventLogError::Unavailable(e.to_string())
    } else {
        EventLogError::Backend(e.to_string())
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn ping(&self) -> Result<(), EventLogError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<String, EventLogError> {
        let mut conn = self.conn().await?;
        conn.xadd_maxlen(
            stream,
            StreamMaxlen::Approx(self.max_len),
            "*",
            &[(PAYLOAD_FIELD, payload)],
        )
        .await
        .map_err(backend)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), EventLogError> {
        let mut conn = self.conn().await?;
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(backend(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<LogEntry>, EventLogError> {
        let mut conn = self.conn().await?;
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(backend)?;

        let entries = reply
            .map(|r| r.keys)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| LogEntry {
                payload: entry.get::<String>(PAYLOAD_FIELD).unwrap_or_default(),
                id: entry.id,
                deliveries: 1,
            })
            .collect();
        Ok(entries)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<LogEntry>, EventLogError> {
        let mut conn = self.conn().await?;
        let min_idle_ms = min_idle.as_millis() as u64;

        // XPENDING carries the delivery counts that XAUTOCLAIM does not.
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let deliveries: HashMap<String, u64> = pending
            .ids
            .iter()
            .map(|p| (p.id.clone(), p.times_delivered as u64 + 1))
            .collect();
        let ids: Vec<&str> = pending.ids.iter().map(|p| p.id.as_str()).collect();

        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &ids)
            .await
            .map_err(backend)?;

        let entries = claimed
            .ids
            .into_iter()
            .map(|entry| LogEntry {
                payload: entry.get::<String>(PAYLOAD_FIELD).unwrap_or_default(),
                deliveries: deliveries.get(&entry.id).copied().unwrap_or(1),
                id: entry.id,
            })
            .collect();
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), EventLogError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: i64 = conn.xack(stream, group, ids).await.map_err(backend)?;
        Ok(())
    }
}
