//! Redis Streams-backed work queue (durable, at-least-once delivery).
//!
//! - `XADD` appends messages to a named stream
//! - `XREADGROUP` hands each message to one consumer within the group
//! - unacknowledged messages are found with `XPENDING` and reclaimed with
//!   `XCLAIM` once idle past the visibility timeout (crash recovery)
//! - `XACK` settles a delivery; `XLEN`/`XPENDING` drive introspection

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

use super::{Delivery, QueueError, QueueStats, ScanMessage, WorkQueue};

/// How long `XREADGROUP` blocks waiting for a new message.
const READ_BLOCK_MS: u64 = 1000;

/// How many pending entries to inspect per dequeue.
const PENDING_SCAN_COUNT: usize = 16;

#[derive(Clone)]
pub struct RedisStreamsQueue {
    conn: ConnectionManager,
    stream: String,
    group: String,
    visibility_timeout: Duration,
}

impl RedisStreamsQueue {
    /// Connect and ensure the stream + consumer group exist (idempotent).
    pub async fn connect(
        redis_url: &str,
        stream: impl Into<String>,
        group: impl Into<String>,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let queue = Self {
            conn,
            stream: stream.into(),
            group: group.into(),
            visibility_timeout,
        };
        queue.ensure_group().await?;
        Ok(queue)
    }

    /// `XGROUP CREATE ... MKSTREAM`; an existing group (BUSYGROUP) is fine.
    async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => {
                info!(stream = %self.stream, group = %self.group, "created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group = %self.group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(QueueError::Command(format!("XGROUP CREATE: {e}"))),
        }
    }

    /// Reclaim one delivery that has sat unacknowledged past the visibility
    /// timeout, regardless of which consumer originally held it.
    async fn claim_stale(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        // Extended XPENDING: [id, consumer, idle_ms, delivery_count] rows.
        let pending: Vec<(String, String, u64, u64)> = match redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(PENDING_SCAN_COUNT)
            .query_async(&mut conn)
            .await
        {
            Ok(rows) => rows,
            // An empty pending list can come back as a type the tuple
            // conversion rejects; treat conversion failures as "nothing".
            Err(_) => return Ok(None),
        };

        let min_idle_ms = self.visibility_timeout.as_millis() as u64;
        for (id, owner, idle_ms, delivered) in pending {
            if idle_ms < min_idle_ms {
                continue;
            }
            let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
                .arg(&self.stream)
                .arg(&self.group)
                .arg(consumer)
                .arg(min_idle_ms)
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::Command(format!("XCLAIM {id}: {e}")))?;

            // Another consumer may have won the claim in the meantime.
            let Some(entry) = claimed.into_iter().next() else {
                continue;
            };
            let (entry_id, fields) = parse_entry(&entry)?;
            let message = message_from_fields(&fields)?;
            warn!(
                delivery_id = %entry_id,
                previous_owner = %owner,
                delivery_count = delivered + 1,
                "reclaimed stale delivery"
            );
            return Ok(Some(Delivery {
                id: entry_id,
                message,
                delivery_count: (delivered + 1) as u32,
            }));
        }
        Ok(None)
    }

    /// Read one new message for this consumer group.
    async fn read_new(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(READ_BLOCK_MS)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XREADGROUP: {e}")))?;

        // Nil on block timeout: the stream is idle.
        let redis::Value::Bulk(streams) = reply else {
            return Ok(None);
        };
        for stream in streams {
            let redis::Value::Bulk(parts) = stream else { continue };
            let Some(redis::Value::Bulk(entries)) = parts.get(1) else {
                continue;
            };
            if let Some(entry) = entries.first() {
                let (id, fields) = parse_entry(entry)?;
                let message = message_from_fields(&fields)?;
                return Ok(Some(Delivery {
                    id,
                    message,
                    delivery_count: 1,
                }));
            }
        }
        Ok(None)
    }
}

/// Parse a `[id, [k1, v1, k2, v2, ...]]` stream entry.
fn parse_entry(entry: &redis::Value) -> Result<(String, HashMap<String, String>), QueueError> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(QueueError::Deserialization("invalid entry shape".into()));
    };
    let Some(redis::Value::Data(id)) = parts.first() else {
        return Err(QueueError::Deserialization("missing entry id".into()));
    };
    let id = String::from_utf8_lossy(id).to_string();

    let mut fields = HashMap::new();
    if let Some(redis::Value::Bulk(kvs)) = parts.get(1) {
        for pair in kvs.chunks(2) {
            if let [redis::Value::Data(k), redis::Value::Data(v)] = pair {
                fields.insert(
                    String::from_utf8_lossy(k).to_string(),
                    String::from_utf8_lossy(v).to_string(),
                );
            }
        }
    }
    Ok((id, fields))
}

fn message_from_fields(fields: &HashMap<String, String>) -> Result<ScanMessage, QueueError> {
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| QueueError::Deserialization(format!("missing field {name}")))
    };

    Ok(ScanMessage {
        job_id: field("job_id")?
            .parse()
            .map_err(|e| QueueError::Deserialization(format!("job_id: {e}")))?,
        digest: field("file_hash")?
            .parse()
            .map_err(|e| QueueError::Deserialization(format!("file_hash: {e}")))?,
        blob_path: field("file_path")?.clone(),
        file_size: field("file_size")?
            .parse()
            .map_err(|e| QueueError::Deserialization(format!("file_size: {e}")))?,
    })
}

#[async_trait]
impl WorkQueue for RedisStreamsQueue {
    async fn enqueue(&self, message: &ScanMessage) -> Result<String, QueueError> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("job_id")
            .arg(message.job_id.to_string())
            .arg("file_hash")
            .arg(message.digest.to_hex())
            .arg("file_path")
            .arg(&message.blob_path)
            .arg("file_size")
            .arg(message.file_size.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XADD: {e}")))?;

        info!(job_id = %message.job_id, delivery_id = %id, "job published to queue");
        Ok(id)
    }

    async fn dequeue(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        if let Some(delivery) = self.claim_stale(consumer).await? {
            return Ok(Some(delivery));
        }
        self.read_new(consumer).await
    }

    async fn ack(&self, delivery_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(delivery_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XACK {delivery_id}: {e}")))?;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let length: u64 = redis::cmd("XLEN")
            .arg(&self.stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XLEN: {e}")))?;

        // Summary XPENDING: [count, min-id, max-id, per-consumer counts].
        let pending = match redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .query_async::<_, redis::Value>(&mut conn)
            .await
        {
            Ok(redis::Value::Bulk(parts)) => match parts.first() {
                Some(redis::Value::Int(count)) => *count as u64,
                _ => 0,
            },
            Ok(_) => 0,
            Err(e) => return Err(QueueError::Command(format!("XPENDING: {e}"))),
        };

        Ok(QueueStats { length, pending })
    }
}
