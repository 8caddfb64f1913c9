//! Work Queue: the durable hand-off channel between ingestion and the job
//! processors.
//!
//! Delivery is at-least-once within a named competing-consumer group: each
//! message goes to exactly one consumer at a time, and an unacknowledged
//! message becomes eligible for redelivery to another consumer after the
//! visibility timeout. Consumers must therefore process idempotently.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use filescan_core::{ContentDigest, JobId};

mod memory;
#[cfg(feature = "redis")]
mod redis_streams;

pub use memory::InMemoryWorkQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;

/// Queue error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("queue message error: {0}")]
    Deserialization(String),
}

/// The unit of queued work: a reference to the job plus everything the
/// processor needs to find the bytes without another ledger round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMessage {
    pub job_id: JobId,
    pub digest: ContentDigest,
    pub blob_path: String,
    pub file_size: u64,
}

/// One delivery of a message to one consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned id, passed back on acknowledgment.
    pub id: String,
    pub message: ScanMessage,
    /// How many times this message has been delivered (1 on first delivery).
    pub delivery_count: u32,
}

/// Operational introspection: stream length and unacknowledged count.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub length: u64,
    pub pending: u64,
}

/// Port over the durable stream.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a message; returns the broker-assigned id.
    async fn enqueue(&self, message: &ScanMessage) -> Result<String, QueueError>;

    /// Receive the next message for `consumer`: a stale unacknowledged
    /// delivery past the visibility timeout if one exists, otherwise a new
    /// message. `None` when the queue is idle.
    async fn dequeue(&self, consumer: &str) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a delivery, removing it from the pending set.
    async fn ack(&self, delivery_id: &str) -> Result<(), QueueError>;

    /// Length and pending counts for operational visibility.
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}
