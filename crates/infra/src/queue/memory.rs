//! In-memory queue with real visibility-timeout semantics, for dev/test.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::{Delivery, QueueError, QueueStats, ScanMessage, WorkQueue};

#[derive(Debug)]
struct InFlight {
    message: ScanMessage,
    delivery_count: u32,
    redeliver_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<(String, ScanMessage)>,
    in_flight: HashMap<String, InFlight>,
    next_id: u64,
}

/// Mutex-guarded queue mirroring the stream semantics the Redis
/// implementation gets from consumer groups: exactly one outstanding
/// delivery per message, redelivery after the visibility timeout, explicit
/// acknowledgment.
#[derive(Debug)]
pub struct InMemoryWorkQueue {
    state: Mutex<State>,
    visibility_timeout: Duration,
}

impl InMemoryWorkQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            visibility_timeout,
        }
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, message: &ScanMessage) -> Result<String, QueueError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.ready.push_back((id.clone(), message.clone()));
        debug!(job_id = %message.job_id, delivery_id = %id, "message enqueued");
        Ok(id)
    }

    async fn dequeue(&self, consumer: &str) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        // Stale unacknowledged deliveries first, like XCLAIM past min-idle.
        let stale = state
            .in_flight
            .iter()
            .find(|(_, f)| f.redeliver_at <= now)
            .map(|(id, _)| id.clone());
        if let Some(id) = stale {
            let entry = state.in_flight.get_mut(&id).unwrap();
            entry.delivery_count += 1;
            entry.redeliver_at = now + self.visibility_timeout;
            debug!(consumer, delivery_id = %id, count = entry.delivery_count, "redelivering stale message");
            return Ok(Some(Delivery {
                id,
                message: entry.message.clone(),
                delivery_count: entry.delivery_count,
            }));
        }

        let Some((id, message)) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.in_flight.insert(
            id.clone(),
            InFlight {
                message: message.clone(),
                delivery_count: 1,
                redeliver_at: now + self.visibility_timeout,
            },
        );
        Ok(Some(Delivery {
            id,
            message,
            delivery_count: 1,
        }))
    }

    async fn ack(&self, delivery_id: &str) -> Result<(), QueueError> {
        self.state.lock().unwrap().in_flight.remove(delivery_id);
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().unwrap();
        Ok(QueueStats {
            length: (state.ready.len() + state.in_flight.len()) as u64,
            pending: state.in_flight.len() as u64,
        })
    }
}
