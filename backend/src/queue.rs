//! Inbound vote queue.
//!
//! The pipeline only relies on at-least-once delivery: a message handed out by
//! [`VoteQueue::receive`] stays owned by the queue until it is acked, and may be
//! delivered again (to this or another worker) if it is nacked or its lease
//! runs out. Two adapters ship here: an in-process queue for tests and local
//! runs, and a Postgres table queue leased with `FOR UPDATE SKIP LOCKED`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use shared::VoteEvent;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::config::PipelineConfig;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Unknown receipt {0}")]
    UnknownReceipt(i64),
}

/// One delivery attempt of a queued vote.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Producer-assigned dedup key, stable across redeliveries.
    pub delivery_id: String,
    pub event: VoteEvent,
    /// Handle for this attempt only. Once the message is handed out again,
    /// acking or nacking with an older receipt fails with `UnknownReceipt`.
    pub receipt: i64,
}

#[rocket::async_trait]
pub trait VoteQueue: Send + Sync {
    async fn publish(&self, delivery_id: &str, event: &VoteEvent) -> Result<(), QueueError>;

    /// Waits until a message is available.
    async fn receive(&self) -> Result<Delivery, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Hands the message back for redelivery.
    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Messages published but not yet acked.
    async fn pending(&self) -> Result<u64, QueueError>;
}

#[derive(Debug, Clone)]
struct QueuedVote {
    delivery_id: String,
    event: VoteEvent,
}

#[derive(Debug, Default)]
struct QueueState {
    next_receipt: i64,
    ready: VecDeque<QueuedVote>,
    in_flight: HashMap<i64, QueuedVote>,
    acked: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, QueueError> {
        self.state.lock().map_err(|e| {
            error!("Failed to acquire queue lock: {}", e);
            QueueError::Unavailable("queue lock poisoned".into())
        })
    }

    fn try_take(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.lock()?;
        let Some(vote) = state.ready.pop_front() else { return Ok(None) };

        state.next_receipt += 1;
        let receipt = state.next_receipt;
        state.in_flight.insert(receipt, vote.clone());

        Ok(Some(Delivery {
            delivery_id: vote.delivery_id,
            event: vote.event,
            receipt,
        }))
    }

    pub fn acked(&self) -> u64 {
        self.lock().map(|state| state.acked).unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().map(|state| state.in_flight.len()).unwrap_or(0)
    }
}

#[rocket::async_trait]
impl VoteQueue for InMemoryQueue {
    async fn publish(&self, delivery_id: &str, event: &VoteEvent) -> Result<(), QueueError> {
        self.lock()?.ready.push_back(QueuedVote {
            delivery_id: delivery_id.to_string(),
            event: event.clone(),
        });
        self.available.notify_one();
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery, QueueError> {
        loop {
            if let Some(delivery) = self.try_take()? {
                debug!(delivery_id = %delivery.delivery_id, receipt = delivery.receipt, "Received vote");
                return Ok(delivery);
            }
            self.available.notified().await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state
            .in_flight
            .remove(&delivery.receipt)
            .ok_or(QueueError::UnknownReceipt(delivery.receipt))?;
        state.acked += 1;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        {
            let mut state = self.lock()?;
            let vote = state
                .in_flight
                .remove(&delivery.receipt)
                .ok_or(QueueError::UnknownReceipt(delivery.receipt))?;
            state.ready.push_back(vote);
        }
        self.available.notify_one();
        Ok(())
    }

    async fn pending(&self) -> Result<u64, QueueError> {
        let state = self.lock()?;
        Ok((state.ready.len() + state.in_flight.len()) as u64)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    claim_id: i64,
    delivery_id: String,
    option_id: String,
    voter_token: String,
    submitted_at: OffsetDateTime,
}

/// Postgres table queue. A received message is hidden for the visibility
/// window; if it is neither acked nor nacked by then it becomes receivable
/// again under a fresh claim id.
#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
    visibility: Duration,
    poll: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool, config: &PipelineConfig) -> Self {
        Self {
            pool,
            visibility: config.queue_visibility,
            poll: config.queue_poll,
        }
    }

    async fn claim(&self) -> Result<Option<Delivery>, QueueError> {
        let row = sqlx::query_as::<_, QueueRow>(
            "UPDATE votes.vote_queue
             SET visible_at = NOW() + make_interval(secs => $1),
                 read_count = read_count + 1,
                 claim_id = nextval('votes.vote_queue_claim_seq')
             WHERE msg_id = (
                 SELECT msg_id FROM votes.vote_queue
                 WHERE visible_at <= NOW()
                 ORDER BY msg_id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING claim_id, delivery_id, option_id, voter_token, submitted_at",
        )
        .bind(self.visibility.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Delivery {
            delivery_id: row.delivery_id,
            event: VoteEvent {
                option_id: row.option_id,
                voter_token: row.voter_token,
                submitted_at: row.submitted_at,
            },
            receipt: row.claim_id,
        }))
    }
}

#[rocket::async_trait]
impl VoteQueue for PgQueue {
    async fn publish(&self, delivery_id: &str, event: &VoteEvent) -> Result<(), QueueError> {
        sqlx::query(
            "INSERT INTO votes.vote_queue (delivery_id, option_id, voter_token, submitted_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(delivery_id)
        .bind(&event.option_id)
        .bind(&event.voter_token)
        .bind(event.submitted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery, QueueError> {
        loop {
            if let Some(delivery) = self.claim().await? {
                debug!(delivery_id = %delivery.delivery_id, receipt = delivery.receipt, "Claimed vote");
                return Ok(delivery);
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM votes.vote_queue WHERE claim_id = $1")
            .bind(delivery.receipt)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownReceipt(delivery.receipt));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE votes.vote_queue SET visible_at = NOW(), claim_id = NULL WHERE claim_id = $1",
        )
        .bind(delivery.receipt)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownReceipt(delivery.receipt));
        }
        Ok(())
    }

    async fn pending(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM votes.vote_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_receive_waits_for_publish() {
        let queue = Arc::new(InMemoryQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!consumer.is_finished());

        queue.publish("d1", &VoteEvent::new("a", "voter-1")).await.unwrap();
        let delivery = consumer.await.unwrap().unwrap();
        assert_eq!(delivery.delivery_id, "d1");
        assert_eq!(delivery.event.option_id, "a");
    }

    #[tokio::test]
    async fn test_ack_and_nack() {
        let queue = InMemoryQueue::new();
        queue.publish("d1", &VoteEvent::new("a", "voter-1")).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 1);

        let first = queue.receive().await.unwrap();
        assert_eq!(queue.in_flight(), 1);
        queue.nack(&first).await.unwrap();

        let second = queue.receive().await.unwrap();
        assert_eq!(second.delivery_id, first.delivery_id);
        assert_ne!(second.receipt, first.receipt, "each attempt gets its own receipt");

        assert!(matches!(queue.ack(&first).await, Err(QueueError::UnknownReceipt(_))));
        assert!(matches!(queue.nack(&first).await, Err(QueueError::UnknownReceipt(_))));
        assert_eq!(queue.in_flight(), 1, "a stale receipt leaves the newer attempt alone");
        queue.ack(&second).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 0);
        assert_eq!(queue.acked(), 1);
    }
}
