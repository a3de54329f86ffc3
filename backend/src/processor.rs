use std::sync::Arc;
use std::time::Duration;

use shared::{validate_choice, validate_voter_token, OptionId, ValidationError};
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, RetryState};
use crate::config::{PipelineConfig, RetryPolicy};
use crate::health::PipelineHealth;
use crate::queue::{Delivery, VoteQueue};
use crate::shutdown::ShutdownSignal;
use crate::store::VoteStore;

/// What happened to one delivery. Every variant has acked or nacked it
/// exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Accepted,
    Duplicate,
    /// Malformed input, acked and discarded.
    Rejected(ValidationError),
    /// Non-transient store failure, handed back to the queue.
    Requeued,
    /// Shutdown arrived before the write committed; handed back to the queue.
    Interrupted,
}

/// Drains the vote queue into the durable store.
pub struct VoteProcessor {
    queue: Arc<dyn VoteQueue>,
    store: Arc<dyn VoteStore>,
    options: Vec<OptionId>,
    retry: RetryPolicy,
    health: Arc<PipelineHealth>,
}

impl VoteProcessor {
    pub fn new(
        queue: Arc<dyn VoteQueue>,
        store: Arc<dyn VoteStore>,
        config: &PipelineConfig,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            queue,
            store,
            options: config.options.clone(),
            retry: config.retry,
            health,
        }
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        info!(options = self.options.len(), "Vote processor started");

        // paces redelivery of votes the store keeps refusing
        let mut requeues = Backoff::new(self.retry);

        while let Some(delivery) = self.next_delivery(&mut shutdown).await {
            match self.process(delivery, &mut shutdown).await {
                Outcome::Interrupted => break,
                Outcome::Requeued => {
                    let delay = self.on_failure(&mut requeues, "vote write", &"store refused the write");
                    if shutdown.sleep(delay).await {
                        break;
                    }
                    requeues.resume();
                }
                Outcome::Accepted | Outcome::Duplicate => {
                    if requeues.on_success() {
                        info!("Store accepting writes again");
                        self.health.set_processor_degraded(false);
                    }
                }
                Outcome::Rejected(_) => {}
            }
        }

        info!("Vote processor stopped");
    }

    /// Waits for the next delivery, retrying queue failures. `None` on shutdown.
    pub async fn next_delivery(&self, shutdown: &mut ShutdownSignal) -> Option<Delivery> {
        let mut backoff = Backoff::new(self.retry);

        loop {
            let received = tokio::select! {
                received = self.queue.receive() => received,
                _ = shutdown.wait() => return None,
            };

            match received {
                Ok(delivery) => {
                    if backoff.on_success() {
                        info!("Queue reachable again");
                        self.health.set_processor_degraded(false);
                    }
                    return Some(delivery);
                }
                Err(e) => {
                    let delay = self.on_failure(&mut backoff, "queue receive", &e);
                    if shutdown.sleep(delay).await {
                        return None;
                    }
                    backoff.resume();
                }
            }
        }
    }

    pub async fn process(&self, delivery: Delivery, shutdown: &mut ShutdownSignal) -> Outcome {
        let option = match self.validate(&delivery) {
            Ok(option) => option,
            Err(e) => {
                warn!(delivery_id = %delivery.delivery_id, error = %e, "Discarding malformed vote");
                self.health.record_rejected();
                self.acknowledge(&delivery).await;
                return Outcome::Rejected(e);
            }
        };

        let mut backoff = Backoff::new(self.retry);
        loop {
            let written = self
                .store
                .insert_vote_if_absent(&delivery.delivery_id, &option, &delivery.event.voter_token)
                .await;

            match written {
                Ok(result) => {
                    if backoff.on_success() {
                        info!(delivery_id = %delivery.delivery_id, "Store reachable again");
                        self.health.set_processor_degraded(false);
                    }

                    let outcome = if result.inserted {
                        debug!(delivery_id = %delivery.delivery_id, option = %option, "Vote recorded");
                        self.health.record_accepted();
                        Outcome::Accepted
                    } else {
                        debug!(delivery_id = %delivery.delivery_id, "Duplicate delivery ignored");
                        self.health.record_duplicate();
                        Outcome::Duplicate
                    };

                    self.acknowledge(&delivery).await;
                    return outcome;
                }
                Err(e) if e.is_transient() => {
                    let delay = self.on_failure(&mut backoff, "vote write", &e);
                    if shutdown.sleep(delay).await {
                        self.release(&delivery).await;
                        return Outcome::Interrupted;
                    }
                    backoff.resume();
                }
                Err(e) => {
                    error!(delivery_id = %delivery.delivery_id, error = %e, "Vote write failed, returning to queue");
                    self.release(&delivery).await;
                    return Outcome::Requeued;
                }
            }
        }
    }

    fn validate(&self, delivery: &Delivery) -> Result<OptionId, ValidationError> {
        validate_voter_token(&delivery.event.voter_token)?;
        validate_choice(&delivery.event.option_id, &self.options)
    }

    fn on_failure(&self, backoff: &mut Backoff, operation: &str, error: &dyn std::fmt::Display) -> Duration {
        self.health.record_retry();

        match backoff.on_failure() {
            RetryState::BackingOff { attempt, delay } => {
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %error, "Operation failed, backing off");
                delay
            }
            RetryState::Degraded { attempt, delay } => {
                if attempt == self.retry.max_attempts {
                    error!(operation, attempt, error = %error, "Retry budget exhausted, processor degraded");
                    self.health.set_processor_degraded(true);
                } else {
                    warn!(operation, attempt, error = %error, "Still failing while degraded");
                }
                delay
            }
            RetryState::Attempting { .. } => Duration::ZERO,
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) {
        // a lost ack means redelivery, which the dedup key absorbs
        if let Err(e) = self.queue.ack(delivery).await {
            warn!(delivery_id = %delivery.delivery_id, error = %e, "Failed to ack delivery");
        }
    }

    async fn release(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.nack(delivery).await {
            warn!(delivery_id = %delivery.delivery_id, error = %e, "Failed to nack delivery");
        }
    }
}
