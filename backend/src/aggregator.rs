use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use shared::{AggregateSnapshot, OptionId};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::health::PipelineHealth;
use crate::shutdown::ShutdownSignal;
use crate::store::{StoreError, VoteStore};

/// Recomputes the tally from the store on a fixed interval.
///
/// Every successful tick produces a new version, even when the counts did not
/// move, so a viewer can tell a quiet ballot from a stalled engine. A failed
/// tick keeps serving the previous snapshot.
pub struct AggregationEngine {
    store: Arc<dyn VoteStore>,
    options: Vec<OptionId>,
    interval: Duration,
    current: Arc<AggregateSnapshot>,
    publisher: watch::Sender<Arc<AggregateSnapshot>>,
    health: Arc<PipelineHealth>,
}

impl AggregationEngine {
    pub fn new(
        store: Arc<dyn VoteStore>,
        config: &PipelineConfig,
        health: Arc<PipelineHealth>,
    ) -> (Self, watch::Receiver<Arc<AggregateSnapshot>>) {
        let initial = Arc::new(AggregateSnapshot::initial(&config.options));
        let (publisher, receiver) = watch::channel(initial.clone());

        let engine = Self {
            store,
            options: config.options.clone(),
            interval: config.aggregation_interval,
            current: initial,
            publisher,
            health,
        };
        (engine, receiver)
    }

    pub fn latest(&self) -> Arc<AggregateSnapshot> {
        self.current.clone()
    }

    /// Runs one aggregation and publishes the result.
    pub async fn tick(&mut self) -> Result<Arc<AggregateSnapshot>, StoreError> {
        let raw = match self.store.count_by_option().await {
            Ok(raw) => raw,
            Err(e) => {
                let stale = self.health.record_stale_tick();
                warn!(
                    error = %e,
                    stale_ticks = stale,
                    version = self.current.version,
                    "Aggregation failed, serving previous snapshot"
                );
                return Err(e);
            }
        };

        let counts: BTreeMap<OptionId, u64> = self
            .options
            .iter()
            .map(|opt| (opt.clone(), raw.get(opt.as_str()).copied().unwrap_or(0)))
            .collect();

        let unknown: Vec<&String> = raw
            .keys()
            .filter(|key| !self.options.iter().any(|opt| opt.as_str() == key.as_str()))
            .collect();
        if !unknown.is_empty() {
            warn!(?unknown, "Ignoring stored votes for options that are no longer configured");
        }

        let snapshot = Arc::new(AggregateSnapshot::from_counts(self.current.version + 1, counts));
        if snapshot.same_counts(&self.current) {
            debug!(version = snapshot.version, "Tally unchanged");
        } else {
            debug!(version = snapshot.version, total = snapshot.total, "Tally changed");
        }

        self.current = snapshot.clone();
        self.health.record_aggregation(snapshot.version, snapshot.computed_at);
        self.publisher.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "Aggregation engine started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // failures are logged and counted inside tick
                    let _ = self.tick().await;
                }
                _ = shutdown.wait() => break,
            }
        }

        info!(version = self.current.version, "Aggregation engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryVoteStore;
    use shared::validate_option_id;

    fn setup() -> (Arc<InMemoryVoteStore>, AggregationEngine, watch::Receiver<Arc<AggregateSnapshot>>, Arc<PipelineHealth>) {
        let store = Arc::new(InMemoryVoteStore::new());
        let health = Arc::new(PipelineHealth::new());
        let config = PipelineConfig::with_options(&["a", "b"]).unwrap();
        let (engine, receiver) = AggregationEngine::new(store.clone(), &config, health.clone());
        (store, engine, receiver, health)
    }

    #[tokio::test]
    async fn test_initial_snapshot_is_zeroed() {
        let (_store, engine, receiver, _health) = setup();
        let initial = receiver.borrow().clone();
        assert_eq!(initial.version, 0);
        assert_eq!(initial.total, 0);
        assert_eq!(initial.counts.len(), 2);
        assert_eq!(engine.latest(), initial);
    }

    #[tokio::test]
    async fn test_version_advances_even_when_unchanged() {
        let (store, mut engine, receiver, _health) = setup();
        let a = validate_option_id("a").unwrap();

        store.insert_vote_if_absent("d1", &a, "t1").await.unwrap();
        let first = engine.tick().await.unwrap();
        let second = engine.tick().await.unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert!(first.same_counts(&second));
        assert_eq!(second.count(&a), 1);
        assert_eq!(receiver.borrow().version, 2);
    }

    #[tokio::test]
    async fn test_store_outage_keeps_last_snapshot() {
        let (store, mut engine, receiver, health) = setup();
        let b = validate_option_id("b").unwrap();

        store.insert_vote_if_absent("d1", &b, "t1").await.unwrap();
        engine.tick().await.unwrap();

        store.fail_next_reads(2);
        assert!(engine.tick().await.is_err());
        assert!(engine.tick().await.is_err());
        assert_eq!(health.stale_ticks(), 2);
        assert_eq!(engine.latest().version, 1);
        assert_eq!(receiver.borrow().count(&b), 1);

        let recovered = engine.tick().await.unwrap();
        assert_eq!(recovered.version, 2);
        assert_eq!(health.stale_ticks(), 0);
    }

    #[tokio::test]
    async fn test_total_matches_counts_and_ignores_unknown_options() {
        let store = Arc::new(InMemoryVoteStore::new());
        let health = Arc::new(PipelineHealth::new());
        let wide = PipelineConfig::with_options(&["a", "b", "c"]).unwrap();
        let narrow = PipelineConfig::with_options(&["a", "b"]).unwrap();

        for (i, option) in wide.options.iter().enumerate() {
            store.insert_vote_if_absent(&format!("d{i}"), option, "t").await.unwrap();
        }

        let (mut engine, _receiver) = AggregationEngine::new(store.clone(), &narrow, health);
        let snapshot = engine.tick().await.unwrap();
        assert_eq!(snapshot.counts.len(), 2);
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.total, snapshot.counts.values().sum::<u64>());
    }
}
