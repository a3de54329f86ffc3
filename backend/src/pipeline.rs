use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::aggregator::AggregationEngine;
use crate::broadcast::Broadcaster;
use crate::config::PipelineConfig;
use crate::health::PipelineHealth;
use crate::processor::VoteProcessor;
use crate::queue::VoteQueue;
use crate::shutdown::ShutdownSignal;
use crate::store::VoteStore;

/// The three background tasks and the handles the HTTP layer needs.
pub struct Pipeline {
    pub broadcaster: Arc<Broadcaster>,
    pub health: Arc<PipelineHealth>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pipeline {
    pub fn spawn(
        config: &PipelineConfig,
        queue: Arc<dyn VoteQueue>,
        store: Arc<dyn VoteStore>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let health = Arc::new(PipelineHealth::new());

        let (engine, snapshots) = AggregationEngine::new(store.clone(), config, health.clone());
        let broadcaster = Arc::new(Broadcaster::new(
            engine.latest(),
            config.options.clone(),
            config.subscriber_buffer,
        ));
        let processor = VoteProcessor::new(queue, store, config, health.clone());

        let tasks = vec![
            ("processor", tokio::spawn(processor.run(shutdown.clone()))),
            ("aggregator", tokio::spawn(engine.run(shutdown.clone()))),
            ("broadcaster", tokio::spawn(broadcaster.clone().run(snapshots, shutdown))),
        ];
        info!("Pipeline started");

        Self {
            broadcaster,
            health,
            tasks,
        }
    }

    /// Waits for every task to finish. Call after triggering shutdown.
    pub async fn join(self) {
        let names: Vec<&'static str> = self.tasks.iter().map(|(name, _)| *name).collect();
        let results = futures::future::join_all(self.tasks.into_iter().map(|(_, task)| task)).await;

        for (name, result) in names.into_iter().zip(results) {
            if let Err(e) = result {
                error!(task = name, error = %e, "Pipeline task failed");
            }
        }
        info!("Pipeline stopped");
    }
}
