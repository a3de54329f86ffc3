use std::sync::Arc;

use backend::{
    config::PipelineConfig,
    pipeline::Pipeline,
    queue::{PgQueue, VoteQueue},
    routes::AppState,
    server, shutdown,
    store::{PgVoteStore, VoteStore},
    telemetry,
};
use rocket::fairing::AdHoc;
use shuttle_runtime::CustomError;
use sqlx::PgPool;
use tracing::info;

#[shuttle_runtime::main]
async fn rocket(
    #[shuttle_shared_db::Postgres] pool: PgPool,
    #[shuttle_runtime::Secrets] secret_store: shuttle_runtime::SecretStore,
) -> shuttle_rocket::ShuttleRocket {
    telemetry::init();
    info!("🚀 Starting live tally server");

    let config = PipelineConfig::load(|key| secret_store.get(key)).map_err(CustomError::new)?;
    info!(options = ?config.options, "📋 Ballot configured");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(CustomError::new)?;

    info!("📋 Migrations complete");

    let queue: Arc<dyn VoteQueue> = Arc::new(PgQueue::new(pool.clone(), &config));
    let store: Arc<dyn VoteStore> = Arc::new(PgVoteStore::new(pool));

    let (trigger, signal) = shutdown::channel();
    let pipeline = Pipeline::spawn(&config, queue.clone(), store, signal);
    let state = AppState::new(config.options.clone(), queue, &pipeline);

    let rocket = server::build(state).attach(AdHoc::on_shutdown("Pipeline shutdown", move |_| {
        Box::pin(async move {
            info!("🛑 Stopping pipeline");
            trigger.trigger();
            pipeline.join().await;
        })
    }));

    Ok(rocket.into())
}
