use std::sync::Arc;

use rocket::response::stream::{Event, EventStream};
use rocket::tokio::select;
use rocket::{get, http::Status, post, serde::json::Json, Shutdown, State};
use shared::{
    parse_channel, validate_choice, validate_voter_token, HealthStatus, OptionId, SnapshotView,
    VoteAccepted, VoteEvent, VoteRequest,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::broadcast::Broadcaster;
use crate::error::ApiError;
use crate::health::PipelineHealth;
use crate::pipeline::Pipeline;
use crate::queue::VoteQueue;

pub struct AppState {
    pub options: Vec<OptionId>,
    pub queue: Arc<dyn VoteQueue>,
    pub broadcaster: Arc<Broadcaster>,
    pub health: Arc<PipelineHealth>,
}

impl AppState {
    pub fn new(options: Vec<OptionId>, queue: Arc<dyn VoteQueue>, pipeline: &Pipeline) -> Self {
        Self {
            options,
            queue,
            broadcaster: pipeline.broadcaster.clone(),
            health: pipeline.health.clone(),
        }
    }
}

#[rocket::options("/<_..>")]
pub async fn all_options() -> Status {
    Status::Ok
}

#[get("/options")]
pub fn list_options(state: &State<AppState>) -> Json<Vec<OptionId>> {
    Json(state.options.clone())
}

#[get("/results?<channel>")]
pub fn get_results(state: &State<AppState>, channel: Option<&str>) -> Result<Json<SnapshotView>, ApiError> {
    let channel = parse_channel(channel, &state.options)?;
    Ok(Json(state.broadcaster.latest().view(&channel)))
}

#[get("/results/stream?<channel>")]
pub fn stream_results(
    state: &State<AppState>,
    channel: Option<&str>,
    mut shutdown: Shutdown,
) -> Result<EventStream![], ApiError> {
    let mut subscription = state.broadcaster.subscribe(channel)?;
    info!(connection_id = %subscription.id(), "Result stream opened");

    Ok(EventStream! {
        loop {
            let snapshot = select! {
                next = subscription.next() => match next {
                    Some(snapshot) => snapshot,
                    None => break,
                },
                _ = &mut shutdown => break,
            };

            yield Event::json(&subscription.view(&snapshot))
                .event("snapshot")
                .id(snapshot.version.to_string());
        }
    })
}

#[get("/health")]
pub async fn health(state: &State<AppState>) -> Json<HealthStatus> {
    let queue_lag = match state.queue.pending().await {
        Ok(lag) => Some(lag),
        Err(e) => {
            warn!(error = %e, "Queue lag unavailable");
            None
        }
    };

    Json(state.health.status(queue_lag, state.broadcaster.subscriber_count()))
}

#[instrument(skip(state, request), fields(delivery_id))]
#[post("/vote", format = "json", data = "<request>")]
pub async fn cast_vote(
    state: &State<AppState>,
    request: Json<VoteRequest>,
) -> Result<(Status, Json<VoteAccepted>), ApiError> {
    let request = request.into_inner();
    validate_voter_token(&request.voter_token)?;
    let option = validate_choice(&request.option_id, &state.options)?;

    let delivery_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("delivery_id", delivery_id.as_str());

    let event = VoteEvent::new(option.as_str(), request.voter_token);
    state.queue.publish(&delivery_id, &event).await?;
    debug!(option = %option, "Vote queued");

    Ok((Status::Accepted, Json(VoteAccepted { delivery_id })))
}
