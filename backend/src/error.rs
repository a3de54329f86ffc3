use rocket::http::Status;
use rocket::response::Responder;
use rocket::serde::json::Json;
use shared::{Error, ErrorCode, ValidationError};
use thiserror::Error;

use crate::broadcast::BroadcastError;
use crate::queue::QueueError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("Queue unavailable: {0}")]
    Queue(#[from] QueueError),
    #[error("Broadcaster is shutting down")]
    ShuttingDown,
}

impl From<BroadcastError> for ApiError {
    fn from(err: BroadcastError) -> Self {
        match err {
            BroadcastError::Channel(e) => ApiError::Invalid(e),
            BroadcastError::Closed => ApiError::ShuttingDown,
        }
    }
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::Invalid(_) => Status::BadRequest,
            ApiError::Queue(_) | ApiError::ShuttingDown => Status::ServiceUnavailable,
        }
    }

    pub fn body(&self) -> Error {
        match self {
            ApiError::Invalid(e) => e.clone().into(),
            ApiError::Queue(e) => Error::with_details(ErrorCode::Unavailable, "Vote could not be queued", e.to_string()),
            ApiError::ShuttingDown => Error::new(ErrorCode::Unavailable, self.to_string()),
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for ApiError {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'o> {
        let status = self.status();

        rocket::Response::build_from(Json(self.body()).respond_to(req)?)
            .status(status)
            .ok()
    }
}
