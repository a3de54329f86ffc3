pub mod aggregator;
pub mod backoff;
pub mod broadcast;
pub mod catchers;
pub mod config;
pub mod cors;
pub mod error;
pub mod health;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub use shared::{models::*, validation::*};
