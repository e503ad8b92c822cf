mod error;
mod prediction;
mod preview;
mod render;
mod routes;
mod staging;
mod telemetry;

pub mod app;
pub mod config;
pub mod server;

pub use app::start_app;
pub use error::ApiError;
pub use telemetry::Metrics;
