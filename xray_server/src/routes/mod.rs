mod health;
mod home;
mod metrics;
mod predict;
mod predict_html;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};
use xray_prediction::ModelService;

/// Routes mounted under the API prefix.
pub fn api_routes<M: ModelService>() -> Router<SharedState<M>> {
    Router::new()
        .route("/health", get(health::healthcheck::<M>))
        .route("/predict", post(predict::predict::<M>))
        .route("/predict_html", post(predict_html::predict_html::<M>))
}

pub fn root_routes<M: ModelService>() -> Router<SharedState<M>> {
    Router::new()
        .route("/", get(home::index::<M>))
        .route("/metrics", get(metrics::metrics_handler::<M>))
}
