use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};
use xray_prediction::ModelService;

#[derive(Serialize, Deserialize)]
pub struct Health {
    pub name: String,
    pub api_version: String,
    pub model_version: String,
}

pub async fn healthcheck<M: ModelService>(
    State(state): State<SharedState<M>>,
) -> impl IntoResponse {
    Json(Health {
        name: state.project_name.clone(),
        api_version: env!("CARGO_PKG_VERSION").to_string(),
        model_version: state.model_version.clone(),
    })
}
