use crate::{render::render_index, server::SharedState};
use axum::{extract::State, response::Html};
use xray_prediction::ModelService;

pub async fn index<M: ModelService>(State(state): State<SharedState<M>>) -> Html<String> {
    let action = format!("{}/predict_html", state.api_prefix);
    Html(render_index(&state.project_name, &action))
}
