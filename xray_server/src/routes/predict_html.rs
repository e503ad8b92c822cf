use crate::{
    error::ApiError,
    prediction::{classify_upload, read_upload, RequestTrace, Upload},
    render::{render_error, render_report, ReportView},
    server::SharedState,
};
use axum::{
    extract::{Multipart, State},
    response::{Html, IntoResponse, Response},
};
use tracing::instrument;
use xray_prediction::ModelService;

const ROUTE: &str = "predict_html";

#[instrument(skip(state, multipart))]
pub async fn predict_html<M: ModelService>(
    State(state): State<SharedState<M>>,
    multipart: Multipart,
) -> Response {
    let mut trace = RequestTrace::start(ROUTE, &state.metrics);

    match report(&state, multipart, &mut trace).await {
        Ok(html) => {
            trace.responded("completed");
            Html(html).into_response()
        }
        Err(err) => {
            trace.failed(&err);
            let html = render_error(&state.project_name, &err.message());
            (err.status(), Html(html)).into_response()
        }
    }
}

async fn report<M: ModelService>(
    state: &SharedState<M>,
    multipart: Multipart,
    trace: &mut RequestTrace<'_>,
) -> Result<String, ApiError> {
    let upload = read_upload(multipart).await?;
    let result = classify_upload(state, &upload, trace).await?;

    // Only uploads that made it through the model are kept for display.
    let previews = state.previews.clone();
    let Upload {
        file_name,
        image_data,
    } = upload;
    let preview =
        tokio::task::spawn_blocking(move || previews.save(file_name.as_deref(), &image_data))
            .await
            .map_err(|e| ApiError::Preview(std::io::Error::other(e)))?
            .map_err(ApiError::Preview)?;

    Ok(render_report(&ReportView {
        project_name: &state.project_name,
        image_url: &preview.url,
        result: &result,
    }))
}
