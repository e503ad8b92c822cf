use crate::{
    error::ApiError,
    prediction::{classify_upload, read_upload, RequestTrace},
    server::SharedState,
};
use axum::{
    extract::{Multipart, State},
    Json,
};
use serde::Serialize;
use tracing::instrument;
use xray_prediction::{ModelService, PredictionResult, Probabilities, ValidationErrors};

const ROUTE: &str = "predict";

#[derive(Debug, Serialize)]
pub struct PredictionPayload {
    pub pred: String,
    pub probs: Probabilities,
}

#[derive(Debug, Serialize)]
pub struct PredictionResults {
    pub errors: Option<ValidationErrors>,
    pub version: String,
    pub predictions: PredictionPayload,
}

impl PredictionResults {
    fn new(result: PredictionResult, version: &str) -> Self {
        Self {
            errors: None,
            version: version.to_string(),
            predictions: PredictionPayload {
                pred: result.predicted_label,
                probs: result.probabilities,
            },
        }
    }
}

#[instrument(skip(state, multipart))]
pub async fn predict<M: ModelService>(
    State(state): State<SharedState<M>>,
    multipart: Multipart,
) -> Result<Json<PredictionResults>, ApiError> {
    let mut trace = RequestTrace::start(ROUTE, &state.metrics);

    let classified = match read_upload(multipart).await {
        Ok(upload) => classify_upload(&state, &upload, &mut trace).await,
        Err(err) => Err(err),
    };

    match classified {
        Ok(result) => {
            trace.responded("completed");
            Ok(Json(PredictionResults::new(result, &state.model_version)))
        }
        Err(err) => {
            trace.failed(&err);
            Err(err)
        }
    }
}
